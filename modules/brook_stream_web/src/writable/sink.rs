// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, future::ready, future::Future, rc::Rc};

use brook_exceptions::{Exception, Result};

use super::default_controller::WritableStreamDefaultController;
use crate::{
    readable::stream::algorithms::{CancelAlgorithm, CancelFn, StartAlgorithm, StartFn},
    utils::promise::AlgorithmFuture,
};

pub(crate) type WriteFn<T> = Box<dyn FnMut(T, WritableStreamDefaultController<T>) -> AlgorithmFuture>;
pub(crate) type CloseFn = Box<dyn FnOnce() -> AlgorithmFuture>;

/// The abort algorithm has the same shape as a readable cancel.
pub(crate) type AbortAlgorithm = CancelAlgorithm;

pub(crate) enum WriteAlgorithm<T: 'static> {
    ReturnPromiseUndefined,
    Function(Rc<RefCell<WriteFn<T>>>),
}

impl<T: 'static> Clone for WriteAlgorithm<T> {
    fn clone(&self) -> Self {
        match self {
            Self::ReturnPromiseUndefined => Self::ReturnPromiseUndefined,
            Self::Function(f) => Self::Function(f.clone()),
        }
    }
}

impl<T: 'static> WriteAlgorithm<T> {
    pub(crate) fn from_fn(f: WriteFn<T>) -> Self {
        Self::Function(Rc::new(RefCell::new(f)))
    }

    pub(crate) fn call(
        &self,
        chunk: T,
        controller: WritableStreamDefaultController<T>,
    ) -> AlgorithmFuture {
        match self {
            Self::ReturnPromiseUndefined => Box::pin(ready(Ok(()))),
            Self::Function(f) => (f.borrow_mut())(chunk, controller),
        }
    }
}

pub(crate) enum CloseAlgorithm {
    ReturnPromiseUndefined,
    Function(CloseFn),
}

impl CloseAlgorithm {
    pub(crate) fn call(self) -> AlgorithmFuture {
        match self {
            Self::ReturnPromiseUndefined => Box::pin(ready(Ok(()))),
            Self::Function(f) => f(),
        }
    }
}

/// The callbacks that consume data written to a
/// [`WritableStream`](super::WritableStream).
///
/// Writes are handed to `write` one at a time; the next write only starts
/// once the previous future resolved.
pub struct UnderlyingSink<T: 'static> {
    start: Option<StartFn<WritableStreamDefaultController<T>>>,
    write: Option<WriteFn<T>>,
    close: Option<CloseFn>,
    abort: Option<CancelFn>,
}

impl<T: 'static> Default for UnderlyingSink<T> {
    fn default() -> Self {
        Self {
            start: None,
            write: None,
            close: None,
            abort: None,
        }
    }
}

impl<T: 'static> UnderlyingSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start<F, Fut>(mut self, start: F) -> Self
    where
        F: FnOnce(WritableStreamDefaultController<T>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.start = Some(Box::new(move |controller| Box::pin(start(controller))));
        self
    }

    pub fn with_write<F, Fut>(mut self, mut write: F) -> Self
    where
        F: FnMut(T, WritableStreamDefaultController<T>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.write = Some(Box::new(move |chunk, controller| {
            Box::pin(write(chunk, controller))
        }));
        self
    }

    pub fn with_close<F, Fut>(mut self, close: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.close = Some(Box::new(move || Box::pin(close())));
        self
    }

    /// Runs when the stream is aborted, after any in-flight write settled.
    pub fn with_abort<F, Fut>(mut self, abort: F) -> Self
    where
        F: FnOnce(Exception) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.abort = Some(Box::new(move |reason| Box::pin(abort(reason))));
        self
    }

    pub(crate) fn into_algorithms(
        self,
    ) -> (
        StartAlgorithm<WritableStreamDefaultController<T>>,
        WriteAlgorithm<T>,
        CloseAlgorithm,
        AbortAlgorithm,
    ) {
        (
            self.start
                .map_or(StartAlgorithm::ReturnUndefined, StartAlgorithm::Function),
            self.write
                .map_or(WriteAlgorithm::ReturnPromiseUndefined, WriteAlgorithm::from_fn),
            self.close
                .map_or(CloseAlgorithm::ReturnPromiseUndefined, CloseAlgorithm::Function),
            self.abort
                .map_or(CancelAlgorithm::ReturnPromiseUndefined, CancelAlgorithm::Function),
        )
    }
}
