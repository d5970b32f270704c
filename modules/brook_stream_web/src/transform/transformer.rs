// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, future::ready, future::Future, rc::Rc};

use brook_exceptions::{Exception, Result};

use super::controller::TransformStreamDefaultController;
use crate::{
    readable::stream::algorithms::{CancelAlgorithm, CancelFn},
    utils::promise::AlgorithmFuture,
};

pub(crate) type TransformerStartFn<I, O> =
    Box<dyn FnOnce(TransformStreamDefaultController<I, O>) -> AlgorithmFuture>;
pub(crate) type TransformFn<I, O> =
    Box<dyn FnMut(I, TransformStreamDefaultController<I, O>) -> AlgorithmFuture>;
pub(crate) type FlushFn<I, O> =
    Box<dyn FnOnce(TransformStreamDefaultController<I, O>) -> AlgorithmFuture>;

pub(crate) type TransformAlgorithm<I, O> = Rc<RefCell<TransformFn<I, O>>>;

pub(crate) enum FlushAlgorithm<I: 'static, O: 'static> {
    ReturnPromiseUndefined,
    Function(FlushFn<I, O>),
}

impl<I: 'static, O: 'static> FlushAlgorithm<I, O> {
    pub(crate) fn call(self, controller: TransformStreamDefaultController<I, O>) -> AlgorithmFuture {
        match self {
            Self::ReturnPromiseUndefined => Box::pin(ready(Ok(()))),
            Self::Function(f) => f(controller),
        }
    }
}

/// dictionary Transformer {
///   TransformerStartCallback start;
///   TransformerTransformCallback transform;
///   TransformerFlushCallback flush;
///   TransformerCancelCallback cancel;
/// };
///
/// Turns `I` chunks written to the writable side into `O` chunks enqueued on
/// the readable side. [`Transformer::default`] passes chunks through
/// unchanged.
pub struct Transformer<I: 'static, O: 'static = I> {
    start: Option<TransformerStartFn<I, O>>,
    transform: TransformFn<I, O>,
    flush: Option<FlushFn<I, O>>,
    cancel: Option<CancelFn>,
}

impl<T: 'static> Default for Transformer<T, T> {
    fn default() -> Self {
        Self::new(|chunk, controller: TransformStreamDefaultController<T, T>| {
            ready(controller.enqueue(chunk))
        })
    }
}

impl<I: 'static, O: 'static> Transformer<I, O> {
    /// `transform` is called once per written chunk; the next write waits for
    /// the returned future.
    pub fn new<F, Fut>(mut transform: F) -> Self
    where
        F: FnMut(I, TransformStreamDefaultController<I, O>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Self {
            start: None,
            transform: Box::new(move |chunk, controller| Box::pin(transform(chunk, controller))),
            flush: None,
            cancel: None,
        }
    }

    pub fn with_start<F, Fut>(mut self, start: F) -> Self
    where
        F: FnOnce(TransformStreamDefaultController<I, O>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.start = Some(Box::new(move |controller| Box::pin(start(controller))));
        self
    }

    /// Runs once the writable side closes, before the readable side closes.
    pub fn with_flush<F, Fut>(mut self, flush: F) -> Self
    where
        F: FnOnce(TransformStreamDefaultController<I, O>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.flush = Some(Box::new(move |controller| Box::pin(flush(controller))));
        self
    }

    /// Runs when the readable side is canceled or the writable side aborted.
    pub fn with_cancel<F, Fut>(mut self, cancel: F) -> Self
    where
        F: FnOnce(Exception) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.cancel = Some(Box::new(move |reason| Box::pin(cancel(reason))));
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Option<TransformerStartFn<I, O>>,
        TransformAlgorithm<I, O>,
        FlushAlgorithm<I, O>,
        CancelAlgorithm,
    ) {
        (
            self.start,
            Rc::new(RefCell::new(self.transform)),
            self.flush
                .map_or(FlushAlgorithm::ReturnPromiseUndefined, FlushAlgorithm::Function),
            self.cancel
                .map_or(CancelAlgorithm::ReturnPromiseUndefined, CancelAlgorithm::Function),
        )
    }
}
