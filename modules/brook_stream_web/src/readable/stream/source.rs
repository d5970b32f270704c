// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;

use brook_exceptions::{Exception, Result};

use super::algorithms::{CancelAlgorithm, CancelFn, PullAlgorithm, PullFn, StartAlgorithm, StartFn};
use crate::readable::{
    byte_controller::ReadableByteStreamController,
    default_controller::ReadableStreamDefaultController,
};

/// The callbacks that produce data for a [`ReadableStream`](super::ReadableStream).
///
/// Each callback runs its synchronous body immediately, so chunks enqueued
/// before the returned future is first polled are visible right away.
pub struct UnderlyingSource<T: 'static> {
    start: Option<StartFn<ReadableStreamDefaultController<T>>>,
    pull: Option<PullFn<ReadableStreamDefaultController<T>>>,
    cancel: Option<CancelFn>,
}

impl<T: 'static> Default for UnderlyingSource<T> {
    fn default() -> Self {
        Self {
            start: None,
            pull: None,
            cancel: None,
        }
    }
}

impl<T: 'static> UnderlyingSource<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start<F, Fut>(mut self, start: F) -> Self
    where
        F: FnOnce(ReadableStreamDefaultController<T>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.start = Some(Box::new(move |controller| Box::pin(start(controller))));
        self
    }

    pub fn with_pull<F, Fut>(mut self, mut pull: F) -> Self
    where
        F: FnMut(ReadableStreamDefaultController<T>) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.pull = Some(Box::new(move |controller| Box::pin(pull(controller))));
        self
    }

    pub fn with_cancel<F, Fut>(mut self, cancel: F) -> Self
    where
        F: FnOnce(Exception) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.cancel = Some(Box::new(move |reason| Box::pin(cancel(reason))));
        self
    }

    pub(crate) fn into_algorithms(
        self,
    ) -> (
        StartAlgorithm<ReadableStreamDefaultController<T>>,
        PullAlgorithm<ReadableStreamDefaultController<T>>,
        CancelAlgorithm,
    ) {
        into_algorithms(self.start, self.pull, self.cancel)
    }
}

/// The callbacks of a byte stream source, plus the automatic allocation size
/// that lets default readers drive BYOB style pulls.
#[derive(Default)]
pub struct UnderlyingByteSource {
    start: Option<StartFn<ReadableByteStreamController>>,
    pull: Option<PullFn<ReadableByteStreamController>>,
    cancel: Option<CancelFn>,
    pub(crate) auto_allocate_chunk_size: Option<usize>,
}

impl UnderlyingByteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start<F, Fut>(mut self, start: F) -> Self
    where
        F: FnOnce(ReadableByteStreamController) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.start = Some(Box::new(move |controller| Box::pin(start(controller))));
        self
    }

    pub fn with_pull<F, Fut>(mut self, mut pull: F) -> Self
    where
        F: FnMut(ReadableByteStreamController) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.pull = Some(Box::new(move |controller| Box::pin(pull(controller))));
        self
    }

    pub fn with_cancel<F, Fut>(mut self, cancel: F) -> Self
    where
        F: FnOnce(Exception) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.cancel = Some(Box::new(move |reason| Box::pin(cancel(reason))));
        self
    }

    pub fn with_auto_allocate_chunk_size(mut self, size: usize) -> Self {
        self.auto_allocate_chunk_size = Some(size);
        self
    }

    pub(crate) fn into_algorithms(
        self,
    ) -> (
        StartAlgorithm<ReadableByteStreamController>,
        PullAlgorithm<ReadableByteStreamController>,
        CancelAlgorithm,
    ) {
        into_algorithms(self.start, self.pull, self.cancel)
    }
}

fn into_algorithms<C>(
    start: Option<StartFn<C>>,
    pull: Option<PullFn<C>>,
    cancel: Option<CancelFn>,
) -> (StartAlgorithm<C>, PullAlgorithm<C>, CancelAlgorithm) {
    (
        start.map_or(StartAlgorithm::ReturnUndefined, StartAlgorithm::Function),
        pull.map_or(PullAlgorithm::ReturnPromiseUndefined, PullAlgorithm::from_fn),
        cancel.map_or(CancelAlgorithm::ReturnPromiseUndefined, CancelAlgorithm::Function),
    )
}
