// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::RefCell,
    future::ready,
    rc::{Rc, Weak},
};

use brook_exceptions::{Exception, Result};

use super::{
    stream::{TransformStream, TransformStreamInner},
    transformer::{FlushAlgorithm, TransformAlgorithm},
};
use crate::{
    readable::{stream::algorithms::CancelAlgorithm, ReadableStreamState},
    utils::promise::{AlgorithmFuture, Promise, ResolveablePromise},
};

pub(crate) struct TransformStreamDefaultControllerInner<I: 'static, O: 'static> {
    stream: Weak<RefCell<TransformStreamInner<I, O>>>,
    transform_algorithm: Option<TransformAlgorithm<I, O>>,
    flush_algorithm: Option<FlushAlgorithm<I, O>>,
    cancel_algorithm: Option<CancelAlgorithm>,
    finish_promise: Option<ResolveablePromise<()>>,
}

/// Handed to the [`Transformer`](super::Transformer) callbacks to feed and
/// steer the readable side of a [`TransformStream`].
pub struct TransformStreamDefaultController<I: 'static, O: 'static = I> {
    inner: Rc<RefCell<TransformStreamDefaultControllerInner<I, O>>>,
}

impl<I: 'static, O: 'static> Clone for TransformStreamDefaultController<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: 'static, O: 'static> TransformStreamDefaultController<I, O> {
    /// SetUpTransformStreamDefaultController
    pub(super) fn set_up(
        stream: &TransformStream<I, O>,
        transform_algorithm: TransformAlgorithm<I, O>,
        flush_algorithm: FlushAlgorithm<I, O>,
        cancel_algorithm: CancelAlgorithm,
    ) -> Self {
        let controller = Self {
            inner: Rc::new(RefCell::new(TransformStreamDefaultControllerInner {
                // Set controller.[[stream]] to stream.
                stream: Rc::downgrade(&stream.inner),
                transform_algorithm: Some(transform_algorithm),
                flush_algorithm: Some(flush_algorithm),
                cancel_algorithm: Some(cancel_algorithm),
                finish_promise: None,
            })),
        };

        // Set stream.[[controller]] to controller.
        stream.inner.borrow_mut().controller = Some(controller.clone());
        controller
    }

    fn stream(&self) -> Result<TransformStream<I, O>> {
        self.inner
            .borrow()
            .stream
            .upgrade()
            .map(|inner| TransformStream { inner })
            .ok_or_else(|| Exception::throw_type("TransformStream is gone"))
    }

    /// How much the readable side wants buffered; `None` once it errored.
    pub fn desired_size(&self) -> Option<f64> {
        let stream = self.stream().ok()?;
        // Let readableController be this.[[stream]].[[readable]].[[controller]].
        // Return ! ReadableStreamDefaultControllerGetDesiredSize(readableController).
        stream.readable_controller().desired_size()
    }

    /// TransformStreamDefaultControllerEnqueue
    pub fn enqueue(&self, chunk: O) -> Result<()> {
        let stream = self.stream()?;
        // Let readableController be stream.[[readable]].[[controller]].
        let readable_controller = stream.readable_controller();

        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(readableController) is false, throw a TypeError exception.
        if !readable_controller.can_close_or_enqueue() {
            return Err(Exception::throw_type(
                "Readable side is not in a state that permits enqueue",
            ));
        }

        // Let enqueueResult be ReadableStreamDefaultControllerEnqueue(readableController, chunk).
        if let Err(e) = readable_controller.enqueue_internal(chunk) {
            // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, enqueueResult.[[Value]]).
            stream.error_writable_and_unblock_write(e.clone());
            // Throw stream.[[readable]].[[storedError]].
            return Err(match stream.readable().state() {
                ReadableStreamState::Errored(stored_error) => stored_error,
                _ => e,
            });
        }

        // Let backpressure be ! ReadableStreamDefaultControllerHasBackpressure(readableController).
        // If backpressure is not stream.[[backpressure]], perform ! TransformStreamSetBackpressure(stream, true).
        if readable_controller.has_backpressure() && stream.backpressure() != Some(true) {
            stream.set_backpressure(true);
        }
        Ok(())
    }

    /// Errors both sides of the stream.
    pub fn error(&self, e: impl Into<Exception>) {
        if let Ok(stream) = self.stream() {
            stream.error(e.into());
        }
    }

    /// Closes the readable side and errors the writable side.
    pub fn terminate(&self) {
        let Ok(stream) = self.stream() else {
            return;
        };
        // Perform ! ReadableStreamDefaultControllerClose(readableController).
        stream.readable_controller().close_internal();

        // Let error be a TypeError exception indicating that the stream has been terminated.
        // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, error).
        stream.error_writable_and_unblock_write(Exception::throw_type("TransformStream terminated"));
    }

    /// TransformStreamDefaultControllerPerformTransform, minus the reaction
    /// which the stream adds.
    pub(super) fn call_transform(&self, chunk: I) -> AlgorithmFuture {
        let transform_algorithm = self.inner.borrow().transform_algorithm.clone();
        let Some(transform_algorithm) = transform_algorithm else {
            return Box::pin(ready(Err(Exception::throw_type(
                "TransformStream no longer accepts chunks",
            ))));
        };
        let transform_promise = (transform_algorithm.borrow_mut())(chunk, self.clone());
        transform_promise
    }

    pub(super) fn call_flush(&self) -> AlgorithmFuture {
        let flush_algorithm = self.inner.borrow_mut().flush_algorithm.take();
        flush_algorithm
            .unwrap_or(FlushAlgorithm::ReturnPromiseUndefined)
            .call(self.clone())
    }

    pub(super) fn call_cancel(&self, reason: Exception) -> AlgorithmFuture {
        let cancel_algorithm = self.inner.borrow_mut().cancel_algorithm.take();
        cancel_algorithm
            .unwrap_or(CancelAlgorithm::ReturnPromiseUndefined)
            .call(reason)
    }

    pub(super) fn finish_promise(&self) -> Option<Promise<()>> {
        self.inner
            .borrow()
            .finish_promise
            .as_ref()
            .map(ResolveablePromise::promise)
    }

    /// Installs a new finish promise and returns its resolver.
    pub(super) fn start_finishing(&self) -> ResolveablePromise<()> {
        let finish_promise = ResolveablePromise::new();
        self.inner.borrow_mut().finish_promise = Some(finish_promise.clone());
        finish_promise
    }

    /// TransformStreamDefaultControllerClearAlgorithms
    pub(super) fn clear_algorithms(&self) {
        // Dropped after the borrow ends; captured state may refer back here.
        let _algorithms = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.transform_algorithm.take(),
                inner.flush_algorithm.take(),
                inner.cancel_algorithm.take(),
            )
        };
    }
}
