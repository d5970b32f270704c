// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::RefCell,
    future::ready,
    rc::{Rc, Weak},
};

use brook_abort::{AbortController, AbortSignal};
use brook_exceptions::{Exception, Result};
use tracing::trace;

use super::{
    sink::{AbortAlgorithm, CloseAlgorithm, WriteAlgorithm},
    WritableStream, WritableStreamInner, WritableStreamState,
};
use crate::{
    queuing_strategy::SizeAlgorithm,
    readable::stream::algorithms::StartAlgorithm,
    utils::{
        promise::{upon_promise, AlgorithmFuture},
        queue::QueueWithSizes,
    },
};

/// An entry of the write queue. A chunk becomes `InFlight` once it has been
/// handed to the sink; it stays queued (and counted) until the write settles.
enum WriteRecord<T> {
    Chunk(T),
    InFlight,
    Close,
}

pub(crate) struct WritableStreamDefaultControllerInner<T: 'static> {
    stream: Weak<RefCell<WritableStreamInner<T>>>,
    abort_controller: AbortController,
    queue: QueueWithSizes<WriteRecord<T>>,
    started: bool,
    strategy_hwm: f64,
    strategy_size_algorithm: Option<SizeAlgorithm<T>>,
    write_algorithm: Option<WriteAlgorithm<T>>,
    close_algorithm: Option<CloseAlgorithm>,
    abort_algorithm: Option<AbortAlgorithm>,
}

/// The handle a sink uses to observe aborts and to error its
/// [`WritableStream`].
pub struct WritableStreamDefaultController<T: 'static> {
    inner: Rc<RefCell<WritableStreamDefaultControllerInner<T>>>,
}

impl<T: 'static> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> WritableStreamDefaultController<T> {
    /// SetUpWritableStreamDefaultController
    pub(crate) fn set_up(
        stream: &WritableStream<T>,
        start_algorithm: StartAlgorithm<Self>,
        write_algorithm: WriteAlgorithm<T>,
        close_algorithm: CloseAlgorithm,
        abort_algorithm: AbortAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) -> Result<Self> {
        let controller = Self {
            inner: Rc::new(RefCell::new(WritableStreamDefaultControllerInner {
                // Set controller.[[stream]] to stream.
                stream: Rc::downgrade(&stream.inner),
                // Set controller.[[abortController]] to a new AbortController.
                abort_controller: AbortController::new(),
                // Perform ! ResetQueue(controller).
                queue: QueueWithSizes::new(),
                // Set controller.[[started]] to false.
                started: false,
                strategy_hwm: high_water_mark,
                strategy_size_algorithm: Some(size_algorithm),
                write_algorithm: Some(write_algorithm),
                close_algorithm: Some(close_algorithm),
                abort_algorithm: Some(abort_algorithm),
            })),
        };

        // Set stream.[[controller]] to controller.
        stream.set_controller(controller.clone());

        // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
        // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
        stream.update_backpressure(controller.get_backpressure());

        // Let startResult be the result of performing startAlgorithm.
        // Let startPromise be a promise resolved with startResult.
        let start_promise = start_algorithm.call(controller.clone());

        upon_promise(start_promise, {
            let controller = controller.clone();
            move |result| {
                // Set controller.[[started]] to true.
                controller.inner.borrow_mut().started = true;
                match result {
                    // Upon fulfillment of startPromise, perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
                    Ok(()) => controller.advance_queue_if_needed(),
                    // Upon rejection of startPromise with reason r, perform ! WritableStreamDealWithRejection(stream, r).
                    Err(r) => {
                        if let Some(stream) = controller.stream() {
                            stream.deal_with_rejection(r);
                        }
                    },
                }
            }
        });

        Ok(controller)
    }

    fn stream(&self) -> Option<WritableStream<T>> {
        self.inner
            .borrow()
            .stream
            .upgrade()
            .map(|inner| WritableStream { inner })
    }

    /// Aborted as soon as the stream is aborted, while a write may still be in
    /// flight.
    pub fn signal(&self) -> AbortSignal {
        self.inner.borrow().abort_controller.signal()
    }

    pub fn error(&self, e: impl Into<Exception>) {
        // Let state be this.[[stream]].[[state]].
        // If state is not "writable", return.
        let Some(stream) = self.stream() else {
            return;
        };
        if stream.state() != WritableStreamState::Writable {
            return;
        }

        // Perform ! WritableStreamDefaultControllerError(this, e).
        self.error_internal(e.into())
    }

    pub(crate) fn abort_controller(&self) -> AbortController {
        self.inner.borrow().abort_controller.clone()
    }

    pub(crate) fn started(&self) -> bool {
        self.inner.borrow().started
    }

    /// [[AbortSteps]]
    pub(crate) fn abort_steps(&self, reason: Exception) -> AlgorithmFuture {
        // Let result be the result of performing this.[[abortAlgorithm]], passing reason.
        let abort_algorithm = self.inner.borrow_mut().abort_algorithm.take();
        let result = match abort_algorithm {
            Some(abort_algorithm) => abort_algorithm.call(reason),
            None => Box::pin(ready(Ok(()))),
        };

        // Perform ! WritableStreamDefaultControllerClearAlgorithms(this).
        self.clear_algorithms();

        result
    }

    /// [[ErrorSteps]]
    pub(crate) fn error_steps(&self) {
        // Perform ! ResetQueue(this).
        let _queue = std::mem::take(&mut self.inner.borrow_mut().queue);
    }

    /// WritableStreamDefaultControllerClose
    pub(crate) fn close_internal(&self) {
        // Perform ! EnqueueValueWithSize(controller, close sentinel, 0).
        let enqueued = self
            .inner
            .borrow_mut()
            .queue
            .enqueue_value_with_size(WriteRecord::Close, 0.0);
        debug_assert!(enqueued.is_ok());

        // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
        self.advance_queue_if_needed();
    }

    /// WritableStreamDefaultControllerGetChunkSize
    pub(crate) fn get_chunk_size(&self, chunk: &T) -> f64 {
        // If controller.[[strategySizeAlgorithm]] is undefined, return 1.
        let size_algorithm = self.inner.borrow().strategy_size_algorithm.clone();
        let Some(size_algorithm) = size_algorithm else {
            return 1.0;
        };

        // Let returnValue be the result of performing controller.[[strategySizeAlgorithm]], passing in chunk, and interpreting the result as a completion record.
        match size_algorithm.call(chunk) {
            Ok(chunk_size) => chunk_size,
            // If returnValue is an abrupt completion,
            Err(e) => {
                // Perform ! WritableStreamDefaultControllerErrorIfNeeded(controller, returnValue.[[Value]]).
                self.error_if_needed(e);
                // Return 1.
                1.0
            },
        }
    }

    /// WritableStreamDefaultControllerGetDesiredSize
    pub(crate) fn get_desired_size(&self) -> f64 {
        let inner = self.inner.borrow();
        inner.strategy_hwm - inner.queue.total_size()
    }

    /// WritableStreamDefaultControllerWrite
    pub(crate) fn write(&self, chunk: T, chunk_size: f64) {
        // Let enqueueResult be EnqueueValueWithSize(controller, chunk, chunkSize).
        let enqueue_result = self
            .inner
            .borrow_mut()
            .queue
            .enqueue_value_with_size(WriteRecord::Chunk(chunk), chunk_size);

        // If enqueueResult is an abrupt completion,
        if let Err(e) = enqueue_result {
            // Perform ! WritableStreamDefaultControllerErrorIfNeeded(controller, enqueueResult.[[Value]]).
            self.error_if_needed(e);
            return;
        }

        let Some(stream) = self.stream() else {
            return;
        };

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and stream.[[state]] is "writable",
        if !stream.close_queued_or_in_flight() && stream.state() == WritableStreamState::Writable {
            // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
            // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
            stream.update_backpressure(self.get_backpressure());
        }

        // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
        self.advance_queue_if_needed();
    }

    /// WritableStreamDefaultControllerAdvanceQueueIfNeeded
    fn advance_queue_if_needed(&self) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If controller.[[started]] is false, return.
        if !self.started() {
            return;
        }

        // If stream.[[inFlightWriteRequest]] is not undefined, return.
        if stream.has_in_flight_write_request() {
            return;
        }

        // Let state be stream.[[state]].
        match stream.state() {
            // If state is "erroring",
            WritableStreamState::Erroring(_) => {
                // Perform ! WritableStreamFinishErroring(stream).
                stream.finish_erroring();
                return;
            },
            WritableStreamState::Writable => {},
            WritableStreamState::Closed | WritableStreamState::Errored(_) => return,
        }

        // If controller.[[queue]] is empty, return.
        // Let value be ! PeekQueueValue(controller).
        let next = {
            let mut inner = self.inner.borrow_mut();
            match inner.queue.peek_queue_value_mut() {
                None => return,
                Some(WriteRecord::Close) => None,
                Some(record) => match std::mem::replace(record, WriteRecord::InFlight) {
                    WriteRecord::Chunk(chunk) => Some(chunk),
                    _ => return,
                },
            }
        };

        match next {
            // If value is the close sentinel, perform ! WritableStreamDefaultControllerProcessClose(controller).
            None => self.process_close(&stream),
            // Otherwise, perform ! WritableStreamDefaultControllerProcessWrite(controller, value).
            Some(chunk) => self.process_write(&stream, chunk),
        }
    }

    /// WritableStreamDefaultControllerErrorIfNeeded
    pub(crate) fn error_if_needed(&self, e: Exception) {
        // If controller.[[stream]].[[state]] is "writable", perform ! WritableStreamDefaultControllerError(controller, error).
        if self
            .stream()
            .is_some_and(|stream| stream.state() == WritableStreamState::Writable)
        {
            self.error_internal(e);
        }
    }

    /// WritableStreamDefaultControllerProcessClose
    fn process_close(&self, stream: &WritableStream<T>) {
        // Perform ! WritableStreamMarkCloseRequestInFlight(stream).
        stream.mark_close_request_in_flight();

        // Perform ! DequeueValue(controller).
        // Let sinkClosePromise be the result of performing controller.[[closeAlgorithm]].
        let close_algorithm = {
            let mut inner = self.inner.borrow_mut();
            inner.queue.dequeue_value();
            inner.close_algorithm.take()
        };

        // Perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
        self.clear_algorithms();

        let sink_close_promise = match close_algorithm {
            Some(close_algorithm) => close_algorithm.call(),
            None => Box::pin(ready(Ok(()))),
        };

        let stream = stream.clone();
        upon_promise(sink_close_promise, move |result| match result {
            // Upon fulfillment of sinkClosePromise, perform ! WritableStreamFinishInFlightClose(stream).
            Ok(()) => stream.finish_in_flight_close(),
            // Upon rejection of sinkClosePromise with reason reason, perform ! WritableStreamFinishInFlightCloseWithError(stream, reason).
            Err(reason) => {
                trace!("writable stream close rejected: {}", reason);
                stream.finish_in_flight_close_with_error(reason)
            },
        });
    }

    /// WritableStreamDefaultControllerProcessWrite
    fn process_write(&self, stream: &WritableStream<T>, chunk: T) {
        // Perform ! WritableStreamMarkFirstWriteRequestInFlight(stream).
        stream.mark_first_write_request_in_flight();

        // Let sinkWritePromise be the result of performing controller.[[writeAlgorithm]], passing in chunk.
        let write_algorithm = self.inner.borrow().write_algorithm.clone();
        let sink_write_promise = match write_algorithm {
            Some(write_algorithm) => write_algorithm.call(chunk, self.clone()),
            None => Box::pin(ready(Ok(()))),
        };

        let controller = self.clone();
        let stream = stream.clone();
        upon_promise(sink_write_promise, move |result| match result {
            // Upon fulfillment of sinkWritePromise,
            Ok(()) => {
                // Perform ! WritableStreamFinishInFlightWrite(stream).
                stream.finish_in_flight_write();

                // Perform ! DequeueValue(controller).
                {
                    let mut inner = controller.inner.borrow_mut();
                    if !inner.queue.is_empty() {
                        inner.queue.dequeue_value();
                    }
                }

                // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and state is "writable",
                if !stream.close_queued_or_in_flight()
                    && stream.state() == WritableStreamState::Writable
                {
                    // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
                    // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
                    stream.update_backpressure(controller.get_backpressure());
                }

                // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
                controller.advance_queue_if_needed();
            },
            // Upon rejection of sinkWritePromise with reason,
            Err(reason) => {
                trace!("writable stream write rejected: {}", reason);
                // If stream.[[state]] is "writable", perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
                if stream.state() == WritableStreamState::Writable {
                    controller.clear_algorithms();
                }
                // Perform ! WritableStreamFinishInFlightWriteWithError(stream, reason).
                stream.finish_in_flight_write_with_error(reason);
            },
        });
    }

    /// WritableStreamDefaultControllerGetBackpressure
    fn get_backpressure(&self) -> bool {
        // Let desiredSize be ! WritableStreamDefaultControllerGetDesiredSize(controller).
        // Return true if desiredSize ≤ 0, or false otherwise.
        self.get_desired_size() <= 0.0
    }

    /// WritableStreamDefaultControllerError
    pub(crate) fn error_internal(&self, e: Exception) {
        // Perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
        self.clear_algorithms();
        // Perform ! WritableStreamStartErroring(stream, error).
        if let Some(stream) = self.stream() {
            stream.start_erroring(e);
        }
    }

    /// WritableStreamDefaultControllerClearAlgorithms
    fn clear_algorithms(&self) {
        let _algorithms = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.write_algorithm.take(),
                inner.close_algorithm.take(),
                inner.abort_algorithm.take(),
                inner.strategy_size_algorithm.take(),
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;
    use brook_utils::ctx;

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy, utils::promise::ResolveablePromise,
        writable::UnderlyingSink,
    };

    #[tokio::test]
    async fn writes_reach_sink_one_at_a_time() {
        test_async_with(|| {
            Box::pin(async move {
                let written = Rc::new(RefCell::new(Vec::new()));
                let gates: Rc<RefCell<Vec<ResolveablePromise<()>>>> = Rc::default();
                let stream = WritableStream::new(
                    UnderlyingSink::new().with_write({
                        let written = written.clone();
                        let gates = gates.clone();
                        move |chunk: u32, _| {
                            written.borrow_mut().push(chunk);
                            let gate = ResolveablePromise::new();
                            gates.borrow_mut().push(gate.clone());
                            gate.promise()
                        }
                    }),
                    QueuingStrategy::new().with_high_water_mark(2.0),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                ctx::settle().await;

                let first = writer.write(1);
                let second = writer.write(2);
                ctx::settle().await;
                assert_eq!(*written.borrow(), vec![1]);
                assert_eq!(writer.desired_size().unwrap(), Some(0.0));

                let gate = gates.borrow()[0].clone();
                gate.resolve_undefined();
                first.await.unwrap();
                ctx::settle().await;
                assert_eq!(*written.borrow(), vec![1, 2]);
                assert_eq!(writer.desired_size().unwrap(), Some(1.0));

                let gate = gates.borrow()[1].clone();
                gate.resolve_undefined();
                second.await.unwrap();
                assert_eq!(writer.desired_size().unwrap(), Some(2.0));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn failing_size_errors_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::new(
                    UnderlyingSink::new(),
                    QueuingStrategy::new().with_size(|_: &u32| Err(Exception::message("no size"))),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                assert_eq!(
                    writer.write(7).await.unwrap_err(),
                    Exception::message("no size")
                );
                assert_eq!(
                    stream.stored_error(),
                    Some(Exception::message("no size"))
                );
                assert_eq!(writer.desired_size().unwrap(), None);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn rejected_start_errors_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::<u32>::new(
                    UnderlyingSink::new().with_start(|_| async { Err(Exception::message("no start")) }),
                    QueuingStrategy::new(),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                assert_eq!(
                    writer.closed().await.unwrap_err(),
                    Exception::message("no start")
                );
                assert_eq!(
                    writer.ready().await.unwrap_err(),
                    Exception::message("no start")
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn controller_error_rejects_pending_writes() {
        test_async_with(|| {
            Box::pin(async move {
                let captured = Rc::new(RefCell::new(None));
                let stream = WritableStream::new(
                    UnderlyingSink::new().with_start({
                        let captured = captured.clone();
                        move |controller| {
                            *captured.borrow_mut() = Some(controller);
                            async { Ok(()) }
                        }
                    }),
                    QueuingStrategy::new(),
                )
                .unwrap();
                let controller: WritableStreamDefaultController<u32> =
                    captured.borrow_mut().take().unwrap();
                let writer = stream.get_writer().unwrap();

                // not started yet, so the write stays queued
                let write = writer.write(1);
                controller.error(Exception::message("sink gone"));
                assert_eq!(
                    write.await.unwrap_err(),
                    Exception::message("sink gone")
                );
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Exception::message("sink gone"))
                );
            })
        })
        .await;
    }
}
