// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use brook_exceptions::{Exception, Result};
use tracing::trace;

use super::{
    controller::ReadableStreamControllerSteps,
    reader::ReadRequest,
    stream::{
        algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm},
        source::UnderlyingSource,
        ReadableStreamInner,
    },
    ReadableStream, ReadableStreamState,
};
use crate::{
    queuing_strategy::SizeAlgorithm,
    utils::{
        promise::{upon_promise, AlgorithmFuture},
        queue::QueueWithSizes,
    },
};

pub(crate) struct ReadableStreamDefaultControllerInner<T: 'static> {
    stream: Weak<RefCell<ReadableStreamInner<T>>>,
    queue: QueueWithSizes<T>,
    started: bool,
    close_requested: bool,
    pull_again: bool,
    pulling: bool,
    strategy_hwm: f64,
    strategy_size_algorithm: Option<SizeAlgorithm<T>>,
    pull_algorithm: Option<PullAlgorithm<ReadableStreamDefaultController<T>>>,
    cancel_algorithm: Option<CancelAlgorithm>,
}

/// The handle a source uses to feed its [`ReadableStream`].
pub struct ReadableStreamDefaultController<T: 'static> {
    inner: Rc<RefCell<ReadableStreamDefaultControllerInner<T>>>,
}

impl<T: 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn set_up_from_underlying_source(
        stream: &ReadableStream<T>,
        source: UnderlyingSource<T>,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) -> Result<Self> {
        let (start_algorithm, pull_algorithm, cancel_algorithm) = source.into_algorithms();

        // Perform ? SetUpReadableStreamDefaultController(stream, controller, startAlgorithm, pullAlgorithm, cancelAlgorithm, highWaterMark, sizeAlgorithm).
        Self::set_up(
            stream,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            size_algorithm,
        )
    }

    /// SetUpReadableStreamDefaultController
    pub(crate) fn set_up(
        stream: &ReadableStream<T>,
        start_algorithm: StartAlgorithm<Self>,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) -> Result<Self> {
        let controller = Self {
            inner: Rc::new(RefCell::new(ReadableStreamDefaultControllerInner {
                // Set controller.[[stream]] to stream.
                stream: Rc::downgrade(&stream.inner),
                // Perform ! ResetQueue(controller).
                queue: QueueWithSizes::new(),
                // Set controller.[[started]], controller.[[closeRequested]], controller.[[pullAgain]], and controller.[[pulling]] to false.
                started: false,
                close_requested: false,
                pull_again: false,
                pulling: false,
                // Set controller.[[strategySizeAlgorithm]] to sizeAlgorithm and controller.[[strategyHWM]] to highWaterMark.
                strategy_hwm: high_water_mark,
                strategy_size_algorithm: Some(size_algorithm),
                pull_algorithm: Some(pull_algorithm),
                cancel_algorithm: Some(cancel_algorithm),
            })),
        };

        // Set stream.[[controller]] to controller.
        stream.inner.borrow_mut().controller = Some(Rc::new(controller.clone()));

        // Let startResult be the result of performing startAlgorithm.
        // Let startPromise be a promise resolved with startResult.
        let start_promise = start_algorithm.call(controller.clone());

        upon_promise(start_promise, {
            let controller = controller.clone();
            move |result| match result {
                // Upon fulfillment of startPromise,
                Ok(()) => {
                    // Set controller.[[started]] to true.
                    controller.inner.borrow_mut().started = true;
                    // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
                    controller.call_pull_if_needed();
                },
                // Upon rejection of startPromise with reason r,
                Err(r) => controller.error_internal(r),
            }
        });

        Ok(controller)
    }

    fn stream(&self) -> Option<ReadableStream<T>> {
        self.inner
            .borrow()
            .stream
            .upgrade()
            .map(|inner| ReadableStream { inner })
    }

    /// How much more the stream wants buffered: `None` once errored, `0`
    /// once closed.
    pub fn desired_size(&self) -> Option<f64> {
        let stream = self.stream()?;
        match stream.state() {
            ReadableStreamState::Errored(_) => None,
            ReadableStreamState::Closed => Some(0.0),
            ReadableStreamState::Readable => {
                let inner = self.inner.borrow();
                Some(inner.strategy_hwm - inner.queue.total_size())
            },
        }
    }

    pub fn enqueue(&self, chunk: T) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(this) is false, throw a TypeError exception.
        if !self.can_close_or_enqueue() {
            return Err(Exception::throw_type(
                "The stream is not in a state that permits enqueue",
            ));
        }

        // Perform ? ReadableStreamDefaultControllerEnqueue(this, chunk).
        self.enqueue_internal(chunk)
    }

    /// Closes the stream once every queued chunk has been read.
    pub fn close(&self) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(this) is false, throw a TypeError exception.
        if !self.can_close_or_enqueue() {
            return Err(Exception::throw_type(
                "The stream is not in a state that permits close",
            ));
        }

        self.close_internal();
        Ok(())
    }

    pub fn error(&self, e: impl Into<Exception>) {
        self.error_internal(e.into())
    }

    /// ReadableStreamDefaultControllerEnqueue
    pub(crate) fn enqueue_internal(&self, chunk: T) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return.
        if !self.can_close_or_enqueue() {
            return Ok(());
        }
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If ! IsReadableStreamLocked(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, perform ! ReadableStreamFulfillReadRequest(stream, chunk, false).
        if stream.is_locked() && stream.get_num_read_requests() > 0 {
            stream.fulfill_read_request(chunk, false);
        } else {
            let size_algorithm = self.inner.borrow().strategy_size_algorithm.clone();
            let Some(size_algorithm) = size_algorithm else {
                return Ok(());
            };

            // Let result be the result of performing controller.[[strategySizeAlgorithm]], passing in chunk, and interpreting the result as a completion record.
            let chunk_size = match size_algorithm.call(&chunk) {
                Ok(chunk_size) => chunk_size,
                // If result is an abrupt completion, perform ! ReadableStreamDefaultControllerError(controller, result.[[Value]]) and return result.
                Err(e) => {
                    self.error_internal(e.clone());
                    return Err(e);
                },
            };

            // Let enqueueResult be EnqueueValueWithSize(controller, chunk, chunkSize).
            let enqueue_result = self
                .inner
                .borrow_mut()
                .queue
                .enqueue_value_with_size(chunk, chunk_size);
            if let Err(e) = enqueue_result {
                self.error_internal(e.clone());
                return Err(e);
            }
        }

        // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
        self.call_pull_if_needed();
        Ok(())
    }

    /// ReadableStreamDefaultControllerClose
    pub(crate) fn close_internal(&self) {
        if !self.can_close_or_enqueue() {
            return;
        }

        // Set controller.[[closeRequested]] to true.
        let queue_empty = {
            let mut inner = self.inner.borrow_mut();
            inner.close_requested = true;
            inner.queue.is_empty()
        };

        // If controller.[[queue]] is empty,
        if queue_empty {
            // Perform ! ReadableStreamDefaultControllerClearAlgorithms(controller).
            self.clear_algorithms();
            // Perform ! ReadableStreamClose(stream).
            if let Some(stream) = self.stream() {
                stream.readable_stream_close();
            }
        }
    }

    /// ReadableStreamDefaultControllerError
    pub(crate) fn error_internal(&self, e: Exception) {
        let Some(stream) = self.stream() else {
            return;
        };

        // If stream.[[state]] is not "readable", return.
        if !stream.is_readable() {
            return;
        }

        // Perform ! ResetQueue(controller).
        self.inner.borrow_mut().queue.reset_queue();

        // Perform ! ReadableStreamDefaultControllerClearAlgorithms(controller).
        self.clear_algorithms();

        // Perform ! ReadableStreamError(stream, e).
        stream.readable_stream_error(e);
    }

    /// ReadableStreamDefaultControllerCallPullIfNeeded
    pub(crate) fn call_pull_if_needed(&self) {
        // Let shouldPull be ! ReadableStreamDefaultControllerShouldCallPull(controller).
        if !self.should_call_pull() {
            return;
        }

        let pull_algorithm = {
            let mut inner = self.inner.borrow_mut();
            // If controller.[[pulling]] is true,
            if inner.pulling {
                // Set controller.[[pullAgain]] to true.
                inner.pull_again = true;
                return;
            }
            // Set controller.[[pulling]] to true.
            inner.pulling = true;
            inner.pull_algorithm.clone()
        };
        let Some(pull_algorithm) = pull_algorithm else {
            self.inner.borrow_mut().pulling = false;
            return;
        };

        // Let pullPromise be the result of performing controller.[[pullAlgorithm]].
        let pull_promise = pull_algorithm.call(self.clone());

        let controller = self.clone();
        upon_promise(pull_promise, move |result| match result {
            // Upon fulfillment of pullPromise,
            Ok(()) => {
                let pull_again = {
                    let mut inner = controller.inner.borrow_mut();
                    // Set controller.[[pulling]] to false.
                    inner.pulling = false;
                    std::mem::take(&mut inner.pull_again)
                };
                // If controller.[[pullAgain]] is true, set it to false and perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
                if pull_again {
                    controller.call_pull_if_needed();
                }
            },
            // Upon rejection of pullPromise with reason e,
            Err(e) => {
                trace!("readable stream pull rejected: {}", e);
                controller.error_internal(e);
            },
        });
    }

    /// ReadableStreamDefaultControllerShouldCallPull
    fn should_call_pull(&self) -> bool {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return false.
        if !self.can_close_or_enqueue() {
            return false;
        }

        // If controller.[[started]] is false, return false.
        if !self.inner.borrow().started {
            return false;
        }

        let Some(stream) = self.stream() else {
            return false;
        };

        // If ! IsReadableStreamLocked(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, return true.
        if stream.is_locked() && stream.get_num_read_requests() > 0 {
            return true;
        }

        // Let desiredSize be ! ReadableStreamDefaultControllerGetDesiredSize(controller).
        // If desiredSize > 0, return true.
        self.desired_size()
            .is_some_and(|desired_size| desired_size > 0.0)
    }

    /// ReadableStreamDefaultControllerCanCloseOrEnqueue
    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        if self.inner.borrow().close_requested {
            return false;
        }
        self.stream().is_some_and(|stream| stream.is_readable())
    }

    /// ReadableStreamDefaultControllerHasBackpressure
    pub(crate) fn has_backpressure(&self) -> bool {
        !self.should_call_pull()
    }

    /// ReadableStreamDefaultControllerClearAlgorithms
    fn clear_algorithms(&self) {
        // Dropped after the borrow ends; captured state may refer back here.
        let _algorithms = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.pull_algorithm.take(),
                inner.cancel_algorithm.take(),
                inner.strategy_size_algorithm.take(),
            )
        };
    }
}

impl<T: 'static> ReadableStreamControllerSteps<T> for ReadableStreamDefaultController<T> {
    fn cancel_steps(&self, reason: Exception) -> AlgorithmFuture {
        // Perform ! ResetQueue(this).
        // Let result be the result of performing this.[[cancelAlgorithm]], passing reason.
        let cancel_algorithm = {
            let mut inner = self.inner.borrow_mut();
            inner.queue.reset_queue();
            inner.cancel_algorithm.take()
        };
        let result = match cancel_algorithm {
            Some(cancel_algorithm) => cancel_algorithm.call(reason),
            None => Box::pin(std::future::ready(Ok(()))),
        };

        // Perform ! ReadableStreamDefaultControllerClearAlgorithms(this).
        self.clear_algorithms();

        result
    }

    fn pull_steps(&self, read_request: ReadRequest<T>) {
        let Some(stream) = self.stream() else {
            return;
        };

        // If this.[[queue]] is not empty,
        let chunk = {
            let mut inner = self.inner.borrow_mut();
            if inner.queue.is_empty() {
                None
            } else {
                // Let chunk be ! DequeueValue(this).
                let chunk = inner.queue.dequeue_value();
                Some((chunk, inner.close_requested && inner.queue.is_empty()))
            }
        };

        match chunk {
            Some((chunk, drained_after_close)) => {
                // If this.[[closeRequested]] is true and this.[[queue]] is empty,
                if drained_after_close {
                    self.clear_algorithms();
                    stream.readable_stream_close();
                } else {
                    // Otherwise, perform ! ReadableStreamDefaultControllerCallPullIfNeeded(this).
                    self.call_pull_if_needed();
                }
                // Perform readRequest’s chunk steps, given chunk.
                read_request.chunk_steps(chunk);
            },
            None => {
                // Perform ! ReadableStreamAddReadRequest(stream, readRequest).
                stream.add_read_request(read_request);
                // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(this).
                self.call_pull_if_needed();
            },
        }
    }

    fn release_steps(&self) {}
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;
    use brook_utils::ctx;

    use crate::queuing_strategy::QueuingStrategy;

    use super::*;

    fn controlled_stream<T: 'static>(
        strategy: QueuingStrategy<T>,
    ) -> (ReadableStream<T>, ReadableStreamDefaultController<T>) {
        let slot = Rc::new(RefCell::new(None));
        let stream = ReadableStream::new(
            UnderlyingSource::new().with_start({
                let slot = slot.clone();
                move |controller| {
                    *slot.borrow_mut() = Some(controller);
                    async { Ok(()) }
                }
            }),
            strategy,
        )
        .unwrap();
        let controller = slot.borrow_mut().take().unwrap();
        (stream, controller)
    }

    #[tokio::test]
    async fn desired_size_tracks_queue() {
        test_async_with(|| {
            Box::pin(async move {
                let (stream, controller) = controlled_stream::<&'static str>(
                    QueuingStrategy::new()
                        .with_high_water_mark(4.0)
                        .with_size(|chunk: &&'static str| Ok(chunk.len() as f64)),
                );
                assert_eq!(controller.desired_size(), Some(4.0));

                controller.enqueue("abc").unwrap();
                assert_eq!(controller.desired_size(), Some(1.0));
                controller.enqueue("de").unwrap();
                assert_eq!(controller.desired_size(), Some(-1.0));

                let reader = stream.get_reader().unwrap();
                assert_eq!(reader.read().await.unwrap().value, Some("abc"));
                assert_eq!(controller.desired_size(), Some(2.0));

                controller.close().unwrap();
                assert_eq!(stream.state(), ReadableStreamState::Readable);
                assert!(controller.enqueue("late").unwrap_err().is_type_error());

                assert_eq!(reader.read().await.unwrap().value, Some("de"));
                assert_eq!(stream.state(), ReadableStreamState::Closed);
                assert_eq!(controller.desired_size(), Some(0.0));
                assert!(reader.read().await.unwrap().done);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn failing_size_errors_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let (stream, controller) = controlled_stream::<u32>(
                    QueuingStrategy::new().with_size(|_| Err(Exception::message("bad size"))),
                );
                let err = controller.enqueue(1).unwrap_err();
                assert_eq!(err, Exception::message("bad size"));
                assert_eq!(stream.state(), ReadableStreamState::Errored(err));
                assert_eq!(controller.desired_size(), None);

                let (_, controller) = controlled_stream::<u32>(
                    QueuingStrategy::new().with_size(|_| Ok(f64::NAN)),
                );
                assert!(controller.enqueue(1).unwrap_err().is_range_error());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn pull_is_never_reentrant() {
        test_async_with(|| {
            Box::pin(async move {
                let calls = Rc::new(RefCell::new(0));
                let stream = ReadableStream::<u32>::new(
                    UnderlyingSource::new().with_pull({
                        let calls = calls.clone();
                        move |controller| {
                            *calls.borrow_mut() += 1;
                            let n = *calls.borrow();
                            async move {
                                tokio::task::yield_now().await;
                                controller.enqueue(n)
                            }
                        }
                    }),
                    QueuingStrategy::new().with_high_water_mark(0.0),
                )
                .unwrap();
                ctx::settle().await;
                assert_eq!(*calls.borrow(), 0);

                let reader = stream.get_reader().unwrap();
                let first = reader.read();
                let second = reader.read();
                assert_eq!(*calls.borrow(), 1);

                assert_eq!(first.await.unwrap().value, Some(1));
                assert_eq!(second.await.unwrap().value, Some(2));
                ctx::settle().await;
                assert_eq!(*calls.borrow(), 2);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn rejected_start_errors_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::<u32>::new(
                    UnderlyingSource::new()
                        .with_start(|_| async { Err(Exception::message("no start")) }),
                    QueuingStrategy::new(),
                )
                .unwrap();
                let reader = stream.get_reader().unwrap();
                assert_eq!(
                    reader.read().await.unwrap_err(),
                    Exception::message("no start")
                );
                assert_eq!(
                    reader.closed().await.unwrap_err(),
                    Exception::message("no start")
                );
            })
        })
        .await;
    }
}
