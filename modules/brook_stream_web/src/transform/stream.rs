// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, fmt, rc::Rc};

use brook_exceptions::{Exception, Result};
use tracing::trace;

use super::{controller::TransformStreamDefaultController, transformer::Transformer};
use crate::{
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    readable::{
        stream::algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm},
        ReadableStream, ReadableStreamDefaultController, ReadableStreamState,
    },
    utils::promise::{upon_promise, AlgorithmFuture, ResolveablePromise},
    writable::{
        sink::{CloseAlgorithm, WriteAlgorithm},
        WritableStream, WritableStreamDefaultController, WritableStreamState,
    },
};

pub(crate) struct TransformStreamInner<I: 'static, O: 'static> {
    readable: Option<ReadableStream<O>>,
    readable_controller: Option<ReadableStreamDefaultController<O>>,
    writable: Option<WritableStream<I>>,
    backpressure: Option<bool>,
    backpressure_change_promise: Option<ResolveablePromise<()>>,
    pub(super) controller: Option<TransformStreamDefaultController<I, O>>,
}

/// A writable side and a readable side joined by a [`Transformer`]: chunks
/// written to [`writable`](Self::writable) come out of
/// [`readable`](Self::readable) after transformation.
pub struct TransformStream<I: 'static, O: 'static = I> {
    pub(crate) inner: Rc<RefCell<TransformStreamInner<I, O>>>,
}

impl<I: 'static, O: 'static> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: 'static, O: 'static> fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TransformStream")
            .field("readable", &inner.readable)
            .field("writable", &inner.writable)
            .field("backpressure", &inner.backpressure)
            .finish()
    }
}

/// A start algorithm that settles with the transformer's start.
fn start_algorithm<C>(start_promise: &ResolveablePromise<()>) -> StartAlgorithm<C> {
    let start_promise = start_promise.promise();
    StartAlgorithm::Function(Box::new(move |_| Box::pin(start_promise)))
}

impl<I: 'static, O: 'static> TransformStream<I, O> {
    /// The writable side buffers one chunk by default, the readable side none.
    pub fn new(
        transformer: Transformer<I, O>,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Result<Self> {
        // Let readableHighWaterMark be ? ExtractHighWaterMark(readableStrategy, 0).
        let readable_high_water_mark = readable_strategy.extract_high_water_mark(0.0)?;
        // Let readableSizeAlgorithm be ! ExtractSizeAlgorithm(readableStrategy).
        let readable_size_algorithm = readable_strategy.extract_size_algorithm();
        // Let writableHighWaterMark be ? ExtractHighWaterMark(writableStrategy, 1).
        let writable_high_water_mark = writable_strategy.extract_high_water_mark(1.0)?;
        // Let writableSizeAlgorithm be ! ExtractSizeAlgorithm(writableStrategy).
        let writable_size_algorithm = writable_strategy.extract_size_algorithm();

        let stream = Self {
            inner: Rc::new(RefCell::new(TransformStreamInner {
                readable: None,
                readable_controller: None,
                writable: None,
                backpressure: None,
                backpressure_change_promise: None,
                controller: None,
            })),
        };

        // Let startPromise be a new promise.
        let start_promise = ResolveablePromise::new();

        // Perform ! InitializeTransformStream(this, startPromise, writableHighWaterMark, writableSizeAlgorithm, readableHighWaterMark, readableSizeAlgorithm).
        stream.initialize(
            &start_promise,
            writable_high_water_mark,
            writable_size_algorithm,
            readable_high_water_mark,
            readable_size_algorithm,
        )?;

        // Perform ? SetUpTransformStreamDefaultControllerFromTransformer(this, transformer, transformerDict).
        let (start, transform_algorithm, flush_algorithm, cancel_algorithm) =
            transformer.into_parts();
        let controller = TransformStreamDefaultController::set_up(
            &stream,
            transform_algorithm,
            flush_algorithm,
            cancel_algorithm,
        );

        match start {
            // If transformerDict["start"] exists, then resolve startPromise with the result of invoking transformerDict["start"].
            Some(start) => upon_promise(start(controller), move |result| {
                start_promise.settle(result)
            }),
            // Otherwise, resolve startPromise with undefined.
            None => start_promise.resolve_undefined(),
        }

        Ok(stream)
    }

    pub fn readable(&self) -> ReadableStream<O> {
        self.inner
            .borrow()
            .readable
            .clone()
            .expect("transform stream readable side is set up on construction")
    }

    pub fn writable(&self) -> WritableStream<I> {
        self.inner
            .borrow()
            .writable
            .clone()
            .expect("transform stream writable side is set up on construction")
    }

    /// InitializeTransformStream
    fn initialize(
        &self,
        start_promise: &ResolveablePromise<()>,
        writable_high_water_mark: f64,
        writable_size_algorithm: SizeAlgorithm<I>,
        readable_high_water_mark: f64,
        readable_size_algorithm: SizeAlgorithm<O>,
    ) -> Result<()> {
        // Let writeAlgorithm be the following steps, taking a chunk argument:
        // Return ! TransformStreamDefaultSinkWriteAlgorithm(stream, chunk).
        let write_algorithm = WriteAlgorithm::from_fn(Box::new({
            let stream = self.clone();
            move |chunk, _| stream.sink_write(chunk)
        }));

        // Let abortAlgorithm be the following steps, taking a reason argument:
        // Return ! TransformStreamDefaultSinkAbortAlgorithm(stream, reason).
        let abort_algorithm = CancelAlgorithm::Function(Box::new({
            let stream = self.clone();
            move |reason| stream.sink_abort(reason)
        }));

        // Let closeAlgorithm be the following steps:
        // Return ! TransformStreamDefaultSinkCloseAlgorithm(stream).
        let close_algorithm = CloseAlgorithm::Function(Box::new({
            let stream = self.clone();
            move || stream.sink_close()
        }));

        // Set stream.[[writable]] to ! CreateWritableStream(startAlgorithm, writeAlgorithm, closeAlgorithm, abortAlgorithm, writableHighWaterMark, writableSizeAlgorithm).
        let writable = WritableStream::new_uninitialized();
        WritableStreamDefaultController::set_up(
            &writable,
            start_algorithm(start_promise),
            write_algorithm,
            close_algorithm,
            abort_algorithm,
            writable_high_water_mark,
            writable_size_algorithm,
        )?;

        // Let pullAlgorithm be the following steps:
        // Return ! TransformStreamDefaultSourcePullAlgorithm(stream).
        let pull_algorithm = PullAlgorithm::from_fn(Box::new({
            let stream = self.clone();
            move |_| stream.source_pull()
        }));

        // Let cancelAlgorithm be the following steps, taking a reason argument:
        // Return ! TransformStreamDefaultSourceCancelAlgorithm(stream, reason).
        let cancel_algorithm = CancelAlgorithm::Function(Box::new({
            let stream = self.clone();
            move |reason| stream.source_cancel(reason)
        }));

        // Set stream.[[readable]] to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancelAlgorithm, readableHighWaterMark, readableSizeAlgorithm).
        let readable = ReadableStream::new_uninitialized();
        let readable_controller = ReadableStreamDefaultController::set_up(
            &readable,
            start_algorithm(start_promise),
            pull_algorithm,
            cancel_algorithm,
            readable_high_water_mark,
            readable_size_algorithm,
        )?;

        {
            let mut inner = self.inner.borrow_mut();
            inner.writable = Some(writable);
            inner.readable = Some(readable);
            inner.readable_controller = Some(readable_controller);
        }

        // Set stream.[[backpressure]] and stream.[[backpressureChangePromise]] to undefined.
        // Perform ! TransformStreamSetBackpressure(stream, true).
        self.set_backpressure(true);
        Ok(())
    }

    pub(super) fn readable_controller(&self) -> ReadableStreamDefaultController<O> {
        self.inner
            .borrow()
            .readable_controller
            .clone()
            .expect("transform stream readable side is set up on construction")
    }

    fn controller(&self) -> TransformStreamDefaultController<I, O> {
        self.inner
            .borrow()
            .controller
            .clone()
            .expect("transform stream controller is set up on construction")
    }

    pub(super) fn backpressure(&self) -> Option<bool> {
        self.inner.borrow().backpressure
    }

    /// TransformStreamSetBackpressure
    pub(super) fn set_backpressure(&self, backpressure: bool) {
        let previous = {
            let mut inner = self.inner.borrow_mut();
            // Set stream.[[backpressureChangePromise]] to a new promise.
            let previous = inner
                .backpressure_change_promise
                .replace(ResolveablePromise::new());
            // Set stream.[[backpressure]] to backpressure.
            inner.backpressure = Some(backpressure);
            previous
        };
        trace!("transform stream backpressure: {}", backpressure);

        // If stream.[[backpressureChangePromise]] is not undefined, resolve stream.[[backpressureChangePromise]] with undefined.
        if let Some(previous) = previous {
            previous.resolve_undefined();
        }
    }

    /// TransformStreamError
    pub(super) fn error(&self, e: Exception) {
        // Perform ! ReadableStreamDefaultControllerError(stream.[[readable]].[[controller]], e).
        self.readable_controller().error_internal(e.clone());
        // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, e).
        self.error_writable_and_unblock_write(e);
    }

    /// TransformStreamErrorWritableAndUnblockWrite
    pub(super) fn error_writable_and_unblock_write(&self, e: Exception) {
        // Perform ! TransformStreamDefaultControllerClearAlgorithms(stream.[[controller]]).
        self.controller().clear_algorithms();
        // Perform ! WritableStreamDefaultControllerErrorIfNeeded(stream.[[writable]].[[controller]], e).
        self.writable().controller().error_if_needed(e);
        // Perform ! TransformStreamUnblockWrite(stream).
        self.unblock_write();
    }

    /// TransformStreamUnblockWrite
    fn unblock_write(&self) {
        // If stream.[[backpressure]] is true, perform ! TransformStreamSetBackpressure(stream, false).
        if self.backpressure() == Some(true) {
            self.set_backpressure(false);
        }
    }

    /// TransformStreamDefaultSinkWriteAlgorithm
    fn sink_write(&self, chunk: I) -> AlgorithmFuture {
        // If stream.[[backpressure]] is true,
        let backpressure_change_promise = {
            let inner = self.inner.borrow();
            match inner.backpressure {
                Some(true) => inner
                    .backpressure_change_promise
                    .as_ref()
                    .map(ResolveablePromise::promise),
                _ => None,
            }
        };

        let Some(backpressure_change_promise) = backpressure_change_promise else {
            // Return ! TransformStreamDefaultControllerPerformTransform(controller, chunk).
            return self.perform_transform(chunk);
        };

        // Return the result of reacting to backpressureChangePromise with the following fulfillment steps:
        let stream = self.clone();
        Box::pin(async move {
            backpressure_change_promise.await?;
            // If state is "erroring", throw writable.[[storedError]].
            if let WritableStreamState::Erroring(stored_error) = stream.writable().state() {
                return Err(stored_error);
            }
            // Return ! TransformStreamDefaultControllerPerformTransform(controller, chunk).
            stream.perform_transform(chunk).await
        })
    }

    /// TransformStreamDefaultControllerPerformTransform
    fn perform_transform(&self, chunk: I) -> AlgorithmFuture {
        // Let transformPromise be the result of performing controller.[[transformAlgorithm]], passing chunk.
        let transform_promise = self.controller().call_transform(chunk);
        let stream = self.clone();
        Box::pin(async move {
            let result = transform_promise.await;
            // Return the result of reacting to transformPromise with the following rejection steps given the argument r:
            if let Err(r) = &result {
                trace!("transform rejected: {}", r);
                // Perform ! TransformStreamError(controller.[[stream]], r).
                stream.error(r.clone());
            }
            result
        })
    }

    /// TransformStreamDefaultSinkAbortAlgorithm
    fn sink_abort(&self, reason: Exception) -> AlgorithmFuture {
        let controller = self.controller();
        // If controller.[[finishPromise]] is not undefined, return controller.[[finishPromise]].
        if let Some(finish_promise) = controller.finish_promise() {
            return Box::pin(finish_promise);
        }

        // Let readable be stream.[[readable]].
        let readable = self.readable();

        // Let controller.[[finishPromise]] be a new promise.
        let finish_promise = controller.start_finishing();

        // Let cancelPromise be the result of performing controller.[[cancelAlgorithm]], passing reason.
        let cancel_promise = controller.call_cancel(reason.clone());

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        controller.clear_algorithms();

        let readable_controller = self.readable_controller();
        let resolver = finish_promise.clone();
        upon_promise(cancel_promise, move |result| match result {
            Ok(()) => match readable.state() {
                // If readable.[[state]] is "errored", reject controller.[[finishPromise]] with readable.[[storedError]].
                ReadableStreamState::Errored(stored_error) => resolver.reject(stored_error),
                _ => {
                    // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], reason).
                    readable_controller.error_internal(reason);
                    // Resolve controller.[[finishPromise]] with undefined.
                    resolver.resolve_undefined();
                },
            },
            Err(r) => {
                // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], r).
                readable_controller.error_internal(r.clone());
                // Reject controller.[[finishPromise]] with r.
                resolver.reject(r);
            },
        });

        Box::pin(finish_promise.promise())
    }

    /// TransformStreamDefaultSinkCloseAlgorithm
    fn sink_close(&self) -> AlgorithmFuture {
        let controller = self.controller();
        if let Some(finish_promise) = controller.finish_promise() {
            return Box::pin(finish_promise);
        }

        let readable = self.readable();
        let finish_promise = controller.start_finishing();

        // Let flushPromise be the result of performing controller.[[flushAlgorithm]].
        let flush_promise = controller.call_flush();

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        controller.clear_algorithms();

        let readable_controller = self.readable_controller();
        let resolver = finish_promise.clone();
        upon_promise(flush_promise, move |result| match result {
            Ok(()) => match readable.state() {
                ReadableStreamState::Errored(stored_error) => resolver.reject(stored_error),
                _ => {
                    // Perform ! ReadableStreamDefaultControllerClose(readable.[[controller]]).
                    readable_controller.close_internal();
                    resolver.resolve_undefined();
                },
            },
            Err(r) => {
                trace!("transform flush rejected: {}", r);
                readable_controller.error_internal(r.clone());
                resolver.reject(r);
            },
        });

        Box::pin(finish_promise.promise())
    }

    /// TransformStreamDefaultSourcePullAlgorithm
    fn source_pull(&self) -> AlgorithmFuture {
        // Perform ! TransformStreamSetBackpressure(stream, false).
        self.set_backpressure(false);

        // Return stream.[[backpressureChangePromise]].
        let backpressure_change_promise = self
            .inner
            .borrow()
            .backpressure_change_promise
            .as_ref()
            .map(ResolveablePromise::promise)
            .expect("backpressure change promise is set with the backpressure flag");
        Box::pin(backpressure_change_promise)
    }

    /// TransformStreamDefaultSourceCancelAlgorithm
    fn source_cancel(&self, reason: Exception) -> AlgorithmFuture {
        let controller = self.controller();
        if let Some(finish_promise) = controller.finish_promise() {
            return Box::pin(finish_promise);
        }

        // Let writable be stream.[[writable]].
        let writable = self.writable();
        let finish_promise = controller.start_finishing();

        let cancel_promise = controller.call_cancel(reason.clone());
        controller.clear_algorithms();

        let stream = self.clone();
        let resolver = finish_promise.clone();
        upon_promise(cancel_promise, move |result| match result {
            Ok(()) => match writable.state() {
                // If writable.[[state]] is "errored", reject controller.[[finishPromise]] with writable.[[storedError]].
                WritableStreamState::Errored(stored_error) => resolver.reject(stored_error),
                _ => {
                    // Perform ! WritableStreamDefaultControllerErrorIfNeeded(writable.[[controller]], reason).
                    writable.controller().error_if_needed(reason);
                    // Perform ! TransformStreamUnblockWrite(stream).
                    stream.unblock_write();
                    resolver.resolve_undefined();
                },
            },
            Err(r) => {
                writable.controller().error_if_needed(r.clone());
                stream.unblock_write();
                resolver.reject(r);
            },
        });

        Box::pin(finish_promise.promise())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_test::test_async_with;
    use brook_utils::ctx;

    use super::*;

    fn uppercase() -> TransformStream<String> {
        TransformStream::new(
            Transformer::new(|chunk: String, controller: TransformStreamDefaultController<String>| {
                let result = controller.enqueue(chunk.to_uppercase());
                async move { result }
            })
            .with_flush(|controller| {
                let result = controller.enqueue("END".to_string());
                async move { result }
            }),
            QueuingStrategy::default(),
            QueuingStrategy::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn chunks_are_transformed_then_flushed() {
        test_async_with(|| {
            Box::pin(async move {
                let transform = uppercase();
                let writer = transform.writable().get_writer().unwrap();
                let reader = transform.readable().get_reader().unwrap();

                let first = writer.write("a".to_string());
                assert_eq!(reader.read().await.unwrap().value.as_deref(), Some("A"));
                first.await.unwrap();

                let second = writer.write("b".to_string());
                assert_eq!(reader.read().await.unwrap().value.as_deref(), Some("B"));
                second.await.unwrap();

                let closed = writer.close();
                assert_eq!(reader.read().await.unwrap().value.as_deref(), Some("END"));
                assert!(reader.read().await.unwrap().done);
                closed.await.unwrap();
            })
        })
        .await;
    }

    #[tokio::test]
    async fn readable_backpressure_holds_writes() {
        test_async_with(|| {
            Box::pin(async move {
                let transformed = Rc::new(Cell::new(0));
                let transform = TransformStream::<u32>::new(
                    Transformer::new({
                        let transformed = transformed.clone();
                        move |chunk, controller: TransformStreamDefaultController<u32>| {
                            transformed.set(transformed.get() + 1);
                            let result = controller.enqueue(chunk);
                            async move { result }
                        }
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let writer = transform.writable().get_writer().unwrap();

                let write = writer.write(1);
                ctx::settle().await;
                // nobody is reading and the readable side buffers nothing
                assert_eq!(transformed.get(), 0);
                assert!(write.is_pending());

                let reader = transform.readable().get_reader().unwrap();
                assert_eq!(reader.read().await.unwrap().value, Some(1));
                write.await.unwrap();
                assert_eq!(transformed.get(), 1);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn failing_transform_errors_both_sides() {
        test_async_with(|| {
            Box::pin(async move {
                let transform = TransformStream::<u32>::new(
                    Transformer::new(|_, _: TransformStreamDefaultController<u32>| async {
                        Err(Exception::message("cannot transform"))
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let writer = transform.writable().get_writer().unwrap();
                let reader = transform.readable().get_reader().unwrap();

                let read = reader.read();
                let write = writer.write(7);

                assert_eq!(write.await, Err(Exception::message("cannot transform")));
                assert_eq!(read.await, Err(Exception::message("cannot transform")));
                assert_eq!(
                    writer.closed().await,
                    Err(Exception::message("cannot transform"))
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn terminate_closes_readable_and_errors_writable() {
        test_async_with(|| {
            Box::pin(async move {
                let transform = TransformStream::<u32>::new(
                    Transformer::new(|chunk, controller: TransformStreamDefaultController<u32>| {
                        let result = controller.enqueue(chunk);
                        controller.terminate();
                        async move { result }
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::new().with_high_water_mark(1.0),
                )
                .unwrap();
                let writer = transform.writable().get_writer().unwrap();
                let reader = transform.readable().get_reader().unwrap();

                writer.write(1).await.unwrap();
                assert_eq!(reader.read().await.unwrap().value, Some(1));
                assert!(reader.read().await.unwrap().done);

                let error = writer.write(2).await.unwrap_err();
                assert!(error.is_type_error());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn canceling_readable_errors_writable() {
        test_async_with(|| {
            Box::pin(async move {
                let cancel_reason = Rc::new(RefCell::new(None));
                let transform = TransformStream::<u32>::new(
                    Transformer::default().with_cancel({
                        let cancel_reason = cancel_reason.clone();
                        move |reason| {
                            *cancel_reason.borrow_mut() = Some(reason);
                            async { Ok(()) }
                        }
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let writer = transform.writable().get_writer().unwrap();

                transform
                    .readable()
                    .cancel(Exception::message("no more"))
                    .await
                    .unwrap();

                assert_eq!(*cancel_reason.borrow(), Some(Exception::message("no more")));
                assert_eq!(writer.closed().await, Err(Exception::message("no more")));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn pipe_through_identity_transform() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_iterable(vec![1u32, 2, 3]).unwrap();
                let transform = TransformStream::new(
                    Transformer::default(),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let readable = source
                    .pipe_through(transform, Default::default())
                    .unwrap();
                let reader = readable.get_reader().unwrap();
                for expected in 1..=3 {
                    assert_eq!(reader.read().await.unwrap().value, Some(expected));
                }
                assert!(reader.read().await.unwrap().done);
            })
        })
        .await;
    }
}
