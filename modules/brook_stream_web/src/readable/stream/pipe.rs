// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use brook_abort::{AbortSignal, ListenerId};
use brook_exceptions::{Exception, Result};
use brook_utils::ctx;
use futures::future::join_all;
use tracing::{debug, trace};

use super::{ReadableStream, ReadableStreamState};
use crate::{
    readable::{
        default_reader::{readable_stream_default_reader_read, ReadableStreamDefaultReader},
        reader::{ReadRequest, ReadRequestSteps},
    },
    utils::promise::{transform_promise, upon_promise, Promise, ResolveablePromise},
    writable::{WritableStream, WritableStreamDefaultWriter, WritableStreamState},
};

/// How [`ReadableStream::pipe_to`] propagates closing, errors and
/// cancellation between the two ends.
#[derive(Debug, Clone, Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Do not abort the destination when the source errors.
    pub prevent_abort: bool,
    /// Do not cancel the source when the destination errors or closes.
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

impl StreamPipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prevent_close(mut self, prevent_close: bool) -> Self {
        self.prevent_close = prevent_close;
        self
    }

    pub fn prevent_abort(mut self, prevent_abort: bool) -> Self {
        self.prevent_abort = prevent_abort;
        self
    }

    pub fn prevent_cancel(mut self, prevent_cancel: bool) -> Self {
        self.prevent_cancel = prevent_cancel;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct PipeTo<T: 'static> {
    source: ReadableStream<T>,
    reader: ReadableStreamDefaultReader<T>,
    dest: WritableStream<T>,
    writer: WritableStreamDefaultWriter<T>,
    prevent_close: bool,
    prevent_abort: bool,
    prevent_cancel: bool,
    signal: Option<AbortSignal>,
    abort_listener: Cell<Option<ListenerId>>,
    shutting_down: Cell<bool>,
    // settles once the most recent write settled, never rejects
    current_write: RefCell<Promise<()>>,
    promise: ResolveablePromise<()>,
}

/// ReadableStreamPipeTo
pub(crate) fn readable_stream_pipe_to<T: 'static>(
    source: &ReadableStream<T>,
    dest: &WritableStream<T>,
    options: StreamPipeOptions,
) -> Promise<()> {
    // Let reader be ! AcquireReadableStreamDefaultReader(source).
    let reader = match ReadableStreamDefaultReader::new(source) {
        Ok(reader) => reader,
        Err(e) => return Promise::rejected(e),
    };

    // Let writer be ! AcquireWritableStreamDefaultWriter(dest).
    let writer = match WritableStreamDefaultWriter::new(dest) {
        Ok(writer) => writer,
        Err(e) => {
            reader.release();
            return Promise::rejected(e);
        },
    };

    // Set source.[[disturbed]] to true.
    source.inner.borrow_mut().disturbed = true;

    let pipe = Rc::new(PipeTo {
        source: source.clone(),
        reader,
        dest: dest.clone(),
        writer,
        prevent_close: options.prevent_close,
        prevent_abort: options.prevent_abort,
        prevent_cancel: options.prevent_cancel,
        signal: options.signal,
        abort_listener: Cell::new(None),
        shutting_down: Cell::new(false),
        current_write: RefCell::new(Promise::resolved(())),
        promise: ResolveablePromise::new(),
    });
    let promise = pipe.promise.promise();

    // If signal is not undefined,
    if let Some(signal) = pipe.signal.clone() {
        // If signal is aborted, perform abortAlgorithm and return promise.
        if signal.aborted() {
            pipe.abort(signal.reason().unwrap_or_default());
            return promise;
        }

        // Add abortAlgorithm to signal.
        let id = signal.add_listener({
            let pipe = pipe.clone();
            move |signal| pipe.abort(signal.reason().unwrap_or_default())
        });
        pipe.abort_listener.set(Some(id));
    }

    pipe.check_initial_states();
    pipe.watch_ends();

    if !pipe.shutting_down.get() {
        pipe.pipe_step();
    }

    promise
}

impl<T: 'static> PipeTo<T> {
    /// Handles ends that are already closed or errored, in precedence order.
    fn check_initial_states(self: &Rc<Self>) {
        if let ReadableStreamState::Errored(e) = self.source.state() {
            self.source_errored(e);
        } else if let WritableStreamState::Errored(e) = self.dest.state() {
            self.dest_errored(e);
        } else if self.source.state() == ReadableStreamState::Closed {
            self.source_closed();
        } else if self.dest.close_queued_or_in_flight()
            || self.dest.state() == WritableStreamState::Closed
        {
            self.dest_closing();
        }
    }

    fn watch_ends(self: &Rc<Self>) {
        // Errors must be propagated forward, closing must be propagated forward.
        upon_promise(self.reader.closed(), {
            let pipe = self.clone();
            move |result| match result {
                Ok(()) => pipe.source_closed(),
                Err(e) => pipe.source_errored(e),
            }
        });

        // Errors must be propagated backward.
        upon_promise(self.writer.closed(), {
            let pipe = self.clone();
            move |result| {
                if let Err(e) = result {
                    pipe.dest_errored(e)
                }
            }
        });
    }

    /// Waits for the destination to accept more data, then reads one chunk.
    fn pipe_step(self: &Rc<Self>) {
        let pipe = self.clone();
        upon_promise(self.writer.ready(), move |ready| {
            if ready.is_err() || pipe.shutting_down.get() {
                return;
            }
            let Some(stream) = pipe.reader.stream() else {
                return;
            };
            readable_stream_default_reader_read(
                &stream,
                ReadRequest::with_steps(PipeReadRequest { pipe: pipe.clone() }),
            );
        });
    }

    fn source_errored(self: &Rc<Self>, error: Exception) {
        if self.shutting_down.get() {
            return;
        }
        // If preventAbort is false, shutdown with an action of ! WritableStreamAbort(dest, storedError) and with storedError.
        if !self.prevent_abort {
            let dest = self.dest.clone();
            let reason = error.clone();
            self.shutdown_with_action(move || dest.writable_stream_abort(reason), Some(error));
        } else {
            // Otherwise, shutdown with storedError.
            self.shutdown(Some(error));
        }
    }

    fn dest_errored(self: &Rc<Self>, error: Exception) {
        if self.shutting_down.get() {
            return;
        }
        // If preventCancel is false, shutdown with an action of ! ReadableStreamCancel(source, storedError) and with storedError.
        if !self.prevent_cancel {
            let source = self.source.clone();
            let reason = error.clone();
            self.shutdown_with_action(move || source.readable_stream_cancel(reason), Some(error));
        } else {
            self.shutdown(Some(error));
        }
    }

    fn source_closed(self: &Rc<Self>) {
        if self.shutting_down.get() {
            return;
        }
        // If preventClose is false, shutdown with an action of ! WritableStreamDefaultWriterCloseWithErrorPropagation(writer).
        if !self.prevent_close {
            let writer = self.writer.clone();
            self.shutdown_with_action(move || writer.close_with_error_propagation(), None);
        } else {
            self.shutdown(None);
        }
    }

    fn dest_closing(self: &Rc<Self>) {
        if self.shutting_down.get() {
            return;
        }
        // Let destClosed be a new TypeError.
        let dest_closed = Exception::throw_type(
            "the destination writable stream closed before all data could be piped to it",
        );
        // If preventCancel is false, shutdown with an action of ! ReadableStreamCancel(source, destClosed) and with destClosed.
        if !self.prevent_cancel {
            let source = self.source.clone();
            let reason = dest_closed.clone();
            self.shutdown_with_action(move || source.readable_stream_cancel(reason), Some(dest_closed));
        } else {
            self.shutdown(Some(dest_closed));
        }
    }

    /// abortAlgorithm: abort the destination and cancel the source as the
    /// options allow, then finish with the signal's reason.
    fn abort(self: &Rc<Self>, error: Exception) {
        if self.shutting_down.get() {
            return;
        }
        debug!("Pipe aborted by signal: {:?}", error);

        let dest = self.dest.clone();
        let source = self.source.clone();
        let prevent_abort = self.prevent_abort;
        let prevent_cancel = self.prevent_cancel;
        let reason = error.clone();

        self.shutdown_with_action(
            move || {
                // Let actions be an empty ordered set.
                let mut actions = Vec::new();
                // If preventAbort is false, append the action of aborting dest if it is still writable.
                if !prevent_abort {
                    actions.push(if dest.state() == WritableStreamState::Writable {
                        dest.writable_stream_abort(reason.clone())
                    } else {
                        Promise::resolved(())
                    });
                }
                // If preventCancel is false, append the action of canceling source if it is still readable.
                if !prevent_cancel {
                    actions.push(if source.is_readable() {
                        source.readable_stream_cancel(reason)
                    } else {
                        Promise::resolved(())
                    });
                }
                // Wait for all of the actions.
                async move {
                    join_all(actions)
                        .await
                        .into_iter()
                        .collect::<Result<Vec<()>>>()
                        .map(drop)
                }
            },
            Some(error),
        );
    }

    fn must_wait_for_writes(&self) -> bool {
        self.dest.state() == WritableStreamState::Writable && !self.dest.close_queued_or_in_flight()
    }

    /// Shutdown with an action
    fn shutdown_with_action<F, Fut>(self: &Rc<Self>, action: F, original_error: Option<Exception>)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        // If shuttingDown is true, abort these substeps.
        // Set shuttingDown to true.
        if self.shutting_down.replace(true) {
            return;
        }
        debug!("Shutting down pipe with action, original error: {:?}", original_error);

        let pipe = self.clone();
        let wait = self.must_wait_for_writes();
        ctx::spawn(async move {
            // If dest.[[state]] is "writable" and ! WritableStreamCloseQueuedOrInFlight(dest) is false, wait until every chunk that has been read has been written.
            if wait {
                pipe.wait_for_writes_to_finish().await;
            }
            // Let p be the result of performing action.
            // Upon fulfillment of p, finalize, passing along originalError if it was given.
            // Upon rejection of p with reason newError, finalize with newError.
            match action().await {
                Ok(()) => pipe.finalize(original_error),
                Err(new_error) => pipe.finalize(Some(new_error)),
            }
        });
    }

    /// Shutdown
    fn shutdown(self: &Rc<Self>, error: Option<Exception>) {
        if self.shutting_down.replace(true) {
            return;
        }
        debug!("Shutting down pipe, error: {:?}", error);

        if !self.must_wait_for_writes() {
            self.finalize(error);
            return;
        }

        let pipe = self.clone();
        ctx::spawn(async move {
            pipe.wait_for_writes_to_finish().await;
            pipe.finalize(error);
        });
    }

    async fn wait_for_writes_to_finish(&self) {
        loop {
            let current_write = self.current_write.borrow().clone();
            let _ = current_write.clone().await;
            // a write may have been issued while we were waiting
            if self.current_write.borrow().ptr_eq(&current_write) {
                return;
            }
        }
    }

    /// Finalize
    fn finalize(&self, error: Option<Exception>) {
        trace!("Finalizing pipe");

        // Perform ! WritableStreamDefaultWriterRelease(writer).
        self.writer.release();

        // Perform ! ReadableStreamDefaultReaderRelease(reader).
        self.reader.release();

        // If signal is not undefined, remove abortAlgorithm from signal.
        if let (Some(signal), Some(id)) = (&self.signal, self.abort_listener.take()) {
            signal.remove_listener(id);
        }

        match error {
            // If error was given, reject promise with error.
            Some(error) => self.promise.reject(error),
            // Otherwise, resolve promise with undefined.
            None => self.promise.resolve(()),
        }
    }
}

/// The read request issued by the pipe loop. The chunk is written in the
/// same turn it is read so a later shutdown always waits for it.
struct PipeReadRequest<T: 'static> {
    pipe: Rc<PipeTo<T>>,
}

impl<T: 'static> ReadRequestSteps<T> for PipeReadRequest<T> {
    fn chunk_steps(self: Box<Self>, chunk: T) {
        let write = self.pipe.writer.write(chunk);
        let current_write = transform_promise(write, |_| Ok(()));
        *self.pipe.current_write.borrow_mut() = current_write;
        self.pipe.pipe_step();
    }

    // the closed watcher takes over
    fn close_steps(self: Box<Self>) {}

    fn error_steps(self: Box<Self>, _reason: Exception) {}
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use brook_abort::AbortController;
    use brook_test::test_async_with;
    use brook_utils::ctx;

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{ReadableStreamDefaultController, UnderlyingSource},
        writable::UnderlyingSink,
    };

    fn recording_sink(written: Rc<RefCell<Vec<u32>>>) -> WritableStream<u32> {
        WritableStream::new(
            UnderlyingSink::new().with_write(move |chunk, _| {
                written.borrow_mut().push(chunk);
                async { Ok(()) }
            }),
            QueuingStrategy::default(),
        )
        .unwrap()
    }

    #[test]
    fn options_debug_includes_signal_state() {
        let controller = AbortController::new();
        let options = StreamPipeOptions::new()
            .prevent_close(true)
            .signal(controller.signal());
        let rendered = format!("{options:?}");
        assert!(rendered.contains("prevent_close: true"));
        assert!(rendered.contains("AbortSignal { aborted: false"));
    }

    #[tokio::test]
    async fn pipes_everything_and_closes_destination() {
        test_async_with(|| {
            Box::pin(async move {
                let written = Rc::new(RefCell::new(Vec::new()));
                let closed = Rc::new(Cell::new(false));
                let dest = WritableStream::new(
                    UnderlyingSink::new()
                        .with_write({
                            let written = written.clone();
                            move |chunk, _| {
                                written.borrow_mut().push(chunk);
                                async { Ok(()) }
                            }
                        })
                        .with_close({
                            let closed = closed.clone();
                            move || {
                                closed.set(true);
                                async { Ok(()) }
                            }
                        }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let source = ReadableStream::from_iterable(vec![1u32, 2, 3]).unwrap();

                source.pipe_to(&dest, StreamPipeOptions::new()).await.unwrap();

                assert_eq!(*written.borrow(), vec![1, 2, 3]);
                assert!(closed.get());
                assert!(!source.locked());
                assert!(!dest.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn prevent_close_leaves_destination_writable() {
        test_async_with(|| {
            Box::pin(async move {
                let written = Rc::new(RefCell::new(Vec::new()));
                let dest = recording_sink(written.clone());
                let source = ReadableStream::new(
                    UnderlyingSource::new().with_start(
                        |controller: ReadableStreamDefaultController<u32>| async move {
                            controller.enqueue(1)?;
                            controller.enqueue(2)?;
                            controller.enqueue(3)?;
                            controller.close()
                        },
                    ),
                    QueuingStrategy::default(),
                )
                .unwrap();

                source
                    .pipe_to(&dest, StreamPipeOptions::new().prevent_close(true))
                    .await
                    .unwrap();
                assert_eq!(*written.borrow(), vec![1, 2, 3]);

                let writer = dest.get_writer().unwrap();
                writer.write(4).await.unwrap();
                assert_eq!(*written.borrow(), vec![1, 2, 3, 4]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn source_error_aborts_destination() {
        test_async_with(|| {
            Box::pin(async move {
                let abort_reason = Rc::new(RefCell::new(None));
                let dest = WritableStream::<u32>::new(
                    UnderlyingSink::new().with_abort({
                        let abort_reason = abort_reason.clone();
                        move |reason| {
                            *abort_reason.borrow_mut() = Some(reason);
                            async { Ok(()) }
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let source = ReadableStream::new(
                    UnderlyingSource::new().with_start(
                        |controller: ReadableStreamDefaultController<u32>| async move {
                            controller.error(Exception::message("boom"));
                            Ok(())
                        },
                    ),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let result = source.pipe_to(&dest, StreamPipeOptions::new()).await;

                assert_eq!(result, Err(Exception::message("boom")));
                assert_eq!(*abort_reason.borrow(), Some(Exception::message("boom")));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn destination_error_cancels_source() {
        test_async_with(|| {
            Box::pin(async move {
                let cancel_reason = Rc::new(RefCell::new(None));
                let source = ReadableStream::<u32>::new(
                    UnderlyingSource::new().with_cancel({
                        let cancel_reason = cancel_reason.clone();
                        move |reason| {
                            *cancel_reason.borrow_mut() = Some(reason);
                            async { Ok(()) }
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let dest = WritableStream::<u32>::new(UnderlyingSink::new(), QueuingStrategy::default())
                    .unwrap();

                let pipe = source.pipe_to(&dest, StreamPipeOptions::new());
                ctx::settle().await;
                dest.controller().error(Exception::message("sink gone"));

                assert_eq!(pipe.await, Err(Exception::message("sink gone")));
                assert_eq!(*cancel_reason.borrow(), Some(Exception::message("sink gone")));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn signal_abort_shuts_down_both_ends() {
        test_async_with(|| {
            Box::pin(async move {
                let canceled = Rc::new(Cell::new(false));
                let source = ReadableStream::<u32>::new(
                    UnderlyingSource::new().with_cancel({
                        let canceled = canceled.clone();
                        move |_| {
                            canceled.set(true);
                            async { Ok(()) }
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let written = Rc::new(RefCell::new(Vec::new()));
                let dest = recording_sink(written);

                let controller = AbortController::new();
                let pipe = source.pipe_to(
                    &dest,
                    StreamPipeOptions::new().signal(controller.signal()),
                );
                ctx::settle().await;
                controller.abort(None);

                let error = pipe.await.unwrap_err();
                assert_eq!(error.dom_name(), Some("AbortError"));
                assert!(canceled.get());
                assert!(!source.locked());
                let writer = dest.get_writer().unwrap();
                assert_eq!(
                    writer.closed().await.unwrap_err().dom_name(),
                    Some("AbortError")
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn already_aborted_signal_rejects_immediately() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_iterable(vec![1u32]).unwrap();
                let written = Rc::new(RefCell::new(Vec::new()));
                let dest = recording_sink(written.clone());

                let controller = AbortController::new();
                controller.abort(Some(Exception::message("stop")));
                let result = source
                    .pipe_to(
                        &dest,
                        StreamPipeOptions::new()
                            .prevent_cancel(true)
                            .signal(controller.signal()),
                    )
                    .await;

                assert_eq!(result, Err(Exception::message("stop")));
                assert!(written.borrow().is_empty());
                assert!(source.get_reader().is_ok());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn locked_ends_are_rejected() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_iterable(vec![1u32]).unwrap();
                let dest = WritableStream::<u32>::new(UnderlyingSink::new(), QueuingStrategy::default())
                    .unwrap();
                let _writer = dest.get_writer().unwrap();

                let error = source
                    .pipe_to(&dest, StreamPipeOptions::new())
                    .await
                    .unwrap_err();
                assert!(error.is_type_error());
                assert!(!source.locked());
            })
        })
        .await;
    }
}
