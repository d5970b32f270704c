// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use brook_exceptions::{Exception, Result};
use brook_utils::ctx;
use tracing::{debug, trace};

pub use default_controller::WritableStreamDefaultController;
use default_writer::WritableStreamDefaultWriterInner;
pub use default_writer::WritableStreamDefaultWriter;
pub use sink::UnderlyingSink;

use crate::{
    queuing_strategy::QueuingStrategy,
    utils::promise::{upon_promise, Promise, ResolveablePromise},
};

mod default_controller;
mod default_writer;
pub(crate) mod sink;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WritableStreamState {
    Writable,
    Closed,
    Erroring(Exception),
    Errored(Exception),
}

struct PendingAbortRequest {
    promise: ResolveablePromise<()>,
    reason: Exception,
    was_already_erroring: bool,
}

pub(crate) struct WritableStreamInner<T: 'static> {
    state: WritableStreamState,
    backpressure: bool,
    close_request: Option<ResolveablePromise<()>>,
    in_flight_write_request: Option<ResolveablePromise<()>>,
    in_flight_close_request: Option<ResolveablePromise<()>>,
    pending_abort_request: Option<PendingAbortRequest>,
    write_requests: VecDeque<ResolveablePromise<()>>,
    writer: Option<Weak<RefCell<WritableStreamDefaultWriterInner<T>>>>,
    controller: Option<WritableStreamDefaultController<T>>,
}

/// A destination for chunks, written through a locked writer.
pub struct WritableStream<T: 'static> {
    pub(crate) inner: Rc<RefCell<WritableStreamInner<T>>>,
}

impl<T: 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WritableStream")
            .field("state", &inner.state)
            .field("locked", &inner.writer.is_some())
            .field("backpressure", &inner.backpressure)
            .finish()
    }
}

impl<T: 'static> WritableStream<T> {
    pub fn new(sink: UnderlyingSink<T>, strategy: QueuingStrategy<T>) -> Result<Self> {
        // Let sizeAlgorithm be ! ExtractSizeAlgorithm(strategy).
        let size_algorithm = strategy.extract_size_algorithm();
        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 1).
        let high_water_mark = strategy.extract_high_water_mark(1.0)?;

        // Perform ! InitializeWritableStream(this).
        let stream = Self::new_uninitialized();

        let (start_algorithm, write_algorithm, close_algorithm, abort_algorithm) =
            sink.into_algorithms();
        // Perform ? SetUpWritableStreamDefaultControllerFromUnderlyingSink(this, underlyingSink, underlyingSinkDict, highWaterMark, sizeAlgorithm).
        WritableStreamDefaultController::set_up(
            &stream,
            start_algorithm,
            write_algorithm,
            close_algorithm,
            abort_algorithm,
            high_water_mark,
            size_algorithm,
        )?;

        Ok(stream)
    }

    /// InitializeWritableStream
    pub(crate) fn new_uninitialized() -> Self {
        Self {
            inner: Rc::new(RefCell::new(WritableStreamInner {
                // Set stream.[[state]] to "writable".
                state: WritableStreamState::Writable,
                // Set stream.[[backpressure]] to false.
                backpressure: false,
                close_request: None,
                in_flight_write_request: None,
                in_flight_close_request: None,
                pending_abort_request: None,
                // Set stream.[[writeRequests]] to a new empty list.
                write_requests: VecDeque::new(),
                writer: None,
                controller: None,
            })),
        }
    }

    pub fn locked(&self) -> bool {
        self.is_locked()
    }

    pub fn abort(&self, reason: impl Into<Exception>) -> Promise<()> {
        // If ! IsWritableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_locked() {
            return Promise::rejected(Exception::throw_type(
                "Cannot abort a stream that already has a writer",
            ));
        }

        // Return ! WritableStreamAbort(this, reason).
        self.writable_stream_abort(reason.into())
    }

    pub fn close(&self) -> Promise<()> {
        // If ! IsWritableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_locked() {
            return Promise::rejected(Exception::throw_type(
                "Cannot close a stream that already has a writer",
            ));
        }

        // If ! WritableStreamCloseQueuedOrInFlight(this) is true, return a promise rejected with a TypeError exception.
        if self.close_queued_or_in_flight() {
            return Promise::rejected(Exception::throw_type(
                "Cannot close an already-closing stream",
            ));
        }

        // Return ! WritableStreamClose(this).
        self.writable_stream_close()
    }

    pub fn get_writer(&self) -> Result<WritableStreamDefaultWriter<T>> {
        // Return ? AcquireWritableStreamDefaultWriter(this).
        WritableStreamDefaultWriter::new(self)
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.inner.borrow().writer.is_some()
    }

    pub(crate) fn state(&self) -> WritableStreamState {
        self.inner.borrow().state.clone()
    }

    pub(crate) fn backpressure(&self) -> bool {
        self.inner.borrow().backpressure
    }

    pub(crate) fn controller(&self) -> WritableStreamDefaultController<T> {
        self.inner
            .borrow()
            .controller
            .clone()
            .expect("writable stream used before its controller was set up")
    }

    pub(crate) fn set_controller(&self, controller: WritableStreamDefaultController<T>) {
        self.inner.borrow_mut().controller = Some(controller);
    }

    pub(crate) fn set_writer(&self, writer: &WritableStreamDefaultWriter<T>) {
        self.inner.borrow_mut().writer = Some(Rc::downgrade(&writer.inner));
    }

    pub(crate) fn clear_writer(&self) {
        self.inner.borrow_mut().writer = None;
    }

    pub(crate) fn writer(&self) -> Option<WritableStreamDefaultWriter<T>> {
        let writer = self.inner.borrow().writer.clone()?;
        writer
            .upgrade()
            .map(|inner| WritableStreamDefaultWriter { inner })
    }

    pub(crate) fn stored_error(&self) -> Option<Exception> {
        match self.inner.borrow().state {
            WritableStreamState::Erroring(ref stored_error)
            | WritableStreamState::Errored(ref stored_error) => Some(stored_error.clone()),
            _ => None,
        }
    }

    /// WritableStreamAbort
    pub(crate) fn writable_stream_abort(&self, reason: Exception) -> Promise<()> {
        // If stream.[[state]] is "closed" or "errored", return a promise resolved with undefined.
        if matches!(
            self.state(),
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return Promise::resolved(());
        }

        // Signal abort on stream.[[controller]].[[abortController]] with reason.
        let signal_reason = (reason != Exception::Undefined).then(|| reason.clone());
        self.controller().abort_controller().abort(signal_reason);

        // Let state be stream.[[state]].
        // If state is "closed" or "errored", return a promise resolved with undefined.
        let state = self.state();
        if matches!(
            state,
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return Promise::resolved(());
        }

        let (promise, reason, was_already_erroring) = {
            let mut inner = self.inner.borrow_mut();
            // If stream.[[pendingAbortRequest]] is not undefined, return stream.[[pendingAbortRequest]]'s promise.
            if let Some(pending_abort_request) = &inner.pending_abort_request {
                return pending_abort_request.promise.promise();
            }

            // If state is "erroring", set wasAlreadyErroring to true and reason to undefined.
            let was_already_erroring = matches!(state, WritableStreamState::Erroring(_));
            let reason = if was_already_erroring {
                Exception::Undefined
            } else {
                reason
            };

            // Let promise be a new promise.
            let promise = ResolveablePromise::new();

            // Set stream.[[pendingAbortRequest]] to a new pending abort request whose promise is promise, reason is reason, and was already erroring is wasAlreadyErroring.
            inner.pending_abort_request = Some(PendingAbortRequest {
                promise: promise.clone(),
                reason: reason.clone(),
                was_already_erroring,
            });
            (promise, reason, was_already_erroring)
        };

        // If wasAlreadyErroring is false, perform ! WritableStreamStartErroring(stream, reason).
        if !was_already_erroring {
            self.start_erroring(reason);
        }

        // Return promise.
        promise.promise()
    }

    /// WritableStreamClose
    pub(crate) fn writable_stream_close(&self) -> Promise<()> {
        // Let state be stream.[[state]].
        // If state is "closed" or "errored", return a promise rejected with a TypeError exception.
        let state = self.state();
        if matches!(
            state,
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return Promise::rejected(Exception::throw_type(
                "The stream is not in the writable state and cannot be closed",
            ));
        }

        // Let promise be a new promise.
        // Set stream.[[closeRequest]] to promise.
        let promise = ResolveablePromise::new();
        let backpressure = {
            let mut inner = self.inner.borrow_mut();
            inner.close_request = Some(promise.clone());
            inner.backpressure
        };

        // If writer is not undefined, and stream.[[backpressure]] is true, and state is "writable", resolve writer.[[readyPromise]] with undefined.
        if backpressure && state == WritableStreamState::Writable {
            if let Some(writer) = self.writer() {
                writer.ready_promise().resolve_undefined();
            }
        }

        // Perform ! WritableStreamDefaultControllerClose(stream.[[controller]]).
        self.controller().close_internal();

        // Return promise.
        promise.promise()
    }

    /// WritableStreamAddWriteRequest
    pub(crate) fn add_write_request(&self) -> Promise<()> {
        let promise = ResolveablePromise::new();
        self.inner
            .borrow_mut()
            .write_requests
            .push_back(promise.clone());
        promise.promise()
    }

    /// WritableStreamCloseQueuedOrInFlight
    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        let inner = self.inner.borrow();
        inner.close_request.is_some() || inner.in_flight_close_request.is_some()
    }

    /// WritableStreamHasOperationMarkedInFlight
    pub(crate) fn has_operation_marked_in_flight(&self) -> bool {
        let inner = self.inner.borrow();
        inner.in_flight_write_request.is_some() || inner.in_flight_close_request.is_some()
    }

    pub(crate) fn has_in_flight_write_request(&self) -> bool {
        self.inner.borrow().in_flight_write_request.is_some()
    }

    /// WritableStreamMarkFirstWriteRequestInFlight
    pub(crate) fn mark_first_write_request_in_flight(&self) {
        let mut inner = self.inner.borrow_mut();
        let write_request = inner
            .write_requests
            .pop_front()
            .expect("mark_first_write_request_in_flight called without write requests");
        inner.in_flight_write_request = Some(write_request);
    }

    /// WritableStreamMarkCloseRequestInFlight
    pub(crate) fn mark_close_request_in_flight(&self) {
        let mut inner = self.inner.borrow_mut();
        let close_request = inner
            .close_request
            .take()
            .expect("mark_close_request_in_flight called without close request");
        inner.in_flight_close_request = Some(close_request);
    }

    /// WritableStreamStartErroring
    pub(crate) fn start_erroring(&self, reason: Exception) {
        // Set stream.[[state]] to "erroring".
        // Set stream.[[storedError]] to reason.
        self.inner.borrow_mut().state = WritableStreamState::Erroring(reason.clone());
        debug!("writable stream erroring: {}", reason);

        // If writer is not undefined, perform ! WritableStreamDefaultWriterEnsureReadyPromiseRejected(writer, reason).
        if let Some(writer) = self.writer() {
            writer.ensure_ready_promise_rejected(reason);
        }

        // If ! WritableStreamHasOperationMarkedInFlight(stream) is false and controller.[[started]] is true, perform ! WritableStreamFinishErroring(stream).
        if !self.has_operation_marked_in_flight() && self.controller().started() {
            self.finish_erroring();
        }
    }

    /// WritableStreamFinishErroring
    pub(crate) fn finish_erroring(&self) {
        let (stored_error, write_requests, abort_request) = {
            let mut inner = self.inner.borrow_mut();
            let WritableStreamState::Erroring(stored_error) = inner.state.clone() else {
                return;
            };
            // Set stream.[[state]] to "errored".
            inner.state = WritableStreamState::Errored(stored_error.clone());
            (
                stored_error,
                std::mem::take(&mut inner.write_requests),
                // Let abortRequest be stream.[[pendingAbortRequest]].
                // Set stream.[[pendingAbortRequest]] to undefined.
                inner.pending_abort_request.take(),
            )
        };
        debug!("writable stream errored: {}", stored_error);

        // Perform ! stream.[[controller]].[[ErrorSteps]]().
        self.controller().error_steps();

        // For each writeRequest of stream.[[writeRequests]], reject writeRequest with storedError.
        for write_request in write_requests {
            write_request.reject(stored_error.clone());
        }

        // If stream.[[pendingAbortRequest]] is undefined,
        let Some(abort_request) = abort_request else {
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            self.reject_close_and_closed_promise_if_needed();
            return;
        };

        // If abortRequest’s was already erroring is true,
        if abort_request.was_already_erroring {
            // Reject abortRequest’s promise with storedError.
            abort_request.promise.reject(stored_error);
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            self.reject_close_and_closed_promise_if_needed();
            return;
        }

        // Let promise be ! stream.[[controller]].[[AbortSteps]](abortRequest’s reason).
        let promise = self.controller().abort_steps(abort_request.reason);

        let stream = self.clone();
        upon_promise(promise, move |result| {
            match result {
                // Upon fulfillment of promise, resolve abortRequest’s promise with undefined.
                Ok(()) => abort_request.promise.resolve_undefined(),
                // Upon rejection of promise with reason reason, reject abortRequest’s promise with reason.
                Err(reason) => {
                    trace!("writable stream abort rejected: {}", reason);
                    abort_request.promise.reject(reason)
                },
            }
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            stream.reject_close_and_closed_promise_if_needed();
        });
    }

    /// WritableStreamRejectCloseAndClosedPromiseIfNeeded
    fn reject_close_and_closed_promise_if_needed(&self) {
        let stored_error = self.stored_error().unwrap_or_default();

        // If stream.[[closeRequest]] is not undefined,
        // Reject stream.[[closeRequest]] with stream.[[storedError]].
        // Set stream.[[closeRequest]] to undefined.
        let close_request = self.inner.borrow_mut().close_request.take();
        if let Some(close_request) = close_request {
            close_request.reject(stored_error.clone());
        }

        // If writer is not undefined, reject writer.[[closedPromise]] with stream.[[storedError]].
        if let Some(writer) = self.writer() {
            writer.closed_promise().reject(stored_error);
        }
    }

    /// WritableStreamDealWithRejection
    pub(crate) fn deal_with_rejection(&self, error: Exception) {
        match self.state() {
            // If state is "writable", perform ! WritableStreamStartErroring(stream, error).
            WritableStreamState::Writable => self.start_erroring(error),
            // Perform ! WritableStreamFinishErroring(stream).
            WritableStreamState::Erroring(_) => self.finish_erroring(),
            WritableStreamState::Closed | WritableStreamState::Errored(_) => {
                ctx::report_error(&error)
            },
        }
    }

    /// WritableStreamFinishInFlightWrite
    pub(crate) fn finish_in_flight_write(&self) {
        let write_request = self.inner.borrow_mut().in_flight_write_request.take();
        write_request
            .expect("finish_in_flight_write called without in flight write request")
            .resolve_undefined();
    }

    /// WritableStreamFinishInFlightWriteWithError
    pub(crate) fn finish_in_flight_write_with_error(&self, error: Exception) {
        // Reject stream.[[inFlightWriteRequest]] with error.
        // Set stream.[[inFlightWriteRequest]] to undefined.
        let write_request = self.inner.borrow_mut().in_flight_write_request.take();
        write_request
            .expect("finish_in_flight_write_with_error called without in flight write request")
            .reject(error.clone());

        // Perform ! WritableStreamDealWithRejection(stream, error).
        self.deal_with_rejection(error);
    }

    /// WritableStreamFinishInFlightClose
    pub(crate) fn finish_in_flight_close(&self) {
        let (close_request, abort_request) = {
            let mut inner = self.inner.borrow_mut();
            let close_request = inner
                .in_flight_close_request
                .take()
                .expect("finish_in_flight_close called without in flight close request");
            // If state is "erroring", take stream.[[pendingAbortRequest]].
            let abort_request = match inner.state {
                WritableStreamState::Erroring(_) => inner.pending_abort_request.take(),
                _ => None,
            };
            // Set stream.[[state]] to "closed".
            inner.state = WritableStreamState::Closed;
            (close_request, abort_request)
        };
        trace!("writable stream closed");

        // Resolve stream.[[inFlightCloseRequest]] with undefined.
        close_request.resolve_undefined();

        // Resolve stream.[[pendingAbortRequest]]'s promise with undefined.
        if let Some(abort_request) = abort_request {
            abort_request.promise.resolve_undefined();
        }

        // If writer is not undefined, resolve writer.[[closedPromise]] with undefined.
        if let Some(writer) = self.writer() {
            writer.closed_promise().resolve_undefined();
        }
    }

    /// WritableStreamFinishInFlightCloseWithError
    pub(crate) fn finish_in_flight_close_with_error(&self, error: Exception) {
        let (close_request, abort_request) = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.in_flight_close_request.take().expect(
                    "finish_in_flight_close_with_error called without in flight close request",
                ),
                inner.pending_abort_request.take(),
            )
        };

        // Reject stream.[[inFlightCloseRequest]] with error.
        close_request.reject(error.clone());

        // If stream.[[pendingAbortRequest]] is not undefined, reject its promise with error.
        if let Some(abort_request) = abort_request {
            abort_request.promise.reject(error.clone());
        }

        // Perform ! WritableStreamDealWithRejection(stream, error).
        self.deal_with_rejection(error);
    }

    /// WritableStreamUpdateBackpressure
    pub(crate) fn update_backpressure(&self, backpressure: bool) {
        let changed = self.inner.borrow().backpressure != backpressure;

        // If writer is not undefined and backpressure is not stream.[[backpressure]],
        if changed {
            if let Some(writer) = self.writer() {
                if backpressure {
                    // If backpressure is true, set writer.[[readyPromise]] to a new promise.
                    writer.reset_ready_promise();
                } else {
                    // Otherwise, resolve writer.[[readyPromise]] with undefined.
                    writer.ready_promise().resolve_undefined();
                }
            }
        }

        // Set stream.[[backpressure]] to backpressure.
        self.inner.borrow_mut().backpressure = backpressure;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_test::test_async_with;
    use brook_utils::ctx;

    use super::*;

    #[tokio::test]
    async fn locked_stream_refuses_abort_and_close() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::<u8>::new(UnderlyingSink::new(), QueuingStrategy::new())
                    .unwrap();
                let writer = stream.get_writer().unwrap();
                assert!(stream.locked());
                assert!(stream.get_writer().unwrap_err().is_type_error());
                assert!(stream.abort(Exception::Undefined).await.unwrap_err().is_type_error());
                assert!(stream.close().await.unwrap_err().is_type_error());

                writer.release_lock();
                assert!(!stream.locked());
                stream.close().await.unwrap();
                assert_eq!(stream.state(), WritableStreamState::Closed);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn abort_waits_for_in_flight_write() {
        test_async_with(|| {
            Box::pin(async move {
                let release_write = ResolveablePromise::<()>::new();
                let aborted_with = Rc::new(RefCell::new(None));
                let stream = WritableStream::new(
                    UnderlyingSink::new()
                        .with_write({
                            let release_write = release_write.clone();
                            move |_chunk: u8, _| release_write.promise()
                        })
                        .with_abort({
                            let aborted_with = aborted_with.clone();
                            move |reason| {
                                *aborted_with.borrow_mut() = Some(reason);
                                async { Ok(()) }
                            }
                        }),
                    QueuingStrategy::new(),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                ctx::settle().await;

                let write = writer.write(1);
                let queued = writer.write(2);
                ctx::settle().await;

                let abort = writer.abort(Exception::message("halt"));
                let second_abort = writer.abort(Exception::message("ignored"));
                assert!(abort.ptr_eq(&second_abort));
                ctx::settle().await;
                assert!(aborted_with.borrow().is_none());
                assert!(matches!(stream.state(), WritableStreamState::Erroring(_)));

                release_write.resolve_undefined();
                write.await.unwrap();
                assert_eq!(queued.await.unwrap_err(), Exception::message("halt"));
                abort.await.unwrap();
                assert_eq!(
                    aborted_with.borrow_mut().take(),
                    Some(Exception::message("halt"))
                );
                assert_eq!(
                    writer.closed().await.unwrap_err(),
                    Exception::message("halt")
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn abort_signals_controller() {
        test_async_with(|| {
            Box::pin(async move {
                let signalled = Rc::new(Cell::new(false));
                let stream = WritableStream::<u8>::new(
                    UnderlyingSink::new().with_start({
                        let signalled = signalled.clone();
                        move |controller| {
                            controller
                                .signal()
                                .add_listener(move |_| signalled.set(true));
                            async { Ok(()) }
                        }
                    }),
                    QueuingStrategy::new(),
                )
                .unwrap();

                stream.abort(Exception::Undefined).await.unwrap();
                assert!(signalled.get());
                assert_eq!(
                    stream.controller().signal().reason().and_then(|r| r.dom_name().map(str::to_string)),
                    Some("AbortError".to_string())
                );
                assert_eq!(stream.stored_error(), Some(Exception::Undefined));
            })
        })
        .await;
    }
}
