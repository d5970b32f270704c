// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, fmt, rc::Rc};

use brook_exceptions::{Exception, Result};

use super::{WritableStream, WritableStreamState};
use crate::utils::promise::{Promise, ResolveablePromise};

pub(crate) struct WritableStreamDefaultWriterInner<T: 'static> {
    stream: Option<WritableStream<T>>,
    ready_promise: ResolveablePromise<()>,
    closed_promise: ResolveablePromise<()>,
}

/// A writer holding the exclusive lock on a [`WritableStream`].
pub struct WritableStreamDefaultWriter<T: 'static> {
    pub(crate) inner: Rc<RefCell<WritableStreamDefaultWriterInner<T>>>,
}

impl<T: 'static> fmt::Debug for WritableStreamDefaultWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamDefaultWriter").finish_non_exhaustive()
    }
}

impl<T: 'static> Clone for WritableStreamDefaultWriter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> WritableStreamDefaultWriter<T> {
    /// SetUpWritableStreamDefaultWriter
    pub fn new(stream: &WritableStream<T>) -> Result<Self> {
        // If ! IsWritableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_locked() {
            return Err(Exception::throw_type(
                "This stream has already been locked for exclusive writing by another writer",
            ));
        }

        // Let state be stream.[[state]].
        let (ready_promise, closed_promise) = match stream.state() {
            // If state is "writable",
            WritableStreamState::Writable => {
                // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and stream.[[backpressure]] is true, set writer.[[readyPromise]] to a new promise.
                // Otherwise, set writer.[[readyPromise]] to a promise resolved with undefined.
                let ready_promise =
                    if !stream.close_queued_or_in_flight() && stream.backpressure() {
                        ResolveablePromise::new()
                    } else {
                        ResolveablePromise::resolved_with_undefined()
                    };
                // Set writer.[[closedPromise]] to a new promise.
                (ready_promise, ResolveablePromise::new())
            },
            // Otherwise, if state is "erroring",
            WritableStreamState::Erroring(stored_error) => (
                // Set writer.[[readyPromise]] to a promise rejected with stream.[[storedError]].
                ResolveablePromise::rejected(stored_error),
                // Set writer.[[closedPromise]] to a new promise.
                ResolveablePromise::new(),
            ),
            // Otherwise, if state is "closed",
            WritableStreamState::Closed => (
                ResolveablePromise::resolved_with_undefined(),
                ResolveablePromise::resolved_with_undefined(),
            ),
            // Otherwise, state is "errored".
            WritableStreamState::Errored(stored_error) => (
                ResolveablePromise::rejected(stored_error.clone()),
                ResolveablePromise::rejected(stored_error),
            ),
        };

        // Set writer.[[stream]] to stream.
        // Set stream.[[writer]] to writer.
        let writer = Self {
            inner: Rc::new(RefCell::new(WritableStreamDefaultWriterInner {
                stream: Some(stream.clone()),
                ready_promise,
                closed_promise,
            })),
        };
        stream.set_writer(&writer);

        Ok(writer)
    }

    fn stream(&self) -> Option<WritableStream<T>> {
        self.inner.borrow().stream.clone()
    }

    pub fn closed(&self) -> Promise<()> {
        self.inner.borrow().closed_promise.promise()
    }

    /// Pending while the stream applies backpressure.
    pub fn ready(&self) -> Promise<()> {
        self.inner.borrow().ready_promise.promise()
    }

    /// `None` while erroring or errored, `0` once closed. Fails once the
    /// writer is released.
    pub fn desired_size(&self) -> Result<Option<f64>> {
        // If this.[[stream]] is undefined, throw a TypeError exception.
        let Some(stream) = self.stream() else {
            return Err(Exception::throw_type(
                "Cannot get the desired size of a released writer",
            ));
        };

        // Return ! WritableStreamDefaultWriterGetDesiredSize(this).
        Ok(match stream.state() {
            WritableStreamState::Errored(_) | WritableStreamState::Erroring(_) => None,
            WritableStreamState::Closed => Some(0.0),
            WritableStreamState::Writable => Some(stream.controller().get_desired_size()),
        })
    }

    pub fn abort(&self, reason: impl Into<Exception>) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let Some(stream) = self.stream() else {
            return Promise::rejected(Exception::throw_type(
                "Cannot abort a stream using a released writer",
            ));
        };

        // Return ! WritableStreamDefaultWriterAbort(this, reason).
        stream.writable_stream_abort(reason.into())
    }

    pub fn close(&self) -> Promise<()> {
        // If stream is undefined, return a promise rejected with a TypeError exception.
        let Some(stream) = self.stream() else {
            return Promise::rejected(Exception::throw_type(
                "Cannot close a stream using a released writer",
            ));
        };

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is true, return a promise rejected with a TypeError exception.
        if stream.close_queued_or_in_flight() {
            return Promise::rejected(Exception::throw_type(
                "Cannot close an already-closing stream",
            ));
        }

        // Return ! WritableStreamDefaultWriterClose(this).
        stream.writable_stream_close()
    }

    /// Releasing an already released writer does nothing.
    pub fn release_lock(&self) {
        // If stream is undefined, return.
        if self.stream().is_none() {
            return;
        }

        // Perform ! WritableStreamDefaultWriterRelease(this).
        self.release()
    }

    /// Resolves once the sink accepted `chunk`.
    pub fn write(&self, chunk: T) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let Some(stream) = self.stream() else {
            return Promise::rejected(Exception::throw_type(
                "Cannot write to a stream using a released writer",
            ));
        };

        // Let controller be stream.[[controller]].
        let controller = stream.controller();

        // Let chunkSize be ! WritableStreamDefaultControllerGetChunkSize(controller, chunk).
        let chunk_size = controller.get_chunk_size(&chunk);

        // If stream is not equal to writer.[[stream]], return a promise rejected with a TypeError exception.
        if !self
            .stream()
            .is_some_and(|current| Rc::ptr_eq(&current.inner, &stream.inner))
        {
            return Promise::rejected(Exception::throw_type(
                "Writer was released while computing the chunk size",
            ));
        }

        match stream.state() {
            // If state is "errored", return a promise rejected with stream.[[storedError]].
            // If state is "erroring", return a promise rejected with stream.[[storedError]].
            WritableStreamState::Errored(stored_error)
            | WritableStreamState::Erroring(stored_error) => {
                return Promise::rejected(stored_error)
            },
            // If ! WritableStreamCloseQueuedOrInFlight(stream) is true or state is "closed", return a promise rejected with a TypeError exception indicating that the stream is closing or closed.
            WritableStreamState::Closed => {
                return Promise::rejected(Exception::throw_type(
                    "The stream is closing or closed and cannot be written to",
                ))
            },
            WritableStreamState::Writable if stream.close_queued_or_in_flight() => {
                return Promise::rejected(Exception::throw_type(
                    "The stream is closing or closed and cannot be written to",
                ))
            },
            WritableStreamState::Writable => {},
        }

        // Let promise be ! WritableStreamAddWriteRequest(stream).
        let promise = stream.add_write_request();

        // Perform ! WritableStreamDefaultControllerWrite(controller, chunk, chunkSize).
        controller.write(chunk, chunk_size);

        // Return promise.
        promise
    }

    /// WritableStreamDefaultWriterCloseWithErrorPropagation
    pub(crate) fn close_with_error_propagation(&self) -> Promise<()> {
        let Some(stream) = self.stream() else {
            return Promise::rejected(Exception::throw_type(
                "Cannot close a stream using a released writer",
            ));
        };

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is true or state is "closed", return a promise resolved with undefined.
        if stream.close_queued_or_in_flight() {
            return Promise::resolved(());
        }
        match stream.state() {
            WritableStreamState::Closed => Promise::resolved(()),
            // If state is "errored", return a promise rejected with stream.[[storedError]].
            WritableStreamState::Errored(stored_error) => Promise::rejected(stored_error),
            // Return ! WritableStreamDefaultWriterClose(writer).
            WritableStreamState::Writable | WritableStreamState::Erroring(_) => {
                stream.writable_stream_close()
            },
        }
    }

    /// WritableStreamDefaultWriterRelease
    pub(crate) fn release(&self) {
        let Some(stream) = self.inner.borrow_mut().stream.take() else {
            return;
        };

        // Let releasedError be a new TypeError.
        let released_error = Exception::throw_type("Writer was released");

        // Perform ! WritableStreamDefaultWriterEnsureReadyPromiseRejected(writer, releasedError).
        self.ensure_ready_promise_rejected(released_error.clone());

        // Perform ! WritableStreamDefaultWriterEnsureClosedPromiseRejected(writer, releasedError).
        self.ensure_closed_promise_rejected(released_error);

        // Set stream.[[writer]] to undefined.
        stream.clear_writer();
    }

    pub(crate) fn ready_promise(&self) -> ResolveablePromise<()> {
        self.inner.borrow().ready_promise.clone()
    }

    pub(crate) fn closed_promise(&self) -> ResolveablePromise<()> {
        self.inner.borrow().closed_promise.clone()
    }

    pub(crate) fn reset_ready_promise(&self) {
        self.inner.borrow_mut().ready_promise = ResolveablePromise::new();
    }

    /// WritableStreamDefaultWriterEnsureReadyPromiseRejected
    pub(crate) fn ensure_ready_promise_rejected(&self, error: Exception) {
        let mut inner = self.inner.borrow_mut();
        // If writer.[[readyPromise]].[[PromiseState]] is "pending", reject writer.[[readyPromise]] with error.
        if inner.ready_promise.is_pending() {
            inner.ready_promise.reject(error);
        } else {
            // Otherwise, set writer.[[readyPromise]] to a promise rejected with error.
            inner.ready_promise = ResolveablePromise::rejected(error);
        }
    }

    /// WritableStreamDefaultWriterEnsureClosedPromiseRejected
    fn ensure_closed_promise_rejected(&self, error: Exception) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed_promise.is_pending() {
            inner.closed_promise.reject(error);
        } else {
            inner.closed_promise = ResolveablePromise::rejected(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;
    use brook_utils::ctx;

    use super::*;
    use crate::{queuing_strategy::QueuingStrategy, writable::UnderlyingSink};

    #[tokio::test]
    async fn ready_tracks_backpressure() {
        test_async_with(|| {
            Box::pin(async move {
                let gate = ResolveablePromise::<()>::new();
                let stream = WritableStream::new(
                    UnderlyingSink::new().with_write({
                        let gate = gate.clone();
                        move |_chunk: &'static str, _| gate.promise()
                    }),
                    QueuingStrategy::new(),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                writer.ready().await.unwrap();

                let write = writer.write("x");
                assert!(writer.ready().is_pending());
                assert_eq!(writer.desired_size().unwrap(), Some(0.0));

                gate.resolve_undefined();
                write.await.unwrap();
                ctx::settle().await;
                assert_eq!(writer.ready().try_result(), Some(Ok(())));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn close_waits_for_queued_writes() {
        test_async_with(|| {
            Box::pin(async move {
                let gate = ResolveablePromise::<()>::new();
                let log = Rc::new(RefCell::new(Vec::new()));
                let stream = WritableStream::new(
                    UnderlyingSink::new()
                        .with_write({
                            let gate = gate.clone();
                            let log = log.clone();
                            move |chunk: u8, _| {
                                log.borrow_mut().push(format!("write {chunk}"));
                                gate.promise()
                            }
                        })
                        .with_close({
                            let log = log.clone();
                            move || {
                                log.borrow_mut().push("close".to_string());
                                async { Ok(()) }
                            }
                        }),
                    QueuingStrategy::new(),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                ctx::settle().await;

                let write = writer.write(1);
                let close = writer.close();
                assert!(writer.close().await.unwrap_err().is_type_error());
                assert!(writer.write(2).await.unwrap_err().is_type_error());
                ctx::settle().await;
                assert!(close.is_pending());
                assert_eq!(*log.borrow(), vec!["write 1"]);

                gate.resolve_undefined();
                write.await.unwrap();
                close.await.unwrap();
                writer.closed().await.unwrap();
                assert_eq!(*log.borrow(), vec!["write 1", "close"]);
                assert_eq!(writer.desired_size().unwrap(), Some(0.0));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn released_writer_rejects_everything() {
        test_async_with(|| {
            Box::pin(async move {
                let stream =
                    WritableStream::<u8>::new(UnderlyingSink::new(), QueuingStrategy::new())
                        .unwrap();
                let writer = stream.get_writer().unwrap();
                let closed = writer.closed();
                writer.release_lock();
                writer.release_lock();

                assert!(closed.await.unwrap_err().is_type_error());
                assert!(writer.closed().await.unwrap_err().is_type_error());
                assert!(writer.ready().await.unwrap_err().is_type_error());
                assert!(writer.write(1).await.unwrap_err().is_type_error());
                assert!(writer.close().await.unwrap_err().is_type_error());
                assert!(writer.desired_size().unwrap_err().is_type_error());
                assert!(!stream.locked());
            })
        })
        .await;
    }
}
