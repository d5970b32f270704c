// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use brook_exceptions::{Exception, Result};

use super::{
    reader::{
        readable_stream_reader_generic_cancel, ReadRequest, ReadableStreamGenericReader,
        ReadableStreamReadResult, ReaderRef,
    },
    ReadableStream, ReadableStreamState,
};
use crate::utils::promise::{once_channel, OncePromise, Promise};

pub(crate) struct ReadableStreamDefaultReaderInner<T: 'static> {
    pub(crate) generic: ReadableStreamGenericReader<T>,
    pub(crate) read_requests: VecDeque<ReadRequest<T>>,
}

/// A reader holding the exclusive lock on a [`ReadableStream`], handing out
/// chunks one `read()` at a time.
pub struct ReadableStreamDefaultReader<T: 'static> {
    pub(crate) inner: Rc<RefCell<ReadableStreamDefaultReaderInner<T>>>,
}

impl<T: 'static> fmt::Debug for ReadableStreamDefaultReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultReader").finish_non_exhaustive()
    }
}

impl<T: 'static> Clone for ReadableStreamDefaultReader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> ReadableStreamDefaultReader<T> {
    /// SetUpReadableStreamDefaultReader
    pub fn new(stream: &ReadableStream<T>) -> Result<Self> {
        // If ! IsReadableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_locked() {
            return Err(Exception::throw_type(
                "This stream has already been locked for exclusive reading by another reader",
            ));
        }

        // Perform ! ReadableStreamReaderGenericInitialize(reader, stream).
        // Set reader.[[readRequests]] to a new empty list.
        let inner = Rc::new(RefCell::new(ReadableStreamDefaultReaderInner {
            generic: ReadableStreamGenericReader::initialize(stream),
            read_requests: VecDeque::new(),
        }));
        stream.inner.borrow_mut().reader = Some(ReaderRef::Default(inner.clone()));

        Ok(Self { inner })
    }

    pub(crate) fn stream(&self) -> Option<ReadableStream<T>> {
        self.inner.borrow().generic.stream.clone()
    }

    /// Resolves with the next chunk, or with `done` once the stream closes.
    pub fn read(&self) -> OncePromise<ReadableStreamReadResult<T>> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let Some(stream) = self.stream() else {
            return OncePromise::rejected(Exception::throw_type(
                "Cannot read from a stream using a released reader",
            ));
        };

        let (resolver, promise) = once_channel();
        readable_stream_default_reader_read(&stream, ReadRequest::new(resolver));
        promise
    }

    /// Fails while read requests are outstanding.
    pub fn release_lock(&self) -> Result<()> {
        let inner = self.inner.borrow();
        // If this.[[stream]] is undefined, return.
        if inner.generic.stream.is_none() {
            return Ok(());
        }
        if !inner.read_requests.is_empty() {
            return Err(Exception::throw_type(
                "Cannot release a reader with pending read requests",
            ));
        }
        drop(inner);

        self.release();
        Ok(())
    }

    /// ReadableStreamDefaultReaderRelease; outstanding reads are rejected.
    pub(crate) fn release(&self) {
        let (released, read_requests) = {
            let mut inner = self.inner.borrow_mut();
            let released = inner.generic.release();
            (released, std::mem::take(&mut inner.read_requests))
        };
        if released.is_none() {
            return;
        }

        // Let e be a new TypeError exception.
        let e = Exception::throw_type("Reader was released");
        // Perform ! ReadableStreamDefaultReaderErrorReadRequests(reader, e).
        for read_request in read_requests {
            read_request.error_steps(e.clone());
        }
    }

    pub fn closed(&self) -> Promise<()> {
        self.inner.borrow().generic.closed_promise.promise()
    }

    pub fn cancel(&self, reason: impl Into<Exception>) -> Promise<()> {
        readable_stream_reader_generic_cancel(self.stream(), reason.into())
    }
}

/// ReadableStreamDefaultReaderRead
pub(crate) fn readable_stream_default_reader_read<T: 'static>(
    stream: &ReadableStream<T>,
    read_request: ReadRequest<T>,
) {
    // Set stream.[[disturbed]] to true.
    stream.inner.borrow_mut().disturbed = true;

    match stream.state() {
        // If stream.[[state]] is "closed", perform readRequest’s close steps.
        ReadableStreamState::Closed => read_request.close_steps(),
        // Otherwise, if stream.[[state]] is "errored", perform readRequest’s error steps given stream.[[storedError]].
        ReadableStreamState::Errored(stored_error) => read_request.error_steps(stored_error),
        // Otherwise, perform ! stream.[[controller]].[[PullSteps]](readRequest).
        ReadableStreamState::Readable => stream.controller().pull_steps(read_request),
    }
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;

    use crate::{
        queuing_strategy::CountQueuingStrategy,
        readable::{ReadableStreamDefaultController, UnderlyingSource},
    };

    use super::*;

    fn stream_without_buffer() -> (ReadableStream<u32>, ReadableStreamDefaultController<u32>) {
        let slot = Rc::new(RefCell::new(None));
        let stream = ReadableStream::new(
            UnderlyingSource::new().with_start({
                let slot = slot.clone();
                move |controller| {
                    *slot.borrow_mut() = Some(controller);
                    async { Ok(()) }
                }
            }),
            CountQueuingStrategy::new(0.0).into(),
        )
        .unwrap();
        let controller = slot.borrow_mut().take().unwrap();
        (stream, controller)
    }

    #[tokio::test]
    async fn pending_read_outlives_dropped_reader() {
        test_async_with(|| {
            Box::pin(async move {
                let (stream, controller) = stream_without_buffer();
                let pending = {
                    let reader = stream.get_reader().unwrap();
                    reader.read()
                };

                controller.enqueue(7).unwrap();
                let result = pending.await.unwrap();
                assert_eq!((result.value, result.done), (Some(7), false));
                assert!(stream.locked());
                assert_eq!(controller.desired_size(), Some(0.0));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn release_lock_refuses_pending_reads() {
        test_async_with(|| {
            Box::pin(async move {
                let (stream, controller) = stream_without_buffer();
                let reader = stream.get_reader().unwrap();
                let pending = reader.read();

                assert!(reader.release_lock().unwrap_err().is_type_error());
                assert!(stream.locked());

                controller.enqueue(1).unwrap();
                assert_eq!(pending.await.unwrap().value, Some(1));

                reader.release_lock().unwrap();
                assert!(!stream.locked());
                assert!(reader.closed().await.unwrap_err().is_type_error());
                assert!(reader.read().await.unwrap_err().is_type_error());
                assert!(stream.get_reader().is_ok());
            })
        })
        .await;
    }
}
