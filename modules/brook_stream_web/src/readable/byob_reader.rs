// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use brook_exceptions::{Exception, Result};
use brook_utils::array_buffer::ArrayBufferView;

use super::{
    reader::{
        readable_stream_reader_generic_cancel, ReadIntoRequest, ReadableStreamGenericReader,
        ReadableStreamReadResult, ReaderRef,
    },
    ReadableStream, ReadableStreamState,
};
use crate::utils::promise::{once_channel, OncePromise, Promise};

pub(crate) struct ReadableStreamBYOBReaderInner {
    pub(crate) generic: ReadableStreamGenericReader<ArrayBufferView>,
    pub(crate) read_into_requests: VecDeque<ReadIntoRequest>,
}

/// A reader that fills caller supplied views from a byte stream.
#[derive(Clone)]
pub struct ReadableStreamBYOBReader {
    pub(crate) inner: Rc<RefCell<ReadableStreamBYOBReaderInner>>,
}

impl ReadableStreamBYOBReader {
    /// SetUpReadableStreamBYOBReader
    pub fn new(stream: &ReadableStream<ArrayBufferView>) -> Result<Self> {
        // If ! IsReadableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_locked() {
            return Err(Exception::throw_type(
                "This stream has already been locked for exclusive reading by another reader",
            ));
        }

        // If stream.[[controller]] does not implement ReadableByteStreamController, throw a TypeError exception.
        if stream.controller().as_byte_controller().is_none() {
            return Err(Exception::throw_type(
                "Cannot construct a ReadableStreamBYOBReader for a stream not constructed with a byte source",
            ));
        }

        let inner = Rc::new(RefCell::new(ReadableStreamBYOBReaderInner {
            generic: ReadableStreamGenericReader::initialize(stream),
            read_into_requests: VecDeque::new(),
        }));
        stream.inner.borrow_mut().reader = Some(ReaderRef::Byob(inner.clone()));

        Ok(Self { inner })
    }

    fn stream(&self) -> Option<ReadableStream<ArrayBufferView>> {
        self.inner.borrow().generic.stream.clone()
    }

    /// Fills `view` with as many bytes as are available, resolving with a
    /// new view over the same (transferred) memory.
    pub fn read(&self, view: ArrayBufferView) -> OncePromise<ReadableStreamReadResult<ArrayBufferView>> {
        // If view.[[ByteLength]] is 0, return a promise rejected with a TypeError exception.
        if view.byte_length() == 0 {
            return OncePromise::rejected(Exception::throw_type(
                "view must have non-zero byteLength",
            ));
        }

        // If view.[[ViewedArrayBuffer]].[[ArrayBufferByteLength]] is 0, return a promise rejected with a TypeError exception.
        if view.buffer().byte_length() == 0 {
            return OncePromise::rejected(Exception::throw_type(
                "view's buffer must have non-zero byteLength",
            ));
        }

        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let Some(stream) = self.stream() else {
            return OncePromise::rejected(Exception::throw_type(
                "Cannot read from a stream using a released reader",
            ));
        };

        let (resolver, promise) = once_channel();
        // Perform ! ReadableStreamBYOBReaderRead(this, view, readIntoRequest).
        readable_stream_byob_reader_read(&stream, view, ReadIntoRequest::new(resolver));
        promise
    }

    /// Fails while read requests are outstanding.
    pub fn release_lock(&self) -> Result<()> {
        let inner = self.inner.borrow();
        if inner.generic.stream.is_none() {
            return Ok(());
        }
        if !inner.read_into_requests.is_empty() {
            return Err(Exception::throw_type(
                "Cannot release a reader with pending read requests",
            ));
        }
        drop(inner);

        self.release();
        Ok(())
    }

    /// ReadableStreamBYOBReaderRelease
    pub(crate) fn release(&self) {
        let (released, read_into_requests) = {
            let mut inner = self.inner.borrow_mut();
            let released = inner.generic.release();
            (released, std::mem::take(&mut inner.read_into_requests))
        };
        if released.is_none() {
            return;
        }

        let e = Exception::throw_type("Reader was released");
        for read_into_request in read_into_requests {
            read_into_request.error_steps(e.clone());
        }
    }

    pub fn closed(&self) -> Promise<()> {
        self.inner.borrow().generic.closed_promise.promise()
    }

    pub fn cancel(&self, reason: impl Into<Exception>) -> Promise<()> {
        readable_stream_reader_generic_cancel(self.stream(), reason.into())
    }
}

/// ReadableStreamBYOBReaderRead
fn readable_stream_byob_reader_read(
    stream: &ReadableStream<ArrayBufferView>,
    view: ArrayBufferView,
    read_into_request: ReadIntoRequest,
) {
    // Set stream.[[disturbed]] to true.
    stream.inner.borrow_mut().disturbed = true;

    // If stream.[[state]] is "errored", perform readIntoRequest’s error steps given stream.[[storedError]].
    if let ReadableStreamState::Errored(stored_error) = stream.state() {
        read_into_request.error_steps(stored_error);
        return;
    }

    // Otherwise, perform ! ReadableByteStreamControllerPullInto(stream.[[controller]], view, readIntoRequest).
    match stream.controller().as_byte_controller() {
        Some(controller) => controller.pull_into(view, read_into_request),
        None => read_into_request.error_steps(Exception::throw_type(
            "BYOB reads require a byte stream",
        )),
    }
}
