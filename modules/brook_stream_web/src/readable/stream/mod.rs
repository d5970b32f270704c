// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, fmt, rc::Rc};

use brook_exceptions::{Exception, Result};
use brook_utils::array_buffer::ArrayBufferView;
use tracing::{debug, trace};

use crate::{
    queuing_strategy::QueuingStrategy,
    readable::{
        byob_reader::ReadableStreamBYOBReader,
        byte_controller::ReadableByteStreamController,
        controller::ReadableStreamControllerRef,
        default_controller::ReadableStreamDefaultController,
        default_reader::ReadableStreamDefaultReader,
        iterator::{ReadableStreamAsyncIterator, ReadableStreamIteratorOptions},
        reader::{
            ReadIntoRequest, ReadRequest, ReadableStreamGetReaderOptions, ReadableStreamReader,
            ReadableStreamReaderMode, ReaderRef,
        },
    },
    readable_writable_pair::ReadableWritablePair,
    utils::promise::{transform_promise, Promise},
    writable::WritableStream,
};

use pipe::StreamPipeOptions;
use source::{UnderlyingByteSource, UnderlyingSource};

pub(crate) mod algorithms;
mod from;
pub(crate) mod pipe;
pub(crate) mod source;
pub(crate) mod tee;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReadableStreamState {
    Readable,
    Closed,
    Errored(Exception),
}

pub(crate) struct ReadableStreamInner<T: 'static> {
    pub(crate) state: ReadableStreamState,
    pub(crate) disturbed: bool,
    pub(crate) reader: Option<ReaderRef<T>>,
    pub(crate) controller: Option<ReadableStreamControllerRef<T>>,
}

/// A source of chunks that consumers pull from through a locked reader.
///
/// Handles are cheap to clone and all refer to the same stream.
pub struct ReadableStream<T: 'static> {
    pub(crate) inner: Rc<RefCell<ReadableStreamInner<T>>>,
}

impl<T: 'static> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state)
            .field("locked", &inner.reader.is_some())
            .field("disturbed", &inner.disturbed)
            .finish()
    }
}

impl<T: 'static> ReadableStream<T> {
    /// Builds a stream driven by `source`. Without a high water mark the
    /// strategy buffers a single chunk.
    pub fn new(source: UnderlyingSource<T>, strategy: QueuingStrategy<T>) -> Result<Self> {
        // Let sizeAlgorithm be ! ExtractSizeAlgorithm(strategy).
        let size_algorithm = strategy.extract_size_algorithm();
        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 1).
        let high_water_mark = strategy.extract_high_water_mark(1.0)?;

        let stream = Self::new_uninitialized();
        // Perform ? SetUpReadableStreamDefaultControllerFromUnderlyingSource(this, underlyingSource, underlyingSourceDict, highWaterMark, sizeAlgorithm).
        ReadableStreamDefaultController::set_up_from_underlying_source(
            &stream,
            source,
            high_water_mark,
            size_algorithm,
        )?;
        Ok(stream)
    }

    /// InitializeReadableStream
    pub(crate) fn new_uninitialized() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ReadableStreamInner {
                state: ReadableStreamState::Readable,
                disturbed: false,
                reader: None,
                controller: None,
            })),
        }
    }

    pub fn locked(&self) -> bool {
        self.is_locked()
    }

    /// Whether a read or cancel was ever attempted.
    pub fn disturbed(&self) -> bool {
        self.inner.borrow().disturbed
    }

    pub fn cancel(&self, reason: impl Into<Exception>) -> Promise<()> {
        // If ! IsReadableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_locked() {
            return Promise::rejected(Exception::throw_type(
                "Cannot cancel a stream that already has a reader",
            ));
        }

        // Return ! ReadableStreamCancel(this, reason).
        self.readable_stream_cancel(reason.into())
    }

    pub fn get_reader(&self) -> Result<ReadableStreamDefaultReader<T>> {
        ReadableStreamDefaultReader::new(self)
    }

    pub fn get_reader_with(
        &self,
        options: ReadableStreamGetReaderOptions,
    ) -> Result<ReadableStreamReader<T>> {
        match options.mode {
            // If options["mode"] does not exist, return ? AcquireReadableStreamDefaultReader(this).
            None => Ok(ReadableStreamReader::Default(self.get_reader()?)),
            // Return ? AcquireReadableStreamBYOBReader(this).
            Some(ReadableStreamReaderMode::Byob) => {
                let byte_stream = self
                    .controller()
                    .as_byte_controller()
                    .and_then(|controller| controller.stream())
                    .ok_or_else(|| {
                        Exception::throw_type(
                            "Cannot construct a ReadableStreamBYOBReader for a stream not constructed with a byte source",
                        )
                    })?;
                Ok(ReadableStreamReader::Byob(ReadableStreamBYOBReader::new(
                    &byte_stream,
                )?))
            },
        }
    }

    /// Splits the stream into two branches that each see every chunk.
    /// Branch two receives copies made with `Clone`.
    pub fn tee(&self) -> Result<(Self, Self)>
    where
        T: Clone,
    {
        self.tee_with_clone(|chunk: &T| Ok(chunk.clone()))
    }

    /// Like [`tee`](Self::tee), but chunks for branch two are produced by
    /// `clone_for_branch2`. A failing copy errors both branches and cancels
    /// the source.
    pub fn tee_with_clone<F>(&self, clone_for_branch2: F) -> Result<(Self, Self)>
    where
        F: Fn(&T) -> Result<T> + 'static,
    {
        // If stream.[[controller]] implements ReadableByteStreamController, return ? ReadableByteStreamTee(stream).
        if let Some(branches) = self.controller().tee_steps() {
            return branches;
        }
        // Return ? ReadableStreamDefaultTee(stream, cloneForBranch2).
        tee::readable_stream_default_tee(self, Rc::new(clone_for_branch2))
    }

    /// Pipes every chunk into `destination`, resolving once both ends have
    /// shut down according to `options`.
    pub fn pipe_to(&self, destination: &WritableStream<T>, options: StreamPipeOptions) -> Promise<()> {
        // If ! IsReadableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_locked() {
            return Promise::rejected(Exception::throw_type(
                "Cannot pipe a locked ReadableStream",
            ));
        }

        // If ! IsWritableStreamLocked(destination) is true, return a promise rejected with a TypeError exception.
        if destination.is_locked() {
            return Promise::rejected(Exception::throw_type(
                "Cannot pipe to a locked WritableStream",
            ));
        }

        pipe::readable_stream_pipe_to(self, destination, options)
    }

    pub fn pipe_through<O: 'static>(
        &self,
        transform: impl Into<ReadableWritablePair<T, O>>,
        options: StreamPipeOptions,
    ) -> Result<ReadableStream<O>> {
        let transform = transform.into();

        // If ! IsReadableStreamLocked(this) is true, throw a TypeError exception.
        if self.is_locked() {
            return Err(Exception::throw_type(
                "Cannot pipe a locked ReadableStream through a transform",
            ));
        }

        // If ! IsWritableStreamLocked(transform["writable"]) is true, throw a TypeError exception.
        if transform.writable.is_locked() {
            return Err(Exception::throw_type(
                "Cannot pipe through a transform whose writable side is locked",
            ));
        }

        // Let promise be ! ReadableStreamPipeTo(this, transform["writable"], options["preventClose"], options["preventAbort"], options["preventCancel"], signal).
        // Set promise.[[PromiseIsHandled]] to true.
        drop(pipe::readable_stream_pipe_to(
            self,
            &transform.writable,
            options,
        ));

        // Return transform["readable"].
        Ok(transform.readable)
    }

    /// Async iteration over the chunks, holding the reader lock meanwhile.
    pub fn values(
        &self,
        options: ReadableStreamIteratorOptions,
    ) -> Result<ReadableStreamAsyncIterator<T>> {
        ReadableStreamAsyncIterator::new(self, options)
    }

    pub(crate) fn state(&self) -> ReadableStreamState {
        self.inner.borrow().state.clone()
    }

    pub(crate) fn is_readable(&self) -> bool {
        matches!(self.inner.borrow().state, ReadableStreamState::Readable)
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.inner.borrow().reader.is_some()
    }

    pub(crate) fn controller(&self) -> ReadableStreamControllerRef<T> {
        self.try_controller()
            .expect("readable stream used before its controller was set up")
    }

    pub(crate) fn try_controller(&self) -> Option<ReadableStreamControllerRef<T>> {
        self.inner.borrow().controller.clone()
    }

    fn reader(&self) -> Option<ReaderRef<T>> {
        self.inner.borrow().reader.clone()
    }

    pub(crate) fn default_reader(&self) -> Option<ReadableStreamDefaultReader<T>> {
        match self.reader()? {
            ReaderRef::Default(inner) => Some(ReadableStreamDefaultReader { inner }),
            ReaderRef::Byob(_) => None,
        }
    }

    pub(crate) fn byob_reader(&self) -> Option<ReadableStreamBYOBReader> {
        match self.reader()? {
            ReaderRef::Byob(inner) => Some(ReadableStreamBYOBReader { inner }),
            ReaderRef::Default(_) => None,
        }
    }

    pub(crate) fn has_default_reader(&self) -> bool {
        matches!(self.reader(), Some(ReaderRef::Default(_)))
    }

    pub(crate) fn has_byob_reader(&self) -> bool {
        matches!(self.reader(), Some(ReaderRef::Byob(_)))
    }

    /// ReadableStreamAddReadRequest
    pub(crate) fn add_read_request(&self, read_request: ReadRequest<T>) {
        match self.default_reader() {
            Some(reader) => reader.inner.borrow_mut().read_requests.push_back(read_request),
            None => read_request.error_steps(Exception::throw_type("Reader was released")),
        }
    }

    /// ReadableStreamFulfillReadRequest
    pub(crate) fn fulfill_read_request(&self, chunk: T, done: bool) {
        let read_request = self
            .default_reader()
            .and_then(|reader| reader.inner.borrow_mut().read_requests.pop_front());
        let Some(read_request) = read_request else {
            return;
        };
        if done {
            read_request.close_steps();
        } else {
            read_request.chunk_steps(chunk);
        }
    }

    pub(crate) fn get_num_read_requests(&self) -> usize {
        self.default_reader()
            .map_or(0, |reader| reader.inner.borrow().read_requests.len())
    }

    /// ReadableStreamAddReadIntoRequest
    pub(crate) fn add_read_into_request(&self, read_into_request: ReadIntoRequest) {
        match self.byob_reader() {
            Some(reader) => reader
                .inner
                .borrow_mut()
                .read_into_requests
                .push_back(read_into_request),
            None => read_into_request.error_steps(Exception::throw_type("Reader was released")),
        }
    }

    /// ReadableStreamFulfillReadIntoRequest
    pub(crate) fn fulfill_read_into_request(&self, chunk: ArrayBufferView, done: bool) {
        let read_into_request = self
            .byob_reader()
            .and_then(|reader| reader.inner.borrow_mut().read_into_requests.pop_front());
        let Some(read_into_request) = read_into_request else {
            return;
        };
        if done {
            read_into_request.close_steps(Some(chunk));
        } else {
            read_into_request.chunk_steps(chunk);
        }
    }

    pub(crate) fn get_num_read_into_requests(&self) -> usize {
        self.byob_reader()
            .map_or(0, |reader| reader.inner.borrow().read_into_requests.len())
    }

    /// ReadableStreamClose
    pub(crate) fn readable_stream_close(&self) {
        // Set stream.[[state]] to "closed".
        self.inner.borrow_mut().state = ReadableStreamState::Closed;
        trace!("readable stream closed");

        match self.reader() {
            // If reader is undefined, return.
            None => {},
            Some(ReaderRef::Default(reader)) => {
                let (closed_promise, read_requests) = {
                    let mut reader = reader.borrow_mut();
                    (
                        reader.generic.closed_promise.clone(),
                        std::mem::take(&mut reader.read_requests),
                    )
                };
                // Resolve reader.[[closedPromise]] with undefined.
                closed_promise.resolve_undefined();
                // If reader implements ReadableStreamDefaultReader, perform the close steps of every read request.
                for read_request in read_requests {
                    read_request.close_steps();
                }
            },
            Some(ReaderRef::Byob(reader)) => {
                let closed_promise = reader.borrow().generic.closed_promise.clone();
                closed_promise.resolve_undefined();
            },
        }
    }

    /// ReadableStreamError
    pub(crate) fn readable_stream_error(&self, e: Exception) {
        // Set stream.[[state]] to "errored".
        // Set stream.[[storedError]] to e.
        self.inner.borrow_mut().state = ReadableStreamState::Errored(e.clone());
        debug!("readable stream errored: {}", e);

        match self.reader() {
            None => {},
            Some(ReaderRef::Default(reader)) => {
                let (closed_promise, read_requests) = {
                    let mut reader = reader.borrow_mut();
                    (
                        reader.generic.closed_promise.clone(),
                        std::mem::take(&mut reader.read_requests),
                    )
                };
                // Reject reader.[[closedPromise]] with e.
                closed_promise.reject(e.clone());
                // Perform ! ReadableStreamDefaultReaderErrorReadRequests(reader, e).
                for read_request in read_requests {
                    read_request.error_steps(e.clone());
                }
            },
            Some(ReaderRef::Byob(reader)) => {
                let (closed_promise, read_into_requests) = {
                    let mut reader = reader.borrow_mut();
                    (
                        reader.generic.closed_promise.clone(),
                        std::mem::take(&mut reader.read_into_requests),
                    )
                };
                closed_promise.reject(e.clone());
                // Perform ! ReadableByteStreamReaderErrorReadIntoRequests(reader, e).
                for read_into_request in read_into_requests {
                    read_into_request.error_steps(e.clone());
                }
            },
        }
    }

    /// ReadableStreamCancel
    pub(crate) fn readable_stream_cancel(&self, reason: Exception) -> Promise<()> {
        // Set stream.[[disturbed]] to true.
        self.inner.borrow_mut().disturbed = true;

        match self.state() {
            // If stream.[[state]] is "closed", return a promise resolved with undefined.
            ReadableStreamState::Closed => return Promise::resolved(()),
            // If stream.[[state]] is "errored", return a promise rejected with stream.[[storedError]].
            ReadableStreamState::Errored(stored_error) => return Promise::rejected(stored_error),
            ReadableStreamState::Readable => {},
        }

        // Perform ! ReadableStreamClose(stream).
        self.readable_stream_close();

        // If reader is not undefined and reader implements ReadableStreamBYOBReader,
        if let Some(reader) = self.byob_reader() {
            // Let readIntoRequests be reader.[[readIntoRequests]].
            // Set reader.[[readIntoRequests]] to an empty list.
            let read_into_requests = std::mem::take(&mut reader.inner.borrow_mut().read_into_requests);
            // For each readIntoRequest of readIntoRequests, perform readIntoRequest’s close steps, given undefined.
            for read_into_request in read_into_requests {
                read_into_request.close_steps(None);
            }
        }

        // Let sourceCancelPromise be ! stream.[[controller]].[[CancelSteps]](reason).
        let source_cancel_promise = self.controller().cancel_steps(reason);

        // Return the result of reacting to sourceCancelPromise with a fulfillment step that returns undefined.
        transform_promise(source_cancel_promise, |result| result)
    }
}

impl ReadableStream<ArrayBufferView> {
    /// Builds a byte stream, which can additionally be read with a
    /// [`ReadableStreamBYOBReader`]. Without a high water mark nothing is
    /// pulled ahead of a read.
    pub fn new_bytes(
        source: UnderlyingByteSource,
        strategy: QueuingStrategy<ArrayBufferView>,
    ) -> Result<Self> {
        // If strategy["size"] exists, throw a RangeError exception.
        if strategy.has_size() {
            return Err(Exception::throw_range(
                "The strategy for a byte stream cannot have a size function",
            ));
        }
        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 0).
        let high_water_mark = strategy.extract_high_water_mark(0.0)?;

        let stream = Self::new_uninitialized();
        // Perform ? SetUpReadableByteStreamControllerFromUnderlyingSource(this, underlyingSource, underlyingSourceDict, highWaterMark).
        ReadableByteStreamController::set_up_from_underlying_source(&stream, source, high_water_mark)?;
        Ok(stream)
    }

    pub fn get_byob_reader(&self) -> Result<ReadableStreamBYOBReader> {
        ReadableStreamBYOBReader::new(self)
    }
}
