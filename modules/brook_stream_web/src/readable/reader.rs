// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, rc::Rc};

use brook_exceptions::{Exception, Result};
use brook_utils::array_buffer::ArrayBufferView;

use super::{
    byob_reader::{ReadableStreamBYOBReader, ReadableStreamBYOBReaderInner},
    default_reader::{ReadableStreamDefaultReader, ReadableStreamDefaultReaderInner},
    ReadableStream, ReadableStreamState,
};
use crate::utils::promise::{OnceResolver, Promise, ResolveablePromise};

/// Outcome of a single read. `value` is `None` once the stream is done,
/// except for BYOB reads which hand back the (empty) view.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadableStreamReadResult<T> {
    pub value: Option<T>,
    pub done: bool,
}

impl<T> ReadableStreamReadResult<T> {
    pub(crate) fn chunk(value: T) -> Self {
        Self {
            value: Some(value),
            done: false,
        }
    }

    pub(crate) fn done(value: Option<T>) -> Self {
        Self { value, done: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableStreamReaderMode {
    Byob,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReadableStreamGetReaderOptions {
    pub mode: Option<ReadableStreamReaderMode>,
}

/// typedef (ReadableStreamDefaultReader or ReadableStreamBYOBReader) ReadableStreamReader;
pub enum ReadableStreamReader<T: 'static> {
    Default(ReadableStreamDefaultReader<T>),
    Byob(ReadableStreamBYOBReader),
}

impl<T: 'static> ReadableStreamReader<T> {
    pub fn closed(&self) -> Promise<()> {
        match self {
            Self::Default(reader) => reader.closed(),
            Self::Byob(reader) => reader.closed(),
        }
    }

    pub fn cancel(&self, reason: impl Into<Exception>) -> Promise<()> {
        match self {
            Self::Default(reader) => reader.cancel(reason),
            Self::Byob(reader) => reader.cancel(reason),
        }
    }

    pub fn release_lock(&self) -> Result<()> {
        match self {
            Self::Default(reader) => reader.release_lock(),
            Self::Byob(reader) => reader.release_lock(),
        }
    }
}

/// The reader a stream is locked to. The stream owns the reader state, so
/// pending reads outlive the reader handle; the link is dropped on release.
pub(crate) enum ReaderRef<T: 'static> {
    Default(Rc<RefCell<ReadableStreamDefaultReaderInner<T>>>),
    Byob(Rc<RefCell<ReadableStreamBYOBReaderInner>>),
}

impl<T: 'static> Clone for ReaderRef<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Default(reader) => Self::Default(reader.clone()),
            Self::Byob(reader) => Self::Byob(reader.clone()),
        }
    }
}

/// State shared by both reader kinds.
pub(crate) struct ReadableStreamGenericReader<T: 'static> {
    pub(crate) closed_promise: ResolveablePromise<()>,
    pub(crate) stream: Option<ReadableStream<T>>,
}

impl<T: 'static> ReadableStreamGenericReader<T> {
    /// ReadableStreamReaderGenericInitialize, minus the stream side link
    /// which the caller installs once the reader is allocated.
    pub(crate) fn initialize(stream: &ReadableStream<T>) -> Self {
        let closed_promise = match stream.state() {
            // If stream.[[state]] is "readable", set reader.[[closedPromise]] to a new promise.
            ReadableStreamState::Readable => ResolveablePromise::new(),
            // Otherwise, if stream.[[state]] is "closed", set reader.[[closedPromise]] to a promise resolved with undefined.
            ReadableStreamState::Closed => ResolveablePromise::resolved_with_undefined(),
            // Otherwise, set reader.[[closedPromise]] to a promise rejected with stream.[[storedError]].
            ReadableStreamState::Errored(stored_error) => {
                ResolveablePromise::rejected(stored_error)
            },
        };
        Self {
            closed_promise,
            stream: Some(stream.clone()),
        }
    }

    /// ReadableStreamReaderGenericRelease. Returns the stream that was
    /// released.
    pub(crate) fn release(&mut self) -> Option<ReadableStream<T>> {
        // Let stream be reader.[[stream]].
        // Set reader.[[stream]] to undefined.
        let stream = self.stream.take()?;
        let released = Exception::throw_type("Reader was released");

        if matches!(stream.state(), ReadableStreamState::Readable) {
            // If stream.[[state]] is "readable", reject reader.[[closedPromise]] with a TypeError exception.
            self.closed_promise.reject(released);
        } else {
            // Otherwise, set reader.[[closedPromise]] to a promise rejected with a TypeError exception.
            self.closed_promise = ResolveablePromise::rejected(released);
        }

        // Perform ! stream.[[controller]].[[ReleaseSteps]]().
        if let Some(controller) = stream.try_controller() {
            controller.release_steps();
        }

        // Set stream.[[reader]] to undefined.
        stream.inner.borrow_mut().reader = None;
        Some(stream)
    }
}

/// ReadableStreamReaderGenericCancel
pub(crate) fn readable_stream_reader_generic_cancel<T: 'static>(
    stream: Option<ReadableStream<T>>,
    reason: Exception,
) -> Promise<()> {
    match stream {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        None => Promise::rejected(Exception::throw_type(
            "Cannot cancel a stream using a released reader",
        )),
        // Return ! ReadableStreamCancel(stream, reason).
        Some(stream) => stream.readable_stream_cancel(reason),
    }
}

/// Steps run when a read request settles, for internal consumers that must
/// react in the same turn the chunk is handed out.
pub(crate) trait ReadRequestSteps<T> {
    fn chunk_steps(self: Box<Self>, chunk: T);

    fn close_steps(self: Box<Self>);

    fn error_steps(self: Box<Self>, reason: Exception);
}

pub(crate) enum ReadRequest<T> {
    Promise(OnceResolver<ReadableStreamReadResult<T>>),
    Steps(Box<dyn ReadRequestSteps<T>>),
}

impl<T> ReadRequest<T> {
    pub(crate) fn new(resolver: OnceResolver<ReadableStreamReadResult<T>>) -> Self {
        Self::Promise(resolver)
    }

    pub(crate) fn with_steps(steps: impl ReadRequestSteps<T> + 'static) -> Self {
        Self::Steps(Box::new(steps))
    }

    pub(crate) fn chunk_steps(self, chunk: T) {
        match self {
            Self::Promise(resolver) => resolver.resolve(ReadableStreamReadResult::chunk(chunk)),
            Self::Steps(steps) => steps.chunk_steps(chunk),
        }
    }

    pub(crate) fn close_steps(self) {
        match self {
            Self::Promise(resolver) => resolver.resolve(ReadableStreamReadResult::done(None)),
            Self::Steps(steps) => steps.close_steps(),
        }
    }

    pub(crate) fn error_steps(self, reason: Exception) {
        match self {
            Self::Promise(resolver) => resolver.reject(reason),
            Self::Steps(steps) => steps.error_steps(reason),
        }
    }
}

pub(crate) struct ReadIntoRequest {
    resolver: OnceResolver<ReadableStreamReadResult<ArrayBufferView>>,
}

impl ReadIntoRequest {
    pub(crate) fn new(resolver: OnceResolver<ReadableStreamReadResult<ArrayBufferView>>) -> Self {
        Self { resolver }
    }

    pub(crate) fn chunk_steps(self, chunk: ArrayBufferView) {
        self.resolver.resolve(ReadableStreamReadResult::chunk(chunk))
    }

    pub(crate) fn close_steps(self, chunk: Option<ArrayBufferView>) {
        self.resolver.resolve(ReadableStreamReadResult::done(chunk))
    }

    pub(crate) fn error_steps(self, reason: Exception) {
        self.resolver.reject(reason)
    }
}
