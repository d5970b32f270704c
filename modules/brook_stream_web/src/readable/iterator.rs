// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    future::poll_fn,
    pin::Pin,
    task::{Context, Poll},
};

use brook_exceptions::{Exception, Result};
use futures::{FutureExt, Stream};

use super::{
    default_reader::{readable_stream_default_reader_read, ReadableStreamDefaultReader},
    reader::{readable_stream_reader_generic_cancel, ReadRequest, ReadRequestSteps},
    ReadableStream,
};
use crate::utils::promise::{once_channel, OncePromise, OnceResolver};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadableStreamIteratorOptions {
    /// Keep the stream alive when iteration stops early.
    pub prevent_cancel: bool,
}

/// Iterates the chunks of a [`ReadableStream`] while holding its reader lock.
///
/// The lock is released once the stream closes or errors, or when
/// [`cancel`](Self::cancel) is called. Also usable as a
/// [`futures::Stream`] of `Result<T>`.
pub struct ReadableStreamAsyncIterator<T: 'static> {
    reader: ReadableStreamDefaultReader<T>,
    prevent_cancel: bool,
    is_finished: bool,
    ongoing: Option<OncePromise<Option<T>>>,
}

impl<T: 'static> ReadableStreamAsyncIterator<T> {
    pub(crate) fn new(
        stream: &ReadableStream<T>,
        options: ReadableStreamIteratorOptions,
    ) -> Result<Self> {
        // Let reader be ? AcquireReadableStreamDefaultReader(stream).
        let reader = ReadableStreamDefaultReader::new(stream)?;
        Ok(Self {
            reader,
            prevent_cancel: options.prevent_cancel,
            is_finished: false,
            ongoing: None,
        })
    }

    /// The next chunk, or `None` once the stream closed. A call after the end
    /// of iteration keeps returning `None`.
    pub async fn next(&mut self) -> Result<Option<T>> {
        poll_fn(|cx| self.poll_step(cx)).await
    }

    /// Stops iterating. Cancels the stream with `reason` unless
    /// `prevent_cancel` was set, then releases the reader.
    pub async fn cancel(&mut self, reason: impl Into<Exception>) -> Result<()> {
        if std::mem::replace(&mut self.is_finished, true) {
            return Ok(());
        }
        // an unfinished read is settled by the release below
        self.ongoing = None;

        // If iterator’s prevent cancel is false:
        if !self.prevent_cancel {
            // Let result be ! ReadableStreamReaderGenericCancel(reader, arg).
            let result = readable_stream_reader_generic_cancel(self.reader.stream(), reason.into());
            // Perform ! ReadableStreamDefaultReaderRelease(reader).
            self.reader.release();
            return result.await;
        }

        self.reader.release();
        Ok(())
    }

    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>>> {
        if self.is_finished && self.ongoing.is_none() {
            return Poll::Ready(Ok(None));
        }

        let ongoing = self.ongoing.get_or_insert_with(|| next_steps(&self.reader));
        let result = match ongoing.poll_unpin(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        self.ongoing = None;

        if !matches!(result, Ok(Some(_))) {
            self.is_finished = true;
        }
        Poll::Ready(result)
    }
}

impl<T: 'static> Stream for ReadableStreamAsyncIterator<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_step(cx).map(Result::transpose)
    }
}

// get the next iteration result steps
fn next_steps<T: 'static>(reader: &ReadableStreamDefaultReader<T>) -> OncePromise<Option<T>> {
    let Some(stream) = reader.stream() else {
        return OncePromise::rejected(Exception::throw_type(
            "Cannot iterate a stream using a released reader",
        ));
    };

    let (resolver, promise) = once_channel();
    readable_stream_default_reader_read(
        &stream,
        ReadRequest::with_steps(IteratorReadRequest {
            reader: reader.clone(),
            resolver,
        }),
    );
    promise
}

struct IteratorReadRequest<T: 'static> {
    reader: ReadableStreamDefaultReader<T>,
    resolver: OnceResolver<Option<T>>,
}

impl<T: 'static> ReadRequestSteps<T> for IteratorReadRequest<T> {
    fn chunk_steps(self: Box<Self>, chunk: T) {
        self.resolver.resolve(Some(chunk))
    }

    fn close_steps(self: Box<Self>) {
        self.reader.release();
        self.resolver.resolve(None)
    }

    fn error_steps(self: Box<Self>, reason: Exception) {
        self.reader.release();
        self.resolver.reject(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use brook_test::test_async_with;
    use futures::StreamExt;

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{ReadableStreamDefaultController, UnderlyingSource},
    };

    #[tokio::test]
    async fn iteration_ends_and_unlocks() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::from_iterable(vec!["a", "b"]).unwrap();
                let mut iterator = stream.values(Default::default()).unwrap();
                assert!(stream.locked());

                assert_eq!(iterator.next().await, Ok(Some("a")));
                assert_eq!(iterator.next().await, Ok(Some("b")));
                assert_eq!(iterator.next().await, Ok(None));
                assert_eq!(iterator.next().await, Ok(None));
                assert!(!stream.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn collects_as_futures_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::from_iterable(1..=4).unwrap();
                let iterator = stream.values(Default::default()).unwrap();
                let chunks: Vec<Result<u32>> = iterator.collect().await;
                assert_eq!(chunks, vec![Ok(1), Ok(2), Ok(3), Ok(4)]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn error_is_reported_once_then_finished() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::<u32>::new(
                    UnderlyingSource::new().with_start(
                        |controller: ReadableStreamDefaultController<u32>| async move {
                            controller.error(Exception::message("bad"));
                            Ok(())
                        },
                    ),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let mut iterator = stream.values(Default::default()).unwrap();

                assert_eq!(iterator.next().await, Err(Exception::message("bad")));
                assert_eq!(iterator.next().await, Ok(None));
                assert!(!stream.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn early_cancel_respects_prevent_cancel() {
        test_async_with(|| {
            Box::pin(async move {
                let reasons = Rc::new(RefCell::new(Vec::new()));
                let make_stream = || {
                    let reasons = reasons.clone();
                    ReadableStream::new(
                        UnderlyingSource::new().with_cancel(move |reason| {
                            reasons.borrow_mut().push(reason);
                            async { Ok(()) }
                        }),
                        QueuingStrategy::<u32>::default(),
                    )
                    .unwrap()
                };

                let canceled = make_stream();
                let mut iterator = canceled.values(Default::default()).unwrap();
                iterator.cancel(Exception::message("stop")).await.unwrap();
                assert!(!canceled.locked());

                let kept = make_stream();
                let mut iterator = kept
                    .values(ReadableStreamIteratorOptions {
                        prevent_cancel: true,
                    })
                    .unwrap();
                iterator.cancel(Exception::message("ignored")).await.unwrap();
                assert!(!kept.locked());
                assert!(kept.get_reader().is_ok());

                assert_eq!(*reasons.borrow(), vec![Exception::message("stop")]);
            })
        })
        .await;
    }
}
