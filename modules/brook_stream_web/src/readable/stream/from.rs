// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, future::ready, rc::Rc, task::Poll};

use brook_exceptions::Result;
use futures::{
    future::{poll_fn, AbortHandle, Abortable},
    stream::{self, LocalBoxStream},
    Stream, StreamExt,
};

use super::{
    algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm},
    ReadableStream,
};
use crate::{
    queuing_strategy::SizeAlgorithm, readable::default_controller::ReadableStreamDefaultController,
};

struct FromStreamState<T> {
    stream: Option<LocalBoxStream<'static, Result<T>>>,
    pending_pull: Option<AbortHandle>,
}

impl<T: 'static> ReadableStream<T> {
    /// ReadableStreamFromIterable, for iterators whose items are always
    /// available.
    pub fn from_iterable<I>(iterable: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Self::from_stream(stream::iter(iterable.into_iter().map(Ok)))
    }

    /// Builds a stream that pulls one item from `source` per pull. An `Err`
    /// item errors the stream, exhaustion closes it and canceling drops
    /// `source`. Nothing is read ahead of demand.
    pub fn from_stream<S>(source: S) -> Result<Self>
    where
        S: Stream<Item = Result<T>> + 'static,
    {
        let state = Rc::new(RefCell::new(FromStreamState {
            stream: Some(source.boxed_local()),
            pending_pull: None,
        }));

        let pull_algorithm = PullAlgorithm::from_fn(Box::new({
            let state = state.clone();
            move |controller: ReadableStreamDefaultController<T>| {
                let (abort_handle, abort_registration) = AbortHandle::new_pair();
                state.borrow_mut().pending_pull = Some(abort_handle);

                // Let nextResult be IteratorNext(iteratorRecord).
                let next = poll_fn({
                    let state = state.clone();
                    move |cx| match state.borrow_mut().stream.as_mut() {
                        Some(stream) => stream.poll_next_unpin(cx),
                        None => Poll::Ready(None),
                    }
                });

                Box::pin(async move {
                    let Ok(next) = Abortable::new(next, abort_registration).await else {
                        // canceled while waiting
                        return Ok(());
                    };
                    match next {
                        // Perform ! ReadableStreamDefaultControllerEnqueue(stream.[[controller]], value).
                        Some(Ok(chunk)) => controller.enqueue_internal(chunk),
                        Some(Err(e)) => Err(e),
                        // If done is true, perform ! ReadableStreamDefaultControllerClose(stream.[[controller]]).
                        None => {
                            controller.close_internal();
                            Ok(())
                        },
                    }
                })
            }
        }));

        let cancel_algorithm = CancelAlgorithm::Function(Box::new(move |_reason| {
            let (stream, pending_pull) = {
                let mut state = state.borrow_mut();
                (state.stream.take(), state.pending_pull.take())
            };
            if let Some(pending_pull) = pending_pull {
                pending_pull.abort();
            }
            drop(stream);
            Box::pin(ready(Ok(())))
        }));

        let stream = Self::new_uninitialized();
        ReadableStreamDefaultController::set_up(
            &stream,
            StartAlgorithm::ReturnUndefined,
            pull_algorithm,
            cancel_algorithm,
            0.0,
            SizeAlgorithm::AlwaysOne,
        )?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_exceptions::Exception;
    use brook_test::test_async_with;

    use super::*;

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[tokio::test]
    async fn iterable_is_read_in_order() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::from_iterable(vec![1, 2, 3]).unwrap();
                let reader = stream.get_reader().unwrap();
                for expected in 1..=3 {
                    assert_eq!(reader.read().await.unwrap().value, Some(expected));
                }
                assert!(reader.read().await.unwrap().done);
                reader.closed().await.unwrap();
            })
        })
        .await;
    }

    #[tokio::test]
    async fn failing_item_errors_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let source = stream::iter(vec![Ok(1u32), Err(Exception::message("broken"))]);
                let stream = ReadableStream::from_stream(source).unwrap();
                let reader = stream.get_reader().unwrap();
                assert_eq!(reader.read().await.unwrap().value, Some(1));
                assert_eq!(
                    reader.read().await.unwrap_err(),
                    Exception::message("broken")
                );
                assert_eq!(
                    reader.closed().await.unwrap_err(),
                    Exception::message("broken")
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_drops_source_mid_pull() {
        test_async_with(|| {
            Box::pin(async move {
                let dropped = Rc::new(Cell::new(false));
                let guard = DropFlag(dropped.clone());
                let source = stream::iter(vec![Ok::<_, Exception>(1u32)])
                    .chain(stream::pending())
                    .map(move |item| {
                        let _guard = &guard;
                        item
                    });
                let stream = ReadableStream::from_stream(source).unwrap();
                let reader = stream.get_reader().unwrap();
                assert_eq!(reader.read().await.unwrap().value, Some(1));

                let waiting = reader.read();
                reader.cancel(Exception::message("enough")).await.unwrap();
                assert!(waiting.await.unwrap().done);
                assert!(dropped.get());
            })
        })
        .await;
    }
}
