// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End to end behaviour through the public API only.

use std::{cell::RefCell, future::pending, rc::Rc};

use brook_exceptions::Exception;
use brook_stream_web::{
    CountQueuingStrategy, QueuingStrategy, ReadableStream, StreamPipeOptions, TransformStream,
    Transformer, UnderlyingSink, UnderlyingSource, WritableStream,
};
use brook_test::test_async_with;
use brook_utils::ctx;

fn recording_sink(written: Rc<RefCell<Vec<String>>>) -> UnderlyingSink<String> {
    UnderlyingSink::new().with_write(move |chunk: String, _| {
        written.borrow_mut().push(chunk);
        async { Ok(()) }
    })
}

fn closing_source(chunks: &'static [&'static str]) -> UnderlyingSource<String> {
    UnderlyingSource::new().with_start(move |controller| {
        let result = chunks
            .iter()
            .try_for_each(|chunk| controller.enqueue(chunk.to_string()))
            .and_then(|()| controller.close());
        async move { result }
    })
}

#[tokio::test]
async fn reads_chunks_in_order_then_done() {
    test_async_with(|| {
        Box::pin(async move {
            let stream = ReadableStream::new(closing_source(&["a", "b"]), QueuingStrategy::new())
                .unwrap();
            let reader = stream.get_reader().unwrap();

            let first = reader.read().await.unwrap();
            assert_eq!((first.value.as_deref(), first.done), (Some("a"), false));
            let second = reader.read().await.unwrap();
            assert_eq!((second.value.as_deref(), second.done), (Some("b"), false));
            let third = reader.read().await.unwrap();
            assert!(third.done);
            assert!(third.value.is_none());
        })
    })
    .await;
}

#[tokio::test]
async fn reads_racing_ahead_of_enqueue_stay_fifo() {
    test_async_with(|| {
        Box::pin(async move {
            let controller = Rc::new(RefCell::new(None));
            let stream = ReadableStream::new(
                UnderlyingSource::new().with_start({
                    let controller = controller.clone();
                    move |c| {
                        *controller.borrow_mut() = Some(c);
                        async { Ok(()) }
                    }
                }),
                CountQueuingStrategy::new(0.0).into(),
            )
            .unwrap();
            let reader = stream.get_reader().unwrap();

            let first = reader.read();
            let second = reader.read();
            let controller = controller.borrow_mut().take().unwrap();
            for chunk in 1..=3 {
                controller.enqueue(chunk).unwrap();
            }
            controller.close().unwrap();

            assert_eq!(first.await.unwrap().value, Some(1));
            assert_eq!(second.await.unwrap().value, Some(2));
            assert_eq!(reader.read().await.unwrap().value, Some(3));
            assert!(reader.read().await.unwrap().done);
        })
    })
    .await;
}

#[tokio::test]
async fn rejected_sink_write_errors_pending_writes() {
    test_async_with(|| {
        Box::pin(async move {
            let stream = WritableStream::new(
                UnderlyingSink::new()
                    .with_write(|_chunk: u32, _| async { Err(Exception::message("disk full")) }),
                CountQueuingStrategy::new(4.0).into(),
            )
            .unwrap();
            let writer = stream.get_writer().unwrap();

            let first = writer.write(1);
            let second = writer.write(2);

            assert_eq!(first.await.unwrap_err(), Exception::message("disk full"));
            assert_eq!(second.await.unwrap_err(), Exception::message("disk full"));
            assert_eq!(
                writer.closed().await.unwrap_err(),
                Exception::message("disk full")
            );
            assert!(writer.write(3).await.is_err());
        })
    })
    .await;
}

#[tokio::test]
async fn close_resolves_after_every_write() {
    test_async_with(|| {
        Box::pin(async move {
            let written = Rc::new(RefCell::new(Vec::new()));
            let stream =
                WritableStream::new(recording_sink(written.clone()), QueuingStrategy::new())
                    .unwrap();
            let writer = stream.get_writer().unwrap();

            let writes = ["x", "y", "z"].map(|chunk| writer.write(chunk.to_string()));
            writer.close().await.unwrap();
            assert_eq!(*written.borrow(), ["x", "y", "z"]);
            for write in writes {
                write.await.unwrap();
            }
            writer.closed().await.unwrap();
        })
    })
    .await;
}

#[tokio::test]
async fn pipe_with_prevent_close_leaves_destination_open() {
    test_async_with(|| {
        Box::pin(async move {
            let written = Rc::new(RefCell::new(Vec::new()));
            let source =
                ReadableStream::new(closing_source(&["1", "2", "3"]), QueuingStrategy::new())
                    .unwrap();
            let destination =
                WritableStream::new(recording_sink(written.clone()), QueuingStrategy::new())
                    .unwrap();

            source
                .pipe_to(&destination, StreamPipeOptions::new().prevent_close(true))
                .await
                .unwrap();

            assert_eq!(*written.borrow(), ["1", "2", "3"]);
            assert!(!source.locked());
            assert!(!destination.locked());

            let writer = destination.get_writer().unwrap();
            writer.write("4".to_string()).await.unwrap();
            assert_eq!(written.borrow().last().map(String::as_str), Some("4"));
        })
    })
    .await;
}

#[tokio::test]
async fn tee_cancels_source_only_after_both_branches() {
    test_async_with(|| {
        Box::pin(async move {
            let canceled = Rc::new(RefCell::new(None));
            // The source stays open so the branches can only finish by canceling.
            let stream = ReadableStream::new(
                UnderlyingSource::new()
                    .with_start(|controller| {
                        let result = controller.enqueue("only".to_string());
                        async move { result }
                    })
                    .with_cancel({
                        let canceled = canceled.clone();
                        move |reason| {
                            *canceled.borrow_mut() = Some(reason);
                            async { Ok(()) }
                        }
                    }),
                QueuingStrategy::new(),
            )
            .unwrap();
            let (branch_1, branch_2) = stream.tee().unwrap();

            let cancel_1 = branch_1.cancel(Exception::message("one"));
            ctx::settle().await;
            assert!(canceled.borrow().is_none());

            let cancel_2 = branch_2.cancel(Exception::message("two"));
            cancel_1.await.unwrap();
            cancel_2.await.unwrap();
            assert_eq!(
                canceled.borrow_mut().take(),
                Some(Exception::List(vec![
                    Exception::message("one"),
                    Exception::message("two"),
                ]))
            );
        })
    })
    .await;
}

#[tokio::test]
async fn canceling_unlocked_stream_never_pulls() {
    test_async_with(|| {
        Box::pin(async move {
            let pulls = Rc::new(RefCell::new(0));
            let stream: ReadableStream<u8> = ReadableStream::new(
                UnderlyingSource::new().with_pull({
                    let pulls = pulls.clone();
                    move |_| {
                        *pulls.borrow_mut() += 1;
                        pending()
                    }
                }),
                CountQueuingStrategy::new(0.0).into(),
            )
            .unwrap();

            stream.cancel(Exception::message("bye")).await.unwrap();
            assert_eq!(*pulls.borrow(), 0);
            assert!(stream.get_reader().unwrap().read().await.unwrap().done);
        })
    })
    .await;
}

#[tokio::test]
async fn transform_pipeline_end_to_end() {
    test_async_with(|| {
        Box::pin(async move {
            let written = Rc::new(RefCell::new(Vec::new()));
            let source = ReadableStream::new(closing_source(&["ab", "c"]), QueuingStrategy::new())
                .unwrap();
            let lengths: TransformStream<String, usize> = TransformStream::new(
                Transformer::new(|chunk: String, controller| {
                    let result = controller.enqueue(chunk.len());
                    async move { result }
                }),
                QueuingStrategy::new(),
                QueuingStrategy::new(),
            )
            .unwrap();
            let destination = WritableStream::new(
                UnderlyingSink::new().with_write({
                    let written = written.clone();
                    move |chunk: usize, _| {
                        written.borrow_mut().push(chunk);
                        async { Ok(()) }
                    }
                }),
                QueuingStrategy::new(),
            )
            .unwrap();

            let readable = source
                .pipe_through(&lengths, StreamPipeOptions::default())
                .unwrap();
            readable
                .pipe_to(&destination, StreamPipeOptions::default())
                .await
                .unwrap();

            assert_eq!(*written.borrow(), [2, 1]);
            assert!(destination.get_writer().unwrap().closed().await.is_ok());
        })
    })
    .await;
}
