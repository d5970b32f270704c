// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, future::ready, rc::Rc};

use brook_exceptions::{Exception, Result};
use brook_utils::array_buffer::ArrayBufferView;
use tracing::{debug, trace};

use super::{
    algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm},
    ReadableStream,
};
use crate::{
    queuing_strategy::SizeAlgorithm,
    readable::{
        byte_controller::ReadableByteStreamController,
        default_controller::ReadableStreamDefaultController,
        default_reader::ReadableStreamDefaultReader, reader::ReadableStreamReadResult,
    },
    utils::promise::{upon_promise, AlgorithmFuture, ResolveablePromise},
};

pub(crate) type CloneForBranch2<T> = Rc<dyn Fn(&T) -> Result<T>>;

/// What a tee needs from the controller of each branch.
trait TeeBranch<T>: Clone + 'static {
    fn create(
        stream: &ReadableStream<T>,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
    ) -> Result<Self>;

    fn enqueue_chunk(&self, chunk: T) -> Result<()>;

    fn close_branch(&self);

    fn error_branch(&self, e: Exception);
}

impl<T: 'static> TeeBranch<T> for ReadableStreamDefaultController<T> {
    fn create(
        stream: &ReadableStream<T>,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
    ) -> Result<Self> {
        ReadableStreamDefaultController::set_up(
            stream,
            StartAlgorithm::ReturnUndefined,
            pull_algorithm,
            cancel_algorithm,
            1.0,
            SizeAlgorithm::AlwaysOne,
        )
    }

    fn enqueue_chunk(&self, chunk: T) -> Result<()> {
        self.enqueue_internal(chunk)
    }

    fn close_branch(&self) {
        self.close_internal()
    }

    fn error_branch(&self, e: Exception) {
        self.error_internal(e)
    }
}

impl TeeBranch<ArrayBufferView> for ReadableByteStreamController {
    fn create(
        stream: &ReadableStream<ArrayBufferView>,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
    ) -> Result<Self> {
        ReadableByteStreamController::set_up(
            stream,
            StartAlgorithm::ReturnUndefined,
            pull_algorithm,
            cancel_algorithm,
            0.0,
            None,
        )
    }

    fn enqueue_chunk(&self, chunk: ArrayBufferView) -> Result<()> {
        self.enqueue_internal(chunk)
    }

    fn close_branch(&self) {
        if let Err(e) = self.close_internal() {
            trace!("tee branch failed to close: {}", e);
        }
        // A pending BYOB read on the branch completes as done.
        if let Some(byob_request) = self.byob_request() {
            if let Err(e) = byob_request.respond(0) {
                trace!("tee branch failed to settle BYOB read: {}", e);
            }
        }
    }

    fn error_branch(&self, e: Exception) {
        self.error_internal(e)
    }
}

#[derive(Clone, Copy)]
enum Branch {
    One,
    Two,
}

struct TeeState<C> {
    reading: bool,
    read_again: bool,
    canceled_1: bool,
    canceled_2: bool,
    reason_1: Exception,
    reason_2: Exception,
    branch_1: Option<C>,
    branch_2: Option<C>,
}

struct Tee<T: 'static, C> {
    stream: ReadableStream<T>,
    reader: ReadableStreamDefaultReader<T>,
    clone_for_branch2: CloneForBranch2<T>,
    cancel_promise: ResolveablePromise<()>,
    state: RefCell<TeeState<C>>,
}

impl<T: 'static, C: TeeBranch<T>> Tee<T, C> {
    fn branches(&self) -> (bool, bool, Option<C>, Option<C>) {
        let state = self.state.borrow();
        (
            state.canceled_1,
            state.canceled_2,
            state.branch_1.clone(),
            state.branch_2.clone(),
        )
    }

    fn pull(self: &Rc<Self>) -> AlgorithmFuture {
        {
            let mut state = self.state.borrow_mut();
            // If reading is true,
            if state.reading {
                // Set readAgain to true.
                state.read_again = true;
                // Return a promise resolved with undefined.
                return Box::pin(ready(Ok(())));
            }
            // Set reading to true.
            state.reading = true;
        }

        // Perform ! ReadableStreamDefaultReaderRead(reader, readRequest).
        let tee = self.clone();
        upon_promise(self.reader.read(), move |result| match result {
            Ok(ReadableStreamReadResult {
                value: Some(chunk),
                done: false,
            }) => tee.chunk_steps(chunk),
            Ok(_) => tee.close_steps(),
            Err(_) => tee.state.borrow_mut().reading = false,
        });

        // Return a promise resolved with undefined.
        Box::pin(ready(Ok(())))
    }

    fn chunk_steps(self: &Rc<Self>, chunk: T) {
        // Set readAgain to false.
        self.state.borrow_mut().read_again = false;
        let (canceled_1, canceled_2, branch_1, branch_2) = self.branches();

        let (chunk_1, chunk_2) = match (canceled_1, canceled_2) {
            (false, false) => match (self.clone_for_branch2)(&chunk) {
                Ok(chunk_2) => (Some(chunk), Some(chunk_2)),
                // If cloneResult is an abrupt completion,
                Err(e) => {
                    // Perform ! ReadableStreamDefaultControllerError(branch1.[[controller]], cloneResult.[[Value]]).
                    // Perform ! ReadableStreamDefaultControllerError(branch2.[[controller]], cloneResult.[[Value]]).
                    for branch in [branch_1, branch_2].into_iter().flatten() {
                        branch.error_branch(e.clone());
                    }
                    // Resolve cancelPromise with ! ReadableStreamCancel(stream, cloneResult.[[Value]]).
                    let cancel_result = self.stream.readable_stream_cancel(e);
                    let cancel_promise = self.cancel_promise.clone();
                    upon_promise(cancel_result, move |result| cancel_promise.settle(result));
                    return;
                },
            },
            (false, true) => (Some(chunk), None),
            (true, false) => (None, Some(chunk)),
            (true, true) => (None, None),
        };

        // If canceled1 is false, perform ! ReadableStreamDefaultControllerEnqueue(branch1.[[controller]], chunk1).
        if let (Some(branch), Some(chunk)) = (&branch_1, chunk_1) {
            if let Err(e) = branch.enqueue_chunk(chunk) {
                trace!("tee branch 1 rejected chunk: {}", e);
            }
        }

        // If canceled2 is false, perform ! ReadableStreamDefaultControllerEnqueue(branch2.[[controller]], chunk2).
        if let (Some(branch), Some(chunk)) = (&branch_2, chunk_2) {
            if let Err(e) = branch.enqueue_chunk(chunk) {
                trace!("tee branch 2 rejected chunk: {}", e);
            }
        }

        // Set reading to false.
        // If readAgain is true, perform pullAlgorithm.
        let read_again = {
            let mut state = self.state.borrow_mut();
            state.reading = false;
            state.read_again
        };
        if read_again {
            drop(self.pull());
        }
    }

    fn close_steps(&self) {
        // Set reading to false.
        self.state.borrow_mut().reading = false;
        let (canceled_1, canceled_2, branch_1, branch_2) = self.branches();

        // If canceled1 is false, perform ! ReadableStreamDefaultControllerClose(branch1.[[controller]]).
        if let (false, Some(branch)) = (canceled_1, &branch_1) {
            branch.close_branch();
        }
        // If canceled2 is false, perform ! ReadableStreamDefaultControllerClose(branch2.[[controller]]).
        if let (false, Some(branch)) = (canceled_2, &branch_2) {
            branch.close_branch();
        }
        // If canceled1 is false or canceled2 is false, resolve cancelPromise with undefined.
        if !canceled_1 || !canceled_2 {
            self.cancel_promise.resolve_undefined();
        }
    }

    fn cancel(&self, branch: Branch, reason: Exception) -> AlgorithmFuture {
        let composite_reason = {
            let mut state = self.state.borrow_mut();
            match branch {
                Branch::One => {
                    // Set canceled1 to true.
                    // Set reason1 to reason.
                    state.canceled_1 = true;
                    state.reason_1 = reason;
                },
                Branch::Two => {
                    state.canceled_2 = true;
                    state.reason_2 = reason;
                },
            }

            // If the other branch was canceled as well, combine both reasons.
            (state.canceled_1 && state.canceled_2).then(|| {
                Exception::List(vec![state.reason_1.clone(), state.reason_2.clone()])
            })
        };

        if let Some(composite_reason) = composite_reason {
            debug!("both tee branches canceled, canceling source");
            // Let cancelResult be ! ReadableStreamCancel(stream, compositeReason).
            let cancel_result = self.stream.readable_stream_cancel(composite_reason);
            // Resolve cancelPromise with cancelResult.
            let cancel_promise = self.cancel_promise.clone();
            upon_promise(cancel_result, move |result| cancel_promise.settle(result));
        }

        // Return cancelPromise.
        Box::pin(self.cancel_promise.promise())
    }
}

fn tee<T: 'static, C: TeeBranch<T>>(
    stream: &ReadableStream<T>,
    clone_for_branch2: CloneForBranch2<T>,
) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
    // Let reader be ? AcquireReadableStreamDefaultReader(stream).
    let reader = ReadableStreamDefaultReader::new(stream)?;

    let tee = Rc::new(Tee {
        stream: stream.clone(),
        reader: reader.clone(),
        clone_for_branch2,
        // Let cancelPromise be a new promise.
        cancel_promise: ResolveablePromise::new(),
        state: RefCell::new(TeeState::<C> {
            reading: false,
            read_again: false,
            canceled_1: false,
            canceled_2: false,
            reason_1: Exception::Undefined,
            reason_2: Exception::Undefined,
            branch_1: None,
            branch_2: None,
        }),
    });

    let create_branch = |branch: Branch| -> Result<(ReadableStream<T>, C)> {
        let stream = ReadableStream::new_uninitialized();
        let pull_algorithm = PullAlgorithm::from_fn(Box::new({
            let tee = tee.clone();
            move |_| tee.pull()
        }));
        let cancel_algorithm = CancelAlgorithm::Function(Box::new({
            let tee = tee.clone();
            move |reason| tee.cancel(branch, reason)
        }));
        let controller = C::create(&stream, pull_algorithm, cancel_algorithm)?;
        Ok((stream, controller))
    };

    // Set branch1 to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancel1Algorithm).
    let (branch_1, controller_1) = create_branch(Branch::One)?;
    // Set branch2 to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancel2Algorithm).
    let (branch_2, controller_2) = create_branch(Branch::Two)?;
    {
        let mut state = tee.state.borrow_mut();
        state.branch_1 = Some(controller_1);
        state.branch_2 = Some(controller_2);
    }

    // Upon rejection of reader.[[closedPromise]] with reason r,
    upon_promise(reader.closed(), {
        let tee = tee.clone();
        move |result| {
            let Err(r) = result else {
                return;
            };
            let (canceled_1, canceled_2, branch_1, branch_2) = tee.branches();
            // Perform ! ReadableStreamDefaultControllerError(branch1.[[controller]], r).
            // Perform ! ReadableStreamDefaultControllerError(branch2.[[controller]], r).
            for branch in [branch_1, branch_2].into_iter().flatten() {
                branch.error_branch(r.clone());
            }
            // If canceled1 is false or canceled2 is false, resolve cancelPromise with undefined.
            if !canceled_1 || !canceled_2 {
                tee.cancel_promise.resolve_undefined();
            }
        }
    });

    // Return « branch1, branch2 ».
    Ok((branch_1, branch_2))
}

/// ReadableStreamDefaultTee
pub(crate) fn readable_stream_default_tee<T: 'static>(
    stream: &ReadableStream<T>,
    clone_for_branch2: CloneForBranch2<T>,
) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
    tee::<T, ReadableStreamDefaultController<T>>(stream, clone_for_branch2)
}

/// Tees a byte stream into two byte streams. Every chunk handed to branch
/// two is a copy, so the branches never share memory.
pub(crate) fn readable_byte_stream_tee(
    stream: &ReadableStream<ArrayBufferView>,
) -> Result<(ReadableStream<ArrayBufferView>, ReadableStream<ArrayBufferView>)> {
    tee::<ArrayBufferView, ReadableByteStreamController>(
        stream,
        Rc::new(|chunk: &ArrayBufferView| Ok(ArrayBufferView::from_bytes(chunk.to_vec()))),
    )
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;
    use brook_utils::{array_buffer::ArrayBuffer, ctx};

    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{ReadableStreamBYOBReader, UnderlyingByteSource, UnderlyingSource},
    };

    use super::*;

    fn source_of(chunks: Vec<&'static str>) -> ReadableStream<String> {
        ReadableStream::new(
            UnderlyingSource::new().with_start(move |controller| {
                let result = chunks
                    .into_iter()
                    .try_for_each(|chunk| controller.enqueue(chunk.to_string()))
                    .and_then(|()| controller.close());
                async move { result }
            }),
            QueuingStrategy::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn both_branches_see_every_chunk() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = source_of(vec!["a", "b"]);
                let (branch_1, branch_2) = stream.tee().unwrap();
                assert!(stream.locked());

                let reader_1 = branch_1.get_reader().unwrap();
                let reader_2 = branch_2.get_reader().unwrap();
                for expected in ["a", "b"] {
                    assert_eq!(reader_1.read().await.unwrap().value.as_deref(), Some(expected));
                }
                for expected in ["a", "b"] {
                    assert_eq!(reader_2.read().await.unwrap().value.as_deref(), Some(expected));
                }
                assert!(reader_1.read().await.unwrap().done);
                assert!(reader_2.read().await.unwrap().done);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn failed_clone_errors_both_branches() {
        test_async_with(|| {
            Box::pin(async move {
                let canceled = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    UnderlyingSource::new()
                        .with_start(|controller| {
                            let result = controller.enqueue(1u8);
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
                let (branch_1, branch_2) = stream
                    .tee_with_clone(|_| Err(Exception::message("uncloneable")))
                    .unwrap();

                let reader_1 = branch_1.get_reader().unwrap();
                let reader_2 = branch_2.get_reader().unwrap();
                assert_eq!(
                    reader_1.read().await.unwrap_err(),
                    Exception::message("uncloneable")
                );
                assert_eq!(
                    reader_2.closed().await.unwrap_err(),
                    Exception::message("uncloneable")
                );
                ctx::settle().await;
                assert_eq!(
                    canceled.borrow_mut().take(),
                    Some(Exception::message("uncloneable"))
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn byte_branches_hold_independent_copies() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::new_bytes(
                    UnderlyingByteSource::new().with_start(|controller| {
                        let result = controller
                            .enqueue(ArrayBufferView::from_bytes([1, 2, 3]))
                            .and_then(|()| controller.close());
                        async move { result }
                    }),
                    QueuingStrategy::new(),
                )
                .unwrap();
                let (branch_1, branch_2) = stream.tee().unwrap();

                let reader_1 = branch_1.get_reader().unwrap();
                let chunk_1 = reader_1.read().await.unwrap().value.unwrap();

                let reader_2 = ReadableStreamBYOBReader::new(&branch_2).unwrap();
                let view = ArrayBufferView::uint8(ArrayBuffer::new(8), 0, 8).unwrap();
                let chunk_2 = reader_2.read(view).await.unwrap().value.unwrap();

                assert_eq!(chunk_1.to_vec(), vec![1, 2, 3]);
                assert_eq!(chunk_2.to_vec(), vec![1, 2, 3]);
                assert!(!chunk_1.buffer().ptr_eq(chunk_2.buffer()));

                chunk_1.with_bytes_mut(|bytes| bytes[0] = 9);
                assert_eq!(chunk_2.to_vec(), vec![1, 2, 3]);

                assert!(reader_1.read().await.unwrap().done);
                let view = ArrayBufferView::uint8(ArrayBuffer::new(8), 0, 8).unwrap();
                assert!(reader_2.read(view).await.unwrap().done);
            })
        })
        .await;
    }
}
