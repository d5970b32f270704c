// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

use brook_exceptions::{Exception, Result};
use brook_utils::array_buffer::{copy_data_block_bytes, ArrayBuffer, ArrayBufferView, ViewKind};
use tracing::trace;

use super::{
    controller::ReadableStreamControllerSteps,
    reader::{ReadIntoRequest, ReadRequest},
    stream::{
        algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm},
        source::UnderlyingByteSource,
        tee::readable_byte_stream_tee,
        ReadableStreamInner,
    },
    ReadableStream, ReadableStreamState,
};
use crate::utils::{
    promise::{upon_promise, AlgorithmFuture},
    queue::Queue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderType {
    Default,
    Byob,
    None,
}

/// A destination buffer being filled on behalf of a pending read.
#[derive(Debug)]
struct PullIntoDescriptor {
    buffer: ArrayBuffer,
    buffer_byte_length: usize,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    element_size: usize,
    view_kind: ViewKind,
    reader_type: ReaderType,
}

impl PullIntoDescriptor {
    /// ReadableByteStreamControllerConvertPullIntoDescriptor
    fn convert(&self) -> Result<ArrayBufferView> {
        ArrayBufferView::new(
            self.view_kind,
            self.buffer.clone(),
            self.byte_offset,
            self.bytes_filled / self.element_size,
        )
    }
}

struct ReadableByteStreamQueueEntry {
    buffer: ArrayBuffer,
    byte_offset: usize,
    byte_length: usize,
}

pub(crate) struct ReadableByteStreamControllerInner {
    stream: Weak<RefCell<ReadableStreamInner<ArrayBufferView>>>,
    auto_allocate_chunk_size: Option<usize>,
    byob_request: Option<ReadableStreamBYOBRequest>,
    cancel_algorithm: Option<CancelAlgorithm>,
    pull_algorithm: Option<PullAlgorithm<ReadableByteStreamController>>,
    close_requested: bool,
    pull_again: bool,
    pulling: bool,
    started: bool,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    queue: Queue<ReadableByteStreamQueueEntry>,
    queue_total_size: usize,
    strategy_hwm: f64,
}

/// The handle a byte source uses to feed its stream, either by enqueuing
/// views or by filling the buffer of the current [`ReadableStreamBYOBRequest`].
#[derive(Clone)]
pub struct ReadableByteStreamController {
    inner: Rc<RefCell<ReadableByteStreamControllerInner>>,
}

impl ReadableByteStreamController {
    pub(crate) fn set_up_from_underlying_source(
        stream: &ReadableStream<ArrayBufferView>,
        source: UnderlyingByteSource,
        high_water_mark: f64,
    ) -> Result<Self> {
        // Let autoAllocateChunkSize be underlyingSourceDict["autoAllocateChunkSize"], if it exists, or undefined otherwise.
        let auto_allocate_chunk_size = source.auto_allocate_chunk_size;
        // If autoAllocateChunkSize is 0, then throw a TypeError exception.
        if auto_allocate_chunk_size == Some(0) {
            return Err(Exception::throw_type(
                "autoAllocateChunkSize must be greater than 0",
            ));
        }

        let (start_algorithm, pull_algorithm, cancel_algorithm) = source.into_algorithms();
        Self::set_up(
            stream,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            auto_allocate_chunk_size,
        )
    }

    /// SetUpReadableByteStreamController
    pub(crate) fn set_up(
        stream: &ReadableStream<ArrayBufferView>,
        start_algorithm: StartAlgorithm<Self>,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        auto_allocate_chunk_size: Option<usize>,
    ) -> Result<Self> {
        let controller = Self {
            inner: Rc::new(RefCell::new(ReadableByteStreamControllerInner {
                stream: Rc::downgrade(&stream.inner),
                auto_allocate_chunk_size,
                byob_request: None,
                cancel_algorithm: Some(cancel_algorithm),
                pull_algorithm: Some(pull_algorithm),
                close_requested: false,
                pull_again: false,
                pulling: false,
                started: false,
                pending_pull_intos: VecDeque::new(),
                queue: Queue::new(),
                queue_total_size: 0,
                strategy_hwm: high_water_mark,
            })),
        };

        // Set stream.[[controller]] to controller.
        stream.inner.borrow_mut().controller = Some(Rc::new(controller.clone()));

        let start_promise = start_algorithm.call(controller.clone());
        upon_promise(start_promise, {
            let controller = controller.clone();
            move |result| match result {
                Ok(()) => {
                    controller.inner.borrow_mut().started = true;
                    controller.call_pull_if_needed();
                },
                Err(r) => controller.error_internal(r),
            }
        });

        Ok(controller)
    }

    pub(crate) fn stream(&self) -> Option<ReadableStream<ArrayBufferView>> {
        self.inner
            .borrow()
            .stream
            .upgrade()
            .map(|inner| ReadableStream { inner })
    }

    /// The request describing the buffer of the oldest pending read, if any.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        let mut inner = self.inner.borrow_mut();
        // If controller.[[byobRequest]] is null and controller.[[pendingPullIntos]] is not empty,
        if inner.byob_request.is_none() {
            let first = inner.pending_pull_intos.front()?;
            // Let view be ! Construct(%Uint8Array%, « firstDescriptor’s buffer, firstDescriptor’s byte offset + firstDescriptor’s bytes filled, firstDescriptor’s byte length − firstDescriptor’s bytes filled »).
            let view = ArrayBufferView::uint8(
                first.buffer.clone(),
                first.byte_offset + first.bytes_filled,
                first.byte_length - first.bytes_filled,
            )
            .ok()?;
            inner.byob_request = Some(ReadableStreamBYOBRequest::new(self.clone(), view));
        }
        inner.byob_request.clone()
    }

    pub fn desired_size(&self) -> Option<f64> {
        let stream = self.stream()?;
        match stream.state() {
            ReadableStreamState::Errored(_) => None,
            ReadableStreamState::Closed => Some(0.0),
            ReadableStreamState::Readable => {
                let inner = self.inner.borrow();
                Some(inner.strategy_hwm - inner.queue_total_size as f64)
            },
        }
    }

    pub fn close(&self) -> Result<()> {
        // If this.[[closeRequested]] is true, throw a TypeError exception.
        if self.inner.borrow().close_requested {
            return Err(Exception::throw_type("close() called more than once"));
        }

        // If this.[[stream]].[[state]] is not "readable", throw a TypeError exception.
        if !self.is_readable() {
            return Err(Exception::throw_type(
                "The stream is not in a state that permits close",
            ));
        }

        // Perform ? ReadableByteStreamControllerClose(this).
        self.close_internal()
    }

    /// Enqueues `chunk`, detaching its buffer.
    pub fn enqueue(&self, chunk: ArrayBufferView) -> Result<()> {
        // If chunk.[[ByteLength]] is 0, throw a TypeError exception.
        if chunk.byte_length() == 0 {
            return Err(Exception::throw_type("chunk must have non-zero byteLength"));
        }

        // If chunk.[[ViewedArrayBuffer]].[[ArrayBufferByteLength]] is 0, throw a TypeError exception.
        if chunk.buffer().byte_length() == 0 {
            return Err(Exception::throw_type(
                "chunk's buffer must have non-zero byteLength",
            ));
        }

        // If this.[[closeRequested]] is true, throw a TypeError exception.
        if self.inner.borrow().close_requested {
            return Err(Exception::throw_type("stream is closed or draining"));
        }

        // If this.[[stream]].[[state]] is not "readable", throw a TypeError exception.
        if !self.is_readable() {
            return Err(Exception::throw_type(
                "The stream is not in a state that permits enqueue",
            ));
        }

        // Return ? ReadableByteStreamControllerEnqueue(this, chunk).
        self.enqueue_internal(chunk)
    }

    pub fn error(&self, e: impl Into<Exception>) {
        self.error_internal(e.into())
    }

    fn is_readable(&self) -> bool {
        self.stream().is_some_and(|stream| stream.is_readable())
    }

    /// ReadableByteStreamControllerEnqueue
    pub(crate) fn enqueue_internal(&self, chunk: ArrayBufferView) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If controller.[[closeRequested]] is true or stream.[[state]] is not "readable", return.
        if self.inner.borrow().close_requested || !stream.is_readable() {
            return Ok(());
        }

        // Let buffer be chunk.[[ViewedArrayBuffer]].
        // Let byteOffset be chunk.[[ByteOffset]].
        // Let byteLength be chunk.[[ByteLength]].
        let (byte_offset, byte_length) = (chunk.byte_offset(), chunk.byte_length());

        // If ! IsDetachedBuffer(buffer) is true, throw a TypeError exception.
        // Let transferredBuffer be ? TransferArrayBuffer(buffer).
        let transferred_buffer = chunk.buffer().transfer()?;

        // If controller.[[pendingPullIntos]] is not empty,
        let first_reader_type = {
            let mut inner = self.inner.borrow_mut();
            match inner.pending_pull_intos.front_mut() {
                None => None,
                Some(first) => {
                    // If ! IsDetachedBuffer(firstPendingPullInto’s buffer) is true, throw a TypeError exception.
                    // Set firstPendingPullInto’s buffer to ! TransferArrayBuffer(firstPendingPullInto’s buffer).
                    first.buffer = first.buffer.transfer().map_err(|_| {
                        Exception::throw_type(
                            "The BYOB request's buffer has been detached and so cannot be filled with an enqueued chunk",
                        )
                    })?;
                    Some(first.reader_type)
                },
            }
        };

        if first_reader_type.is_some() {
            // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
            self.invalidate_byob_request();
        }

        // If firstPendingPullInto’s reader type is "none", perform ? ReadableByteStreamControllerEnqueueDetachedPullIntoToQueue(controller, firstPendingPullInto).
        if first_reader_type == Some(ReaderType::None) {
            self.enqueue_detached_pull_into_to_queue()?;
        }

        // If ! ReadableStreamHasDefaultReader(stream) is true,
        if stream.has_default_reader() {
            // Perform ! ReadableByteStreamControllerProcessReadRequestsUsingQueue(controller).
            self.process_read_requests_using_queue(&stream);

            // If ! ReadableStreamGetNumReadRequests(stream) is 0,
            if stream.get_num_read_requests() == 0 {
                // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
                self.enqueue_chunk_to_queue(transferred_buffer, byte_offset, byte_length);
            } else {
                // If controller.[[pendingPullIntos]] is not empty,
                // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                self.shift_pending_pull_into();

                // Let transferredView be ! Construct(%Uint8Array%, « transferredBuffer, byteOffset, byteLength »).
                let transferred_view =
                    ArrayBufferView::uint8(transferred_buffer, byte_offset, byte_length)?;

                // Perform ! ReadableStreamFulfillReadRequest(stream, transferredView, false).
                stream.fulfill_read_request(transferred_view, false);
            }
        } else if stream.has_byob_reader() {
            // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
            self.enqueue_chunk_to_queue(transferred_buffer, byte_offset, byte_length);
            // Let filledPullIntos be the result of performing ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
            let filled_pull_intos = self.process_pull_into_descriptors_using_queue();
            // For each filledPullInto of filledPullIntos, perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(stream, filledPullInto).
            for filled_pull_into in filled_pull_intos {
                self.commit_pull_into_descriptor(&stream, filled_pull_into);
            }
        } else {
            self.enqueue_chunk_to_queue(transferred_buffer, byte_offset, byte_length);
        }

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.call_pull_if_needed();
        Ok(())
    }

    /// ReadableByteStreamControllerClose
    pub(crate) fn close_internal(&self) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If controller.[[closeRequested]] is true or stream.[[state]] is not "readable", return.
        if self.inner.borrow().close_requested || !stream.is_readable() {
            return Ok(());
        }

        let partially_filled = {
            let mut inner = self.inner.borrow_mut();
            // If controller.[[queueTotalSize]] > 0,
            if inner.queue_total_size > 0 {
                // Set controller.[[closeRequested]] to true.
                inner.close_requested = true;
                return Ok(());
            }

            inner
                .pending_pull_intos
                .front()
                .is_some_and(|first| first.bytes_filled > 0)
        };

        // If controller.[[pendingPullIntos]] is not empty and its first descriptor holds bytes that were never delivered, error the stream.
        if partially_filled {
            let e = Exception::throw_type("Insufficient bytes to fill elements in the given buffer");
            self.error_internal(e.clone());
            return Err(e);
        }

        // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
        self.clear_algorithms();
        // Perform ! ReadableStreamClose(stream).
        stream.readable_stream_close();
        Ok(())
    }

    /// ReadableByteStreamControllerError
    pub(crate) fn error_internal(&self, e: Exception) {
        let Some(stream) = self.stream() else {
            return;
        };

        // If stream.[[state]] is not "readable", return.
        if !stream.is_readable() {
            return;
        }

        // Perform ! ReadableByteStreamControllerClearPendingPullIntos(controller).
        self.clear_pending_pull_intos();

        // Perform ! ResetQueue(controller).
        self.reset_queue();

        // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
        self.clear_algorithms();

        // Perform ! ReadableStreamError(stream, e).
        stream.readable_stream_error(e);
    }

    /// ReadableByteStreamControllerCallPullIfNeeded
    fn call_pull_if_needed(&self) {
        if !self.should_call_pull() {
            return;
        }

        let pull_algorithm = {
            let mut inner = self.inner.borrow_mut();
            if inner.pulling {
                inner.pull_again = true;
                return;
            }
            inner.pulling = true;
            inner.pull_algorithm.clone()
        };
        let Some(pull_algorithm) = pull_algorithm else {
            self.inner.borrow_mut().pulling = false;
            return;
        };

        let pull_promise = pull_algorithm.call(self.clone());

        let controller = self.clone();
        upon_promise(pull_promise, move |result| match result {
            Ok(()) => {
                let pull_again = {
                    let mut inner = controller.inner.borrow_mut();
                    inner.pulling = false;
                    std::mem::take(&mut inner.pull_again)
                };
                if pull_again {
                    controller.call_pull_if_needed();
                }
            },
            Err(e) => {
                trace!("byte stream pull rejected: {}", e);
                controller.error_internal(e);
            },
        });
    }

    /// ReadableByteStreamControllerShouldCallPull
    fn should_call_pull(&self) -> bool {
        let Some(stream) = self.stream() else {
            return false;
        };

        // If stream.[[state]] is not "readable", return false.
        if !stream.is_readable() {
            return false;
        }

        {
            let inner = self.inner.borrow();
            // If controller.[[closeRequested]] is true, return false.
            // If controller.[[started]] is false, return false.
            if inner.close_requested || !inner.started {
                return false;
            }
        }

        // If ! ReadableStreamHasDefaultReader(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, return true.
        if stream.has_default_reader() && stream.get_num_read_requests() > 0 {
            return true;
        }

        // If ! ReadableStreamHasBYOBReader(stream) is true and ! ReadableStreamGetNumReadIntoRequests(stream) > 0, return true.
        if stream.has_byob_reader() && stream.get_num_read_into_requests() > 0 {
            return true;
        }

        // Let desiredSize be ! ReadableByteStreamControllerGetDesiredSize(controller).
        // If desiredSize > 0, return true.
        self.desired_size()
            .is_some_and(|desired_size| desired_size > 0.0)
    }

    /// ReadableByteStreamControllerClearAlgorithms
    fn clear_algorithms(&self) {
        let _algorithms = {
            let mut inner = self.inner.borrow_mut();
            (inner.pull_algorithm.take(), inner.cancel_algorithm.take())
        };
    }

    /// ReadableByteStreamControllerClearPendingPullIntos
    fn clear_pending_pull_intos(&self) {
        self.invalidate_byob_request();
        self.inner.borrow_mut().pending_pull_intos.clear();
    }

    /// ReadableByteStreamControllerInvalidateBYOBRequest
    fn invalidate_byob_request(&self) {
        let byob_request = self.inner.borrow_mut().byob_request.take();
        if let Some(byob_request) = byob_request {
            let mut request = byob_request.inner.borrow_mut();
            request.controller = None;
            request.view = None;
        }
    }

    fn reset_queue(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.queue.clear();
        inner.queue_total_size = 0;
    }

    /// ReadableByteStreamControllerEnqueueChunkToQueue
    fn enqueue_chunk_to_queue(&self, buffer: ArrayBuffer, byte_offset: usize, byte_length: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.queue.push(ReadableByteStreamQueueEntry {
            buffer,
            byte_offset,
            byte_length,
        });
        inner.queue_total_size += byte_length;
    }

    /// ReadableByteStreamControllerEnqueueClonedChunkToQueue
    fn enqueue_cloned_chunk_to_queue(
        &self,
        buffer: &ArrayBuffer,
        byte_offset: usize,
        byte_length: usize,
    ) -> Result<()> {
        // Let cloneResult be CloneArrayBuffer(buffer, byteOffset, byteLength, %ArrayBuffer%).
        match buffer.slice(byte_offset, byte_length) {
            Ok(clone) => {
                self.enqueue_chunk_to_queue(clone, 0, byte_length);
                Ok(())
            },
            // If cloneResult is an abrupt completion,
            Err(e) => {
                self.error_internal(e.clone());
                Err(e)
            },
        }
    }

    /// ReadableByteStreamControllerEnqueueDetachedPullIntoToQueue, for the
    /// first pending descriptor.
    fn enqueue_detached_pull_into_to_queue(&self) -> Result<()> {
        let filled = {
            let inner = self.inner.borrow();
            inner
                .pending_pull_intos
                .front()
                .filter(|descriptor| descriptor.bytes_filled > 0)
                .map(|descriptor| {
                    (
                        descriptor.buffer.clone(),
                        descriptor.byte_offset,
                        descriptor.bytes_filled,
                    )
                })
        };

        // If pullIntoDescriptor’s bytes filled > 0, perform ? ReadableByteStreamControllerEnqueueClonedChunkToQueue(controller, pullIntoDescriptor’s buffer, pullIntoDescriptor’s byte offset, pullIntoDescriptor’s bytes filled).
        if let Some((buffer, byte_offset, bytes_filled)) = filled {
            self.enqueue_cloned_chunk_to_queue(&buffer, byte_offset, bytes_filled)?;
        }

        // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
        self.shift_pending_pull_into();
        Ok(())
    }

    /// ReadableByteStreamControllerShiftPendingPullInto
    fn shift_pending_pull_into(&self) -> Option<PullIntoDescriptor> {
        self.inner.borrow_mut().pending_pull_intos.pop_front()
    }

    /// ReadableByteStreamControllerProcessReadRequestsUsingQueue
    fn process_read_requests_using_queue(&self, stream: &ReadableStream<ArrayBufferView>) {
        let Some(reader) = stream.default_reader() else {
            return;
        };

        loop {
            // If controller.[[queueTotalSize]] is 0, return.
            if self.inner.borrow().queue_total_size == 0 {
                return;
            }

            // Let readRequest be reader.[[readRequests]][0].
            // Remove readRequest from reader.[[readRequests]].
            let read_request = reader.inner.borrow_mut().read_requests.pop_front();
            let Some(read_request) = read_request else {
                return;
            };

            // Perform ! ReadableByteStreamControllerFillReadRequestFromQueue(controller, readRequest).
            self.fill_read_request_from_queue(read_request);
        }
    }

    /// ReadableByteStreamControllerFillReadRequestFromQueue
    fn fill_read_request_from_queue(&self, read_request: ReadRequest<ArrayBufferView>) {
        // Let entry be controller.[[queue]][0].
        // Remove entry from controller.[[queue]].
        let entry = {
            let mut inner = self.inner.borrow_mut();
            let entry = inner
                .queue
                .shift()
                .expect("byte queue holds an entry when its total size is positive");
            // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] − entry’s byte length.
            inner.queue_total_size -= entry.byte_length;
            entry
        };

        // Perform ! ReadableByteStreamControllerHandleQueueDrain(controller).
        self.handle_queue_drain();

        // Let view be ! Construct(%Uint8Array%, « entry’s buffer, entry’s byte offset, entry’s byte length »).
        match ArrayBufferView::uint8(entry.buffer, entry.byte_offset, entry.byte_length) {
            // Perform readRequest’s chunk steps, given view.
            Ok(view) => read_request.chunk_steps(view),
            Err(e) => read_request.error_steps(e),
        }
    }

    /// ReadableByteStreamControllerHandleQueueDrain
    fn handle_queue_drain(&self) {
        let drained_after_close = {
            let inner = self.inner.borrow();
            inner.queue_total_size == 0 && inner.close_requested
        };

        // If controller.[[queueTotalSize]] is 0 and controller.[[closeRequested]] is true,
        if drained_after_close {
            // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
            self.clear_algorithms();
            // Perform ! ReadableStreamClose(controller.[[stream]]).
            if let Some(stream) = self.stream() {
                stream.readable_stream_close();
            }
        } else {
            // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
            self.call_pull_if_needed();
        }
    }

    /// ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue
    fn process_pull_into_descriptors_using_queue(&self) -> Vec<PullIntoDescriptor> {
        let mut filled_pull_intos = Vec::new();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        // While controller.[[pendingPullIntos]] is not empty,
        loop {
            // If controller.[[queueTotalSize]] is 0, then break.
            if inner.queue_total_size == 0 {
                break;
            }

            // Let pullIntoDescriptor be controller.[[pendingPullIntos]][0].
            let Some(pull_into_descriptor) = inner.pending_pull_intos.front_mut() else {
                break;
            };

            // If ! ReadableByteStreamControllerFillPullIntoDescriptorFromQueue(controller, pullIntoDescriptor) is true,
            if fill_pull_into_descriptor_from_queue(
                &mut inner.queue,
                &mut inner.queue_total_size,
                pull_into_descriptor,
            ) {
                // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                // Append pullIntoDescriptor to filledPullIntos.
                if let Some(pull_into_descriptor) = inner.pending_pull_intos.pop_front() {
                    filled_pull_intos.push(pull_into_descriptor);
                }
            }
        }

        filled_pull_intos
    }

    /// ReadableByteStreamControllerCommitPullIntoDescriptor
    fn commit_pull_into_descriptor(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
        pull_into_descriptor: PullIntoDescriptor,
    ) {
        // If stream.[[state]] is "closed", set done to true.
        let done = matches!(stream.state(), ReadableStreamState::Closed);

        // Let filledView be ! ReadableByteStreamControllerConvertPullIntoDescriptor(pullIntoDescriptor).
        let filled_view = match pull_into_descriptor.convert() {
            Ok(filled_view) => filled_view,
            Err(e) => {
                self.error_internal(e);
                return;
            },
        };

        if pull_into_descriptor.reader_type == ReaderType::Default {
            // Perform ! ReadableStreamFulfillReadRequest(stream, filledView, done).
            stream.fulfill_read_request(filled_view, done);
        } else {
            // Perform ! ReadableStreamFulfillReadIntoRequest(stream, filledView, done).
            stream.fulfill_read_into_request(filled_view, done);
        }
    }

    /// ReadableByteStreamControllerPullInto
    pub(crate) fn pull_into(&self, view: ArrayBufferView, read_into_request: ReadIntoRequest) {
        let Some(stream) = self.stream() else {
            read_into_request.error_steps(Exception::throw_type("The stream is gone"));
            return;
        };

        // Let elementSize be the element size of view's type.
        let element_size = view.element_size();
        let view_kind = view.kind();
        // Let byteOffset be view.[[ByteOffset]].
        // Let byteLength be view.[[ByteLength]].
        let (byte_offset, byte_length) = (view.byte_offset(), view.byte_length());

        // Let bufferResult be TransferArrayBuffer(view.[[ViewedArrayBuffer]]).
        let buffer = match view.buffer().transfer() {
            Ok(buffer) => buffer,
            // If bufferResult is an abrupt completion,
            Err(e) => {
                // Perform readIntoRequest’s error steps, given bufferResult.[[Value]].
                read_into_request.error_steps(e);
                return;
            },
        };

        let mut pull_into_descriptor = PullIntoDescriptor {
            buffer_byte_length: buffer.byte_length(),
            buffer,
            byte_offset,
            byte_length,
            bytes_filled: 0,
            minimum_fill: element_size,
            element_size,
            view_kind,
            reader_type: ReaderType::Byob,
        };

        // If controller.[[pendingPullIntos]] is not empty,
        if !self.inner.borrow().pending_pull_intos.is_empty() {
            // Append pullIntoDescriptor to controller.[[pendingPullIntos]].
            self.inner
                .borrow_mut()
                .pending_pull_intos
                .push_back(pull_into_descriptor);
            // Perform ! ReadableStreamAddReadIntoRequest(stream, readIntoRequest).
            stream.add_read_into_request(read_into_request);
            return;
        }

        // If stream.[[state]] is "closed",
        if matches!(stream.state(), ReadableStreamState::Closed) {
            // Let emptyView be ! Construct(ctor, « pullIntoDescriptor’s buffer, pullIntoDescriptor’s byte offset, 0 »).
            let empty_view = ArrayBufferView::new(
                view_kind,
                pull_into_descriptor.buffer,
                pull_into_descriptor.byte_offset,
                0,
            );
            // Perform readIntoRequest’s close steps, given emptyView.
            match empty_view {
                Ok(empty_view) => read_into_request.close_steps(Some(empty_view)),
                Err(e) => read_into_request.error_steps(e),
            }
            return;
        }

        // If controller.[[queueTotalSize]] > 0,
        let filled = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            if inner.queue_total_size > 0 {
                Some(fill_pull_into_descriptor_from_queue(
                    &mut inner.queue,
                    &mut inner.queue_total_size,
                    &mut pull_into_descriptor,
                ))
            } else {
                None
            }
        };

        match filled {
            // If ! ReadableByteStreamControllerFillPullIntoDescriptorFromQueue(controller, pullIntoDescriptor) is true,
            Some(true) => {
                // Let filledView be ! ReadableByteStreamControllerConvertPullIntoDescriptor(pullIntoDescriptor).
                let filled_view = pull_into_descriptor.convert();
                // Perform ! ReadableByteStreamControllerHandleQueueDrain(controller).
                self.handle_queue_drain();
                // Perform readIntoRequest’s chunk steps, given filledView.
                match filled_view {
                    Ok(filled_view) => read_into_request.chunk_steps(filled_view),
                    Err(e) => read_into_request.error_steps(e),
                }
                return;
            },
            // If controller.[[closeRequested]] is true,
            Some(false) if self.inner.borrow().close_requested => {
                // Let e be a TypeError exception.
                let e = Exception::throw_type(
                    "Insufficient bytes to fill elements in the given buffer",
                );
                // Perform ! ReadableByteStreamControllerError(controller, e).
                self.error_internal(e.clone());
                // Perform readIntoRequest’s error steps, given e.
                read_into_request.error_steps(e);
                return;
            },
            _ => {},
        }

        // Append pullIntoDescriptor to controller.[[pendingPullIntos]].
        self.inner
            .borrow_mut()
            .pending_pull_intos
            .push_back(pull_into_descriptor);
        // Perform ! ReadableStreamAddReadIntoRequest(stream, readIntoRequest).
        stream.add_read_into_request(read_into_request);
        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.call_pull_if_needed();
    }

    /// ReadableByteStreamControllerRespond
    fn respond(&self, bytes_written: usize) -> Result<()> {
        let stream = self
            .stream()
            .ok_or_else(|| Exception::throw_type("The stream is gone"))?;
        let closed = match stream.state() {
            ReadableStreamState::Closed => true,
            ReadableStreamState::Readable => false,
            ReadableStreamState::Errored(e) => return Err(e),
        };

        {
            let mut inner = self.inner.borrow_mut();
            // Let firstDescriptor be controller.[[pendingPullIntos]][0].
            let first = inner
                .pending_pull_intos
                .front_mut()
                .ok_or_else(|| Exception::throw_type("There is no pending read to respond to"))?;

            if closed {
                // If bytesWritten is not 0, throw a TypeError exception.
                if bytes_written != 0 {
                    return Err(Exception::throw_type(
                        "bytesWritten must be 0 when calling respond() on a closed stream",
                    ));
                }
            } else {
                // If bytesWritten is 0, throw a TypeError exception.
                if bytes_written == 0 {
                    return Err(Exception::throw_type(
                        "bytesWritten must be greater than 0 when calling respond() on a readable stream",
                    ));
                }
                // If firstDescriptor’s bytes filled + bytesWritten > firstDescriptor’s byte length, throw a RangeError exception.
                if first.bytes_filled + bytes_written > first.byte_length {
                    return Err(Exception::throw_range("bytesWritten out of range"));
                }
            }

            // Set firstDescriptor’s buffer to ! TransferArrayBuffer(firstDescriptor’s buffer).
            first.buffer = first.buffer.transfer()?;
        }

        // Perform ? ReadableByteStreamControllerRespondInternal(controller, bytesWritten).
        self.respond_internal(&stream, bytes_written)
    }

    /// ReadableByteStreamControllerRespondWithNewView
    fn respond_with_new_view(&self, view: ArrayBufferView) -> Result<()> {
        let stream = self
            .stream()
            .ok_or_else(|| Exception::throw_type("The stream is gone"))?;
        let closed = match stream.state() {
            ReadableStreamState::Closed => true,
            ReadableStreamState::Readable => false,
            ReadableStreamState::Errored(e) => return Err(e),
        };
        let view_byte_length = view.byte_length();

        {
            let mut inner = self.inner.borrow_mut();
            let first = inner
                .pending_pull_intos
                .front_mut()
                .ok_or_else(|| Exception::throw_type("There is no pending read to respond to"))?;

            if closed {
                // If view.[[ByteLength]] is not 0, throw a TypeError exception.
                if view_byte_length != 0 {
                    return Err(Exception::throw_type(
                        "The view's length must be 0 when calling respondWithNewView() on a closed stream",
                    ));
                }
            } else if view_byte_length == 0 {
                // If view.[[ByteLength]] is 0, throw a TypeError exception.
                return Err(Exception::throw_type(
                    "The view's length must be greater than 0 when calling respondWithNewView() on a readable stream",
                ));
            }

            // If firstDescriptor’s byte offset + firstDescriptor’s bytes filled is not view.[[ByteOffset]], throw a RangeError exception.
            if first.byte_offset + first.bytes_filled != view.byte_offset() {
                return Err(Exception::throw_range(
                    "The region specified by view does not match byobRequest",
                ));
            }

            // If firstDescriptor’s buffer byte length is not view.[[ViewedArrayBuffer]].[[ByteLength]], throw a RangeError exception.
            if first.buffer_byte_length != view.buffer().byte_length() {
                return Err(Exception::throw_range(
                    "The buffer of view has different capacity than byobRequest",
                ));
            }

            // If firstDescriptor’s bytes filled + view.[[ByteLength]] > firstDescriptor’s byte length, throw a RangeError exception.
            if first.bytes_filled + view_byte_length > first.byte_length {
                return Err(Exception::throw_range(
                    "The region specified by view is larger than byobRequest",
                ));
            }

            // Set firstDescriptor’s buffer to ? TransferArrayBuffer(view.[[ViewedArrayBuffer]]).
            first.buffer = view.buffer().transfer()?;
        }

        // Perform ? ReadableByteStreamControllerRespondInternal(controller, viewByteLength).
        self.respond_internal(&stream, view_byte_length)
    }

    /// ReadableByteStreamControllerRespondInternal
    fn respond_internal(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
        bytes_written: usize,
    ) -> Result<()> {
        // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
        self.invalidate_byob_request();

        // If state is "closed",
        if matches!(stream.state(), ReadableStreamState::Closed) {
            // Perform ! ReadableByteStreamControllerRespondInClosedState(controller, firstDescriptor).
            self.respond_in_closed_state(stream);
        } else {
            // Perform ? ReadableByteStreamControllerRespondInReadableState(controller, bytesWritten, firstDescriptor).
            self.respond_in_readable_state(stream, bytes_written)?;
        }

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.call_pull_if_needed();
        Ok(())
    }

    /// ReadableByteStreamControllerRespondInClosedState
    fn respond_in_closed_state(&self, stream: &ReadableStream<ArrayBufferView>) {
        let first_reader_type = self
            .inner
            .borrow()
            .pending_pull_intos
            .front()
            .map(|first| first.reader_type);

        // If firstDescriptor’s reader type is "none", perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
        if first_reader_type == Some(ReaderType::None) {
            self.shift_pending_pull_into();
        }

        // If ! ReadableStreamHasBYOBReader(stream) is true,
        if stream.has_byob_reader() {
            // While ! ReadableStreamGetNumReadIntoRequests(stream) > 0,
            while stream.get_num_read_into_requests() > 0 {
                // Let pullIntoDescriptor be ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                let Some(pull_into_descriptor) = self.shift_pending_pull_into() else {
                    break;
                };
                // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(stream, pullIntoDescriptor).
                self.commit_pull_into_descriptor(stream, pull_into_descriptor);
            }
        }
    }

    /// ReadableByteStreamControllerRespondInReadableState
    fn respond_in_readable_state(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
        bytes_written: usize,
    ) -> Result<()> {
        // Perform ! ReadableByteStreamControllerFillHeadPullIntoDescriptor(controller, bytesWritten, pullIntoDescriptor).
        let (reader_type, bytes_filled, minimum_fill) = {
            let mut inner = self.inner.borrow_mut();
            let Some(first) = inner.pending_pull_intos.front_mut() else {
                return Ok(());
            };
            first.bytes_filled += bytes_written;
            (first.reader_type, first.bytes_filled, first.minimum_fill)
        };

        // If pullIntoDescriptor’s reader type is "none",
        if reader_type == ReaderType::None {
            // Perform ? ReadableByteStreamControllerEnqueueDetachedPullIntoToQueue(controller, pullIntoDescriptor).
            self.enqueue_detached_pull_into_to_queue()?;
            // Let filledPullIntos be the result of performing ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
            for filled_pull_into in self.process_pull_into_descriptors_using_queue() {
                self.commit_pull_into_descriptor(stream, filled_pull_into);
            }
            return Ok(());
        }

        // If pullIntoDescriptor’s bytes filled < pullIntoDescriptor’s minimum fill, return.
        if bytes_filled < minimum_fill {
            return Ok(());
        }

        // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
        let Some(mut pull_into_descriptor) = self.shift_pending_pull_into() else {
            return Ok(());
        };

        // Let remainderSize be pullIntoDescriptor’s bytes filled mod pullIntoDescriptor’s element size.
        let remainder_size = pull_into_descriptor.bytes_filled % pull_into_descriptor.element_size;

        // If remainderSize > 0,
        if remainder_size > 0 {
            // Let end be pullIntoDescriptor’s byte offset + pullIntoDescriptor’s bytes filled.
            let end = pull_into_descriptor.byte_offset + pull_into_descriptor.bytes_filled;
            // Perform ? ReadableByteStreamControllerEnqueueClonedChunkToQueue(controller, pullIntoDescriptor’s buffer, end − remainderSize, remainderSize).
            self.enqueue_cloned_chunk_to_queue(
                &pull_into_descriptor.buffer,
                end - remainder_size,
                remainder_size,
            )?;
        }

        // Set pullIntoDescriptor’s bytes filled to pullIntoDescriptor’s bytes filled − remainderSize.
        pull_into_descriptor.bytes_filled -= remainder_size;

        // Let filledPullIntos be the result of performing ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
        let filled_pull_intos = self.process_pull_into_descriptors_using_queue();

        // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(controller.[[stream]], pullIntoDescriptor).
        self.commit_pull_into_descriptor(stream, pull_into_descriptor);

        for filled_pull_into in filled_pull_intos {
            self.commit_pull_into_descriptor(stream, filled_pull_into);
        }
        Ok(())
    }
}

/// ReadableByteStreamControllerFillPullIntoDescriptorFromQueue
fn fill_pull_into_descriptor_from_queue(
    queue: &mut Queue<ReadableByteStreamQueueEntry>,
    queue_total_size: &mut usize,
    pull_into_descriptor: &mut PullIntoDescriptor,
) -> bool {
    // Let maxBytesToCopy be min(controller.[[queueTotalSize]], pullIntoDescriptor’s byte length − pullIntoDescriptor’s bytes filled).
    let max_bytes_to_copy = (*queue_total_size)
        .min(pull_into_descriptor.byte_length - pull_into_descriptor.bytes_filled);

    // Let maxBytesFilled be pullIntoDescriptor’s bytes filled + maxBytesToCopy.
    let max_bytes_filled = pull_into_descriptor.bytes_filled + max_bytes_to_copy;

    let mut total_bytes_to_copy_remaining = max_bytes_to_copy;
    let mut ready = false;

    // Let remainderBytes be maxBytesFilled mod pullIntoDescriptor’s element size.
    let remainder_bytes = max_bytes_filled % pull_into_descriptor.element_size;
    // Let maxAlignedBytes be maxBytesFilled − remainderBytes.
    let max_aligned_bytes = max_bytes_filled - remainder_bytes;

    // If maxAlignedBytes ≥ pullIntoDescriptor’s minimum fill,
    if max_aligned_bytes >= pull_into_descriptor.minimum_fill {
        total_bytes_to_copy_remaining = max_aligned_bytes - pull_into_descriptor.bytes_filled;
        ready = true;
    }

    // While totalBytesToCopyRemaining > 0,
    while total_bytes_to_copy_remaining > 0 {
        let Some(head_of_queue) = queue.front_mut() else {
            break;
        };

        // Let bytesToCopy be min(totalBytesToCopyRemaining, headOfQueue’s byte length).
        let bytes_to_copy = total_bytes_to_copy_remaining.min(head_of_queue.byte_length);
        // Let destStart be pullIntoDescriptor’s byte offset + pullIntoDescriptor’s bytes filled.
        let dest_start = pull_into_descriptor.byte_offset + pull_into_descriptor.bytes_filled;

        // Perform ! CopyDataBlockBytes(descriptorBuffer.[[ArrayBufferData]], destStart, queueBuffer.[[ArrayBufferData]], headOfQueue’s byte offset, bytesToCopy).
        copy_data_block_bytes(
            &pull_into_descriptor.buffer,
            dest_start,
            &head_of_queue.buffer,
            head_of_queue.byte_offset,
            bytes_to_copy,
        );

        // If headOfQueue’s byte length is bytesToCopy,
        if head_of_queue.byte_length == bytes_to_copy {
            // Remove queue[0].
            queue.shift();
        } else {
            // Set headOfQueue’s byte offset to headOfQueue’s byte offset + bytesToCopy.
            head_of_queue.byte_offset += bytes_to_copy;
            // Set headOfQueue’s byte length to headOfQueue’s byte length − bytesToCopy.
            head_of_queue.byte_length -= bytes_to_copy;
        }

        // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] − bytesToCopy.
        *queue_total_size -= bytes_to_copy;

        // Perform ! ReadableByteStreamControllerFillHeadPullIntoDescriptor(controller, bytesToCopy, pullIntoDescriptor).
        pull_into_descriptor.bytes_filled += bytes_to_copy;

        // Set totalBytesToCopyRemaining to totalBytesToCopyRemaining − bytesToCopy.
        total_bytes_to_copy_remaining -= bytes_to_copy;
    }

    ready
}

impl ReadableStreamControllerSteps<ArrayBufferView> for ReadableByteStreamController {
    fn cancel_steps(&self, reason: Exception) -> AlgorithmFuture {
        // Perform ! ReadableByteStreamControllerClearPendingPullIntos(this).
        self.clear_pending_pull_intos();

        // Perform ! ResetQueue(this).
        self.reset_queue();

        // Let result be the result of performing this.[[cancelAlgorithm]], passing in reason.
        let cancel_algorithm = self.inner.borrow_mut().cancel_algorithm.take();
        let result = match cancel_algorithm {
            Some(cancel_algorithm) => cancel_algorithm.call(reason),
            None => Box::pin(std::future::ready(Ok(()))),
        };

        // Perform ! ReadableByteStreamControllerClearAlgorithms(this).
        self.clear_algorithms();

        result
    }

    fn pull_steps(&self, read_request: ReadRequest<ArrayBufferView>) {
        let Some(stream) = self.stream() else {
            return;
        };

        // If this.[[queueTotalSize]] > 0,
        if self.inner.borrow().queue_total_size > 0 {
            // Perform ! ReadableByteStreamControllerFillReadRequestFromQueue(this, readRequest).
            self.fill_read_request_from_queue(read_request);
            return;
        }

        // Let autoAllocateChunkSize be this.[[autoAllocateChunkSize]].
        // If autoAllocateChunkSize is not undefined,
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(auto_allocate_chunk_size) = inner.auto_allocate_chunk_size {
                // Let buffer be Construct(%ArrayBuffer%, « autoAllocateChunkSize »).
                let buffer = ArrayBuffer::new(auto_allocate_chunk_size);
                // Append pullIntoDescriptor to this.[[pendingPullIntos]].
                inner.pending_pull_intos.push_back(PullIntoDescriptor {
                    buffer,
                    buffer_byte_length: auto_allocate_chunk_size,
                    byte_offset: 0,
                    byte_length: auto_allocate_chunk_size,
                    bytes_filled: 0,
                    minimum_fill: 1,
                    element_size: 1,
                    view_kind: ViewKind::Uint8,
                    reader_type: ReaderType::Default,
                });
            }
        }

        // Perform ! ReadableStreamAddReadRequest(stream, readRequest).
        stream.add_read_request(read_request);
        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(this).
        self.call_pull_if_needed();
    }

    fn release_steps(&self) {
        let mut inner = self.inner.borrow_mut();
        // If this.[[pendingPullIntos]] is not empty,
        if let Some(mut first_pending_pull_into) = inner.pending_pull_intos.pop_front() {
            // Set firstPendingPullInto’s reader type to "none".
            first_pending_pull_into.reader_type = ReaderType::None;
            // Set this.[[pendingPullIntos]] to the list « firstPendingPullInto ».
            inner.pending_pull_intos.clear();
            inner.pending_pull_intos.push_back(first_pending_pull_into);
        }
    }

    fn as_byte_controller(&self) -> Option<ReadableByteStreamController> {
        Some(self.clone())
    }

    fn tee_steps(
        &self,
    ) -> Option<Result<(ReadableStream<ArrayBufferView>, ReadableStream<ArrayBufferView>)>> {
        let stream = self.stream()?;
        Some(readable_byte_stream_tee(&stream))
    }
}

pub(crate) struct ReadableStreamBYOBRequestInner {
    controller: Option<ReadableByteStreamController>,
    view: Option<ArrayBufferView>,
}

/// The destination a byte source should write into to satisfy the oldest
/// pending read. Invalidated once answered.
#[derive(Clone)]
pub struct ReadableStreamBYOBRequest {
    inner: Rc<RefCell<ReadableStreamBYOBRequestInner>>,
}

impl ReadableStreamBYOBRequest {
    fn new(controller: ReadableByteStreamController, view: ArrayBufferView) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ReadableStreamBYOBRequestInner {
                controller: Some(controller),
                view: Some(view),
            })),
        }
    }

    /// `None` once the request has been answered.
    pub fn view(&self) -> Option<ArrayBufferView> {
        self.inner.borrow().view.clone()
    }

    /// Reports that `bytes_written` bytes were written into [`view`](Self::view).
    pub fn respond(&self, bytes_written: usize) -> Result<()> {
        let (controller, view) = {
            let inner = self.inner.borrow();
            (inner.controller.clone(), inner.view.clone())
        };

        // If this.[[controller]] is undefined, throw a TypeError exception.
        let (Some(controller), Some(view)) = (controller, view) else {
            return Err(Exception::throw_type("This BYOB request has been invalidated"));
        };

        // If ! IsDetachedBuffer(this.[[view]].[[ArrayBuffer]]) is true, throw a TypeError exception.
        if view.buffer().is_detached() {
            return Err(Exception::throw_type(
                "The BYOB request's buffer has been detached and so cannot be used as a response",
            ));
        }

        // Perform ? ReadableByteStreamControllerRespond(this.[[controller]], bytesWritten).
        controller.respond(bytes_written)
    }

    /// Answers the request with a view over the (possibly transferred)
    /// request buffer.
    pub fn respond_with_new_view(&self, view: ArrayBufferView) -> Result<()> {
        let controller = self.inner.borrow().controller.clone();

        // If this.[[controller]] is undefined, throw a TypeError exception.
        let Some(controller) = controller else {
            return Err(Exception::throw_type("This BYOB request has been invalidated"));
        };

        // If ! IsDetachedBuffer(view.[[ViewedArrayBuffer]]) is true, throw a TypeError exception.
        if view.buffer().is_detached() {
            return Err(Exception::throw_type(
                "The given view's buffer has been detached and so cannot be used as a response",
            ));
        }

        // Return ? ReadableByteStreamControllerRespondWithNewView(this.[[controller]], view).
        controller.respond_with_new_view(view)
    }
}
