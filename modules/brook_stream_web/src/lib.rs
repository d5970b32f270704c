// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//! Readable, writable and transform streams with backpressure, exclusive
//! readers and writers, `pipe_to`, `tee` and queuing strategies.
//!
//! https://streams.spec.whatwg.org/
//!
//! Everything here is single threaded and reacts through jobs spawned on the
//! current [`tokio::task::LocalSet`], so streams must be driven from inside
//! one.
#![allow(clippy::new_without_default)]

pub use self::{
    queuing_strategy::{
        ByteLength, ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy,
    },
    readable::{
        ReadableByteStreamController, ReadableStream, ReadableStreamAsyncIterator,
        ReadableStreamBYOBReader, ReadableStreamBYOBRequest, ReadableStreamDefaultController,
        ReadableStreamDefaultReader, ReadableStreamGetReaderOptions,
        ReadableStreamIteratorOptions, ReadableStreamReadResult, ReadableStreamReader,
        ReadableStreamReaderMode, StreamPipeOptions, UnderlyingByteSource, UnderlyingSource,
    },
    readable_writable_pair::ReadableWritablePair,
    transform::{TransformStream, TransformStreamDefaultController, Transformer},
    utils::promise::{OncePromise, Promise},
    writable::{
        UnderlyingSink, WritableStream, WritableStreamDefaultController,
        WritableStreamDefaultWriter,
    },
};

mod queuing_strategy;
mod readable;
mod readable_writable_pair;
mod transform;
mod utils;
mod writable;
