// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
mod byob_reader;
mod byte_controller;
mod controller;
mod default_controller;
mod default_reader;
mod iterator;
mod reader;
pub(crate) mod stream;

pub use byob_reader::ReadableStreamBYOBReader;
pub use byte_controller::{ReadableByteStreamController, ReadableStreamBYOBRequest};
pub use default_controller::ReadableStreamDefaultController;
pub use default_reader::ReadableStreamDefaultReader;
pub use iterator::{ReadableStreamAsyncIterator, ReadableStreamIteratorOptions};
pub use reader::{
    ReadableStreamGetReaderOptions, ReadableStreamReadResult, ReadableStreamReader,
    ReadableStreamReaderMode,
};
pub use stream::{
    pipe::StreamPipeOptions,
    source::{UnderlyingByteSource, UnderlyingSource},
    ReadableStream,
};

pub(crate) use stream::ReadableStreamState;
