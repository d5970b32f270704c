// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use crate::{readable::ReadableStream, transform::TransformStream, writable::WritableStream};

/// An object containing a pair of linked streams, one readable and one writable
/// https://streams.spec.whatwg.org/#dictdef-readablewritablepair
pub struct ReadableWritablePair<I: 'static, O: 'static = I> {
    pub readable: ReadableStream<O>,
    pub writable: WritableStream<I>,
}

impl<I: 'static, O: 'static> From<TransformStream<I, O>> for ReadableWritablePair<I, O> {
    fn from(stream: TransformStream<I, O>) -> Self {
        Self {
            readable: stream.readable(),
            writable: stream.writable(),
        }
    }
}

impl<I: 'static, O: 'static> From<&TransformStream<I, O>> for ReadableWritablePair<I, O> {
    fn from(stream: &TransformStream<I, O>) -> Self {
        Self {
            readable: stream.readable(),
            writable: stream.writable(),
        }
    }
}
