// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use brook_utils::array_buffer::{ArrayBuffer, ArrayBufferView};
use bytes::{Bytes, BytesMut};

use super::{NativeSizeFunction, QueuingStrategy, SizeFunction};

/// Chunks that can be measured by [`ByteLengthQueuingStrategy`].
pub trait ByteLength {
    fn byte_length(&self) -> usize;
}

impl ByteLength for ArrayBufferView {
    fn byte_length(&self) -> usize {
        ArrayBufferView::byte_length(self)
    }
}

impl ByteLength for ArrayBuffer {
    fn byte_length(&self) -> usize {
        ArrayBuffer::byte_length(self)
    }
}

impl ByteLength for Vec<u8> {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for Bytes {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for BytesMut {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for String {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

/// Measures each chunk by its byte length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub fn size<T: ByteLength>(&self, chunk: &T) -> f64 {
        chunk.byte_length() as f64
    }
}

impl<T: ByteLength> From<ByteLengthQueuingStrategy> for QueuingStrategy<T> {
    fn from(value: ByteLengthQueuingStrategy) -> Self {
        Self {
            high_water_mark: Some(value.high_water_mark),
            size: Some(SizeFunction::Native(NativeSizeFunction::ByteLength(
                T::byte_length,
            ))),
        }
    }
}
