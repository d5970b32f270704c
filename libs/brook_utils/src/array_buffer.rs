// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//! Detachable byte buffers and typed views over them.
//!
//! An [`ArrayBuffer`] is a shared handle to a backing store. Transferring a
//! buffer moves the backing store into a fresh handle and leaves every other
//! handle (and every view over it) detached with a length of zero.
use std::{cell::RefCell, fmt, rc::Rc};

use brook_exceptions::{Exception, Result};
use bytes::BytesMut;

#[derive(Clone, Default)]
pub struct ArrayBuffer {
    store: Rc<RefCell<Option<BytesMut>>>,
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.store.borrow().as_ref() {
            Some(bytes) => f.debug_tuple("ArrayBuffer").field(&bytes.len()).finish(),
            None => f.write_str("ArrayBuffer(detached)"),
        }
    }
}

impl PartialEq for ArrayBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl ArrayBuffer {
    /// Zero filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_bytes_mut(BytesMut::zeroed(len))
    }

    pub fn from_bytes_mut(bytes: BytesMut) -> Self {
        Self {
            store: Rc::new(RefCell::new(Some(bytes))),
        }
    }

    pub fn byte_length(&self) -> usize {
        self.store.borrow().as_ref().map_or(0, |bytes| bytes.len())
    }

    pub fn is_detached(&self) -> bool {
        self.store.borrow().is_none()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.store, &other.store)
    }

    /// Moves the backing store into a new buffer, detaching `self`.
    pub fn transfer(&self) -> Result<ArrayBuffer> {
        let bytes = self
            .store
            .borrow_mut()
            .take()
            .ok_or_else(|| Exception::throw_type("Cannot transfer a detached ArrayBuffer"))?;
        Ok(Self::from_bytes_mut(bytes))
    }

    pub fn detach(&self) {
        self.store.borrow_mut().take();
    }

    /// Copies `len` bytes starting at `offset` into a new buffer.
    pub fn slice(&self, offset: usize, len: usize) -> Result<ArrayBuffer> {
        let store = self.store.borrow();
        let bytes = store
            .as_ref()
            .ok_or_else(|| Exception::throw_type("ArrayBuffer is detached"))?;
        let src = bytes
            .get(offset..offset + len)
            .ok_or_else(|| Exception::throw_range("Offset is outside the bounds of the buffer"))?;
        Ok(Self::from_bytes_mut(BytesMut::from(src)))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.store
            .borrow()
            .as_ref()
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default()
    }

    /// Runs `f` over the bytes, or over an empty slice when detached.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.store.borrow().as_ref() {
            Some(bytes) => f(bytes),
            None => f(&[]),
        }
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self.store.borrow_mut().as_mut() {
            Some(bytes) => f(bytes),
            None => f(&mut []),
        }
    }
}

impl From<Vec<u8>> for ArrayBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self::from_bytes_mut(BytesMut::from(&value[..]))
    }
}

impl From<&[u8]> for ArrayBuffer {
    fn from(value: &[u8]) -> Self {
        Self::from_bytes_mut(BytesMut::from(value))
    }
}

/// Copies `count` bytes from `src[src_offset..]` into `dest[dest_offset..]`.
pub fn copy_data_block_bytes(
    dest: &ArrayBuffer,
    dest_offset: usize,
    src: &ArrayBuffer,
    src_offset: usize,
    count: usize,
) {
    if dest.ptr_eq(src) {
        dest.with_bytes_mut(|bytes| {
            bytes.copy_within(src_offset..src_offset + count, dest_offset)
        });
        return;
    }
    src.with_bytes(|from| {
        dest.with_bytes_mut(|to| {
            to[dest_offset..dest_offset + count]
                .copy_from_slice(&from[src_offset..src_offset + count])
        })
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl ViewKind {
    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped | Self::DataView => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 | Self::BigInt64 | Self::BigUint64 => 8,
        }
    }
}

/// A typed window over an [`ArrayBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayBufferView {
    buffer: ArrayBuffer,
    byte_offset: usize,
    byte_length: usize,
    kind: ViewKind,
}

impl ArrayBufferView {
    /// `length` is counted in elements of `kind`.
    pub fn new(
        kind: ViewKind,
        buffer: ArrayBuffer,
        byte_offset: usize,
        length: usize,
    ) -> Result<Self> {
        let element_size = kind.element_size();
        if byte_offset % element_size != 0 {
            return Err(Exception::throw_range(format!(
                "start offset of {:?} should be a multiple of {}",
                kind, element_size
            )));
        }
        let byte_length = length * element_size;
        if byte_offset + byte_length > buffer.byte_length() {
            return Err(Exception::throw_range("Invalid typed array length"));
        }
        Ok(Self {
            buffer,
            byte_offset,
            byte_length,
            kind,
        })
    }

    /// A `Uint8` view spanning a fresh buffer holding `bytes`.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let buffer = ArrayBuffer::from(bytes.as_ref());
        let byte_length = buffer.byte_length();
        Self {
            buffer,
            byte_offset: 0,
            byte_length,
            kind: ViewKind::Uint8,
        }
    }

    pub fn uint8(buffer: ArrayBuffer, byte_offset: usize, byte_length: usize) -> Result<Self> {
        Self::new(ViewKind::Uint8, buffer, byte_offset, byte_length)
    }

    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    pub fn byte_offset(&self) -> usize {
        if self.buffer.is_detached() {
            return 0;
        }
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        if self.buffer.is_detached() {
            return 0;
        }
        self.byte_length
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn element_size(&self) -> usize {
        self.kind.element_size()
    }

    pub fn len(&self) -> usize {
        self.byte_length() / self.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let (offset, len) = (self.byte_offset(), self.byte_length());
        self.buffer
            .with_bytes(|bytes| bytes[offset..offset + len].to_vec())
    }

    /// Runs `f` over the bytes this view spans.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let (offset, len) = (self.byte_offset(), self.byte_length());
        self.buffer
            .with_bytes_mut(|bytes| f(&mut bytes[offset..offset + len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_detaches_source() {
        let buffer = ArrayBuffer::from(vec![1, 2, 3]);
        let view = ArrayBufferView::uint8(buffer.clone(), 1, 2).unwrap();
        assert_eq!(view.to_vec(), vec![2, 3]);

        let moved = buffer.transfer().unwrap();
        assert!(buffer.is_detached());
        assert_eq!(buffer.byte_length(), 0);
        assert_eq!(view.byte_length(), 0);
        assert_eq!(moved.to_vec(), vec![1, 2, 3]);

        assert!(buffer.transfer().unwrap_err().is_type_error());
    }

    #[test]
    fn view_bounds_are_checked() {
        let buffer = ArrayBuffer::new(8);
        assert!(ArrayBufferView::new(ViewKind::Uint32, buffer.clone(), 2, 1)
            .unwrap_err()
            .is_range_error());
        assert!(ArrayBufferView::new(ViewKind::Uint16, buffer.clone(), 0, 5)
            .unwrap_err()
            .is_range_error());
        let view = ArrayBufferView::new(ViewKind::Uint16, buffer, 2, 3).unwrap();
        assert_eq!(view.byte_length(), 6);
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn copy_between_buffers() {
        let src = ArrayBuffer::from(vec![9, 8, 7, 6]);
        let dest = ArrayBuffer::new(4);
        copy_data_block_bytes(&dest, 1, &src, 2, 2);
        assert_eq!(dest.to_vec(), vec![0, 7, 6, 0]);

        copy_data_block_bytes(&src, 0, &src, 2, 2);
        assert_eq!(src.to_vec(), vec![7, 6, 7, 6]);
    }

    #[test]
    fn view_writes_stay_in_window() {
        let buffer = ArrayBuffer::new(4);
        let view = ArrayBufferView::uint8(buffer.clone(), 1, 2).unwrap();
        view.with_bytes_mut(|bytes| bytes.copy_from_slice(&[5, 6]));
        assert_eq!(buffer.to_vec(), vec![0, 5, 6, 0]);
    }
}
