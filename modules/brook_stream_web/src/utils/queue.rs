// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use brook_exceptions::{Exception, Result};

const CHUNK_CAPACITY: usize = 16 * 1024;

struct Chunk<T> {
    elements: Vec<Option<T>>,
    cursor: usize,
}

/// FIFO stored as a list of fixed capacity chunks, so that neither pushing
/// nor shifting ever moves more than one chunk's worth of elements.
pub struct Queue<T> {
    chunks: VecDeque<Chunk<T>>,
    length: usize,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            length: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn push(&mut self, value: T) {
        let needs_chunk = self
            .chunks
            .back()
            .map_or(true, |chunk| chunk.elements.len() == CHUNK_CAPACITY);
        if needs_chunk {
            self.chunks.push_back(Chunk {
                elements: Vec::new(),
                cursor: 0,
            });
        }
        if let Some(chunk) = self.chunks.back_mut() {
            chunk.elements.push(Some(value));
            self.length += 1;
        }
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        let chunk = self.chunks.front_mut()?;
        chunk.elements.get_mut(chunk.cursor)?.as_mut()
    }

    pub fn shift(&mut self) -> Option<T> {
        let chunk = self.chunks.front_mut()?;
        let value = chunk.elements.get_mut(chunk.cursor)?.take();
        chunk.cursor += 1;
        if chunk.cursor == chunk.elements.len() {
            self.chunks.pop_front();
        }
        self.length -= 1;
        value
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.length = 0;
    }
}

pub struct ValueWithSize<T> {
    pub value: T,
    size: f64,
}

/// Queue of values paired with their strategy size and the running total of
/// those sizes.
pub struct QueueWithSizes<T> {
    queue: Queue<ValueWithSize<T>>,
    queue_total_size: f64,
}

impl<T> Default for QueueWithSizes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueueWithSizes<T> {
    pub fn new() -> Self {
        Self {
            queue: Queue::new(),
            queue_total_size: 0.0,
        }
    }

    pub fn total_size(&self) -> f64 {
        self.queue_total_size
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn enqueue_value_with_size(&mut self, value: T, size: f64) -> Result<()> {
        // NaN, negative and infinite sizes are all rejected.
        if !is_non_negative_number(size) || size.is_infinite() {
            return Err(Exception::throw_range(
                "Size must be a finite, non-NaN, non-negative number.",
            ));
        }

        self.queue.push(ValueWithSize { value, size });
        self.queue_total_size += size;

        Ok(())
    }

    pub fn dequeue_value(&mut self) -> T {
        let value_with_size = self
            .queue
            .shift()
            .expect("DequeueValue called with empty queue");
        self.queue_total_size -= value_with_size.size;
        // Rounding errors can push the total below zero.
        if self.queue_total_size < 0.0 {
            self.queue_total_size = 0.0
        }
        value_with_size.value
    }

    pub fn peek_queue_value_mut(&mut self) -> Option<&mut T> {
        self.queue.front_mut().map(|entry| &mut entry.value)
    }

    pub fn reset_queue(&mut self) {
        self.queue.clear();
        self.queue_total_size = 0.0;
    }
}

fn is_non_negative_number(number: f64) -> bool {
    !number.is_nan() && number >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo_across_chunks() {
        let mut queue = Queue::new();
        let count = CHUNK_CAPACITY * 2 + 7;
        for i in 0..count {
            queue.push(i);
        }
        assert_eq!(queue.len(), count);
        assert_eq!(queue.front_mut(), Some(&mut 0));

        for i in 0..CHUNK_CAPACITY + 3 {
            assert_eq!(queue.shift(), Some(i));
        }
        queue.push(count);
        assert_eq!(queue.front_mut(), Some(&mut (CHUNK_CAPACITY + 3)));

        let rest: Vec<_> = std::iter::from_fn(|| queue.shift()).collect();
        assert_eq!(rest.first(), Some(&(CHUNK_CAPACITY + 3)));
        assert_eq!(rest.last(), Some(&count));
        assert!(queue.is_empty());
        assert_eq!(queue.shift(), None);
        assert_eq!(queue.front_mut(), None);
    }

    #[test]
    fn total_size_tracks_queued_values() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue_value_with_size("a", 2.0).unwrap();
        queue.enqueue_value_with_size("b", 0.5).unwrap();
        assert_eq!(queue.total_size(), 2.5);
        assert_eq!(queue.peek_queue_value_mut(), Some(&mut "a"));

        assert_eq!(queue.dequeue_value(), "a");
        assert_eq!(queue.total_size(), 0.5);

        queue.reset_queue();
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn invalid_sizes_are_range_errors() {
        let mut queue = QueueWithSizes::new();
        for size in [f64::NAN, -1.0, f64::INFINITY] {
            let err = queue.enqueue_value_with_size((), size).unwrap_err();
            assert!(err.is_range_error());
        }
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn total_size_never_goes_negative() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue_value_with_size(1, 0.1).unwrap();
        queue.enqueue_value_with_size(2, 0.2).unwrap();
        queue.dequeue_value();
        queue.dequeue_value();
        assert!(queue.total_size() >= 0.0);
    }
}
