// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{fmt, rc::Rc};

use brook_exceptions::{Exception, Result};

pub use byte_length::{ByteLength, ByteLengthQueuingStrategy};
pub use count::CountQueuingStrategy;

mod byte_length;
mod count;

/// QueuingStrategy describes how a stream signals backpressure: a buffering
/// budget and a way to measure each chunk against it.
pub struct QueuingStrategy<T> {
    high_water_mark: Option<f64>,
    size: Option<SizeFunction<T>>,
}

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            size: None,
        }
    }
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("size", &self.size.is_some())
            .finish()
    }
}

impl<T: 'static> QueuingStrategy<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = Some(high_water_mark);
        self
    }

    /// Measures chunks with `size`. An `Err` from `size` errors the stream.
    pub fn with_size<F>(mut self, size: F) -> Self
    where
        F: Fn(&T) -> Result<f64> + 'static,
    {
        self.size = Some(SizeFunction::Custom(Rc::new(size)));
        self
    }

    pub fn high_water_mark(&self) -> Option<f64> {
        self.high_water_mark
    }

    pub(crate) fn has_size(&self) -> bool {
        self.size.is_some()
    }

    pub(crate) fn extract_high_water_mark(&self, default_hwm: f64) -> Result<f64> {
        match self.high_water_mark {
            None => Ok(default_hwm),
            Some(high_water_mark) if high_water_mark.is_nan() || high_water_mark < 0.0 => {
                Err(Exception::throw_range("Invalid highWaterMark"))
            },
            Some(high_water_mark) => Ok(high_water_mark),
        }
    }

    pub(crate) fn extract_size_algorithm(&self) -> SizeAlgorithm<T> {
        match &self.size {
            None => SizeAlgorithm::AlwaysOne,
            Some(size) => SizeAlgorithm::SizeFunction(size.clone()),
        }
    }
}

/// The two ways of producing sizes: calling a function, or returning 1.
pub(crate) enum SizeAlgorithm<T> {
    AlwaysOne,
    SizeFunction(SizeFunction<T>),
}

impl<T> Clone for SizeAlgorithm<T> {
    fn clone(&self) -> Self {
        match self {
            Self::AlwaysOne => Self::AlwaysOne,
            Self::SizeFunction(size) => Self::SizeFunction(size.clone()),
        }
    }
}

impl<T> SizeAlgorithm<T> {
    pub(crate) fn call(&self, chunk: &T) -> Result<f64> {
        match self {
            Self::AlwaysOne | Self::SizeFunction(SizeFunction::Native(NativeSizeFunction::Count)) => {
                Ok(1.0)
            },
            Self::SizeFunction(SizeFunction::Native(NativeSizeFunction::ByteLength(
                byte_length,
            ))) => Ok(byte_length(chunk) as f64),
            Self::SizeFunction(SizeFunction::Custom(size)) => size(chunk),
        }
    }
}

/// User supplied size functions, or one of ours which never fails.
pub(crate) enum SizeFunction<T> {
    Custom(Rc<dyn Fn(&T) -> Result<f64>>),
    Native(NativeSizeFunction<T>),
}

impl<T> Clone for SizeFunction<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Custom(size) => Self::Custom(size.clone()),
            Self::Native(native) => Self::Native(*native),
        }
    }
}

pub(crate) enum NativeSizeFunction<T> {
    Count,
    ByteLength(fn(&T) -> usize),
}

impl<T> Clone for NativeSizeFunction<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NativeSizeFunction<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_validation() {
        let strategy = QueuingStrategy::<u8>::new();
        assert_eq!(strategy.extract_high_water_mark(1.0), Ok(1.0));
        assert_eq!(strategy.extract_high_water_mark(0.0), Ok(0.0));

        for invalid in [f64::NAN, -1.0] {
            let strategy = QueuingStrategy::<u8>::new().with_high_water_mark(invalid);
            assert!(strategy
                .extract_high_water_mark(1.0)
                .unwrap_err()
                .is_range_error());
        }

        let strategy = QueuingStrategy::<u8>::new().with_high_water_mark(f64::INFINITY);
        assert_eq!(strategy.extract_high_water_mark(1.0), Ok(f64::INFINITY));
    }

    #[test]
    fn size_algorithms() {
        let default = QueuingStrategy::<String>::new().extract_size_algorithm();
        assert_eq!(default.call(&"abc".to_string()), Ok(1.0));

        let custom = QueuingStrategy::<String>::new()
            .with_size(|chunk| Ok(chunk.len() as f64 * 2.0))
            .extract_size_algorithm();
        assert_eq!(custom.call(&"abc".to_string()), Ok(6.0));

        let count: QueuingStrategy<String> = CountQueuingStrategy::new(4.0).into();
        assert_eq!(count.high_water_mark(), Some(4.0));
        assert_eq!(count.extract_size_algorithm().call(&"abc".into()), Ok(1.0));

        let bytes: QueuingStrategy<String> = ByteLengthQueuingStrategy::new(16.0).into();
        assert_eq!(bytes.extract_size_algorithm().call(&"abcd".into()), Ok(4.0));
    }
}
