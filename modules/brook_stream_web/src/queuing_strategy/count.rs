// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use super::{NativeSizeFunction, QueuingStrategy, SizeFunction};

/// Counts every chunk as size 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub fn size<T>(&self, _chunk: &T) -> f64 {
        1.0
    }
}

impl<T> From<CountQueuingStrategy> for QueuingStrategy<T> {
    fn from(value: CountQueuingStrategy) -> Self {
        Self {
            high_water_mark: Some(value.high_water_mark),
            size: Some(SizeFunction::Native(NativeSizeFunction::Count)),
        }
    }
}
