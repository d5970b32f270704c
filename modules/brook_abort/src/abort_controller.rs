// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use brook_exceptions::Exception;

use super::AbortSignal;

#[derive(Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Aborts the signal with `reason`, or with an `AbortError` when `None`.
    pub fn abort(&self, reason: Option<Exception>) {
        if self.signal.aborted() {
            //only once
            return;
        }
        self.signal.send_aborted(reason);
    }
}
