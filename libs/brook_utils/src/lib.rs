// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#[cfg(feature = "array-buffer")]
pub mod array_buffer;
pub mod ctx;
pub mod mc_oneshot;
