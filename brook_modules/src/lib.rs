// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//! Feature gated re-exports of the brook modules.
#[cfg(feature = "abort")]
pub use brook_abort as abort;
#[cfg(feature = "exceptions")]
pub use brook_exceptions as exceptions;
#[cfg(feature = "stream-web")]
pub use brook_stream_web as stream_web;
pub use brook_utils as utils;
