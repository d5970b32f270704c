// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
mod controller;
mod stream;
mod transformer;

pub use controller::TransformStreamDefaultController;
pub use stream::TransformStream;
pub use transformer::Transformer;
