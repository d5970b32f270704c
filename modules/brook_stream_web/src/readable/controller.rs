// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::rc::Rc;

use brook_exceptions::{Exception, Result};

use super::{byte_controller::ReadableByteStreamController, reader::ReadRequest, ReadableStream};
use crate::utils::promise::AlgorithmFuture;

/// The internal steps a readable stream delegates to whichever controller
/// it was constructed with.
pub(crate) trait ReadableStreamControllerSteps<T: 'static> {
    fn cancel_steps(&self, reason: Exception) -> AlgorithmFuture;

    fn pull_steps(&self, read_request: ReadRequest<T>);

    fn release_steps(&self);

    fn as_byte_controller(&self) -> Option<ReadableByteStreamController> {
        None
    }

    /// Controllers with their own tee algorithm return it here.
    fn tee_steps(&self) -> Option<Result<(ReadableStream<T>, ReadableStream<T>)>> {
        None
    }
}

pub(crate) type ReadableStreamControllerRef<T> = Rc<dyn ReadableStreamControllerSteps<T>>;
