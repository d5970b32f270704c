// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, future::ready, rc::Rc};

use brook_exceptions::Exception;

use crate::utils::promise::AlgorithmFuture;

pub(crate) type StartFn<C> = Box<dyn FnOnce(C) -> AlgorithmFuture>;
pub(crate) type PullFn<C> = Box<dyn FnMut(C) -> AlgorithmFuture>;
pub(crate) type CancelFn = Box<dyn FnOnce(Exception) -> AlgorithmFuture>;

pub(crate) enum StartAlgorithm<C> {
    ReturnUndefined,
    Function(StartFn<C>),
}

impl<C> StartAlgorithm<C> {
    pub(crate) fn call(self, controller: C) -> AlgorithmFuture {
        match self {
            Self::ReturnUndefined => Box::pin(ready(Ok(()))),
            Self::Function(f) => f(controller),
        }
    }
}

pub(crate) enum PullAlgorithm<C> {
    ReturnPromiseUndefined,
    Function(Rc<RefCell<PullFn<C>>>),
}

impl<C> Clone for PullAlgorithm<C> {
    fn clone(&self) -> Self {
        match self {
            Self::ReturnPromiseUndefined => Self::ReturnPromiseUndefined,
            Self::Function(f) => Self::Function(f.clone()),
        }
    }
}

impl<C> PullAlgorithm<C> {
    pub(crate) fn from_fn(f: PullFn<C>) -> Self {
        Self::Function(Rc::new(RefCell::new(f)))
    }

    pub(crate) fn call(&self, controller: C) -> AlgorithmFuture {
        match self {
            Self::ReturnPromiseUndefined => Box::pin(ready(Ok(()))),
            Self::Function(f) => (f.borrow_mut())(controller),
        }
    }
}

pub(crate) enum CancelAlgorithm {
    ReturnPromiseUndefined,
    Function(CancelFn),
}

impl CancelAlgorithm {
    pub(crate) fn call(self, reason: Exception) -> AlgorithmFuture {
        match self {
            Self::ReturnPromiseUndefined => Box::pin(ready(Ok(()))),
            Self::Function(f) => f(reason),
        }
    }
}
