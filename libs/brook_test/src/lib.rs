// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{future::Future, pin::Pin};

use brook_utils::ctx;
use tokio::task::LocalSet;

pub use self::tracer::MinimalTracer;

mod tracer;

pub type TestFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Runs `func` inside a fresh `LocalSet` and settles outstanding jobs once it
/// returns.
pub async fn test_async_with<F>(func: F)
where
    F: FnOnce() -> TestFuture,
{
    test_async_with_opts(func, TestOptions::default()).await;
}

#[derive(Default)]
pub struct TestOptions {
    no_pending_jobs: bool,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the test if any spawned job is still alive after settling.
    pub fn no_pending_jobs(mut self) -> Self {
        self.no_pending_jobs = true;
        self
    }
}

pub async fn test_async_with_opts<F>(func: F, options: TestOptions)
where
    F: FnOnce() -> TestFuture,
{
    let _ = MinimalTracer::register();

    let local = LocalSet::new();
    local
        .run_until(async move {
            func().await;
            ctx::settle().await;

            if options.no_pending_jobs {
                assert_eq!(ctx::pending_jobs(), 0, "jobs still pending after test");
            }
        })
        .await;
}
