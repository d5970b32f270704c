// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//! Cooperative job scheduling on the current [`tokio::task::LocalSet`].
//!
//! Every "upon settlement" reaction in the workspace runs as a tracked job so
//! that callers (and tests) can wait for the job queue to go quiet with
//! [`settle`] instead of relying on incidental task ordering.
use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    sync::OnceLock,
    task::{Context, Poll},
};

use brook_exceptions::Exception;
use tracing::trace;

#[allow(clippy::type_complexity)]
static ERROR_HANDLER: OnceLock<Box<dyn Fn(&Exception) + Sync + Send>> = OnceLock::new();

thread_local! {
    static LIVE_JOBS: Cell<usize> = const { Cell::new(0) };
    static JOB_POLLS: Cell<u64> = const { Cell::new(0) };
}

struct Job {
    future: Pin<Box<dyn Future<Output = ()>>>,
}

impl Job {
    fn new(future: Pin<Box<dyn Future<Output = ()>>>) -> Self {
        LIVE_JOBS.with(|jobs| jobs.set(jobs.get() + 1));
        Self { future }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        LIVE_JOBS.with(|jobs| jobs.set(jobs.get().saturating_sub(1)));
    }
}

impl Future for Job {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        JOB_POLLS.with(|polls| polls.set(polls.get().wrapping_add(1)));
        self.future.as_mut().poll(cx)
    }
}

/// Installs the process wide handler for failed jobs. Returns `false` if a
/// handler was already installed.
pub fn set_error_handler<F>(handler: F) -> bool
where
    F: Fn(&Exception) + Sync + Send + 'static,
{
    ERROR_HANDLER.set(Box::new(handler)).is_ok()
}

pub fn report_error(err: &Exception) {
    match ERROR_HANDLER.get() {
        Some(handler) => handler(err),
        None => trace!("Future error: {:?}", err),
    }
}

/// Spawns a job onto the current `LocalSet`.
///
/// Panics when called outside of a `LocalSet`.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    tokio::task::spawn_local(Job::new(Box::pin(future)));
}

/// Number of spawned jobs that have not completed yet.
pub fn pending_jobs() -> usize {
    LIVE_JOBS.with(Cell::get)
}

fn job_polls() -> u64 {
    JOB_POLLS.with(Cell::get)
}

/// Yields until a full scheduler pass polls no job.
pub async fn settle() {
    loop {
        let before = job_polls();
        tokio::task::yield_now().await;
        if job_polls() == before {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use brook_test::test_async_with;

    use super::*;

    #[tokio::test]
    async fn settle_runs_chained_jobs() {
        test_async_with(|| {
            Box::pin(async move {
                let log = Rc::new(RefCell::new(Vec::new()));
                let inner_log = log.clone();
                spawn(async move {
                    inner_log.borrow_mut().push(1);
                    let inner_log = inner_log.clone();
                    spawn(async move {
                        inner_log.borrow_mut().push(2);
                    });
                });
                settle().await;
                assert_eq!(*log.borrow(), vec![1, 2]);
                assert_eq!(pending_jobs(), 0);
            })
        })
        .await;
    }
}
