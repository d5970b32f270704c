// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use brook_exceptions::{Exception, Result};
use brook_utils::{ctx, mc_oneshot};
use tokio::sync::oneshot;

/// Future returned by the user supplied start/pull/write/close/cancel/abort
/// callbacks.
pub type AlgorithmFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// Awaitable side of a multi-consumer completion.
///
/// Clones observe the same settlement.
pub struct Promise<T: Clone = ()> {
    receiver: mc_oneshot::Receiver<Result<T>>,
}

impl<T: Clone> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.receiver.try_recv() {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_tuple("Promise").field(&state).finish()
    }
}

impl<T: Clone + 'static> Promise<T> {
    pub fn resolved(value: T) -> Self {
        ResolveablePromise::resolved(value).promise()
    }

    pub fn rejected(error: Exception) -> Self {
        ResolveablePromise::rejected(error).promise()
    }

    /// The settlement, without waiting for it.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.receiver.try_recv()
    }

    pub fn is_pending(&self) -> bool {
        !self.receiver.is_sent()
    }

    /// Whether both handles belong to the same completion.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.receiver.same_channel(&other.receiver)
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut waiter = self.receiver.recv();
        Pin::new(&mut waiter).poll(cx)
    }
}

/// Resolver side of a [`Promise`]. Settling is first-wins; later calls are
/// ignored.
pub struct ResolveablePromise<T: Clone = ()> {
    sender: mc_oneshot::Sender<Result<T>>,
}

impl<T: Clone> Clone for ResolveablePromise<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + 'static> Default for ResolveablePromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> ResolveablePromise<T> {
    pub fn new() -> Self {
        let (sender, _) = mc_oneshot::channel();
        Self { sender }
    }

    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.resolve(value);
        promise
    }

    pub fn rejected(error: Exception) -> Self {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    pub fn promise(&self) -> Promise<T> {
        Promise {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn resolve(&self, value: T) {
        self.sender.send(Ok(value));
    }

    pub fn reject(&self, error: Exception) {
        self.sender.send(Err(error));
    }

    pub fn settle(&self, result: Result<T>) {
        self.sender.send(result);
    }

    pub fn is_pending(&self) -> bool {
        !self.sender.is_sent()
    }
}

impl ResolveablePromise<()> {
    pub fn resolved_with_undefined() -> Self {
        Self::resolved(())
    }

    pub fn resolve_undefined(&self) {
        self.resolve(())
    }
}

/// Awaitable side of a single-consumer completion carrying an owned value.
pub struct OncePromise<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> OncePromise<T> {
    pub fn resolved(value: T) -> Self {
        let (resolver, promise) = once_channel();
        resolver.resolve(value);
        promise
    }

    pub fn rejected(error: Exception) -> Self {
        let (resolver, promise) = once_channel();
        resolver.reject(error);
        promise
    }
}

impl<T> Future for OncePromise<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Exception::throw_type(
                "Promise was dropped before it settled",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct OnceResolver<T> {
    sender: oneshot::Sender<Result<T>>,
}

impl<T> OnceResolver<T> {
    pub fn resolve(self, value: T) {
        // the caller may have stopped waiting
        let _ = self.sender.send(Ok(value));
    }

    pub fn reject(self, error: Exception) {
        let _ = self.sender.send(Err(error));
    }
}

pub fn once_channel<T>() -> (OnceResolver<T>, OncePromise<T>) {
    let (sender, receiver) = oneshot::channel();
    (OnceResolver { sender }, OncePromise { receiver })
}

/// Runs `then` once `promise` settles.
pub fn upon_promise<T, F>(promise: F, then: impl FnOnce(Result<T>) + 'static)
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    ctx::spawn(async move { then(promise.await) })
}

/// Reacts to `promise` and returns a new promise settled with the reaction's
/// result.
pub fn transform_promise<T, U, F>(promise: F, then: impl FnOnce(Result<T>) -> Result<U> + 'static) -> Promise<U>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
    U: Clone + 'static,
{
    let result = ResolveablePromise::new();
    let resolver = result.clone();
    upon_promise(promise, move |settled| resolver.settle(then(settled)));
    result.promise()
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;

    use super::*;

    #[tokio::test]
    async fn first_settlement_wins() {
        test_async_with(|| {
            Box::pin(async move {
                let resolveable = ResolveablePromise::<u8>::new();
                let promise = resolveable.promise();
                assert!(promise.is_pending());
                assert!(promise.try_result().is_none());

                resolveable.resolve(1);
                resolveable.reject(Exception::message("late"));
                resolveable.resolve(2);

                assert_eq!(promise.clone().await, Ok(1));
                assert_eq!(promise.await, Ok(1));
                assert!(!resolveable.is_pending());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn reactions_run_after_settlement() {
        test_async_with(|| {
            Box::pin(async move {
                let resolveable = ResolveablePromise::<()>::new();
                let transformed = transform_promise(resolveable.promise(), |result| {
                    result.map(|()| "done")
                });
                ctx::settle().await;
                assert!(transformed.is_pending());

                resolveable.resolve_undefined();
                assert_eq!(transformed.await, Ok("done"));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn dropped_once_resolver_rejects() {
        test_async_with(|| {
            Box::pin(async move {
                let (resolver, promise) = once_channel::<String>();
                drop(resolver);
                assert!(promise.await.unwrap_err().is_type_error());

                assert_eq!(OncePromise::resolved(3).await, Ok(3));
            })
        })
        .await;
    }
}
