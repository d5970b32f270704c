// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//! Single-threaded multi-consumer oneshot channel. The first value sent wins,
//! every receiver observes a clone of it.
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

struct Shared<T> {
    value: RefCell<Option<T>>,
    wakers: RefCell<Vec<Waker>>,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("is_sent", &self.value.borrow().is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Sender<T: Clone> {
    shared: Rc<Shared<T>>,
}

impl<T: Clone> Sender<T> {
    /// Returns `false` if a value was already sent.
    pub fn send(&self, value: T) -> bool {
        {
            let mut slot = self.shared.value.borrow_mut();
            if slot.is_some() {
                return false;
            }
            slot.replace(value);
        }
        let wakers = std::mem::take(&mut *self.shared.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_sent(&self) -> bool {
        self.shared.value.borrow().is_some()
    }

    pub fn subscribe(&self) -> Receiver<T> {
        Receiver {
            shared: Rc::clone(&self.shared),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Receiver<T: Clone> {
    shared: Rc<Shared<T>>,
}

impl<T: Clone> Receiver<T> {
    pub fn recv(&self) -> ReceiverWaiter<T> {
        ReceiverWaiter {
            shared: Rc::clone(&self.shared),
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.shared.value.borrow().clone()
    }

    pub fn is_sent(&self) -> bool {
        self.shared.value.borrow().is_some()
    }

    pub fn same_channel(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

pub struct ReceiverWaiter<T: Clone> {
    shared: Rc<Shared<T>>,
}

impl<T: Clone> Future for ReceiverWaiter<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(value) = self.shared.value.borrow().as_ref() {
            return Poll::Ready(value.clone());
        }

        // Register waker only if value not ready
        let mut wakers = self.shared.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }

        Poll::Pending
    }
}

pub fn channel<T: Clone>() -> (Sender<T>, Receiver<T>) {
    let shared = Rc::new(Shared {
        value: RefCell::new(None),
        wakers: RefCell::new(Vec::new()),
    });

    (
        Sender {
            shared: Rc::clone(&shared),
        },
        Receiver { shared },
    )
}

#[cfg(test)]
mod tests {
    use tokio::{join, task::LocalSet};

    #[tokio::test]
    async fn test() {
        LocalSet::new()
            .run_until(async {
                let (tx, rx1) = super::channel::<bool>();

                let rx2 = tx.subscribe();
                let rx3 = tx.subscribe();

                let a = tokio::task::spawn_local(async move {
                    let val = rx1.recv().await;
                    assert!(val)
                });

                let b = tokio::task::spawn_local(async move {
                    let val = rx2.recv().await;
                    assert!(val)
                });

                tokio::task::yield_now().await;

                assert!(tx.send(true));
                assert!(!tx.send(false));

                let val = rx3.recv().await;
                assert!(val);

                let (a, b) = join!(a, b);
                a.unwrap();
                b.unwrap();
            })
            .await;
    }
}
