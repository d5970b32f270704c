// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, fmt, rc::Rc};

use brook_exceptions::{DOMException, DOMExceptionName, Exception, Result};
use brook_utils::mc_oneshot;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Rc<dyn Fn(&AbortSignal)>;

struct AbortSignalInner {
    aborted: bool,
    reason: Option<Exception>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,
    sender: mc_oneshot::Sender<Exception>,
}

/// Cooperative cancellation flag shared between an [`AbortController`] and
/// the operations observing it.
///
/// [`AbortController`]: crate::AbortController
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<RefCell<AbortSignalInner>>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("AbortSignal")
            .field("aborted", &inner.aborted)
            .field("reason", &inner.reason)
            .finish()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (sender, _) = mc_oneshot::channel::<Exception>();
        Self {
            inner: Rc::new(RefCell::new(AbortSignalInner {
                aborted: false,
                reason: None,
                listeners: Vec::new(),
                next_listener_id: 0,
                sender,
            })),
        }
    }

    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    pub fn reason(&self) -> Option<Exception> {
        self.inner.borrow().reason.clone()
    }

    pub fn throw_if_aborted(&self) -> Result<()> {
        let inner = self.inner.borrow();
        if inner.aborted {
            return Err(inner.reason.clone().unwrap_or_default());
        }
        Ok(())
    }

    /// Registers an `abort` listener. Listeners run once, in registration
    /// order, when the signal aborts.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AbortSignal) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, Rc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner
            .borrow_mut()
            .listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Resolves with the abort reason once the signal aborts.
    pub fn on_abort(&self) -> mc_oneshot::ReceiverWaiter<Exception> {
        self.inner.borrow().sender.subscribe().recv()
    }

    pub(crate) fn send_aborted(&self, reason: Option<Exception>) {
        let (reason, listeners) = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            let reason = get_reason_or_dom_exception(reason, DOMExceptionName::AbortError);
            inner.reason = Some(reason.clone());
            (reason, std::mem::take(&mut inner.listeners))
        };
        trace!(%reason, "abort signal aborted");
        self.inner.borrow().sender.send(reason);
        for (_, listener) in listeners {
            listener(self);
        }
    }

    /// A signal that is already aborted.
    pub fn abort(reason: Option<Exception>) -> Self {
        let signal = Self::new();
        signal.send_aborted(reason);
        signal
    }

    /// A signal that aborts as soon as any of `signals` aborts, with that
    /// signal's reason.
    pub fn any(signals: &[AbortSignal]) -> Self {
        let new_signal = Self::new();

        if let Some(aborted) = signals.iter().find(|signal| signal.aborted()) {
            new_signal.send_aborted(aborted.reason());
            return new_signal;
        }

        for signal in signals {
            let new_signal = new_signal.clone();
            signal.add_listener(move |source| new_signal.send_aborted(source.reason()));
        }

        new_signal
    }

    /// A signal that aborts with a `TimeoutError` after `milliseconds`.
    ///
    /// Must be called from within a `LocalSet`.
    #[cfg(feature = "sleep-tokio")]
    pub fn timeout(milliseconds: u64) -> Self {
        let signal = Self::new();
        let timeout_signal = signal.clone();
        brook_utils::ctx::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(milliseconds)).await;
            let timeout_error =
                get_reason_or_dom_exception(None, DOMExceptionName::TimeoutError);
            timeout_signal.send_aborted(Some(timeout_error));
        });
        signal
    }
}

fn get_reason_or_dom_exception(reason: Option<Exception>, name: DOMExceptionName) -> Exception {
    match reason {
        Some(Exception::Undefined) | None => {
            let message = match name {
                DOMExceptionName::TimeoutError => "The operation timed out",
                _ => "This operation was aborted",
            };
            DOMException::with_name(name, message).into()
        },
        Some(reason) => reason,
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, time::Duration};

    use brook_test::test_async_with;

    use super::*;
    use crate::AbortController;

    #[test]
    fn debug_shows_abort_state() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert_eq!(
            format!("{signal:?}"),
            "AbortSignal { aborted: false, reason: None }"
        );

        controller.abort(Some(Exception::message("stop")));
        let rendered = format!("{signal:?}");
        assert!(rendered.starts_with("AbortSignal { aborted: true, reason: Some("));
        assert!(rendered.contains("stop"));
    }

    #[test]
    fn abort_defaults_to_abort_error() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(signal.throw_if_aborted().is_ok());

        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        signal.add_listener(move |_| fired2.set(fired2.get() + 1));
        let removed = signal.add_listener(|_| panic!("removed listener ran"));
        signal.remove_listener(removed);

        controller.abort(None);
        controller.abort(Some(Exception::message("ignored")));

        assert!(signal.aborted());
        assert_eq!(fired.get(), 1);
        assert_eq!(signal.reason().unwrap().dom_name(), Some("AbortError"));
        assert_eq!(
            signal.throw_if_aborted().unwrap_err().dom_name(),
            Some("AbortError")
        );
    }

    #[test]
    fn any_follows_first_aborted_signal() {
        let a = AbortController::new();
        let b = AbortController::new();
        let combined = AbortSignal::any(&[a.signal(), b.signal()]);
        assert!(!combined.aborted());

        b.abort(Some(Exception::message("b")));
        assert_eq!(combined.reason(), Some(Exception::message("b")));

        a.abort(Some(Exception::message("a")));
        assert_eq!(combined.reason(), Some(Exception::message("b")));

        let already = AbortSignal::any(&[AbortSignal::abort(Some(Exception::message("x")))]);
        assert!(already.aborted());
        assert_eq!(already.reason(), Some(Exception::message("x")));
    }

    #[tokio::test]
    async fn test_abort_signal_timeout() {
        test_async_with(|| {
            Box::pin(async move {
                let signal = AbortSignal::timeout(5);
                let waiter = signal.on_abort();

                assert!(!signal.aborted());

                tokio::time::sleep(Duration::from_millis(50)).await;

                assert!(signal.aborted());
                assert_eq!(waiter.await.dom_name(), Some("TimeoutError"));
                assert_eq!(signal.reason().unwrap().dom_name(), Some("TimeoutError"));
            })
        })
        .await;
    }
}
