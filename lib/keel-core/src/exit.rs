//! Single-shot exit notifications.
//!
//! Every supervised component (an external process, the API server) hands back an [`ExitNotification`] when it starts.
//! The notification resolves exactly once: `Ok(())` when the component stopped cleanly, or `Err(e)` carrying the one
//! terminal error when it did not.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::future::FusedFuture;
use tokio::sync::oneshot;

/// Creates a linked notifier/notification pair.
pub fn exit_channel<E>() -> (ExitNotifier<E>, ExitNotification<E>) {
    let (tx, rx) = oneshot::channel();
    (ExitNotifier { tx }, ExitNotification { rx: Some(rx) })
}

/// The sending half of an exit notification.
///
/// Consumed on use, so at most one outcome can ever be reported. Dropping it without calling either method counts as a
/// clean exit.
pub struct ExitNotifier<E> {
    tx: oneshot::Sender<E>,
}

impl<E> ExitNotifier<E> {
    /// Reports a clean exit.
    pub fn complete(self) {
        drop(self.tx);
    }

    /// Reports an abnormal exit.
    pub fn fail(self, error: E) {
        // Nobody listening is fine: the component is gone either way.
        let _ = self.tx.send(error);
    }
}

/// The receiving half of an exit notification.
///
/// Once it has resolved, the notification is terminated and polling it again stays pending forever. Use
/// [`FusedFuture::is_terminated`] to skip notifications that have already fired.
#[must_use = "exit notifications do nothing unless awaited"]
pub struct ExitNotification<E> {
    rx: Option<oneshot::Receiver<E>>,
}

impl<E> fmt::Debug for ExitNotification<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitNotification")
            .field("terminated", &self.rx.is_none())
            .finish()
    }
}

impl<E> Future for ExitNotification<E> {
    type Output = Result<(), E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Pending;
        };

        let outcome = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(error)) => Err(error),
            Poll::Ready(Err(_)) => Ok(()),
        };

        self.rx = None;
        Poll::Ready(outcome)
    }
}

impl<E> FusedFuture for ExitNotification<E> {
    fn is_terminated(&self) -> bool {
        self.rx.is_none()
    }
}
