//! A one-shot result cell.
//!
//! The producing side stores a value exactly once and wakes the waiter; the
//! consuming side awaits the value. This is the completion channel for
//! delegated partition actions and for anything else that runs on another
//! core on a task's behalf.

use crate::sync::WaitCell;
use crate::sync::spin;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, ready};
use std::sync::Arc;

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        value: spin::Mutex::new(None),
        rx_waker: WaitCell::new(),
    });

    let tx = Sender {
        inner: Some(inner.clone()),
    };
    let rx = Receiver { inner };

    (tx, rx)
}

#[derive(Debug)]
pub struct Sender<T> {
    inner: Option<Arc<Inner<T>>>,
}

#[derive(Debug)]
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    value: spin::Mutex<Option<T>>,
    rx_waker: WaitCell,
}

/// Error returned when the sender was dropped without sending a value.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct RecvError(pub(crate) ());

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("sender dropped without sending")
    }
}

impl core::error::Error for RecvError {}

// === impl Sender ===

impl<T> Sender<T> {
    /// Sends `value` to the receiver, waking it.
    ///
    /// This method never blocks.
    ///
    /// # Errors
    ///
    /// If the receiver was already dropped or closed, the value is handed
    /// back in the `Err` variant.
    pub fn send(mut self, value: T) -> Result<(), T> {
        let inner = self.inner.take().expect("send called twice");

        if inner.rx_waker.is_closed() {
            return Err(value);
        }

        *inner.value.lock() = Some(value);
        inner.rx_waker.wake();

        Ok(())
    }

    /// Returns `true` if the associated [`Receiver`] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.rx_waker.is_closed())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // Dropping without sending closes the channel so the receiver does
        // not wait forever.
        if let Some(inner) = self.inner.take() {
            inner.rx_waker.close();
        }
    }
}

// === impl Receiver ===

impl<T> Receiver<T> {
    pub fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Result<T, RecvError>> {
        loop {
            // A present value wins over a racing close: the sender stores the
            // value before waking.
            if let Some(value) = self.inner.value.lock().take() {
                return Poll::Ready(Ok(value));
            }

            match ready!(self.inner.rx_waker.poll_wait(cx)) {
                Ok(()) => {
                    // Woken: re-check the value slot. A spurious wake just
                    // loops back into registration.
                }
                Err(_) => {
                    let value = self.inner.value.lock().take();
                    return Poll::Ready(value.ok_or(RecvError(())));
                }
            }
        }
    }
}

impl<T> Future for Receiver<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_recv(cx)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.rx_waker.close();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::pin::pin;
    use std::sync::Arc as StdArc;
    use std::task::{Wake, Waker};

    struct Nop;
    impl Wake for Nop {
        fn wake(self: StdArc<Self>) {}
    }

    #[test]
    fn send_then_recv() {
        let (tx, rx) = channel::<u32>();
        tx.send(7).unwrap();

        let waker = Waker::from(StdArc::new(Nop));
        let mut cx = Context::from_waker(&waker);
        let mut rx = pin!(rx);
        assert_eq!(rx.as_mut().poll(&mut cx), Poll::Ready(Ok(7)));
    }

    #[test]
    fn dropped_sender_errors() {
        let (tx, rx) = channel::<u32>();
        drop(tx);

        let waker = Waker::from(StdArc::new(Nop));
        let mut cx = Context::from_waker(&waker);
        let mut rx = pin!(rx);
        assert_eq!(rx.as_mut().poll(&mut cx), Poll::Ready(Err(RecvError(()))));
    }

    #[test]
    fn dropped_receiver_rejects_send() {
        let (tx, rx) = channel::<u32>();
        drop(rx);
        assert_eq!(tx.send(7), Err(7));
    }
}
