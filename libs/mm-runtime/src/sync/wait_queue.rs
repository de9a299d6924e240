use crate::error::Closed;
use crate::sync::spin;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::sync::Arc;
use mm_util::loom::sync::atomic::{AtomicU8, Ordering};

/// A queue of waiting tasks attached to some shared structure.
///
/// Tasks enqueue themselves at the tail with [`wait`] or at the head with
/// [`wait_front`]; [`wake`] releases the task at the head, [`wake_all`]
/// releases everyone. `wait_front` exists so that the most recently idled
/// waiter is reused first: the worker pool parks idle workers at the front,
/// which keeps a hot worker cycling instead of round-robining through cold
/// ones.
///
/// A [`wake`] that finds no waiter stores a permit which the next [`wait`]
/// consumes immediately. This closes the race where a waiter has decided to
/// sleep but has not yet been polled (and therefore not yet enqueued) when
/// the wakeup arrives.
///
/// [`wait`]: Self::wait
/// [`wait_front`]: Self::wait_front
/// [`wake`]: Self::wake
/// [`wake_all`]: Self::wake_all
#[derive(Debug)]
pub struct WaitQueue {
    inner: spin::Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    waiters: VecDeque<Arc<WaitNode>>,
    permits: usize,
    closed: bool,
}

#[derive(Debug)]
struct WaitNode {
    state: AtomicU8,
    waker: spin::Mutex<Option<Waker>>,
}

const WAITING: u8 = 0;
const WOKEN: u8 = 1;
const CLOSED: u8 = 2;

/// Future returned by [`WaitQueue::wait`] and [`WaitQueue::wait_front`].
///
/// The calling task is not enqueued until the future is first polled.
/// Dropping the future removes the task from the queue; if a wakeup had
/// already been assigned to it, the wakeup is forwarded to the next waiter so
/// it is not lost.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    queue: &'a WaitQueue,
    front: bool,
    state: WaitState,
}

enum WaitState {
    Init,
    Waiting(Arc<WaitNode>),
    Done,
}

// === impl WaitQueue ===

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                waiters: VecDeque::new(),
                permits: 0,
                closed: false,
            }),
        }
    }

    /// Waits at the tail of the queue.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            queue: self,
            front: false,
            state: WaitState::Init,
        }
    }

    /// Waits at the head of the queue, so this task is released by the next
    /// [`wake`](Self::wake) before any earlier waiter.
    pub fn wait_front(&self) -> Wait<'_> {
        Wait {
            queue: self,
            front: true,
            state: WaitState::Init,
        }
    }

    /// Releases the task at the head of the queue.
    ///
    /// Returns `true` if a waiting task was woken; `false` if the queue was
    /// empty (in which case a permit is stored for the next waiter).
    pub fn wake(&self) -> bool {
        let woken = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            match inner.waiters.pop_front() {
                Some(node) => {
                    node.state.store(WOKEN, Ordering::Release);
                    Some(node)
                }
                None => {
                    inner.permits += 1;
                    None
                }
            }
        };

        match woken {
            Some(node) => {
                node.wake();
                true
            }
            None => false,
        }
    }

    /// Releases every waiting task. Does not store permits.
    pub fn wake_all(&self) {
        let drained: VecDeque<_> = {
            let mut inner = self.inner.lock();
            for node in &inner.waiters {
                node.state.store(WOKEN, Ordering::Release);
            }
            core::mem::take(&mut inner.waiters)
        };

        for node in drained {
            node.wake();
        }
    }

    /// Closes the queue: all current and future waiters observe [`Closed`].
    pub fn close(&self) {
        let drained: VecDeque<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            for node in &inner.waiters {
                node.state.store(CLOSED, Ordering::Release);
            }
            core::mem::take(&mut inner.waiters)
        };

        for node in drained {
            node.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of tasks currently waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// === impl WaitNode ===

impl WaitNode {
    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match &this.state {
            WaitState::Init => {
                let mut inner = this.queue.inner.lock();
                if inner.closed {
                    this.state = WaitState::Done;
                    return Poll::Ready(Err(Closed(())));
                }
                if inner.permits > 0 {
                    inner.permits -= 1;
                    this.state = WaitState::Done;
                    return Poll::Ready(Ok(()));
                }

                let node = Arc::new(WaitNode {
                    state: AtomicU8::new(WAITING),
                    waker: spin::Mutex::new(Some(cx.waker().clone())),
                });
                if this.front {
                    inner.waiters.push_front(node.clone());
                } else {
                    inner.waiters.push_back(node.clone());
                }
                drop(inner);

                this.state = WaitState::Waiting(node);
                Poll::Pending
            }
            WaitState::Waiting(node) => match node.state.load(Ordering::Acquire) {
                WOKEN => {
                    this.state = WaitState::Done;
                    Poll::Ready(Ok(()))
                }
                CLOSED => {
                    this.state = WaitState::Done;
                    Poll::Ready(Err(Closed(())))
                }
                _ => {
                    *node.waker.lock() = Some(cx.waker().clone());
                    Poll::Pending
                }
            },
            WaitState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        let WaitState::Waiting(node) = &self.state else {
            return;
        };

        let mut inner = self.queue.inner.lock();
        if node.state.load(Ordering::Acquire) == WAITING {
            // Still enqueued; unlink ourselves.
            inner
                .waiters
                .retain(|candidate| !Arc::ptr_eq(candidate, node));
        } else if node.state.load(Ordering::Acquire) == WOKEN {
            // We were assigned a wakeup we will never consume; pass it on.
            match inner.waiters.pop_front() {
                Some(next) => {
                    next.state.store(WOKEN, Ordering::Release);
                    drop(inner);
                    next.wake();
                }
                None => inner.permits += 1,
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::future::Future;
    use core::pin::pin;
    use std::sync::Arc as StdArc;
    use std::task::Wake;

    struct Flag(std::sync::atomic::AtomicBool);

    impl Wake for Flag {
        fn wake(self: StdArc<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn cx_with_flag() -> (StdArc<Flag>, Waker) {
        let flag = StdArc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        (flag, waker)
    }

    #[test]
    fn fifo_wake_order() {
        let queue = WaitQueue::new();

        let (flag_a, waker_a) = cx_with_flag();
        let (flag_b, waker_b) = cx_with_flag();

        let mut wait_a = pin!(queue.wait());
        let mut wait_b = pin!(queue.wait());

        assert!(
            wait_a
                .as_mut()
                .poll(&mut Context::from_waker(&waker_a))
                .is_pending()
        );
        assert!(
            wait_b
                .as_mut()
                .poll(&mut Context::from_waker(&waker_b))
                .is_pending()
        );

        assert!(queue.wake());
        assert!(flag_a.0.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!flag_b.0.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn wait_front_is_lifo() {
        let queue = WaitQueue::new();

        let (flag_a, waker_a) = cx_with_flag();
        let (flag_b, waker_b) = cx_with_flag();

        let mut wait_a = pin!(queue.wait());
        let mut wait_b = pin!(queue.wait_front());

        assert!(
            wait_a
                .as_mut()
                .poll(&mut Context::from_waker(&waker_a))
                .is_pending()
        );
        assert!(
            wait_b
                .as_mut()
                .poll(&mut Context::from_waker(&waker_b))
                .is_pending()
        );

        assert!(queue.wake());
        assert!(flag_b.0.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!flag_a.0.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn wake_with_no_waiter_stores_permit() {
        let queue = WaitQueue::new();
        assert!(!queue.wake());

        let (_flag, waker) = cx_with_flag();
        let mut wait = pin!(queue.wait());
        assert_eq!(
            wait.as_mut().poll(&mut Context::from_waker(&waker)),
            Poll::Ready(Ok(()))
        );
    }

    #[test]
    fn dropped_waiter_forwards_wakeup() {
        let queue = WaitQueue::new();

        let (_flag_a, waker_a) = cx_with_flag();
        let (flag_b, waker_b) = cx_with_flag();

        let mut wait_a = Box::pin(queue.wait());
        let mut wait_b = Box::pin(queue.wait());

        assert!(
            wait_a
                .as_mut()
                .poll(&mut Context::from_waker(&waker_a))
                .is_pending()
        );
        assert!(
            wait_b
                .as_mut()
                .poll(&mut Context::from_waker(&waker_b))
                .is_pending()
        );

        assert!(queue.wake());
        // A was woken but drops before consuming; B must get the wakeup.
        drop(wait_a);
        assert!(flag_b.0.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(
            wait_b.as_mut().poll(&mut Context::from_waker(&waker_b)),
            Poll::Ready(Ok(()))
        );
    }

    #[test]
    fn close_releases_all_waiters_with_error() {
        let queue = WaitQueue::new();

        let (_flag, waker) = cx_with_flag();
        let mut wait = pin!(queue.wait());
        assert!(
            wait.as_mut()
                .poll(&mut Context::from_waker(&waker))
                .is_pending()
        );

        queue.close();
        assert_eq!(
            wait.as_mut().poll(&mut Context::from_waker(&waker)),
            Poll::Ready(Err(Closed(())))
        );
    }
}
