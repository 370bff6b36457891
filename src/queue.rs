use std::collections::VecDeque;
use std::future::pending;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::GpioError;

/// How often a blocking consumer re-checks its cancellation token.
const BLOCKING_CANCEL_CHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Disposed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    lifecycle: Lifecycle,
}

/// Unbounded FIFO whose consumer can wait for the next item, either by
/// suspending a task or by blocking a thread.
///
/// A timed-out wait leaves the queue untouched. Waiting is cancel-safe: dropping
/// a pending `try_dequeue` future never loses an item.
pub struct AwaitableQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    notify: Notify,
}

impl<T> Default for AwaitableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AwaitableQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                lifecycle: Lifecycle::Active,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, item: T) -> Result<(), GpioError> {
        {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Disposed {
                return Err(GpioError::Disposed("queue"));
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the head item. `Ok(None)` means `timeout` elapsed first.
    pub async fn try_dequeue(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, GpioError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.pop()? {
                return Ok(Some(item));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GpioError::Cancelled),
                _ = &mut notified => {}
                _ = sleep_until_opt(deadline) => return Ok(None),
            }
        }
    }

    /// Thread-blocking counterpart of [`try_dequeue`](Self::try_dequeue).
    /// Must not be called from inside an async task.
    pub fn blocking_dequeue(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, GpioError> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if state.lifecycle == Lifecycle::Disposed {
                return Err(GpioError::Disposed("queue"));
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            if cancel.is_cancelled() {
                return Err(GpioError::Cancelled);
            }

            let slice_end = std::time::Instant::now() + BLOCKING_CANCEL_CHECK;
            match deadline {
                Some(deadline) if deadline <= std::time::Instant::now() => return Ok(None),
                Some(deadline) => {
                    self.available
                        .wait_until(&mut state, slice_end.min(deadline));
                }
                None => {
                    self.available.wait_until(&mut state, slice_end);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops pending items and wakes every waiter with `Disposed`.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            state.lifecycle = Lifecycle::Disposed;
            state.items.clear();
        }
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Result<Option<T>, GpioError> {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Disposed {
            return Err(GpioError::Disposed("queue"));
        }
        Ok(state.items.pop_front())
    }
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
