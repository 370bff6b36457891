use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GpioError;
use crate::queue::sleep_until_opt;

#[derive(Debug, Clone, Copy)]
enum GateState {
    /// Unset, optionally with a pending settle deadline.
    Armed(Option<Instant>),
    Settled,
    Disposed,
}

/// Manual-reset flag coupled to a restartable one-shot timer.
///
/// The timer is a deadline rather than a spawned task: the flag counts as set
/// once the deadline has passed, so re-arming simply replaces the deadline.
pub struct TimedGate {
    state: Mutex<GateState>,
    changed: Notify,
}

impl Default for TimedGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TimedGate {
    /// A fresh gate starts settled.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Settled),
            changed: Notify::new(),
        }
    }

    pub fn arm(&self) -> Result<(), GpioError> {
        self.transition(GateState::Armed(None))
    }

    /// Clears the flag and (re)starts the settle timer; the last caller wins.
    pub fn arm_then_settle_after(&self, duration: Duration) -> Result<(), GpioError> {
        self.transition(GateState::Armed(Some(Instant::now() + duration)))
    }

    pub fn settle_now(&self) -> Result<(), GpioError> {
        self.transition(GateState::Settled)
    }

    pub fn is_settled(&self) -> bool {
        match *self.state.lock() {
            GateState::Settled => true,
            GateState::Armed(Some(deadline)) => Instant::now() >= deadline,
            GateState::Armed(None) | GateState::Disposed => false,
        }
    }

    pub async fn wait_until_settled(&self, cancel: &CancellationToken) -> Result<(), GpioError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = match *self.state.lock() {
                GateState::Settled => return Ok(()),
                GateState::Disposed => return Err(GpioError::Disposed("timed gate")),
                GateState::Armed(Some(deadline)) if Instant::now() >= deadline => return Ok(()),
                GateState::Armed(deadline) => deadline,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GpioError::Cancelled),
                _ = &mut notified => {}
                _ = sleep_until_opt(deadline) => {}
            }
        }
    }

    /// Cancels the timer and wakes any waiter with `Disposed`.
    pub fn dispose(&self) {
        *self.state.lock() = GateState::Disposed;
        self.changed.notify_waiters();
    }

    fn transition(&self, next: GateState) -> Result<(), GpioError> {
        {
            let mut state = self.state.lock();
            if let GateState::Disposed = *state {
                return Err(GpioError::Disposed("timed gate"));
            }
            *state = next;
        }
        self.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearming_pushes_the_deadline_out() {
        let gate = Arc::new(TimedGate::new());
        let start = Instant::now();
        gate.arm_then_settle_after(Duration::from_millis(10)).unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait_until_settled(&CancellationToken::new()).await.unwrap();
                Instant::now()
            })
        };

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert!(!gate.is_settled());
        gate.arm_then_settle_after(Duration::from_millis(10)).unwrap();

        let settled_at = waiter.await.unwrap();
        assert_eq!(settled_at - start, Duration::from_millis(16));
    }

    #[tokio::test(start_paused = true)]
    async fn plain_arm_never_settles_on_its_own() {
        let gate = TimedGate::new();
        gate.arm_then_settle_after(Duration::from_millis(5)).unwrap();
        gate.arm().unwrap();

        let res = tokio::time::timeout(
            Duration::from_millis(50),
            gate.wait_until_settled(&CancellationToken::new()),
        )
        .await;
        assert!(res.is_err());

        gate.settle_now().unwrap();
        gate.wait_until_settled(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn dispose_wakes_waiter() {
        let gate = Arc::new(TimedGate::new());
        gate.arm().unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_settled(&CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;

        gate.dispose();
        assert!(matches!(waiter.await.unwrap(), Err(GpioError::Disposed(_))));
        assert!(gate.settle_now().is_err());
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let gate = TimedGate::new();
        gate.arm().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            gate.wait_until_settled(&cancel).await,
            Err(GpioError::Cancelled)
        ));
    }
}
