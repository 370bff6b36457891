use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{ChangeBroker, Subscription};
use crate::error::GpioError;
use crate::gate::TimedGate;

/// Waits until a pin reads a target value and keeps it for a debounce interval.
///
/// Every transition that matches the target (re)arms a [`TimedGate`]; a
/// transition away from the target abandons the attempt. The gate settling
/// while the last seen value still matches is success.
pub struct SteadyStateWaiter<'a> {
    broker: &'a ChangeBroker,
    debounce: Duration,
}

impl<'a> SteadyStateWaiter<'a> {
    pub fn new(broker: &'a ChangeBroker, debounce: Duration) -> Self {
        Self { broker, debounce }
    }

    /// `current` is sampled once, right after subscribing, so a pin that is
    /// already at `target` only needs to hold it for one debounce interval.
    /// The subscription is released before any outcome is returned.
    pub async fn wait_for_value<F>(
        &self,
        target: bool,
        current: F,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), GpioError>
    where
        F: FnOnce() -> Result<bool, GpioError>,
    {
        let subscription = self.broker.register().await?;

        let seed = match current() {
            Ok(value) => value,
            Err(e) => {
                subscription.release().await;
                return Err(e);
            }
        };

        let settle = self.settle(&subscription, target, seed, cancel);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, settle)
                .await
                .unwrap_or(Err(GpioError::Timeout(limit))),
            None => settle.await,
        };

        subscription.release().await;
        outcome
    }

    async fn settle(
        &self,
        subscription: &Subscription,
        target: bool,
        seed: bool,
        cancel: &CancellationToken,
    ) -> Result<(), GpioError> {
        let gate = TimedGate::new();
        let mut pending = Some(seed);

        loop {
            let value = match pending.take() {
                Some(value) => value,
                None => match subscription.next(None, cancel).await? {
                    Some(value) => value,
                    None => continue,
                },
            };
            if value != target {
                continue;
            }

            gate.arm_then_settle_after(self.debounce)?;
            loop {
                tokio::select! {
                    biased;
                    next = subscription.next(None, cancel) => match next? {
                        Some(value) if value == target => gate.arm_then_settle_after(self.debounce)?,
                        Some(_) => {
                            gate.arm()?;
                            break;
                        }
                        None => {}
                    },
                    settled = gate.wait_until_settled(cancel) => return settled,
                }
            }
        }
    }
}
