//! Fan-out of one pin's transitions to any number of subscribers.
//!
//! The broker starts a [`ChangeWatcher`] when the first [`Subscription`] is
//! registered and stops it when the last one is released. Every transition the
//! watcher emits is copied into the private queue of each subscription that is
//! registered at that moment, so a subscriber sees exactly the transitions
//! emitted during its lifetime, in order.

use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::error::GpioError;
use crate::queue::AwaitableQueue;
use crate::watcher::{ChangeWatcher, TransitionSink, WatchSource, WatchStrategy};

pub struct ChangeBroker {
    shared: Arc<BrokerShared>,
}

struct BrokerShared {
    source: WatchSource,
    registry: Mutex<Registry>,
    // serializes watcher start/stop so at most one watcher is ever alive
    lifecycle: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Registry {
    subscribers: FxHashMap<u64, Arc<AwaitableQueue<bool>>>,
    watcher: Option<ChangeWatcher>,
    // cancelled by a dropped subscription but not yet awaited
    stopping: Option<ChangeWatcher>,
    generation: u64,
    closed: bool,
}

impl ChangeBroker {
    pub fn new(source: WatchSource) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                source,
                registry: Mutex::new(Registry::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a new subscriber, starting the watcher if none is running.
    pub async fn register(&self) -> Result<Subscription, GpioError> {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let stale = self.shared.registry.lock().stopping.take();
        if let Some(watcher) = stale {
            watcher.stop().await;
        }

        let generation = {
            let mut registry = self.shared.registry.lock();
            if registry.closed {
                return Err(GpioError::Disposed("change broker"));
            }
            let needs_watcher = registry.subscribers.is_empty()
                || registry.watcher.as_ref().is_none_or(ChangeWatcher::is_finished);
            if !needs_watcher {
                return Ok(self.attach(&mut registry));
            }
            registry.generation + 1
        };

        // the registry lock is not held while the watcher starts; the
        // lifecycle lock keeps any other start or stop out meanwhile
        let watcher = ChangeWatcher::start(&self.shared.source, self.sink(generation)).await?;

        let mut registry = self.shared.registry.lock();
        registry.generation = generation;
        registry.watcher = Some(watcher);
        Ok(self.attach(&mut registry))
    }

    fn attach(&self, registry: &mut Registry) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(AwaitableQueue::new());
        registry.subscribers.insert(id, queue.clone());
        debug!(
            "subscription {id} registered on line {} ({} live)",
            self.shared.source.line,
            registry.subscribers.len()
        );

        Subscription {
            id,
            queue,
            shared: self.shared.clone(),
            released: false,
        }
    }

    fn sink(&self, generation: u64) -> TransitionSink {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |value| {
            if let Some(shared) = shared.upgrade() {
                shared.dispatch(generation, value);
            }
        })
    }

    /// Disposes every live subscription and stops the watcher for good.
    pub async fn shutdown(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let (queues, watcher, stale) = {
            let mut registry = self.shared.registry.lock();
            registry.closed = true;
            let queues: Vec<_> = registry.subscribers.drain().map(|(_, q)| q).collect();
            (queues, registry.watcher.take(), registry.stopping.take())
        };

        for queue in queues {
            queue.dispose();
        }
        for watcher in [stale, watcher].into_iter().flatten() {
            watcher.stop().await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.lock().subscribers.len()
    }

    pub fn is_watching(&self) -> bool {
        self.shared
            .registry
            .lock()
            .watcher
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    pub fn watch_strategy(&self) -> Option<WatchStrategy> {
        self.shared
            .registry
            .lock()
            .watcher
            .as_ref()
            .map(ChangeWatcher::strategy)
    }

    /// How many watchers have been started so far.
    pub fn watcher_starts(&self) -> u64 {
        self.shared.registry.lock().generation
    }
}

impl BrokerShared {
    fn dispatch(&self, generation: u64, value: bool) {
        let registry = self.registry.lock();
        if registry.generation != generation || registry.watcher.is_none() {
            return;
        }
        for (id, queue) in registry.subscribers.iter() {
            if let Err(e) = queue.enqueue(value) {
                debug!("subscription {id} missed a transition: {e}");
            }
        }
    }

    /// Returns whether `id` was still registered.
    async fn release(&self, id: u64) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        let (queue, watcher) = {
            let mut registry = self.registry.lock();
            let queue = registry.subscribers.remove(&id);
            let watcher = match (&queue, registry.subscribers.is_empty()) {
                (Some(_), true) => registry.watcher.take(),
                _ => None,
            };
            (queue, watcher)
        };

        let Some(queue) = queue else {
            return false;
        };
        queue.dispose();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
        true
    }

    /// Release path for subscriptions dropped without `release().await`.
    fn release_now(&self, id: u64) {
        let mut registry = self.registry.lock();
        let Some(queue) = registry.subscribers.remove(&id) else {
            return;
        };
        queue.dispose();

        if registry.subscribers.is_empty()
            && let Some(watcher) = registry.watcher.take()
        {
            watcher.signal_stop();
            registry.stopping = Some(watcher);
        }
    }
}

/// A private, ordered view of the transitions emitted while it is alive.
///
/// Release it with [`release`](Self::release) to wait for the watcher to wind
/// down; dropping it also deregisters, without waiting.
pub struct Subscription {
    id: u64,
    queue: Arc<AwaitableQueue<bool>>,
    shared: Arc<BrokerShared>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next transition, or `Ok(None)` if `timeout` elapsed first.
    pub async fn next(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<bool>, GpioError> {
        self.queue.try_dequeue(timeout, cancel).await
    }

    pub fn blocking_next(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<bool>, GpioError> {
        self.queue.blocking_dequeue(timeout, cancel)
    }

    pub async fn release(mut self) {
        // if this future is dropped early, Drop finishes the job
        self.shared.release(self.id).await;
        self.released = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.released {
            self.shared.release_now(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::backend::{DummyGpioBackend, SysfsGpioBackend};
    use crate::config::{Direction, PinOptions, WatchMode};
    use crate::gpio::GpioBackend;

    const LINE: u32 = 12;
    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    fn set_value_file(dir: &std::path::Path, text: &str) {
        // rename so a concurrent poll never reads a truncated file
        fs::write(dir.join("value.tmp"), text).unwrap();
        fs::rename(dir.join("value.tmp"), dir.join("value")).unwrap();
    }

    fn dummy_broker() -> (Arc<DummyGpioBackend>, ChangeBroker) {
        let dummy = Arc::new(DummyGpioBackend::default());
        dummy.write_direction(LINE, Direction::Output, Some(false)).unwrap();
        let broker = ChangeBroker::new(WatchSource::new(
            dummy.clone(),
            LINE,
            Arc::new(PinOptions::default()),
        ));
        (dummy, broker)
    }

    #[tokio::test]
    async fn watcher_lives_exactly_as_long_as_subscribers() {
        let (_dummy, broker) = dummy_broker();
        assert!(!broker.is_watching());

        let a = broker.register().await.unwrap();
        let b = broker.register().await.unwrap();
        assert!(broker.is_watching());
        assert_eq!(broker.watcher_starts(), 1);
        assert_eq!(broker.watch_strategy(), Some(WatchStrategy::Native));

        a.release().await;
        assert!(broker.is_watching());
        b.release().await;
        assert!(!broker.is_watching());
        assert_eq!(broker.subscriber_count(), 0);

        let c = broker.register().await.unwrap();
        assert_eq!(broker.watcher_starts(), 2);
        c.release().await;
    }

    #[tokio::test]
    async fn subscribers_see_only_their_own_window() {
        let (dummy, broker) = dummy_broker();
        let cancel = CancellationToken::new();

        let a = broker.register().await.unwrap();
        dummy.write_value(LINE, true).unwrap();
        dummy.write_value(LINE, false).unwrap();
        assert_eq!(a.next(SHORT, &cancel).await.unwrap(), Some(true));
        assert_eq!(a.next(SHORT, &cancel).await.unwrap(), Some(false));

        let b = broker.register().await.unwrap();
        dummy.write_value(LINE, true).unwrap();
        assert_eq!(a.next(SHORT, &cancel).await.unwrap(), Some(true));
        a.release().await;

        dummy.write_value(LINE, false).unwrap();
        assert_eq!(b.next(SHORT, &cancel).await.unwrap(), Some(true));
        assert_eq!(b.next(SHORT, &cancel).await.unwrap(), Some(false));
        assert_eq!(b.next(SHORT, &cancel).await.unwrap(), None);
        b.release().await;
    }

    #[tokio::test]
    async fn double_release_is_a_no_op() {
        let (_dummy, broker) = dummy_broker();
        let a = broker.register().await.unwrap();
        let b = broker.register().await.unwrap();

        let id = a.id();
        a.release().await;
        assert!(!broker.shared.release(id).await);
        broker.shared.release_now(id);
        assert_eq!(broker.subscriber_count(), 1);
        assert!(broker.is_watching());

        drop(b);
        assert_eq!(broker.subscriber_count(), 0);
        assert!(!broker.is_watching());
    }

    #[tokio::test]
    async fn dropped_subscription_watcher_is_reaped_before_restart() {
        let (_dummy, broker) = dummy_broker();
        drop(broker.register().await.unwrap());
        assert!(broker.shared.registry.lock().stopping.is_some());

        let again = broker.register().await.unwrap();
        assert!(broker.shared.registry.lock().stopping.is_none());
        assert_eq!(broker.watcher_starts(), 2);
        again.release().await;
    }

    #[tokio::test]
    async fn shutdown_disposes_live_queues() {
        let (_dummy, broker) = dummy_broker();
        let sub = broker.register().await.unwrap();

        broker.shutdown().await;
        assert!(matches!(
            sub.next(SHORT, &CancellationToken::new()).await,
            Err(GpioError::Disposed(_))
        ));
        assert!(matches!(broker.register().await, Err(GpioError::Disposed(_))));
        assert!(!broker.is_watching());
    }

    #[tokio::test]
    async fn dead_watcher_restarts_on_next_registration() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(format!("gpio{LINE}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("value"), "0").unwrap();

        let options = PinOptions {
            watch: WatchMode::Poll,
            ..PinOptions::default()
        };
        let broker = ChangeBroker::new(WatchSource::new(
            Arc::new(SysfsGpioBackend::new(tmp.path())),
            LINE,
            Arc::new(options),
        ));

        let first = broker.register().await.unwrap();
        assert_eq!(broker.watch_strategy(), Some(WatchStrategy::Poll));

        fs::remove_file(dir.join("value")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!broker.is_watching());

        set_value_file(&dir, "0");
        let second = broker.register().await.unwrap();
        assert!(broker.is_watching());
        assert_eq!(broker.watcher_starts(), 2);

        set_value_file(&dir, "1");
        let cancel = CancellationToken::new();
        let timeout = Some(Duration::from_secs(2));
        assert_eq!(first.next(timeout, &cancel).await.unwrap(), Some(true));
        assert_eq!(second.next(timeout, &cancel).await.unwrap(), Some(true));

        first.release().await;
        second.release().await;
    }

    #[tokio::test]
    async fn unreadable_pin_cannot_be_watched() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = ChangeBroker::new(WatchSource::new(
            Arc::new(SysfsGpioBackend::new(tmp.path())),
            3,
            Arc::new(PinOptions {
                watch: WatchMode::Poll,
                ..PinOptions::default()
            }),
        ));

        assert!(matches!(
            broker.register().await,
            Err(GpioError::WatcherUnavailable(_))
        ));
        assert_eq!(broker.subscriber_count(), 0);
    }
}
