use log::{debug, info, warn};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{ChangeBroker, Subscription};
use crate::config::{Direction, PinOptions, WritePolicy};
use crate::error::GpioError;
use crate::gpio::GpioBackend;
use crate::steady::SteadyStateWaiter;
use crate::watcher::{PinReading, WatchSource, WatchStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinLifecycle {
    Unopened,
    Opening,
    Opened,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinValueChanged {
    pub line: u32,
    pub value: bool,
}

pub type ValueChangedHandler = Arc<dyn Fn(&PinValueChanged) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// The user-adjustable part of a pin's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSettings {
    pub direction: Direction,
    pub active_low: bool,
    pub raise_events: bool,
}

/// Requested configuration. Until the pin is opened these are the only source
/// of truth; `open` pushes them to the backend.
struct PinState {
    lifecycle: PinLifecycle,
    direction: Option<Direction>,
    active_low: Option<bool>,
    value: Option<bool>,
    raise_events: bool,
}

type HandlerList = RwLock<Vec<(HandlerId, ValueChangedHandler)>>;

struct EventPump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A single GPIO line.
///
/// Direction, polarity and value may be configured before [`open`](Self::open);
/// they are cached and applied in one go when the pin opens. Change
/// notifications, steady-state waits and pulses are available on the same
/// type regardless of direction; operations that need an output fail fast on
/// an input.
pub struct GpioPin {
    line: u32,
    name: String,
    options: Arc<PinOptions>,
    backend: Arc<dyn GpioBackend>,
    state: Arc<Mutex<PinState>>,
    source: WatchSource,
    broker: ChangeBroker,
    handlers: Arc<HandlerList>,
    next_handler: AtomicU64,
    pump: tokio::sync::Mutex<Option<EventPump>>,
    runtime: Option<Handle>,
}

impl GpioPin {
    pub fn new(
        line: u32,
        name: impl Into<String>,
        options: PinOptions,
        backend: Arc<dyn GpioBackend>,
    ) -> Self {
        let options = Arc::new(options);
        let state = Arc::new(Mutex::new(PinState {
            lifecycle: PinLifecycle::Unopened,
            direction: None,
            active_low: None,
            value: None,
            raise_events: false,
        }));

        // watchers see what `value()` sees: the cache until the pin is open
        let reader = {
            let state = state.clone();
            let backend = backend.clone();
            Arc::new(move || read_logical(&state.lock(), backend.as_ref(), line))
        };
        let source = WatchSource::new(backend.clone(), line, options.clone()).with_reader(reader);
        let broker = ChangeBroker::new(source.clone());

        Self {
            line,
            name: name.into(),
            options,
            backend,
            state,
            source,
            broker,
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_handler: AtomicU64::new(1),
            pump: tokio::sync::Mutex::new(None),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &PinOptions {
        &self.options
    }

    pub fn lifecycle(&self) -> PinLifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle() == PinLifecycle::Opened
    }

    /// Exports the line if configured to, then applies the cached polarity,
    /// followed by the cached direction together with any cached value.
    /// Opening is one-way: a second call fails with `AlreadyOpen`.
    pub async fn open(&self) -> Result<(), GpioError> {
        {
            let mut state = self.state.lock();
            match state.lifecycle {
                PinLifecycle::Disposed => return Err(GpioError::Disposed("pin")),
                PinLifecycle::Opening | PinLifecycle::Opened => {
                    return Err(GpioError::AlreadyOpen(self.to_string()));
                }
                PinLifecycle::Unopened => state.lifecycle = PinLifecycle::Opening,
            }
        }

        let exported = self.ensure_exported().await;

        // cached state is applied and `Opened` published under one lock, so a
        // setter running meanwhile lands either in the cache or on the line
        let (applied, raise_events) = {
            let mut state = self.state.lock();
            if state.lifecycle != PinLifecycle::Opening {
                // disposed while opening
                return Err(GpioError::Disposed("pin"));
            }
            let applied = exported.and_then(|()| self.apply_cached(&state));
            state.lifecycle = match applied {
                Ok(()) => PinLifecycle::Opened,
                Err(_) => PinLifecycle::Unopened,
            };
            (applied, state.raise_events)
        };
        applied?;
        info!("opened {self}");
        self.source.nudge();

        if raise_events {
            self.start_pump().await?;
        }
        Ok(())
    }

    fn apply_cached(&self, state: &PinState) -> Result<(), GpioError> {
        if let Some(active_low) = state.active_low {
            self.tolerate(
                "active_low",
                self.backend.write_active_low(self.line, active_low),
            )?;
        }
        if let Some(direction) = state.direction {
            self.backend
                .write_direction(self.line, direction, state.value)?;
        }
        Ok(())
    }

    async fn ensure_exported(&self) -> Result<(), GpioError> {
        if self.backend.is_exported(self.line) {
            return Ok(());
        }
        if !self.options.export {
            return Err(GpioError::Export(format!(
                "{self} is not exported and export is disabled"
            )));
        }

        // the write fails harmlessly when the line is already exported
        if let Err(e) = self.backend.export(self.line) {
            debug!("export write for {self} failed: {e}");
        }
        tokio::time::sleep(self.options.settle_delay).await;

        if self.backend.is_exported(self.line) {
            info!("exported {self}");
            Ok(())
        } else {
            Err(GpioError::Export(format!("could not export {self}")))
        }
    }

    pub fn direction(&self) -> Result<Direction, GpioError> {
        let state = self.live_state()?;
        match state.lifecycle {
            PinLifecycle::Opened => self.backend.read_direction(self.line),
            _ => Ok(state.direction.unwrap_or(Direction::Input)),
        }
    }

    /// Switching to output writes `high`/`low` when a value is cached, so the
    /// line starts at that level.
    pub fn set_direction(&self, direction: Direction) -> Result<(), GpioError> {
        let mut state = self.live_state()?;
        if state.lifecycle == PinLifecycle::Opened {
            self.backend
                .write_direction(self.line, direction, state.value)?;
        }
        state.direction = Some(direction);
        Ok(())
    }

    pub fn active_low(&self) -> Result<bool, GpioError> {
        let state = self.live_state()?;
        match state.lifecycle {
            PinLifecycle::Opened => self.backend.read_active_low(self.line),
            _ => Ok(state.active_low.unwrap_or(false)),
        }
    }

    pub fn set_active_low(&self, active_low: bool) -> Result<(), GpioError> {
        let mut state = self.live_state()?;
        state.active_low = Some(active_low);
        if state.lifecycle == PinLifecycle::Opened {
            self.tolerate(
                "active_low",
                self.backend.write_active_low(self.line, active_low),
            )?;
        }
        Ok(())
    }

    /// Logical value (`raw XOR active_low`).
    pub fn value(&self) -> Result<bool, GpioError> {
        read_logical(&self.state.lock(), self.backend.as_ref(), self.line).map(|r| r.value)
    }

    /// Before the pin is open the value is only cached and becomes the initial
    /// level of the next switch to output.
    pub fn set_value(&self, value: bool) -> Result<(), GpioError> {
        let mut state = self.live_state()?;
        if state.lifecycle == PinLifecycle::Opened {
            if self.backend.read_direction(self.line)? != Direction::Output {
                return Err(GpioError::InvalidDirection(format!(
                    "cannot set the value of input {self}"
                )));
            }
            self.tolerate("value", self.backend.write_value(self.line, value))?;
            state.value = Some(value);
        } else {
            state.value = Some(value);
            drop(state);
            self.source.nudge();
        }
        Ok(())
    }

    pub fn settings(&self) -> Result<PinSettings, GpioError> {
        Ok(PinSettings {
            direction: self.direction()?,
            active_low: self.active_low()?,
            raise_events: self.raise_events(),
        })
    }

    /// Starts receiving every transition from now on.
    pub async fn subscribe(&self) -> Result<Subscription, GpioError> {
        self.ensure_live()?;
        self.broker.register().await
    }

    pub fn subscriber_count(&self) -> usize {
        self.broker.subscriber_count()
    }

    pub fn is_watching(&self) -> bool {
        self.broker.is_watching()
    }

    pub fn watch_strategy(&self) -> Option<WatchStrategy> {
        self.broker.watch_strategy()
    }

    /// Waits for the next transition and returns the new value.
    pub async fn wait_for_change(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool, GpioError> {
        let subscription = self.subscribe().await?;
        let next = subscription.next(timeout, cancel).await;
        subscription.release().await;
        next?.ok_or_else(|| GpioError::Timeout(timeout.unwrap_or_default()))
    }

    /// Waits until the pin reads `target` and has held it for the debounce
    /// interval.
    pub async fn wait_for_value(
        &self,
        target: bool,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), GpioError> {
        self.ensure_live()?;
        SteadyStateWaiter::new(&self.broker, self.options.debounce)
            .wait_for_value(target, || self.value(), timeout, cancel)
            .await
    }

    /// Thread-blocking [`wait_for_change`](Self::wait_for_change). Must not be
    /// called from inside an async task.
    pub fn blocking_wait_for_change(&self, timeout: Option<Duration>) -> Result<bool, GpioError> {
        let runtime = self.runtime()?;
        let subscription = runtime.block_on(self.subscribe())?;
        let next = subscription.blocking_next(timeout, &CancellationToken::new());
        runtime.block_on(subscription.release());
        next?.ok_or_else(|| GpioError::Timeout(timeout.unwrap_or_default()))
    }

    /// Thread-blocking [`wait_for_value`](Self::wait_for_value).
    pub fn blocking_wait_for_value(
        &self,
        target: bool,
        timeout: Option<Duration>,
    ) -> Result<(), GpioError> {
        self.runtime()?
            .block_on(self.wait_for_value(target, timeout, &CancellationToken::new()))
    }

    fn runtime(&self) -> Result<&Handle, GpioError> {
        self.runtime.as_ref().ok_or_else(|| {
            GpioError::WatcherUnavailable(format!("{self} was created outside an async runtime"))
        })
    }

    pub async fn pulse(&self) -> Result<(), GpioError> {
        self.pulse_for(
            self.options.assertion,
            self.options.deassertion,
            &CancellationToken::new(),
        )
        .await
    }

    /// Asserts for `assertion`, then deasserts for `deassertion`. The pin is
    /// deasserted even when the assertion wait is cancelled.
    pub async fn pulse_for(
        &self,
        assertion: Duration,
        deassertion: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), GpioError> {
        self.set_value(true)?;
        let held = sleep_or_cancel(assertion, cancel).await;
        let deasserted = self.set_value(false);
        held?;
        deasserted?;
        sleep_or_cancel(deassertion, cancel).await
    }

    pub fn on_value_changed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&PinValueChanged) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn raise_events(&self) -> bool {
        self.state.lock().raise_events
    }

    /// Turns value-change handler invocation on or off. Takes effect
    /// immediately on an open pin, otherwise when it opens.
    pub async fn set_raise_events(&self, enabled: bool) -> Result<(), GpioError> {
        let opened = {
            let mut state = self.live_state()?;
            state.raise_events = enabled;
            state.lifecycle == PinLifecycle::Opened
        };

        match (opened, enabled) {
            (true, true) => self.start_pump().await,
            (_, false) => {
                self.stop_pump().await;
                Ok(())
            }
            (false, true) => Ok(()),
        }
    }

    async fn start_pump(&self) -> Result<(), GpioError> {
        let mut pump = self.pump.lock().await;
        if pump.as_ref().is_some_and(|p| !p.task.is_finished()) {
            return Ok(());
        }

        let subscription = self.broker.register().await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_pump(
            subscription,
            self.handlers.clone(),
            self.line,
            cancel.clone(),
        ));
        *pump = Some(EventPump { cancel, task });
        Ok(())
    }

    async fn stop_pump(&self) {
        let pump = self.pump.lock().await.take();
        if let Some(pump) = pump {
            pump.cancel.cancel();
            if let Err(e) = pump.task.await {
                warn!("event pump for {self} ended abnormally: {e}");
            }
        }
    }

    /// Stops all change delivery and, if configured, unexports the line.
    /// Every later operation fails with `Disposed`.
    pub async fn dispose(&self) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.lifecycle, PinLifecycle::Disposed)
        };
        if previous == PinLifecycle::Disposed {
            return;
        }

        self.stop_pump().await;
        self.broker.shutdown().await;

        if self.options.unexport && self.backend.is_exported(self.line) {
            if let Err(e) = self.backend.unexport(self.line) {
                debug!("unexport write for {self} failed: {e}");
            }
            tokio::time::sleep(self.options.settle_delay).await;
            if self.backend.is_exported(self.line) {
                warn!("{self} is still exported after unexport");
            }
        }
        info!("disposed {self}");
    }

    fn live_state(&self) -> Result<parking_lot::MutexGuard<'_, PinState>, GpioError> {
        let state = self.state.lock();
        if state.lifecycle == PinLifecycle::Disposed {
            return Err(GpioError::Disposed("pin"));
        }
        Ok(state)
    }

    fn ensure_live(&self) -> Result<(), GpioError> {
        self.live_state().map(|_| ())
    }

    fn tolerate(&self, what: &str, result: Result<(), GpioError>) -> Result<(), GpioError> {
        match (result, self.options.write_policy) {
            (Ok(()), _) => Ok(()),
            (Err(e @ GpioError::InvalidDirection(_)), _) | (Err(e), WritePolicy::Strict) => Err(e),
            (Err(e), WritePolicy::BestEffort) => {
                warn!("{self}: {what} write ignored: {e}");
                Ok(())
            }
        }
    }
}

impl fmt::Display for GpioPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.line, self.name)
    }
}

fn read_logical(
    state: &PinState,
    backend: &dyn GpioBackend,
    line: u32,
) -> Result<PinReading, GpioError> {
    match state.lifecycle {
        PinLifecycle::Disposed => Err(GpioError::Disposed("pin")),
        PinLifecycle::Opened => backend
            .read_value(line)
            .map(|value| PinReading { value, live: true }),
        PinLifecycle::Unopened | PinLifecycle::Opening => Ok(PinReading {
            value: state.value.unwrap_or(false),
            live: false,
        }),
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), GpioError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(GpioError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

async fn run_pump(
    subscription: Subscription,
    handlers: Arc<HandlerList>,
    line: u32,
    cancel: CancellationToken,
) {
    loop {
        let value = match subscription.next(None, &cancel).await {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            Err(GpioError::Cancelled) | Err(GpioError::Disposed(_)) => break,
            Err(e) => {
                warn!("event pump for line {line} stopped: {e}");
                break;
            }
        };

        let event = PinValueChanged { line, value };
        let current: Vec<_> = handlers.read().iter().map(|(_, h)| h.clone()).collect();
        for handler in current {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!("value change handler for line {line} panicked");
            }
        }
    }
    subscription.release().await;
}
