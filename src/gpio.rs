use log::{info, warn};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::backend::{DummyGpioBackend, SysfsGpioBackend};
use crate::config::{AppConfig, BackendKind, Direction, PinConfig, PinOptions};
use crate::error::GpioError;
use crate::pin::{GpioPin, PinLifecycle, PinSettings};

/// Storage behind a pin: where direction, polarity and value live.
///
/// Values crossing this trait are logical, i.e. already corrected for
/// `active_low`.
pub trait GpioBackend: Send + Sync {
    fn is_exported(&self, line: u32) -> bool;
    fn export(&self, line: u32) -> Result<(), GpioError>;
    fn unexport(&self, line: u32) -> Result<(), GpioError>;
    fn read_direction(&self, line: u32) -> Result<Direction, GpioError>;
    /// `initial_level` only matters for outputs, see [`Direction::as_sysfs`].
    fn write_direction(
        &self,
        line: u32,
        direction: Direction,
        initial_level: Option<bool>,
    ) -> Result<(), GpioError>;
    fn read_active_low(&self, line: u32) -> Result<bool, GpioError>;
    fn write_active_low(&self, line: u32, active_low: bool) -> Result<(), GpioError>;
    fn read_value(&self, line: u32) -> Result<bool, GpioError>;
    fn write_value(&self, line: u32, value: bool) -> Result<(), GpioError>;

    /// File whose modification signals a value change, if there is one.
    fn value_path(&self, _line: u32) -> Option<PathBuf> {
        None
    }

    /// Backends that observe their own changes hand out a feed of logical
    /// values here. Taking a new feed replaces the previous one.
    fn change_feed(&self, _line: u32) -> Option<mpsc::UnboundedReceiver<bool>> {
        None
    }
}

pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<ValueChangedEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<ValueChangedEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(
        event_tx: broadcast::Sender<ValueChangedEvent>,
        event_history: FxHashMap<u32, RwLock<VecDeque<ValueChangedEvent>>>,
        event_history_capacity: usize,
    ) -> Self {
        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: ValueChangedEvent) {
        if let Some(history_lock) = self.event_history.get(&event.pin_id) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValueChangedEvent {
    pub pin_id: u32,
    pub value: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinDescriptor {
    pub info: PinConfig,
    pub display: String,
    pub lifecycle: PinLifecycle,
    pub settings: Option<PinSettings>,
    pub value: Option<bool>,
    pub subscribers: usize,
}

/// Every configured pin, plus the value-change fan-out shared between them.
pub struct GpioManager {
    config: Arc<AppConfig>,
    pins: FxHashMap<u32, Arc<GpioPin>>,
    dummy: Arc<DummyGpioBackend>,
    event_handler: EventHandler,
    shutdown: CancellationToken,
}

impl GpioManager {
    /// Builds all pins with their configured direction, polarity and initial
    /// value cached. Nothing touches the backends until a pin is opened.
    pub fn new(config: Arc<AppConfig>) -> Result<Self, GpioError> {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        let mut history = FxHashMap::default();
        for id in config.gpios.keys() {
            history.insert(*id, RwLock::new(VecDeque::new()));
        }
        let event_handler = Arc::new(EventCallbackHandler::new(
            event_tx,
            history,
            config.event_history_capacity,
        ));

        let sysfs: Arc<dyn GpioBackend> =
            Arc::new(SysfsGpioBackend::new(config.sysfs.gpio_root.clone()));
        let dummy = Arc::new(DummyGpioBackend::default());

        let mut pins = FxHashMap::default();
        // a line has a single change feed and a single set of attributes
        let mut claimed: FxHashMap<(BackendKind, u32), u32> = FxHashMap::default();
        for (id, cfg) in config.gpios.iter() {
            if let Some(other) = claimed.insert((cfg.backend, cfg.line), *id) {
                return Err(GpioError::Config(format!(
                    "pins {other} and {id} both use {:?} line {}",
                    cfg.backend, cfg.line
                )));
            }
            let backend: Arc<dyn GpioBackend> = match cfg.backend {
                BackendKind::Sysfs => sysfs.clone(),
                BackendKind::Dummy => dummy.clone(),
            };
            let pin = GpioPin::new(
                cfg.line,
                cfg.name.clone(),
                PinOptions::new(cfg, &config.sysfs),
                backend,
            );

            if let Some(active_low) = cfg.active_low {
                pin.set_active_low(active_low)?;
            }
            if let Some(value) = cfg.initial_value {
                pin.set_value(value)?;
            }
            if let Some(direction) = cfg.direction {
                pin.set_direction(direction)?;
            }

            let handler = event_handler.clone();
            let pin_id = *id;
            pin.on_value_changed(move |change| {
                handler.dispatch(ValueChangedEvent {
                    pin_id,
                    value: change.value,
                    timestamp_ms: epoch_millis(),
                })
            });

            pins.insert(*id, Arc::new(pin));
        }

        Ok(Self {
            config,
            pins,
            dummy,
            event_handler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Enables configured event raising and opens `auto_open` pins. A pin
    /// that fails to open is logged and left unopened.
    pub async fn initialize(&self) -> Result<(), GpioError> {
        for (id, cfg) in self.config.gpios.iter() {
            let pin = self.pin(*id)?;
            if cfg.raise_events {
                pin.set_raise_events(true).await?;
            }
            if cfg.auto_open
                && let Err(e) = pin.open().await
            {
                warn!("could not open {pin} at startup: {e}");
            }
        }
        Ok(())
    }

    pub fn pin(&self, pin_id: u32) -> Result<&Arc<GpioPin>, GpioError> {
        self.pins
            .get(&pin_id)
            .ok_or_else(|| GpioError::NotFoundPin(pin_id.to_string()))
    }

    fn pin_config(&self, pin_id: u32) -> Result<&PinConfig, GpioError> {
        self.config
            .gpios
            .get(&pin_id)
            .ok_or_else(|| GpioError::NotFoundPin(pin_id.to_string()))
    }

    /// The simulated backend shared by every `dummy` pin.
    pub fn dummy_backend(&self) -> &Arc<DummyGpioBackend> {
        &self.dummy
    }

    fn describe(&self, pin_id: u32) -> Result<PinDescriptor, GpioError> {
        let info = self.pin_config(pin_id)?.clone();
        let pin = self.pin(pin_id)?;

        Ok(PinDescriptor {
            info,
            display: pin.to_string(),
            lifecycle: pin.lifecycle(),
            settings: pin.settings().ok(),
            value: pin.value().ok(),
            subscribers: pin.subscriber_count(),
        })
    }

    pub async fn list_pins(&self) -> HashMap<u32, PinDescriptor> {
        self.pins
            .keys()
            .filter_map(|id| self.describe(*id).ok().map(|d| (*id, d)))
            .collect()
    }

    pub async fn get_pin_descriptor(&self, pin_id: u32) -> Result<PinDescriptor, GpioError> {
        self.describe(pin_id)
    }

    pub async fn open_pin(&self, pin_id: u32) -> Result<(), GpioError> {
        self.pin(pin_id)?.open().await
    }

    /// Disposes the pin. It cannot be reopened afterwards.
    pub async fn close_pin(&self, pin_id: u32) -> Result<(), GpioError> {
        self.pin(pin_id)?.dispose().await;
        Ok(())
    }

    pub async fn get_pin_settings(&self, pin_id: u32) -> Result<PinSettings, GpioError> {
        self.pin(pin_id)?.settings()
    }

    /// Applies only the fields that differ from the current settings,
    /// polarity before direction.
    pub async fn set_pin_settings(
        &self,
        pin_id: u32,
        settings: &PinSettings,
    ) -> Result<(), GpioError> {
        let pin = self.pin(pin_id)?;
        let current = pin.settings()?;

        if settings.active_low != current.active_low {
            pin.set_active_low(settings.active_low)?;
        }
        if settings.direction != current.direction {
            pin.set_direction(settings.direction)?;
        }
        if settings.raise_events != current.raise_events {
            pin.set_raise_events(settings.raise_events).await?;
        }
        Ok(())
    }

    pub async fn read_value(&self, pin_id: u32) -> Result<bool, GpioError> {
        self.pin(pin_id)?.value()
    }

    pub async fn write_value(&self, pin_id: u32, value: bool) -> Result<(), GpioError> {
        self.pin(pin_id)?.set_value(value)
    }

    pub async fn pulse(
        &self,
        pin_id: u32,
        assertion: Option<Duration>,
        deassertion: Option<Duration>,
    ) -> Result<(), GpioError> {
        let pin = self.pin(pin_id)?;
        let options = pin.options();
        pin.pulse_for(
            assertion.unwrap_or(options.assertion),
            deassertion.unwrap_or(options.deassertion),
            &self.shutdown,
        )
        .await
    }

    pub async fn wait_for_value(
        &self,
        pin_id: u32,
        target: bool,
        timeout: Option<Duration>,
    ) -> Result<(), GpioError> {
        self.pin(pin_id)?
            .wait_for_value(target, timeout, &self.shutdown)
            .await
    }

    pub async fn wait_for_change(
        &self,
        pin_id: u32,
        timeout: Option<Duration>,
    ) -> Result<bool, GpioError> {
        self.pin(pin_id)?
            .wait_for_change(timeout, &self.shutdown)
            .await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ValueChangedEvent> {
        self.event_handler.event_tx.subscribe()
    }

    pub async fn get_events(
        &self,
        pin_id: u32,
        limit: Option<usize>,
    ) -> Result<Vec<ValueChangedEvent>, GpioError> {
        self.pin_config(pin_id)?;
        let map = &self.event_handler.event_history;

        Ok(map
            .get(&pin_id)
            .map(|d| {
                let events: Vec<ValueChangedEvent> = if let Some(lim) = limit {
                    d.read().iter().rev().take(lim).cloned().collect()
                } else {
                    d.read().iter().cloned().collect()
                };
                events.into_iter().rev().collect()
            })
            .unwrap_or_default())
    }

    pub async fn get_last_event(
        &self,
        pin_id: u32,
    ) -> Result<Option<ValueChangedEvent>, GpioError> {
        self.pin_config(pin_id)?;
        let map = &self.event_handler.event_history;

        Ok(map.get(&pin_id).and_then(|d| d.read().back().cloned()))
    }

    /// Cancels every pending wait and pulse, then disposes all pins.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for pin in self.pins.values() {
            pin.dispose().await;
        }
        info!("all pins disposed");
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
