pub mod backend;
pub mod broker;
pub mod config;
pub mod error;
pub mod gate;
pub mod gpio;
pub mod pin;
pub mod queue;
pub mod routes;
pub mod steady;
pub mod watcher;

pub use backend::{DummyGpioBackend, SysfsGpioBackend};
pub use broker::{ChangeBroker, Subscription};
pub use config::{
    AppConfig, BackendKind, Direction, HttpConfig, PinConfig, PinOptions, SysfsConfig, WatchMode,
    WritePolicy,
};
pub use error::GpioError;
pub use gate::TimedGate;
pub use gpio::{GpioBackend, GpioManager, PinDescriptor, ValueChangedEvent};
pub use pin::{GpioPin, HandlerId, PinLifecycle, PinSettings, PinValueChanged};
pub use queue::AwaitableQueue;
pub use routes::AppState;
pub use steady::SteadyStateWaiter;
pub use watcher::{ChangeWatcher, WatchStrategy};
