//! Background detection of value transitions on a single pin.
//!
//! A watcher emits the pin's *logical* value every time it observes a change,
//! through a [`TransitionSink`] supplied by its owner. Three sources exist:
//!
//! - `Native`: the backend pushes changes itself (the simulated backend does).
//! - `Notify`: an external `inotifywait` process reports writes to the value
//!   file and the value is re-read on every report.
//! - `Poll`: the value is re-read at a fixed interval and compared with the
//!   previous reading.
//!
//! Every strategy samples through [`WatchSource::sample`], so a pin that is
//! not yet open is watched through the value it has cached.
//!
//! A running watcher owns no locks; it only calls its sink.

#[cfg(feature = "inotify")]
mod notify;
mod poll;

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{PinOptions, WatchMode};
use crate::error::GpioError;
use crate::gpio::GpioBackend;

#[cfg(feature = "inotify")]
pub use notify::{NotifyEvent, split_fields};

pub type TransitionSink = Arc<dyn Fn(bool) + Send + Sync>;

/// One sample of a pin's logical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinReading {
    pub value: bool,
    /// Whether the value came from the backend rather than a value cached by
    /// an unopened pin.
    pub live: bool,
}

pub type ValueReader = Arc<dyn Fn() -> Result<PinReading, GpioError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStrategy {
    Native,
    Notify,
    Poll,
}

/// Everything a watcher needs to observe one pin.
#[derive(Clone)]
pub struct WatchSource {
    pub backend: Arc<dyn GpioBackend>,
    pub line: u32,
    pub options: Arc<PinOptions>,
    read: ValueReader,
    nudge: Arc<Notify>,
}

impl WatchSource {
    /// Samples the backend directly.
    pub fn new(backend: Arc<dyn GpioBackend>, line: u32, options: Arc<PinOptions>) -> Self {
        let direct = backend.clone();
        Self {
            backend,
            line,
            options,
            read: Arc::new(move || {
                direct
                    .read_value(line)
                    .map(|value| PinReading { value, live: true })
            }),
            nudge: Arc::new(Notify::new()),
        }
    }

    pub fn with_reader(mut self, read: ValueReader) -> Self {
        self.read = read;
        self
    }

    pub fn sample(&self) -> Result<PinReading, GpioError> {
        (self.read)()
    }

    /// Asks a running watcher to sample again. Used for changes no strategy can
    /// observe on its own, such as a value cached by an unopened pin.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    fn baseline(&self) -> Result<bool, GpioError> {
        self.sample()
            .map(|r| r.value)
            .map_err(|e| GpioError::WatcherUnavailable(format!("cannot sample line {}: {e}", self.line)))
    }

    #[cfg(feature = "inotify")]
    fn value_path(&self) -> Result<PathBuf, GpioError> {
        self.backend.value_path(self.line).ok_or_else(|| {
            GpioError::WatcherUnavailable(format!("line {} has no value file", self.line))
        })
    }
}

pub fn notify_tool_available(path: &Path) -> bool {
    cfg!(feature = "inotify") && path.is_file()
}

pub struct ChangeWatcher {
    strategy: WatchStrategy,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    pub async fn start(source: &WatchSource, sink: TransitionSink) -> Result<Self, GpioError> {
        let runtime = Handle::try_current()
            .map_err(|_| GpioError::WatcherUnavailable("no async runtime available".into()))?;
        let cancel = CancellationToken::new();

        // taken before the baseline so no change can slip in between
        if let Some(feed) = source.backend.change_feed(source.line) {
            let baseline = source.baseline()?;
            let task = runtime.spawn(forward_feed(
                source.clone(),
                feed,
                baseline,
                sink,
                cancel.clone(),
            ));
            return Ok(Self::running(WatchStrategy::Native, source, cancel, task));
        }

        let use_notify = match source.options.watch {
            WatchMode::Poll => false,
            WatchMode::Auto => notify_tool_available(&source.options.inotifywait_path),
            WatchMode::Notify => {
                if !notify_tool_available(&source.options.inotifywait_path) {
                    return Err(GpioError::WatcherUnavailable(format!(
                        "{} is not available",
                        source.options.inotifywait_path.display()
                    )));
                }
                true
            }
        };

        #[cfg(feature = "inotify")]
        if use_notify {
            let started = match source.value_path() {
                Ok(path) => notify::spawn(source, path, sink.clone(), cancel.clone()).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(task) => {
                    let task = runtime.spawn(task);
                    return Ok(Self::running(WatchStrategy::Notify, source, cancel, task));
                }
                Err(e) if source.options.watch == WatchMode::Notify => return Err(e),
                Err(e) => warn!("falling back to polling for line {}: {e}", source.line),
            }
        }
        #[cfg(not(feature = "inotify"))]
        let _ = use_notify;

        let task = poll::prepare(source, sink, cancel.clone())?;
        let task = runtime.spawn(task);
        Ok(Self::running(WatchStrategy::Poll, source, cancel, task))
    }

    fn running(
        strategy: WatchStrategy,
        source: &WatchSource,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        info!("watching line {} ({strategy:?})", source.line);
        Self {
            strategy,
            cancel,
            task: Some(task),
        }
    }

    pub fn strategy(&self) -> WatchStrategy {
        self.strategy
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Asks the task to end without waiting for it.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    /// Signals cancellation and waits until the task has fully ended.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("change watcher ended abnormally: {e}"),
            }
        }
        debug!("change watcher stopped ({:?})", self.strategy);
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forwards backend-pushed values while the pin reads from the backend, and
/// re-samples on a nudge or while the pin still answers from its cache.
async fn forward_feed(
    source: WatchSource,
    mut feed: mpsc::UnboundedReceiver<bool>,
    mut last: bool,
    sink: TransitionSink,
    cancel: CancellationToken,
) {
    loop {
        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            value = feed.recv() => match value {
                Some(value) => source
                    .sample()
                    .map(|r| if r.live { value } else { r.value }),
                None => {
                    debug!("backend change feed closed");
                    break;
                }
            },
            _ = source.nudge.notified() => source.sample().map(|r| r.value),
        };

        match observed {
            Ok(value) if value != last => {
                last = value;
                sink(value);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("change feed for line {} stopped: {e}", source.line);
                break;
            }
        }
    }
}
