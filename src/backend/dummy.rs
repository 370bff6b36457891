use std::sync::{Mutex, RwLock};

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::config::Direction;
use crate::error::GpioError;
use crate::gpio::GpioBackend;

/// Simulated backend: every line always exists, values live in memory and
/// logical changes are pushed straight to an attached watcher.
#[derive(Default)]
pub struct DummyGpioBackend {
    lines: RwLock<FxHashMap<u32, Mutex<DummyLine>>>, // keyed by line number
}

struct DummyLine {
    direction: Direction,
    active_low: bool,
    raw: bool,
    feed: Option<mpsc::UnboundedSender<bool>>,
}

impl Default for DummyLine {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            active_low: false,
            raw: false,
            feed: None,
        }
    }
}

impl DummyLine {
    fn logical(&self) -> bool {
        self.raw ^ self.active_low
    }

    /// Applies `update` and reports the new logical value to the feed if it moved.
    fn mutate(&mut self, update: impl FnOnce(&mut DummyLine)) {
        let before = self.logical();
        update(self);
        let after = self.logical();

        if before != after
            && let Some(feed) = &self.feed
            && feed.send(after).is_err()
        {
            self.feed = None;
        }
    }
}

impl DummyGpioBackend {
    /// Drives the electrical level of a line as an external device would,
    /// regardless of its direction.
    pub fn inject(&self, line: u32, raw_level: bool) -> Result<(), GpioError> {
        self.with_line(line, |l| l.mutate(|l| l.raw = raw_level))
    }

    pub fn raw_level(&self, line: u32) -> Result<bool, GpioError> {
        self.read_line(line, |l| l.raw)
    }

    fn with_line<R>(&self, line: u32, f: impl FnOnce(&mut DummyLine) -> R) -> Result<R, GpioError> {
        {
            let lines = self
                .lines
                .read()
                .map_err(|e| GpioError::Io(format!("lock poisoned: {e}")))?;
            if let Some(entry) = lines.get(&line) {
                let mut l = entry
                    .lock()
                    .map_err(|e| GpioError::Io(format!("lock poisoned: {e}")))?;
                return Ok(f(&mut l));
            }
        }

        let mut lines = self
            .lines
            .write()
            .map_err(|e| GpioError::Io(format!("lock poisoned: {e}")))?;
        let entry = lines.entry(line).or_insert_with(|| Mutex::new(DummyLine::default()));
        let mut l = entry
            .lock()
            .map_err(|e| GpioError::Io(format!("lock poisoned: {e}")))?;
        Ok(f(&mut l))
    }

    fn read_line<R>(&self, line: u32, f: impl FnOnce(&DummyLine) -> R) -> Result<R, GpioError> {
        let lines = self
            .lines
            .read()
            .map_err(|e| GpioError::Io(format!("lock poisoned: {e}")))?;
        match lines.get(&line) {
            Some(entry) => {
                let l = entry
                    .lock()
                    .map_err(|e| GpioError::Io(format!("lock poisoned: {e}")))?;
                Ok(f(&l))
            }
            None => Ok(f(&DummyLine::default())),
        }
    }
}

impl GpioBackend for DummyGpioBackend {
    fn is_exported(&self, _line: u32) -> bool {
        true
    }

    fn export(&self, _line: u32) -> Result<(), GpioError> {
        Ok(())
    }

    fn unexport(&self, _line: u32) -> Result<(), GpioError> {
        Ok(())
    }

    fn read_direction(&self, line: u32) -> Result<Direction, GpioError> {
        self.read_line(line, |l| l.direction)
    }

    fn write_direction(
        &self,
        line: u32,
        direction: Direction,
        initial_level: Option<bool>,
    ) -> Result<(), GpioError> {
        self.with_line(line, |l| {
            l.mutate(|l| {
                l.direction = direction;
                if let (Direction::Output, Some(level)) = (direction, initial_level) {
                    l.raw = level ^ l.active_low;
                }
            })
        })
    }

    fn read_active_low(&self, line: u32) -> Result<bool, GpioError> {
        self.read_line(line, |l| l.active_low)
    }

    fn write_active_low(&self, line: u32, active_low: bool) -> Result<(), GpioError> {
        self.with_line(line, |l| l.mutate(|l| l.active_low = active_low))
    }

    fn read_value(&self, line: u32) -> Result<bool, GpioError> {
        self.read_line(line, DummyLine::logical)
    }

    fn write_value(&self, line: u32, value: bool) -> Result<(), GpioError> {
        self.with_line(line, |l| {
            if l.direction != Direction::Output {
                return Err(GpioError::InvalidDirection(format!(
                    "line {line} must be an output to set its value"
                )));
            }
            l.mutate(|l| l.raw = value ^ l.active_low);
            Ok(())
        })?
    }

    fn change_feed(&self, line: u32) -> Option<mpsc::UnboundedReceiver<bool>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_line(line, |l| l.feed = Some(tx)).ok()?;
        Some(rx)
    }
}
