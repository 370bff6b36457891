use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Direction, level_str, parse_level};
use crate::error::GpioError;
use crate::gpio::GpioBackend;

/// Pins exposed as text files under a GPIO class directory, usually
/// `/sys/class/gpio/gpio<N>/{direction,value,active_low,edge}`.
pub struct SysfsGpioBackend {
    root: PathBuf,
}

impl SysfsGpioBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn pin_dir(&self, line: u32) -> PathBuf {
        self.root.join(format!("gpio{line}"))
    }

    fn attr_path(&self, line: u32, attr: &str) -> PathBuf {
        self.pin_dir(line).join(attr)
    }

    fn read_attr(&self, line: u32, attr: &str) -> Result<String, GpioError> {
        let path = self.attr_path(line, attr);
        fs::read_to_string(&path)
            .map_err(|e| GpioError::Io(format!("read {}: {e}", path.display())))
    }

    fn write_attr(&self, line: u32, attr: &str, text: &str) -> Result<(), GpioError> {
        write_text(&self.attr_path(line, attr), text)
    }
}

fn write_text(path: &Path, text: &str) -> Result<(), GpioError> {
    fs::write(path, text).map_err(|e| GpioError::Io(format!("write {}: {e}", path.display())))
}

impl GpioBackend for SysfsGpioBackend {
    fn is_exported(&self, line: u32) -> bool {
        self.pin_dir(line).is_dir()
    }

    fn export(&self, line: u32) -> Result<(), GpioError> {
        write_text(&self.root.join("export"), &line.to_string())
    }

    fn unexport(&self, line: u32) -> Result<(), GpioError> {
        write_text(&self.root.join("unexport"), &line.to_string())
    }

    fn read_direction(&self, line: u32) -> Result<Direction, GpioError> {
        self.read_attr(line, "direction")?.parse()
    }

    fn write_direction(
        &self,
        line: u32,
        direction: Direction,
        initial_level: Option<bool>,
    ) -> Result<(), GpioError> {
        self.write_attr(line, "direction", direction.as_sysfs(initial_level))?;

        if direction == Direction::Input {
            // not every line supports interrupts; edge reporting is optional
            if let Err(e) = self.write_attr(line, "edge", "both") {
                debug!("edge detection unavailable for gpio{line}: {e}");
            }
        }
        Ok(())
    }

    fn read_active_low(&self, line: u32) -> Result<bool, GpioError> {
        parse_level(&self.read_attr(line, "active_low")?)
    }

    fn write_active_low(&self, line: u32, active_low: bool) -> Result<(), GpioError> {
        self.write_attr(line, "active_low", level_str(active_low))
    }

    fn read_value(&self, line: u32) -> Result<bool, GpioError> {
        // the kernel applies active_low before reporting
        parse_level(&self.read_attr(line, "value")?)
    }

    fn write_value(&self, line: u32, value: bool) -> Result<(), GpioError> {
        self.write_attr(line, "value", level_str(value))
    }

    fn value_path(&self, line: u32) -> Option<PathBuf> {
        Some(self.attr_path(line, "value"))
    }
}
