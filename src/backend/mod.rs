pub mod dummy;
pub mod sysfs;

pub use dummy::DummyGpioBackend;
pub use sysfs::SysfsGpioBackend;
