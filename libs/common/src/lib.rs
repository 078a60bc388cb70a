//! Ambient services shared by the M3 binaries
//!
//! - [`logging`]: console and daily-file tracing with a reloadable filter
//! - [`config_loader`]: figment-based config files with env overrides
//! - [`shutdown`]: signal handling, SIGHUP reload and a broadcast shutdown trigger

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_config_from_file, ConfigLoadError};
pub use shutdown::{wait_for_shutdown, ReloadSignal, ShutdownTrigger};
