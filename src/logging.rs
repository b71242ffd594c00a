// Logging setup
//
// env_logger drives the `log` facade. Validation-layer messages can also be
// mirrored into a file so they survive after the console scrolls away.

use crate::config::DebugConfig;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;

/// Validation log sink. The debug messenger callback may fire from driver
/// threads, so access goes through a lock.
static VALIDATION_LOG: Mutex<Option<File>> = parking_lot::const_mutex(None);

/// Initialize logging with optional file output for validation messages.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init(config: &DebugConfig) {
    use env_logger::Builder;
    use log::LevelFilter;

    let _ = Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .try_init();

    if !config.log_to_file {
        return;
    }

    // Create/clear the log file
    match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&config.log_file)
    {
        Ok(mut file) => {
            let _ = writeln!(file, "=== Villa Validation Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
            *VALIDATION_LOG.lock() = Some(file);
        }
        Err(e) => log::warn!("Cannot open log file {:?}: {}", config.log_file, e),
    }
}

/// Append one validation message to the log file, if one is open.
pub fn record_validation_message(level: log::Level, message: &str) {
    if let Some(file) = VALIDATION_LOG.lock().as_mut() {
        let _ = writeln!(file, "[{}] {}", level, message);
    }
}
