//! `log` backend for the kernel.
//!
//! Records are printed as `[LEVEL target] message` through [`eprintln!`], so
//! they reach serial on the kernel target and stderr in hosted tests.

use log::{LevelFilter, Log, Metadata, Record};

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::eprintln!(
                "[{:5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs [`KernelLogger`] and sets the maximum level.
///
/// Only the first call installs the logger; later calls just adjust the
/// level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
