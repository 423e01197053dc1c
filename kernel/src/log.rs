use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use crate::debugcon::DebugconWriter;

pub const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

/// Writes `[ LEVEL ] message` lines to the debug console.
struct KernelLogger {
    writer: Mutex<DebugconWriter>,
}

static LOGGER: KernelLogger = KernelLogger {
    writer: Mutex::new(DebugconWriter),
};

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut writer = self.writer.lock();
        let _ = writeln!(writer, "[ {} ] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

pub fn initialize() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LOG_LEVEL);
    }
}
