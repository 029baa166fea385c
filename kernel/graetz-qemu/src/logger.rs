use core::fmt;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::DebugConsole;

/// Routes the `log` facade to the [`DebugConsole`].
///
/// Stateless: the facade's global maximum level is the filter, so
/// verbosity can be raised or lowered later without a handle to the
/// logger.
pub struct BootLogger;

static LOGGER: BootLogger = BootLogger;

impl BootLogger {
    /// Install the logger with the given level ceiling.
    ///
    /// Fails when another backend claimed the facade first; that backend
    /// stays in place.
    pub fn install(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

/// One record, serial-terminal style: level, target, message, CRLF.
fn write_record(out: &mut impl fmt::Write, record: &Record) -> fmt::Result {
    write!(
        out,
        "{:<5} {}: {}\r\n",
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // Best effort; the console cannot fail anyway.
            let _ = write_record(&mut DebugConsole, record);
        }
    }

    fn flush(&self) {}
}
