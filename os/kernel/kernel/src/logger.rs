//! # Console logger
//!
//! Backs the `log` facade with the kernel console. Lines are formatted as
//! `[LEVEL] target: message` and written without allocating.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Diagnostic text sink (`kprint`).
pub trait Console {
    fn kprint(&self, s: &str);
}

pub struct ConsoleLogger<C> {
    console: C,
    max_level: LevelFilter,
}

impl<C: Console + Sync + Send> ConsoleLogger<C> {
    #[must_use]
    pub const fn new(console: C, max_level: LevelFilter) -> Self {
        Self { console, max_level }
    }

    /// Install as the global logger. Call once during early init.
    ///
    /// # Errors
    /// If a logger was already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    #[must_use]
    pub const fn console(&self) -> &C {
        &self.console
    }
}

impl<C: Console + Sync + Send> Log for ConsoleLogger<C> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Best effort; the console cannot fail.
        let _ = writeln!(
            Sink(&self.console),
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

struct Sink<'a, C>(&'a C);

impl<C: Console> Write for Sink<'_, C> {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.kprint(s);
        Ok(())
    }
}
