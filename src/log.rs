//! Injected leveled logger.
//!
//! Every server and handler holds a [`Logger`] handed to it at construction
//! instead of reading a process-wide logger. Events go through `tracing`
//! tagged with the component name; the level filter lives on the logger
//! itself, so one forward can be turned up to `debug` while the rest stay
//! at `info`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing::Level;

/// Component logger with its own level filter.
///
/// Clones share the level filter; [`Logger::named`] creates a child that
/// shares it too.
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
    level: Arc<AtomicU8>,
}

fn level_rank(level: Level) -> u8 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        Level::TRACE => 5,
    }
}

fn filter_rank(filter: LevelFilter) -> u8 {
    filter.into_level().map(level_rank).unwrap_or(0)
}

fn rank_filter(rank: u8) -> LevelFilter {
    match rank {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

impl Logger {
    /// Create a logger for `name` filtering at `level`.
    pub fn new(name: impl AsRef<str>, level: LevelFilter) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            level: Arc::new(AtomicU8::new(filter_rank(level))),
        }
    }

    /// Child logger `parent.child` sharing this logger's level.
    pub fn named(&self, child: &str) -> Self {
        Self {
            name: Arc::from(format!("{}.{}", self.name, child)),
            level: Arc::clone(&self.level),
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current level filter.
    pub fn level(&self) -> LevelFilter {
        rank_filter(self.level.load(Ordering::Relaxed))
    }

    /// Change the level filter for this logger and every clone of it.
    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(filter_rank(level), Ordering::Relaxed);
    }

    /// Whether an event at `level` passes this logger's filter.
    pub fn enabled(&self, level: Level) -> bool {
        level_rank(level) <= self.level.load(Ordering::Relaxed)
    }

    /// Emit at `debug`.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::DEBUG, args);
    }

    /// Emit at `info`.
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::INFO, args);
    }

    /// Emit at `warn`.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::WARN, args);
    }

    /// Emit at `error`.
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::ERROR, args);
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let name = &*self.name;
        match level {
            Level::ERROR => tracing::error!(component = name, "{}", args),
            Level::WARN => tracing::warn!(component = name, "{}", args),
            Level::INFO => tracing::info!(component = name, "{}", args),
            Level::DEBUG => tracing::debug!(component = name, "{}", args),
            Level::TRACE => tracing::trace!(component = name, "{}", args),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("portmux", LevelFilter::INFO)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("level", &self.level())
            .finish()
    }
}
