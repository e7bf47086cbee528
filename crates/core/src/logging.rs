//! Simulator-wide logging.
//!
//! Messages are filtered by a [`LogCategory`] and a [`LogLevel`]. Each
//! category may override the global level; a category left at `Off` follows
//! the global level. Message text is built lazily, so a disabled log call
//! costs one atomic load.
//!
//! Cycle-stepped peripherals can emit a message every tick, so each category
//! is rate limited to a fixed number of messages per one-second window. The
//! number of suppressed messages is reported when the next window opens.
//!
//! Output goes to stderr, or to a file written by a background thread once
//! [`LogConfig::set_log_file`] has been called.
//!
//! ```rust
//! use soc_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Uart, LogLevel::Warn, || {
//!     format!("UART: RX overrun, dropped byte {:02X}", 0x41)
//! });
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown log level: {0:?}")]
pub struct ParseLogLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(LogLevel::Off),
            "error" | "err" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(ParseLogLevelError(s.to_string())),
        }
    }
}

impl LogLevel {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Log category for the simulated components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Address routing, accept/complete of bus requests
    Bus,
    /// External memory collaborator
    Memory,
    /// Display-side SPI controller
    Spi,
    /// Console-side UART controller
    Uart,
    /// Peripheral interrupt lines
    Interrupts,
    /// Accesses to unmapped registers
    Stubs,
}

impl LogCategory {
    pub const ALL: [LogCategory; 6] = [
        LogCategory::Bus,
        LogCategory::Memory,
        LogCategory::Spi,
        LogCategory::Uart,
        LogCategory::Interrupts,
        LogCategory::Stubs,
    ];

    fn index(self) -> usize {
        match self {
            LogCategory::Bus => 0,
            LogCategory::Memory => 1,
            LogCategory::Spi => 2,
            LogCategory::Uart => 3,
            LogCategory::Interrupts => 4,
            LogCategory::Stubs => 5,
        }
    }
}

const CATEGORY_COUNT: usize = LogCategory::ALL.len();

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    emitted: usize,
    suppressed: usize,
}

/// Fixed one-second window counter per category
struct RateLimiter {
    max_per_window: AtomicUsize,
    window: Duration,
    windows: Mutex<[Option<Window>; CATEGORY_COUNT]>,
}

impl RateLimiter {
    fn new(max_per_window: usize) -> Self {
        Self {
            max_per_window: AtomicUsize::new(max_per_window),
            window: Duration::from_secs(1),
            windows: Mutex::new([None; CATEGORY_COUNT]),
        }
    }

    /// Returns whether the message may be written, and how many messages
    /// were suppressed in the window that just closed (if one did).
    fn admit(&self, category: LogCategory, now: Instant) -> (bool, Option<usize>) {
        let max = self.max_per_window.load(Ordering::Relaxed);
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = &mut windows[category.index()];

        let mut closed = None;
        let expired = slot.map_or(true, |w| now.duration_since(w.opened) >= self.window);
        if expired {
            closed = slot.take().map(|old| old.suppressed).filter(|&n| n > 0);
        }
        let window = slot.get_or_insert(Window {
            opened: now,
            emitted: 0,
            suppressed: 0,
        });

        if window.emitted < max {
            window.emitted += 1;
            (true, closed)
        } else {
            window.suppressed += 1;
            (false, closed)
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    global_level: AtomicU8,
    category_levels: [AtomicU8; CATEGORY_COUNT],
    file_sender: Mutex<Option<Sender<String>>>,
    limiter: RateLimiter,
}

impl LogConfig {
    /// All logging off, 100 messages per second per category
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            category_levels: Default::default(),
            file_sender: Mutex::new(None),
            limiter: RateLimiter::new(100),
        }
    }

    /// Process-wide instance
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    /// Override the level for one category (`Off` means "follow global")
    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.category_levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.category_levels[category.index()].load(Ordering::Relaxed))
    }

    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        let effective = match self.level(category) {
            LogLevel::Off => self.global_level(),
            l => l,
        };
        level <= effective
    }

    /// Everything back to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    pub fn set_rate_limit(&self, max_per_second: usize) {
        self.limiter
            .max_per_window
            .store(max_per_second, Ordering::Relaxed);
    }

    pub fn rate_limit(&self) -> usize {
        self.limiter.max_per_window.load(Ordering::Relaxed)
    }

    /// Append log output to `path` from a background writer thread.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("soc-log-writer".to_string())
            .spawn(move || {
                while let Ok(line) = receiver.recv() {
                    let _ = writeln!(file, "{}", line);
                }
                let _ = file.flush();
            })?;

        if let Ok(mut guard) = self.file_sender.lock() {
            *guard = Some(sender);
        }
        Ok(())
    }

    /// Stop writing to the log file; output returns to stderr
    pub fn clear_log_file(&self) {
        if let Ok(mut guard) = self.file_sender.lock() {
            *guard = None;
        }
    }

    fn write_line(&self, line: String) {
        let sender = self.file_sender.lock().ok().and_then(|guard| guard.clone());
        match sender {
            Some(tx) => {
                if let Err(unsent) = tx.send(line) {
                    eprintln!("{}", unsent.0);
                }
            }
            None => eprintln!("{}", line),
        }
    }
}

/// Log a lazily formatted message under `category` at `level`.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, suppressed) = config.limiter.admit(category, Instant::now());
    if let Some(count) = suppressed {
        config.write_line(format!(
            "[{:?}] rate limit: {} message(s) suppressed",
            category, count
        ));
    }
    if allowed {
        config.write_line(message_fn());
    }
}
