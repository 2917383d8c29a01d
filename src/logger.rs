// Daemon-wide log collection.
//
// Records go to the console (stderr, coloured) and, once a log directory is
// configured, to an append-only file. Every line streamed to a client is
// mirrored here so a run can be reconstructed after the client went away.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag prefixed to every record, matching the service name of the control socket.
pub const LOG_TAG: &str = "memorytester";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        }
    }

    fn color_code(&self) -> &'static str {
        match self {
            LogLevel::Debug => "\x1b[37m",
            LogLevel::Info => "\x1b[36m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Error => "\x1b[31m",
            LogLevel::Success => "\x1b[32m",
        }
    }
}

pub struct Logger {
    file: Option<Mutex<fs::File>>,
    console_enabled: bool,
    min_level: LogLevel,
}

impl Logger {
    /// Opens (creating parent directories as needed) the log file in append mode.
    pub fn new(log_file_path: Option<&Path>, console_enabled: bool) -> io::Result<Self> {
        let file = match log_file_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };

        Ok(Logger {
            file,
            console_enabled,
            min_level: LogLevel::Debug,
        })
    }

    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = format_timestamp(SystemTime::now());
        let level_str = level.as_str();

        // Debug output is file-only; the console is for operators.
        if self.console_enabled && level != LogLevel::Debug {
            let color = level.color_code();
            eprintln!("{color}[{timestamp}] {LOG_TAG} {level_str}: {message}\x1b[0m");
        }

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "[{timestamp}] {LOG_TAG} {level_str}: {message}");
                let _ = file.flush();
            }
        }
    }

    pub fn log_fmt(&self, level: LogLevel, args: std::fmt::Arguments) {
        self.log(level, &args.to_string());
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn success(&self, message: &str) {
        self.log(LogLevel::Success, message);
    }
}

/// Renders `[YYYY-MM-DD HH:MM:SS]` in UTC.
fn format_timestamp(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

/// Installs the process logger. Falls back to a console-only logger when the
/// file cannot be opened, returning the open error so the caller can report it.
pub fn init_logger(log_file_path: Option<&Path>, console_enabled: bool) -> io::Result<()> {
    let (logger, open_error) = match Logger::new(log_file_path, console_enabled) {
        Ok(logger) => (logger, None),
        Err(e) => (Logger::new(None, console_enabled)?, Some(e)),
    };
    GLOBAL_LOGGER
        .set(logger)
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "logger already initialized"))?;
    match open_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub fn get_logger() -> Option<&'static Logger> {
    GLOBAL_LOGGER.get()
}

macro_rules! generate_global_log_fn {
    ($fn_name:ident, $method:ident, $level:literal, $fallback:ident) => {
        pub fn $fn_name(message: &str) {
            if let Some(logger) = get_logger() {
                logger.$method(message);
            } else {
                $fallback!("{}: {}", $level, message);
            }
        }
    };
}

generate_global_log_fn!(log_debug, debug, "DEBUG", eprintln);
generate_global_log_fn!(log_info, info, "INFO", eprintln);
generate_global_log_fn!(log_warn, warn, "WARNING", eprintln);
generate_global_log_fn!(log_error, error, "ERROR", eprintln);
generate_global_log_fn!(log_success, success, "SUCCESS", eprintln);

#[macro_export]
macro_rules! log_debug_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Debug, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_info_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Info, format_args!($($arg)*));
        } else {
            eprintln!("INFO: {}", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_warn_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Warn, format_args!($($arg)*));
        } else {
            eprintln!("WARNING: {}", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_error_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.log_fmt($crate::logger::LogLevel::Error, format_args!($($arg)*));
        } else {
            eprintln!("ERROR: {}", format_args!($($arg)*));
        }
    };
}
