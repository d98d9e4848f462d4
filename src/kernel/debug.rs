// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Logging and Diagnostics
//!
//! This module provides the logging macros used by the IPC layer. Records
//! are filtered against a kernel-wide minimum level and then handed to the
//! `log` facade, so whichever logger the kernel installs (serial console,
//! debuglog ring, test harness) receives them.
//!
//! # Usage
//!
//! ```rust
//! // Simple logging
//! log_info!("ipc: initialized, requests_max={}", max);
//!
//! // Conditional logging
//! log_trace_if!(LOCAL_TRACE, "port {} srights={}", id, srights);
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace = 0,

    /// Debug-level logging (verbose)
    Debug = 1,

    /// Informational logging
    Info = 2,

    /// Warning-level logging
    Warning = 3,

    /// Error-level logging
    Error = 4,
}

impl LogLevel {
    /// Get the log level name as a string
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Map onto the `log` facade level
    pub fn to_log(self) -> log::Level {
        match self {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            _ => LogLevel::Error,
        }
    }
}

/// Global minimum log level
///
/// Only messages at or above this level are forwarded.
static MIN_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Set the minimum log level
pub fn log_set_min_level(level: LogLevel) {
    MIN_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level
pub fn log_get_min_level() -> LogLevel {
    LogLevel::from_raw(MIN_LOG_LEVEL.load(Ordering::Relaxed))
}

/// Check if messages at `level` are forwarded
#[inline]
pub fn log_level_enabled(level: LogLevel) -> bool {
    level >= log_get_min_level()
}

/// Forward a formatted message at a specific log level
#[inline]
pub fn log_print(level: LogLevel, args: core::fmt::Arguments) {
    if !log_level_enabled(level) {
        return;
    }
    log::log!(target: "rustux::ipc", level.to_log(), "{}", args);
}

/// Log a trace message
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Trace, format_args!($($arg)*));
    };
}

/// Log a trace message if condition is true
#[macro_export]
macro_rules! log_trace_if {
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            $crate::log_trace!($($arg)*);
        }
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Debug, format_args!($($arg)*));
    };
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Info, format_args!($($arg)*));
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Warning, format_args!($($arg)*));
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Error, format_args!($($arg)*));
    };
}
