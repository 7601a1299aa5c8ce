// Category-based logging infrastructure
//
// This will be used from multiple threads, so it needs
// to be stateless
//
// Austin Shafer - 2020
extern crate lazy_static;
use lazy_static::lazy_static;

#[allow(dead_code, non_camel_case_types)]
pub enum LogLevel {
    // in order of highest priority
    critical, // Urgent and must always be displayed
    error,
    debug,     // debugging related, not verbose
    info,      // more verbose
    profiling, // profiling related timing
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::critical => "critical",
            LogLevel::error => "error",
            LogLevel::debug => "debug",
            LogLevel::info => "info",
            LogLevel::profiling => "profiling",
        }
    }

    pub fn get_level(&self) -> u32 {
        match self {
            LogLevel::critical => 0,
            LogLevel::error => 1,
            LogLevel::debug => 2,
            LogLevel::info => 3,
            LogLevel::profiling => 4,
        }
    }
}

lazy_static! {
    // The active level is chosen once from the environment. Anything
    // at or above this priority gets printed.
    static ref LOG_LEVEL: u32 = match std::env::var("STRATUS_LOG") {
        Ok(lvl) => match lvl.to_lowercase().as_str() {
            "critical" => 0,
            "error" => 1,
            "debug" => 2,
            "info" => 3,
            "profiling" => 4,
            _ => 1,
        },
        Err(_) => 1,
    };
}

pub fn get_log_level() -> u32 {
    *LOG_LEVEL
}

#[macro_export]
macro_rules! log_internal {
    ($loglevel:expr, $($format_args:tt)+) => ({
        if $loglevel.get_level() <= $crate::logging::get_log_level() {
            println!("[{:?}]<{}> {}:{} - {}",
                     $crate::timing::get_current_millis(),
                     $loglevel.get_name(),
                     file!(),
                     line!(),
                     format!($($format_args)+)
            );
        }
    })
}

#[macro_export]
macro_rules! critical {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::critical, $($format_args)+)
    })
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::error, $($format_args)+)
    })
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::debug, $($format_args)+)
    })
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::info, $($format_args)+)
    })
}

#[macro_export]
macro_rules! profiling {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::profiling, $($format_args)+)
    })
}
