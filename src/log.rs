use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 0,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LogLevel::Error => write!(f, "E"),
            LogLevel::Warn => write!(f, "W"),
            LogLevel::Info => write!(f, "I"),
            LogLevel::Debug => write!(f, "D"),
            LogLevel::Trace => write!(f, "T"),
        }
    }
}

static LEVEL: AtomicUsize = AtomicUsize::new(LogLevel::Info as usize);

pub fn log_init(level: LogLevel) {
    LEVEL.store(level as usize, Ordering::Relaxed);
}

pub fn enabled(level: LogLevel) -> bool {
    level as usize <= LEVEL.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! trace(
    ($fmt:expr) => {
        if cfg!(debug_assertions) {
            log!($crate::LogLevel::Trace, $fmt)
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        if cfg!(debug_assertions) {
            log!($crate::LogLevel::Trace, $fmt, $($arg)*)
        }
    };
);

#[macro_export]
macro_rules! debug(
    ($fmt:expr) => {
        log!($crate::LogLevel::Debug, $fmt)
    };
    ($fmt:expr, $($args:tt)*) => {
        log!($crate::LogLevel::Debug, $fmt, $($args)*)
    };
);

#[macro_export]
macro_rules! info(
    ($fmt:expr) => {
        log!($crate::LogLevel::Info, $fmt)
    };
    ($fmt:expr, $($arg:tt)*) => {
        log!($crate::LogLevel::Info, $fmt, $($arg)*)
    };
);

#[macro_export]
macro_rules! warn(
    ($fmt:expr) => {
        log!($crate::LogLevel::Warn, $fmt)
    };
    ($fmt:expr, $($arg:tt)*) => {
        log!($crate::LogLevel::Warn, $fmt, $($arg)*)
    };
);

#[macro_export]
macro_rules! error(
    ($fmt:expr) => {
        log!($crate::LogLevel::Error, $fmt)
    };
    ($fmt:expr, $($args:tt)*) => {
        log!($crate::LogLevel::Error, $fmt, $($args)*)
    };
);

#[macro_export]
macro_rules! log(
    ($level:expr, $fmt:expr) => {
        log!($level, $fmt,)
    };

    ($level:expr, $fmt:expr, $($arg:tt)*) => {
        {
        #[allow(unused_imports)]
        {
            use std::io::Write;
            if $crate::log::enabled($level) {
                let mut msg = Vec::with_capacity(25);
                let time = ::chrono::Local::now();
                write!(&mut msg, "{} [{}:{}] {}: ",
                       time.format("%x %X"), module_path!(), line!(), $level).ok();
                write!(&mut msg, $fmt, $($arg)*).ok();
                write!(&mut msg, "\n").ok();
                let stderr = ::std::io::stderr();
                let mut handle = stderr.lock();
                handle.write_all(&msg).ok();
            }
        }
        }
    };
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(format!("{}", LogLevel::Warn), "W");
    }
}
