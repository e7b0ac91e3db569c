//! Helper macros for logging (console printing).

use std::sync::OnceLock;

use env_logger::Env;

/// Global variable holding the process identity string used as logging
/// prefix, e.g., `l` for the launcher.
pub static ME: OnceLock<String> = OnceLock::new();

/// Sets the logging prefix identity. Only the first call takes effect.
pub fn me_init(me: impl ToString) {
    let _ = ME.set(me.to_string());
}

/// Log a message at the given `log::Level` with parenthesized prefix. All the
/// `pf_*!` macros below forward to this one.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:expr, $($fmt_args:tt)*) => {
        log::log!(
            $level,
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Trace, $($fmt_args)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Debug, $($fmt_args)*)
    };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Info, $($fmt_args)*)
    };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Warn, $($fmt_args)*)
    };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Error, $($fmt_args)*)
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return a `PaxbootError`
/// containing the string.
///
/// Example:
/// ```no_compile
/// let e = logged_err!("replica {} failed to start", id);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::PaxbootError::msg(format!($($fmt_args)*)))
        }
    };
}
