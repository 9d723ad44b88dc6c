//! Prefixed logging macros over the `log` facade.

use std::sync::OnceLock;

use env_logger::Env;

/// Identity of this lock manager, prepended to every log line.
pub static ME: OnceLock<String> = OnceLock::new();

/// Environment variable overriding the default log filter.
const LOG_ENV: &str = "NLOCKD_LOG";

/// Shared body of the `pf_*!` macros: logs at `$level` with the `ME` prefix.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:ident, $($fmt_args:tt)*) => {
        log::$level!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format_args!($($fmt_args)*)
        )
    };
}

/// Log at TRACE level, e.g. per-request entry.
///
/// Example:
/// ```no_compile
/// pf_trace!("test from {}", name);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(trace, $($fmt_args)*) };
}

/// Log at DEBUG level.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(debug, $($fmt_args)*) };
}

/// Log at INFO level.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(info, $($fmt_args)*) };
}

/// Log at WARN level.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(warn, $($fmt_args)*) };
}

/// Log at ERROR level.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(error, $($fmt_args)*) };
}

/// Logs the formatted message at ERROR level and evaluates to an `Err`
/// carrying the same message as `NlmError`.
///
/// Example:
/// ```no_compile
/// return logged_err!("sysid {} unknown", sysid);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {{
        let msg = format!($($fmt_args)*);
        $crate::pf_error!("{}", msg);
        Err($crate::NlmError::msg(msg))
    }};
}

/// Installs `env_logger` as the log backend, filtered by `NLOCKD_LOG` and
/// defaulting to `info`. Later calls are no-ops.
pub fn logger_init() {
    let env = Env::new().filter_or(LOG_ENV, "info");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .try_init();
}

#[cfg(test)]
mod print_tests {
    use crate::utils::NlmError;

    #[test]
    fn logged_err_plain() {
        let res: Result<(), NlmError> = logged_err!("monitor unreachable");
        assert_eq!(res, Err(NlmError::msg("monitor unreachable")));
    }

    #[test]
    fn logged_err_formatted() {
        let res: Result<u32, NlmError> =
            logged_err!("sysid {} of {}", 7, "bob");
        assert_eq!(res, Err(NlmError::msg("sysid 7 of bob")));
    }

    #[test]
    fn init_is_idempotent() {
        super::logger_init();
        super::logger_init();
        pf_info!("logger ready");
    }
}
