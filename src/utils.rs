/// Report an unrecoverable configuration or device error and terminate the process.
///
/// Prints a single line to stderr so the failure is visible even when no
/// tracing subscriber has been installed.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::tracing::error!("{}", msg);
        eprintln!("[XFERBENCH ERROR] {}", msg);
        std::process::exit(1)
    }};
}

/// Unwrap the result of an execution stream call, exiting the process on error.
///
/// A stream that failed to record or synchronize is in an unknown state, so
/// there is nothing sensible left to measure.
#[macro_export]
macro_rules! check_device {
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => $crate::fatal!("{} ({})", $msg, err),
        }
    };
}

pub(crate) fn round_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Parse a `usize` from the environment, falling back to `default` when unset.
pub(crate) fn env_usize(name: &str, default: usize) -> Result<usize, std::num::ParseIntError> {
    match std::env::var(name) {
        Ok(val) => val.trim().parse::<usize>(),
        Err(_e) => Ok(default),
    }
}
