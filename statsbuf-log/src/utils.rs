use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};

static FORCE_BACKTRACES: AtomicBool = AtomicBool::new(false);

/// Returns `true` if backtrace printing is enabled.
///
/// Backtraces are enabled through the `RUST_BACKTRACE` environment variable or by initializing
/// the logger with `enable_backtraces`.
pub fn backtrace_enabled() -> bool {
    FORCE_BACKTRACES.load(Ordering::Relaxed) || env_backtrace_enabled()
}

fn env_backtrace_enabled() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_ref().map(String::as_str),
        Ok("1") | Ok("full")
    )
}

/// Logs a full backtrace for every panic, regardless of `RUST_BACKTRACE`.
///
/// The panic hook is installed once. The environment is left untouched.
#[cfg_attr(not(feature = "init"), allow(dead_code))]
pub(crate) fn force_backtraces() {
    if FORCE_BACKTRACES.swap(true, Ordering::Relaxed) {
        return;
    }

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        default_hook(info);

        // The default hook already printed one.
        if !env_backtrace_enabled() {
            crate::error!(backtrace = %Backtrace::force_capture(), "panic backtrace");
        }
    }));
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
///
/// Prefer to use [`statsbuf_log::error`](crate::error) over this function whenever possible. This
/// function is intended to be used during startup, where initializing the logger may fail or when
/// errors need to be logged before the logger has been initialized.
///
/// # Example
///
/// ```
/// if let Err(error) = std::env::var("FOO") {
///     statsbuf_log::ensure_error(Box::<dyn std::error::Error>::from(error));
/// }
/// ```
#[allow(clippy::print_stderr)]
pub fn ensure_error<E: AsRef<dyn Error>>(error: E) {
    if tracing::event_enabled!(tracing::Level::ERROR) {
        crate::error!("{}", LogError(error.as_ref()));
    } else {
        eprintln!("error: {}", LogError(error.as_ref()));
    }
}

/// A wrapper around an [`Error`] that prints its causes.
///
/// # Example
///
/// ```
/// use statsbuf_log::LogError;
///
/// if let Err(error) = std::env::var("FOO") {
///     statsbuf_log::error!("env failed: {}", LogError(&error));
/// }
/// ```
pub struct LogError<'a, E: Error + ?Sized>(pub &'a E);

impl<E: Error + ?Sized> fmt::Display for LogError<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(s) = source {
            write!(f, "\n  caused by: {s}")?;
            source = s.source();
        }

        Ok(())
    }
}
