use nix::errno::Errno;
use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt, result,
};

/// Error surfaced out of a tracing session.
///
/// Carries a human-readable message, the originating `errno` when the
/// failure came straight from a kernel call, and a captured backtrace
/// (honouring `RUST_BACKTRACE`).
pub struct Error {
    error: String,
    errno: Option<Errno>,
    backtrace: Backtrace,
}

impl Error {
    fn new(error: String, errno: Option<Errno>) -> Self {
        Self {
            error,
            errno,
            backtrace: Backtrace::capture(),
        }
    }

    /// Build an error from a kernel `errno`, keeping the code available to
    /// callers through [`Error::errno`].
    #[must_use]
    pub fn from_errno(errno: Errno) -> Self {
        Self::new(errno.to_string(), Some(errno))
    }

    #[must_use]
    /// The `errno` this error originated from, if any.
    pub fn errno(&self) -> Option<Errno> {
        self.errno
    }

    #[must_use]
    /// The error message, without backtrace.
    pub fn message(&self) -> &str {
        &self.error
    }

    #[must_use]
    /// Prefix the message with `context`, keeping errno and backtrace.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self {
            error: format!("{context}: {}", self.error),
            ..self
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace:\n{}", self.backtrace)
        } else {
            Ok(())
        }
    }
}

impl<E: fmt::Display> From<E> for Error {
    fn from(e: E) -> Error {
        Error::new(e.to_string(), None)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Attach a message to the error side of a `Result`.
pub trait Context<T> {
    /// # Errors
    ///
    /// Returns the original error, converted to [`Error`] and prefixed with
    /// `context`.
    fn context(self, context: impl fmt::Display) -> Result<T>;
}

impl<T> Context<T> for result::Result<T, Errno> {
    fn context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| Error::from_errno(e).context(context))
    }
}

impl<T> Context<T> for Result<T> {
    fn context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

impl<T> Context<T> for result::Result<T, std::io::Error> {
    fn context(self, context: impl fmt::Display) -> Result<T> {
        self.map_err(|e| {
            let errno = e.raw_os_error().map(Errno::from_raw);
            Error::new(e.to_string(), errno).context(context)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ctor::ctor;

    #[ctor]
    fn init() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    #[test]
    fn test_error_from_display() {
        let error: Error = "Test error".to_string().into();
        assert_eq!(error.error, "Test error");
        assert!(error.errno().is_none());
        assert!(error.backtrace.status() == BacktraceStatus::Captured);
    }

    #[test]
    fn test_error_from_errno_keeps_code() {
        let error = Error::from_errno(Errno::ESRCH);
        assert_eq!(error.errno(), Some(Errno::ESRCH));
        assert!(error.message().contains("ESRCH"));
    }

    #[test]
    fn test_context_prefixes_message() {
        let result: result::Result<(), Errno> = Err(Errno::EPERM);
        let error = result.context("attach 42").unwrap_err();
        assert!(error.message().starts_with("attach 42: "));
        assert_eq!(error.errno(), Some(Errno::EPERM));
    }

    #[test]
    fn test_io_context_extracts_errno() {
        let result: result::Result<(), std::io::Error> =
            Err(std::io::Error::from_raw_os_error(libc::ENOENT));
        let error = result.context("open").unwrap_err();
        assert_eq!(error.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn test_error_debug_has_backtrace() {
        let error = Error::from_errno(Errno::EINVAL);
        let debug_output = format!("{error:?}");
        assert!(debug_output.contains("EINVAL"));
        assert!(debug_output.contains("Backtrace"));
    }
}
