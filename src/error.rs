use std::io;

/// Everything that can go wrong while submitting, driving or waiting on
/// operations
///
/// Errors are cheap to clone so that an operation's terminal result can be
/// handed out any number of times
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The request or call was malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The handle is already bound to a different multiplexer
    #[error("handle is registered with another multiplexer")]
    AlreadyRegistered,

    /// The deadline expired, any operation involved is still live
    #[error("deadline expired")]
    TimedOut,

    /// The operation was cancelled before it transferred anything
    #[error("operation was cancelled")]
    Cancelled,

    /// The backend cannot cancel the operation, either at all or anymore
    #[error("operation cannot be cancelled")]
    CannotCancel,

    /// The operating system reported a failure
    #[error("i/o error: {}", io::Error::from_raw_os_error(*code))]
    Io { code: i32 },

    /// The operation completed but moved fewer bytes than requested
    #[error("short transfer of {transferred} out of {requested} bytes")]
    ShortTransfer { requested: usize, transferred: usize },

    /// The multiplexer hit an unrecoverable condition and refuses further
    /// work
    #[error("multiplexer is broken: {0}")]
    Broken(String),

    /// A configuration value could not be parsed
    #[error("invalid value {value:?} for {variable}")]
    Config {
        variable: &'static str,
        value: String,
    },
}

impl Error {
    /// The platform error code carried by [`Error::Io`]
    #[must_use]
    pub const fn raw_os_error(&self) -> Option<i32> {
        if let Self::Io { code } = self {
            return Some(*code);
        }

        None
    }

    pub(crate) const fn from_raw_os_error(code: i32) -> Self {
        Self::Io { code }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        let code = error.raw_os_error().unwrap_or(match error.kind() {
            io::ErrorKind::WouldBlock => libc::EAGAIN,
            io::ErrorKind::Interrupted => libc::EINTR,
            io::ErrorKind::InvalidInput => libc::EINVAL,
            io::ErrorKind::TimedOut => libc::ETIMEDOUT,
            io::ErrorKind::Unsupported => libc::ENOSYS,
            _ => libc::EIO,
        });

        Self::Io { code }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io { code } => Self::from_raw_os_error(code),
            Error::TimedOut => Self::new(io::ErrorKind::TimedOut, error),
            Error::Cancelled => Self::new(io::ErrorKind::Interrupted, error),
            Error::InvalidArgument(_) | Error::Config { .. } => {
                Self::new(io::ErrorKind::InvalidInput, error)
            }
            Error::ShortTransfer { .. } => Self::new(io::ErrorKind::UnexpectedEof, error),
            Error::AlreadyRegistered | Error::CannotCancel | Error::Broken(_) => Self::other(error),
        }
    }
}
