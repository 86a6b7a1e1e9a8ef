use std::fmt::Display;

/// dlsm errors. Every public operation returns one of these; background
/// failures are latched into the engine and surfaced through subsequent
/// writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Read-path only: the key does not exist at the requested snapshot.
    NotFound,
    /// Checksum or invariant violation in a block, manifest record, or
    /// version edit.
    Corruption(String),
    /// Environment or transport failure, including shutdown-during-op.
    IO(String),
    /// Bad options or arguments, missing DB without `create_if_missing`,
    /// existing DB with `error_if_exists`.
    InvalidArgument(String),
    /// Operation recognized but not implemented by this engine.
    NotSupported(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
        }
    }
}

impl Error {
    /// True for errors that poison the engine when raised in the
    /// background. Foreground lookups (`NotFound`, bad arguments) never
    /// latch.
    pub fn is_background_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::IO(_))
    }
}

/// Constructs an Error::Corruption from a format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an Error::InvalidArgument from a format string.
#[macro_export]
macro_rules! invalid_argument {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// A dlsm Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
