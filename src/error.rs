use std::fmt::Display;

/// Engine errors surfaced on the setup path (file-set initialization, plot
/// creation, header encoding). Dispatch-path I/O failures never reach
/// producers as errors; the dispatcher treats them as fatal.
#[derive(Debug)]
pub enum Error {
    /// Invalid user input, typically a bad option or an oversized memo.
    InvalidInput(String),
    /// An IO error, annotated with the file it occurred on.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// A plotdisk Result returning Error.
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
