use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// An index was used which is not backed by an element.
    #[error("Index {index} is out of bounds (of {len} elements)")]
    OutOfBounds {
        /// The offending index.
        index: usize,

        /// How many elements were in use at the time.
        len: usize,
    },

    /// Growing a container failed.
    /// There is no sensible way to continue after this.
    #[error("Could not grow storage to hold {requested} elements")]
    AllocationFailure {
        /// The capacity which was asked for.
        requested: usize,
    },

    /// I/O was attempted on a device which is not open.
    #[error("The device `{0}` is not open")]
    DeviceClosed(String),

    /// An operating system call failed.
    #[error("{context}: {source}")]
    Io {
        /// What we were doing at the time.
        context: String,

        /// The underlying problem.
        #[source]
        source: io::Error,
    },

    /// The baud rate is not in the table of supported rates.
    #[error("The baud rate {0} is not supported")]
    InvalidBaudRate(u32),

    /// Something about the configuration makes it unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Waiting for readiness failed.
    #[error("Waiting for device readiness failed: {0}")]
    SelectorWait(#[source] Errno),

    /// No serial device matched the port specification.
    #[error("No available serial device matching `{0}`")]
    NoSerialDevice(String),

    /// Not a single listening socket could be set up.
    #[error("Could not listen on `{0}`")]
    NoListener(String),
}

impl Error {
    /// Wrap an I/O error with what we were trying to do.
    pub fn io<S: Into<String>>(context: S, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an OS error number with what we were trying to do.
    pub fn os<S: Into<String>>(context: S, errno: Errno) -> Self {
        Self::io(context, io::Error::from(errno))
    }

    /// True if the problem went away by simply trying again,
    /// for example a readiness wait interrupted by a signal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SelectorWait(Errno::EINTR | Errno::EAGAIN))
    }

    /// Get the problem description if this is a configuration error.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        match self {
            Self::InvalidConfiguration(problem) => Ok(problem),
            other => Err(other),
        }
    }
}
