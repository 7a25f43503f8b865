use std::{
    fmt::Display,
    io::{self, Read, Write},
    os::unix::io::RawFd,
    time::{Duration, Instant},
};

use crate::{collections::RingBuffer, device::State, error::Error};

/// Serial port devices.
pub mod serial;

/// TCP listening and connection devices.
pub mod tcp;

pub use serial::Serial;
pub use tcp::{Connection, Listener};

/// Which readiness conditions a device wants to hear about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    /// Wake up when there is something to read (or accept).
    pub read: bool,

    /// Wake up when writing would not block.
    pub write: bool,
}

impl Interest {
    /// Nothing but errors.
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };

    /// Readability.
    pub const READ: Self = Self {
        read: true,
        write: false,
    };

    /// Writability.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
}

/// A setting which may be applied to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    /// Line speed of a serial port.
    Baud(u32),

    /// Minimum time between characters sent on a serial port.
    CharPacing(Duration),

    /// Disable Nagle's algorithm on a TCP connection.
    NoDelay(bool),
}

/// Both directions of a byte stream.
pub trait Stream: Read + Write {}

impl<T: Read + Write> Stream for T {}

/// What every kind of device must be able to do.
///
/// The data handlers have default implementations which move bytes between
/// a ring buffer and whatever [`Endpoint::stream`] returns.
pub trait Endpoint {
    /// What sort of device this is, used in diagnostics.
    fn kind(&self) -> &'static str;

    /// The descriptor to wait on, if there is one.
    fn fd(&self) -> Option<RawFd>;

    /// Acquire the underlying resource.
    ///
    /// Returns the state the device should move to,
    /// which is [`State::Pending`] if setup finishes later.
    fn open(&mut self) -> Result<State, Error>;

    /// Let go of the underlying resource, closing the descriptor.
    /// Releasing something already released does nothing.
    fn release(&mut self);

    /// Whether the device may be opened again after being closed.
    fn reopenable(&self) -> bool {
        true
    }

    /// Apply a setting.
    fn configure(&mut self, setting: Setting) -> Result<(), Error> {
        Err(Error::InvalidConfiguration(format!(
            "{setting:?} is not supported by {} devices",
            self.kind()
        )))
    }

    /// Whether queued output may be sent right now.
    fn send_ok(&self) -> bool {
        true
    }

    /// When [`Endpoint::send_ok`] will next change its mind, if it is waiting on a timer.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Check on setup which was left pending by [`Endpoint::open`].
    /// `Ok(true)` when done, `Ok(false)` when still in progress.
    fn finish_pending(&mut self) -> Result<bool, Error> {
        Ok(true)
    }

    /// The open byte stream, if any.
    fn stream(&mut self) -> Option<&mut dyn Stream> {
        None
    }

    /// Read what is available into `rx`.
    /// `Ok(0)` means end of stream.
    fn read_into(&mut self, rx: &mut RingBuffer) -> io::Result<usize> {
        let stream = self.stream().ok_or_else(not_connected)?;
        rx.fill_from(stream)
    }

    /// Write as much of `tx` as the stream takes, removing what was written.
    fn write_from(&mut self, tx: &mut RingBuffer) -> io::Result<usize> {
        let stream = self.stream().ok_or_else(not_connected)?;
        let written = stream.write(tx.contiguous())?;

        Ok(tx.skip(written))
    }
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

/// The concrete kinds of device.
#[derive(Debug)]
pub enum Variant {
    /// A serial port.
    Serial(Serial),

    /// A TCP socket accepting connections.
    Listener(Listener),

    /// A TCP connection, accepted or outbound.
    Connection(Connection),
}

impl Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Serial(serial) => write!(f, "{}", serial.path()),
            Variant::Listener(listener) => write!(f, "listen:{}", listener.address()),
            Variant::Connection(connection) => write!(f, "tcp:{}", connection.peer()),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            Variant::Serial($inner) => $call,
            Variant::Listener($inner) => $call,
            Variant::Connection($inner) => $call,
        }
    };
}

impl Endpoint for Variant {
    fn kind(&self) -> &'static str {
        dispatch!(self, inner => inner.kind())
    }

    fn fd(&self) -> Option<RawFd> {
        dispatch!(self, inner => inner.fd())
    }

    fn open(&mut self) -> Result<State, Error> {
        dispatch!(self, inner => inner.open())
    }

    fn release(&mut self) {
        dispatch!(self, inner => inner.release())
    }

    fn reopenable(&self) -> bool {
        dispatch!(self, inner => inner.reopenable())
    }

    fn configure(&mut self, setting: Setting) -> Result<(), Error> {
        dispatch!(self, inner => inner.configure(setting))
    }

    fn send_ok(&self) -> bool {
        dispatch!(self, inner => inner.send_ok())
    }

    fn deadline(&self) -> Option<Instant> {
        dispatch!(self, inner => inner.deadline())
    }

    fn finish_pending(&mut self) -> Result<bool, Error> {
        dispatch!(self, inner => inner.finish_pending())
    }

    fn stream(&mut self) -> Option<&mut dyn Stream> {
        dispatch!(self, inner => inner.stream())
    }

    fn read_into(&mut self, rx: &mut RingBuffer) -> io::Result<usize> {
        dispatch!(self, inner => inner.read_into(rx))
    }

    fn write_from(&mut self, tx: &mut RingBuffer) -> io::Result<usize> {
        dispatch!(self, inner => inner.write_from(tx))
    }
}
