use std::{
    fmt::Display,
    io,
    net::{SocketAddr, TcpStream},
    ops::BitOr,
    os::unix::io::RawFd,
    time::Instant,
};

use tracing::{debug, trace, warn};

use crate::{
    collections::{LineStore, RingBuffer},
    endpoint::{Connection, Endpoint, Interest, Listener, Serial, Setting, Variant},
    error::Error,
};

/// Where a device is in its life.
///
/// The usual progression is `None` → `Pending` (sockets still connecting) →
/// `Connected` → `Active` (once data has moved).
/// Closing leads to `Closed`, from which the device is opened again,
/// or to `Inactive`, which is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Never opened.
    None,

    /// Closed for good, will not be opened again.
    Inactive,

    /// Closed, will be opened again.
    Closed,

    /// Waiting for queued output to drain before closing.
    Closing,

    /// Setup has started but not finished.
    Pending,

    /// Open, but idle.
    Open,

    /// Open and ready, i.e. connected or listening.
    Connected,

    /// Open and data has moved.
    Active,
}

impl State {
    /// Open or later, which is when data may be read or written.
    pub fn is_open(self) -> bool {
        matches!(self, State::Open | State::Connected | State::Active)
    }

    /// Holding a resource worth waiting on.
    pub fn is_live(self) -> bool {
        self.is_open() || matches!(self, State::Pending | State::Closing)
    }
}

/// How to close a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseFlags(u8);

impl CloseFlags {
    /// Close right away, dropping queued output.
    pub const NONE: Self = Self(0);

    /// Send queued output before closing.
    pub const FLUSH: Self = Self(0b01);

    /// Never open again once closed.
    pub const INACTIVE: Self = Self(0b10);

    /// True if all of `other` is set here.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CloseFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// What came of handling a readiness event.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing to report.
    Idle,

    /// This many bytes moved.
    Transferred(usize),

    /// The device closed.
    Closed,

    /// A new device was created, which should be added next to this one.
    Spawn(Box<Device>),
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// An I/O endpoint with its buffers and lifecycle state.
///
/// Input is read into a receive buffer,
/// output is queued in a transmit buffer and written when the descriptor allows.
/// Neither [`Device::read`] nor [`Device::write`] ever block.
#[derive(Debug)]
pub struct Device {
    state: State,
    rx: RingBuffer,
    tx: RingBuffer,
    lines: Option<LineStore>,

    // Flags of a close waiting for the transmit buffer to drain
    closing: CloseFlags,

    // Buffer size for devices spawned by this one
    buffer_size: usize,

    variant: Variant,
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.variant)
    }
}

impl Device {
    /// Wrap a variant, with buffers of `buffer_size` bytes.
    ///
    /// Listeners move no data themselves, so get empty buffers,
    /// and hand `buffer_size` on to the connections they accept.
    /// Connections also get a line store for accumulating commands.
    pub fn new(variant: Variant, buffer_size: usize) -> Self {
        let data_buffer_size = match variant {
            Variant::Listener(_) => 0,
            _ => buffer_size,
        };
        let lines = matches!(variant, Variant::Connection(_)).then(LineStore::new);

        Self {
            state: State::None,
            rx: RingBuffer::new(data_buffer_size),
            tx: RingBuffer::new(data_buffer_size),
            lines,
            closing: CloseFlags::NONE,
            buffer_size,
            variant,
        }
    }

    /// A serial port device.
    pub fn serial(serial: Serial, buffer_size: usize) -> Self {
        Self::new(Variant::Serial(serial), buffer_size)
    }

    /// A device listening on `address`.
    pub fn listener(address: SocketAddr, buffer_size: usize) -> Self {
        Self::new(Variant::Listener(Listener::new(address)), buffer_size)
    }

    /// A device for a connection a listener accepted.
    pub fn accepted(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self::new(
            Variant::Connection(Connection::accepted(stream, peer)),
            buffer_size,
        )
    }

    /// A device connecting to `peer` when opened.
    pub fn connect(peer: SocketAddr, buffer_size: usize) -> Self {
        Self::new(Variant::Connection(Connection::outbound(peer)), buffer_size)
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// True if open or later.
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// True if this accepts connections.
    pub fn is_listener(&self) -> bool {
        matches!(self.variant, Variant::Listener(_))
    }

    /// True if this is a TCP connection, accepted or outbound.
    pub fn is_connection(&self) -> bool {
        matches!(self.variant, Variant::Connection(_))
    }

    /// The concrete device.
    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    /// The descriptor, while there is one.
    pub fn fd(&self) -> Option<RawFd> {
        self.variant.fd()
    }

    /// The address a listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.variant {
            Variant::Listener(listener) => Some(listener.address()),
            _ => None,
        }
    }

    /// The receive buffer.
    pub fn rx(&self) -> &RingBuffer {
        &self.rx
    }

    /// The receive buffer, mutably.
    pub fn rx_mut(&mut self) -> &mut RingBuffer {
        &mut self.rx
    }

    /// The transmit buffer.
    pub fn tx(&self) -> &RingBuffer {
        &self.tx
    }

    /// The transmit buffer, mutably.
    pub fn tx_mut(&mut self) -> &mut RingBuffer {
        &mut self.tx
    }

    /// Received text waiting to be handled, for connections.
    pub fn lines(&self) -> Option<&LineStore> {
        self.lines.as_ref()
    }

    /// Received text waiting to be handled, mutably.
    pub fn lines_mut(&mut self) -> Option<&mut LineStore> {
        self.lines.as_mut()
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(device = %self, from = ?self.state, to = ?state, "State change");
            self.state = state;
        }
    }

    fn activate(&mut self) {
        if matches!(self.state, State::Open | State::Connected) {
            self.set_state(State::Active);
        }
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(Error::DeviceClosed(self.to_string()))
        }
    }

    /// Acquire the underlying resource.
    /// A device which fails to open becomes [`State::Inactive`].
    pub fn open(&mut self) {
        match self.variant.open() {
            Ok(state) => {
                self.closing = CloseFlags::NONE;
                self.set_state(state);
            }
            Err(e) => {
                warn!(device = %self, error = %e, "Could not open device");
                self.variant.release();
                self.set_state(State::Inactive);
            }
        }
    }

    /// Close the device.
    ///
    /// With [`CloseFlags::FLUSH`] queued output is sent first:
    /// the device stays [`State::Closing`] until the transmit buffer is empty.
    /// With [`CloseFlags::INACTIVE`], or if the device can not be opened again,
    /// it ends up [`State::Inactive`], otherwise [`State::Closed`].
    ///
    /// Closing a device which is not open does nothing.
    pub fn close(&mut self, flags: CloseFlags) {
        match self.state {
            State::None | State::Inactive | State::Closed => {
                trace!(device = %self, "Already closed");
                return;
            }
            // Never drain a device still setting up
            State::Pending => {}
            _ => {
                self.set_state(State::Closing);
                self.closing = flags;

                if flags.contains(CloseFlags::FLUSH) && !self.tx.is_empty() {
                    debug!(device = %self, queued = self.tx.used(), "Draining before close");
                    return;
                }
            }
        }

        self.variant.release();

        let inactive = flags.contains(CloseFlags::INACTIVE) || !self.variant.reopenable();
        self.set_state(if inactive {
            State::Inactive
        } else {
            State::Closed
        });
    }

    /// Close for good, whatever the state.
    /// Devices never opened, or closed but waiting to be reopened, also become inactive.
    pub fn retire(&mut self) {
        self.close(CloseFlags::INACTIVE);

        if matches!(self.state, State::None | State::Closed | State::Closing) {
            self.variant.release();
            self.set_state(State::Inactive);
        }
    }

    /// Apply a setting to the device.
    pub fn configure(&mut self, setting: Setting) -> Result<(), Error> {
        self.variant.configure(setting)
    }

    /// Which readiness conditions to wait for, given the current state and buffers.
    pub fn interest(&self) -> Interest {
        let sending = !self.tx.is_empty() && self.variant.send_ok();

        match self.state {
            State::Pending => Interest::WRITE,
            state if state.is_open() && self.is_listener() => Interest::READ,
            state if state.is_open() => Interest {
                read: self.rx.available() > 0,
                write: sending,
            },
            State::Closing => Interest {
                read: false,
                write: sending,
            },
            _ => Interest::NONE,
        }
    }

    /// When the device wants another look even if nothing becomes ready,
    /// i.e. when paced output may be sent next.
    pub fn deadline(&self) -> Option<Instant> {
        if self.state.is_live() && !self.tx.is_empty() {
            self.variant.deadline()
        } else {
            None
        }
    }

    /// Get ready to wait for readiness.
    ///
    /// Devices never opened or closed (but not for good) are opened here,
    /// and a device done draining finishes closing.
    /// Returns what to wait on if the device is live.
    pub fn prepare(&mut self) -> Option<(RawFd, Interest)> {
        match self.state {
            State::None | State::Closed => self.open(),
            State::Closing if self.tx.is_empty() => self.close(self.closing),
            _ => {}
        }

        if !self.state.is_live() {
            return None;
        }

        self.variant.fd().map(|fd| (fd, self.interest()))
    }

    // Close after a failure, dropping whatever is buffered.
    // A close already under way keeps its INACTIVE flag.
    fn abort(&mut self) -> Outcome {
        let for_good =
            self.state == State::Closing && self.closing.contains(CloseFlags::INACTIVE);
        let flags = if for_good {
            CloseFlags::INACTIVE
        } else {
            CloseFlags::NONE
        };

        self.rx.flush();
        self.tx.flush();
        self.close(flags);

        Outcome::Closed
    }

    fn finish_pending(&mut self) -> Outcome {
        match self.variant.finish_pending() {
            Ok(true) => {
                self.set_state(State::Connected);
                Outcome::Idle
            }
            Ok(false) => Outcome::Idle,
            Err(e) => {
                warn!(device = %self, error = %e, "Setup failed");
                self.variant.release();
                self.set_state(State::Inactive);
                Outcome::Closed
            }
        }
    }

    fn accept(&mut self) -> Outcome {
        let Variant::Listener(listener) = &mut self.variant else {
            return Outcome::Idle;
        };

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(listener = %listener.address(), %peer, "Accepted connection");
                Outcome::Spawn(Box::new(Device::accepted(stream, peer, self.buffer_size)))
            }
            Err(e) if is_transient(&e) => Outcome::Idle,
            Err(e) => {
                warn!(listener = %listener.address(), error = %e, "Accept failed");
                Outcome::Idle
            }
        }
    }

    /// The descriptor is readable.
    ///
    /// Listeners accept a connection.
    /// Everything else reads into the receive buffer.
    /// End of stream or an error closes the device.
    pub fn handle_read(&mut self) -> Outcome {
        if !self.state.is_open() {
            return Outcome::Idle;
        }

        if self.is_listener() {
            return self.accept();
        }

        if self.rx.available() == 0 {
            return Outcome::Idle;
        }

        match self.variant.read_into(&mut self.rx) {
            Ok(0) => {
                debug!(device = %self, "End of stream");
                self.abort()
            }
            Ok(n) => {
                trace!(device = %self, n, "Read");
                self.activate();
                Outcome::Transferred(n)
            }
            Err(e) if is_transient(&e) => Outcome::Idle,
            Err(e) => {
                warn!(device = %self, error = %e, "Read failed");
                self.abort()
            }
        }
    }

    /// The descriptor is writable.
    ///
    /// Finishes pending setup, or writes from the transmit buffer.
    /// Partial writes leave the rest queued. An error closes the device.
    pub fn handle_write(&mut self) -> Outcome {
        match self.state {
            State::Pending => return self.finish_pending(),
            State::Closing => {}
            state if state.is_open() => {}
            _ => return Outcome::Idle,
        }

        if self.is_listener() || self.tx.is_empty() {
            return Outcome::Idle;
        }

        match self.variant.write_from(&mut self.tx) {
            Ok(0) => Outcome::Idle,
            Ok(n) => {
                trace!(device = %self, n, "Wrote");
                self.activate();
                Outcome::Transferred(n)
            }
            Err(e) if is_transient(&e) => Outcome::Idle,
            Err(e) => {
                warn!(device = %self, error = %e, "Write failed");
                self.abort()
            }
        }
    }

    /// The descriptor reported an error or hang up.
    pub fn handle_except(&mut self) -> Outcome {
        match self.state {
            State::Pending => self.finish_pending(),
            state if state.is_live() => {
                warn!(device = %self, "Error condition on device");
                self.abort()
            }
            _ => Outcome::Idle,
        }
    }

    /// Take received bytes out of the receive buffer.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_open()?;
        Ok(self.rx.get(buf))
    }

    /// Queue bytes for sending.
    ///
    /// Never blocks: returns how many bytes were queued,
    /// which is less than asked for if the transmit buffer is full.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.check_open()?;

        let queued = self.tx.put(buf);
        if queued < buf.len() {
            debug!(device = %self, dropped = buf.len() - queued, "Transmit buffer full");
        }

        Ok(queued)
    }

    /// Move what was received into the line store.
    /// Returns how many bytes moved. Devices without a line store keep their input.
    ///
    /// The store holds at most the device's buffer size.
    /// Input beyond that stays in the receive buffer until lines are consumed,
    /// unless the store is full without a complete line:
    /// the device is then closed for good.
    pub fn collect_lines(&mut self) -> Result<usize, Error> {
        let limit = self.buffer_size;
        let Some(lines) = self.lines.as_mut() else {
            return Ok(0);
        };

        let room = limit.saturating_sub(lines.len());
        let (front, back) = self.rx.as_slices();
        let front = &front[..front.len().min(room)];
        let back = &back[..back.len().min(room - front.len())];

        let collected = lines.append(front)? + lines.append(back)?;
        self.rx.skip(collected);

        let stuck = lines.len() >= limit && lines.next_line().is_none();
        if stuck {
            warn!(device = %self, limit, "Line too long, closing");
            self.rx.flush();
            self.close(CloseFlags::INACTIVE);
        }

        Ok(collected)
    }
}
