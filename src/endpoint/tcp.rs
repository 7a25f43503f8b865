use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use nix::{
    errno::Errno,
    sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrStorage},
};
use tracing::{debug, trace};

use crate::{device::State, error::Error};

use super::{Endpoint, Setting, Stream};

/// How many not yet accepted connections the kernel may queue for a listener.
pub const BACKLOG: usize = 16;

fn family(address: &SocketAddr) -> AddressFamily {
    match address {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

// A non-blocking stream socket in the address' family.
fn stream_socket(address: &SocketAddr) -> Result<OwnedFd, Error> {
    let fd = socket::socket(
        family(address),
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| Error::os(format!("Creating socket for {address}"), e))?;

    // SAFETY: The descriptor was just created and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A TCP socket accepting connections.
#[derive(Debug)]
pub struct Listener {
    address: SocketAddr,
    socket: Option<TcpListener>,
}

impl Listener {
    /// A listener for the given local address.
    /// Nothing is bound until it is opened.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            socket: None,
        }
    }

    /// The local address.
    /// Once bound this is the actual address, so an ephemeral port is resolved.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Accept one pending connection, which is made non-blocking.
    pub fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let socket = self.socket.as_ref().ok_or_else(super::not_connected)?;

        let (stream, peer) = socket.accept()?;
        stream.set_nonblocking(true)?;

        Ok((stream, peer))
    }

    fn bind(&self) -> Result<TcpListener, Error> {
        let address = self.address;
        let context = |what: &str| format!("{what} {address}");

        let owned = stream_socket(&address)?;
        let fd = owned.as_raw_fd();

        socket::setsockopt(fd, sockopt::ReuseAddr, &true)
            .map_err(|e| Error::os(context("Setting address reuse on"), e))?;

        // Wildcard listeners for both families may then share a port
        if address.is_ipv6() {
            socket::setsockopt(fd, sockopt::Ipv6V6Only, &true)
                .map_err(|e| Error::os(context("Restricting to IPv6 on"), e))?;
        }

        socket::bind(fd, &SockaddrStorage::from(address))
            .map_err(|e| Error::os(context("Binding"), e))?;
        socket::listen(fd, BACKLOG).map_err(|e| Error::os(context("Listening on"), e))?;

        Ok(TcpListener::from(owned))
    }
}

impl Endpoint for Listener {
    fn kind(&self) -> &'static str {
        "listener"
    }

    fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn open(&mut self) -> Result<State, Error> {
        self.release();

        let socket = self.bind()?;
        if let Ok(bound) = socket.local_addr() {
            self.address = bound;
        }

        debug!(address = %self.address, "Listening");
        self.socket = Some(socket);

        Ok(State::Connected)
    }

    fn release(&mut self) {
        if self.socket.take().is_some() {
            debug!(address = %self.address, "Stopped listening");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Accepted,
    Outbound,
}

/// A TCP connection.
///
/// Accepted connections are used once, they can not be opened again after closing.
/// Outbound connections connect (again) whenever opened.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    origin: Origin,
    nodelay: bool,
    stream: Option<TcpStream>,
}

impl Connection {
    /// A connection handed to us by a listener.
    pub fn accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            peer,
            origin: Origin::Accepted,
            nodelay: false,
            stream: Some(stream),
        }
    }

    /// A connection we make to `peer` when opened.
    pub fn outbound(peer: SocketAddr) -> Self {
        Self {
            peer,
            origin: Origin::Outbound,
            nodelay: false,
            stream: None,
        }
    }

    /// The remote end.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True if this came from a listener.
    pub fn is_accepted(&self) -> bool {
        self.origin == Origin::Accepted
    }

    fn apply_nodelay(&self) -> Result<(), Error> {
        if let Some(stream) = &self.stream {
            stream
                .set_nodelay(self.nodelay)
                .map_err(|e| Error::io(format!("Setting no-delay for {}", self.peer), e))?;
        }

        Ok(())
    }

    fn connect(&mut self) -> Result<State, Error> {
        let owned = stream_socket(&self.peer)?;

        let state = match socket::connect(owned.as_raw_fd(), &SockaddrStorage::from(self.peer)) {
            Ok(()) => State::Connected,
            Err(Errno::EINPROGRESS) => State::Pending,
            Err(e) => return Err(Error::os(format!("Connecting to {}", self.peer), e)),
        };

        self.stream = Some(TcpStream::from(owned));
        if state == State::Connected {
            self.apply_nodelay()?;
        }
        debug!(peer = %self.peer, ?state, "Connecting");

        Ok(state)
    }
}

impl Endpoint for Connection {
    fn kind(&self) -> &'static str {
        "connection"
    }

    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn open(&mut self) -> Result<State, Error> {
        match self.origin {
            Origin::Accepted if self.stream.is_some() => {
                debug!(peer = %self.peer, "Connection accepted");
                Ok(State::Connected)
            }
            Origin::Accepted => Err(Error::io(
                format!("Reopening connection from {}", self.peer),
                io::Error::from(io::ErrorKind::NotConnected),
            )),
            Origin::Outbound => {
                self.release();
                self.connect()
            }
        }
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!(peer = %self.peer, "Connection closed");
        }
    }

    fn reopenable(&self) -> bool {
        self.origin == Origin::Outbound
    }

    fn configure(&mut self, setting: Setting) -> Result<(), Error> {
        match setting {
            Setting::NoDelay(nodelay) => {
                self.nodelay = nodelay;
                self.apply_nodelay()
            }
            other => Err(Error::InvalidConfiguration(format!(
                "{other:?} is not supported by connection devices"
            ))),
        }
    }

    fn finish_pending(&mut self) -> Result<bool, Error> {
        let Some(fd) = self.fd() else {
            return Err(Error::DeviceClosed(self.peer.to_string()));
        };

        let context = || format!("Connecting to {}", self.peer);
        let code = socket::getsockopt(fd, sockopt::SocketError).map_err(|e| Error::os(context(), e))?;

        if code == 0 {
            trace!(peer = %self.peer, "Connected");
            self.apply_nodelay()?;
            return Ok(true);
        }

        match Errno::from_i32(code) {
            Errno::EINPROGRESS | Errno::EALREADY => Ok(false),
            errno => Err(Error::os(context(), errno)),
        }
    }

    fn stream(&mut self) -> Option<&mut dyn Stream> {
        self.stream.as_mut().map(|stream| stream as &mut dyn Stream)
    }
}
