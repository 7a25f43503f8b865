#![allow(dead_code)]

use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpStream},
    os::unix::io::AsRawFd,
    time::{Duration, Instant},
};

use color_eyre::{eyre::bail, Result};
use nix::{
    fcntl::OFlag,
    poll::{poll, PollFd, PollFlags},
    pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster},
};
use serial_bridge::{
    bridge::{Bridge, Settings, Tick},
    device::Device,
    endpoint::Serial,
};
use tracing::info;

/// How long a test may pump before giving up.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// The controlling side of a pseudo-terminal.
/// The other side stands in for a serial device.
pub struct Pty {
    master: PtyMaster,
    path: String,
}

impl Pty {
    pub fn new() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
        grantpt(&master)?;
        unlockpt(&master)?;
        let path = ptsname_r(&master)?;

        info!(%path, "Pseudo-terminal");
        Ok(Self { master, path })
    }

    /// Path of the device end.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Act as the serial device sending `data`.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.master.write_all(data)?;
        Ok(())
    }

    /// Whatever the serial device has been sent, without waiting.
    pub fn received(&mut self, into: &mut Vec<u8>) -> Result<()> {
        let fd = self.master.as_raw_fd();

        loop {
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            if poll(&mut fds, 0)? == 0 {
                return Ok(());
            }

            let mut buf = [0; 512];
            match self.master.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => into.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

pub fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

pub fn settings(command_pacing: Duration) -> Settings {
    Settings {
        io_buffer_size: 4096,
        command_pacing,
        poll_timeout: Some(Duration::from_millis(10)),
    }
}

/// A serial device on the pseudo-terminal, without character pacing.
pub fn serial(pty: &Pty) -> Result<Serial> {
    Ok(Serial::builder(pty.path())
        .set_char_pacing(Duration::ZERO)
        .build()?)
}

/// A bridge between the pseudo-terminal and a loopback listener on any port.
/// The serial device is open once this returns.
pub fn start(pty: &Pty, command_pacing: Duration) -> Result<Bridge> {
    let mut bridge = Bridge::new(serial(pty)?, &[loopback()], settings(command_pacing))?;
    pump_until(&mut bridge, |bridge| {
        bridge.serial().map(Device::is_open).unwrap_or(false)
    })?;

    Ok(bridge)
}

/// Run the bridge until `done` says so.
pub fn pump_until<F>(bridge: &mut Bridge, mut done: F) -> Result<()>
where
    F: FnMut(&mut Bridge) -> bool,
{
    let started = Instant::now();

    while !done(bridge) {
        if started.elapsed() > PATIENCE {
            bail!("Gave up waiting");
        }

        match bridge.run_once() {
            Ok(Tick::Continue) => {}
            Ok(Tick::Shutdown(reason)) => bail!("Bridge stopped: {reason:?}"),
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Run the bridge for a while.
pub fn pump_for(bridge: &mut Bridge, duration: Duration) -> Result<()> {
    let started = Instant::now();
    pump_until(bridge, |_| started.elapsed() >= duration)
}

/// Number of open client connections.
pub fn clients(bridge: &Bridge) -> usize {
    bridge
        .selector()
        .devices()
        .filter(|device| device.is_connection() && device.is_open())
        .count()
}

/// Connect a client and wait for the bridge to have accepted it.
pub fn connect(bridge: &mut Bridge) -> Result<TcpStream> {
    let before = clients(bridge);

    let client = TcpStream::connect(bridge.local_addrs()[0])?;
    client.set_nonblocking(true)?;

    pump_until(bridge, |bridge| clients(bridge) > before)?;

    Ok(client)
}

/// Whatever the client has been sent, without waiting.
pub fn received(client: &mut TcpStream, into: &mut Vec<u8>) -> Result<()> {
    let mut buf = [0; 512];

    loop {
        match client.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => into.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}
