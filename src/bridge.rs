use std::{net::SocketAddr, time::Duration};

use tracing::{debug, info, trace, warn};

use crate::{
    collections::RingBuffer,
    config::Config,
    device::{Device, State},
    endpoint::serial::{self, Serial},
    error::Error,
    net,
    selector::{DeviceId, Pass, Selector},
    timer::Timer,
};

/// The serial device always comes first.
pub const SERIAL_INDEX: usize = 0;

/// Why the bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The serial device went away for good.
    SerialGone,

    /// No listener is left to accept clients.
    NoListeners,

    /// No device was left to wait for.
    Idle,
}

/// What the bridge wants after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Keep going.
    Continue,

    /// Stop, this is a normal end.
    Shutdown(ShutdownReason),
}

/// Tunables of a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Capacity of every data buffer, relay included.
    pub io_buffer_size: usize,

    /// Minimum time between commands forwarded to the serial device.
    pub command_pacing: Duration,

    /// Longest single readiness wait, `None` meaning no limit.
    pub poll_timeout: Option<Duration>,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            io_buffer_size: config.io_buffer_size,
            command_pacing: config.command_pacing(),
            poll_timeout: config.poll_timeout(),
        }
    }
}

/// Shares one serial device with any number of TCP clients.
///
/// Whatever the serial device sends is copied to every connected client.
/// Complete lines sent by clients are forwarded to the serial device,
/// at most one per pacing interval across all clients.
#[derive(Debug)]
pub struct Bridge {
    selector: Selector,
    relay: RingBuffer,
    command: Vec<u8>,
    pacer: Timer,
    settings: Settings,
}

impl Bridge {
    /// Find the serial port and listen addresses the configuration asks for, then set up.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        config.validate()?;

        let port = serial::find_serial(&config.serial.port)?;
        let serial = Serial::builder(&port.to_string_lossy())
            .set_baud(config.serial.baud)
            .set_char_pacing(config.char_pacing())
            .build()?;

        let addresses = net::listen_addresses(&config.listen.address, config.listen.port)?;

        Self::new(serial, &addresses, config.into())
    }

    /// Set up the serial device and a listener for each address.
    ///
    /// Listeners are bound right away.
    /// Those failing to bind are skipped, but at least one has to work.
    pub fn new(serial: Serial, listen: &[SocketAddr], settings: Settings) -> Result<Self, Error> {
        let mut selector = Selector::new();
        selector.add(Device::serial(serial, settings.io_buffer_size))?;

        let mut listening = 0;
        for address in listen {
            let mut listener = Device::listener(*address, settings.io_buffer_size);
            listener.open();

            if listener.state() == State::Inactive {
                continue;
            }

            info!(address = %listener, "Listening");
            selector.add(listener)?;
            listening += 1;
        }

        if listening == 0 {
            return Err(Error::NoListener(
                listen
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }

        Ok(Self {
            selector,
            relay: RingBuffer::new(settings.io_buffer_size),
            command: Vec::with_capacity(settings.io_buffer_size),
            pacer: Timer::default(),
            settings,
        })
    }

    /// The devices.
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// The devices, mutably.
    pub fn selector_mut(&mut self) -> &mut Selector {
        &mut self.selector
    }

    /// The serial device.
    pub fn serial(&self) -> Result<&Device, Error> {
        self.selector.device(SERIAL_INDEX)
    }

    /// Where clients may connect.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.selector
            .devices()
            .filter(|device| device.is_listener() && device.is_open())
            .filter_map(Device::local_addr)
            .collect()
    }

    /// Also bridge to a TCP server at `peer`, treating it like a client.
    /// The connection is made on the next pass, and made again if it closes.
    pub fn connect(&mut self, peer: SocketAddr) -> Result<DeviceId, Error> {
        self.selector
            .add(Device::connect(peer, self.settings.io_buffer_size))
    }

    // Connections which may send and receive.
    fn clients_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.selector
            .devices_mut()
            .skip(SERIAL_INDEX + 1)
            .filter(|device| !device.is_listener() && device.is_open())
    }

    /// True if some client has a complete command waiting.
    pub fn command_pending(&self) -> bool {
        self.selector
            .devices()
            .skip(SERIAL_INDEX + 1)
            .filter(|device| device.is_open())
            .filter_map(Device::lines)
            .any(|lines| lines.next_line().is_some())
    }

    /// How long the next readiness wait may take.
    /// Shortened while a command waits for the pacing interval to pass.
    pub fn wait_timeout(&self) -> Option<Duration> {
        if !self.command_pending() {
            return self.settings.poll_timeout;
        }

        let due = self.pacer.remaining();

        // Waiting for the serial device to make room, which it reports itself
        let serial_busy = self
            .serial()
            .map(|serial| !serial.tx().is_empty())
            .unwrap_or(false);
        if due.is_zero() && serial_busy {
            return self.settings.poll_timeout;
        }

        Some(self.settings.poll_timeout.map_or(due, |timeout| timeout.min(due)))
    }

    /// Move data between the devices' buffers.
    ///
    /// Serial input goes to every client.
    /// Client input is collected into lines,
    /// and if the pacing interval has passed one line is forwarded to the serial device.
    pub fn tick(&mut self) -> Result<Tick, Error> {
        let serial = self.selector.device_mut(SERIAL_INDEX)?;
        if serial.state() == State::Inactive {
            info!(device = %serial, "Serial device gone");
            return Ok(Tick::Shutdown(ShutdownReason::SerialGone));
        }

        serial.rx_mut().move_to(&mut self.relay, usize::MAX);

        let relay = &self.relay;
        for device in self
            .selector
            .devices_mut()
            .skip(SERIAL_INDEX + 1)
            .filter(|device| !device.is_listener() && device.is_open())
        {
            let copied = relay.copy_to(device.tx_mut(), usize::MAX);
            if copied < relay.used() {
                debug!(%device, dropped = relay.used() - copied, "Client is behind, output dropped");
            }

            device.collect_lines()?;
        }

        if self.pacer.expired() {
            self.forward_command()?;
        }

        self.relay.flush();

        if !self
            .selector
            .devices()
            .any(|device| device.is_listener() && device.state() != State::Inactive)
        {
            warn!("No listeners left");
            return Ok(Tick::Shutdown(ShutdownReason::NoListeners));
        }

        Ok(Tick::Continue)
    }

    // Hand the first complete line of the first client having one to the serial device.
    fn forward_command(&mut self) -> Result<(), Error> {
        let serial = self.selector.device(SERIAL_INDEX)?;
        if !serial.is_open() {
            return Ok(());
        }
        let room = serial.tx().available();
        let idle = serial.tx().is_empty();

        let mut command = std::mem::take(&mut self.command);
        command.clear();

        for device in self.clients_mut() {
            let Some(lines) = device.lines_mut() else {
                continue;
            };
            let Some(line) = lines.next_line() else {
                continue;
            };

            // Wait for room unless nothing could ever make room
            if line.span() > room && !idle {
                trace!(%device, "Serial device busy");
                break;
            }

            command.extend_from_slice(line.raw);
            lines.consume(command.len());
            debug!(%device, command = ?String::from_utf8_lossy(line_text(&command)), "Forwarding command");
            break;
        }

        if !command.is_empty() {
            let serial = self.selector.device_mut(SERIAL_INDEX)?;
            let queued = serial.write(&command)?;
            if queued < command.len() {
                warn!(
                    device = %serial,
                    dropped = command.len() - queued,
                    "Command too long for the serial buffer"
                );
            }
            self.pacer.reset(self.settings.command_pacing);
        }

        self.command = command;

        Ok(())
    }

    /// Wait for and handle device readiness once, then tick.
    pub fn run_once(&mut self) -> Result<Tick, Error> {
        let pass = self.selector.run_once(self.wait_timeout())?;
        let tick = self.tick()?;

        if pass == Pass::Idle && tick == Tick::Continue {
            debug!("Nothing left to wait for");
            return Ok(Tick::Shutdown(ShutdownReason::Idle));
        }

        Ok(tick)
    }
}

fn line_text(command: &[u8]) -> &[u8] {
    command.strip_suffix(b"\n").unwrap_or(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_config() {
        let config = Config {
            io_buffer_size: 64,
            command_pacing_ms: 5,
            poll_timeout_ms: 0,
            ..Default::default()
        };

        assert_eq!(
            Settings::from(&config),
            Settings {
                io_buffer_size: 64,
                command_pacing: Duration::from_millis(5),
                poll_timeout: None,
            }
        );
    }

    #[test]
    fn newline_is_not_part_of_the_command_text() {
        assert_eq!(line_text(b"reset\n"), b"reset");
        assert_eq!(line_text(b"reset"), b"reset");
    }

    #[test]
    fn missing_serial_port() {
        let mut config = Config::default();
        config.serial.port = "/nonexistent/ttyNope*".into();

        assert!(matches!(
            Bridge::from_config(&config),
            Err(Error::NoSerialDevice(_))
        ));
    }
}
