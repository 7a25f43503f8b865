use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    endpoint::serial::{self, CHARACTER_PACING, DEFAULT_BAUD},
    error::Error,
    net::{DEFAULT_LISTEN_ADDRESS, DEFAULT_LISTEN_PORT},
};

/// Buffer size used for every data device unless configured.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 4096;

/// Smallest buffer size accepted.
pub const MIN_IO_BUFFER_SIZE: usize = 16;

/// Default minimum time between commands forwarded to the serial device.
pub const DEFAULT_COMMAND_PACING: Duration = Duration::from_millis(250);

/// Default longest single wait for device readiness.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// The serial side of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Which device to use.
    ///
    /// Either `auto`, or a `|` separated list of paths.
    /// Paths not starting with `/` are looked for in `/dev`.
    /// The last component of a path may hold the wildcards `*`, `?` and `[...]`.
    /// The first match which can be read and written is used.
    pub port: String,

    /// Line speed, see [`serial::supported_speeds`].
    pub baud: u32,

    /// Microseconds to wait between each character written.
    pub char_pacing_us: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "auto".into(),
            baud: DEFAULT_BAUD,
            char_pacing_us: u64::try_from(CHARACTER_PACING.as_micros()).unwrap_or(5000),
        }
    }
}

/// The network side of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Host name or IP address to listen on.
    /// `*` or `any` means every interface.
    pub address: String,

    /// The TCP port. Zero picks any free port.
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_LISTEN_ADDRESS.into(),
            port: DEFAULT_LISTEN_PORT,
        }
    }
}

/// Where log output goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Zero logs warnings and errors, one adds info, two debug, three or more trace.
    pub verbosity: u8,

    /// Also log to a daily rotated file in this directory.
    pub directory: Option<PathBuf>,

    /// Log to stderr instead of stdout.
    pub stderr: bool,
}

/// The configuration used for running the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// See [`SerialConfig`].
    pub serial: SerialConfig,

    /// See [`ListenConfig`].
    pub listen: ListenConfig,

    /// Capacity of the receive and transmit buffer of every device.
    pub io_buffer_size: usize,

    /// Minimum milliseconds between two commands forwarded to the serial device.
    pub command_pacing_ms: u64,

    /// Longest single wait for device readiness in milliseconds.
    /// Zero waits until something happens.
    pub poll_timeout_ms: u64,

    /// Detach from the terminal once set up.
    pub daemonize: bool,

    /// See [`LogConfig`].
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            listen: ListenConfig::default(),
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
            command_pacing_ms: u64::try_from(DEFAULT_COMMAND_PACING.as_millis()).unwrap_or(250),
            poll_timeout_ms: u64::try_from(DEFAULT_POLL_TIMEOUT.as_millis()).unwrap_or(100),
            daemonize: false,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Fields left out keep their defaults.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::InvalidConfiguration(format!("Not a valid configuration: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            serial: SerialConfig {
                port: "ttyACM0|ttyUSB*".into(),
                baud: 921_600,
                ..Default::default()
            },
            listen: ListenConfig {
                address: "*".into(),
                port: DEFAULT_LISTEN_PORT,
            },
            log: LogConfig {
                verbosity: 1,
                directory: Some("/var/log/serial-bridge".into()),
                stderr: false,
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::InvalidConfiguration(format!("Could not serialize: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("Reading configuration {}", path.display()), e))?;

        Self::deserialize(&s)
    }

    /// Per-character pacing on the serial line.
    pub fn char_pacing(&self) -> Duration {
        Duration::from_micros(self.serial.char_pacing_us)
    }

    /// Minimum time between forwarded commands.
    pub fn command_pacing(&self) -> Duration {
        Duration::from_millis(self.command_pacing_ms)
    }

    /// Longest single readiness wait, `None` meaning no limit.
    pub fn poll_timeout(&self) -> Option<Duration> {
        (self.poll_timeout_ms > 0).then(|| Duration::from_millis(self.poll_timeout_ms))
    }

    fn check_buffer_size(&self) -> Result<(), Error> {
        if self.io_buffer_size < MIN_IO_BUFFER_SIZE {
            return Err(Error::InvalidConfiguration(format!(
                "The I/O buffer size must be at least {MIN_IO_BUFFER_SIZE} bytes, got {}",
                self.io_buffer_size
            )));
        }

        Ok(())
    }

    fn check_baud(&self) -> Result<(), Error> {
        serial::speed_to_baud(self.serial.baud)?;

        Ok(())
    }

    fn check_port(&self) -> Result<(), Error> {
        if self
            .serial
            .port
            .split('|')
            .all(|candidate| candidate.trim().is_empty())
        {
            return Err(Error::InvalidConfiguration(
                "No serial port given, use `auto` to search for one".into(),
            ));
        }

        Ok(())
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_buffer_size()?;
        self.check_baud()?;
        self.check_port()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();
        let serialized = c.serialize_pretty().unwrap();
        println!("{serialized}");

        assert_eq!(Config::deserialize(&serialized).unwrap(), c);
    }

    #[test]
    fn deserialize() {
        let input = r#"
(
    serial: (
        port: "/dev/ttyUSB0",
        baud: 9600,
    ),
    listen: (
        port: 9000,
    ),
    command_pacing_ms: 0,
    log: (
        verbosity: 2,
        directory: "/tmp",
    ),
)"#;
        let c = Config::deserialize(input).unwrap();

        assert_eq!(c.serial.port, "/dev/ttyUSB0");
        assert_eq!(c.serial.baud, 9600);
        assert_eq!(c.char_pacing(), CHARACTER_PACING);
        assert_eq!(c.listen.address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(c.listen.port, 9000);
        assert_eq!(c.io_buffer_size, DEFAULT_IO_BUFFER_SIZE);
        assert_eq!(c.command_pacing(), Duration::ZERO);
        assert_eq!(c.poll_timeout(), Some(DEFAULT_POLL_TIMEOUT));
        assert_eq!(c.log.directory, Some(PathBuf::from("/tmp")));

        c.validate().unwrap();
    }

    #[test]
    fn empty_is_default() {
        assert_eq!(Config::deserialize("()").unwrap(), Config::default());
    }

    #[test]
    fn zero_poll_timeout_waits_forever() {
        let c = Config {
            poll_timeout_ms: 0,
            ..Default::default()
        };

        assert_eq!(c.poll_timeout(), None);
    }

    #[test]
    fn not_ron() {
        let problem = Config::deserialize("serial: {}")
            .unwrap_err()
            .try_into_bad_config()
            .unwrap();

        assert!(problem.contains("Not a valid configuration"));
    }

    #[test]
    fn bad_config_buffer_size() {
        let c = Config {
            io_buffer_size: 1,
            ..Default::default()
        };

        let problem = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(problem.contains("buffer size"));
    }

    #[test]
    fn bad_config_baud() {
        let mut c = Config::default();
        c.serial.baud = 12345;

        assert!(matches!(c.validate(), Err(Error::InvalidBaudRate(12345))));
    }

    #[test]
    fn bad_config_port() {
        let mut c = Config::default();
        c.serial.port = " | ".into();

        let problem = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(problem.contains("auto"));
    }
}
