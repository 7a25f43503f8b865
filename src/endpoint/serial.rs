use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsRawFd, RawFd},
    },
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use nix::{
    fcntl::OFlag,
    sys::termios::{
        self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios,
    },
    unistd::{access, AccessFlags},
};
use tracing::{debug, trace};

use crate::{collections::RingBuffer, device::State, error::Error, timer::Timer};

use super::{not_connected, Endpoint, Setting, Stream};

/// Minimum time between two characters written to a serial port, unless configured otherwise.
pub const CHARACTER_PACING: Duration = Duration::from_micros(5000);

/// Line speed used when none is given.
pub const DEFAULT_BAUD: u32 = 115_200;

/// What the port specification `auto` stands for.
pub const AUTO_PORTS: &str = "/dev/ttyACM*";

const BAUD_TABLE: &[(u32, BaudRate)] = &[
    (300, BaudRate::B300),
    (1200, BaudRate::B1200),
    (2400, BaudRate::B2400),
    (4800, BaudRate::B4800),
    (9600, BaudRate::B9600),
    (19200, BaudRate::B19200),
    (38400, BaudRate::B38400),
    (57600, BaudRate::B57600),
    (115_200, BaudRate::B115200),
    (230_400, BaudRate::B230400),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    (460_800, BaudRate::B460800),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    (576_000, BaudRate::B576000),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    (921_600, BaudRate::B921600),
];

/// Look up the terminal baud rate constant for a speed in bits per second.
pub fn speed_to_baud(speed: u32) -> Result<BaudRate, Error> {
    BAUD_TABLE
        .iter()
        .find(|(known, _)| *known == speed)
        .map(|(_, baud)| *baud)
        .ok_or(Error::InvalidBaudRate(speed))
}

/// Look up the speed in bits per second for a terminal baud rate constant.
pub fn baud_to_speed(baud: BaudRate) -> Option<u32> {
    BAUD_TABLE
        .iter()
        .find(|(_, known)| *known == baud)
        .map(|(speed, _)| *speed)
}

/// Every supported speed, slowest first.
pub fn supported_speeds() -> impl Iterator<Item = u32> {
    BAUD_TABLE.iter().map(|(speed, _)| *speed)
}

nix::ioctl_none_bad!(
    /// Turn off break, i.e. stop sending zero bits.
    clear_break,
    nix::libc::TIOCCBRK
);

/// Builder for a [`Serial`] device.
#[derive(Debug, Default)]
pub struct SerialBuilder {
    path: String,
    baud: Option<u32>,
    char_pacing: Option<Duration>,
}

impl SerialBuilder {
    /// Start a new builder.
    /// The path is likely along the lines of `/dev/ttyACMx`.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Set the line speed.
    /// Will use [`DEFAULT_BAUD`] if not set.
    pub fn set_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Set the time to wait between characters.
    /// Will use [`CHARACTER_PACING`] if not set.
    pub fn set_char_pacing(mut self, pacing: Duration) -> Self {
        self.char_pacing = Some(pacing);
        self
    }

    /// Check the settings and create the (not yet opened) device.
    pub fn build(self) -> Result<Serial, Error> {
        let speed = self.baud.unwrap_or(DEFAULT_BAUD);

        Ok(Serial {
            baud: speed_to_baud(speed)?,
            speed,
            path: self.path,
            char_pacing: self.char_pacing.unwrap_or(CHARACTER_PACING),
            pacer: Timer::default(),
            port: None,
        })
    }
}

/// A serial port in raw mode.
///
/// Output is written one character at a time,
/// with a pause between characters for devices which cannot take bursts.
#[derive(Debug)]
pub struct Serial {
    path: String,
    baud: BaudRate,
    speed: u32,
    char_pacing: Duration,
    pacer: Timer,
    port: Option<File>,
}

impl Serial {
    /// Start building a serial device for the given path.
    pub fn builder(path: &str) -> SerialBuilder {
        SerialBuilder::new(path)
    }

    /// Path of the port.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Line speed in bits per second.
    pub fn speed(&self) -> u32 {
        self.speed
    }

    /// Time between characters.
    pub fn char_pacing(&self) -> Duration {
        self.char_pacing
    }

    fn apply_termios(&self, fd: RawFd) -> Result<(), Error> {
        let context = || format!("Setting up serial port `{}`", self.path);

        let mut settings = termios::tcgetattr(fd).map_err(|e| Error::os(context(), e))?;
        raw_mode(&mut settings, self.baud).map_err(|e| Error::os(context(), e))?;
        termios::tcsetattr(fd, SetArg::TCSANOW, &settings).map_err(|e| Error::os(context(), e))
    }
}

fn raw_mode(settings: &mut Termios, baud: BaudRate) -> nix::Result<()> {
    termios::cfmakeraw(settings);

    settings.local_flags.remove(
        LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ECHOE
            | LocalFlags::ECHOK
            | LocalFlags::ICANON
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN,
    );
    settings.input_flags.remove(
        InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXOFF
            | InputFlags::IXANY,
    );
    settings.input_flags.insert(InputFlags::IGNBRK);

    // 8N1, no flow control
    settings.control_flags.remove(
        ControlFlags::CSTOPB
            | ControlFlags::CSIZE
            | ControlFlags::PARENB
            | ControlFlags::HUPCL
            | ControlFlags::CRTSCTS,
    );
    settings
        .control_flags
        .insert(ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL);
    settings.output_flags.remove(OutputFlags::OPOST);

    termios::cfsetospeed(settings, baud)?;
    termios::cfsetispeed(settings, baud)
}

impl Endpoint for Serial {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn fd(&self) -> Option<RawFd> {
        self.port.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn open(&mut self) -> Result<State, Error> {
        self.release();

        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NONBLOCK | OFlag::O_NOCTTY).bits())
            .open(&self.path)
            .map_err(|e| Error::io(format!("Opening serial port `{}`", self.path), e))?;

        let fd = port.as_raw_fd();
        self.apply_termios(fd)?;

        // SAFETY: The descriptor belongs to `port`, which is alive.
        // A failure only means there was no break condition to clear.
        let _ = unsafe { clear_break(fd) };

        debug!(path = %self.path, speed = self.speed, "Serial port open");
        self.pacer.reset(Duration::ZERO);
        self.port = Some(port);

        Ok(State::Connected)
    }

    fn release(&mut self) {
        if self.port.take().is_some() {
            debug!(path = %self.path, "Serial port closed");
        }
    }

    fn configure(&mut self, setting: Setting) -> Result<(), Error> {
        match setting {
            Setting::Baud(speed) => {
                self.baud = speed_to_baud(speed)?;
                self.speed = speed;

                if let Some(fd) = self.fd() {
                    self.apply_termios(fd)?;
                }
                Ok(())
            }
            Setting::CharPacing(pacing) => {
                self.char_pacing = pacing;
                Ok(())
            }
            other => Err(Error::InvalidConfiguration(format!(
                "{other:?} is not supported by serial devices"
            ))),
        }
    }

    fn send_ok(&self) -> bool {
        self.pacer.expired()
    }

    fn deadline(&self) -> Option<Instant> {
        self.pacer.deadline()
    }

    fn stream(&mut self) -> Option<&mut dyn Stream> {
        self.port.as_mut().map(|port| port as &mut dyn Stream)
    }

    fn write_from(&mut self, tx: &mut RingBuffer) -> io::Result<usize> {
        if tx.is_empty() || !self.pacer.expired() {
            return Ok(0);
        }

        let port = self.port.as_mut().ok_or_else(not_connected)?;

        let mut byte = [0];
        tx.peek(&mut byte);
        let written = port.write(&byte)?;
        trace!(byte = byte[0], "Serial out");

        self.pacer.reset(self.char_pacing);
        Ok(tx.skip(written))
    }
}

/// Expand a port specification into candidate device paths.
///
/// The specification is a `|` separated list.
/// Entries not starting with `/` are taken to be under `/dev/`.
/// The last path component of an entry may contain the wildcards `*`, `?` and `[...]`,
/// which are matched against the directory's entries (sorted by name).
/// `auto` stands for [`AUTO_PORTS`].
pub fn find_serial_all(spec: &str) -> Vec<PathBuf> {
    let spec = if spec.trim() == "auto" {
        AUTO_PORTS
    } else {
        spec
    };

    spec.split('|')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .flat_map(|entry| {
            let entry = if entry.starts_with('/') {
                entry.to_string()
            } else {
                format!("/dev/{entry}")
            };
            expand(Path::new(&entry))
        })
        .collect()
}

/// The first port matching the specification which we may read and write.
pub fn find_serial(spec: &str) -> Result<PathBuf, Error> {
    find_serial_all(spec)
        .into_iter()
        .find(|path| {
            let accessible = access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok();
            trace!(path = %path.display(), accessible, "Serial candidate");
            accessible
        })
        .ok_or_else(|| Error::NoSerialDevice(spec.to_string()))
}

fn expand(entry: &Path) -> Vec<PathBuf> {
    let (Some(directory), Some(pattern)) = (entry.parent(), entry.file_name()) else {
        return vec![entry.to_path_buf()];
    };

    let pattern = pattern.to_string_lossy();
    if !pattern.contains(|c| matches!(c, '*' | '?' | '[')) {
        return vec![entry.to_path_buf()];
    }

    let Ok(entries) = fs::read_dir(directory) else {
        return vec![];
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|dir_entry| {
            wildcard_match(
                pattern.as_bytes(),
                dir_entry.file_name().to_string_lossy().as_bytes(),
            )
        })
        .map(|dir_entry| dir_entry.path())
        .collect();
    found.sort();

    found
}

/// Shell style matching of a single name against a pattern with `*`, `?` and `[...]`.
pub fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => (0..=name.len()).any(|skip| wildcard_match(rest, &name[skip..])),
        Some((b'?', rest)) => !name.is_empty() && wildcard_match(rest, &name[1..]),
        Some((b'[', rest)) => match (class_end(rest), name.split_first()) {
            (Some(end), Some((byte, name_rest))) => {
                class_matches(&rest[..end], *byte) && wildcard_match(&rest[end + 1..], name_rest)
            }
            (Some(_), None) => false,
            // Unterminated, so not a class
            (None, _) => name.first() == Some(&b'[') && wildcard_match(rest, &name[1..]),
        },
        Some((literal, rest)) => {
            name.first() == Some(literal) && wildcard_match(rest, &name[1..])
        }
    }
}

// Index of the closing `]`, a `]` right after the opening (or negation) is a member.
fn class_end(class: &[u8]) -> Option<usize> {
    let start = usize::from(matches!(class.first(), Some(b'!' | b'^'))) + 1;

    class
        .iter()
        .skip(start)
        .position(|byte| *byte == b']')
        .map(|position| position + start)
}

fn class_matches(class: &[u8], byte: u8) -> bool {
    let (negated, members) = match class.split_first() {
        Some((b'!' | b'^', members)) => (true, members),
        _ => (false, class),
    };

    let mut found = false;
    let mut i = 0;
    while i < members.len() {
        if i + 2 < members.len() && members[i + 1] == b'-' {
            found |= (members[i]..=members[i + 2]).contains(&byte);
            i += 3;
        } else {
            found |= members[i] == byte;
            i += 1;
        }
    }

    found != negated
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn baud_table_goes_both_ways() {
        assert_eq!(speed_to_baud(9600).unwrap(), BaudRate::B9600);
        assert_eq!(baud_to_speed(BaudRate::B115200), Some(115_200));

        assert!(matches!(
            speed_to_baud(12345),
            Err(Error::InvalidBaudRate(12345))
        ));

        for speed in supported_speeds() {
            assert_eq!(baud_to_speed(speed_to_baud(speed).unwrap()), Some(speed));
        }
    }

    #[test]
    fn builder_rejects_unknown_speed() {
        assert!(Serial::builder("/dev/null").set_baud(1234).build().is_err());

        let serial = Serial::builder("/dev/null").build().unwrap();
        assert_eq!(serial.speed(), DEFAULT_BAUD);
        assert_eq!(serial.char_pacing(), CHARACTER_PACING);
        assert!(serial.fd().is_none());
    }

    #[test]
    fn configure_checks_settings() {
        let mut serial = Serial::builder("/dev/null").build().unwrap();

        serial.configure(Setting::Baud(9600)).unwrap();
        assert_eq!(serial.speed(), 9600);
        assert!(serial.configure(Setting::Baud(9601)).is_err());
        assert_eq!(serial.speed(), 9600);

        serial
            .configure(Setting::CharPacing(Duration::ZERO))
            .unwrap();
        assert_eq!(serial.char_pacing(), Duration::ZERO);

        assert!(matches!(
            serial.configure(Setting::NoDelay(true)),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match(b"ttyACM*", b"ttyACM0"));
        assert!(wildcard_match(b"ttyACM*", b"ttyACM"));
        assert!(!wildcard_match(b"ttyACM*", b"ttyUSB0"));

        assert!(wildcard_match(b"tty?0", b"ttyS0"));
        assert!(!wildcard_match(b"tty?0", b"tty0"));

        assert!(wildcard_match(b"ttyUSB[0-3]", b"ttyUSB2"));
        assert!(!wildcard_match(b"ttyUSB[0-3]", b"ttyUSB7"));
        assert!(wildcard_match(b"ttyUSB[!0-3]", b"ttyUSB7"));
        assert!(wildcard_match(b"x[]]", b"x]"));

        // An unterminated class is literal
        assert!(wildcard_match(b"x[", b"x["));

        assert!(wildcard_match(b"*a*b*", b"xxaxxbxx"));
        assert!(!wildcard_match(b"*a*b*", b"xxbxxaxx"));
    }

    #[test]
    fn relative_entries_live_in_dev() {
        assert_eq!(
            find_serial_all("ttyS0|/tmp/port"),
            vec![PathBuf::from("/dev/ttyS0"), PathBuf::from("/tmp/port")]
        );
    }

    #[test]
    fn globs_are_expanded_sorted() {
        let directory = env::temp_dir().join(format!("serial-bridge-glob-{}", std::process::id()));
        fs::create_dir_all(&directory).unwrap();

        for name in ["ttyFAKE2", "ttyFAKE0", "ttyFAKE1", "other"] {
            File::create(directory.join(name)).unwrap();
        }

        let spec = format!("{}/ttyFAKE*", directory.display());
        let found = find_serial_all(&spec);
        assert_eq!(
            found,
            vec![
                directory.join("ttyFAKE0"),
                directory.join("ttyFAKE1"),
                directory.join("ttyFAKE2"),
            ]
        );

        assert_eq!(find_serial(&spec).unwrap(), directory.join("ttyFAKE0"));

        let missing = format!("{}/ttyNOPE*", directory.display());
        assert!(matches!(
            find_serial(&missing),
            Err(Error::NoSerialDevice(_))
        ));

        fs::remove_dir_all(&directory).unwrap();
    }
}
