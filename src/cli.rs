use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::{config::Config, error::Error, net};

/// The command line interface for serial bridge.
///
/// Options given here take precedence over the configuration file.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Serial port, `auto` or a `|` separated list of paths which may hold wildcards
    #[arg(short, long)]
    pub port: Option<String>,

    /// Serial line speed
    #[arg(short, long)]
    pub speed: Option<u32>,

    /// Where to listen, as `[host][:port]`
    #[arg(short, long, value_name = "[HOST][:PORT]")]
    pub listen: Option<String>,

    /// Size of each device's buffers in bytes
    #[arg(short, long = "bufsize")]
    pub bufsize: Option<usize>,

    /// Minimum milliseconds between commands sent to the serial port
    #[arg(long, value_name = "MS")]
    pub pacing: Option<u64>,

    /// Longest wait for activity in milliseconds, 0 for no limit
    #[arg(long, value_name = "MS")]
    pub poll: Option<u64>,

    /// Detach from the terminal once running
    #[arg(short = 'D', long = "daemon")]
    pub daemon: bool,

    /// More output, repeat for even more
    #[arg(short, action = ArgAction::Count)]
    pub verbose: u8,

    /// Also log to a daily rotated file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log to stderr instead of stdout
    #[arg(long)]
    pub stderr: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Debug, Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

impl Cli {
    /// Apply the options given on the command line on top of `config`.
    pub fn apply(&self, config: &mut Config) -> Result<(), Error> {
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(speed) = self.speed {
            config.serial.baud = speed;
        }
        if let Some(listen) = &self.listen {
            let (address, port) = net::parse_listen(listen)?;
            if let Some(address) = address {
                config.listen.address = address;
            }
            if let Some(port) = port {
                config.listen.port = port;
            }
        }
        if let Some(bufsize) = self.bufsize {
            config.io_buffer_size = bufsize;
        }
        if let Some(pacing) = self.pacing {
            config.command_pacing_ms = pacing;
        }
        if let Some(poll) = self.poll {
            config.poll_timeout_ms = poll;
        }
        if self.daemon {
            config.daemonize = true;
        }
        if self.verbose > 0 {
            config.log.verbosity = self.verbose;
        }
        if let Some(directory) = &self.log_dir {
            config.log.directory = Some(directory.clone());
        }
        if self.stderr {
            config.log.stderr = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn nothing_given_changes_nothing() {
        let cli = Cli::parse_from(["serial-bridge"]);
        let mut config = Config::example();
        cli.apply(&mut config).unwrap();

        assert_eq!(config, Config::example());
    }

    #[test]
    fn options_override_config() {
        let cli = Cli::parse_from([
            "serial-bridge",
            "bridge.ron",
            "-p",
            "ttyUSB*",
            "-s",
            "9600",
            "-l",
            "[::1]:9000",
            "-b",
            "512",
            "--pacing",
            "10",
            "--poll",
            "0",
            "-D",
            "-vvv",
            "--stderr",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("bridge.ron")));

        let mut config = Config::default();
        cli.apply(&mut config).unwrap();

        assert_eq!(config.serial.port, "ttyUSB*");
        assert_eq!(config.serial.baud, 9600);
        assert_eq!(config.listen.address, "::1");
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.io_buffer_size, 512);
        assert_eq!(config.command_pacing_ms, 10);
        assert_eq!(config.poll_timeout(), None);
        assert!(config.daemonize);
        assert_eq!(config.log.verbosity, 3);
        assert!(config.log.stderr);
    }

    #[test]
    fn listen_port_only() {
        let cli = Cli::parse_from(["serial-bridge", "--listen", ":7000"]);
        let mut config = Config::default();
        cli.apply(&mut config).unwrap();

        assert_eq!(config.listen, {
            let mut listen = Config::default().listen;
            listen.port = 7000;
            listen
        });
    }

    #[test]
    fn bad_listen() {
        let cli = Cli::parse_from(["serial-bridge", "--listen", "host:port"]);
        let mut config = Config::default();

        assert!(cli.apply(&mut config).is_err());
    }

    #[test]
    fn example_subcommand() {
        let cli = Cli::parse_from(["serial-bridge", "examples", "config"]);

        assert!(matches!(
            cli.command,
            Some(Commands::Examples(Examples::Config))
        ));
    }
}
