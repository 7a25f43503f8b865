use tracing::{debug, error, info, info_span, warn};

use crate::{
    bridge::{Bridge, Tick},
    config::Config,
    error::Error,
    signals::Request,
};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The bridge stopped by itself.
    Stopped,

    /// No serial device could be found.
    NoSerialDevice,

    /// Not a single listener could be set up.
    NoListener,

    /// A quit signal arrived.
    Quit,
}

impl Exit {
    /// The process exit status.
    pub fn code(self) -> i32 {
        match self {
            Exit::Stopped => 0,
            Exit::NoSerialDevice | Exit::NoListener => 2,
            Exit::Quit => 3,
        }
    }
}

fn summary(config: &Config, bridge: &Bridge) {
    let serial = bridge
        .serial()
        .map(ToString::to_string)
        .unwrap_or_default();

    debug!(
        device = %serial,
        baud = config.serial.baud,
        listen = ?bridge.local_addrs(),
        daemonize = config.daemonize,
        verbosity = config.log.verbosity,
        "Setup"
    );
}

fn daemonize() {
    match nix::unistd::daemon(true, true) {
        Ok(()) => info!(pid = std::process::id(), "Running in the background"),
        Err(e) => warn!(error = %e, "Could not detach, staying in the foreground"),
    }
}

/// Run the bridge until it stops or is told to.
///
/// `requests` is asked for a pending reload or quit once per pass.
/// A reload tears everything down and sets up again from `config`.
///
/// Failing to find the serial device or to listen is reported as an [`Exit`],
/// anything else unexpected as an error.
pub fn run<F>(config: &Config, mut requests: F) -> Result<Exit, Error>
where
    F: FnMut() -> Option<Request>,
{
    let mut daemonize_pending = config.daemonize;

    'setup: loop {
        let mut bridge = match Bridge::from_config(config) {
            Ok(bridge) => bridge,
            Err(Error::NoSerialDevice(spec)) => {
                error!(%spec, "No usable serial device");
                return Ok(Exit::NoSerialDevice);
            }
            Err(Error::NoListener(address)) => {
                error!(%address, "Nowhere to listen");
                return Ok(Exit::NoListener);
            }
            Err(e) => return Err(e),
        };

        summary(config, &bridge);

        if daemonize_pending {
            daemonize();
            daemonize_pending = false;
        }

        let _span = info_span!("bridge").entered();

        loop {
            match bridge.run_once() {
                Ok(Tick::Continue) => {}
                Ok(Tick::Shutdown(reason)) => {
                    info!(?reason, "Bridge stopped");
                    return Ok(Exit::Stopped);
                }
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    error!(error = %e, "Bridge failed");
                    return Err(e);
                }
            }

            match requests() {
                Some(Request::Reload) => {
                    info!("Reloading");
                    continue 'setup;
                }
                Some(Request::Quit) => {
                    info!("Quitting");
                    return Ok(Exit::Quit);
                }
                None => {}
            }
        }
    }
}
