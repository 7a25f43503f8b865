use std::sync::atomic::{AtomicI32, Ordering};

use nix::{
    libc,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
};
use tracing::{debug, warn};

use crate::error::Error;

/// Exit status when interrupted a second time before the first was handled.
pub const QUICK_EXIT: i32 = 31;

// The last signal caught and not yet taken, zero if none.
static PENDING: AtomicI32 = AtomicI32::new(0);

const HANDLED: [Signal; 3] = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM];

extern "C" fn on_signal(signal: libc::c_int) {
    if signal == libc::SIGINT && PENDING.load(Ordering::SeqCst) == libc::SIGINT {
        // SAFETY: `_exit` is async-signal-safe.
        unsafe { libc::_exit(QUICK_EXIT) };
    }

    PENDING.store(signal, Ordering::SeqCst);
}

/// What a caught signal asks of us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Set up again from scratch (SIGHUP).
    Reload,

    /// Stop (SIGINT, SIGTERM).
    Quit,
}

impl Request {
    fn from_signal(signal: libc::c_int) -> Option<Self> {
        match signal {
            libc::SIGHUP => Some(Self::Reload),
            libc::SIGINT | libc::SIGTERM => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Catches reload and quit signals for as long as it lives.
///
/// The handlers only note which signal arrived.
/// They do not restart interrupted system calls,
/// so a wait for device readiness returns early and the loop gets to [`Signals::take`] it.
#[derive(Debug)]
pub struct Signals {
    previous: Vec<(Signal, SigAction)>,
}

impl Signals {
    /// Install the handlers.
    pub fn install() -> Result<Self, Error> {
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );

        PENDING.store(0, Ordering::SeqCst);

        let mut previous = Vec::with_capacity(HANDLED.len());
        for signal in HANDLED {
            // SAFETY: The handler only touches an atomic and calls `_exit`.
            let old = unsafe { signal::sigaction(signal, &action) }
                .map_err(|e| Error::os(format!("Installing handler for {signal}"), e))?;
            previous.push((signal, old));
        }
        debug!("Signal handlers installed");

        Ok(Self { previous })
    }

    /// Take the pending request, if any.
    pub fn take(&self) -> Option<Request> {
        Request::from_signal(PENDING.swap(0, Ordering::SeqCst))
    }

    /// True if a signal is waiting to be taken.
    pub fn pending(&self) -> bool {
        PENDING.load(Ordering::SeqCst) != 0
    }
}

impl Drop for Signals {
    fn drop(&mut self) {
        for (signal, old) in self.previous.drain(..).rev() {
            // SAFETY: Restoring what was installed before.
            if let Err(e) = unsafe { signal::sigaction(signal, &old) } {
                warn!(%signal, error = %e, "Could not restore signal handler");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_map_to_requests() {
        assert_eq!(Request::from_signal(libc::SIGHUP), Some(Request::Reload));
        assert_eq!(Request::from_signal(libc::SIGINT), Some(Request::Quit));
        assert_eq!(Request::from_signal(libc::SIGTERM), Some(Request::Quit));
        assert_eq!(Request::from_signal(0), None);
    }

    #[test]
    fn caught_signal_is_taken_once() {
        let signals = Signals::install().unwrap();
        assert!(!signals.pending());

        signal::raise(Signal::SIGHUP).unwrap();

        assert!(signals.pending());
        assert_eq!(signals.take(), Some(Request::Reload));
        assert_eq!(signals.take(), None);
    }
}
