//! Process signal setup for the server binary
//!
//! SIGPIPE is ignored so that writing to a vanished peer surfaces as an
//! `EPIPE` error on that one connection. SIGINT/SIGTERM are delivered to an
//! [`InterruptListener`]; the binary blocks on it and then runs the orderly
//! shutdown itself.

use log::{debug, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io::Error;

use crate::error::Result;

/// Ignore SIGPIPE for the whole process.
pub fn ignore_sigpipe() {
    let rc = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if rc == libc::SIG_ERR {
        warn!("Unable to ignore SIGPIPE: {}", Error::last_os_error());
    }
}

/// Receives SIGINT and SIGTERM once installed
pub struct InterruptListener {
    signals: Signals,
}

impl InterruptListener {
    pub fn install() -> Result<Self> {
        let signals = Signals::new([SIGINT, SIGTERM])?;
        debug!("Interrupt handlers installed");
        Ok(Self { signals })
    }

    /// Closing the handle wakes a pending `wait` with `None`.
    pub fn handle(&self) -> Handle {
        self.signals.handle()
    }

    /// Block until SIGINT or SIGTERM arrives and return it.
    pub fn wait(&mut self) -> Option<i32> {
        self.signals.forever().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_returns_raised_signal_until_closed() {
        let mut listener = InterruptListener::install().unwrap();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert_eq!(listener.wait(), Some(SIGTERM));

        listener.handle().close();
        assert_eq!(listener.wait(), None);
    }
}
