//! Process signals of the `mpdhub` binary.
//!
//! * Ctrl-C and SIGTERM stop the daemon
//! * SIGHUP refetches every resource, as if the server had reconnected
//!
//! Only Ctrl-C is available outside Unix.

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the process was asked to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Request {
    /// Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP
    Refresh,
}

impl Request {
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        matches!(self, Request::Interrupt | Request::Terminate)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Interrupt => write!(f, "Ctrl+C"),
            Request::Terminate => write!(f, "SIGTERM"),
            Request::Refresh => write!(f, "SIGHUP"),
        }
    }
}

/// Registered signal streams.
pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sighup: Signal,
}

impl Handler {
    /// Registers the handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> Request {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Request::Interrupt,
                _ = self.sigterm.recv() => Request::Terminate,
                _ = self.sighup.recv() => Request::Refresh,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            Request::Interrupt
        }
    }
}
