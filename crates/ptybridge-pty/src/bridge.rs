use std::fs::File;
use std::io::Write;

use ptybridge_proto::{BridgeEvent, EventWriter};

use crate::child::{ChildCommand, TerminationState};
use crate::config::{BridgeConfig, ConfigError};
use crate::multiplexer::Multiplexer;
use crate::pty::PtyError;
use crate::session::TerminalSession;

/// Errors that end a bridge run.
#[derive(Debug)]
pub enum BridgeError {
    Config(ConfigError),
    Pty(PtyError),
    /// The controller's inbound or outbound stream failed.
    Io(std::io::Error),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Config(err) => write!(f, "invalid configuration: {err}"),
            BridgeError::Pty(err) => write!(f, "{err}"),
            BridgeError::Io(err) => write!(f, "controller stream error: {err}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Config(err) => Some(err),
            BridgeError::Pty(err) => Some(err),
            BridgeError::Io(err) => Some(err),
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Config(err)
    }
}

impl From<PtyError> for BridgeError {
    fn from(err: PtyError) -> Self {
        BridgeError::Pty(err)
    }
}

/// Run one session: spawn the configured command on a new PTY and bridge it
/// to the controller until the child is gone.
///
/// Returns `Ok(None)` when no terminal could be allocated; the controller has
/// already been told through an `error` event. A fork failure is reported the
/// same way and then returned as an error.
pub fn run<W: Write>(
    config: &BridgeConfig,
    inbound: File,
    outbound: W,
) -> Result<Option<TerminationState>, BridgeError> {
    let command = ChildCommand::new(&config.command, config.cwd.as_deref())?;
    let mut events = EventWriter::new(outbound);

    let session = match TerminalSession::start(&command, config.size) {
        Ok(session) => session,
        Err(err @ PtyError::Allocation(_)) => {
            events
                .send(&BridgeEvent::error(err.to_string(), "openpty_failed"))
                .map_err(BridgeError::Io)?;
            return Ok(None);
        }
        Err(err) => {
            events
                .send(&BridgeEvent::error(err.to_string(), "fork_failed"))
                .map_err(BridgeError::Io)?;
            return Err(err.into());
        }
    };

    Multiplexer::new(session, inbound, events).run().map(Some)
}
