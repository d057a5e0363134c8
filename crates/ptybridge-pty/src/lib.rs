//! ptybridge-pty: runs one command on a pseudo-terminal and bridges it to a
//! controlling process over the line protocol from `ptybridge-proto`.
//!
//! # Architecture
//!
//! - [`pty`]: Terminal allocation and window geometry.
//! - [`child`]: Fork/exec onto the terminal, signal delivery, and reaping.
//! - [`TerminalSession`]: The child paired with the controlling side of its terminal.
//! - [`Multiplexer`]: The single-threaded poll loop that routes terminal output
//!   out and control messages in.
//! - [`bridge::run`]: Entry point: spawn, announce, loop, report exit.

pub mod bridge;
pub mod child;
pub mod config;
pub mod multiplexer;
pub mod pty;
pub mod session;

pub use bridge::{run, BridgeError};
pub use child::{ChildCommand, ChildProcess, TerminationState};
pub use config::{BridgeConfig, ConfigError};
pub use multiplexer::{LoopState, Multiplexer};
pub use pty::{PtyError, PtyPair, WindowSize};
pub use session::{ReadOutcome, TerminalSession};
