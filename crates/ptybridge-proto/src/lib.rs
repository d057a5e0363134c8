//! ptybridge-proto: the line protocol spoken between the bridge and its controller.
//!
//! One JSON object per line in each direction. Binary payloads travel as
//! standard base64 strings.
//!
//! - [`ControlMessage`] — inbound commands (`input`, `resize`, `terminate`, `ping`).
//! - [`BridgeEvent`] — outbound events (`ready`, `output`, `pong`, `error`, `exit`).
//! - [`LineBuffer`] — reassembles inbound lines across reads.
//! - [`EventWriter`] — writes and flushes one event per line.

pub mod codec;
pub mod message;

pub use codec::{decode_line, decode_payload, encode_payload, EventWriter, LineBuffer};
pub use message::{BridgeEvent, ControlMessage, SignalSpec};
