use std::io::{self, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::message::{BridgeEvent, ControlMessage};

/// Encode a binary payload for the wire. Empty input encodes to `""`.
pub fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    STANDARD.encode(data)
}

/// Decode a wire payload. `""` decodes to zero bytes.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD.decode(data)
}

/// Decode one inbound line (without its terminating newline).
///
/// Blank lines, malformed JSON, and well-formed JSON that is not a known
/// control message all yield `None`. The peer never hears about them.
/// Invalid UTF-8 sequences are dropped before parsing.
pub fn decode_line(line: &[u8]) -> Option<ControlMessage> {
    let text: String = line.utf8_chunks().map(|chunk| chunk.valid()).collect();
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            log::debug!("Failed to parse JSON line: {err}");
            return None;
        }
    };

    match serde_json::from_value::<ControlMessage>(value.clone()) {
        Ok(message) => Some(message),
        Err(err) => {
            log::debug!("Unhandled control message {value}: {err}");
            None
        }
    }
}

/// Accumulates raw inbound bytes and hands back complete lines.
///
/// Between calls to [`LineBuffer::push`] at most one partial line is held.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every newline-terminated line it completes.
    ///
    /// Lines are returned in the order their newline arrived, without the
    /// trailing `\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(self.pending[start..end].to_vec());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes of the current incomplete line.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Writes [`BridgeEvent`]s as newline-delimited JSON, flushing each line.
pub struct EventWriter<W: Write> {
    inner: W,
}

impl<W: Write> EventWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn send(&mut self, event: &BridgeEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.inner.write_all(&line)?;
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
