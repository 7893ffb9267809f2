//! Out-of-band control messages carried in text frames.

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CALL_ENDED: &str = "call-ended";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// The call has finished on the far end
    CallEnded,

    /// Valid JSON we do not act on. Holds the `type` field if there was one.
    Other(Option<String>),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Parses a text frame. Anything that is not a JSON object is an error.
pub fn parse(text: &str) -> Result<ControlMessage> {
    let envelope: Envelope =
        serde_json::from_str(text).context("Control frame is not a JSON object")?;

    Ok(match envelope.kind.as_deref() {
        Some(CALL_ENDED) => ControlMessage::CallEnded,
        _ => ControlMessage::Other(envelope.kind),
    })
}
