//! Conversation state carried inside a comment body.
//!
//! The state is a small JSON object with a mandatory `v` field, base64 encoded
//! (URL-safe, unpadded) and wrapped in an HTML comment so it stays invisible in
//! the rendered thread. Decoding is tolerant: anything that doesn't parse is
//! "no state", never an error.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const STATE_VERSION: u32 = 1;

/// Largest serialized payload (in bytes) that will be embedded.
pub const MAX_STATE_BYTES: usize = 2048;

pub const STATE_START_MARKER: &str = "<!-- prbot-state:";
pub const STATE_END_MARKER: &str = " -->";

#[derive(Debug, Error)]
pub enum StateCodecError {
    #[error("state payload is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Versioned key-value record, one per thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub v: u32,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            v: STATE_VERSION,
            fields: Map::new(),
        }
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        // `v` lives in its own field; a duplicate key would serialize twice.
        if key != "v" {
            self.fields.insert(key.to_string(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }
}

/// Encode state into an embeddable token.
///
/// Payloads over [`MAX_STATE_BYTES`] are rejected without producing output.
pub fn encode(state: &ConversationState) -> Result<String, StateCodecError> {
    let stamped = ConversationState {
        v: STATE_VERSION,
        fields: state.fields.clone(),
    };
    let bytes = serde_json::to_vec(&stamped)?;
    if bytes.len() > MAX_STATE_BYTES {
        return Err(StateCodecError::TooLarge {
            size: bytes.len(),
            max: MAX_STATE_BYTES,
        });
    }
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Decode a token produced by [`encode`] (or by any standard base64 encoder).
pub fn decode(token: &str) -> Option<ConversationState> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    let bytes = [&URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(token).ok())?;

    let mut object = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(object)) => object,
        _ => return None,
    };

    let version = object.remove("v")?.as_u64()?;
    let version = u32::try_from(version).ok()?;
    if version > STATE_VERSION {
        tracing::warn!(version, supported = STATE_VERSION, "state from a newer version, reading best-effort");
    }

    Some(ConversationState {
        v: version,
        fields: object,
    })
}

/// Shallow merge where `updates` wins on every key it sets.
pub fn merge(current: Option<&ConversationState>, updates: ConversationState) -> ConversationState {
    let Some(current) = current else {
        return updates;
    };
    let mut fields = current.fields.clone();
    fields.extend(updates.fields);
    ConversationState {
        v: updates.v,
        fields,
    }
}

/// Byte span of the first embedded state block, markers included.
fn state_block_span(body: &str) -> Option<(usize, usize, &str)> {
    let start = body.find(STATE_START_MARKER)?;
    let token_start = start + STATE_START_MARKER.len();
    let token_len = body[token_start..].find(STATE_END_MARKER)?;
    let end = token_start + token_len + STATE_END_MARKER.len();
    Some((start, end, &body[token_start..token_start + token_len]))
}

/// Read the state embedded in a comment body, if any.
pub fn extract_state(body: &str) -> Option<ConversationState> {
    let (_, _, token) = state_block_span(body)?;
    decode(token)
}

/// The embedded token exactly as written, if it decodes. Lets a body that
/// keeps its state unchanged carry the token over without re-encoding it.
pub fn extract_state_token(body: &str) -> Option<&str> {
    let (_, _, token) = state_block_span(body)?;
    decode(token).map(|_| token)
}

/// Remove every embedded state block.
pub fn strip_state(body: &str) -> String {
    let mut out = body.to_string();
    while let Some((start, end, _)) = state_block_span(&out) {
        out.replace_range(start..end, "");
    }
    out.trim_end().to_string()
}

/// Append the encoded token to `body`, replacing any block already present.
pub fn embed_state(body: &str, token: &str) -> String {
    format!(
        "{}\n\n{}{}{}",
        strip_state(body),
        STATE_START_MARKER,
        token,
        STATE_END_MARKER
    )
}

/// Encode and embed `state`. When it can't be encoded the body is returned
/// without a state block.
pub fn attach_state(body: &str, state: &ConversationState) -> String {
    match encode(state) {
        Ok(token) => embed_state(body, &token),
        Err(err) => {
            tracing::warn!(error = %err, "conversation state not attached");
            strip_state(body)
        }
    }
}
