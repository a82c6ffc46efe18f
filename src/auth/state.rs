//! Opaque `state` parameter encoding.
//!
//! The authorization URL carries which scope tier was requested (plus an
//! optional caller value) inside the OAuth `state` parameter, so the
//! callback handler can recover it without any server-side session storage.
//! Decoding fails soft: malformed input yields the standard tier rather
//! than rejecting the whole callback.

use super::ScopeLevel;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize, Deserialize)]
struct StatePayload {
    #[serde(rename = "s")]
    scope: ScopeLevel,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    custom: Option<String>,
}

/// Encodes the requested scope tier and an optional caller value.
pub fn encode_state(scope: ScopeLevel, custom: Option<&str>) -> String {
    let payload = StatePayload {
        scope,
        custom: custom.map(str::to_string),
    };
    // Serializing a two-field struct cannot fail
    let json = serde_json::to_string(&payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decodes a `state` value back into `(scope tier, custom value)`.
///
/// Any malformed input decodes as `(Standard, None)`.
pub fn decode_state(raw: &str) -> (ScopeLevel, Option<String>) {
    let bytes = match URL_SAFE_NO_PAD.decode(raw) {
        Ok(bytes) => bytes,
        Err(_) => {
            debug!("State parameter is not valid base64, defaulting to standard tier");
            return (ScopeLevel::Standard, None);
        }
    };

    match serde_json::from_slice::<StatePayload>(&bytes) {
        Ok(payload) => (payload.scope, payload.custom),
        Err(_) => {
            debug!("State parameter payload malformed, defaulting to standard tier");
            (ScopeLevel::Standard, None)
        }
    }
}
