//! Framing: one compact JSON object per text frame. Full decode for the worker,
//! plus an allocation-free `type` probe for the network context.

use serde::Deserialize;

use crate::protocol::{AckKind, DownloadNotify, Inbound, Outbound, UploadRequest};

/// Encode a message as a single newline-free JSON text.
pub fn encode(msg: &Outbound) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(msg)?)
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outer envelope as received. `data` stays untyped until the kind is known.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// Decode one inbound frame.
pub fn decode(frame: &[u8]) -> Result<Inbound, DecodeError> {
    let env: RawEnvelope = serde_json::from_slice(frame).map_err(DecodeError::Json)?;
    let kind = env.kind.ok_or(DecodeError::MissingType)?;
    if let Some(ack) = AckKind::from_type(&kind) {
        return Ok(Inbound::Ack(ack));
    }
    match kind.as_str() {
        "download_notify" => {
            let notify: DownloadNotify = payload(&kind, env.data)?;
            Ok(Inbound::DownloadNotify(notify))
        }
        "upload_request" => {
            let req: UploadRequest = payload(&kind, env.data)?;
            Ok(Inbound::UploadRequest(req))
        }
        "error" => Ok(Inbound::ServerError {
            code: env.code,
            message: env.message,
        }),
        _ => Err(DecodeError::UnknownType(kind)),
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    data: Option<serde_json::Value>,
) -> Result<T, DecodeError> {
    let data = data.ok_or_else(|| DecodeError::MissingData(kind.to_string()))?;
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Error decoding an inbound frame. None of these are fatal; the frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(serde_json::Error),
    #[error("envelope has no type")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("{0} has no data")]
    MissingData(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

/// Find the top-level `"type"` string value without parsing or allocating.
/// Returns `None` for anything it cannot read cheaply (escaped or non-string values,
/// truncated input); such frames take the full decode path.
pub fn probe_type(frame: &[u8]) -> Option<&str> {
    let mut depth = 0usize;
    let mut i = 0usize;
    while i < frame.len() {
        match frame[i] {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.checked_sub(1)?,
            b'"' => {
                let (key, end) = scan_string(frame, i)?;
                if depth == 1 && key == b"type" {
                    let j = skip_ws(frame, end);
                    if frame.get(j) == Some(&b':') {
                        let j = skip_ws(frame, j + 1);
                        if frame.get(j) != Some(&b'"') {
                            return None;
                        }
                        let (value, _) = scan_string(frame, j)?;
                        if value.contains(&b'\\') {
                            return None;
                        }
                        return std::str::from_utf8(value).ok();
                    }
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// `start` points at an opening quote. Returns the raw contents and the index after the closing quote.
fn scan_string(frame: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let mut i = start + 1;
    while i < frame.len() {
        match frame[i] {
            b'\\' => i += 2,
            b'"' => return Some((&frame[start + 1..i], i + 1)),
            _ => i += 1,
        }
    }
    None
}

fn skip_ws(frame: &[u8], mut i: usize) -> usize {
    while i < frame.len() && frame[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}
