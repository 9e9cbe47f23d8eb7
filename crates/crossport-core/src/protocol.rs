//! Wire envelopes and framing.
//!
//! Every channel carries exactly one request envelope from the caller
//! followed by zero or more response envelopes from the publication:
//!
//! ```text
//! Request  = { "watch": bool, "params": any }
//! Response = { "status": "resolved" | "rejected", "data": any }
//! ```
//!
//! Stream transports additionally frame each message as
//! `[u32 BE: len][UTF-8 JSON bytes of len]`.

use crate::config::ChannelConfig;
use crate::{CrossportError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Build the channel name for a published method.
pub fn channel_name(module_name: &str, method_name: &str) -> String {
    format!(
        "{}{}{}",
        module_name,
        ChannelConfig::CHANNEL_NAME_SEPARATOR,
        method_name
    )
}

/// Module part of a channel name (everything before the first separator).
pub fn module_of(channel_name: &str) -> Option<&str> {
    channel_name
        .split_once(ChannelConfig::CHANNEL_NAME_SEPARATOR)
        .map(|(module, _)| module)
}

/// Request envelope, sent once right after a channel is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// A plain call expecting a single response.
    pub fn call(params: Value) -> Self {
        Self {
            watch: false,
            params,
        }
    }

    /// A watch call expecting a response per value change.
    pub fn watch(params: Value) -> Self {
        Self {
            watch: true,
            params,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a request envelope received on a channel.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CrossportError::ProtocolViolation {
            message: format!("malformed request envelope: {}", e),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Resolved,
    Rejected,
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn resolved(data: Value) -> Self {
        Self {
            status: ResponseStatus::Resolved,
            data,
        }
    }

    pub fn rejected(reason: Value) -> Self {
        Self {
            status: ResponseStatus::Rejected,
            data: reason,
        }
    }

    /// Build the envelope reporting a method outcome.
    pub fn from_outcome(outcome: std::result::Result<Value, Value>) -> Self {
        match outcome {
            Ok(value) => Self::resolved(value),
            Err(reason) => Self::rejected(reason),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a response envelope.
    ///
    /// Unknown statuses and non-object payloads are protocol violations.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CrossportError::ProtocolViolation {
            message: format!("malformed response envelope: {}", e),
        })
    }
}

/// First frame on a stream-based channel, naming the channel requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub channel: String,
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ChannelConfig::MAX_FRAME_SIZE {
        return Err(CrossportError::ProtocolViolation {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ChannelConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| CrossportError::ProtocolViolation {
        message: format!("frame of {} bytes is too large", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it as JSON.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Value>> {
    match read_frame(reader).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode a JSON value and write it as one frame.
pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("Background", "login"), "Background.login");
        assert_eq!(module_of("Background.login"), Some("Background"));
        assert_eq!(module_of("Background.a.b"), Some("Background"));
        assert_eq!(module_of("nodot"), None);
    }

    #[test]
    fn test_request_wire_shape() {
        let value = Request::watch(json!({"id": 3})).to_value().unwrap();
        assert_eq!(value, json!({"watch": true, "params": {"id": 3}}));
    }

    #[test]
    fn test_request_missing_fields_default() {
        let req = Request::from_value(json!({})).unwrap();
        assert!(!req.watch);
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn test_response_wire_shape() {
        let value = Response::rejected(json!("bad-input")).to_value().unwrap();
        assert_eq!(value, json!({"status": "rejected", "data": "bad-input"}));
    }

    #[test]
    fn test_response_unknown_status_is_violation() {
        let err = Response::from_value(json!({"status": "pending", "data": 1})).unwrap_err();
        assert!(matches!(err, CrossportError::ProtocolViolation { .. }));

        let err = Response::from_value(json!("resolved")).unwrap_err();
        assert!(matches!(err, CrossportError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_response_missing_data_is_null() {
        let resp = Response::from_value(json!({"status": "resolved"})).unwrap();
        assert_eq!(resp, Response::resolved(Value::Null));
    }

    #[test]
    fn test_response_from_outcome() {
        assert_eq!(
            Response::from_outcome(Ok(json!(10))),
            Response::resolved(json!(10))
        );
        assert_eq!(
            Response::from_outcome(Err(json!("nope"))),
            Response::rejected(json!("nope"))
        );
    }

    #[tokio::test]
    async fn test_message_read_write() {
        let mut buf = Vec::new();
        write_message(&mut buf, &json!({"channel": "A.b"})).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let value = read_message(&mut cursor).await.unwrap().unwrap();
        let handshake: Handshake = serde_json::from_value(value).unwrap();
        assert_eq!(handshake.channel, "A.b");

        assert!(read_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ChannelConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
