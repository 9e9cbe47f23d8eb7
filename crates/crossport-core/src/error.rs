//! Error types for crossport.
//!
//! Every failure a caller can observe maps onto one of a handful of kinds:
//! configuration mistakes (raised synchronously), channels that could not be
//! opened or were lost, rejections reported by the remote method, and
//! malformed envelopes.

use thiserror::Error;

/// Main error type for the crossport library.
#[derive(Debug, Error)]
pub enum CrossportError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // Channel errors
    #[error("Channel {channel} unavailable: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    #[error("Remote rejected the call: {0}")]
    RemoteRejected(serde_json::Value),

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for crossport operations.
pub type Result<T> = std::result::Result<T, CrossportError>;

impl From<std::io::Error> for CrossportError {
    fn from(err: std::io::Error) -> Self {
        CrossportError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CrossportError {
    fn from(err: serde_json::Error) -> Self {
        CrossportError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CrossportError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        CrossportError::Configuration {
            message: message.into(),
        }
    }

    /// Create a channel error for the named channel.
    pub fn channel_unavailable(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        CrossportError::ChannelUnavailable {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// The reason supplied by the remote side, if this is a rejection.
    pub fn rejection_reason(&self) -> Option<&serde_json::Value> {
        match self {
            CrossportError::RemoteRejected(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, CrossportError::Configuration { .. })
    }

    pub fn is_channel_unavailable(&self) -> bool {
        matches!(self, CrossportError::ChannelUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let err = CrossportError::channel_unavailable("Background.login", "no listener");
        assert_eq!(
            err.to_string(),
            "Channel Background.login unavailable: no listener"
        );

        let err = CrossportError::configuration("module name is empty");
        assert_eq!(err.to_string(), "Configuration error: module name is empty");
    }

    #[test]
    fn test_rejection_reason() {
        let err = CrossportError::RemoteRejected(json!("bad-input"));
        assert_eq!(err.rejection_reason(), Some(&json!("bad-input")));
        assert!(CrossportError::Other("x".into()).rejection_reason().is_none());
    }

    #[test]
    fn test_kind_predicates() {
        assert!(CrossportError::configuration("x").is_configuration());
        assert!(!CrossportError::configuration("x").is_channel_unavailable());
        assert!(CrossportError::channel_unavailable("a.b", "gone").is_channel_unavailable());
    }

    #[test]
    fn test_from_json_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CrossportError = parse_err.into();
        assert!(matches!(err, CrossportError::Json { .. }));
    }
}
