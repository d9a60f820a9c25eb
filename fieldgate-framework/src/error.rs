//! Error types for the gateway runtime.

use thiserror::Error;

/// Result type alias using [`FrameworkError`].
pub type Result<T> = std::result::Result<T, FrameworkError>;

#[derive(Error, Debug)]
pub enum FrameworkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Zenoh connection error: {0}")]
    ZenohConnection(String),

    #[error("Zenoh session error: {0}")]
    ZenohSession(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    #[error("Liveliness error: {0}")]
    Liveliness(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameworkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn liveliness(msg: impl Into<String>) -> Self {
        Self::Liveliness(msg.into())
    }
}

impl From<zenoh::Error> for FrameworkError {
    fn from(err: zenoh::Error) -> Self {
        Self::ZenohSession(err.to_string())
    }
}

impl From<serde_json::Error> for FrameworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for FrameworkError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<fieldgate_common::Error> for FrameworkError {
    fn from(err: fieldgate_common::Error) -> Self {
        match err {
            fieldgate_common::Error::Config(msg) => Self::Config(msg),
            fieldgate_common::Error::Session(e) => Self::ZenohSession(e.to_string()),
            fieldgate_common::Error::KeyPrefix(prefix) => {
                Self::ConfigValidation(format!("invalid key prefix {:?}", prefix))
            }
            other @ (fieldgate_common::Error::Encode { .. }
            | fieldgate_common::Error::Decode { .. }) => Self::Serialization(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_errors_keep_their_kind() {
        let err: FrameworkError = fieldgate_common::Error::Config("bad mode".into()).into();
        assert!(matches!(err, FrameworkError::Config(ref m) if m == "bad mode"));

        let err: FrameworkError = fieldgate_common::Error::Decode {
            format: fieldgate_common::Format::Cbor,
            message: "eof".into(),
        }
        .into();
        assert!(matches!(err, FrameworkError::Serialization(_)));

        let err: FrameworkError = fieldgate_common::Error::KeyPrefix("a/*".into()).into();
        assert!(matches!(err, FrameworkError::ConfigValidation(_)));
    }
}
