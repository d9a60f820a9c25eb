use thiserror::Error;

use crate::serialization::Format;

/// Faults of the shared gateway plumbing: configuration, the Zenoh session,
/// payload encoding and key prefixes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Zenoh session error: {0}")]
    Session(#[from] zenoh::Error),

    #[error("Cannot encode {format:?} payload: {message}")]
    Encode { format: Format, message: String },

    #[error("Cannot decode {format:?} payload: {message}")]
    Decode { format: Format, message: String },

    #[error("Key prefix {0:?} is not a publishable key expression")]
    KeyPrefix(String),
}

impl Error {
    pub(crate) fn encode(format: Format, err: impl std::fmt::Display) -> Self {
        Error::Encode {
            format,
            message: err.to_string(),
        }
    }

    pub(crate) fn decode(format: Format, err: impl std::fmt::Display) -> Self {
        Error::Decode {
            format,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
