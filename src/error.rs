//! Error types
use std::{io, result, time::Duration};

use coap_lite::error::MessageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error talking to the device: {0}")]
    Transport(#[from] io::Error),
    #[error("No response from the device within {0:?}")]
    Timeout(Duration),
    #[error("Could not parse the response received from the device: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unexpected response payload: {0}")]
    Payload(String),
    #[error("Malformed CoAP message: {0}")]
    Coap(String),
    #[error("Device answered with {0}")]
    Status(String),
    #[error("Invalid CoAP URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: &'static str },
    #[error("Invalid schedule: {0}")]
    Schedule(&'static str),
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Parse,
    Configuration,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Status(_) | Error::Other(_) => ErrorKind::Transport,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Parse(_) | Error::Payload(_) | Error::Coap(_) => ErrorKind::Parse,
            Error::InvalidUri { .. } | Error::Schedule(_) => ErrorKind::Configuration,
        }
    }

    pub(crate) fn invalid_uri(uri: &str, reason: &'static str) -> Self {
        Error::InvalidUri {
            uri: uri.to_string(),
            reason,
        }
    }
}

impl From<MessageError> for Error {
    fn from(error: MessageError) -> Self {
        Error::Coap(format!("{:?}", error))
    }
}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Error::Other(error)
    }
}

pub type Result<T> = result::Result<T, Error>;
