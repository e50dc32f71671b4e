//! Harness error taxonomy.

use crate::protocol::EncodingError;

/// Errors surfaced by connections and the request/response loops.
#[derive(Debug)]
pub enum HarnessError {
    /// The stream could not be established. Fatal for the run.
    Connection {
        addr: String,
        source: std::io::Error,
    },
    /// Read or write failed on an open stream. Stops the affected loop.
    Transport(std::io::Error),
    /// The peer speaks something the codec does not understand.
    Encoding(EncodingError),
}

impl HarnessError {
    /// Whether the coordinator must escalate instead of idling.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HarnessError::Transport(_))
    }
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Connection { addr, source } => {
                write!(f, "Failed to connect to {}: {}", addr, source)
            }
            HarnessError::Transport(e) => write!(f, "Transport error: {}", e),
            HarnessError::Encoding(e) => write!(f, "Encoding error: {}", e),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Connection { source, .. } => Some(source),
            HarnessError::Transport(e) => Some(e),
            HarnessError::Encoding(e) => Some(e),
        }
    }
}

impl From<EncodingError> for HarnessError {
    fn from(e: EncodingError) -> Self {
        HarnessError::Encoding(e)
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(e: std::io::Error) -> Self {
        HarnessError::Transport(e)
    }
}
