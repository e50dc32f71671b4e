//! Codec contract between the harness and the wire format.
//!
//! The harness never looks inside a message. It hands a [`Request`] to a
//! [`RequestEncoder`] and asks a [`ResponseDecoder`] for the next complete
//! [`Response`] in a receive buffer. Arrival of a response is the only
//! success signal.
//!
//! ## Providers
//! - `thrift`: Thrift binary protocol inside a 4-byte length frame

pub mod thrift;

use bytes::BytesMut;

/// A request: one constant string field, no identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub field: String,
}

impl Request {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

/// A decoded response.
///
/// Only carried for diagnostics; the harness counts arrivals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Method name echoed by the server.
    pub method: String,
    /// Size of the message body in bytes.
    pub body_len: usize,
}

/// Serializes requests onto the end of an output buffer.
pub trait RequestEncoder: Send + 'static {
    fn encode(&mut self, request: &Request, dst: &mut BytesMut) -> Result<(), EncodingError>;
}

/// Extracts complete responses from the front of a receive buffer.
pub trait ResponseDecoder: Send + 'static {
    /// Returns `Ok(None)` when `src` does not yet hold a full message.
    /// On success the message bytes are removed from `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, EncodingError>;
}

/// Codec-level failures.
///
/// These indicate a protocol or version mismatch with the peer, never a
/// transient condition.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingError {
    /// Frame length prefix exceeds the maximum frame size.
    FrameTooLarge(usize),
    /// Outgoing message does not fit in a frame.
    PayloadTooLarge(usize),
    /// Unsupported protocol version word.
    BadVersion(u32),
    /// Message type other than the one expected.
    UnexpectedMessageType(u8),
    /// Server replied with an application exception.
    Exception(String),
    /// Message ended before a value was complete.
    Truncated,
    /// Bytes left in a frame after the message was fully decoded.
    TrailingBytes(usize),
    /// Unknown field type id.
    UnknownFieldType(u8),
    /// Negative length for a string or container.
    NegativeLength(i32),
    /// Structs or containers nested too deeply.
    DepthExceeded,
    /// Method name is not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::FrameTooLarge(len) => write!(f, "frame too large: {} bytes", len),
            EncodingError::PayloadTooLarge(len) => {
                write!(f, "message too large to frame: {} bytes", len)
            }
            EncodingError::BadVersion(v) => write!(f, "bad protocol version: {:#010x}", v),
            EncodingError::UnexpectedMessageType(t) => {
                write!(f, "unexpected message type: {}", t)
            }
            EncodingError::Exception(msg) => write!(f, "server exception: {}", msg),
            EncodingError::Truncated => write!(f, "message truncated"),
            EncodingError::TrailingBytes(n) => write!(f, "{} trailing bytes after message", n),
            EncodingError::UnknownFieldType(t) => write!(f, "unknown field type: {}", t),
            EncodingError::NegativeLength(len) => write!(f, "negative length: {}", len),
            EncodingError::DepthExceeded => write!(f, "nesting depth exceeded"),
            EncodingError::InvalidUtf8 => write!(f, "invalid UTF-8 in method name"),
        }
    }
}

impl std::error::Error for EncodingError {}
