//! Engine error type.

use crate::status::Status;

/// Errors produced while routing, framing or completing a call.
///
/// The type is `Clone` so a settled [`StatusPromise`](crate::StatusPromise)
/// can hand the same outcome to every continuation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An inbound payload was not a valid encoding of the request type.
    #[error("decode error: {0}")]
    Decode(String),
    /// An outbound message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
    /// The peer violated the framing or call protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A well-formed status, passed through to the client unchanged.
    #[error("{0}")]
    Status(Status),
    /// The stream closed before the call completed.
    #[error("stream closed")]
    StreamClosed,
    /// The call already sent its trailer.
    #[error("call already completed")]
    CallCompleted,
    /// The call shape does not permit another response message.
    #[error("too many response messages for this call")]
    TooManyResponses,
    /// A service with this name is already registered.
    #[error("duplicate service: {0}")]
    DuplicateService(String),
    /// A stage received a message of a type it was not built for.
    #[error("unexpected message type, expected {0}")]
    UnexpectedMessageType(&'static str),
    /// The transport refused an outbound part.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Convert into the status the client sees.
    ///
    /// Anything that is not already a status becomes
    /// [`Status::processing_error`].
    pub fn into_status(self) -> Status {
        match self {
            Error::Status(status) => status,
            _ => Status::processing_error(),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Status(status)
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::Encode(e.to_string())
    }
}
