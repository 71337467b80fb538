//! gRPC status codes and the trailer rendering of a call outcome.

use crate::metadata::Metadata;
use std::fmt;

/// Trailer key carrying the numeric status code.
pub const GRPC_STATUS: &str = "grpc-status";

/// Trailer key carrying the (percent-encoded) status message.
pub const GRPC_MESSAGE: &str = "grpc-message";

/// Message of the status sent when a call fails with something that is not
/// already a [`Status`].
pub const PROCESSING_ERROR_MESSAGE: &str = "unknown error processing request";

/// The 17 canonical gRPC status codes, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    /// Also used for requests above the configured message size.
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    /// Unknown service or method, or an unsupported feature.
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Every code, indexed by its wire value.
    pub const ALL: [Code; 17] = [
        Code::Ok,
        Code::Cancelled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    /// Map a wire value to a code. Values outside the table are `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .unwrap_or(Code::Unknown)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }

    /// Canonical upper-case name, e.g. `NOT_FOUND`.
    pub fn name(self) -> &'static str {
        const NAMES: [&str; 17] = [
            "OK",
            "CANCELLED",
            "UNKNOWN",
            "INVALID_ARGUMENT",
            "DEADLINE_EXCEEDED",
            "NOT_FOUND",
            "ALREADY_EXISTS",
            "PERMISSION_DENIED",
            "RESOURCE_EXHAUSTED",
            "FAILED_PRECONDITION",
            "ABORTED",
            "OUT_OF_RANGE",
            "UNIMPLEMENTED",
            "INTERNAL",
            "UNAVAILABLE",
            "DATA_LOSS",
            "UNAUTHENTICATED",
        ];
        NAMES[self as usize]
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// The status code.
    code: Code,
    /// Optional human-readable message.
    message: Option<String>,
    /// Metadata sent in the trailer ahead of the status entries.
    trailing_metadata: Metadata,
}

impl Status {
    /// A status with a message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            trailing_metadata: Metadata::new(),
        }
    }

    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// A status without a message.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            trailing_metadata: Metadata::new(),
        }
    }

    /// The status used when a call fails with an error that is not a status.
    pub fn processing_error() -> Self {
        Self::internal(PROCESSING_ERROR_MESSAGE)
    }

    /// Attach trailing metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.trailing_metadata = metadata;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn trailing_metadata(&self) -> &Metadata {
        &self.trailing_metadata
    }

    pub fn trailing_metadata_mut(&mut self) -> &mut Metadata {
        &mut self.trailing_metadata
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Render the trailer block for this status.
    ///
    /// Trailing metadata comes first, followed by `grpc-status` and
    /// `grpc-message`. The message entry is always present (empty when the
    /// status has no message) and is percent-encoded.
    pub fn to_trailers(&self) -> Metadata {
        let mut trailers = self.trailing_metadata.clone();
        trailers.insert(GRPC_STATUS, self.code.as_u32().to_string());
        trailers.insert(
            GRPC_MESSAGE,
            percent_encode(self.message.as_deref().unwrap_or("")),
        );
        trailers
    }

    /// Rebuild a status from a trailer block.
    ///
    /// Returns `None` when the trailer carries no `grpc-status` entry.
    pub fn from_trailers(trailers: &Metadata) -> Option<Self> {
        let code = trailers.get(GRPC_STATUS)?.trim().parse::<u32>().ok()?;
        let message = trailers
            .get(GRPC_MESSAGE)
            .map(percent_decode)
            .filter(|m| !m.is_empty());
        let trailing_metadata = trailers
            .iter()
            .filter(|(k, _)| *k != GRPC_STATUS && *k != GRPC_MESSAGE)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Some(Self {
            code: Code::from_u32(code),
            message,
            trailing_metadata,
        })
    }

    // shorthands for the codes the engine and typical services produce

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

/// Percent-encode a status message as the gRPC HTTP/2 mapping requires:
/// bytes outside printable ASCII, and `%` itself, become `%XX`.
fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for &b in message.as_bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Inverse of [`percent_encode`]. Malformed escapes are kept verbatim.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(b) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_table_matches_wire_values() {
        for (value, code) in Code::ALL.iter().enumerate() {
            assert_eq!(code.as_u32() as usize, value);
            assert_eq!(Code::from_u32(value as u32), *code);
        }
        assert_eq!(Code::from_u32(17), Code::Unknown);
        assert_eq!(Code::from_u32(u32::MAX), Code::Unknown);
    }

    #[test]
    fn test_code_names() {
        assert_eq!(Code::Ok.to_string(), "OK");
        assert_eq!(Code::ResourceExhausted.name(), "RESOURCE_EXHAUSTED");
        assert_eq!(Code::Unauthenticated.to_string(), "UNAUTHENTICATED");
    }

    #[test]
    fn test_status_ok() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert_eq!(status.code(), Code::Ok);
        assert!(status.message().is_none());
        assert!(status.trailing_metadata().is_empty());
    }

    #[test]
    fn test_processing_error() {
        let status = Status::processing_error();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), Some(PROCESSING_ERROR_MESSAGE));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::ok()), "OK");
        assert_eq!(
            format!("{}", Status::not_found("entity not found")),
            "NOT_FOUND: entity not found"
        );
    }

    #[test]
    fn test_trailers_ok() {
        let trailers = Status::ok().to_trailers();
        assert_eq!(trailers.len(), 2);
        assert_eq!(trailers.get(GRPC_STATUS), Some("0"));
        assert_eq!(trailers.get(GRPC_MESSAGE), Some(""));
    }

    #[test]
    fn test_trailers_metadata_first() {
        let mut metadata = Metadata::new();
        metadata.insert("X-Trace", "abc");
        let status = Status::unimplemented("unknown method /a/b").with_metadata(metadata);

        let trailers = status.to_trailers();
        let entries: Vec<_> = trailers.iter().collect();
        assert_eq!(
            entries,
            vec![
                ("x-trace", "abc"),
                ("grpc-status", "12"),
                ("grpc-message", "unknown method /a/b"),
            ]
        );
    }

    #[test]
    fn test_trailers_percent_encode_message() {
        let trailers = Status::internal("50% done\néé").to_trailers();
        assert_eq!(
            trailers.get(GRPC_MESSAGE),
            Some("50%25 done%0A%C3%A9%C3%A9")
        );
    }

    #[test]
    fn test_from_trailers() {
        let mut metadata = Metadata::new();
        metadata.insert("x-retry", "no");
        let original = Status::internal("boom 100%").with_metadata(metadata);

        let parsed = Status::from_trailers(&original.to_trailers()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_trailing_metadata_added_later() {
        let mut status = Status::unavailable("draining");
        status.trailing_metadata_mut().insert("Retry-After", "5");

        let trailers = status.to_trailers();
        assert_eq!(trailers.get("retry-after"), Some("5"));
        assert_eq!(trailers.iter().next(), Some(("retry-after", "5")));
    }

    #[test]
    fn test_from_trailers_empty_message() {
        let parsed = Status::from_trailers(&Status::ok().to_trailers()).unwrap();
        assert_eq!(parsed, Status::ok());
    }

    #[test]
    fn test_from_trailers_missing_status() {
        let mut trailers = Metadata::new();
        trailers.insert(GRPC_MESSAGE, "hi");
        assert!(Status::from_trailers(&trailers).is_none());
    }

    #[test]
    fn test_percent_decode_malformed() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_status_is_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<Status>();
    }
}
