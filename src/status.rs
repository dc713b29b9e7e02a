use std::{error::Error, fmt};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};

use crate::metadata::Metadata;

pub(crate) const GRPC_STATUS_HEADER: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE_HEADER: &str = "grpc-message";
pub(crate) const GRPC_STATUS_DETAILS_HEADER: &str = "grpc-status-details-bin";

/// The encode set for `grpc-message`: everything outside the printable ASCII
/// range, plus the escape character itself.
const GRPC_MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'\x7f');

/// A gRPC status describing the result of an RPC.
#[derive(Clone)]
pub struct Status {
    /// The gRPC status code, carried in the `grpc-status` trailer.
    code: Code,
    /// A relevant error message, carried in the `grpc-message` trailer.
    details: String,
    /// Opaque binary details, carried verbatim in the
    /// `grpc-status-details-bin` trailer's wire form.
    status_details: Bytes,
    /// Trailing metadata received alongside the status, if any.
    metadata: Metadata,
}

/// gRPC status codes used by [`Status`].
///
/// These variants match the codes defined by the gRPC protocol; see
/// <https://github.com/grpc/grpc/blob/master/doc/statuscodes.md>.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Converts a numeric `grpc-status` value into a `Code`. Out-of-range
    /// values map to `Unknown`, as required by the protocol.
    pub fn from_i32(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Code::Ok => "The operation completed successfully",
            Code::Cancelled => "The operation was cancelled",
            Code::Unknown => "Unknown error",
            Code::InvalidArgument => "Client specified an invalid argument",
            Code::DeadlineExceeded => "Deadline expired before operation could complete",
            Code::NotFound => "Some requested entity was not found",
            Code::AlreadyExists => "Some entity that we attempted to create already exists",
            Code::PermissionDenied => "The caller does not have permission to execute the specified operation",
            Code::ResourceExhausted => "Some resource has been exhausted",
            Code::FailedPrecondition => "The system is not in a state required for the operation's execution",
            Code::Aborted => "The operation was aborted",
            Code::OutOfRange => "Operation was attempted past the valid range",
            Code::Unimplemented => "Operation is not implemented or not supported",
            Code::Internal => "Internal error",
            Code::Unavailable => "The service is currently unavailable",
            Code::DataLoss => "Unrecoverable data loss or corruption",
            Code::Unauthenticated => "The request does not have valid authentication credentials",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Status {
    /// Creates a new `Status` with the associated code and details message.
    pub fn new(code: Code, details: impl Into<String>) -> Status {
        Status {
            code,
            details: details.into(),
            status_details: Bytes::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    pub fn cancelled(details: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, details)
    }

    pub fn unknown(details: impl Into<String>) -> Status {
        Status::new(Code::Unknown, details)
    }

    pub fn deadline_exceeded(details: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, details)
    }

    pub fn internal(details: impl Into<String>) -> Status {
        Status::new(Code::Internal, details)
    }

    pub fn unavailable(details: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, details)
    }

    pub fn unimplemented(details: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, details)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Status {
        self.metadata = metadata;
        self
    }

    /// Attaches opaque binary details, in their wire form.
    pub fn with_status_details(mut self, details: Bytes) -> Status {
        self.status_details = details;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    /// The opaque binary details from the `grpc-status-details-bin` trailer,
    /// in their wire form. Empty when the peer sent none.
    pub fn status_details(&self) -> &Bytes {
        &self.status_details
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Maps a bare HTTP `:status` to a gRPC code, for responses that carried
    /// no `grpc-status` trailer.
    pub(crate) fn from_http_status(status: u16) -> Status {
        let code = match status {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        };
        Status::new(code, format!("Received HTTP status code {status}"))
    }

    /// Maps an HTTP/2 stream reset cause to a gRPC code.
    ///
    /// See <https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#errors>.
    pub(crate) fn from_h2_reason(reason: h2::Reason) -> Status {
        let code = match reason {
            h2::Reason::REFUSED_STREAM => Code::Unavailable,
            h2::Reason::CANCEL => Code::Cancelled,
            h2::Reason::ENHANCE_YOUR_CALM => Code::ResourceExhausted,
            h2::Reason::INADEQUATE_SECURITY => Code::PermissionDenied,
            _ => Code::Internal,
        };
        Status::new(code, format!("HTTP/2 stream closed: {reason}"))
    }

    pub(crate) fn from_h2_error(err: &h2::Error) -> Status {
        match err.reason() {
            Some(reason) => Status::from_h2_reason(reason),
            None => Status::unknown(format!("Unexpected HTTP/2 error: {err}")),
        }
    }

    /// Extracts a `Status` from a header block containing a `grpc-status`
    /// entry. Returns `None` when the block carries no status, i.e. when it
    /// is an initial-metadata block of a call that is still in flight.
    pub(crate) fn from_header_map(headers: &HeaderMap) -> Option<Status> {
        let code = headers.get(GRPC_STATUS_HEADER).map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .map(Code::from_i32)
                .unwrap_or(Code::Unknown)
        })?;

        let details = headers
            .get(GRPC_MESSAGE_HEADER)
            .map(|v| percent_decode(v.as_bytes()).decode_utf8_lossy().into_owned())
            .unwrap_or_default();

        // Binary details pass through untouched in their wire form.
        let status_details = headers
            .get(GRPC_STATUS_DETAILS_HEADER)
            .map(|v| Bytes::copy_from_slice(v.as_bytes()))
            .unwrap_or_else(Bytes::new);

        let mut metadata = Metadata::from_header_map(headers);
        metadata.remove(GRPC_STATUS_HEADER);
        metadata.remove(GRPC_MESSAGE_HEADER);
        metadata.remove(GRPC_STATUS_DETAILS_HEADER);

        Some(Status {
            code,
            details,
            status_details,
            metadata,
        })
    }

    /// Writes the status into `headers` in its wire form.
    pub fn add_header(&self, headers: &mut HeaderMap) -> Result<(), Status> {
        headers.insert(
            GRPC_STATUS_HEADER,
            HeaderValue::from_str(&(self.code as i32).to_string())
                .map_err(|e| Status::internal(format!("invalid status header: {e}")))?,
        );

        if !self.details.is_empty() {
            let encoded =
                percent_encode(self.details.as_bytes(), GRPC_MESSAGE_ENCODE_SET).to_string();
            headers.insert(
                GRPC_MESSAGE_HEADER,
                HeaderValue::from_str(&encoded)
                    .map_err(|e| Status::internal(format!("invalid status message: {e}")))?,
            );
        }

        if !self.status_details.is_empty() {
            headers.insert(
                GRPC_STATUS_DETAILS_HEADER,
                HeaderValue::from_maybe_shared(self.status_details.clone())
                    .map_err(|e| Status::internal(format!("invalid status details: {e}")))?,
            );
        }

        Ok(())
    }

    /// Renders the status as a trailer block.
    pub fn to_header_map(&self) -> Result<HeaderMap, Status> {
        let mut headers = HeaderMap::with_capacity(3);
        self.add_header(&mut headers)?;
        Ok(headers)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("details", &self.details)
            .finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {:?}, details: {:?}", self.code, self.details)
    }
}

impl Error for Status {}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.details == other.details
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_from_i32_round_trips() {
        for i in 0..=16 {
            assert_eq!(Code::from_i32(i) as i32, i);
        }
        assert_eq!(Code::from_i32(-1), Code::Unknown);
        assert_eq!(Code::from_i32(17), Code::Unknown);
    }

    #[test]
    fn http_status_mapping() {
        struct TestCase {
            http: u16,
            want: Code,
        }
        let test_cases = vec![
            TestCase { http: 400, want: Code::Internal },
            TestCase { http: 401, want: Code::Unauthenticated },
            TestCase { http: 403, want: Code::PermissionDenied },
            TestCase { http: 404, want: Code::Unimplemented },
            TestCase { http: 429, want: Code::Unavailable },
            TestCase { http: 502, want: Code::Unavailable },
            TestCase { http: 503, want: Code::Unavailable },
            TestCase { http: 504, want: Code::Unavailable },
            TestCase { http: 418, want: Code::Unknown },
            TestCase { http: 200, want: Code::Unknown },
        ];
        for tc in test_cases {
            assert_eq!(Status::from_http_status(tc.http).code(), tc.want, "{}", tc.http);
        }
    }

    #[test]
    fn h2_reason_mapping() {
        struct TestCase {
            reason: h2::Reason,
            want: Code,
        }
        let test_cases = vec![
            TestCase { reason: h2::Reason::REFUSED_STREAM, want: Code::Unavailable },
            TestCase { reason: h2::Reason::CANCEL, want: Code::Cancelled },
            TestCase { reason: h2::Reason::ENHANCE_YOUR_CALM, want: Code::ResourceExhausted },
            TestCase { reason: h2::Reason::INADEQUATE_SECURITY, want: Code::PermissionDenied },
            TestCase { reason: h2::Reason::PROTOCOL_ERROR, want: Code::Internal },
            TestCase { reason: h2::Reason::INTERNAL_ERROR, want: Code::Internal },
        ];
        for tc in test_cases {
            assert_eq!(Status::from_h2_reason(tc.reason).code(), tc.want);
        }
    }

    #[test]
    fn status_from_header_map() {
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_STATUS_HEADER, "5".parse().unwrap());
        headers.insert(GRPC_MESSAGE_HEADER, "not%20found".parse().unwrap());
        headers.insert("x-trace-id", "abc".parse().unwrap());

        let status = Status::from_header_map(&headers).unwrap();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.details(), "not found");
        assert!(status.status_details().is_empty());
        assert!(status.metadata().get(GRPC_STATUS_HEADER).is_none());
        assert_eq!(
            status.metadata().get("x-trace-id").unwrap().as_str().unwrap(),
            "abc"
        );
    }

    #[test]
    fn trailer_round_trip_preserves_binary_details() {
        let details = Bytes::from_static(b"CAUSBmRldGFpbA==");
        let status = Status::new(Code::PermissionDenied, "50% done, denied")
            .with_status_details(details.clone());

        let headers = status.to_header_map().unwrap();
        assert_eq!(headers.get(GRPC_STATUS_HEADER).unwrap(), "7");
        assert_eq!(
            headers.get(GRPC_MESSAGE_HEADER).unwrap(),
            "50%25 done, denied"
        );
        assert_eq!(
            headers.get(GRPC_STATUS_DETAILS_HEADER).unwrap().as_bytes(),
            details.as_ref()
        );

        let back = Status::from_header_map(&headers).unwrap();
        assert_eq!(back.code(), Code::PermissionDenied);
        assert_eq!(back.details(), "50% done, denied");
        assert_eq!(back.status_details(), &details);
        // The typed fields do not leak into the trailing metadata.
        assert!(back.metadata().is_empty());
    }

    #[test]
    fn empty_details_emit_no_headers() {
        let headers = Status::new(Code::Ok, "").to_header_map().unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(GRPC_STATUS_HEADER).unwrap(), "0");
        assert!(headers.get(GRPC_MESSAGE_HEADER).is_none());
        assert!(headers.get(GRPC_STATUS_DETAILS_HEADER).is_none());
    }

    #[test]
    fn no_status_header_yields_none() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/grpc".parse().unwrap());
        assert!(Status::from_header_map(&headers).is_none());
    }

    #[test]
    fn unparsable_status_header_is_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_STATUS_HEADER, "bogus".parse().unwrap());
        let status = Status::from_header_map(&headers).unwrap();
        assert_eq!(status.code(), Code::Unknown);
    }
}
