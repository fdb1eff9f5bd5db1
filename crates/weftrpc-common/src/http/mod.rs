//! HTTP/1.x message framing shared by server and client
//!
//! - [`header`]: resumable request/status line and header field parser
//! - [`chunked`]: incremental `Transfer-Encoding: chunked` decoder

pub mod chunked;
pub mod header;

pub use chunked::ChunkedDecoder;
pub use header::{
    HeaderMap, HeaderParser, MessageHead, ReplyHead, ReplyParser, RequestHead, RequestParser,
    DEFAULT_MAX_HEADER_SIZE,
};

/// Canonical reason phrase for the status codes this crate produces.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
