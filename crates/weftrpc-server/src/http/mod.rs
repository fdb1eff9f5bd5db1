//! HTTP/1.1 server engine
//!
//! Each accepted socket is driven by a [`connection`] state machine on the
//! reactor thread:
//!
//! ```text
//! Handshaking -> AwaitingHeader -> ParsingHeader -> DispatchingBody / Responding
//!     -> SendingReply -> KeepAliveWait -> ParsingHeader ... | Closed
//! ```
//!
//! Requests are routed by path to an [`HttpService`], which creates one
//! [`Responder`] per request. The responder receives the header, the body in
//! chunks as it arrives, and finally fills in an [`HttpReply`].

pub mod connection;
pub mod server;


use rustls::pki_types::CertificateDer;
use weftrpc_common::http::{reason_phrase, ReplyHead, RequestHead};
use weftrpc_common::{Result, WeftError};

pub use server::HttpServer;

/// Decides whether a TLS peer's certificate chain (leaf first, empty when
/// the peer sent none) is acceptable.
pub type CertificateFilter = Box<dyn Fn(&[CertificateDer<'static>]) -> bool>;

/// Reply under construction.
#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub head: ReplyHead,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: u16) {
        self.head.set_status(status, reason_phrase(status));
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.head.headers.set(name, value);
    }

    pub fn set_content_type(&mut self, value: &str) {
        self.set_header("Content-Type", value);
    }

    /// A plain-text error reply.
    pub fn error(status: u16, detail: &str) -> Self {
        let mut reply = HttpReply::new();
        reply.set_status(status);
        reply.set_content_type("text/plain; charset=utf-8");
        reply.body = format!("{} {}\n{}\n", status, reason_phrase(status), detail).into_bytes();
        reply
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        self.head.write_to(out);
        out.extend_from_slice(&self.body);
    }
}

/// Per-request handler created by an [`HttpService`].
pub trait Responder {
    /// Called once the request header is complete. An error aborts the
    /// request with an error reply and closes the connection.
    fn begin_request(&mut self, _request: &RequestHead) -> Result<()> {
        Ok(())
    }

    /// Receives the next piece of the request body.
    fn read_body(&mut self, data: &[u8]) -> Result<()>;

    /// Produces the reply once the body is complete.
    fn reply(&mut self, request: &RequestHead, reply: &mut HttpReply) -> Result<()>;

    /// Replaces `reply` with one reporting `error`.
    fn reply_error(&mut self, error: &WeftError, reply: &mut HttpReply) {
        *reply = HttpReply::error(500, &error.to_string());
    }
}

/// Creates responders for requests routed to it.
pub trait HttpService {
    fn create_responder(&self, request: &RequestHead) -> Box<dyn Responder>;
}

/// Answers every request with `404 Not Found`.
#[derive(Debug, Default)]
pub struct NotFoundResponder;

impl Responder for NotFoundResponder {
    fn read_body(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn reply(&mut self, request: &RequestHead, reply: &mut HttpReply) -> Result<()> {
        *reply = HttpReply::error(404, &format!("no service at {}", request.path()));
        Ok(())
    }
}

impl<F> HttpService for F
where
    F: Fn(&RequestHead) -> Box<dyn Responder>,
{
    fn create_responder(&self, request: &RequestHead) -> Box<dyn Responder> {
        self(request)
    }
}
