//! RPC responders for the HTTP engine
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 over `POST`
//! - [`xmlrpc`]: XML-RPC over `POST`
//!
//! Both stream the request body into a resumable parser as it arrives, so
//! no request document is ever buffered whole.

pub mod jsonrpc;
pub mod xmlrpc;

use weftrpc_common::codec::Parser;
use weftrpc_common::{Result, WeftError};

pub use jsonrpc::{JsonRpcResponder, JsonRpcService};
pub use xmlrpc::{XmlRpcResponder, XmlRpcService};

/// Feeds body fragments into a document parser.
///
/// Once the document is complete only whitespace may follow. The first
/// failure is kept and later fragments are ignored, so the responder can
/// still answer with a protocol-level error reply.
#[derive(Debug)]
pub(crate) struct BodyDocument<P: Parser> {
    parser: P,
    error: Option<WeftError>,
}

impl<P: Parser> BodyDocument<P> {
    pub(crate) fn new(parser: P) -> Self {
        BodyDocument {
            parser,
            error: None,
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        if self.error.is_some() {
            return;
        }
        let data = if self.parser.is_complete() {
            data
        } else {
            match self.parser.feed(data) {
                Ok(progress) => &data[progress.consumed..],
                Err(e) => {
                    self.error = Some(e);
                    return;
                }
            }
        };
        if data.iter().any(|b| !b.is_ascii_whitespace()) {
            self.error = Some(WeftError::Protocol("trailing data after document".into()));
        }
    }

    /// Ends the body and yields the parsed document.
    pub(crate) fn finish(&mut self) -> Result<P::Output> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.parser.finish()?;
        self.parser
            .take()
            .ok_or_else(|| WeftError::Protocol("empty request body".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftrpc_common::codec::json::JsonParser;
    use weftrpc_common::FromNode;

    #[test]
    fn test_fragments_and_trailing_whitespace() {
        let mut doc = BodyDocument::new(JsonParser::new());
        doc.feed(b"{\"a\":");
        doc.feed(b" [1, 2]}\r\n");
        doc.feed(b"  ");
        let node = doc.finish().unwrap();
        let a = Vec::<i64>::from_node(node.get_member("a").unwrap()).unwrap();
        assert_eq!(a, vec![1, 2]);
    }

    #[test]
    fn test_bare_number_needs_finish() {
        let mut doc = BodyDocument::new(JsonParser::new());
        doc.feed(b"12");
        doc.feed(b"3");
        assert_eq!(doc.finish().unwrap().get_value::<i64>().unwrap(), 123);
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut doc = BodyDocument::new(JsonParser::new());
        doc.feed(b"[1] x");
        assert!(matches!(doc.finish(), Err(WeftError::Protocol(_))));
    }

    #[test]
    fn test_first_error_is_kept() {
        let mut doc = BodyDocument::new(JsonParser::new());
        doc.feed(b"[1,,");
        doc.feed(b"2]");
        assert!(doc.finish().is_err());
    }

    #[test]
    fn test_empty_body() {
        let mut doc = BodyDocument::new(JsonParser::new());
        assert!(doc.finish().is_err());
    }
}
