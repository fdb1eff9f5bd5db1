//! Wire codecs
//!
//! Each codec is a [`Formatter`] / [`Parser`] pair translating between the
//! value tree and bytes:
//!
//! - **[`binary`]**: compact tagged big-endian encoding
//! - **[`json`]**: RFC 8259 text
//! - **[`xml`]**: the XML-RPC `<value>` grammar
//!
//! Parsers are resumable. They accept input in arbitrary fragments, down to
//! one byte at a time, and keep their continuation state on an explicit frame
//! stack between calls.
//!
//! # Example
//!
//! ```
//! use weftrpc_common::codec::{json::{JsonFormatter, JsonParser}, Formatter, Parser};
//! use weftrpc_common::value::Node;
//!
//! let mut out = Vec::new();
//! JsonFormatter::new().format(&Node::from_value(42), &mut out).unwrap();
//! assert_eq!(out, b"42");
//!
//! let mut parser = JsonParser::new();
//! for chunk in [&b"[1,"[..], &b" 2]"[..]] {
//!     parser.feed(chunk).unwrap();
//! }
//! let node = parser.take().unwrap();
//! assert_eq!(node.len(), 2);
//! ```

pub mod binary;
pub mod json;
pub mod xml;


use crate::protocol::error::{Result, WeftError};
use crate::value::Node;

/// Serializes a value tree depth first, children in insertion order.
pub trait Formatter {
    fn format(&mut self, node: &Node, out: &mut Vec<u8>) -> Result<()>;
}

/// Outcome of [`Parser::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes taken from the input. Less than the input length only when the
    /// document completed early.
    pub consumed: usize,
    pub complete: bool,
}

/// Resumable byte-incremental parser.
pub trait Parser {
    type Output;

    /// Consumes one byte. Returns `true` once the document is complete.
    fn advance(&mut self, byte: u8) -> Result<bool>;

    /// True once a complete document has been parsed and not yet taken.
    fn is_complete(&self) -> bool;

    /// Removes the parsed document. `None` until complete.
    fn take(&mut self) -> Option<Self::Output>;

    /// Discards all continuation state.
    fn reset(&mut self);

    /// Consumes bytes from `data` until the document completes.
    fn feed(&mut self, data: &[u8]) -> Result<Progress> {
        for (i, &byte) in data.iter().enumerate() {
            if self.advance(byte)? {
                return Ok(Progress {
                    consumed: i + 1,
                    complete: true,
                });
            }
        }
        Ok(Progress {
            consumed: data.len(),
            complete: false,
        })
    }

    /// Signals end of input. Fails when the document is incomplete.
    ///
    /// Formats with self-delimiting documents only need the default; JSON
    /// overrides it to terminate a bare top-level number.
    fn finish(&mut self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(WeftError::Protocol("unexpected end of input".into()))
        }
    }
}

/// Formats `node` into a fresh buffer.
pub fn to_bytes<F: Formatter>(formatter: &mut F, node: &Node) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    formatter.format(node, &mut out)?;
    Ok(out)
}

/// Parses one complete document from `data`, ignoring trailing whitespace.
pub fn from_bytes<P: Parser>(parser: &mut P, data: &[u8]) -> Result<P::Output> {
    parser.reset();
    let progress = parser.feed(data)?;
    if !progress.complete {
        parser.finish()?;
    } else if data[progress.consumed..]
        .iter()
        .any(|b| !b.is_ascii_whitespace())
    {
        return Err(WeftError::Protocol("trailing data after document".into()));
    }
    parser
        .take()
        .ok_or_else(|| WeftError::Protocol("unexpected end of input".into()))
}
