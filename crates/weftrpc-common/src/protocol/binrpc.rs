//! Binary RPC envelopes
//!
//! ```text
//! request: [0xC0][name: u16 len + utf8][param count u32][param node]*
//! result:  [0xC1][result node]
//! fault:   [0xC2][code i32][message: u32 len + utf8]
//! ```
//!
//! Nodes use the binary codec. The request parser can discard parameters
//! beyond what the target procedure accepts without decoding them.

use std::fmt;

use tracing::trace;

use crate::codec::binary::{write_long_bytes, write_short_str, BinaryFormatter, BinaryParser};
use crate::codec::{Formatter, Parser};
use crate::protocol::error::{Result, WeftError};
use crate::protocol::requests::RpcRequest;
use crate::protocol::responses::RpcReply;
use crate::value::Node;

pub const REQUEST_MARK: u8 = 0xC0;
pub const RESULT_MARK: u8 = 0xC1;
pub const FAULT_MARK: u8 = 0xC2;

pub fn format_request(method: &str, params: &[Node], out: &mut Vec<u8>) -> Result<()> {
    out.push(REQUEST_MARK);
    write_short_str(out, method)?;
    let count = u32::try_from(params.len())
        .map_err(|_| WeftError::Protocol("too many parameters".into()))?;
    out.extend_from_slice(&count.to_be_bytes());
    let mut formatter = BinaryFormatter::new();
    for param in params {
        formatter.format(param, out)?;
    }
    Ok(())
}

pub fn format_reply(reply: &RpcReply, out: &mut Vec<u8>) -> Result<()> {
    match reply {
        RpcReply::Success(node) => {
            out.push(RESULT_MARK);
            BinaryFormatter::new().format(node, out)
        }
        RpcReply::Fault { code, message } => {
            out.push(FAULT_MARK);
            out.extend_from_slice(&code.to_be_bytes());
            write_long_bytes(out, message.as_bytes())
        }
    }
}

/// Fixed-size field accumulator shared by the envelope parsers.
#[derive(Debug, Default)]
struct Field {
    need: usize,
    buf: Vec<u8>,
}

impl Field {
    fn expect(&mut self, need: usize) {
        self.need = need;
        self.buf.clear();
    }

    /// Appends `byte`; true once the field is complete.
    fn push(&mut self, byte: u8) -> bool {
        self.buf.push(byte);
        self.buf.len() == self.need
    }

    fn be_u16(&self) -> usize {
        usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]))
    }

    fn be_u32(&self) -> u32 {
        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
    }

    fn text(&mut self) -> Result<String> {
        String::from_utf8(std::mem::take(&mut self.buf))
            .map_err(|e| WeftError::Protocol(format!("invalid UTF-8 in binary envelope: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStep {
    Mark,
    NameLen,
    Name,
    Count,
    Params,
    Done,
}

/// Looks up how many parameters a method accepts. `None` keeps all of them.
pub type ArityLookup = Box<dyn Fn(&str) -> Option<usize>>;

/// Resumable parser for binary requests.
pub struct BinaryRequestParser {
    step: RequestStep,
    field: Field,
    method: String,
    remaining: u32,
    keep: usize,
    params: Vec<Node>,
    node: BinaryParser,
    arity: Option<ArityLookup>,
}

impl fmt::Debug for BinaryRequestParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryRequestParser")
            .field("step", &self.step)
            .field("method", &self.method)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Default for BinaryRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryRequestParser {
    pub fn new() -> Self {
        BinaryRequestParser {
            step: RequestStep::Mark,
            field: Field::default(),
            method: String::new(),
            remaining: 0,
            keep: usize::MAX,
            params: Vec::new(),
            node: BinaryParser::new(),
            arity: None,
        }
    }

    /// Parameters beyond the arity reported by `lookup` are skipped.
    pub fn with_arity_lookup(mut self, lookup: ArityLookup) -> Self {
        self.arity = Some(lookup);
        self
    }

    fn begin_param(&mut self) {
        let skip = self.params.len() >= self.keep;
        self.node.set_skip(skip);
        if skip {
            trace!("skipping surplus parameter of '{}'", self.method);
        }
    }

    fn params_ready(&mut self) {
        if self.remaining == 0 {
            self.step = RequestStep::Done;
        } else {
            self.step = RequestStep::Params;
            self.begin_param();
        }
    }
}

impl Parser for BinaryRequestParser {
    type Output = RpcRequest;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        match self.step {
            RequestStep::Mark => {
                if byte != REQUEST_MARK {
                    return Err(WeftError::Protocol(format!(
                        "expected binary request marker, got 0x{:02x}",
                        byte
                    )));
                }
                self.step = RequestStep::NameLen;
                self.field.expect(2);
            }
            RequestStep::NameLen => {
                if self.field.push(byte) {
                    let len = self.field.be_u16();
                    if len == 0 {
                        return Err(WeftError::Protocol("empty method name".into()));
                    }
                    self.step = RequestStep::Name;
                    self.field.expect(len);
                }
            }
            RequestStep::Name => {
                if self.field.push(byte) {
                    self.method = self.field.text()?;
                    self.keep = self
                        .arity
                        .as_ref()
                        .and_then(|lookup| lookup(&self.method))
                        .unwrap_or(usize::MAX);
                    self.step = RequestStep::Count;
                    self.field.expect(4);
                }
            }
            RequestStep::Count => {
                if self.field.push(byte) {
                    self.remaining = self.field.be_u32();
                    self.params_ready();
                }
            }
            RequestStep::Params => {
                if self.node.advance(byte)? {
                    let node = self.node.take().unwrap_or_default();
                    if !self.node.is_skipping() {
                        self.params.push(node);
                    }
                    self.remaining -= 1;
                    self.params_ready();
                }
            }
            RequestStep::Done => {
                return Err(WeftError::Protocol("data after complete binary request".into()))
            }
        }
        Ok(self.step == RequestStep::Done)
    }

    fn is_complete(&self) -> bool {
        self.step == RequestStep::Done
    }

    fn take(&mut self) -> Option<RpcRequest> {
        if self.step != RequestStep::Done {
            return None;
        }
        let request = RpcRequest::new(
            std::mem::take(&mut self.method),
            std::mem::take(&mut self.params),
        );
        self.reset();
        Some(request)
    }

    fn reset(&mut self) {
        self.step = RequestStep::Mark;
        self.field = Field::default();
        self.method.clear();
        self.remaining = 0;
        self.keep = usize::MAX;
        self.params.clear();
        self.node = BinaryParser::new();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyStep {
    Mark,
    Result,
    FaultCode,
    FaultLen,
    FaultMessage,
    Done,
}

/// Resumable parser for binary replies.
#[derive(Debug)]
pub struct BinaryReplyParser {
    step: ReplyStep,
    field: Field,
    code: i32,
    node: BinaryParser,
    reply: Option<RpcReply>,
}

impl Default for BinaryReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryReplyParser {
    pub fn new() -> Self {
        BinaryReplyParser {
            step: ReplyStep::Mark,
            field: Field::default(),
            code: 0,
            node: BinaryParser::new(),
            reply: None,
        }
    }

    fn fault_done(&mut self) -> Result<()> {
        let message = self.field.text()?;
        self.reply = Some(RpcReply::Fault {
            code: self.code,
            message,
        });
        self.step = ReplyStep::Done;
        Ok(())
    }
}

impl Parser for BinaryReplyParser {
    type Output = RpcReply;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        match self.step {
            ReplyStep::Mark => match byte {
                RESULT_MARK => self.step = ReplyStep::Result,
                FAULT_MARK => {
                    self.step = ReplyStep::FaultCode;
                    self.field.expect(4);
                }
                other => {
                    return Err(WeftError::Protocol(format!(
                        "expected binary reply marker, got 0x{:02x}",
                        other
                    )))
                }
            },
            ReplyStep::Result => {
                if self.node.advance(byte)? {
                    self.reply = self.node.take().map(RpcReply::Success);
                    self.step = ReplyStep::Done;
                }
            }
            ReplyStep::FaultCode => {
                if self.field.push(byte) {
                    self.code = self.field.be_u32() as i32;
                    self.step = ReplyStep::FaultLen;
                    self.field.expect(4);
                }
            }
            ReplyStep::FaultLen => {
                if self.field.push(byte) {
                    let len = self.field.be_u32() as usize;
                    self.field.expect(len);
                    if len == 0 {
                        self.fault_done()?;
                    } else {
                        self.step = ReplyStep::FaultMessage;
                    }
                }
            }
            ReplyStep::FaultMessage => {
                if self.field.push(byte) {
                    self.fault_done()?;
                }
            }
            ReplyStep::Done => {
                return Err(WeftError::Protocol("data after complete binary reply".into()))
            }
        }
        Ok(self.step == ReplyStep::Done)
    }

    fn is_complete(&self) -> bool {
        self.step == ReplyStep::Done
    }

    fn take(&mut self) -> Option<RpcReply> {
        if self.step != ReplyStep::Done {
            return None;
        }
        let reply = self.reply.take();
        self.reset();
        reply
    }

    fn reset(&mut self) {
        *self = BinaryReplyParser::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::from_bytes;

    fn request_bytes(method: &str, params: &[Node]) -> Vec<u8> {
        let mut out = Vec::new();
        format_request(method, params, &mut out).unwrap();
        out
    }

    #[test]
    fn test_request_layout() {
        let bytes = request_bytes("add", &[]);
        assert_eq!(bytes, vec![0xC0, 0, 3, b'a', b'd', b'd', 0, 0, 0, 0]);
    }

    #[test]
    fn test_request_roundtrip() {
        let params = vec![Node::from_value(2), Node::from_value(3)];
        let bytes = request_bytes("add", &params);
        let request = from_bytes(&mut BinaryRequestParser::new(), &bytes).unwrap();
        assert_eq!(request.method, "add");
        assert_eq!(request.params, params);
    }

    #[test]
    fn test_surplus_params_skipped() {
        let mut big = Node::new();
        big.add_member("blob").set_value(vec![7u8; 64]);
        let params = vec![Node::from_value(1), big, Node::from_value("x")];
        let bytes = request_bytes("one", &params);

        let mut parser = BinaryRequestParser::new()
            .with_arity_lookup(Box::new(|m| if m == "one" { Some(1) } else { None }));
        let progress = parser.feed(&bytes).unwrap();
        assert!(progress.complete);
        assert_eq!(progress.consumed, bytes.len());
        let request = parser.take().unwrap();
        assert_eq!(request.params, vec![Node::from_value(1)]);
    }

    #[test]
    fn test_unknown_method_keeps_params() {
        let params = vec![Node::from_value(1), Node::from_value(2)];
        let bytes = request_bytes("other", &params);
        let mut parser = BinaryRequestParser::new().with_arity_lookup(Box::new(|_| None));
        let request = from_bytes(&mut parser, &bytes).unwrap();
        assert_eq!(request.params.len(), 2);
    }

    #[test]
    fn test_back_to_back_requests() {
        let mut bytes = request_bytes("a", &[Node::from_value(1)]);
        bytes.extend(request_bytes("b", &[]));
        let mut parser = BinaryRequestParser::new();
        let first = parser.feed(&bytes).unwrap();
        assert!(first.complete);
        assert_eq!(parser.take().unwrap().method, "a");
        let second = parser.feed(&bytes[first.consumed..]).unwrap();
        assert!(second.complete);
        assert_eq!(parser.take().unwrap().method, "b");
    }

    #[test]
    fn test_reply_roundtrip() {
        let mut out = Vec::new();
        format_reply(&RpcReply::success(Node::from_value(5)), &mut out).unwrap();
        assert_eq!(out[0], RESULT_MARK);
        let reply = from_bytes(&mut BinaryReplyParser::new(), &out).unwrap();
        assert_eq!(reply.into_result().unwrap().get_value::<i32>().unwrap(), 5);

        let mut out = Vec::new();
        format_reply(&RpcReply::fault(-3, "bad"), &mut out).unwrap();
        assert_eq!(&out[..5], &[FAULT_MARK, 0xff, 0xff, 0xff, 0xfd]);
        let reply = from_bytes(&mut BinaryReplyParser::new(), &out).unwrap();
        assert_eq!(reply, RpcReply::fault(-3, "bad"));

        let mut out = Vec::new();
        format_reply(&RpcReply::fault(1, ""), &mut out).unwrap();
        let reply = from_bytes(&mut BinaryReplyParser::new(), &out).unwrap();
        assert_eq!(reply, RpcReply::fault(1, ""));
    }

    #[test]
    fn test_bad_marker() {
        assert!(BinaryRequestParser::new().advance(0x00).is_err());
        assert!(BinaryReplyParser::new().advance(0xC0).is_err());
    }
}
