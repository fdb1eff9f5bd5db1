//! XML-RPC envelopes
//!
//! ```text
//! <methodCall><methodName>add</methodName>
//!   <params><param><value><int>2</int></value></param>...</params>
//! </methodCall>
//!
//! <methodResponse><params><param><value>...</value></param></params></methodResponse>
//! <methodResponse><fault><value><struct>
//!   faultCode / faultString members
//! </struct></value></fault></methodResponse>
//! ```

use tracing::trace;

use crate::codec::xml::{escape_into, write_value, ValueBuilder, XmlEvent, XmlTokenizer};
use crate::codec::Parser;
use crate::protocol::error::{Result, WeftError};
use crate::protocol::requests::RpcRequest;
use crate::protocol::responses::RpcReply;
use crate::value::Node;

const PROLOG: &[u8] = b"<?xml version=\"1.0\"?>";

pub fn format_call(method: &str, params: &[Node], out: &mut Vec<u8>) {
    out.extend_from_slice(PROLOG);
    out.extend_from_slice(b"<methodCall><methodName>");
    escape_into(method, out);
    out.extend_from_slice(b"</methodName><params>");
    for param in params {
        out.extend_from_slice(b"<param>");
        write_value(param, out);
        out.extend_from_slice(b"</param>");
    }
    out.extend_from_slice(b"</params></methodCall>");
}

pub fn format_response(reply: &RpcReply, out: &mut Vec<u8>) {
    out.extend_from_slice(PROLOG);
    out.extend_from_slice(b"<methodResponse>");
    match reply {
        RpcReply::Success(result) => {
            out.extend_from_slice(b"<params><param>");
            write_value(result, out);
            out.extend_from_slice(b"</param></params>");
        }
        RpcReply::Fault { code, message } => {
            let mut fault = Node::object();
            fault.add_member("faultCode").set_value(*code);
            fault.add_member("faultString").set_value(message.as_str());
            out.extend_from_slice(b"<fault>");
            write_value(&fault, out);
            out.extend_from_slice(b"</fault>");
        }
    }
    out.extend_from_slice(b"</methodResponse>");
}

/// Element structure of one envelope type.
struct Grammar {
    root: &'static str,
    children: fn(&str) -> &'static [&'static str],
    /// Element whose text content is collected
    leaf: &'static str,
}

fn call_children(parent: &str) -> &'static [&'static str] {
    match parent {
        "methodCall" => &["methodName", "params"],
        "params" => &["param"],
        "param" => &["value"],
        _ => &[],
    }
}

fn response_children(parent: &str) -> &'static [&'static str] {
    match parent {
        "methodResponse" => &["params", "fault"],
        "params" => &["param"],
        "param" | "fault" => &["value"],
        _ => &[],
    }
}

static CALL: Grammar = Grammar {
    root: "methodCall",
    children: call_children,
    leaf: "methodName",
};

static RESPONSE: Grammar = Grammar {
    root: "methodResponse",
    children: response_children,
    leaf: "",
};

enum Item {
    Leaf(String),
    /// A value completed inside the named element
    Value(String, Node),
    Closed,
}

/// Walks envelope elements and hands `<value>` subtrees to a [`ValueBuilder`].
struct Envelope {
    grammar: &'static Grammar,
    tokenizer: XmlTokenizer,
    builder: ValueBuilder,
    events: Vec<XmlEvent>,
    path: Vec<String>,
    text: String,
    closed: bool,
}

impl Envelope {
    fn new(grammar: &'static Grammar) -> Self {
        Envelope {
            grammar,
            tokenizer: XmlTokenizer::new(),
            builder: ValueBuilder::new(),
            events: Vec::new(),
            path: Vec::new(),
            text: String::new(),
            closed: false,
        }
    }

    fn reset(&mut self) {
        *self = Envelope::new(self.grammar);
    }

    fn advance(&mut self, byte: u8, items: &mut Vec<Item>) -> Result<()> {
        if self.closed {
            if byte.is_ascii_whitespace() {
                return Ok(());
            }
            return Err(WeftError::Protocol("data after XML-RPC envelope".into()));
        }
        self.tokenizer.advance(byte, &mut self.events)?;
        let events = std::mem::take(&mut self.events);
        for event in events {
            self.handle(event, items)?;
        }
        Ok(())
    }

    fn handle(&mut self, event: XmlEvent, items: &mut Vec<Item>) -> Result<()> {
        if self.closed {
            return Err(WeftError::Protocol("data after XML-RPC envelope".into()));
        }
        if self.builder.is_active() {
            match event {
                XmlEvent::Start(tag) => self.builder.start(&tag)?,
                XmlEvent::Text(text) => self.builder.text(&text)?,
                XmlEvent::End(tag) => {
                    if let Some(node) = self.builder.end(&tag)? {
                        let parent = self.path.last().cloned().unwrap_or_default();
                        items.push(Item::Value(parent, node));
                    }
                }
            }
            return Ok(());
        }
        match event {
            XmlEvent::Start(tag) => {
                let allowed = match self.path.last() {
                    None => tag == self.grammar.root,
                    Some(parent) => (self.grammar.children)(parent).contains(&tag.as_str()),
                };
                if !allowed {
                    return Err(WeftError::Protocol(format!(
                        "unexpected <{}> in XML-RPC {}",
                        tag, self.grammar.root
                    )));
                }
                if tag == "value" {
                    self.builder.start(&tag)?;
                } else {
                    self.text.clear();
                    self.path.push(tag);
                }
            }
            XmlEvent::Text(text) => {
                if self.path.last().map(String::as_str) == Some(self.grammar.leaf) {
                    self.text.push_str(&text);
                } else if !text.trim().is_empty() {
                    return Err(WeftError::Protocol(format!(
                        "unexpected text '{}' in XML-RPC {}",
                        text.trim(),
                        self.grammar.root
                    )));
                }
            }
            XmlEvent::End(tag) => {
                if self.path.last() != Some(&tag) {
                    return Err(WeftError::Protocol(format!("unexpected </{}>", tag)));
                }
                self.path.pop();
                if tag == self.grammar.leaf {
                    items.push(Item::Leaf(std::mem::take(&mut self.text)));
                }
                if self.path.is_empty() {
                    self.closed = true;
                    items.push(Item::Closed);
                }
            }
        }
        Ok(())
    }
}

/// Resumable parser for `<methodCall>` documents.
pub struct XmlRpcCallParser {
    envelope: Envelope,
    items: Vec<Item>,
    method: Option<String>,
    params: Vec<Node>,
    done: bool,
}

impl Default for XmlRpcCallParser {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlRpcCallParser {
    pub fn new() -> Self {
        XmlRpcCallParser {
            envelope: Envelope::new(&CALL),
            items: Vec::new(),
            method: None,
            params: Vec::new(),
            done: false,
        }
    }
}

impl Parser for XmlRpcCallParser {
    type Output = RpcRequest;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        if self.done {
            return Err(WeftError::Protocol("data after XML-RPC call".into()));
        }
        self.envelope.advance(byte, &mut self.items)?;
        for item in self.items.drain(..) {
            match item {
                Item::Leaf(name) => self.method = Some(name.trim().to_string()),
                Item::Value(_, node) => self.params.push(node),
                Item::Closed => {
                    if self.method.is_none() {
                        return Err(WeftError::Protocol("methodCall without methodName".into()));
                    }
                    trace!("XML-RPC call complete");
                    self.done = true;
                }
            }
        }
        Ok(self.done)
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn take(&mut self) -> Option<RpcRequest> {
        if !self.done {
            return None;
        }
        let method = self.method.take().unwrap_or_default();
        let params = std::mem::take(&mut self.params);
        self.reset();
        Some(RpcRequest::new(method, params))
    }

    fn reset(&mut self) {
        self.envelope.reset();
        self.items.clear();
        self.method = None;
        self.params.clear();
        self.done = false;
    }
}

/// Resumable parser for `<methodResponse>` documents.
pub struct XmlRpcResponseParser {
    envelope: Envelope,
    items: Vec<Item>,
    reply: Option<RpcReply>,
    done: bool,
}

impl Default for XmlRpcResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlRpcResponseParser {
    pub fn new() -> Self {
        XmlRpcResponseParser {
            envelope: Envelope::new(&RESPONSE),
            items: Vec::new(),
            reply: None,
            done: false,
        }
    }
}

fn fault_reply(node: &Node) -> Result<RpcReply> {
    let code = node.get_member_value::<i32>("faultCode")?;
    let message = node
        .find_member("faultString")
        .map(|m| m.get_value::<String>())
        .transpose()?
        .unwrap_or_default();
    Ok(RpcReply::Fault { code, message })
}

impl Parser for XmlRpcResponseParser {
    type Output = RpcReply;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        if self.done {
            return Err(WeftError::Protocol("data after XML-RPC response".into()));
        }
        self.envelope.advance(byte, &mut self.items)?;
        for item in self.items.drain(..) {
            match item {
                Item::Leaf(_) => {}
                Item::Value(parent, node) => {
                    if self.reply.is_some() {
                        return Err(WeftError::Protocol(
                            "methodResponse carries more than one value".into(),
                        ));
                    }
                    self.reply = Some(if parent == "fault" {
                        fault_reply(&node)?
                    } else {
                        RpcReply::Success(node)
                    });
                }
                Item::Closed => {
                    if self.reply.is_none() {
                        return Err(WeftError::Protocol("methodResponse without value".into()));
                    }
                    trace!("XML-RPC response complete");
                    self.done = true;
                }
            }
        }
        Ok(self.done)
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn take(&mut self) -> Option<RpcReply> {
        if !self.done {
            return None;
        }
        let reply = self.reply.take();
        self.reset();
        reply
    }

    fn reset(&mut self) {
        self.envelope.reset();
        self.items.clear();
        self.reply = None;
        self.done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::from_bytes;

    #[test]
    fn test_call_roundtrip() {
        let mut out = Vec::new();
        format_call("add", &[Node::from_value(2), Node::from_value("x")], &mut out);
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\"?><methodCall><methodName>add</methodName>"));

        let request = from_bytes(&mut XmlRpcCallParser::new(), &out).unwrap();
        assert_eq!(request.method, "add");
        assert_eq!(request.params.len(), 2);
        assert_eq!(request.params[0].get_value::<i32>().unwrap(), 2);
        assert_eq!(request.params[1].get_value::<String>().unwrap(), "x");
    }

    #[test]
    fn test_call_with_whitespace_and_no_params() {
        let doc = "<?xml version=\"1.0\"?>\n<methodCall>\n  <methodName> ping </methodName>\n</methodCall>\n";
        let request = from_bytes(&mut XmlRpcCallParser::new(), doc.as_bytes()).unwrap();
        assert_eq!(request.method, "ping");
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_response_success_and_fault() {
        let mut out = Vec::new();
        format_response(&RpcReply::success(Node::from_value(5)), &mut out);
        let reply = from_bytes(&mut XmlRpcResponseParser::new(), &out).unwrap();
        assert_eq!(reply.into_result().unwrap().get_value::<i32>().unwrap(), 5);

        let mut out = Vec::new();
        format_response(&RpcReply::fault(4, "Too many parameters"), &mut out);
        let reply = from_bytes(&mut XmlRpcResponseParser::new(), &out).unwrap();
        assert_eq!(reply, RpcReply::fault(4, "Too many parameters"));
    }

    #[test]
    fn test_envelope_errors() {
        assert!(from_bytes(&mut XmlRpcCallParser::new(), b"<methodResponse/>").is_err());
        assert!(from_bytes(
            &mut XmlRpcCallParser::new(),
            b"<methodCall><params></params></methodCall>"
        )
        .is_err());
        assert!(from_bytes(
            &mut XmlRpcResponseParser::new(),
            b"<methodResponse><params></params></methodResponse>"
        )
        .is_err());
        assert!(from_bytes(
            &mut XmlRpcCallParser::new(),
            b"<methodCall><methodName>a</methodName><bogus/></methodCall>"
        )
        .is_err());
    }

    #[test]
    fn test_call_fragmentation() {
        let mut out = Vec::new();
        let mut param = Node::new();
        param.add_member("k").set_value(1);
        format_call("f", &[param.clone()], &mut out);
        let mut parser = XmlRpcCallParser::new();
        let mut complete = false;
        for &b in &out {
            complete = parser.advance(b).unwrap();
        }
        assert!(complete);
        let request = parser.take().unwrap();
        assert_eq!(request.params, vec![param]);
    }
}
