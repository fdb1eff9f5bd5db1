//! Wire protocols spoken by the client
//!
//! Requests are encoded in one piece. Replies are decoded incrementally by a
//! [`ReplyReader`], which undoes HTTP framing where needed and feeds the
//! payload into the matching resumable parser.

use tracing::trace;
use weftrpc_common::codec::json::{JsonFormatter, JsonParser};
use weftrpc_common::codec::{Formatter, Parser};
use weftrpc_common::http::{ChunkedDecoder, ReplyHead, ReplyParser, RequestHead};
use weftrpc_common::protocol::binrpc::{self, BinaryReplyParser};
use weftrpc_common::protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use weftrpc_common::protocol::xmlrpc::{self, XmlRpcResponseParser};
use weftrpc_common::{Node, Result, RpcReply, WeftError};

/// Protocol and framing used to reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientProtocol {
    /// Binary envelopes on raw TCP
    Binary,
    /// JSON-RPC 2.0 objects on raw TCP
    Json,
    /// JSON-RPC 2.0 `POST`ed to `path`
    JsonHttp { path: String },
    /// XML-RPC `POST`ed to `path`
    XmlHttp { path: String },
}

impl ClientProtocol {
    pub fn is_http(&self) -> bool {
        matches!(self, ClientProtocol::JsonHttp { .. } | ClientProtocol::XmlHttp { .. })
    }
}

/// Appends the complete request for `method` to `out`.
pub(crate) fn encode_request(
    protocol: &ClientProtocol,
    host: &str,
    method: &str,
    params: &[Node],
    id: i64,
    out: &mut Vec<u8>,
) -> Result<()> {
    match protocol {
        ClientProtocol::Binary => binrpc::format_request(method, params, out),
        ClientProtocol::Json => {
            let request = JsonRpcRequest::new(method, params.to_vec(), id);
            JsonFormatter::new().format(&request.to_node(), out)
        }
        ClientProtocol::JsonHttp { path } => {
            let request = JsonRpcRequest::new(method, params.to_vec(), id);
            let mut body = Vec::new();
            JsonFormatter::new().format(&request.to_node(), &mut body)?;
            write_post(path, host, "application/json", &body, out);
            Ok(())
        }
        ClientProtocol::XmlHttp { path } => {
            let mut body = Vec::new();
            xmlrpc::format_call(method, params, &mut body);
            write_post(path, host, "text/xml", &body, out);
            Ok(())
        }
    }
}

fn write_post(path: &str, host: &str, content_type: &str, body: &[u8], out: &mut Vec<u8>) {
    let mut head = RequestHead::new("POST", path);
    head.headers.set("Host", host);
    head.headers.set("Content-Type", content_type);
    head.headers.set("Content-Length", body.len().to_string());
    head.write_to(out);
    out.extend_from_slice(body);
}

enum Payload {
    Binary(BinaryReplyParser),
    Json(JsonParser),
    Xml(XmlRpcResponseParser),
}

impl Payload {
    fn feed(&mut self, data: &[u8]) -> Result<(usize, bool)> {
        let progress = match self {
            Payload::Binary(p) => p.feed(data)?,
            Payload::Json(p) => p.feed(data)?,
            Payload::Xml(p) => p.feed(data)?,
        };
        Ok((progress.consumed, progress.complete))
    }

    fn finish(&mut self) -> Result<()> {
        match self {
            Payload::Binary(p) => p.finish(),
            Payload::Json(p) => p.finish(),
            Payload::Xml(p) => p.finish(),
        }
    }

    fn is_complete(&self) -> bool {
        match self {
            Payload::Binary(p) => p.is_complete(),
            Payload::Json(p) => p.is_complete(),
            Payload::Xml(p) => p.is_complete(),
        }
    }

    /// The decoded reply. JSON-RPC replies must answer request `id`.
    fn take(&mut self, id: i64) -> Result<RpcReply> {
        let missing = || WeftError::Protocol("incomplete reply".into());
        match self {
            Payload::Binary(p) => p.take().ok_or_else(missing),
            Payload::Xml(p) => p.take().ok_or_else(missing),
            Payload::Json(p) => {
                let node = p.take().ok_or_else(missing)?;
                let response = JsonRpcResponse::from_node(&node)?;
                if response.id.get_value::<i64>().ok() != Some(id) {
                    return Err(WeftError::Protocol(format!(
                        "reply id {} does not match request id {}",
                        response.id.scalar(), id
                    )));
                }
                Ok(response.into_reply())
            }
        }
    }
}

enum Body {
    Length(usize),
    Chunked(ChunkedDecoder),
    UntilClose,
}

enum Framing {
    Raw,
    Http {
        header: ReplyParser,
        head: Option<ReplyHead>,
        body: Option<Body>,
    },
}

/// Incremental decoder for one reply.
pub(crate) struct ReplyReader {
    framing: Framing,
    payload: Payload,
    id: i64,
    complete: bool,
}

impl ReplyReader {
    pub(crate) fn new(protocol: &ClientProtocol, id: i64) -> Self {
        let payload = match protocol {
            ClientProtocol::Binary => Payload::Binary(BinaryReplyParser::new()),
            ClientProtocol::Json | ClientProtocol::JsonHttp { .. } => {
                Payload::Json(JsonParser::new())
            }
            ClientProtocol::XmlHttp { .. } => Payload::Xml(XmlRpcResponseParser::new()),
        };
        let framing = if protocol.is_http() {
            Framing::Http {
                header: ReplyParser::default(),
                head: None,
                body: None,
            }
        } else {
            Framing::Raw
        };
        ReplyReader {
            framing,
            payload,
            id,
            complete: false,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    /// False when the connection cannot carry another call after this reply.
    pub(crate) fn keep_alive(&self) -> bool {
        match &self.framing {
            Framing::Raw => true,
            Framing::Http { head, body, .. } => {
                head.as_ref().is_some_and(|h| h.keep_alive())
                    && !matches!(body, Some(Body::UntilClose))
            }
        }
    }

    /// Consumes reply bytes from `data`. Returns how many were used; bytes
    /// after a complete reply are left alone.
    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<usize> {
        let mut used = 0;
        while !self.complete && used < data.len() {
            let rest = &data[used..];
            used += match &mut self.framing {
                Framing::Raw => {
                    let (n, complete) = self.payload.feed(rest)?;
                    self.complete = complete;
                    n
                }
                Framing::Http { header, head, body } => match body {
                    None => {
                        let progress = header.feed(rest)?;
                        if let Some(reply) = header.take() {
                            trace!("reply header: {} {}", reply.status, reply.reason);
                            let framing = body_framing(&reply)?;
                            self.complete = matches!(framing, Body::Length(0));
                            *body = Some(framing);
                            *head = Some(reply);
                        }
                        progress.consumed
                    }
                    Some(framing) => {
                        let ok = head.as_ref().is_some_and(|h| (200..300).contains(&h.status));
                        let (n, done) = feed_body(framing, rest, ok, &mut self.payload)?;
                        self.complete = done;
                        n
                    }
                },
            };
        }
        Ok(used)
    }

    /// Handles end of stream. Only a body delimited by the connection close
    /// may end here.
    pub(crate) fn finish_eof(&mut self) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        if let Framing::Http {
            body: Some(Body::UntilClose),
            ..
        } = &self.framing
        {
            self.complete = true;
            return Ok(());
        }
        Err(WeftError::Transport("connection closed before reply was complete".into()))
    }

    /// The call outcome. Faults become [`WeftError::Remote`].
    pub(crate) fn take(&mut self) -> Result<Node> {
        if let Framing::Http { head: Some(head), .. } = &self.framing {
            if !(200..300).contains(&head.status) {
                return Err(WeftError::Protocol(format!(
                    "HTTP error {} {}",
                    head.status, head.reason
                )));
            }
        }
        if !self.payload.is_complete() {
            self.payload.finish()?;
        }
        self.payload.take(self.id)?.into_result()
    }
}

fn body_framing(head: &ReplyHead) -> Result<Body> {
    if head.headers.is_chunked() {
        return Ok(Body::Chunked(ChunkedDecoder::new()));
    }
    if head.status == 204 || head.status == 304 || head.status < 200 {
        return Ok(Body::Length(0));
    }
    Ok(match head.headers.content_length()? {
        Some(length) => Body::Length(length),
        None => Body::UntilClose,
    })
}

/// Routes body bytes to the payload parser, or drops them for error
/// replies. Returns bytes used and whether the body ended.
fn feed_body(body: &mut Body, data: &[u8], deliver: bool, payload: &mut Payload) -> Result<(usize, bool)> {
    let mut deliver_bytes = |bytes: &[u8]| -> Result<()> {
        if !deliver || bytes.is_empty() {
            return Ok(());
        }
        let rest = if payload.is_complete() {
            bytes
        } else {
            let (n, _) = payload.feed(bytes)?;
            &bytes[n..]
        };
        if rest.iter().any(|b| !b.is_ascii_whitespace()) {
            return Err(WeftError::Protocol("trailing data after reply document".into()));
        }
        Ok(())
    };
    match body {
        Body::Length(remaining) => {
            let n = (*remaining).min(data.len());
            deliver_bytes(&data[..n])?;
            *remaining -= n;
            Ok((n, *remaining == 0))
        }
        Body::Chunked(decoder) => {
            let mut out = Vec::new();
            let progress = decoder.decode(data, &mut out)?;
            deliver_bytes(&out)?;
            Ok((progress.consumed, progress.complete))
        }
        Body::UntilClose => {
            deliver_bytes(data)?;
            Ok((data.len(), false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut ReplyReader, data: &[u8], fragment: usize) -> usize {
        let mut used = 0;
        for chunk in data.chunks(fragment) {
            if reader.is_complete() {
                break;
            }
            used += reader.feed(chunk).unwrap();
        }
        used
    }

    #[test]
    fn test_binary_reply_bytewise() {
        let mut data = Vec::new();
        binrpc::format_reply(&RpcReply::success(Node::from_value(5)), &mut data).unwrap();
        data.extend_from_slice(b"next");
        let mut reader = ReplyReader::new(&ClientProtocol::Binary, 0);
        let mut used = 0;
        while !reader.is_complete() {
            used += reader.feed(&data[used..used + 1]).unwrap();
        }
        assert_eq!(&data[used..], b"next");
        assert_eq!(reader.take().unwrap().get_value::<i32>().unwrap(), 5);
        assert!(reader.keep_alive());
    }

    #[test]
    fn test_json_id_mismatch() {
        let mut reader = ReplyReader::new(&ClientProtocol::Json, 7);
        reader.feed(br#"{"jsonrpc":"2.0","result":1,"id":8}"#).unwrap();
        assert!(reader.is_complete());
        assert!(matches!(reader.take(), Err(WeftError::Protocol(_))));
    }

    #[test]
    fn test_json_fault_is_remote() {
        let mut reader = ReplyReader::new(&ClientProtocol::Json, 1);
        reader
            .feed(br#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":1}"#)
            .unwrap();
        match reader.take() {
            Err(WeftError::Remote { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_http_content_length() {
        let body = br#"{"jsonrpc":"2.0","result":"ok","id":3}"#;
        let mut data = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        data.extend_from_slice(body);
        let protocol = ClientProtocol::JsonHttp { path: "/rpc".into() };
        for fragment in [1, 5, data.len()] {
            let mut reader = ReplyReader::new(&protocol, 3);
            assert_eq!(read_all(&mut reader, &data, fragment), data.len());
            assert!(reader.is_complete());
            assert!(reader.keep_alive());
            assert_eq!(reader.take().unwrap().get_value::<String>().unwrap(), "ok");
        }
    }

    #[test]
    fn test_http_trailing_body_data_rejected() {
        let protocol = ClientProtocol::JsonHttp { path: "/rpc".into() };
        for tail in [&b" \r\n"[..], &b" x"[..]] {
            let mut body = br#"{"jsonrpc":"2.0","result":1,"id":3}"#.to_vec();
            body.extend_from_slice(tail);
            let mut data = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
            data.extend_from_slice(&body);

            // Byte at a time, so the tail arrives after the document completed.
            let mut reader = ReplyReader::new(&protocol, 3);
            let fed: Result<Vec<usize>> = data.chunks(1).map(|b| reader.feed(b)).collect();
            if tail == &b" x"[..] {
                assert!(matches!(fed, Err(WeftError::Protocol(_))), "{:?}", fed);
            } else {
                fed.unwrap();
                assert_eq!(reader.take().unwrap().get_value::<i64>().unwrap(), 1);
            }
        }
    }

    #[test]
    fn test_http_chunked_xml() {
        let mut xml = Vec::new();
        xmlrpc::format_response(&RpcReply::success(Node::from_value(42)), &mut xml);
        let (a, b) = xml.split_at(10);
        let mut data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for part in [a, b] {
            data.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
            data.extend_from_slice(part);
            data.extend_from_slice(b"\r\n");
        }
        data.extend_from_slice(b"0\r\n\r\n");
        let mut reader = ReplyReader::new(&ClientProtocol::XmlHttp { path: "/RPC2".into() }, 0);
        assert_eq!(read_all(&mut reader, &data, 3), data.len());
        assert_eq!(reader.take().unwrap().get_value::<i32>().unwrap(), 42);
    }

    #[test]
    fn test_http_until_close() {
        let mut reader = ReplyReader::new(&ClientProtocol::JsonHttp { path: "/".into() }, 1);
        reader
            .feed(b"HTTP/1.0 200 OK\r\n\r\n{\"jsonrpc\":\"2.0\",\"result\":true,\"id\":1}")
            .unwrap();
        assert!(!reader.is_complete());
        reader.finish_eof().unwrap();
        assert!(!reader.keep_alive());
        assert!(reader.take().unwrap().get_value::<bool>().unwrap());
    }

    #[test]
    fn test_http_error_status() {
        let mut reader = ReplyReader::new(&ClientProtocol::JsonHttp { path: "/".into() }, 1);
        reader
            .feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found")
            .unwrap();
        assert!(reader.is_complete());
        let err = reader.take().unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_eof_mid_reply() {
        let mut reader = ReplyReader::new(&ClientProtocol::Binary, 0);
        reader.feed(&[binrpc::RESULT_MARK]).unwrap();
        assert!(reader.finish_eof().unwrap_err().is_transport());
    }

    #[test]
    fn test_encode_http_request() {
        let mut out = Vec::new();
        let protocol = ClientProtocol::JsonHttp { path: "/jsonrpc".into() };
        encode_request(&protocol, "localhost:7002", "add", &[Node::from_value(1)], 9, &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /jsonrpc HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost:7002\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.ends_with(r#"{"jsonrpc":"2.0","method":"add","params":[1],"id":9}"#));
    }
}
