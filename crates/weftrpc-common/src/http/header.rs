//! Incremental HTTP/1.x message header parsing

use std::fmt;

use tracing::trace;

use crate::codec::Parser;
use crate::protocol::error::{Result, WeftError};

/// Default limit on the size of a message header.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

/// Ordered header fields with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every field named `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Sets `name` unless a field of that name already exists.
    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.entries.push((name.to_string(), value.into()));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// True if the comma separated field `name` lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn last_mut(&mut self) -> Option<&mut (String, String)> {
        self.entries.last_mut()
    }

    /// Parsed `Content-Length`, `None` when absent.
    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.get("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| WeftError::Protocol(format!("invalid Content-Length '{}'", v))),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.has_token("Transfer-Encoding", "chunked")
    }
}

/// HTTP version as (major, minor).
pub type Version = (u8, u8);

fn parse_version(s: &str) -> Result<Version> {
    let invalid = || WeftError::Protocol(format!("invalid HTTP version '{}'", s));
    let rest = s.strip_prefix("HTTP/").ok_or_else(invalid)?;
    let (major, minor) = rest.split_once('.').ok_or_else(invalid)?;
    Ok((
        major.parse().map_err(|_| invalid())?,
        minor.parse().map_err(|_| invalid())?,
    ))
}

/// Start line and fields of a parsed message.
pub trait MessageHead: Default {
    fn parse_start_line(&mut self, line: &str) -> Result<()>;
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path plus optional query string
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl Default for RequestHead {
    fn default() -> Self {
        RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version: (1, 1),
            headers: HeaderMap::new(),
        }
    }
}

impl RequestHead {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        RequestHead {
            method: method.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("")
    }

    pub fn query(&self) -> &str {
        self.target.split_once('?').map_or("", |(_, q)| q)
    }

    /// HTTP/1.1 keeps the connection unless told to close; HTTP/1.0 only
    /// with an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.version >= (1, 1) {
            !self.headers.has_token("Connection", "close")
        } else {
            self.headers.has_token("Connection", "keep-alive")
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(
            format!(
                "{} {} HTTP/{}.{}\r\n",
                self.method, self.target, self.version.0, self.version.1
            )
            .as_bytes(),
        );
        write_fields(&self.headers, out);
    }
}

impl MessageHead for RequestHead {
    fn parse_start_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(WeftError::Protocol(format!("invalid request line '{}'", line)));
        };
        self.method = method.to_string();
        self.target = target.to_string();
        self.version = parse_version(version)?;
        Ok(())
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl Default for ReplyHead {
    fn default() -> Self {
        ReplyHead {
            version: (1, 1),
            status: 200,
            reason: "OK".into(),
            headers: HeaderMap::new(),
        }
    }
}

impl ReplyHead {
    pub fn set_status(&mut self, status: u16, reason: impl Into<String>) {
        self.status = status;
        self.reason = reason.into();
    }

    /// False when the peer announced `Connection: close` or speaks HTTP/1.0
    /// without `keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.version >= (1, 1) {
            !self.headers.has_token("Connection", "close")
        } else {
            self.headers.has_token("Connection", "keep-alive")
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(
            format!(
                "HTTP/{}.{} {} {}\r\n",
                self.version.0, self.version.1, self.status, self.reason
            )
            .as_bytes(),
        );
        write_fields(&self.headers, out);
    }
}

impl MessageHead for ReplyHead {
    fn parse_start_line(&mut self, line: &str) -> Result<()> {
        let invalid = || WeftError::Protocol(format!("invalid status line '{}'", line));
        let (version, rest) = line.split_once(' ').ok_or_else(invalid)?;
        let rest = rest.trim_start();
        let (status, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        self.version = parse_version(version)?;
        self.status = status.parse().map_err(|_| invalid())?;
        self.reason = reason.trim().to_string();
        Ok(())
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

fn write_fields(headers: &HeaderMap, out: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Resumable header parser.
///
/// Accepts CRLF or bare LF line ends, folded continuation lines and leading
/// empty lines before the start line.
pub struct HeaderParser<H: MessageHead> {
    head: H,
    line: Vec<u8>,
    size: usize,
    max_size: usize,
    started: bool,
    done: bool,
}

pub type RequestParser = HeaderParser<RequestHead>;
pub type ReplyParser = HeaderParser<ReplyHead>;

impl<H: MessageHead> fmt::Debug for HeaderParser<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderParser")
            .field("size", &self.size)
            .field("started", &self.started)
            .field("done", &self.done)
            .finish()
    }
}

impl<H: MessageHead> Default for HeaderParser<H> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_SIZE)
    }
}

impl<H: MessageHead> HeaderParser<H> {
    pub fn new(max_size: usize) -> Self {
        HeaderParser {
            head: H::default(),
            line: Vec::new(),
            size: 0,
            max_size,
            started: false,
            done: false,
        }
    }

    /// The head parsed so far.
    pub fn head(&self) -> &H {
        &self.head
    }

    fn line_done(&mut self) -> Result<()> {
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        let line = String::from_utf8(std::mem::take(&mut self.line))
            .map_err(|_| WeftError::Protocol("invalid UTF-8 in HTTP header".into()))?;
        if !self.started {
            if line.is_empty() {
                return Ok(());
            }
            trace!("HTTP start line: {}", line);
            self.head.parse_start_line(&line)?;
            self.started = true;
            return Ok(());
        }
        if line.is_empty() {
            self.done = true;
            return Ok(());
        }
        if line.starts_with([' ', '\t']) {
            let Some((_, value)) = self.head.headers_mut().last_mut() else {
                return Err(WeftError::Protocol("continuation line without header".into()));
            };
            let more = line.trim();
            if !more.is_empty() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(more);
            }
            return Ok(());
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WeftError::Protocol(format!("invalid header line '{}'", line)))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(WeftError::Protocol(format!("invalid header name '{}'", name)));
        }
        self.head.headers_mut().add(name, value.trim());
        Ok(())
    }
}

impl<H: MessageHead> Parser for HeaderParser<H> {
    type Output = H;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        if self.done {
            return Err(WeftError::Protocol("data after complete HTTP header".into()));
        }
        self.size += 1;
        if self.size > self.max_size {
            return Err(WeftError::Protocol(format!(
                "HTTP header exceeds {} bytes",
                self.max_size
            )));
        }
        if byte == b'\n' {
            self.line_done()?;
        } else {
            self.line.push(byte);
        }
        Ok(self.done)
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn take(&mut self) -> Option<H> {
        if !self.done {
            return None;
        }
        let head = std::mem::take(&mut self.head);
        self.reset();
        Some(head)
    }

    fn reset(&mut self) {
        self.head = H::default();
        self.line.clear();
        self.size = 0;
        self.started = false;
        self.done = false;
    }
}
