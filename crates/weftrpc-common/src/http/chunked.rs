//! Incremental decoder for `Transfer-Encoding: chunked` bodies

use crate::codec::Progress;
use crate::protocol::error::{Result, WeftError};

const MAX_SIZE_DIGITS: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size { digits: u8 },
    Extension,
    SizeLf,
    Data { remaining: u64 },
    DataCr,
    DataLf,
    /// Start of a trailer line; an empty one ends the body.
    TrailerStart,
    Trailer,
    TrailerLf,
    EndLf,
    Done,
}

/// Strips chunk framing, appending payload bytes to the caller's buffer.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: State,
    size: u64,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: State::Size { digits: 0 },
            size: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Decodes as much of `input` as possible. Stops right after the final
    /// chunk's terminating empty line, so `consumed` marks where the next
    /// message begins.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<Progress> {
        let mut i = 0;
        while i < input.len() {
            if self.state == State::Done {
                break;
            }
            if let State::Data { remaining } = self.state {
                let take = remaining.min((input.len() - i) as u64) as usize;
                out.extend_from_slice(&input[i..i + take]);
                i += take;
                let remaining = remaining - take as u64;
                self.state = if remaining == 0 {
                    State::DataCr
                } else {
                    State::Data { remaining }
                };
                continue;
            }
            self.step(input[i])?;
            i += 1;
        }
        Ok(Progress {
            consumed: i,
            complete: self.state == State::Done,
        })
    }

    fn step(&mut self, byte: u8) -> Result<()> {
        self.state = match self.state {
            State::Size { digits } => match byte {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    if digits == MAX_SIZE_DIGITS {
                        return Err(WeftError::Protocol("chunk size too large".into()));
                    }
                    // to_digit cannot fail on a hex digit
                    let value = (byte as char).to_digit(16).unwrap_or(0) as u64;
                    self.size = self.size * 16 + value;
                    State::Size { digits: digits + 1 }
                }
                _ if digits == 0 => {
                    return Err(WeftError::Protocol(format!(
                        "invalid chunk size byte 0x{:02x}",
                        byte
                    )))
                }
                b';' | b' ' | b'\t' => State::Extension,
                b'\r' => State::SizeLf,
                b'\n' => self.size_line_done(),
                _ => {
                    return Err(WeftError::Protocol(format!(
                        "invalid chunk size byte 0x{:02x}",
                        byte
                    )))
                }
            },
            State::Extension => match byte {
                b'\r' => State::SizeLf,
                b'\n' => self.size_line_done(),
                _ => State::Extension,
            },
            State::SizeLf => {
                expect_lf(byte)?;
                self.size_line_done()
            }
            State::DataCr => match byte {
                b'\r' => State::DataLf,
                b'\n' => State::Size { digits: 0 },
                _ => return Err(WeftError::Protocol("missing CRLF after chunk data".into())),
            },
            State::DataLf => {
                expect_lf(byte)?;
                State::Size { digits: 0 }
            }
            State::TrailerStart => match byte {
                b'\r' => State::EndLf,
                b'\n' => State::Done,
                _ => State::Trailer,
            },
            State::Trailer => match byte {
                b'\r' => State::TrailerLf,
                b'\n' => State::TrailerStart,
                _ => State::Trailer,
            },
            State::TrailerLf => {
                expect_lf(byte)?;
                State::TrailerStart
            }
            State::EndLf => {
                expect_lf(byte)?;
                State::Done
            }
            State::Data { .. } | State::Done => self.state,
        };
        Ok(())
    }

    fn size_line_done(&mut self) -> State {
        let size = std::mem::take(&mut self.size);
        if size == 0 {
            State::TrailerStart
        } else {
            State::Data { remaining: size }
        }
    }
}

fn expect_lf(byte: u8) -> Result<()> {
    if byte == b'\n' {
        Ok(())
    } else {
        Err(WeftError::Protocol("expected LF in chunked body".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"4\r\nWiki\r\n6;ext=1\r\npedia \r\nE\r\nin \r\n\r\nchunks.\r\n0\r\nTrailer: x\r\n\r\n";

    #[test]
    fn test_decode_whole() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let progress = decoder.decode(BODY, &mut out).unwrap();
        assert!(progress.complete);
        assert_eq!(progress.consumed, BODY.len());
        assert_eq!(out, b"Wikipedia in \r\n\r\nchunks.");
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        for b in BODY {
            decoder.decode(std::slice::from_ref(b), &mut out).unwrap();
        }
        assert!(decoder.is_complete());
        assert_eq!(out, b"Wikipedia in \r\n\r\nchunks.");
    }

    #[test]
    fn test_stops_at_end_of_body() {
        let mut input = b"3\r\nabc\r\n0\r\n\r\n".to_vec();
        let body_len = input.len();
        input.extend_from_slice(b"GET / HTTP/1.1\r\n");
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let progress = decoder.decode(&input, &mut out).unwrap();
        assert!(progress.complete);
        assert_eq!(progress.consumed, body_len);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_bare_lf_accepted() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        assert!(decoder.decode(b"2\nhi\n0\n\n", &mut out).unwrap().complete);
        assert_eq!(out, b"hi");
    }

    #[test]
    fn test_invalid_chunks() {
        let mut out = Vec::new();
        assert!(ChunkedDecoder::new().decode(b"xyz\r\n", &mut out).is_err());
        assert!(ChunkedDecoder::new().decode(b"2\r\nabc", &mut out).is_err());
        assert!(ChunkedDecoder::new()
            .decode(b"1000000000000000\r\n", &mut out)
            .is_err());
    }
}
