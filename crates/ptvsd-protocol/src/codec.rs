//! `Content-Length` framing for JSON messages.
//!
//! Each frame is a block of ASCII `Name: Value` header lines terminated by
//! CR LF, a blank line, and then exactly `Content-Length` bytes of UTF-8
//! JSON:
//!
//! ```text
//! Content-Length: 17\r\n
//! \r\n
//! {"type":"event"}
//! ```
//!
//! `Content-Length` is the only required header. Unknown headers are
//! accepted and ignored. The codec is driven by `tokio_util::codec`, which
//! takes care of buffering: a single read may deliver partial headers,
//! headers plus part of a body, or several frames at once.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest accepted `Content-Length` (fits a 31-bit signed integer).
pub const MAX_CONTENT_LENGTH: usize = i32::MAX as usize;

/// Upper bound on the header block so a client cannot grow the buffer
/// forever without ever sending a blank line.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Errors produced while framing or unframing messages.
#[derive(Error, Debug)]
pub enum FramingError {
    /// The header block is malformed or lacks a usable `Content-Length`.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// The body is truncated or is not valid JSON.
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodeState {
    #[default]
    Headers,
    Body {
        length: usize,
    },
}

/// Codec for `Content-Length` framed JSON values.
#[derive(Debug, Default)]
pub struct MessageCodec {
    state: DecodeState,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageCodec {
    type Item = Value;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FramingError> {
        loop {
            match self.state {
                DecodeState::Headers => {
                    // A blank line with no headers before it.
                    if src.starts_with(CRLF) {
                        src.advance(CRLF.len());
                        return Err(missing_content_length());
                    }

                    let Some(end) = find(src, HEADER_TERMINATOR) else {
                        if src.len() > MAX_HEADER_BLOCK {
                            return Err(FramingError::InvalidHeader(format!(
                                "header block exceeds {MAX_HEADER_BLOCK} bytes"
                            )));
                        }
                        return Ok(None);
                    };

                    let block = src.split_to(end + HEADER_TERMINATOR.len());
                    let length = parse_headers(&block[..end])?;
                    self.state = DecodeState::Body { length };
                    src.reserve(length.min(MAX_HEADER_BLOCK));
                }

                DecodeState::Body { length } => {
                    if src.len() < length {
                        return Ok(None);
                    }

                    let body = src.split_to(length);
                    self.state = DecodeState::Headers;

                    return serde_json::from_slice(&body)
                        .map(Some)
                        .map_err(|e| FramingError::InvalidContent(e.to_string()));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, FramingError> {
        if let Some(value) = self.decode(buf)? {
            return Ok(Some(value));
        }

        match self.state {
            DecodeState::Headers if buf.is_empty() => Ok(None),
            DecodeState::Headers => Err(FramingError::InvalidHeader(
                "stream ended inside the header block".to_string(),
            )),
            DecodeState::Body { length } => Err(FramingError::InvalidContent(format!(
                "stream ended after {} of {length} body bytes",
                buf.len()
            ))),
        }
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec {
    type Error = FramingError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FramingError> {
        let body =
            serde_json::to_vec(&item).map_err(|e| FramingError::InvalidContent(e.to_string()))?;
        put_frame(&body, dst)
    }
}

/// Encodes a single value as a complete frame.
pub fn encode<T: Serialize>(item: &T) -> Result<Vec<u8>, FramingError> {
    let body =
        serde_json::to_vec(item).map_err(|e| FramingError::InvalidContent(e.to_string()))?;
    let mut dst = BytesMut::with_capacity(body.len() + 32);
    put_frame(&body, &mut dst)?;
    Ok(dst.to_vec())
}

fn put_frame(body: &[u8], dst: &mut BytesMut) -> Result<(), FramingError> {
    if body.len() > MAX_CONTENT_LENGTH {
        return Err(FramingError::InvalidContent(format!(
            "encoded body of {} bytes exceeds {MAX_CONTENT_LENGTH}",
            body.len()
        )));
    }

    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
    dst.reserve(header.len() + body.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(body);
    Ok(())
}

/// Parses a header block (without its terminating blank line) and returns
/// the declared content length.
fn parse_headers(block: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(block)
        .ok()
        .filter(|s| s.is_ascii())
        .ok_or_else(|| FramingError::InvalidHeader("header block is not ASCII".to_string()))?;

    let mut content_length = None;

    for line in text.split("\r\n") {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            FramingError::InvalidHeader(format!("header line without ':': {line:?}"))
        })?;

        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            content_length = Some(parse_content_length(value.trim())?);
        }
    }

    content_length.ok_or_else(missing_content_length)
}

fn parse_content_length(value: &str) -> Result<usize, FramingError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FramingError::InvalidHeader(format!(
            "Content-Length is not a non-negative decimal: {value:?}"
        )));
    }

    // Digits only, so a parse failure here means overflow.
    match value.parse::<u64>() {
        Ok(n) if n <= MAX_CONTENT_LENGTH as u64 => Ok(n as usize),
        _ => Err(FramingError::InvalidHeader(format!(
            "Content-Length {value} exceeds {MAX_CONTENT_LENGTH}"
        ))),
    }
}

fn missing_content_length() -> FramingError {
    FramingError::InvalidHeader("headers ended before Content-Length".to_string())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
