//! Thrift framed transport with the binary protocol.
//!
//! ## Frame Format
//!
//! ```text
//! <u32 big-endian length><message of exactly length bytes>
//! ```
//!
//! ## Message Format (strict binary)
//!
//! ```text
//! i32     version | type      0x80010001 = CALL, 0x80010002 = REPLY
//! i32+[u8] method name
//! i32     sequence id         always 0 here, responses are matched by order
//! struct  arguments / result
//! ```
//!
//! Requests carry `args { 1: struct { 1: string } }`. Reply bodies are
//! skipped field by field without being interpreted, which still catches a
//! desynchronized stream early.

use bytes::{Buf, BufMut, BytesMut};

use super::{EncodingError, Request, RequestEncoder, Response, ResponseDecoder};

/// Largest frame accepted or produced.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum struct/container nesting when skipping a body.
const MAX_DEPTH: usize = 64;

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;

/// Message types.
pub const CALL: u8 = 1;
pub const REPLY: u8 = 2;
pub const EXCEPTION: u8 = 3;
pub const ONEWAY: u8 = 4;

// Field type ids.
const T_STOP: u8 = 0;
const T_BOOL: u8 = 2;
const T_BYTE: u8 = 3;
const T_DOUBLE: u8 = 4;
const T_I16: u8 = 6;
const T_I32: u8 = 8;
const T_I64: u8 = 10;
const T_STRING: u8 = 11;
const T_STRUCT: u8 = 12;
const T_MAP: u8 = 13;
const T_SET: u8 = 14;
const T_LIST: u8 = 15;
const T_UUID: u8 = 16;

/// Frame parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A whole frame is buffered; holds the message length (without prefix).
    Complete(usize),
    /// Need more data.
    Incomplete,
    /// Length prefix exceeds [`MAX_FRAME_SIZE`].
    TooLarge(usize),
}

/// Check whether `input` starts with a complete frame.
pub fn parse_frame(input: &[u8]) -> ParseResult {
    if input.len() < 4 {
        return ParseResult::Incomplete;
    }

    let len = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return ParseResult::TooLarge(len);
    }

    if input.len() < 4 + len {
        ParseResult::Incomplete
    } else {
        ParseResult::Complete(len)
    }
}

/// Decoded message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub kind: u8,
    pub seqid: i32,
}

/// A fully validated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    /// Exception text when `header.kind` is [`EXCEPTION`].
    pub exception: Option<String>,
}

/// Decode one message (frame prefix already stripped).
///
/// The body struct is walked to its stop byte and the message must end
/// exactly at the frame boundary.
pub fn decode_message(body: &[u8]) -> Result<Message, EncodingError> {
    let mut reader = Reader { buf: body };
    let header = reader.message_header()?;

    let exception = if header.kind == EXCEPTION {
        Some(reader.application_exception()?)
    } else {
        reader.skip(T_STRUCT, 0)?;
        None
    };

    if reader.buf.has_remaining() {
        return Err(EncodingError::TrailingBytes(reader.buf.remaining()));
    }

    Ok(Message { header, exception })
}

/// Append a framed CALL carrying `payload` as the request's only field.
pub fn encode_call(dst: &mut BytesMut, method: &str, payload: &str) -> Result<(), EncodingError> {
    framed(dst, |dst| {
        write_message_begin(dst, method, CALL, 0);
        write_field_begin(dst, T_STRUCT, 1);
        write_field_begin(dst, T_STRING, 1);
        write_string(dst, payload);
        dst.put_u8(T_STOP);
        dst.put_u8(T_STOP);
    })
}

/// Append a framed REPLY whose result is `success { 1: text }`.
pub fn encode_reply(
    dst: &mut BytesMut,
    method: &str,
    seqid: i32,
    text: &str,
) -> Result<(), EncodingError> {
    framed(dst, |dst| {
        write_message_begin(dst, method, REPLY, seqid);
        write_field_begin(dst, T_STRUCT, 0);
        write_field_begin(dst, T_STRING, 1);
        write_string(dst, text);
        dst.put_u8(T_STOP);
        dst.put_u8(T_STOP);
    })
}

/// Write a length prefix around whatever `body` appends.
fn framed(dst: &mut BytesMut, body: impl FnOnce(&mut BytesMut)) -> Result<(), EncodingError> {
    let start = dst.len();
    dst.put_u32(0);
    body(dst);

    let len = dst.len() - start - 4;
    if len > MAX_FRAME_SIZE {
        dst.truncate(start);
        return Err(EncodingError::PayloadTooLarge(len));
    }
    dst[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(())
}

fn write_message_begin(dst: &mut BytesMut, name: &str, kind: u8, seqid: i32) {
    dst.put_u32(VERSION_1 | kind as u32);
    write_string(dst, name);
    dst.put_i32(seqid);
}

fn write_field_begin(dst: &mut BytesMut, ttype: u8, id: i16) {
    dst.put_u8(ttype);
    dst.put_i16(id);
}

fn write_string(dst: &mut BytesMut, s: &str) {
    dst.put_i32(s.len() as i32);
    dst.put_slice(s.as_bytes());
}

/// Bounds-checked cursor over a message body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn ensure(&self, n: usize) -> Result<(), EncodingError> {
        if self.buf.remaining() < n {
            Err(EncodingError::Truncated)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, EncodingError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> Result<i16, EncodingError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> Result<i32, EncodingError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn advance(&mut self, n: usize) -> Result<(), EncodingError> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn length(&mut self) -> Result<usize, EncodingError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(EncodingError::NegativeLength(len));
        }
        Ok(len as usize)
    }

    fn binary(&mut self) -> Result<&'a [u8], EncodingError> {
        let len = self.length()?;
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String, EncodingError> {
        let bytes = self.binary()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| EncodingError::InvalidUtf8)
    }

    fn message_header(&mut self) -> Result<MessageHeader, EncodingError> {
        let first = self.i32()?;

        if first < 0 {
            let word = first as u32;
            if word & VERSION_MASK != VERSION_1 {
                return Err(EncodingError::BadVersion(word));
            }
            let kind = (word & 0xff) as u8;
            let name = self.string()?;
            let seqid = self.i32()?;
            Ok(MessageHeader { name, kind, seqid })
        } else {
            // Non-strict: no version word, the name length comes first.
            let len = first as usize;
            self.ensure(len)?;
            let (head, tail) = self.buf.split_at(len);
            self.buf = tail;
            let name = std::str::from_utf8(head)
                .map(str::to_owned)
                .map_err(|_| EncodingError::InvalidUtf8)?;
            let kind = self.u8()?;
            let seqid = self.i32()?;
            Ok(MessageHeader { name, kind, seqid })
        }
    }

    /// `TApplicationException { 1: string message, 2: i32 type }`
    fn application_exception(&mut self) -> Result<String, EncodingError> {
        let mut message = String::new();
        loop {
            let ttype = self.u8()?;
            if ttype == T_STOP {
                break;
            }
            let id = self.i16()?;
            if id == 1 && ttype == T_STRING {
                message = String::from_utf8_lossy(self.binary()?).into_owned();
            } else {
                self.skip(ttype, 1)?;
            }
        }
        Ok(message)
    }

    fn skip(&mut self, ttype: u8, depth: usize) -> Result<(), EncodingError> {
        match ttype {
            T_BOOL | T_BYTE => self.advance(1),
            T_I16 => self.advance(2),
            T_I32 => self.advance(4),
            T_DOUBLE | T_I64 => self.advance(8),
            T_UUID => self.advance(16),
            T_STRING => self.binary().map(|_| ()),
            T_STRUCT => {
                if depth >= MAX_DEPTH {
                    return Err(EncodingError::DepthExceeded);
                }
                loop {
                    let field_type = self.u8()?;
                    if field_type == T_STOP {
                        return Ok(());
                    }
                    self.i16()?;
                    self.skip(field_type, depth + 1)?;
                }
            }
            T_MAP => {
                if depth >= MAX_DEPTH {
                    return Err(EncodingError::DepthExceeded);
                }
                let key_type = self.u8()?;
                let value_type = self.u8()?;
                let count = self.length()?;
                for _ in 0..count {
                    self.skip(key_type, depth + 1)?;
                    self.skip(value_type, depth + 1)?;
                }
                Ok(())
            }
            T_SET | T_LIST => {
                if depth >= MAX_DEPTH {
                    return Err(EncodingError::DepthExceeded);
                }
                let elem_type = self.u8()?;
                let count = self.length()?;
                for _ in 0..count {
                    self.skip(elem_type, depth + 1)?;
                }
                Ok(())
            }
            other => Err(EncodingError::UnknownFieldType(other)),
        }
    }
}

/// Client-side codec: encodes CALLs for one method, decodes REPLYs.
#[derive(Debug, Clone)]
pub struct ThriftCodec {
    method: String,
}

impl ThriftCodec {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }
}

impl RequestEncoder for ThriftCodec {
    fn encode(&mut self, request: &Request, dst: &mut BytesMut) -> Result<(), EncodingError> {
        encode_call(dst, &self.method, &request.field)
    }
}

impl ResponseDecoder for ThriftCodec {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, EncodingError> {
        let len = match parse_frame(&src[..]) {
            ParseResult::Complete(len) => len,
            ParseResult::Incomplete => return Ok(None),
            ParseResult::TooLarge(len) => return Err(EncodingError::FrameTooLarge(len)),
        };

        let frame = src.split_to(4 + len);
        let message = decode_message(&frame[4..])?;

        match message.header.kind {
            REPLY => Ok(Some(Response {
                method: message.header.name,
                body_len: len,
            })),
            EXCEPTION => Err(EncodingError::Exception(
                message.exception.unwrap_or_default(),
            )),
            other => Err(EncodingError::UnexpectedMessageType(other)),
        }
    }
}
