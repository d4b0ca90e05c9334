//! Byte-exact encoding and decoding of the five TFTP packet shapes.
//!
//! Every decoder checks the leading opcode before anything else and fails
//! closed on a mismatch. See [`crate::protocol`] for the wire layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram too short")]
    Truncated,
    #[error("invalid opcode {0}")]
    InvalidOpcode(u16),
    #[error("expected {expected} packet, found {found}")]
    UnexpectedOpcode { expected: Opcode, found: Opcode },
    #[error("{0} is not zero-terminated")]
    MissingTerminator(&'static str),
    #[error("empty filename")]
    EmptyFilename,
    #[error("unsupported transfer mode {0:?}")]
    UnsupportedMode(String),
    #[error("datagram length {0} out of range")]
    BadLength(usize),
}

/// Reads the opcode discriminator at the start of a datagram.
pub fn opcode(datagram: &[u8]) -> Result<Opcode, DecodeError> {
    if datagram.len() < 2 {
        return Err(DecodeError::Truncated);
    }
    let raw = u16::from_be_bytes([datagram[0], datagram[1]]);
    Opcode::from_u16(raw).ok_or(DecodeError::InvalidOpcode(raw))
}

fn expect_opcode(datagram: &[u8], expected: Opcode) -> Result<(), DecodeError> {
    let found = opcode(datagram)?;
    if found != expected {
        return Err(DecodeError::UnexpectedOpcode { expected, found });
    }
    Ok(())
}

// Consumes one zero-terminated string, terminator included. Invalid UTF-8 is
// replaced rather than rejected.
fn take_string(buf: &mut &[u8], field: &'static str) -> Result<String, DecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator(field))?;
    let text = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(text)
}

// ─── Read request ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub filename: String,
    pub mode: String,
}

impl ReadRequest {
    pub fn new(filename: impl Into<String>) -> ReadRequest {
        ReadRequest {
            filename: filename.into(),
            mode: TFTP_DEFAULT_MODE.to_owned(),
        }
    }

    /// An empty mode is sent as `octet`. Callers keep the filename short
    /// enough to fit a datagram.
    pub fn encode(&self) -> Bytes {
        let mode = if self.mode.is_empty() {
            TFTP_DEFAULT_MODE
        } else {
            self.mode.as_str()
        };
        let mut buf = BytesMut::with_capacity(2 + self.filename.len() + 1 + mode.len() + 1);
        buf.put_u16(Opcode::ReadRequest as u16);
        buf.put_slice(self.filename.as_bytes());
        buf.put_u8(0);
        buf.put_slice(mode.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    /// Bytes after the mode terminator (option extensions) are ignored.
    pub fn decode(datagram: &[u8]) -> Result<ReadRequest, DecodeError> {
        expect_opcode(datagram, Opcode::ReadRequest)?;
        let mut rest = &datagram[2..];

        let filename = take_string(&mut rest, "filename")?;
        if filename.is_empty() {
            return Err(DecodeError::EmptyFilename);
        }

        let mode = take_string(&mut rest, "mode")?;
        if !mode.eq_ignore_ascii_case(TFTP_DEFAULT_MODE) {
            return Err(DecodeError::UnsupportedMode(mode));
        }

        Ok(ReadRequest { filename, mode })
    }
}

// ─── Data ────────────────────────────────────────────────────────────────────

/// A received data packet. The payload borrows the datagram's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub block: u16,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u16(Opcode::Data as u16);
        buf.put_u16(self.block);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(datagram: &Bytes) -> Result<DataPacket, DecodeError> {
        if !(4..=TFTP_DATAGRAM_SIZE).contains(&datagram.len()) {
            return Err(DecodeError::BadLength(datagram.len()));
        }
        expect_opcode(datagram, Opcode::Data)?;
        Ok(DataPacket {
            block: u16::from_be_bytes([datagram[2], datagram[3]]),
            payload: datagram.slice(4..),
        })
    }

    pub fn is_final(&self) -> bool {
        self.payload.len() < TFTP_BLOCK_SIZE
    }
}

/// Outgoing data for one transfer: a block counter plus a cursor over the
/// payload stream.
///
/// [`DataStream::next_block`] advances both; [`DataStream::resend`] hands back
/// the last frame without touching either.
#[derive(Debug)]
pub struct DataStream<R> {
    reader: R,
    block: u16,
    frame: Bytes,
}

impl<R: AsyncRead + Unpin> DataStream<R> {
    pub fn new(reader: R) -> DataStream<R> {
        DataStream {
            reader,
            block: 0,
            frame: Bytes::new(),
        }
    }

    /// Encodes the next block. The counter wraps from 65535 to 0, as the
    /// 16-bit wire field does.
    ///
    /// Reaching end of stream is not an error: the frame simply carries fewer
    /// than [`TFTP_BLOCK_SIZE`] bytes and is the final one.
    pub async fn next_block(&mut self) -> io::Result<Bytes> {
        self.block = self.block.wrapping_add(1);

        let mut frame = BytesMut::with_capacity(TFTP_DATAGRAM_SIZE);
        frame.put_u16(Opcode::Data as u16);
        frame.put_u16(self.block);

        let mut limited = (&mut self.reader).take(TFTP_BLOCK_SIZE as u64);
        while limited.read_buf(&mut frame).await? > 0 {}

        self.frame = frame.freeze();
        Ok(self.frame.clone())
    }

    pub fn resend(&self) -> Bytes {
        self.frame.clone()
    }

    /// Block number of the last encoded frame, 0 before the first.
    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn payload_len(&self) -> usize {
        self.frame.len().saturating_sub(4)
    }

    pub fn is_final(&self) -> bool {
        self.payload_len() < TFTP_BLOCK_SIZE
    }
}

// ─── Ack ─────────────────────────────────────────────────────────────────────

pub fn encode_ack(block: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(Opcode::Ack as u16);
    buf.put_u16(block);
    buf.freeze()
}

pub fn decode_ack(datagram: &[u8]) -> Result<u16, DecodeError> {
    expect_opcode(datagram, Opcode::Ack)?;
    ack_body(datagram)
}

// Padding after the block number is ignored.
fn ack_body(datagram: &[u8]) -> Result<u16, DecodeError> {
    if datagram.len() < 4 {
        return Err(DecodeError::BadLength(datagram.len()));
    }
    Ok(u16::from_be_bytes([datagram[2], datagram[3]]))
}

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPacket {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> ErrorPacket {
        ErrorPacket {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.message.len() + 1);
        buf.put_u16(Opcode::Error as u16);
        buf.put_u16(self.code as u16);
        buf.put_slice(self.message.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<ErrorPacket, DecodeError> {
        expect_opcode(datagram, Opcode::Error)?;
        ErrorPacket::body(datagram)
    }

    fn body(datagram: &[u8]) -> Result<ErrorPacket, DecodeError> {
        let mut rest = &datagram[2..];
        if rest.len() < 2 {
            return Err(DecodeError::Truncated);
        }
        let code = ErrorCode::from_u16(rest.get_u16());
        let message = take_string(&mut rest, "message")?;
        Ok(ErrorPacket { code, message })
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

// ─── Replies ─────────────────────────────────────────────────────────────────

/// What a peer sent back while a data block was outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(u16),
    Error(ErrorPacket),
    Unrecognized(DecodeError),
}

impl Reply {
    pub fn parse(datagram: &[u8]) -> Reply {
        let parsed = match opcode(datagram) {
            Ok(Opcode::Ack) => ack_body(datagram).map(Reply::Ack),
            Ok(Opcode::Error) => ErrorPacket::body(datagram).map(Reply::Error),
            Ok(found) => Err(DecodeError::UnexpectedOpcode {
                expected: Opcode::Ack,
                found,
            }),
            Err(e) => Err(e),
        };
        parsed.unwrap_or_else(Reply::Unrecognized)
    }
}
