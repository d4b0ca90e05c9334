/* How a file is sent
 * ------------------
 * The client sends a READ REQUEST to the server's listening port:
 * Opcode: 2 bytes; Opcode::ReadRequest
 * File name: UTF-8 string, zero-terminated
 * Mode: UTF-8 string, zero-terminated; only "octet" (any case) is accepted
 *
 * The server answers from a fresh port bound to that client alone. Every
 * DATA packet has THIS FORMAT:
 * Opcode: 2 bytes; Opcode::Data
 * Block number: 2 bytes, starting at 1 and wrapping at 65536
 * Data: up to TFTP_BLOCK_SIZE bytes
 *
 * The client must answer each block with an ACK:
 * Opcode: 2 bytes; Opcode::Ack
 * Block number: 2 bytes
 *
 * A data packet carrying fewer than TFTP_BLOCK_SIZE bytes ends the transfer.
 * A file whose length is a multiple of TFTP_BLOCK_SIZE therefore ends with an
 * empty data packet.
 *
 * Either side may end the exchange early with an ERROR packet:
 * Opcode: 2 bytes; Opcode::Error
 * Error code: 2 bytes; ErrorCode
 * Message: UTF-8 string, zero-terminated
 *
 * All integers are big-endian.
 */

use std::fmt;
use std::time::Duration;

// Protocol configuration constants
pub const TFTP_DATAGRAM_SIZE: usize = 516;
pub const TFTP_BLOCK_SIZE: usize = TFTP_DATAGRAM_SIZE - 4;
pub const TFTP_DEFAULT_MODE: &str = "octet";
pub const TFTP_DEFAULT_RETRIES: u8 = 10;
pub const TFTP_DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ReadRequest = 1,
    WriteRequest, // reserved, never served
    Data,
    Ack,
    Error,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Opcode> {
        Some(match value {
            1 => Opcode::ReadRequest,
            2 => Opcode::WriteRequest,
            3 => Opcode::Data,
            4 => Opcode::Ack,
            5 => Opcode::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::ReadRequest => "RRQ",
            Opcode::WriteRequest => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown = 0,
    NotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    /// Codes outside the defined range fold into [`ErrorCode::Unknown`].
    pub fn from_u16(value: u16) -> ErrorCode {
        match value {
            1 => ErrorCode::NotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Unknown,
        }
    }
}
