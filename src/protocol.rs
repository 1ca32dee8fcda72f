//! Protocol-level constants and primitive encodings.
//!
//! Capability flags, status flags, command opcodes, column type codes,
//! and the length-encoded integer/string helpers used by every packet
//! builder and parser in the crate.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol version byte sent in the server greeting. Always 10.
pub const PROTOCOL_VERSION: u8 = 10;

/// Server version advertised in the greeting unless overridden.
pub const DEFAULT_SERVER_VERSION: &str = "5.5.10-Vitess";

/// Maximum size of one packet payload, or of any accumulated
/// long-data parameter.
pub const MAX_PACKET_SIZE: usize = 33_554_432;

/// Payload bytes carried by a single wire frame. Larger payloads are
/// split into continuation frames.
pub const MAX_FRAME_SIZE: usize = 0x00ff_ffff;

// MySQL command opcodes (first payload byte of a command packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    InitDb,
    Query,
    Ping,
    StmtPrepare,
    StmtExecute,
    StmtSendLongData,
    StmtClose,
    StmtReset,
    SetOption,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x0e => Command::Ping,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            b => Command::Unknown(b),
        }
    }
}

// MySQL capability flags.
pub const CLIENT_LONG_PASSWORD: u32 = 0x00000001;
pub const CLIENT_FOUND_ROWS: u32 = 0x00000002;
pub const CLIENT_LONG_FLAG: u32 = 0x00000004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x00000008;
pub const CLIENT_PROTOCOL_41: u32 = 0x00000200;
pub const CLIENT_SSL: u32 = 0x00000800;
pub const CLIENT_TRANSACTIONS: u32 = 0x00002000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x00008000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x00010000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x00020000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x00080000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x00200000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x01000000;

/// Capabilities the server always advertises in the greeting.
/// `CLIENT_SSL` is added by the handshake when TLS is configured.
pub fn server_capabilities() -> u32 {
    CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF
}

// Character sets.
pub const CHARSET_UTF8: u8 = 33; // utf8_general_ci

// Status flags echoed in OK/EOF payloads.
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

// Packet header bytes.
pub const OK_PACKET: u8 = 0x00;
pub const EOF_PACKET: u8 = 0xfe;
pub const ERR_PACKET: u8 = 0xff;
pub const AUTH_SWITCH_REQUEST_PACKET: u8 = 0xfe;
pub const NULL_VALUE: u8 = 0xfb;

// Error codes and SQLSTATEs surfaced by the dispatcher.
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const CR_SERVER_HANDSHAKE_ERR: u16 = 2012;
pub const CR_COMMANDS_OUT_OF_SYNC: u16 = 2014;
pub const SS_UNKNOWN_SQL_STATE: &str = "HY000";
pub const SS_UNKNOWN_COM_ERROR: &str = "08S01";
pub const SS_ACCESS_DENIED: &str = "28000";

// Column type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    VarChar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl ColumnType {
    pub fn from_u8(code: u8) -> Option<ColumnType> {
        Some(match code {
            0x00 => ColumnType::Decimal,
            0x01 => ColumnType::Tiny,
            0x02 => ColumnType::Short,
            0x03 => ColumnType::Long,
            0x04 => ColumnType::Float,
            0x05 => ColumnType::Double,
            0x06 => ColumnType::Null,
            0x07 => ColumnType::Timestamp,
            0x08 => ColumnType::LongLong,
            0x09 => ColumnType::Int24,
            0x0a => ColumnType::Date,
            0x0b => ColumnType::Time,
            0x0c => ColumnType::DateTime,
            0x0d => ColumnType::Year,
            0x0f => ColumnType::VarChar,
            0x10 => ColumnType::Bit,
            0xf5 => ColumnType::Json,
            0xf6 => ColumnType::NewDecimal,
            0xf7 => ColumnType::Enum,
            0xf8 => ColumnType::Set,
            0xf9 => ColumnType::TinyBlob,
            0xfa => ColumnType::MediumBlob,
            0xfb => ColumnType::LongBlob,
            0xfc => ColumnType::Blob,
            0xfd => ColumnType::VarString,
            0xfe => ColumnType::String,
            0xff => ColumnType::Geometry,
            _ => return None,
        })
    }
}

// Helper functions for length-encoded integers and strings.

pub fn write_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xfc);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xfd);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(value);
    }
}

pub fn write_lenenc_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    write_lenenc_int(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn write_lenenc_str(buf: &mut BytesMut, s: &str) {
    write_lenenc_bytes(buf, s.as_bytes());
}

pub fn write_null_terminated_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Length-encoded integer. 0xfb (NULL marker) and 0xff are not valid
/// integer prefixes and fail the decode.
pub fn read_lenenc_int(buf: &mut Bytes) -> Option<u64> {
    if buf.is_empty() {
        return None;
    }

    let first = buf.get_u8();
    match first {
        0xfb | 0xff => None,
        0xfc => {
            if buf.remaining() < 2 {
                return None;
            }
            Some(buf.get_u16_le() as u64)
        }
        0xfd => {
            if buf.remaining() < 3 {
                return None;
            }
            Some(buf.get_uint_le(3))
        }
        0xfe => {
            if buf.remaining() < 8 {
                return None;
            }
            Some(buf.get_u64_le())
        }
        _ => Some(first as u64),
    }
}

pub fn read_lenenc_bytes(buf: &mut Bytes) -> Option<Bytes> {
    let len = read_lenenc_int(buf)? as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len))
}

pub fn read_null_terminated_string(buf: &mut Bytes) -> Option<String> {
    let mut result = Vec::new();
    while buf.has_remaining() {
        let byte = buf.get_u8();
        if byte == 0 {
            return String::from_utf8(result).ok();
        }
        result.push(byte);
    }
    None
}
