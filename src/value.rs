//! Typed values crossing the handler boundary, plus their text and
//! binary protocol encodings.
//!
//! Text rows carry every value as a length-encoded string. Binary rows
//! (prepared-statement results) and statement parameters encode values
//! according to the column type, including the 0/4/7/11-byte temporal
//! and 0/8/12-byte time layouts.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::protocol::{read_lenenc_bytes, write_lenenc_bytes, ColumnType};

/// A single typed value, owned by the server side.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
}

/// Bind variables keyed `v1`, `v2`, ... in parameter order.
pub type BindVars = HashMap<String, Value>;

/// The key for parameter `index` (0-based on the wire).
pub fn bind_var_key(index: u16) -> String {
    format!("v{}", index + 1)
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The text-protocol form of this value.
    pub fn text_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Int(v) => v.to_string().into_bytes(),
            Value::UInt(v) => v.to_string().into_bytes(),
            Value::Float(v) => v.to_string().into_bytes(),
            Value::Double(v) => v.to_string().into_bytes(),
            Value::Bytes(b) => b.clone(),
        }
    }

    fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::UInt(v) => Ok(*v as i64),
            other => Err(WireError::InvalidPacket(format!(
                "cannot encode {:?} as an integer",
                other
            ))),
        }
    }

    fn as_uint(&self) -> Result<u64> {
        match self {
            Value::Int(v) => Ok(*v as u64),
            Value::UInt(v) => Ok(*v),
            other => Err(WireError::InvalidPacket(format!(
                "cannot encode {:?} as an integer",
                other
            ))),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

/// Encode a non-NULL value in binary row format for `column_type`.
pub fn write_binary_value(buf: &mut BytesMut, column_type: ColumnType, value: &Value) -> Result<()> {
    match column_type {
        ColumnType::Tiny => {
            buf.put_u8(value.as_int()? as u8);
        }
        ColumnType::Short | ColumnType::Year => {
            buf.put_u16_le(value.as_int()? as u16);
        }
        ColumnType::Int24 | ColumnType::Long => {
            buf.put_u32_le(value.as_int()? as u32);
        }
        ColumnType::LongLong => {
            buf.put_u64_le(value.as_uint()?);
        }
        ColumnType::Float => {
            let v = match value {
                Value::Float(f) => *f,
                Value::Double(d) => *d as f32,
                other => {
                    return Err(WireError::InvalidPacket(format!(
                        "cannot encode {:?} as FLOAT",
                        other
                    )))
                }
            };
            buf.put_f32_le(v);
        }
        ColumnType::Double => {
            let v = match value {
                Value::Double(d) => *d,
                Value::Float(f) => *f as f64,
                other => {
                    return Err(WireError::InvalidPacket(format!(
                        "cannot encode {:?} as DOUBLE",
                        other
                    )))
                }
            };
            buf.put_f64_le(v);
        }
        ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => {
            write_binary_datetime(buf, &value.text_bytes())?;
        }
        ColumnType::Time => {
            write_binary_time(buf, &value.text_bytes())?;
        }
        // Decimal, string, and blob families are all length-encoded.
        _ => {
            write_lenenc_bytes(buf, &value.text_bytes());
        }
    }
    Ok(())
}

/// Decode one statement parameter in binary format.
pub fn read_binary_param(buf: &mut Bytes, type_code: u8, unsigned: bool) -> Result<Value> {
    let column_type = ColumnType::from_u8(type_code).ok_or_else(|| {
        WireError::InvalidPacket(format!("unknown parameter type {:#04x}", type_code))
    })?;

    let malformed = || WireError::InvalidPacket("truncated parameter value".to_string());

    let value = match column_type {
        ColumnType::Null => Value::Null,
        ColumnType::Tiny => {
            if buf.remaining() < 1 {
                return Err(malformed());
            }
            let v = buf.get_u8();
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i8 as i64)
            }
        }
        ColumnType::Short | ColumnType::Year => {
            if buf.remaining() < 2 {
                return Err(malformed());
            }
            let v = buf.get_u16_le();
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i16 as i64)
            }
        }
        ColumnType::Int24 | ColumnType::Long => {
            if buf.remaining() < 4 {
                return Err(malformed());
            }
            let v = buf.get_u32_le();
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i32 as i64)
            }
        }
        ColumnType::LongLong => {
            if buf.remaining() < 8 {
                return Err(malformed());
            }
            let v = buf.get_u64_le();
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        ColumnType::Float => {
            if buf.remaining() < 4 {
                return Err(malformed());
            }
            Value::Float(buf.get_f32_le())
        }
        ColumnType::Double => {
            if buf.remaining() < 8 {
                return Err(malformed());
            }
            Value::Double(buf.get_f64_le())
        }
        ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => {
            Value::Bytes(read_binary_datetime(buf)?.into_bytes())
        }
        ColumnType::Time => Value::Bytes(read_binary_time(buf)?.into_bytes()),
        _ => {
            let bytes = read_lenenc_bytes(buf).ok_or_else(malformed)?;
            Value::Bytes(bytes.to_vec())
        }
    };

    Ok(value)
}

// Temporal values travel as canonical text between the handler and
// the codec; the binary layouts below are only a wire concern.

struct DateTimeParts {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
}

fn parse_datetime_text(text: &[u8]) -> Result<DateTimeParts> {
    let s = std::str::from_utf8(text)
        .map_err(|_| WireError::InvalidPacket("temporal value is not UTF-8".to_string()))?;

    let bad = || WireError::InvalidPacket(format!("malformed temporal value {:?}", s));

    let (date, time) = match s.split_once(' ') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };

    let mut date_parts = date.split('-');
    let year = date_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let month = date_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let day = date_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if date_parts.next().is_some() {
        return Err(bad());
    }

    let (mut hour, mut minute, mut second, mut micros) = (0u8, 0u8, 0u8, 0u32);
    if let Some(time) = time {
        let (hms, frac) = match time.split_once('.') {
            Some((h, f)) => (h, Some(f)),
            None => (time, None),
        };
        let mut time_parts = hms.split(':');
        hour = time_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        minute = time_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        second = time_parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if let Some(frac) = frac {
            micros = parse_micros(frac).ok_or_else(bad)?;
        }
    }

    Ok(DateTimeParts {
        year,
        month,
        day,
        hour,
        minute,
        second,
        micros,
    })
}

/// Fractional seconds, padded or truncated to microseconds.
fn parse_micros(frac: &str) -> Option<u32> {
    if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut value: u32 = frac.parse().ok()?;
    for _ in frac.len()..6 {
        value *= 10;
    }
    Some(value)
}

fn write_binary_datetime(buf: &mut BytesMut, text: &[u8]) -> Result<()> {
    let p = parse_datetime_text(text)?;

    if p.micros > 0 {
        buf.put_u8(11);
        buf.put_u16_le(p.year);
        buf.put_u8(p.month);
        buf.put_u8(p.day);
        buf.put_u8(p.hour);
        buf.put_u8(p.minute);
        buf.put_u8(p.second);
        buf.put_u32_le(p.micros);
    } else if p.hour > 0 || p.minute > 0 || p.second > 0 {
        buf.put_u8(7);
        buf.put_u16_le(p.year);
        buf.put_u8(p.month);
        buf.put_u8(p.day);
        buf.put_u8(p.hour);
        buf.put_u8(p.minute);
        buf.put_u8(p.second);
    } else if p.year > 0 || p.month > 0 || p.day > 0 {
        buf.put_u8(4);
        buf.put_u16_le(p.year);
        buf.put_u8(p.month);
        buf.put_u8(p.day);
    } else {
        buf.put_u8(0);
    }
    Ok(())
}

fn read_binary_datetime(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 1 {
        return Err(WireError::InvalidPacket("truncated temporal value".to_string()));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(WireError::InvalidPacket("truncated temporal value".to_string()));
    }

    match len {
        0 => Ok("0000-00-00 00:00:00".to_string()),
        4 => {
            let year = buf.get_u16_le();
            let month = buf.get_u8();
            let day = buf.get_u8();
            Ok(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        7 | 11 => {
            let year = buf.get_u16_le();
            let month = buf.get_u8();
            let day = buf.get_u8();
            let hour = buf.get_u8();
            let minute = buf.get_u8();
            let second = buf.get_u8();
            if len == 11 {
                let micros = buf.get_u32_le();
                Ok(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    year, month, day, hour, minute, second, micros
                ))
            } else {
                Ok(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                ))
            }
        }
        other => Err(WireError::InvalidPacket(format!(
            "invalid temporal length {}",
            other
        ))),
    }
}

fn write_binary_time(buf: &mut BytesMut, text: &[u8]) -> Result<()> {
    let s = std::str::from_utf8(text)
        .map_err(|_| WireError::InvalidPacket("time value is not UTF-8".to_string()))?;
    let bad = || WireError::InvalidPacket(format!("malformed time value {:?}", s));

    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let (hms, frac) = match s.split_once('.') {
        Some((h, f)) => (h, Some(f)),
        None => (s, None),
    };
    let mut parts = hms.split(':');
    let hours: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minute: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let second: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let micros = match frac {
        Some(frac) => parse_micros(frac).ok_or_else(bad)?,
        None => 0,
    };

    if !negative && hours == 0 && minute == 0 && second == 0 && micros == 0 {
        buf.put_u8(0);
        return Ok(());
    }

    buf.put_u8(if micros > 0 { 12 } else { 8 });
    buf.put_u8(negative as u8);
    buf.put_u32_le(hours / 24);
    buf.put_u8((hours % 24) as u8);
    buf.put_u8(minute);
    buf.put_u8(second);
    if micros > 0 {
        buf.put_u32_le(micros);
    }
    Ok(())
}

fn read_binary_time(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 1 {
        return Err(WireError::InvalidPacket("truncated time value".to_string()));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(WireError::InvalidPacket("truncated time value".to_string()));
    }

    match len {
        0 => Ok("00:00:00".to_string()),
        8 | 12 => {
            let negative = buf.get_u8() != 0;
            let days = buf.get_u32_le();
            let hour = buf.get_u8();
            let minute = buf.get_u8();
            let second = buf.get_u8();
            let sign = if negative { "-" } else { "" };
            let hours = days * 24 + hour as u32;
            if len == 12 {
                let micros = buf.get_u32_le();
                Ok(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, minute, second, micros
                ))
            } else {
                Ok(format!("{}{:02}:{:02}:{:02}", sign, hours, minute, second))
            }
        }
        other => Err(WireError::InvalidPacket(format!(
            "invalid time length {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_bytes() {
        assert_eq!(Value::Int(-42).text_bytes(), b"-42");
        assert_eq!(Value::UInt(42).text_bytes(), b"42");
        assert_eq!(Value::from("abc").text_bytes(), b"abc");
        assert!(Value::Null.text_bytes().is_empty());
    }

    #[test]
    fn test_bind_var_key() {
        assert_eq!(bind_var_key(0), "v1");
        assert_eq!(bind_var_key(9), "v10");
    }

    #[test]
    fn test_binary_int_round_trip() {
        let cases = [
            (ColumnType::Tiny, Value::Int(-42)),
            (ColumnType::Short, Value::Int(-1000)),
            (ColumnType::Long, Value::Int(-100_000)),
            (ColumnType::LongLong, Value::Int(i64::MIN)),
        ];
        for (column_type, value) in cases {
            let mut buf = BytesMut::new();
            write_binary_value(&mut buf, column_type, &value).unwrap();
            let mut bytes = buf.freeze();
            let decoded = read_binary_param(&mut bytes, column_type as u8, false).unwrap();
            assert_eq!(decoded, value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_binary_unsigned_round_trip() {
        let mut buf = BytesMut::new();
        write_binary_value(&mut buf, ColumnType::LongLong, &Value::UInt(u64::MAX)).unwrap();
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::LongLong as u8, true).unwrap();
        assert_eq!(decoded, Value::UInt(u64::MAX));
    }

    #[test]
    fn test_binary_double_round_trip() {
        let mut buf = BytesMut::new();
        write_binary_value(&mut buf, ColumnType::Double, &Value::Double(std::f64::consts::PI))
            .unwrap();
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::Double as u8, false).unwrap();
        assert_eq!(decoded, Value::Double(std::f64::consts::PI));
    }

    #[test]
    fn test_binary_string_round_trip() {
        let mut buf = BytesMut::new();
        write_binary_value(&mut buf, ColumnType::VarString, &Value::from("hello")).unwrap();
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::VarString as u8, false).unwrap();
        assert_eq!(decoded, Value::from("hello"));
    }

    #[test]
    fn test_binary_datetime_forms() {
        // Date only: 4-byte form.
        let mut buf = BytesMut::new();
        write_binary_value(&mut buf, ColumnType::Date, &Value::from("2024-12-25")).unwrap();
        assert_eq!(buf[0], 4);
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::Date as u8, false).unwrap();
        assert_eq!(decoded, Value::from("2024-12-25"));

        // Full timestamp: 7-byte form.
        let mut buf = BytesMut::new();
        write_binary_value(
            &mut buf,
            ColumnType::DateTime,
            &Value::from("2024-12-25 15:30:45"),
        )
        .unwrap();
        assert_eq!(buf[0], 7);
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::DateTime as u8, false).unwrap();
        assert_eq!(decoded, Value::from("2024-12-25 15:30:45"));

        // With microseconds: 11-byte form.
        let mut buf = BytesMut::new();
        write_binary_value(
            &mut buf,
            ColumnType::Timestamp,
            &Value::from("2024-12-25 15:30:45.000120"),
        )
        .unwrap();
        assert_eq!(buf[0], 11);
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::Timestamp as u8, false).unwrap();
        assert_eq!(decoded, Value::from("2024-12-25 15:30:45.000120"));

        // Zero value: empty form.
        let mut buf = BytesMut::new();
        write_binary_value(
            &mut buf,
            ColumnType::DateTime,
            &Value::from("0000-00-00 00:00:00"),
        )
        .unwrap();
        assert_eq!(&buf[..], &[0]);
    }

    #[test]
    fn test_binary_time_forms() {
        let mut buf = BytesMut::new();
        write_binary_value(&mut buf, ColumnType::Time, &Value::from("-34:30:45")).unwrap();
        assert_eq!(buf[0], 8);
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::Time as u8, false).unwrap();
        assert_eq!(decoded, Value::from("-34:30:45"));

        let mut buf = BytesMut::new();
        write_binary_value(&mut buf, ColumnType::Time, &Value::from("00:00:01.500000")).unwrap();
        assert_eq!(buf[0], 12);
        let mut bytes = buf.freeze();
        let decoded = read_binary_param(&mut bytes, ColumnType::Time as u8, false).unwrap();
        assert_eq!(decoded, Value::from("00:00:01.500000"));

        let mut buf = BytesMut::new();
        write_binary_value(&mut buf, ColumnType::Time, &Value::from("00:00:00")).unwrap();
        assert_eq!(&buf[..], &[0]);
    }

    #[test]
    fn test_malformed_temporal_rejected() {
        let mut buf = BytesMut::new();
        assert!(write_binary_value(&mut buf, ColumnType::Date, &Value::from("not-a-date")).is_err());
    }

    #[test]
    fn test_truncated_param_rejected() {
        let mut bytes = Bytes::from_static(&[0x01]);
        assert!(read_binary_param(&mut bytes, ColumnType::Long as u8, false).is_err());
    }

    #[test]
    fn test_unknown_param_type_rejected() {
        let mut bytes = Bytes::from_static(&[0x00]);
        assert!(read_binary_param(&mut bytes, 0x44, false).is_err());
    }
}
