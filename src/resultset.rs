//! Result-set building blocks: field metadata, query results, and the
//! column-definition / row payload encoders.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, WireError};
use crate::protocol::{write_lenenc_bytes, write_lenenc_int, write_lenenc_str, ColumnType, CHARSET_UTF8, NULL_VALUE};
use crate::value::{write_binary_value, Value};

/// Metadata for one result column.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub org_name: String,
    pub table: String,
    pub org_table: String,
    pub database: String,
    pub column_type: ColumnType,
    pub character_set: u16,
    pub column_length: u32,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Self {
            org_name: name.clone(),
            name,
            table: String::new(),
            org_table: String::new(),
            database: String::new(),
            column_type,
            character_set: CHARSET_UTF8 as u16,
            column_length: 255,
            flags: 0,
            decimals: 0,
        }
    }
}

/// One batch of results handed over by the handler. A batch with no
/// fields describes a non-result query (DML/DDL); its `rows_affected`
/// and `insert_id` end up in the OK packet.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    /// A field-less result, rendered as a plain OK packet.
    pub fn ok(rows_affected: u64, insert_id: u64) -> Self {
        Self {
            rows_affected,
            insert_id,
            ..Default::default()
        }
    }

    pub fn with_fields(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }
}

/// Encode a ColumnDefinition41 payload. `name_override` substitutes
/// the advertised column name (prepared statements may rename result
/// columns after the fact).
pub fn encode_column_definition(field: &Field, name_override: Option<&str>) -> BytesMut {
    let mut buf = BytesMut::new();

    write_lenenc_str(&mut buf, "def");
    write_lenenc_str(&mut buf, &field.database);
    write_lenenc_str(&mut buf, &field.table);
    write_lenenc_str(&mut buf, &field.org_table);
    write_lenenc_str(&mut buf, name_override.unwrap_or(&field.name));
    write_lenenc_str(&mut buf, &field.org_name);

    // Length of the fixed-size tail.
    write_lenenc_int(&mut buf, 0x0c);

    buf.put_u16_le(field.character_set);
    buf.put_u32_le(field.column_length);
    buf.put_u8(field.column_type as u8);
    buf.put_u16_le(field.flags);
    buf.put_u8(field.decimals);

    // Filler.
    buf.put_u16(0);

    buf
}

/// Encode a text-protocol row payload.
pub fn encode_text_row(row: &[Value]) -> BytesMut {
    let mut buf = BytesMut::new();
    for value in row {
        if value.is_null() {
            buf.put_u8(NULL_VALUE);
        } else {
            write_lenenc_bytes(&mut buf, &value.text_bytes());
        }
    }
    buf
}

/// Encode a binary-protocol row payload: 0x00 header, NULL bitmap
/// with a 2-bit offset, then each non-NULL value per its column type.
pub fn encode_binary_row(fields: &[Field], row: &[Value]) -> Result<BytesMut> {
    if fields.len() != row.len() {
        return Err(WireError::InvalidPacket(format!(
            "row has {} values for {} fields",
            row.len(),
            fields.len()
        )));
    }

    let mut buf = BytesMut::new();
    buf.put_u8(0x00);

    let bitmap_len = (fields.len() + 9) / 8;
    let bitmap_start = buf.len();
    buf.put_bytes(0, bitmap_len);

    for (i, (field, value)) in fields.iter().zip(row.iter()).enumerate() {
        if value.is_null() {
            let bit = i + 2;
            buf[bitmap_start + (bit >> 3)] |= 1 << (bit & 7);
        } else {
            write_binary_value(&mut buf, field.column_type, value)?;
        }
    }

    Ok(buf)
}
