//! Result-set metadata.
//!
//! The gateway relays column definitions byte-for-byte, so a [`ColumnDef`]
//! keeps the packet it was decoded from next to the decoded fields.

#![allow(clippy::cast_possible_truncation)]

use mysqlgate_core::Result;

use crate::protocol::{PacketReader, PacketWriter, charset};

/// `MYSQL_TYPE_*` column type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
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
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Unknown codes decode as `String`; the raw byte survives in the packet.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }
}

pub mod column_flags {
    pub const NOT_NULL: u16 = 0x0001;
    pub const PRIMARY_KEY: u16 = 0x0002;
    pub const UNSIGNED: u16 = 0x0020;
    pub const BINARY: u16 = 0x0080;
}

/// A `ColumnDefinition41` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
    raw: Vec<u8>,
}

impl ColumnDef {
    /// Describe a column produced by the gateway itself.
    pub fn new(name: impl Into<String>, column_type: FieldType) -> Self {
        let mut def = Self {
            schema: String::new(),
            table: String::new(),
            name: name.into(),
            charset: u16::from(charset::UTF8MB4_GENERAL_CI),
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
            raw: Vec::new(),
        };
        def.raw = def.encode();
        def
    }

    /// Decode a column definition received from a backend, keeping its bytes.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self> {
        let mut reader = PacketReader::new(&payload);
        let _catalog = reader.read_lenenc_bytes()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let _org_table = reader.read_lenenc_bytes()?;
        let name = reader.read_lenenc_string()?;
        let _org_name = reader.read_lenenc_bytes()?;
        let _fixed_len = reader.read_lenenc_int()?;
        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let column_type = FieldType::from_u8(reader.read_u8()?);
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        Ok(Self {
            schema,
            table,
            name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
            raw: payload,
        })
    }

    /// The packet payload to relay to a client.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(32 + self.name.len());
        w.write_lenenc_string("def");
        w.write_lenenc_string(&self.schema);
        w.write_lenenc_string(&self.table);
        w.write_lenenc_string(&self.table);
        w.write_lenenc_string(&self.name);
        w.write_lenenc_string(&self.name);
        w.write_lenenc_int(0x0c);
        w.write_u16_le(self.charset);
        w.write_u32_le(self.column_length);
        w.write_u8(self.column_type as u8);
        w.write_u16_le(self.flags);
        w.write_u8(self.decimals);
        w.write_zeros(2);
        w.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_column_decodes_back() {
        let col = ColumnDef::new("1", FieldType::LongLong);
        let decoded = ColumnDef::from_payload(col.as_bytes().to_vec()).unwrap();
        assert_eq!(decoded, col);
        assert_eq!(decoded.name, "1");
        assert_eq!(decoded.column_type, FieldType::LongLong);
    }

    #[test]
    fn backend_bytes_are_kept_verbatim() {
        let mut payload = ColumnDef::new("id", FieldType::Long).as_bytes().to_vec();
        // flags byte: mark unsigned
        let flags_at = payload.len() - 5;
        payload[flags_at] = column_flags::UNSIGNED as u8;
        let col = ColumnDef::from_payload(payload.clone()).unwrap();
        assert!(col.is_unsigned());
        assert_eq!(col.as_bytes(), payload.as_slice());
    }

    #[test]
    fn truncated_definition_is_an_error() {
        let payload = ColumnDef::new("x", FieldType::Tiny).as_bytes()[..8].to_vec();
        assert!(ColumnDef::from_payload(payload).is_err());
    }
}
