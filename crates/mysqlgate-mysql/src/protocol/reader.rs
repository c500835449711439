//! Cursor over a packet payload.
//!
//! Every read is bounds-checked; running off the end of the payload is a
//! [`ProtocolErrorKind::Malformed`](mysqlgate_core::ProtocolErrorKind) error
//! naming the field that was being decoded.

#![allow(clippy::cast_possible_truncation)]

use mysqlgate_core::{Error, Result};

use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
use crate::protocol::{EofPacket, ErrPacket, OkPacket};

#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn truncated(&self, field: &str) -> Error {
        Error::malformed(format!(
            "packet truncated reading {field} at offset {} of {}",
            self.pos,
            self.data.len()
        ))
    }

    fn take<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| self.truncated(field))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>("u8")?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take("u16")?))
    }

    pub fn read_u24_le(&mut self) -> Result<u32> {
        let [a, b, c] = self.take("u24")?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take("u32")?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take("u64")?))
    }

    /// Read a length-encoded integer, or `None` for the `0xFB` NULL marker.
    ///
    /// - `0x00..=0xFA`: the value itself
    /// - `0xFC`: 2-byte value follows
    /// - `0xFD`: 3-byte value follows
    /// - `0xFE`: 8-byte value follows
    pub fn read_lenenc_int_or_null(&mut self) -> Result<Option<u64>> {
        let first = self.read_u8()?;
        let value = match first {
            0x00..=0xFA => u64::from(first),
            0xFB => return Ok(None),
            0xFC => u64::from(self.read_u16_le()?),
            0xFD => u64::from(self.read_u24_le()?),
            0xFE => self.read_u64_le()?,
            0xFF => {
                return Err(Error::malformed(
                    "0xFF is not a valid length-encoded integer prefix",
                ));
            }
        };
        Ok(Some(value))
    }

    /// Read a length-encoded integer where NULL is not allowed.
    pub fn read_lenenc_int(&mut self) -> Result<u64> {
        self.read_lenenc_int_or_null()?
            .ok_or_else(|| Error::malformed("unexpected NULL length-encoded integer"))
    }

    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len)
    }

    /// Length-encoded bytes that may be NULL, as found in text result rows.
    pub fn read_lenenc_bytes_or_null(&mut self) -> Result<Option<&'a [u8]>> {
        match self.read_lenenc_int_or_null()? {
            Some(len) => self.read_bytes(len as usize).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_lenenc_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.read_lenenc_bytes()?).into_owned())
    }

    /// Bytes up to (not including) the next NUL, which is consumed.
    ///
    /// A missing terminator is a malformed packet.
    pub fn read_null_bytes(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.truncated("NUL-terminated string"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    pub fn read_null_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.read_null_bytes()?).into_owned())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self
            .data
            .get(self.pos..self.pos.saturating_add(len))
            .ok_or_else(|| self.truncated("fixed-length bytes"))?;
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_string(&mut self, len: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(self.read_bytes(len)?).into_owned())
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Decode an OK packet; the leading `0x00` marker is optional.
    ///
    /// Status and warnings are present only under `CLIENT_PROTOCOL_41`.
    pub fn parse_ok_packet(&mut self, capabilities: u32) -> Result<OkPacket> {
        if self.peek() == Some(0x00) {
            self.pos += 1;
        }
        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            (self.read_u16_le()?, self.read_u16_le()?)
        } else {
            (0, 0)
        };
        let info = self.read_rest_string();
        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Decode an ERR packet; the leading `0xFF` marker is optional.
    pub fn parse_err_packet(&mut self) -> Result<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.pos += 1;
        }
        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.pos += 1;
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();
        Ok(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Decode an EOF packet; pre-4.1 EOFs carry no fields.
    pub fn parse_eof_packet(&mut self) -> Result<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.pos += 1;
        }
        if self.remaining() < 4 {
            return Ok(EofPacket::default());
        }
        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;
        Ok(EofPacket {
            warnings,
            status_flags,
        })
    }
}
