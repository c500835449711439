//! Encoders for server response packets.
//!
//! The `encode_*` functions build payloads; the `write_*` helpers send them
//! through a [`PacketIo`], continuing the current sequence.

use std::io::{Read, Write};

use mysqlgate_core::{MySqlError, Result};

use super::capabilities::CLIENT_PROTOCOL_41;
use super::{OkPacket, PacketIo, PacketWriter};

pub fn encode_ok(capabilities: u32, ok: &OkPacket) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(11 + ok.info.len());
    w.write_u8(0x00);
    w.write_lenenc_int(ok.affected_rows);
    w.write_lenenc_int(ok.last_insert_id);
    if capabilities & CLIENT_PROTOCOL_41 != 0 {
        w.write_u16_le(ok.status_flags);
        w.write_u16_le(ok.warnings);
    }
    w.write_bytes(ok.info.as_bytes());
    w.into_bytes()
}

/// ERR payload. The message runs to the end of the packet, unterminated.
pub fn encode_err(capabilities: u32, err: &MySqlError) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(9 + err.message.len());
    w.write_u8(0xFF);
    w.write_u16_le(err.code);
    if capabilities & CLIENT_PROTOCOL_41 != 0 {
        w.write_u8(b'#');
        let state = err.state.as_bytes();
        let mut fixed = [b'0'; 5];
        let n = state.len().min(5);
        fixed[..n].copy_from_slice(&state[..n]);
        w.write_bytes(&fixed);
    }
    w.write_bytes(err.message.as_bytes());
    w.into_bytes()
}

pub fn encode_eof(capabilities: u32, status_flags: u16) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(5);
    w.write_u8(0xFE);
    if capabilities & CLIENT_PROTOCOL_41 != 0 {
        w.write_u16_le(0);
        w.write_u16_le(status_flags);
    }
    w.into_bytes()
}

/// One text-protocol row: each cell length-encoded, `None` as `0xFB`.
pub fn encode_text_row<I, B>(cells: I) -> Vec<u8>
where
    I: IntoIterator<Item = Option<B>>,
    B: AsRef<[u8]>,
{
    let mut w = PacketWriter::new();
    for cell in cells {
        match cell {
            Some(value) => w.write_lenenc_bytes(value.as_ref()),
            None => w.write_null_marker(),
        }
    }
    w.into_bytes()
}

pub fn write_ok_packet<S: Read + Write>(
    io: &mut PacketIo<S>,
    capabilities: u32,
    ok: &OkPacket,
) -> Result<()> {
    io.write_packet(&encode_ok(capabilities, ok))
}

pub fn write_err_packet<S: Read + Write>(
    io: &mut PacketIo<S>,
    capabilities: u32,
    err: &MySqlError,
) -> Result<()> {
    io.write_packet(&encode_err(capabilities, err))
}

pub fn write_eof_packet<S: Read + Write>(
    io: &mut PacketIo<S>,
    capabilities: u32,
    status_flags: u16,
) -> Result<()> {
    io.write_packet(&encode_eof(capabilities, status_flags))
}

pub fn write_column_count<S: Read + Write>(io: &mut PacketIo<S>, count: u64) -> Result<()> {
    let mut w = PacketWriter::with_capacity(9);
    w.write_lenenc_int(count);
    io.write_packet(w.as_bytes())
}

pub fn write_text_row<S, I, B>(io: &mut PacketIo<S>, cells: I) -> Result<()>
where
    S: Read + Write,
    I: IntoIterator<Item = Option<B>>,
    B: AsRef<[u8]>,
{
    io.write_packet(&encode_text_row(cells))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketReader;

    #[test]
    fn ok_packet_layout() {
        let ok = OkPacket {
            affected_rows: 3,
            last_insert_id: 0,
            status_flags: 0x0002,
            ..OkPacket::default()
        };
        assert_eq!(
            encode_ok(CLIENT_PROTOCOL_41, &ok),
            vec![0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00]
        );
        assert_eq!(encode_ok(0, &ok), vec![0x00, 0x03, 0x00]);
    }

    #[test]
    fn err_packet_layout() {
        let err = MySqlError::from_parts(1045, "28000", "denied");
        let payload = encode_err(CLIENT_PROTOCOL_41, &err);
        assert_eq!(&payload[..4], &[0xFF, 0x15, 0x04, b'#']);
        assert_eq!(&payload[4..9], b"28000");
        assert_eq!(&payload[9..], b"denied");

        let parsed = PacketReader::new(&payload).parse_err_packet().unwrap();
        assert_eq!(parsed.into_mysql_error(), err);

        let old = encode_err(0, &err);
        assert_eq!(&old[..3], &[0xFF, 0x15, 0x04]);
        assert_eq!(&old[3..], b"denied");
    }

    #[test]
    fn eof_packet_layout() {
        assert_eq!(
            encode_eof(CLIENT_PROTOCOL_41, 0x0022),
            vec![0xFE, 0x00, 0x00, 0x22, 0x00]
        );
        assert_eq!(encode_eof(0, 0x0022), vec![0xFE]);
    }

    #[test]
    fn text_row_with_null() {
        let row = encode_text_row([Some(&b"1"[..]), None, Some(&b""[..])]);
        assert_eq!(row, vec![0x01, b'1', 0xFB, 0x00]);
    }
}
