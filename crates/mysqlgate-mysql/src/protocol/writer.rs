//! Payload builder for protocol data types.
//!
//! A `PacketWriter` only assembles a payload; framing (headers, splitting and
//! sequence numbers) is the job of [`PacketIo`](super::PacketIo).

#![allow(clippy::cast_possible_truncation)]

#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// - below 251: a single byte
    /// - below 2^16: `0xFC` + 2 bytes
    /// - below 2^24: `0xFD` + 3 bytes
    /// - otherwise: `0xFE` + 8 bytes
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    /// NULL cell in a text result row.
    pub fn write_null_marker(&mut self) {
        self.write_u8(0xFB);
    }

    pub fn write_null_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0);
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.write_null_bytes(s.as_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_integers() {
        let mut writer = PacketWriter::new();
        writer.write_u16_le(0x1234);
        writer.write_u24_le(0x12_3456);
        writer.write_u32_le(0x1234_5678);
        assert_eq!(
            writer.as_bytes(),
            &[0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn lenenc_int_boundaries() {
        let cases: [(u64, &[u8]); 5] = [
            (250, &[0xFA]),
            (251, &[0xFC, 0xFB, 0x00]),
            (0xFFFF, &[0xFC, 0xFF, 0xFF]),
            (0x1_0000, &[0xFD, 0x00, 0x00, 0x01]),
            (0x0100_0000, &[0xFE, 0, 0, 0, 1, 0, 0, 0, 0]),
        ];
        for (value, expected) in cases {
            let mut writer = PacketWriter::new();
            writer.write_lenenc_int(value);
            assert_eq!(writer.as_bytes(), expected, "value {value}");
        }
    }

    #[test]
    fn strings() {
        let mut writer = PacketWriter::new();
        writer.write_null_string("root");
        writer.write_lenenc_string("hello");
        writer.write_null_marker();
        assert_eq!(writer.as_bytes(), b"root\0\x05hello\xFB");
    }

    #[test]
    fn zero_padding() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0x15);
        writer.write_zeros(10);
        assert_eq!(writer.len(), 11);
        assert!(writer.as_bytes()[1..].iter().all(|&b| b == 0));
    }
}
