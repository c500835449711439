//! Packet framing over a byte stream.
//!
//! [`PacketIo`] owns the per-direction sequence counter. Reads verify every
//! chunk's sequence number and reassemble split payloads; writes split
//! payloads at [`MAX_PACKET_SIZE`] and advance the counter only once the whole
//! logical packet has reached the stream.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use mysqlgate_core::{ConnectionError, ConnectionErrorKind, Error, ProtocolErrorKind, Result};

use super::{DEFAULT_MAX_ALLOWED_PACKET, MAX_PACKET_SIZE, PacketHeader};

#[derive(Debug)]
pub struct PacketIo<S> {
    stream: S,
    sequence: u8,
    max_allowed_packet: usize,
    scratch: Vec<u8>,
}

impl<S> PacketIo<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence: 0,
            max_allowed_packet: DEFAULT_MAX_ALLOWED_PACKET,
            scratch: Vec::new(),
        }
    }

    /// Limit on reassembled payloads in both directions.
    pub fn with_max_allowed_packet(mut self, max: usize) -> Self {
        self.max_allowed_packet = max;
        self
    }

    pub fn max_allowed_packet(&self) -> usize {
        self.max_allowed_packet
    }

    /// The sequence number the next chunk must carry.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new command/response cycle.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> PacketIo<S> {
    /// Read one logical packet.
    ///
    /// Fails with `Desync` if any chunk carries an unexpected sequence number;
    /// in that case no payload bytes are returned. A zero-length chunk is only
    /// valid as the terminator of a split payload.
    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            self.read_exact(&mut header, "packet header")?;
            let header = PacketHeader::from_bytes(&header);

            if header.sequence_id != self.sequence {
                return Err(Error::protocol(
                    ProtocolErrorKind::Desync,
                    format!(
                        "packet sequence {} does not match expected {}",
                        header.sequence_id, self.sequence
                    ),
                ));
            }
            self.sequence = self.sequence.wrapping_add(1);

            let len = header.payload_length as usize;
            if len == 0 {
                if payload.is_empty() {
                    return Err(Error::malformed("zero-length packet"));
                }
                return Ok(payload);
            }
            if payload.len() + len > self.max_allowed_packet {
                return Err(Error::protocol(
                    ProtocolErrorKind::TooLarge,
                    format!(
                        "incoming packet exceeds max_allowed_packet ({} bytes)",
                        self.max_allowed_packet
                    ),
                ));
            }

            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..], "packet payload")?;

            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    /// Write one logical packet, splitting it as needed.
    ///
    /// Errors distinguish a write that put nothing on the stream
    /// ([`ConnectionErrorKind::NotSent`]) from one that left a partial packet
    /// behind ([`ConnectionErrorKind::Broken`]).
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_allowed_packet {
            return Err(Error::protocol(
                ProtocolErrorKind::TooLarge,
                format!(
                    "outgoing packet of {} bytes exceeds max_allowed_packet ({} bytes)",
                    payload.len(),
                    self.max_allowed_packet
                ),
            ));
        }

        let mut sequence = self.sequence;
        let mut sent = 0usize;
        let mut rest = payload;
        let mut frame = std::mem::take(&mut self.scratch);
        let result = loop {
            let n = rest.len().min(MAX_PACKET_SIZE);
            let header = PacketHeader {
                payload_length: n as u32,
                sequence_id: sequence,
            };
            frame.clear();
            frame.extend_from_slice(&header.to_bytes());
            frame.extend_from_slice(&rest[..n]);
            if let Err(e) = self.send(&frame, &mut sent) {
                break Err(e);
            }
            sequence = sequence.wrapping_add(1);
            rest = &rest[n..];
            if n < MAX_PACKET_SIZE {
                break self.flush(sent);
            }
        };
        frame.clear();
        self.scratch = frame;

        result?;
        self.sequence = sequence;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.stream
            .read_exact(buf)
            .map_err(|e| Error::disconnected(format!("failed to read {what}: {e}"), e))
    }

    fn send(&mut self, mut buf: &[u8], sent: &mut usize) -> Result<()> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(write_error(
                        *sent,
                        io::Error::new(io::ErrorKind::WriteZero, "stream accepted no bytes"),
                    ));
                }
                Ok(n) => {
                    *sent += n;
                    buf = &buf[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(write_error(*sent, e)),
            }
        }
        Ok(())
    }

    fn flush(&mut self, sent: usize) -> Result<()> {
        self.stream.flush().map_err(|e| write_error(sent, e))
    }
}

fn write_error(sent: usize, source: io::Error) -> Error {
    let (kind, message) = if sent == 0 {
        (
            ConnectionErrorKind::NotSent,
            format!("failed to write packet: {source}"),
        )
    } else {
        (
            ConnectionErrorKind::Broken,
            format!("packet partially written ({sent} bytes): {source}"),
        )
    };
    Error::Connection(ConnectionError {
        kind,
        message,
        source: Some(Box::new(source)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reads from a fixed input, records everything written.
    struct MemStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl MemStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for MemStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MemStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts `budget` bytes, then fails.
    struct FailingSink {
        budget: usize,
    }

    impl Read for FailingSink {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn round_trip(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let mut writer = PacketIo::new(MemStream::new(Vec::new()));
        writer.write_packet(&payload).unwrap();
        let expected_chunks = len / MAX_PACKET_SIZE + 1;
        assert_eq!(writer.sequence() as usize, expected_chunks % 256, "len {len}");

        let wire = writer.into_inner().output;
        assert_eq!(wire.len(), len + 4 * expected_chunks);

        let mut reader = PacketIo::new(MemStream::new(wire));
        let read = reader.read_packet().unwrap();
        assert_eq!(read.len(), payload.len());
        assert!(read == payload, "payload mismatch for len {len}");
        assert_eq!(reader.sequence() as usize, expected_chunks % 256);
    }

    #[test]
    fn small_packet_layout() {
        let mut io = PacketIo::new(MemStream::new(Vec::new()));
        io.write_packet(b"hello").unwrap();
        io.write_packet(b"x").unwrap();
        assert_eq!(io.sequence(), 2);
        assert_eq!(
            io.get_ref().output,
            b"\x05\x00\x00\x00hello\x01\x00\x00\x01x".to_vec()
        );
    }

    #[test]
    fn empty_payload_is_a_single_empty_chunk() {
        let mut io = PacketIo::new(MemStream::new(Vec::new()));
        io.write_packet(&[]).unwrap();
        assert_eq!(io.get_ref().output, vec![0, 0, 0, 0]);
        assert_eq!(io.sequence(), 1);

        // writable but not readable back: a lone empty chunk is not a packet
        let mut reader = PacketIo::new(MemStream::new(io.into_inner().output));
        match reader.read_packet() {
            Err(Error::Protocol(e)) => assert_eq!(e.kind, ProtocolErrorKind::Malformed),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn split_boundaries_round_trip() {
        round_trip(MAX_PACKET_SIZE - 1);
        round_trip(MAX_PACKET_SIZE);
        round_trip(MAX_PACKET_SIZE + 5);
    }

    #[test]
    fn exact_chunk_is_followed_by_empty_terminator() {
        let payload = vec![7u8; MAX_PACKET_SIZE];
        let mut io = PacketIo::new(MemStream::new(Vec::new()));
        io.write_packet(&payload).unwrap();
        let wire = &io.get_ref().output;
        assert_eq!(&wire[..4], &[0xFF, 0xFF, 0xFF, 0]);
        assert_eq!(&wire[wire.len() - 4..], &[0, 0, 0, 1]);
    }

    #[test]
    fn wrong_sequence_is_desync() {
        let mut io = PacketIo::new(MemStream::new(b"\x01\x00\x00\x03\x0e".to_vec()));
        match io.read_packet() {
            Err(Error::Protocol(e)) => assert_eq!(e.kind, ProtocolErrorKind::Desync),
            other => panic!("expected desync, got {other:?}"),
        }
    }

    #[test]
    fn leading_zero_length_chunk_is_malformed() {
        let mut io = PacketIo::new(MemStream::new(vec![0, 0, 0, 0]));
        match io.read_packet() {
            Err(Error::Protocol(e)) => assert_eq!(e.kind, ProtocolErrorKind::Malformed),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn sequence_continues_across_packets_until_reset() {
        let wire = b"\x01\x00\x00\x00a\x01\x00\x00\x01b\x01\x00\x00\x00c".to_vec();
        let mut io = PacketIo::new(MemStream::new(wire));
        assert_eq!(io.read_packet().unwrap(), b"a");
        assert_eq!(io.read_packet().unwrap(), b"b");
        io.reset_sequence();
        assert_eq!(io.read_packet().unwrap(), b"c");
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let mut io = PacketIo::new(MemStream::new(Vec::new())).with_max_allowed_packet(4);
        match io.write_packet(b"too long") {
            Err(Error::Protocol(e)) => assert_eq!(e.kind, ProtocolErrorKind::TooLarge),
            other => panic!("expected too large, got {other:?}"),
        }
        assert!(io.get_ref().output.is_empty());
        assert_eq!(io.sequence(), 0);

        let mut io = PacketIo::new(MemStream::new(b"\x05\x00\x00\x00hello".to_vec()))
            .with_max_allowed_packet(4);
        assert!(matches!(
            io.read_packet(),
            Err(Error::Protocol(e)) if e.kind == ProtocolErrorKind::TooLarge
        ));
    }

    #[test]
    fn failed_writes_report_how_far_they_got() {
        let mut io = PacketIo::new(FailingSink { budget: 0 });
        let err = io.write_packet(b"ping").unwrap_err();
        assert!(err.is_retry_safe());
        assert_eq!(io.sequence(), 0);

        let mut io = PacketIo::new(FailingSink { budget: 3 });
        let err = io.write_packet(b"ping").unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref e) if e.kind == ConnectionErrorKind::Broken
        ));
        assert_eq!(io.sequence(), 0);
    }

    #[test]
    fn eof_while_reading_is_disconnect() {
        let mut io = PacketIo::new(MemStream::new(vec![0x05, 0x00]));
        assert!(matches!(
            io.read_packet(),
            Err(Error::Connection(ref e)) if e.kind == ConnectionErrorKind::Disconnected
        ));
    }
}
