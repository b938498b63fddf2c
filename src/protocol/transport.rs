use std::io::{self, Read, Write};

use thiserror::Error;

use super::{FrameError, HEADER_SIZE, Header, Packet, encode_frame};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
}

/// Blocking frame reader/writer over a bidirectional stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    max_packet_size: u32,
    scratch: Vec<u8>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T, max_packet_size: u32) -> Self {
        Self {
            stream,
            max_packet_size,
            scratch: Vec::with_capacity(max_packet_size as usize),
        }
    }

    /// Writes one frame. The header length must match the payload.
    pub fn write_packet(&mut self, header: Header, payload: &[u8]) -> Result<(), TransportError> {
        header.validate(self.max_packet_size)?;
        self.scratch.resize(header.length as usize, 0);
        encode_frame(header, payload, &mut self.scratch)?;
        self.stream.write_all(&self.scratch)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Writes an already encoded frame verbatim.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads exactly one frame, blocking until it has fully arrived.
    pub fn read_packet(&mut self) -> Result<Packet, TransportError> {
        let mut buf = [0u8; HEADER_SIZE];
        self.read_exact(&mut buf)?;
        let header = Header::decode(&buf)?;
        header.validate(self.max_packet_size)?;

        let mut payload = vec![0u8; header.payload_len()];
        self.read_exact(&mut payload)?;
        Ok(Packet { header, payload })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;

    #[test]
    fn read_write_packet() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream, 64);

        let packet = Packet::new(5, b"payload".to_vec()).unwrap();
        transport.write_packet(packet.header, &packet.payload).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        assert_eq!(transport.read_packet().unwrap(), packet);
    }

    #[test]
    fn read_rejects_oversize() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        Header {
            length: 100,
            kind: 1,
        }
        .encode_into(&mut bytes)
        .unwrap();
        let mut transport = ProtocolTransport::new(Cursor::new(bytes), 64);

        assert!(matches!(
            transport.read_packet(),
            Err(TransportError::Frame(FrameError::Oversize { .. }))
        ));
    }

    #[test]
    fn read_reports_closed_stream() {
        let mut transport = ProtocolTransport::new(Cursor::new(vec![1, 2]), 64);
        assert!(matches!(
            transport.read_packet(),
            Err(TransportError::Closed)
        ));
    }
}
