//! Wire frame format and the Framer (§3, §4.1).
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::PROTO_VERSION;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload length representable in the 16-bit `length` field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// A frame command (§6 wire table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Open a new stream.
    Syn,
    /// Close a stream (half-close from the sender's side).
    Fin,
    /// Carry stream payload.
    Psh,
    /// Keepalive/RTT probe.
    Nop,
    /// Reply to a `Nop` (or to a stream-buffer signal, when enabled).
    Ack,
    /// Peer's receive buffer for this stream is full; pause writing.
    Ful,
    /// Peer's receive buffer for this stream has drained; resume writing.
    Emp,
}

impl OpCode {
    #[inline]
    const fn to_u8(self) -> u8 {
        match self {
            Self::Syn => 0,
            Self::Fin => 1,
            Self::Psh => 2,
            Self::Nop => 3,
            Self::Ack => 4,
            Self::Ful => 5,
            Self::Emp => 6,
        }
    }

    #[inline]
    const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Syn),
            1 => Some(Self::Fin),
            2 => Some(Self::Psh),
            3 => Some(Self::Nop),
            4 => Some(Self::Ack),
            5 => Some(Self::Ful),
            6 => Some(Self::Emp),
            _ => None,
        }
    }
}

/// A decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version. Always [`PROTO_VERSION`] for frames this crate builds.
    pub ver: u8,
    /// The frame command.
    pub cmd: OpCode,
    /// Stream identifier; `0` for session-level control frames.
    pub sid: u32,
    /// Frame payload, 0..=65535 bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame with the local protocol version and no payload.
    #[must_use]
    pub fn control(cmd: OpCode, sid: u32) -> Self {
        Self {
            ver: PROTO_VERSION,
            cmd,
            sid,
            payload: Bytes::new(),
        }
    }

    /// Build a `Psh` frame carrying `payload`.
    ///
    /// # Panics
    /// Panics if `payload.len() > MAX_PAYLOAD`; callers are expected to chunk
    /// writes to `max_frame_size` before constructing a frame.
    #[must_use]
    pub fn push(sid: u32, payload: Bytes) -> Self {
        assert!(payload.len() <= MAX_PAYLOAD, "payload exceeds frame limit");
        Self {
            ver: PROTO_VERSION,
            cmd: OpCode::Psh,
            sid,
            payload,
        }
    }

    /// Encoded length of this frame, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize this frame into `buf`, replacing its contents.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.reserve(self.encoded_len());
        buf.put_u8(self.ver);
        buf.put_u8(self.cmd.to_u8());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u32_le(self.sid);
        buf.put_slice(&self.payload);
    }
}

/// Reads and writes frames on a transport, one frame at a time.
///
/// The Framer owns a reusable read buffer; [`Framer::decode`] returns a frame
/// whose payload is a fresh `Bytes` copied out of that buffer, so it is safe
/// to retain across the next `decode` call (unlike a zero-copy subslice of
/// the internal buffer).
#[derive(Debug, Default)]
pub struct Framer {
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Framer {
    /// Create a new Framer with empty buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode exactly one frame from `reader`.
    ///
    /// Returns `Ok(None)` on clean EOF before any header bytes are read.
    pub async fn decode<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Frame>> {
        self.read_buf.clear();
        self.read_buf.resize(HEADER_SIZE, 0);
        if let Err(e) = read_exact_or_eof(reader, &mut self.read_buf).await? {
            return Ok(e);
        }
        let ver = self.read_buf[0];
        if ver != PROTO_VERSION {
            return Err(Error::InvalidProtocol(ver));
        }
        let cmd_byte = self.read_buf[1];
        let cmd = OpCode::from_u8(cmd_byte).ok_or(Error::UnknownCommand(cmd_byte))?;
        let length = u16::from_le_bytes([self.read_buf[2], self.read_buf[3]]) as usize;
        let sid = u32::from_le_bytes([
            self.read_buf[4],
            self.read_buf[5],
            self.read_buf[6],
            self.read_buf[7],
        ]);
        let payload = if length == 0 {
            Bytes::new()
        } else {
            self.read_buf.resize(length, 0);
            reader.read_exact(&mut self.read_buf[..length]).await?;
            Bytes::copy_from_slice(&self.read_buf[..length])
        };
        Ok(Some(Frame {
            ver,
            cmd,
            sid,
            payload,
        }))
    }

    /// Encode and write `frame` to `writer` with a single `write_all` call
    /// over the concatenated header+payload buffer.
    pub async fn encode<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        frame: &Frame,
    ) -> Result<usize> {
        frame.encode_into(&mut self.write_buf);
        writer.write_all(&self.write_buf).await?;
        Ok(self.write_buf.len())
    }
}

/// Read `buf.len()` bytes, or report a clean EOF if the very first read
/// returns zero bytes (mid-header EOF is a genuine transport error).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<std::result::Result<(), Option<Frame>>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(Err(None));
            }
            return Err(Error::Transport(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        filled += n;
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_empty_payload() {
        let frame = Frame::control(OpCode::Nop, 0);
        let mut framer = Framer::new();
        let mut buf = Vec::new();
        framer.encode(&mut buf, &frame).await.unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut reader = &buf[..];
        let mut decoder = Framer::new();
        let decoded = decoder.decode(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn round_trips_max_payload() {
        let payload = Bytes::from(vec![0xABu8; MAX_PAYLOAD]);
        let frame = Frame::push(1, payload);
        let mut framer = Framer::new();
        let mut buf = Vec::new();
        framer.encode(&mut buf, &frame).await.unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + MAX_PAYLOAD);

        let mut reader = &buf[..];
        let decoded = Framer::new().decode(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn echo_small_frame_matches_spec_bytes() {
        let frame = Frame::push(1, Bytes::from_static(b"hi"));
        let mut framer = Framer::new();
        let mut buf = Vec::new();
        framer.encode(&mut buf, &frame).await.unwrap();
        assert_eq!(
            buf,
            vec![PROTO_VERSION, OpCode::Psh.to_u8(), 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, b'h', b'i']
        );
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let mut buf = vec![0xFFu8, OpCode::Nop.to_u8(), 0, 0, 0, 0, 0, 0];
        let mut reader = &buf[..];
        let err = Framer::new().decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::InvalidProtocol(0xFF)));
        buf.clear();
    }

    #[tokio::test]
    async fn rejects_unknown_command() {
        let buf = vec![PROTO_VERSION, 0x7F, 0, 0, 0, 0, 0, 0];
        let mut reader = &buf[..];
        let err = Framer::new().decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(0x7F)));
    }

    #[tokio::test]
    async fn clean_eof_before_header() {
        let buf: Vec<u8> = Vec::new();
        let mut reader = &buf[..];
        let decoded = Framer::new().decode(&mut reader).await.unwrap();
        assert!(decoded.is_none());
    }
}
