//! Framed IO for the search sub-protocol.
//!
//! Search frames reuse the outer header shape but cannot go through the
//! plain frame reader: the header's digest field sits inside the
//! encrypted region, and integrity lives in the trailer instead. Frame
//! layout:
//!
//! - 28-byte header (length, magic, type, unused digest field)
//! - payload
//! - 20-byte trailer (plaintext digest + rotating key suffix)
//!
//! so `length = 48 + payload`. Reader and writer each carry their own
//! rotating key state.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::cipher::{SearchCodec, TRAILER_LEN};
use crate::frame::{Frame, HEADER_LEN, MAGIC, MAX_FRAME_LEN};

/// Smallest complete search frame: header plus trailer, empty payload.
pub const MIN_SEARCH_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;

#[derive(Debug)]
pub struct SearchFrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: SearchCodec,
}

impl<R> SearchFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            codec: SearchCodec::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> SearchFrameReader<R> {
    /// Read and decrypt one search frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` with the decrypted payload,
    /// - `Ok(None)` on clean EOF with no buffered data.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                    as usize;
                if len > MAX_FRAME_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "search frame too large",
                    ));
                }
                if len < MIN_SEARCH_FRAME_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "search frame shorter than header and trailer",
                    ));
                }

                if self.buf.len() >= len {
                    if self.buf[4..8] != MAGIC {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "bad search frame magic",
                        ));
                    }
                    let mut frame = vec![0u8; len];
                    frame.copy_from_slice(&self.buf[..len]);
                    self.buf.advance(len);

                    self.codec.open(&mut frame).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                    })?;

                    let packet_type =
                        u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
                    let payload = Bytes::copy_from_slice(&frame[HEADER_LEN..len - TRAILER_LEN]);
                    return Ok(Some(Frame {
                        packet_type,
                        payload,
                    }));
                }
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading search frame",
                ));
            }
        }
    }
}

#[derive(Debug)]
pub struct SearchFrameWriter<W> {
    inner: W,
    codec: SearchCodec,
}

impl<W> SearchFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            codec: SearchCodec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> SearchFrameWriter<W> {
    /// Seal and send one search frame.
    pub async fn write_frame(&mut self, packet_type: u32, payload: &[u8]) -> std::io::Result<()> {
        let len = MIN_SEARCH_FRAME_LEN + payload.len();
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "search frame too large",
            ));
        }

        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(&(len as u32).to_le_bytes());
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&packet_type.to_le_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        frame.extend_from_slice(payload);
        frame.resize(len, 0);

        self.codec
            .seal(&mut frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.inner.write_all(&frame).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_two_frames() {
        let (a, b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut sw = SearchFrameWriter::new(b);
            sw.write_frame(0x03, b"first payload").await.unwrap();
            sw.write_frame(0x15, b"second").await.unwrap();
            sw.flush().await.unwrap();
        });

        let mut sr = SearchFrameReader::new(a);
        let f1 = sr.read_frame().await.unwrap().unwrap();
        assert_eq!(f1.packet_type, 0x03);
        assert_eq!(&f1.payload[..], b"first payload");

        let f2 = sr.read_frame().await.unwrap().unwrap();
        assert_eq!(f2.packet_type, 0x15);
        assert_eq!(&f2.payload[..], b"second");
    }

    #[tokio::test]
    async fn empty_payload_frame_is_legal() {
        let (a, b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut sw = SearchFrameWriter::new(b);
            sw.write_frame(0x00, b"").await.unwrap();
        });

        let mut sr = SearchFrameReader::new(a);
        let f = sr.read_frame().await.unwrap().unwrap();
        assert_eq!(f.packet_type, 0x00);
        assert!(f.payload.is_empty());
    }

    #[tokio::test]
    async fn tampered_frame_is_rejected() {
        let (a, mut b) = tokio::io::duplex(256);

        let mut codec = SearchCodec::new();
        let len = MIN_SEARCH_FRAME_LEN + 8;
        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&(len as u32).to_le_bytes());
        frame[4..8].copy_from_slice(&MAGIC);
        codec.seal(&mut frame).unwrap();
        frame[30] ^= 0xFF;

        tokio::spawn(async move {
            b.write_all(&frame).await.unwrap();
        });

        let mut sr = SearchFrameReader::new(a);
        assert!(sr.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (a, mut b) = tokio::io::duplex(256);
        let len = MIN_SEARCH_FRAME_LEN;
        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&(len as u32).to_le_bytes());
        frame[4..8].copy_from_slice(b"XXXX");

        tokio::spawn(async move {
            b.write_all(&frame).await.unwrap();
        });

        let mut sr = SearchFrameReader::new(a);
        assert!(sr.read_frame().await.is_err());
    }
}
