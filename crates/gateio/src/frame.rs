use bytes::{Buf, Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Frame header: length (4) + magic (4) + type (4) + digest (16).
pub const HEADER_LEN: usize = 28;

/// Magic bytes at offset 4 of every frame.
pub const MAGIC: [u8; 4] = *b"IXFF";

/// Hard cap on a single frame. Anything bigger is a crash attempt.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One decoded frame. `payload` excludes the 28-byte header.
#[derive(Debug, Clone)]
pub struct Frame {
    pub packet_type: u32,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read one framed packet.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` for a decoded frame,
    /// - `Ok(None)` on clean EOF with no buffered data.
    ///
    /// The digest field covers the whole frame with itself zeroed. Live
    /// clients have been observed sending an all-zero digest, so a zero
    /// digest is accepted; anything else must match.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                    as usize;
                if len > MAX_FRAME_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame too large",
                    ));
                }
                if len < HEADER_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame shorter than header",
                    ));
                }

                if self.buf.len() >= len {
                    if self.buf[4..8] != MAGIC {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "bad frame magic",
                        ));
                    }
                    let digest = &self.buf[12..28];
                    if digest.iter().any(|&b| b != 0) {
                        let mut h = Md5::new();
                        h.update(&self.buf[..12]);
                        h.update([0u8; 16]);
                        h.update(&self.buf[28..len]);
                        if h.finalize()[..] != self.buf[12..28] {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "frame digest mismatch",
                            ));
                        }
                    }
                    let packet_type =
                        u32::from_le_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);
                    self.buf.advance(HEADER_LEN);
                    let payload = self.buf.split_to(len - HEADER_LEN).freeze();
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
                    "eof while reading frame",
                ));
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Frame and send one packet. The digest is always populated on send.
    pub async fn write_frame(&mut self, packet_type: u32, payload: &[u8]) -> std::io::Result<()> {
        let frame = encode_frame(packet_type, payload)?;
        self.inner.write_all(&frame).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

/// Build a complete frame (header + payload) with the digest filled in.
pub fn encode_frame(packet_type: u32, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let len = HEADER_LEN + payload.len();
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }

    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&packet_type.to_le_bytes());
    frame.extend_from_slice(&[0u8; 16]);
    frame.extend_from_slice(payload);

    let digest = Md5::digest(&frame);
    frame[12..28].copy_from_slice(&digest);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_frame() {
        let (a, b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut fw = FrameWriter::new(b);
            fw.write_frame(0x26, b"hello").await.unwrap();
            fw.flush().await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(f.packet_type, 0x26);
        assert_eq!(&f.payload[..], b"hello");
    }

    #[tokio::test]
    async fn header_only_frame_is_legal() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut fw = FrameWriter::new(b);
            fw.write_frame(0x03, b"").await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(f.packet_type, 0x03);
        assert!(f.payload.is_empty());
    }

    #[tokio::test]
    async fn accepts_zero_digest() {
        let mut frame = encode_frame(0x1F, b"payload").unwrap();
        frame[12..28].fill(0);

        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            b.write_all(&frame).await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(&f.payload[..], b"payload");
    }

    #[tokio::test]
    async fn rejects_corrupt_digest() {
        let mut frame = encode_frame(0x1F, b"payload").unwrap();
        frame[12] ^= 0xFF;

        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            b.write_all(&frame).await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        assert!(fr.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut frame = encode_frame(0x1F, b"").unwrap();
        frame[4] = b'X';

        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            b.write_all(&frame).await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        assert!(fr.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn rejects_oversize_length() {
        let mut frame = encode_frame(0x1F, b"").unwrap();
        frame[..4].copy_from_slice(&(2u32 * 1024 * 1024).to_le_bytes());

        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            b.write_all(&frame).await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        assert!(fr.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn eof_between_frames_is_clean() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut fr = FrameReader::new(a);
        assert!(fr.read_frame().await.unwrap().is_none());
    }
}
