//! Byte-exact reads with a poll cadence.
//!
//! The bootloader ports speak raw packed structs, so handlers need "read
//! exactly N bytes" with a bounded wait so they can come up for air once a
//! second to check shutdown and cross-handler signals. `read_exact` on a
//! plain stream is not cancellation-safe; this reader buffers instead.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

#[derive(Debug)]
pub enum ReadOutcome {
    Data(Bytes),
    TimedOut,
    Eof,
}

#[derive(Debug)]
pub struct PolledReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PolledReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Read exactly `n` bytes, waiting at most `wait`.
    ///
    /// Partial data stays buffered across calls, so a timeout never loses
    /// bytes already received.
    pub async fn read_exact_timeout(
        &mut self,
        n: usize,
        wait: Duration,
    ) -> std::io::Result<ReadOutcome> {
        let deadline = Instant::now() + wait;
        loop {
            if self.buf.len() >= n {
                return Ok(ReadOutcome::Data(self.buf.split_to(n).freeze()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadOutcome::TimedOut);
            }
            match tokio::time::timeout(deadline - now, self.inner.read_buf(&mut self.buf)).await {
                Err(_) => return Ok(ReadOutcome::TimedOut),
                Ok(Ok(0)) => return Ok(ReadOutcome::Eof),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_across_partial_writes() {
        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            b.write_all(b"he").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            b.write_all(b"llo").await.unwrap();
        });

        let mut pr = PolledReader::new(a);
        match pr.read_exact_timeout(5, Duration::from_secs(1)).await.unwrap() {
            ReadOutcome::Data(d) => assert_eq!(&d[..], b"hello"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_keeps_partial_data() {
        let (a, mut b) = tokio::io::duplex(64);
        b.write_all(b"hi").await.unwrap();

        let mut pr = PolledReader::new(a);
        assert!(matches!(
            pr.read_exact_timeout(4, Duration::from_millis(20)).await.unwrap(),
            ReadOutcome::TimedOut
        ));

        b.write_all(b"!!").await.unwrap();
        match pr.read_exact_timeout(4, Duration::from_secs(1)).await.unwrap() {
            ReadOutcome::Data(d) => assert_eq!(&d[..], b"hi!!"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_is_reported() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut pr = PolledReader::new(a);
        assert!(matches!(
            pr.read_exact_timeout(1, Duration::from_millis(20)).await.unwrap(),
            ReadOutcome::Eof
        ));
    }
}
