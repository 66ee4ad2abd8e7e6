//! Search sub-protocol packet cipher.
//!
//! Search/AH frames reuse the outer framing but block-encrypt everything
//! between offset 8 and `length - 20`:
//!
//! - `[0..4)`   length (cleartext)
//! - `[4..8)`   magic (cleartext)
//! - `[8..len-20)`  encrypted region (packet type, payload, outer digest)
//! - `[len-20..len-4)` 16-byte digest of the *plaintext* region
//! - `[len-4..len)` rotating 4-byte key suffix (cleartext)
//!
//! The 24-byte key starts from a fixed, documented literal; the last four
//! bytes are replaced by the suffix of every received packet. Sends echo
//! the current suffix rather than rotating it locally.

use md5::{Digest, Md5};

/// Initial key used by the search server. Rotates with each packet.
pub const SEARCH_INITIAL_KEY: [u8; 24] = [
    0x30, 0x73, 0x3D, 0x6D, //
    0x3C, 0x31, 0x49, 0x5A, //
    0x32, 0x7A, 0x42, 0x43, //
    0x63, 0x38, 0x7B, 0x7E, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00,
];

/// Trailer appended after the encrypted region: digest (16) + key suffix (4).
pub const TRAILER_LEN: usize = 20;

/// Smallest sealable frame: 8 cleartext header bytes plus the trailer.
pub const MIN_FRAME_LEN: usize = 8 + TRAILER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    FrameTooShort { need: usize, got: usize },
    DigestMismatch,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::FrameTooShort { need, got } => {
                write!(f, "search frame too short: need {need}, got {got}")
            }
            CipherError::DigestMismatch => write!(f, "search frame digest mismatch"),
        }
    }
}

impl std::error::Error for CipherError {}

/// 64-bit-block, 8-round Feistel variant keyed from the 24-byte buffer.
///
/// Only whole 8-byte blocks are transformed; a trailing partial block is
/// carried in the clear, matching the reference framing.
struct BlockCipher {
    rk: [u32; 8],
}

impl BlockCipher {
    fn new(key: &[u8; 24]) -> Self {
        let mut w = [0u32; 6];
        for (i, word) in w.iter_mut().enumerate() {
            *word = u32::from_le_bytes([
                key[i * 4],
                key[i * 4 + 1],
                key[i * 4 + 2],
                key[i * 4 + 3],
            ]);
        }

        let mut rk = [0u32; 8];
        let mut s: u32 = 0xB7E1_5163;
        for (i, k) in rk.iter_mut().enumerate() {
            s = s
                .wrapping_add(w[i % 6])
                .wrapping_mul(0x9E37_79B9)
                .rotate_left(7);
            *k = s;
        }
        Self { rk }
    }

    fn round(x: u32, k: u32) -> u32 {
        let t = x.wrapping_add(k);
        (t.rotate_left(4) ^ t.rotate_left(13) ^ (t >> 5)).wrapping_mul(0x0100_0193)
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let mut l = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let mut r = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        for k in self.rk {
            let t = r;
            r = l ^ Self::round(r, k);
            l = t;
        }
        block[..4].copy_from_slice(&l.to_le_bytes());
        block[4..].copy_from_slice(&r.to_le_bytes());
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let mut l = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let mut r = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        for k in self.rk.iter().rev() {
            let t = l;
            l = r ^ Self::round(l, *k);
            r = t;
        }
        block[..4].copy_from_slice(&l.to_le_bytes());
        block[4..].copy_from_slice(&r.to_le_bytes());
    }

    fn encrypt_in_place(&self, buf: &mut [u8]) {
        for block in buf.chunks_exact_mut(8) {
            self.encrypt_block(block);
        }
    }

    fn decrypt_in_place(&self, buf: &mut [u8]) {
        for block in buf.chunks_exact_mut(8) {
            self.decrypt_block(block);
        }
    }
}

/// Per-connection codec holding the rotating key state.
#[derive(Debug)]
pub struct SearchCodec {
    key: [u8; 24],
}

impl Default for SearchCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchCodec {
    pub fn new() -> Self {
        Self {
            key: SEARCH_INITIAL_KEY,
        }
    }

    /// Digest and encrypt a fully built frame in place.
    ///
    /// The last 20 bytes of `frame` are overwritten with the plaintext
    /// digest and the current key suffix.
    pub fn seal(&mut self, frame: &mut [u8]) -> Result<(), CipherError> {
        let len = frame.len();
        if len < MIN_FRAME_LEN {
            return Err(CipherError::FrameTooShort {
                need: MIN_FRAME_LEN,
                got: len,
            });
        }

        let digest = Md5::digest(&frame[8..len - TRAILER_LEN]);
        frame[len - 20..len - 4].copy_from_slice(&digest);
        frame[len - 4..].copy_from_slice(&self.key[16..20]);

        let cipher = BlockCipher::new(&self.key);
        cipher.encrypt_in_place(&mut frame[8..len - TRAILER_LEN]);
        Ok(())
    }

    /// Recover the key suffix, decrypt in place and verify the digest.
    pub fn open(&mut self, frame: &mut [u8]) -> Result<(), CipherError> {
        let len = frame.len();
        if len < MIN_FRAME_LEN {
            return Err(CipherError::FrameTooShort {
                need: MIN_FRAME_LEN,
                got: len,
            });
        }

        let mut suffix = [0u8; 4];
        suffix.copy_from_slice(&frame[len - 4..]);
        self.key[16..20].copy_from_slice(&suffix);

        let cipher = BlockCipher::new(&self.key);
        cipher.decrypt_in_place(&mut frame[8..len - TRAILER_LEN]);

        let digest = Md5::digest(&frame[8..len - TRAILER_LEN]);
        if digest[..] != frame[len - 20..len - 4] {
            return Err(CipherError::DigestMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trips() {
        let cipher = BlockCipher::new(&SEARCH_INITIAL_KEY);
        let mut block = *b"\x01\x02\x03\x04\x05\x06\x07\x08";
        cipher.encrypt_block(&mut block);
        assert_ne!(&block, b"\x01\x02\x03\x04\x05\x06\x07\x08");
        cipher.decrypt_block(&mut block);
        assert_eq!(&block, b"\x01\x02\x03\x04\x05\x06\x07\x08");
    }

    #[test]
    fn seal_then_open_round_trips() {
        let mut tx = SearchCodec::new();
        let mut rx = SearchCodec::new();

        let mut frame = vec![0u8; 8 + 24 + TRAILER_LEN];
        let frame_len = frame.len() as u32;
        frame[..4].copy_from_slice(&frame_len.to_le_bytes());
        frame[4..8].copy_from_slice(b"IXFF");
        frame[8..32].copy_from_slice(b"search body 24 bytes okk");

        tx.seal(&mut frame).unwrap();
        assert_ne!(&frame[8..32], b"search body 24 bytes okk");

        rx.open(&mut frame).unwrap();
        assert_eq!(&frame[8..32], b"search body 24 bytes okk");
    }

    #[test]
    fn suffix_rotation_tracks_peer() {
        let mut tx = SearchCodec::new();
        // Pretend the peer rotated its tail.
        tx.key[16..20].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut frame = vec![0u8; 8 + 8 + TRAILER_LEN];
        frame[4..8].copy_from_slice(b"IXFF");
        tx.seal(&mut frame).unwrap();

        let mut rx = SearchCodec::new();
        rx.open(&mut frame).unwrap();
        assert_eq!(&rx.key[16..20], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn open_rejects_tampering() {
        let mut tx = SearchCodec::new();
        let mut frame = vec![0u8; 8 + 16 + TRAILER_LEN];
        frame[4..8].copy_from_slice(b"IXFF");
        tx.seal(&mut frame).unwrap();
        frame[10] ^= 0x55;

        let mut rx = SearchCodec::new();
        assert_eq!(rx.open(&mut frame), Err(CipherError::DigestMismatch));
    }

    #[test]
    fn partial_trailing_block_is_untouched() {
        // Region of 11 bytes: one whole block encrypted, 3 bytes clear.
        let mut tx = SearchCodec::new();
        let mut frame = vec![0u8; 8 + 11 + TRAILER_LEN];
        frame[4..8].copy_from_slice(b"IXFF");
        frame[16..19].copy_from_slice(b"abc");
        tx.seal(&mut frame).unwrap();
        assert_eq!(&frame[16..19], b"abc");
    }
}
