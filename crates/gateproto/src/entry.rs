//! Full details of a single character, as carried on the message bus and
//! (zero-filled except ids) on the bootloader data port.
//!
//! Wire encoding (packed, little-endian, 50 bytes):
//! - content_id: u32
//! - enabled: u8 (0/1)
//! - character_id: u32
//! - name: 16 bytes, NUL-padded
//! - world_id: u16
//! - main_job: u8
//! - main_job_level: u8
//! - zone: u16
//! - race: u8
//! - face: u8
//! - hair: u8
//! - size: u8
//! - nation: u8
//! - head, body, hands, legs, feet, main, sub: u16 each

use crate::wire;
use crate::ProtoError;

pub const CHARACTER_ENTRY_LEN: usize = 50;

pub const NAME_FIELD_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterEntry {
    pub content_id: u32,
    pub enabled: bool,
    pub character_id: u32,
    pub name: String,
    pub world_id: u16,
    pub main_job: u8,
    pub main_job_level: u8,
    pub zone: u16,
    pub race: u8,
    pub face: u8,
    pub hair: u8,
    pub size: u8,
    pub nation: u8,
    pub head: u16,
    pub body: u16,
    pub hands: u16,
    pub legs: u16,
    pub feet: u16,
    pub main: u16,
    pub sub: u16,
}

impl CharacterEntry {
    /// World id scope of a committed character: the high 16 bits of its id.
    pub fn world_of(character_id: u32) -> u16 {
        (character_id >> 16) as u16
    }

    /// Per-world serial part of a character id.
    pub fn serial_of(character_id: u32) -> u16 {
        (character_id & 0xFFFF) as u16
    }

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, CHARACTER_ENTRY_LEN)?;
        Ok(Self {
            content_id: wire::u32_at(b, 0),
            enabled: b[4] != 0,
            character_id: wire::u32_at(b, 5),
            name: wire::fixed_str(&b[9..25])?.to_string(),
            world_id: wire::u16_at(b, 25),
            main_job: b[27],
            main_job_level: b[28],
            zone: wire::u16_at(b, 29),
            race: b[31],
            face: b[32],
            hair: b[33],
            size: b[34],
            nation: b[35],
            head: wire::u16_at(b, 36),
            body: wire::u16_at(b, 38),
            hands: wire::u16_at(b, 40),
            legs: wire::u16_at(b, 42),
            feet: wire::u16_at(b, 44),
            main: wire::u16_at(b, 46),
            sub: wire::u16_at(b, 48),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.content_id.to_le_bytes());
        out.push(self.enabled as u8);
        out.extend_from_slice(&self.character_id.to_le_bytes());
        wire::put_fixed_str(out, &self.name, NAME_FIELD_LEN);
        out.extend_from_slice(&self.world_id.to_le_bytes());
        out.push(self.main_job);
        out.push(self.main_job_level);
        out.extend_from_slice(&self.zone.to_le_bytes());
        out.push(self.race);
        out.push(self.face);
        out.push(self.hair);
        out.push(self.size);
        out.push(self.nation);
        for w in [
            self.head, self.body, self.hands, self.legs, self.feet, self.main, self.sub,
        ] {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHARACTER_ENTRY_LEN);
        self.encode_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CharacterEntry {
        CharacterEntry {
            content_id: 672,
            enabled: true,
            character_id: (3 << 16) | 7,
            name: "Alice".to_string(),
            world_id: 3,
            main_job: 1,
            main_job_level: 1,
            zone: 0xEA,
            race: 2,
            face: 4,
            hair: 1,
            size: 0,
            nation: 1,
            head: 0x1000,
            body: 0x2001,
            hands: 0,
            legs: 0,
            feet: 0,
            main: 0x3002,
            sub: 0,
        }
    }

    #[test]
    fn encode_is_fixed_width() {
        assert_eq!(sample().encode().len(), CHARACTER_ENTRY_LEN);
    }

    #[test]
    fn round_trips() {
        let e = sample();
        assert_eq!(CharacterEntry::parse(&e.encode()).unwrap(), e);
    }

    #[test]
    fn world_split_matches_id_layout() {
        let id = (42u32 << 16) | 0x0101;
        assert_eq!(CharacterEntry::world_of(id), 42);
        assert_eq!(CharacterEntry::serial_of(id), 0x0101);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let e = sample().encode();
        assert!(matches!(
            CharacterEntry::parse(&e[..CHARACTER_ENTRY_LEN - 1]),
            Err(ProtoError::TooShort { .. })
        ));
    }
}
