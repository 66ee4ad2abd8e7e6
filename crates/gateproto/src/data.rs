//! Bootloader data port protocol.
//!
//! Server-to-client requests are a single byte; the client answers with a
//! one-byte type followed by a type-specific payload.

use crate::entry::CharacterEntry;
use crate::wire;
use crate::ProtoError;

pub const S2C_SEND_ACCOUNT_ID: u8 = 1;
pub const S2C_SEND_KEY: u8 = 2;
pub const S2C_CHARACTER_LIST: u8 = 3;

pub const C2S_ACCOUNT_ID: u8 = 0xA1;
pub const C2S_KEY: u8 = 0xA2;

pub const ACCOUNT_ID_PAYLOAD_LEN: usize = 8;
pub const KEY_LEN: usize = 24;

/// Payload of `C2S_ACCOUNT_ID`: account id + the server address the
/// bootloader thinks it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountIdPayload {
    pub account_id: u32,
    pub server_address: u32,
}

impl AccountIdPayload {
    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, ACCOUNT_ID_PAYLOAD_LEN)?;
        Ok(Self {
            account_id: wire::u32_at(b, 0),
            server_address: wire::u32_at(b, 4),
        })
    }
}

/// Encode the minimal character list sent on the data port:
/// `{type u8, count u8}` prefix followed by one full-width entry per
/// content id with only `content_id` and `character_id` populated.
pub fn encode_character_list(slots: &[(u32, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + slots.len() * crate::entry::CHARACTER_ENTRY_LEN);
    out.push(S2C_CHARACTER_LIST);
    out.push(slots.len() as u8);
    for &(content_id, character_id) in slots {
        let entry = CharacterEntry {
            content_id,
            character_id,
            ..Default::default()
        };
        entry.encode_into(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CHARACTER_ENTRY_LEN;

    #[test]
    fn account_id_payload_parses() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&42u32.to_le_bytes());
        raw.extend_from_slice(&0x0A00_0001u32.to_le_bytes());
        let p = AccountIdPayload::parse(&raw).unwrap();
        assert_eq!(p.account_id, 42);
        assert_eq!(p.server_address, 0x0A00_0001);
    }

    #[test]
    fn character_list_layout() {
        let raw = encode_character_list(&[(672, 0x0003_0001), (673, 0)]);
        assert_eq!(raw.len(), 2 + 2 * CHARACTER_ENTRY_LEN);
        assert_eq!(raw[0], S2C_CHARACTER_LIST);
        assert_eq!(raw[1], 2);

        let first = CharacterEntry::parse(&raw[2..]).unwrap();
        assert_eq!(first.content_id, 672);
        assert_eq!(first.character_id, 0x0003_0001);
        assert_eq!(first.name, "");
        assert_eq!(first.main_job, 0);
    }
}
