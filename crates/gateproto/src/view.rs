//! View port payloads.
//!
//! The view port speaks `gateio::frame` framing; these are the payload
//! codecs for the packet types the server understands.

use crate::entry::CharacterEntry;
use crate::wire;
use crate::ProtoError;

pub const TYPE_DONE: u32 = 0x03;
pub const TYPE_ERROR: u32 = 0x04;
pub const TYPE_FEATURES_LIST: u32 = 0x05;
pub const TYPE_LOGIN_REQUEST: u32 = 0x07;
pub const TYPE_LOGIN_RESPONSE: u32 = 0x0B;
pub const TYPE_DELETE_CHARACTER: u32 = 0x14;
pub const TYPE_GET_CHARACTER_LIST: u32 = 0x1F;
pub const TYPE_CHARACTER_LIST: u32 = 0x20;
pub const TYPE_CREATE_CHAR_CONFIRM: u32 = 0x21;
pub const TYPE_CREATE_CHARACTER: u32 = 0x22;
pub const TYPE_WORLD_LIST: u32 = 0x23;
pub const TYPE_GET_WORLD_LIST: u32 = 0x24;
pub const TYPE_GET_FEATURES: u32 = 0x26;

pub const ERR_MAP_CONNECT_FAILED: u32 = 305;
pub const ERR_NAME_ALREADY_TAKEN: u32 = 313;
pub const ERR_CREATE_DENIED: u32 = 314;
pub const ERR_LOGIN_DENIED: u32 = 321;
pub const ERR_VERSION_MISMATCH: u32 = 331;

/// Reserved field of the features packet. Meaning unknown; the client
/// expects exactly this value.
pub const FEATURES_MARKER: u32 = 0xAD5D_E04F;

/// Offset and width of the client version string inside `GET_FEATURES`.
pub const VERSION_OFFSET: usize = 88;
pub const VERSION_LEN: usize = 10;

/// Number of slots in the view-port character list; fixed regardless of
/// how many content ids the account owns.
pub const CHARACTER_LIST_SLOTS: usize = 16;

const LIST_ENTRY_LEN: usize = 72;

/// Extract the 10-byte client version from a `GET_FEATURES` payload.
/// The field is not NUL-terminated when all ten bytes are used.
pub fn parse_client_version(payload: &[u8]) -> Result<String, ProtoError> {
    wire::need(payload, VERSION_OFFSET + VERSION_LEN)?;
    let field = &payload[VERSION_OFFSET..VERSION_OFFSET + VERSION_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(VERSION_LEN);
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| ProtoError::Malformed("client version not utf-8"))
}

/// `FEATURES_LIST` payload: marker, expansions, features.
pub fn encode_features_list(expansions: u32, features: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&FEATURES_MARKER.to_le_bytes());
    out.extend_from_slice(&expansions.to_le_bytes());
    out.extend_from_slice(&features.to_le_bytes());
    out
}

/// `ERROR` payload: `{zero u32, error_code u32}`.
pub fn encode_error(code: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&code.to_le_bytes());
    out
}

/// `DONE` body: four zero bytes of unknown meaning.
pub fn encode_done() -> Vec<u8> {
    vec![0, 0, 0, 0]
}

/// `LOGIN_REQUEST` payload prefix; trailing bytes are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub content_id: u32,
    pub character_id: u32,
    pub name: String,
}

impl LoginRequest {
    pub const MIN_LEN: usize = 24;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::MIN_LEN)?;
        Ok(Self {
            content_id: wire::u32_at(b, 0),
            character_id: wire::u32_at(b, 4),
            name: wire::fixed_str(&b[8..24])?.to_string(),
        })
    }
}

/// `LOGIN_RESPONSE` payload: the zone hand-off. The `unknown` field has no
/// documented meaning and is always 2.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub content_id: u32,
    pub character_id: u32,
    pub name: String,
    pub zone_ip: u32,
    pub zone_port: u16,
    pub search_ip: u32,
    pub search_port: u16,
}

impl LoginResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44);
        out.extend_from_slice(&self.content_id.to_le_bytes());
        out.extend_from_slice(&self.character_id.to_le_bytes());
        wire::put_fixed_str(&mut out, &self.name, 16);
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&self.zone_ip.to_le_bytes());
        out.extend_from_slice(&self.zone_port.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.search_ip.to_le_bytes());
        out.extend_from_slice(&self.search_port.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }
}

/// `CREATE_CHARACTER` (reserve) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub content_id: u32,
    pub name: String,
    pub world_name: String,
}

impl CreateRequest {
    pub const MIN_LEN: usize = 36;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::MIN_LEN)?;
        Ok(Self {
            content_id: wire::u32_at(b, 0),
            name: wire::fixed_str(&b[4..20])?.to_string(),
            world_name: wire::fixed_str(&b[20..36])?.to_string(),
        })
    }
}

/// `CREATE_CHAR_CONFIRM` payload: content id plus the full entry the
/// client filled in on the appearance screen.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub content_id: u32,
    pub details: CharacterEntry,
}

impl ConfirmRequest {
    pub const MIN_LEN: usize = 4 + crate::entry::CHARACTER_ENTRY_LEN;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::MIN_LEN)?;
        Ok(Self {
            content_id: wire::u32_at(b, 0),
            details: CharacterEntry::parse(&b[4..])?,
        })
    }
}

/// `DELETE_CHARACTER` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRequest {
    pub content_id: u32,
    pub character_id: u32,
}

impl DeleteRequest {
    pub const MIN_LEN: usize = 8;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::MIN_LEN)?;
        Ok(Self {
            content_id: wire::u32_at(b, 0),
            character_id: wire::u32_at(b, 4),
        })
    }
}

/// One slot of the view-port character list.
#[derive(Debug, Clone)]
pub struct CharacterListSlot<'a> {
    pub enabled: bool,
    pub world_name: &'a str,
    pub entry: &'a CharacterEntry,
}

/// `CHARACTER_LIST` payload: `{slot_count u32}` then exactly sixteen
/// 72-byte slots, vacant ones zero-filled.
///
/// Slot layout: content_id u32, enabled u32, character_id u32, name[16],
/// world_name[16], race u8, main_job u8, main_job_level u8, face u8,
/// hair u8, size u8, nation u8, pad u8, zone u16, marker u16 (always
/// 0x0001 on occupied slots), head/body/hands/legs/feet/main/sub u16,
/// pad u16.
pub fn encode_character_list(slots: &[CharacterListSlot<'_>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + CHARACTER_LIST_SLOTS * LIST_ENTRY_LEN);
    out.extend_from_slice(&(CHARACTER_LIST_SLOTS as u32).to_le_bytes());
    for i in 0..CHARACTER_LIST_SLOTS {
        let Some(slot) = slots.get(i) else {
            out.resize(out.len() + LIST_ENTRY_LEN, 0);
            continue;
        };
        let e = slot.entry;
        out.extend_from_slice(&e.content_id.to_le_bytes());
        out.extend_from_slice(&(slot.enabled as u32).to_le_bytes());
        out.extend_from_slice(&e.character_id.to_le_bytes());
        wire::put_fixed_str(&mut out, &e.name, 16);
        wire::put_fixed_str(&mut out, slot.world_name, 16);
        out.push(e.race);
        out.push(e.main_job);
        out.push(e.main_job_level);
        out.push(e.face);
        out.push(e.hair);
        out.push(e.size);
        out.push(e.nation);
        out.push(0);
        out.extend_from_slice(&e.zone.to_le_bytes());
        let marker: u16 = if e.character_id != 0 { 0x0001 } else { 0 };
        out.extend_from_slice(&marker.to_le_bytes());
        for w in [e.head, e.body, e.hands, e.legs, e.feet, e.main, e.sub] {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_version_reads_ten_bytes_at_offset() {
        let mut payload = vec![0u8; 100];
        payload[VERSION_OFFSET..VERSION_OFFSET + VERSION_LEN].copy_from_slice(b"30191004_0");
        assert_eq!(parse_client_version(&payload).unwrap(), "30191004_0");
    }

    #[test]
    fn short_features_payload_is_rejected() {
        let payload = vec![0u8; VERSION_OFFSET];
        assert!(matches!(
            parse_client_version(&payload),
            Err(ProtoError::TooShort { .. })
        ));
    }

    #[test]
    fn features_list_carries_marker() {
        let raw = encode_features_list(0x1FFF, 0x0001);
        assert_eq!(&raw[..4], &FEATURES_MARKER.to_le_bytes());
        assert_eq!(&raw[4..8], &0x1FFFu32.to_le_bytes());
        assert_eq!(&raw[8..12], &0x0001u32.to_le_bytes());
    }

    #[test]
    fn error_payload_layout() {
        let raw = encode_error(ERR_MAP_CONNECT_FAILED);
        assert_eq!(&raw[..4], &[0, 0, 0, 0]);
        assert_eq!(&raw[4..8], &305u32.to_le_bytes());
    }

    #[test]
    fn login_request_parses_prefix_and_ignores_tail() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&672u32.to_le_bytes());
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(b"Alice\0\0\0\0\0\0\0\0\0\0\0");
        raw.extend_from_slice(&[0xFF; 12]);
        let req = LoginRequest::parse(&raw).unwrap();
        assert_eq!(req.content_id, 672);
        assert_eq!(req.character_id, 3);
        assert_eq!(req.name, "Alice");
    }

    #[test]
    fn login_response_unknown_field_is_two() {
        let resp = LoginResponse {
            content_id: 672,
            character_id: 0x0003_0001,
            name: "Alice".into(),
            zone_ip: 0x0500_000A,
            zone_port: 54230,
            search_ip: 0x0600_000A,
            search_port: 54002,
        };
        let raw = resp.encode();
        assert_eq!(raw.len(), 44);
        assert_eq!(&raw[24..28], &2u32.to_le_bytes());
    }

    #[test]
    fn character_list_is_sixteen_slots() {
        let entry = CharacterEntry {
            content_id: 672,
            enabled: true,
            character_id: 0x0003_0001,
            name: "Alice".into(),
            world_id: 3,
            ..Default::default()
        };
        let slots = [CharacterListSlot {
            enabled: true,
            world_name: "Titan",
            entry: &entry,
        }];
        let raw = encode_character_list(&slots);
        assert_eq!(raw.len(), 4 + 16 * LIST_ENTRY_LEN);
        assert_eq!(&raw[..4], &16u32.to_le_bytes());
        // First slot carries the entry, second slot is vacant.
        assert_eq!(&raw[4..8], &672u32.to_le_bytes());
        assert!(raw[4 + LIST_ENTRY_LEN..4 + 2 * LIST_ENTRY_LEN]
            .iter()
            .all(|&b| b == 0));
    }
}
