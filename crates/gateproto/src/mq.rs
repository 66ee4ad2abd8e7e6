//! Messages exchanged with world servers over the broker.
//!
//! Every message starts with the fixed 16-byte header; the body depends on
//! the type. Bytes are packed little-endian. Published content type is
//! `application/octet-stream`.

use crate::entry::CharacterEntry;
use crate::wire;
use crate::ProtoError;

/// Queue consumed by the login server.
pub const LOGIN_MQ_NAME: &str = "LOGIN_MQ";
/// Queue consumed by a world server.
pub const WORLD_MQ_NAME: &str = "WORLD_MQ";

pub const MSG_GET_ACCOUNT_CHARS: u32 = 1;
pub const MSG_CHAR_UPDATE: u32 = 2;
pub const MSG_CHAR_LOGIN: u32 = 3;
pub const MSG_CHAR_LOGIN_ACK: u32 = 4;
pub const MSG_CHAR_ZONE: u32 = 5;
/// Same value as `MSG_CHAR_ZONE`; disambiguated by direction. The login
/// side never consumes zone-change notifications, so an inbound 5 there is
/// always a create ack; the world side never consumes create acks.
pub const MSG_CHAR_CREATE_ACK: u32 = 5;
pub const MSG_CHAR_GEAR: u32 = 6;
pub const MSG_CHAR_CREATE: u32 = 7;
pub const MSG_CHAR_DELETE: u32 = 8;
pub const MSG_CHAR_DELETE_ACK: u32 = 9;
pub const MSG_CHAR_RESERVE: u32 = 10;
pub const MSG_CHAR_RESERVE_ACK: u32 = 11;
pub const MSG_LOGIN_FULL_SYNC: u32 = 12;
pub const MSG_UNIVERSAL_ANNOUNCEMENT: u32 = 13;

/// Character-message range claimed by the character router; anything
/// outside is passed to subsequent handlers.
pub const CHAR_MSG_FIRST: u32 = MSG_GET_ACCOUNT_CHARS;
pub const CHAR_MSG_LAST: u32 = MSG_CHAR_RESERVE_ACK;

pub const HEADER_LEN: usize = 16;

/// `{type u32, content_id u32, character_id u32, account_id u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: u32,
    pub content_id: u32,
    pub character_id: u32,
    pub account_id: u32,
}

impl MsgHeader {
    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, HEADER_LEN)?;
        Ok(Self {
            msg_type: wire::u32_at(b, 0),
            content_id: wire::u32_at(b, 4),
            character_id: wire::u32_at(b, 8),
            account_id: wire::u32_at(b, 12),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.content_id.to_le_bytes());
        out.extend_from_slice(&self.character_id.to_le_bytes());
        out.extend_from_slice(&self.account_id.to_le_bytes());
    }
}

/// Header plus a bare response code; used for reserve and delete acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericResponse {
    pub header: MsgHeader,
    pub response_code: u32,
}

impl GenericResponse {
    pub const LEN: usize = HEADER_LEN + 4;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::LEN)?;
        Ok(Self {
            header: MsgHeader::parse(b)?,
            response_code: wire::u32_at(b, 16),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.response_code.to_le_bytes());
        out
    }
}

/// `CHAR_LOGIN`: login server → world, carries the session key half the
/// zone needs plus the client address and entitlement bitmasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequestMsg {
    pub header: MsgHeader,
    pub key: [u8; 16],
    pub client_ip: u32,
    pub expansions: u32,
    pub features: u32,
}

impl LoginRequestMsg {
    pub const LEN: usize = HEADER_LEN + 16 + 12;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::LEN)?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&b[16..32]);
        Ok(Self {
            header: MsgHeader::parse(b)?,
            key,
            client_ip: wire::u32_at(b, 32),
            expansions: wire::u32_at(b, 36),
            features: wire::u32_at(b, 40),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.client_ip.to_le_bytes());
        out.extend_from_slice(&self.expansions.to_le_bytes());
        out.extend_from_slice(&self.features.to_le_bytes());
        out
    }
}

/// `CHAR_LOGIN_ACK`: world → login, zone and search endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAckMsg {
    pub header: MsgHeader,
    pub response_code: u32,
    pub zone_ip: u32,
    pub zone_port: u16,
    pub search_ip: u32,
    pub search_port: u16,
}

impl LoginAckMsg {
    pub const LEN: usize = HEADER_LEN + 16;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::LEN)?;
        Ok(Self {
            header: MsgHeader::parse(b)?,
            response_code: wire::u32_at(b, 16),
            zone_ip: wire::u32_at(b, 20),
            zone_port: wire::u16_at(b, 24),
            search_ip: wire::u32_at(b, 26),
            search_port: wire::u16_at(b, 30),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.response_code.to_le_bytes());
        out.extend_from_slice(&self.zone_ip.to_le_bytes());
        out.extend_from_slice(&self.zone_port.to_le_bytes());
        out.extend_from_slice(&self.search_ip.to_le_bytes());
        out.extend_from_slice(&self.search_port.to_le_bytes());
        out
    }
}

/// `CHAR_RESERVE`: header plus the requested character name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveMsg {
    pub header: MsgHeader,
    pub name: String,
}

impl ReserveMsg {
    pub const LEN: usize = HEADER_LEN + 16;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::LEN)?;
        Ok(Self {
            header: MsgHeader::parse(b)?,
            name: wire::fixed_str(&b[16..32])?.to_string(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.header.encode_into(&mut out);
        wire::put_fixed_str(&mut out, &self.name, 16);
        out
    }
}

/// `CHAR_CREATE`: header plus the full entry to commit.
#[derive(Debug, Clone)]
pub struct CreateMsg {
    pub header: MsgHeader,
    pub details: CharacterEntry,
}

impl CreateMsg {
    pub const LEN: usize = HEADER_LEN + crate::entry::CHARACTER_ENTRY_LEN;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::LEN)?;
        Ok(Self {
            header: MsgHeader::parse(b)?,
            details: CharacterEntry::parse(&b[16..])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.header.encode_into(&mut out);
        self.details.encode_into(&mut out);
        out
    }
}

/// `CHAR_CREATE_ACK`: the world may have replaced the suggested character
/// id; the assigned one is in the header. Carries the starting zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateAckMsg {
    pub header: MsgHeader,
    pub response_code: u32,
    pub zone: u16,
}

impl CreateAckMsg {
    pub const LEN: usize = HEADER_LEN + 6;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::LEN)?;
        Ok(Self {
            header: MsgHeader::parse(b)?,
            response_code: wire::u32_at(b, 16),
            zone: wire::u16_at(b, 20),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.response_code.to_le_bytes());
        out.extend_from_slice(&self.zone.to_le_bytes());
        out
    }
}

/// `CHAR_UPDATE`: header plus the authoritative entry from the world.
#[derive(Debug, Clone)]
pub struct UpdateMsg {
    pub header: MsgHeader,
    pub details: CharacterEntry,
}

impl UpdateMsg {
    pub const LEN: usize = HEADER_LEN + crate::entry::CHARACTER_ENTRY_LEN;

    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, Self::LEN)?;
        Ok(Self {
            header: MsgHeader::parse(b)?,
            details: CharacterEntry::parse(&b[16..])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.header.encode_into(&mut out);
        self.details.encode_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(t: u32) -> MsgHeader {
        MsgHeader {
            msg_type: t,
            content_id: 672,
            character_id: 0x0003_0001,
            account_id: 42,
        }
    }

    #[test]
    fn header_round_trips() {
        let h = header(MSG_CHAR_LOGIN);
        let mut raw = Vec::new();
        h.encode_into(&mut raw);
        assert_eq!(raw.len(), HEADER_LEN);
        assert_eq!(MsgHeader::parse(&raw).unwrap(), h);
    }

    #[test]
    fn login_request_round_trips() {
        let msg = LoginRequestMsg {
            header: header(MSG_CHAR_LOGIN),
            key: *b"0123456789abcdef",
            client_ip: 0x0100_007F,
            expansions: 0x1FFF,
            features: 1,
        };
        let raw = msg.encode();
        assert_eq!(raw.len(), LoginRequestMsg::LEN);
        assert_eq!(LoginRequestMsg::parse(&raw).unwrap(), msg);
    }

    #[test]
    fn login_ack_round_trips() {
        let msg = LoginAckMsg {
            header: header(MSG_CHAR_LOGIN_ACK),
            response_code: 0,
            zone_ip: 0x0500_000A,
            zone_port: 54230,
            search_ip: 0x0600_000A,
            search_port: 54002,
        };
        assert_eq!(LoginAckMsg::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn reserve_round_trips() {
        let msg = ReserveMsg {
            header: header(MSG_CHAR_RESERVE),
            name: "Bob".to_string(),
        };
        assert_eq!(ReserveMsg::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn create_ack_round_trips() {
        let msg = CreateAckMsg {
            header: header(MSG_CHAR_CREATE_ACK),
            response_code: 0,
            zone: 0xEB,
        };
        assert_eq!(CreateAckMsg::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn update_round_trips() {
        let msg = UpdateMsg {
            header: header(MSG_CHAR_UPDATE),
            details: CharacterEntry {
                content_id: 672,
                enabled: true,
                character_id: 0x0003_0001,
                name: "Alice".to_string(),
                world_id: 3,
                main_job: 1,
                main_job_level: 12,
                zone: 0xEB,
                nation: 1,
                ..Default::default()
            },
        };
        let raw = msg.encode();
        assert_eq!(raw.len(), UpdateMsg::LEN);
        let back = UpdateMsg::parse(&raw).unwrap();
        assert_eq!(back.header, msg.header);
        assert_eq!(back.details, msg.details);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(
            MsgHeader::parse(&[0u8; 15]),
            Err(ProtoError::TooShort { .. })
        ));
    }

    #[test]
    fn zone_and_create_ack_share_a_value() {
        // Directional disambiguation depends on this staying true.
        assert_eq!(MSG_CHAR_ZONE, MSG_CHAR_CREATE_ACK);
    }
}
