//! Bootloader authentication port protocol.
//!
//! Requests are a single fixed 256-byte struct, responses a fixed 16-byte
//! struct. No framing; the bootloader writes the struct raw.

use crate::wire;
use crate::ProtoError;

pub const AUTH_REQUEST_LEN: usize = 256;
pub const AUTH_RESPONSE_LEN: usize = 16;

pub const CMD_LOGIN: u8 = 0x10;
pub const CMD_CREATE: u8 = 0x20;
pub const CMD_CHANGE_PASSWORD: u8 = 0x80;

pub const RESP_LOGIN_SUCCESSFUL: u8 = 0x01;
pub const RESP_LOGIN_FAILED: u8 = 0x02;
pub const RESP_CREATE_SUCCESSFUL: u8 = 0x03;
pub const RESP_CREATE_FAILED: u8 = 0x04;
pub const RESP_PWCHANGE_SUCCESSFUL: u8 = 0x05;
pub const RESP_PWCHANGE_FAILED: u8 = 0x06;
pub const RESP_MALFORMED_PACKET: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCommand {
    Login,
    Create,
    ChangePassword,
}

/// Request layout: username[16], password[16], command u8,
/// new_password[16], email[50], pad[157].
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub command: AuthCommand,
    pub new_password: String,
    pub email: String,
}

impl AuthRequest {
    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, AUTH_REQUEST_LEN)?;
        let command = match b[32] {
            CMD_LOGIN => AuthCommand::Login,
            CMD_CREATE => AuthCommand::Create,
            CMD_CHANGE_PASSWORD => AuthCommand::ChangePassword,
            other => return Err(ProtoError::UnknownType(other as u32)),
        };
        Ok(Self {
            username: wire::fixed_str(&b[0..16])?.to_string(),
            password: wire::fixed_str(&b[16..32])?.to_string(),
            command,
            new_password: wire::fixed_str(&b[33..49])?.to_string(),
            email: wire::fixed_str(&b[49..99])?.to_string(),
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUTH_REQUEST_LEN);
        wire::put_fixed_str(&mut out, &self.username, 16);
        wire::put_fixed_str(&mut out, &self.password, 16);
        out.push(match self.command {
            AuthCommand::Login => CMD_LOGIN,
            AuthCommand::Create => CMD_CREATE,
            AuthCommand::ChangePassword => CMD_CHANGE_PASSWORD,
        });
        wire::put_fixed_str(&mut out, &self.new_password, 16);
        wire::put_fixed_str(&mut out, &self.email, 50);
        out.resize(AUTH_REQUEST_LEN, 0);
        out
    }
}

/// Response layout: response_type u8, account_id u32 LE, failure_reason
/// u16 LE, pad[9].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResponse {
    pub response_type: u8,
    pub account_id: u32,
    pub failure_reason: u16,
}

impl AuthResponse {
    pub fn success(response_type: u8, account_id: u32) -> Self {
        Self {
            response_type,
            account_id,
            failure_reason: 0,
        }
    }

    pub fn failure(response_type: u8, failure_reason: u16) -> Self {
        Self {
            response_type,
            account_id: 0,
            failure_reason,
        }
    }

    pub fn encode(&self) -> [u8; AUTH_RESPONSE_LEN] {
        let mut out = [0u8; AUTH_RESPONSE_LEN];
        out[0] = self.response_type;
        out[1..5].copy_from_slice(&self.account_id.to_le_bytes());
        out[5..7].copy_from_slice(&self.failure_reason.to_le_bytes());
        out
    }

    #[cfg(test)]
    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        wire::need(b, AUTH_RESPONSE_LEN)?;
        Ok(Self {
            response_type: b[0],
            account_id: wire::u32_at(b, 1),
            failure_reason: wire::u16_at(b, 5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = AuthRequest {
            username: "Alice".into(),
            password: "Passw0rd!".into(),
            command: AuthCommand::Login,
            new_password: String::new(),
            email: String::new(),
        };
        let raw = req.encode();
        assert_eq!(raw.len(), AUTH_REQUEST_LEN);

        let back = AuthRequest::parse(&raw).unwrap();
        assert_eq!(back.username, "Alice");
        assert_eq!(back.password, "Passw0rd!");
        assert_eq!(back.command, AuthCommand::Login);
    }

    #[test]
    fn unterminated_username_is_malformed() {
        let mut raw = AuthRequest {
            username: "x".into(),
            password: "y".into(),
            command: AuthCommand::Login,
            new_password: String::new(),
            email: String::new(),
        }
        .encode();
        raw[..16].fill(b'A');
        assert!(matches!(
            AuthRequest::parse(&raw),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut raw = AuthRequest {
            username: "x".into(),
            password: "y".into(),
            command: AuthCommand::Login,
            new_password: String::new(),
            email: String::new(),
        }
        .encode();
        raw[32] = 0x42;
        assert!(matches!(
            AuthRequest::parse(&raw),
            Err(ProtoError::UnknownType(0x42))
        ));
    }

    #[test]
    fn response_round_trips() {
        let r = AuthResponse::success(RESP_LOGIN_SUCCESSFUL, 42);
        let raw = r.encode();
        assert_eq!(AuthResponse::parse(&raw).unwrap(), r);
    }
}
