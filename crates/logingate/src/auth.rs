//! Bootloader authentication port handler.
//!
//! Fixed-size request/response structs, no framing. A successful login or
//! account creation seeds the session tracker so the data port will accept
//! the client afterwards.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{info, warn};

use gateproto::auth::{
    AuthCommand, AuthRequest, AuthResponse, AUTH_REQUEST_LEN, RESP_CREATE_FAILED,
    RESP_CREATE_SUCCESSFUL, RESP_LOGIN_FAILED, RESP_LOGIN_SUCCESSFUL, RESP_MALFORMED_PACKET,
    RESP_PWCHANGE_FAILED, RESP_PWCHANGE_SUCCESSFUL,
};

use crate::config::Config;
use crate::db::{Store, ACCT_PRIV_ENABLED};
use crate::ioutil::{PolledReader, ReadOutcome};
use crate::session::{RegistryError, SessionRegistry};

pub const REASON_BAD_CREDENTIALS: u16 = 1;
pub const REASON_ACCOUNT_DISABLED: u16 = 2;
pub const REASON_USERNAME_TAKEN: u16 = 3;
pub const REASON_WEAK_PASSWORD: u16 = 4;
pub const REASON_INTERNAL: u16 = 5;
pub const REASON_MALFORMED: u16 = 6;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// At least 8 characters drawing on at least 3 of the 4 character classes.
pub fn check_password_complexity(password: &str) -> bool {
    if password.len() < 8 {
        return false;
    }
    let mut upper = false;
    let mut lower = false;
    let mut digit = false;
    let mut other = false;
    for b in password.bytes() {
        match b {
            b'A'..=b'Z' => upper = true,
            b'a'..=b'z' => lower = true,
            b'0'..=b'9' => digit = true,
            _ => other = true,
        }
    }
    [upper, lower, digit, other].iter().filter(|&&c| c).count() >= 3
}

/// Ten random printable characters followed by the decimal unix time.
/// The format is what deployed rows already look like; the randomness
/// comes from the thread CSPRNG rather than `rand()`.
pub fn generate_salt() -> String {
    let mut rng = rand::thread_rng();
    let mut salt = String::with_capacity(24);
    for _ in 0..10 {
        salt.push(rng.gen_range(33u8..=126) as char);
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    salt.push_str(&now.to_string());
    salt
}

/// Hex SHA-256 over `secret || password || salt`.
pub fn hash_password(secret: &str, password: &str, salt: &str) -> String {
    let mut h = Sha256::new();
    h.update(secret.as_bytes());
    h.update(password.as_bytes());
    h.update(salt.as_bytes());
    hex::encode(h.finalize())
}

enum AuthAction {
    Reply { resp: AuthResponse, failed: bool },
    /// Session-level trouble; cut the connection without answering.
    Drop,
}

fn reply_ok(resp_type: u8, account_id: u32) -> AuthAction {
    AuthAction::Reply {
        resp: AuthResponse::success(resp_type, account_id),
        failed: false,
    }
}

fn reply_fail(resp_type: u8, reason: u16) -> AuthAction {
    AuthAction::Reply {
        resp: AuthResponse::failure(resp_type, reason),
        failed: true,
    }
}

pub async fn handle_auth_conn(
    stream: TcpStream,
    peer: SocketAddr,
    store: Store,
    sessions: Arc<SessionRegistry>,
    cfg: Arc<Config>,
    shutdown: watch::Receiver<bool>,
) {
    let (rd, mut wr) = stream.into_split();
    let mut pr = PolledReader::new(rd);
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }
        let raw = match pr.read_exact_timeout(AUTH_REQUEST_LEN, POLL_INTERVAL).await {
            Ok(ReadOutcome::TimedOut) => continue,
            Ok(ReadOutcome::Eof) => return,
            Ok(ReadOutcome::Data(d)) => d,
            Err(e) => {
                warn!(peer = %peer, err = %e, "auth connection read failed");
                return;
            }
        };

        let action = match AuthRequest::parse(&raw) {
            Ok(req) => match req.command {
                AuthCommand::Login => do_login(&store, &sessions, &cfg, peer, &req).await,
                AuthCommand::Create => do_create(&store, &sessions, &cfg, peer, &req).await,
                AuthCommand::ChangePassword => do_change_password(&store, &cfg, &req).await,
            },
            Err(e) => {
                warn!(peer = %peer, err = %e, "malformed auth packet");
                reply_fail(RESP_MALFORMED_PACKET, REASON_MALFORMED)
            }
        };

        match action {
            AuthAction::Drop => return,
            AuthAction::Reply { resp, failed } => {
                if wr.write_all(&resp.encode()).await.is_err() {
                    return;
                }
                if failed {
                    failures += 1;
                    if failures >= cfg.max_login_attempts {
                        warn!(peer = %peer, failures, "too many failed attempts; dropping");
                        return;
                    }
                }
            }
        }
    }
}

async fn do_login(
    store: &Store,
    sessions: &SessionRegistry,
    cfg: &Config,
    peer: SocketAddr,
    req: &AuthRequest,
) -> AuthAction {
    let creds = match store.fetch_credentials(&req.username).await {
        Ok(c) => c,
        Err(e) => {
            warn!(err = %e, "credential lookup failed");
            return reply_fail(RESP_LOGIN_FAILED, REASON_INTERNAL);
        }
    };
    // Same answer whether the user is unknown or the password is wrong.
    let Some(creds) = creds else {
        return reply_fail(RESP_LOGIN_FAILED, REASON_BAD_CREDENTIALS);
    };
    if hash_password(&cfg.password_hash_secret, &req.password, &creds.salt) != creds.password {
        return reply_fail(RESP_LOGIN_FAILED, REASON_BAD_CREDENTIALS);
    }
    if creds.privileges & ACCT_PRIV_ENABLED == 0 {
        return reply_fail(RESP_LOGIN_FAILED, REASON_ACCOUNT_DISABLED);
    }

    let session = match sessions.init(
        creds.account_id,
        peer.ip(),
        Duration::from_secs(cfg.session_timeout),
    ) {
        Ok(s) => s,
        Err(RegistryError::Conflict) => {
            warn!(account = creds.account_id, peer = %peer, "session conflict");
            return AuthAction::Drop;
        }
        Err(e) => {
            warn!(account = creds.account_id, err = %e, "session init failed");
            return AuthAction::Drop;
        }
    };
    session.set_privileges(creds.privileges);
    info!(account = creds.account_id, peer = %peer, "login ok");
    reply_ok(RESP_LOGIN_SUCCESSFUL, creds.account_id)
}

async fn do_create(
    store: &Store,
    sessions: &SessionRegistry,
    cfg: &Config,
    peer: SocketAddr,
    req: &AuthRequest,
) -> AuthAction {
    match store.username_taken(&req.username).await {
        Ok(true) => return reply_fail(RESP_CREATE_FAILED, REASON_USERNAME_TAKEN),
        Ok(false) => {}
        Err(e) => {
            warn!(err = %e, "username lookup failed");
            return reply_fail(RESP_CREATE_FAILED, REASON_INTERNAL);
        }
    }
    if !check_password_complexity(&req.password) {
        return reply_fail(RESP_CREATE_FAILED, REASON_WEAK_PASSWORD);
    }

    let salt = generate_salt();
    let hash = hash_password(&cfg.password_hash_secret, &req.password, &salt);
    let email = (!req.email.is_empty()).then_some(req.email.as_str());
    let account_id = match store
        .create_account(&req.username, &hash, &salt, email, cfg.new_account_content_ids)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(err = %e, "account creation failed");
            return reply_fail(RESP_CREATE_FAILED, REASON_INTERNAL);
        }
    };

    let session = match sessions.init(
        account_id,
        peer.ip(),
        Duration::from_secs(cfg.session_timeout),
    ) {
        Ok(s) => s,
        Err(_) => return AuthAction::Drop,
    };
    session.set_privileges(ACCT_PRIV_ENABLED);
    info!(account = account_id, peer = %peer, "account created");
    reply_ok(RESP_CREATE_SUCCESSFUL, account_id)
}

async fn do_change_password(store: &Store, cfg: &Config, req: &AuthRequest) -> AuthAction {
    let creds = match store.fetch_credentials(&req.username).await {
        Ok(Some(c)) => c,
        Ok(None) => return reply_fail(RESP_PWCHANGE_FAILED, REASON_BAD_CREDENTIALS),
        Err(e) => {
            warn!(err = %e, "credential lookup failed");
            return reply_fail(RESP_PWCHANGE_FAILED, REASON_INTERNAL);
        }
    };
    // Disabled accounts may still rotate their password.
    if hash_password(&cfg.password_hash_secret, &req.password, &creds.salt) != creds.password {
        return reply_fail(RESP_PWCHANGE_FAILED, REASON_BAD_CREDENTIALS);
    }
    if !check_password_complexity(&req.new_password) {
        return reply_fail(RESP_PWCHANGE_FAILED, REASON_WEAK_PASSWORD);
    }

    let salt = generate_salt();
    let hash = hash_password(&cfg.password_hash_secret, &req.new_password, &salt);
    if let Err(e) = store.set_password(creds.account_id, &hash, &salt).await {
        warn!(account = creds.account_id, err = %e, "password update failed");
        return reply_fail(RESP_PWCHANGE_FAILED, REASON_INTERNAL);
    }
    info!(account = creds.account_id, "password changed");
    reply_ok(RESP_PWCHANGE_SUCCESSFUL, creds.account_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_boundaries() {
        // 8 chars, exactly 3 classes.
        assert!(check_password_complexity("Passw0rd"));
        // 7 chars.
        assert!(!check_password_complexity("Pass0rd"));
        // 8 chars, 2 classes.
        assert!(!check_password_complexity("passwrd1"));
        // 4 classes.
        assert!(check_password_complexity("Passw0rd!"));
    }

    #[test]
    fn salt_shape() {
        let salt = generate_salt();
        assert!(salt.len() > 10);
        assert!(salt[..10].bytes().all(|b| (33..=126).contains(&b)));
        assert!(salt[10..].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn salts_differ() {
        assert_ne!(generate_salt()[..10], generate_salt()[..10]);
    }

    #[test]
    fn hash_is_stable_hex() {
        let a = hash_password("pepper", "Passw0rd!", "salt123");
        let b = hash_password("pepper", "Passw0rd!", "salt123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(a, hash_password("pepper", "Passw0rd!", "salt124"));
        assert_ne!(a, hash_password("other", "Passw0rd!", "salt123"));
    }
}
