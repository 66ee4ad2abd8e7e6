//! Per-player sessions and the process-wide tracker.
//!
//! A session binds an account to a source IP for the short window between
//! bootloader authentication and the zone hand-off. Three connections (auth,
//! data, view) cooperate through it: two one-shot signal slots, a single-slot
//! mailbox for world replies, and termination flags that let the tracker
//! reap the session once both long-lived handlers are done.
//!
//! Lock order: registry lock first, then a session's own lock. The session
//! lock is never held across an await point.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use gateproto::entry::CharacterEntry;
use gateproto::view::LoginRequest;

pub const SESSION_KEY_LEN: usize = 24;

/// Hard cap on content ids per account; the view-port list has exactly
/// this many slots.
pub const MAX_CONTENT_SLOTS: usize = 16;

/// One-shot request to the data handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSignal {
    /// Prompt the client for the session key again.
    AskForKey,
}

/// One-shot request to the view handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSignal {
    /// The data side has the key installed; the full character list may go
    /// out once the client asks for it.
    SendCharacterList,
}

/// One content id slot of the account, in content-id order.
#[derive(Debug, Clone, Default)]
pub struct CharacterSlot {
    pub content_id: u32,
    pub content_enabled: bool,
    /// Zeroed (`character_id == 0`) when the slot is vacant.
    pub entry: CharacterEntry,
}

#[derive(Debug)]
struct SessionState {
    expires_at: Instant,
    ignore_ip_lookup: bool,
    key: [u8; SESSION_KEY_LEN],
    key_installed: bool,
    expansions: u32,
    features: u32,
    privileges: u32,
    client_version: String,
    slots: Vec<CharacterSlot>,
    list_loaded: bool,
    to_data: Option<DataSignal>,
    to_view: Option<ViewSignal>,
    data_done: bool,
    view_done: bool,
    mailbox: Option<(Bytes, u16)>,
    pending_login: Option<LoginRequest>,
}

#[derive(Debug)]
pub struct Session {
    pub account_id: u32,
    pub client_ip: IpAddr,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(account_id: u32, client_ip: IpAddr, ttl: Duration) -> Self {
        Self {
            account_id,
            client_ip,
            state: Mutex::new(SessionState {
                expires_at: Instant::now() + ttl,
                ignore_ip_lookup: false,
                key: [0; SESSION_KEY_LEN],
                key_installed: false,
                expansions: 0,
                features: 0,
                privileges: 0,
                client_version: String::new(),
                slots: Vec::new(),
                list_loaded: false,
                to_data: None,
                to_view: None,
                data_done: false,
                view_done: false,
                mailbox: None,
                pending_login: None,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        let mut st = self.state.lock().expect("session lock poisoned");
        f(&mut st)
    }

    pub fn has_expired(&self) -> bool {
        self.with(|s| s.expires_at <= Instant::now())
    }

    /// Extend the TTL relative to now. The expiry only moves forward unless
    /// `allow_decrease` is set.
    pub fn set_expiry_relative(&self, ttl: Duration, allow_decrease: bool) {
        let new = Instant::now() + ttl;
        self.with(|s| {
            if allow_decrease || new > s.expires_at {
                s.expires_at = new;
            }
        });
    }

    /// Make the next sweep collect this session.
    pub fn force_expire(&self) {
        self.with(|s| s.expires_at = Instant::now());
    }

    pub fn ignore_ip_lookup(&self) -> bool {
        self.with(|s| s.ignore_ip_lookup)
    }

    pub fn set_ignore_ip_lookup(&self, flag: bool) {
        self.with(|s| s.ignore_ip_lookup = flag);
    }

    pub fn install_key(&self, key: &[u8; SESSION_KEY_LEN]) {
        self.with(|s| {
            s.key = *key;
            s.key_installed = true;
        });
    }

    /// The session key, if the data port has installed one.
    pub fn key(&self) -> Option<[u8; SESSION_KEY_LEN]> {
        self.with(|s| s.key_installed.then_some(s.key))
    }

    pub fn set_entitlements(&self, expansions: u32, features: u32) {
        self.with(|s| {
            s.expansions = expansions;
            s.features = features;
        });
    }

    pub fn entitlements(&self) -> (u32, u32) {
        self.with(|s| (s.expansions, s.features))
    }

    pub fn set_privileges(&self, privileges: u32) {
        self.with(|s| s.privileges = privileges);
    }

    pub fn privileges(&self) -> u32 {
        self.with(|s| s.privileges)
    }

    pub fn set_client_version(&self, version: String) {
        self.with(|s| s.client_version = version);
    }

    pub fn client_version(&self) -> String {
        self.with(|s| s.client_version.clone())
    }

    pub fn set_slots(&self, slots: Vec<CharacterSlot>) {
        self.with(|s| {
            s.slots = slots;
            s.list_loaded = true;
        });
    }

    pub fn slots(&self) -> Option<Vec<CharacterSlot>> {
        self.with(|s| s.list_loaded.then(|| s.slots.clone()))
    }

    /// Mutate the loaded slot list in place. Returns `None` when the list
    /// has not been loaded yet.
    pub fn modify_slots<T>(&self, f: impl FnOnce(&mut Vec<CharacterSlot>) -> T) -> Option<T> {
        self.with(|s| s.list_loaded.then(|| f(&mut s.slots)))
    }

    pub fn signal_data(&self, sig: DataSignal) {
        self.with(|s| s.to_data = Some(sig));
    }

    pub fn take_data_signal(&self) -> Option<DataSignal> {
        self.with(|s| s.to_data.take())
    }

    pub fn signal_view(&self, sig: ViewSignal) {
        self.with(|s| s.to_view = Some(sig));
    }

    pub fn take_view_signal(&self) -> Option<ViewSignal> {
        self.with(|s| s.to_view.take())
    }

    /// Park a world reply for the view handler. Fails when one is already
    /// pending; each flow keeps at most one request outstanding.
    pub fn deliver_world_reply(&self, bytes: Bytes, world_id: u16) -> Result<(), RegistryError> {
        self.with(|s| {
            if s.mailbox.is_some() {
                return Err(RegistryError::MailboxFull);
            }
            s.mailbox = Some((bytes, world_id));
            Ok(())
        })
    }

    pub fn take_world_reply(&self) -> Option<(Bytes, u16)> {
        self.with(|s| s.mailbox.take())
    }

    pub fn set_data_done(&self) {
        self.with(|s| s.data_done = true);
    }

    pub fn set_view_done(&self) {
        self.with(|s| s.view_done = true);
    }

    pub fn both_done(&self) -> bool {
        self.with(|s| s.data_done && s.view_done)
    }

    pub fn store_login_request(&self, req: LoginRequest) {
        self.with(|s| s.pending_login = Some(req));
    }

    pub fn take_login_request(&self) -> Option<LoginRequest> {
        self.with(|s| s.pending_login.take())
    }
}

/// Build the session slot list from the store: one slot per content id in
/// content-id order, carrying the character that occupies it, if any.
pub async fn load_slots(
    store: &crate::db::Store,
    account_id: u32,
) -> anyhow::Result<Vec<CharacterSlot>> {
    let contents = store.content_slots(account_id).await?;
    let chars = store.characters_by_account(account_id).await?;
    let mut slots = Vec::with_capacity(contents.len().min(MAX_CONTENT_SLOTS));
    for c in contents.into_iter().take(MAX_CONTENT_SLOTS) {
        let entry = chars
            .iter()
            .find(|e| e.content_id == c.content_id)
            .cloned()
            .unwrap_or_default();
        slots.push(CharacterSlot {
            content_id: c.content_id,
            content_enabled: c.enabled,
            entry,
        });
    }
    Ok(slots)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    NotFound,
    /// An unexpired session for the account already exists from another IP.
    Conflict,
    /// A world reply is already parked on the session.
    MailboxFull,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound => write!(f, "session not found"),
            RegistryError::Conflict => write!(f, "session conflict"),
            RegistryError::MailboxFull => write!(f, "session mailbox full"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Process-wide session tracker, keyed by account id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<u32, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session, or refresh the existing one when the same client
    /// authenticates again from the same address.
    pub fn init(
        &self,
        account_id: u32,
        client_ip: IpAddr,
        ttl: Duration,
    ) -> Result<Arc<Session>, RegistryError> {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        if let Some(existing) = map.get(&account_id) {
            if existing.has_expired() {
                map.remove(&account_id);
            } else if existing.client_ip == client_ip {
                existing.set_expiry_relative(ttl, false);
                return Ok(existing.clone());
            } else {
                return Err(RegistryError::Conflict);
            }
        }
        let session = Arc::new(Session::new(account_id, client_ip, ttl));
        map.insert(account_id, session.clone());
        Ok(session)
    }

    pub fn get(&self, account_id: u32) -> Result<Arc<Session>, RegistryError> {
        let map = self.inner.lock().expect("registry lock poisoned");
        map.get(&account_id).cloned().ok_or(RegistryError::NotFound)
    }

    /// Find the session for a source address. Sessions that opted out after
    /// binding a view connection are skipped, which is what keeps "at most
    /// one visible session per IP" true.
    pub fn lookup_by_ip(&self, ip: IpAddr) -> Result<Arc<Session>, RegistryError> {
        let map = self.inner.lock().expect("registry lock poisoned");
        map.values()
            .find(|s| s.client_ip == ip && !s.ignore_ip_lookup() && !s.has_expired())
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    pub fn delete(&self, account_id: u32) {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        map.remove(&account_id);
    }

    /// Drop every expired session; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        let before = map.len();
        map.retain(|_, s| !s.has_expired());
        before - map.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn init_same_ip_refreshes() {
        let reg = SessionRegistry::new();
        let a = reg.init(42, ip(1), Duration::from_secs(30)).unwrap();
        let b = reg.init(42, ip(1), Duration::from_secs(30)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn init_other_ip_conflicts() {
        let reg = SessionRegistry::new();
        reg.init(42, ip(1), Duration::from_secs(30)).unwrap();
        assert_eq!(
            reg.init(42, ip(2), Duration::from_secs(30)).unwrap_err(),
            RegistryError::Conflict
        );
    }

    #[test]
    fn expired_session_is_replaceable_and_swept() {
        let reg = SessionRegistry::new();
        let s = reg.init(42, ip(1), Duration::from_secs(0)).unwrap();
        assert!(s.has_expired());

        // Another IP may take over once the old binding lapsed.
        reg.init(42, ip(2), Duration::from_secs(30)).unwrap();
        assert_eq!(reg.len(), 1);

        reg.get(42).unwrap().force_expire();
        assert_eq!(reg.sweep_expired(), 1);
        assert_eq!(reg.get(42).unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn delete_removes_the_binding() {
        let reg = SessionRegistry::new();
        reg.init(42, ip(1), Duration::from_secs(30)).unwrap();
        reg.delete(42);
        assert_eq!(reg.get(42).unwrap_err(), RegistryError::NotFound);
        // Deleting again is a no-op.
        reg.delete(42);
    }

    #[test]
    fn ip_lookup_honors_opt_out() {
        let reg = SessionRegistry::new();
        let s = reg.init(42, ip(1), Duration::from_secs(30)).unwrap();
        assert!(reg.lookup_by_ip(ip(1)).is_ok());

        s.set_ignore_ip_lookup(true);
        assert_eq!(reg.lookup_by_ip(ip(1)).unwrap_err(), RegistryError::NotFound);

        // A second account from the same NAT is now visible instead.
        reg.init(43, ip(1), Duration::from_secs(30)).unwrap();
        assert_eq!(reg.lookup_by_ip(ip(1)).unwrap().account_id, 43);
    }

    #[test]
    fn expiry_only_moves_forward_by_default() {
        let reg = SessionRegistry::new();
        let s = reg.init(42, ip(1), Duration::from_secs(600)).unwrap();
        s.set_expiry_relative(Duration::from_secs(1), false);
        assert!(!s.has_expired());

        s.set_expiry_relative(Duration::from_secs(0), true);
        assert!(s.has_expired());
    }

    #[test]
    fn signals_are_one_shot() {
        let reg = SessionRegistry::new();
        let s = reg.init(42, ip(1), Duration::from_secs(30)).unwrap();

        s.signal_view(ViewSignal::SendCharacterList);
        assert_eq!(s.take_view_signal(), Some(ViewSignal::SendCharacterList));
        assert_eq!(s.take_view_signal(), None);

        s.signal_data(DataSignal::AskForKey);
        assert_eq!(s.take_data_signal(), Some(DataSignal::AskForKey));
        assert_eq!(s.take_data_signal(), None);
    }

    #[test]
    fn mailbox_is_single_slot() {
        let reg = SessionRegistry::new();
        let s = reg.init(42, ip(1), Duration::from_secs(30)).unwrap();

        s.deliver_world_reply(Bytes::from_static(b"a"), 3).unwrap();
        assert_eq!(
            s.deliver_world_reply(Bytes::from_static(b"b"), 3).unwrap_err(),
            RegistryError::MailboxFull
        );

        let (msg, world) = s.take_world_reply().unwrap();
        assert_eq!(&msg[..], b"a");
        assert_eq!(world, 3);
        assert!(s.take_world_reply().is_none());
    }

    #[test]
    fn key_reads_none_until_installed() {
        let reg = SessionRegistry::new();
        let s = reg.init(42, ip(1), Duration::from_secs(30)).unwrap();
        assert!(s.key().is_none());

        let key = [7u8; SESSION_KEY_LEN];
        s.install_key(&key);
        assert_eq!(s.key(), Some(key));
    }

    #[test]
    fn done_flags_compose() {
        let reg = SessionRegistry::new();
        let s = reg.init(42, ip(1), Duration::from_secs(30)).unwrap();
        assert!(!s.both_done());
        s.set_data_done();
        assert!(!s.both_done());
        s.set_view_done();
        assert!(s.both_done());
    }
}
