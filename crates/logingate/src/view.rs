//! View port handler: the post-auth conversation with the game client.
//!
//! The account id never appears on this port, so the session is found by
//! source address and immediately opted out of further IP lookups. The
//! loop polls the socket once a second and, between frames, drains the
//! data-handler signal, the world-reply mailbox and the per-operation
//! timeout.
//!
//! World RPCs (login, reserve, confirm, delete) keep at most one request
//! outstanding; the reply or a 10 s timeout resolves it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gateio::frame::{Frame, FrameReader, FrameWriter};
use gateproto::entry::CharacterEntry;
use gateproto::mq::{
    CreateAckMsg, CreateMsg, GenericResponse, LoginAckMsg, LoginRequestMsg, MsgHeader,
    ReserveMsg, MSG_CHAR_CREATE, MSG_CHAR_CREATE_ACK, MSG_CHAR_DELETE, MSG_CHAR_DELETE_ACK,
    MSG_CHAR_LOGIN, MSG_CHAR_LOGIN_ACK, MSG_CHAR_RESERVE, MSG_CHAR_RESERVE_ACK,
    MSG_GET_ACCOUNT_CHARS,
};
use gateproto::view::{
    encode_character_list, encode_done, encode_error, encode_features_list,
    parse_client_version, CharacterListSlot, ConfirmRequest, CreateRequest, DeleteRequest,
    LoginRequest, LoginResponse, ERR_CREATE_DENIED, ERR_LOGIN_DENIED, ERR_MAP_CONNECT_FAILED,
    ERR_NAME_ALREADY_TAKEN, ERR_VERSION_MISMATCH, TYPE_CHARACTER_LIST, TYPE_CREATE_CHARACTER,
    TYPE_CREATE_CHAR_CONFIRM, TYPE_DELETE_CHARACTER, TYPE_DONE, TYPE_ERROR, TYPE_FEATURES_LIST,
    TYPE_GET_CHARACTER_LIST, TYPE_GET_FEATURES, TYPE_GET_WORLD_LIST, TYPE_LOGIN_REQUEST,
    TYPE_LOGIN_RESPONSE, TYPE_WORLD_LIST,
};

use crate::config::Config;
use crate::db::{Store, UpdateError, ACCT_PRIV_TEST_ACCESS};
use crate::session::{self, Session, SessionRegistry, ViewSignal};
use crate::worlds::WorldRegistry;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Character creation can keep a player on this port for a while.
const BIND_TTL_EXTENSION: Duration = Duration::from_secs(600);

/// Armed on every outbound world RPC.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

const BASIC_JOB_MIN: u8 = 1;
const BASIC_JOB_MAX: u8 = 6;
/// Fallback starting job when the client sends something advanced.
const JOB_WAR: u8 = 1;

const LAST_NATION: u8 = 2;

#[derive(Clone)]
pub struct ViewContext {
    pub store: Store,
    pub sessions: Arc<SessionRegistry>,
    pub worlds: Arc<WorldRegistry>,
    pub cfg: Arc<Config>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Login,
    Reserve { content_id: u32 },
    Confirm { content_id: u32 },
    Delete { content_id: u32, character_id: u32 },
}

#[derive(Default)]
struct Flow {
    list_requested: bool,
    list_ready: bool,
    key_nudged: bool,
    pending: Option<Pending>,
    deadline: Option<Instant>,
}

impl Flow {
    fn arm(&mut self, op: Pending) {
        self.pending = Some(op);
        self.deadline = Some(Instant::now() + OPERATION_TIMEOUT);
    }

    fn disarm(&mut self) {
        self.pending = None;
        self.deadline = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    /// Stop the handler; any error frame has already been sent.
    Done,
}

type Writer = FrameWriter<OwnedWriteHalf>;

pub async fn handle_view_conn(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ViewContext,
    shutdown: watch::Receiver<bool>,
) {
    let session = match ctx.sessions.lookup_by_ip(peer.ip()) {
        Ok(s) => s,
        Err(_) => {
            warn!(peer = %peer, "view connection without a matching session");
            return;
        }
    };
    // Stop shadowing other clients behind the same address, and give the
    // player time to fiddle with character creation.
    session.set_ignore_ip_lookup(true);
    session.set_expiry_relative(BIND_TTL_EXTENSION, false);
    info!(account = session.account_id, peer = %peer, "view connection bound");

    // Nudge the worlds to refresh this account's character mirror while
    // the client is still negotiating features.
    let refresh = MsgHeader {
        msg_type: MSG_GET_ACCOUNT_CHARS,
        content_id: 0,
        character_id: 0,
        account_id: session.account_id,
    };
    let mut refresh_bytes = Vec::with_capacity(gateproto::mq::HEADER_LEN);
    refresh.encode_into(&mut refresh_bytes);
    ctx.worlds.broadcast(&refresh_bytes).await;

    let (rd, wr) = stream.into_split();
    let mut fr = FrameReader::new(rd);
    let mut fw = FrameWriter::new(wr);
    let mut flow = Flow::default();

    if let Err(e) = run(&mut fr, &mut fw, &session, &ctx, &mut flow, shutdown).await {
        warn!(account = session.account_id, err = %e, "view handler aborted");
    }

    session.set_view_done();
    if session.both_done() {
        session.force_expire();
    }
    info!(account = session.account_id, "view connection closed");
}

async fn run(
    fr: &mut FrameReader<OwnedReadHalf>,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    flow: &mut Flow,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match tokio::time::timeout(POLL_INTERVAL, fr.read_frame()).await {
            Err(_) => {} // poll tick
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                warn!(account = session.account_id, err = %e, "view framing violation");
                return Ok(());
            }
            Ok(Ok(Some(frame))) => {
                if dispatch(frame, fw, session, ctx, flow).await? == Step::Done {
                    return Ok(());
                }
            }
        }

        if let Some(ViewSignal::SendCharacterList) = session.take_view_signal() {
            flow.list_ready = true;
        }
        if flow.list_requested && flow.list_ready {
            flow.list_requested = false;
            send_character_list(fw, session, ctx).await?;
        } else if flow.list_requested && !flow.key_nudged && session.key().is_none() {
            // The list rendezvous is stuck behind the key exchange; have
            // the data handler prompt the client again.
            session.signal_data(crate::session::DataSignal::AskForKey);
            flow.key_nudged = true;
        }

        if let Some((bytes, origin)) = session.take_world_reply() {
            if handle_world_reply(bytes, origin, fw, session, ctx, flow).await? == Step::Done {
                return Ok(());
            }
            if flow.pending.is_none() {
                flow.deadline = None;
            }
        }

        if let Some(deadline) = flow.deadline {
            if Instant::now() >= deadline {
                warn!(account = session.account_id, op = ?flow.pending, "world rpc timed out");
                send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
                return Ok(());
            }
        }
    }
}

async fn dispatch(
    frame: Frame,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    flow: &mut Flow,
) -> anyhow::Result<Step> {
    match frame.packet_type {
        TYPE_GET_FEATURES => on_get_features(&frame.payload, fw, session, ctx).await,
        TYPE_GET_WORLD_LIST => on_get_world_list(fw, session, ctx).await,
        TYPE_GET_CHARACTER_LIST => {
            flow.list_requested = true;
            Ok(Step::Continue)
        }
        TYPE_LOGIN_REQUEST => on_login_request(&frame.payload, fw, session, ctx, flow).await,
        TYPE_CREATE_CHARACTER => on_create(&frame.payload, fw, session, ctx, flow).await,
        TYPE_CREATE_CHAR_CONFIRM => on_confirm(&frame.payload, fw, session, ctx, flow).await,
        TYPE_DELETE_CHARACTER => on_delete(&frame.payload, fw, session, ctx, flow).await,
        other => {
            debug!(account = session.account_id, packet_type = other,
                "ignoring unrecognized view packet");
            Ok(Step::Continue)
        }
    }
}

/// Version gate outcome for the configured lock mode.
fn version_permitted(lock: u8, expected: &str, client: &str) -> bool {
    match lock {
        1 => client == expected,
        // The version format (YYYYMMDD_r) sorts correctly as a string.
        2 => client >= expected,
        _ => true,
    }
}

async fn on_get_features(
    payload: &Bytes,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
) -> anyhow::Result<Step> {
    let version = match parse_client_version(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad GET_FEATURES payload");
            return Ok(Step::Done);
        }
    };
    if !version_permitted(ctx.cfg.version_lock, &ctx.cfg.expected_client_version, &version) {
        warn!(account = session.account_id, client = %version,
            expected = %ctx.cfg.expected_client_version, "client version rejected");
        send_error(fw, ERR_VERSION_MISMATCH).await?;
        return Ok(Step::Done);
    }
    session.set_client_version(version);

    let (expansions, features) = match ctx.store.account_entitlements(session.account_id).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "entitlement lookup failed");
            send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
            return Ok(Step::Done);
        }
    };
    session.set_entitlements(expansions, features);
    fw.write_frame(TYPE_FEATURES_LIST, &encode_features_list(expansions, features))
        .await?;
    Ok(Step::Continue)
}

async fn on_get_world_list(
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
) -> anyhow::Result<Step> {
    let packet = if session.privileges() & ACCT_PRIV_TEST_ACCESS != 0 {
        ctx.worlds.admin_worlds_packet()
    } else {
        ctx.worlds.user_worlds_packet()
    };
    fw.write_frame(TYPE_WORLD_LIST, &packet).await?;
    Ok(Step::Continue)
}

async fn send_character_list(
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
) -> anyhow::Result<()> {
    if let Err(e) = ctx.store.clean_half_created(session.account_id).await {
        warn!(account = session.account_id, err = %e, "half-created purge failed");
    }
    let slots = session::load_slots(&ctx.store, session.account_id).await?;
    session.set_slots(slots.clone());

    let view_slots: Vec<CharacterListSlot<'_>> = slots
        .iter()
        .map(|s| CharacterListSlot {
            enabled: s.content_enabled,
            world_name: if s.entry.character_id != 0 {
                ctx.worlds.world_name(s.entry.world_id as u32).unwrap_or("")
            } else {
                ""
            },
            entry: &s.entry,
        })
        .collect();
    fw.write_frame(TYPE_CHARACTER_LIST, &encode_character_list(&view_slots))
        .await?;
    debug!(account = session.account_id, slots = view_slots.len(), "character list sent");
    Ok(())
}

async fn on_login_request(
    payload: &Bytes,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    flow: &mut Flow,
) -> anyhow::Result<Step> {
    if flow.pending.is_some() {
        warn!(account = session.account_id, "login request while an operation is outstanding");
        return Ok(Step::Continue);
    }
    let req = match LoginRequest::parse(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad LOGIN_REQUEST payload");
            return Ok(Step::Done);
        }
    };
    let Some(key) = session.key() else {
        warn!(account = session.account_id, "login attempted before key exchange");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    };
    let Some(slots) = session.slots() else {
        warn!(account = session.account_id, "login attempted before character list");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    };

    // The wire only carries the low 16 bits of the id; recover the full id
    // from the slot table.
    let wire_serial = (req.character_id & 0xFFFF) as u16;
    let slot = slots.iter().find(|s| {
        s.entry.character_id != 0
            && CharacterEntry::serial_of(s.entry.character_id) == wire_serial
            && s.content_id == req.content_id
            && s.entry.name == req.name
    });
    let Some(slot) = slot else {
        warn!(account = session.account_id, content = req.content_id,
            "login request does not match any character");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    };
    if !slot.content_enabled {
        warn!(account = session.account_id, content = req.content_id,
            "login request for a disabled content id");
        send_error(fw, ERR_LOGIN_DENIED).await?;
        return Ok(Step::Done);
    }

    let full_id = slot.entry.character_id;
    let world_id = CharacterEntry::world_of(full_id);
    let (expansions, features) = session.entitlements();
    let mut key16 = [0u8; 16];
    key16.copy_from_slice(&key[..16]);

    let msg = LoginRequestMsg {
        header: MsgHeader {
            msg_type: MSG_CHAR_LOGIN,
            content_id: req.content_id,
            character_id: full_id,
            account_id: session.account_id,
        },
        key: key16,
        client_ip: ip_to_u32(session.client_ip),
        expansions,
        features,
    };
    if let Err(e) = ctx.worlds.send_to_world(world_id as u32, msg.encode()).await {
        warn!(account = session.account_id, world = world_id, err = %e, "world send failed");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }

    session.store_login_request(req);
    flow.arm(Pending::Login);
    Ok(Step::Continue)
}

/// Suggest the next character id for a world: one past the highest serial
/// the account already has there.
fn next_character_id(slots: &[session::CharacterSlot], world_id: u16) -> u32 {
    let max_serial = slots
        .iter()
        .filter(|s| {
            s.entry.character_id != 0 && CharacterEntry::world_of(s.entry.character_id) == world_id
        })
        .map(|s| CharacterEntry::serial_of(s.entry.character_id))
        .max()
        .unwrap_or(0);
    ((world_id as u32) << 16) + max_serial as u32 + 1
}

async fn on_create(
    payload: &Bytes,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    flow: &mut Flow,
) -> anyhow::Result<Step> {
    if flow.pending.is_some() {
        warn!(account = session.account_id, "create while an operation is outstanding");
        return Ok(Step::Continue);
    }
    let req = match CreateRequest::parse(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad CREATE_CHARACTER payload");
            return Ok(Step::Done);
        }
    };

    let Some(world_id) = ctx.worlds.world_id_by_name(&req.world_name) else {
        warn!(account = session.account_id, world = %req.world_name, "create for unknown world");
        return fail_create(fw, session, ctx, ERR_CREATE_DENIED).await;
    };
    if ctx.worlds.is_test(world_id) == Some(true)
        && session.privileges() & ACCT_PRIV_TEST_ACCESS == 0
    {
        warn!(account = session.account_id, world = world_id,
            "create on a test world without privilege");
        return fail_create(fw, session, ctx, ERR_CREATE_DENIED).await;
    }

    if session.slots().is_none() {
        let slots = session::load_slots(&ctx.store, session.account_id).await?;
        session.set_slots(slots);
    }
    let slots = session.slots().expect("slots just loaded");

    let vacant = slots
        .iter()
        .any(|s| s.content_id == req.content_id && s.content_enabled && s.entry.character_id == 0);
    if !vacant {
        warn!(account = session.account_id, content = req.content_id,
            "create on a slot that is missing, disabled or occupied");
        return fail_create(fw, session, ctx, ERR_CREATE_DENIED).await;
    }

    let wid16 = world_id as u16;
    let suggested = next_character_id(&slots, wid16);

    session.modify_slots(|slots| {
        if let Some(slot) = slots.iter_mut().find(|s| s.content_id == req.content_id) {
            slot.entry = CharacterEntry {
                content_id: req.content_id,
                enabled: true,
                character_id: suggested,
                name: req.name.clone(),
                world_id: wid16,
                ..Default::default()
            };
        }
    });

    let msg = ReserveMsg {
        header: MsgHeader {
            msg_type: MSG_CHAR_RESERVE,
            content_id: req.content_id,
            character_id: suggested,
            account_id: session.account_id,
        },
        name: req.name.clone(),
    };
    if let Err(e) = ctx.worlds.send_to_world(world_id, msg.encode()).await {
        warn!(account = session.account_id, world = world_id, err = %e, "world send failed");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }

    flow.arm(Pending::Reserve {
        content_id: req.content_id,
    });
    Ok(Step::Continue)
}

/// Carry the client's appearance choices onto a reserved slot, with the
/// starting-job clamp and forced level/zone.
fn build_confirm_entry(reserved: &CharacterEntry, details: &CharacterEntry) -> CharacterEntry {
    let mut e = reserved.clone();
    e.race = details.race;
    e.face = details.face;
    e.hair = details.hair;
    e.size = details.size;
    e.nation = details.nation;
    e.head = details.head;
    e.body = details.body;
    e.hands = details.hands;
    e.legs = details.legs;
    e.feet = details.feet;
    e.main = details.main;
    e.sub = details.sub;
    e.main_job = if (BASIC_JOB_MIN..=BASIC_JOB_MAX).contains(&details.main_job) {
        details.main_job
    } else {
        JOB_WAR
    };
    e.main_job_level = 1;
    e.zone = 0;
    e
}

async fn on_confirm(
    payload: &Bytes,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    flow: &mut Flow,
) -> anyhow::Result<Step> {
    if flow.pending.is_some() {
        warn!(account = session.account_id, "confirm while an operation is outstanding");
        return Ok(Step::Continue);
    }
    let req = match ConfirmRequest::parse(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad CREATE_CHAR_CONFIRM payload");
            return Ok(Step::Done);
        }
    };

    let reserved = session
        .slots()
        .and_then(|slots| {
            slots
                .into_iter()
                .find(|s| s.content_id == req.content_id)
        })
        .filter(|s| {
            s.entry.character_id != 0 && s.entry.enabled && s.entry.nation == 0
        });
    let Some(reserved) = reserved else {
        warn!(account = session.account_id, content = req.content_id,
            "confirm without a live reservation");
        return fail_create(fw, session, ctx, ERR_CREATE_DENIED).await;
    };
    if req.details.nation > LAST_NATION {
        warn!(account = session.account_id, nation = req.details.nation, "invalid nation");
        return fail_create(fw, session, ctx, ERR_CREATE_DENIED).await;
    }

    let entry = build_confirm_entry(&reserved.entry, &req.details);
    session.modify_slots(|slots| {
        if let Some(slot) = slots.iter_mut().find(|s| s.content_id == req.content_id) {
            slot.entry = entry.clone();
        }
    });

    let world_id = CharacterEntry::world_of(entry.character_id);
    let msg = CreateMsg {
        header: MsgHeader {
            msg_type: MSG_CHAR_CREATE,
            content_id: req.content_id,
            character_id: entry.character_id,
            account_id: session.account_id,
        },
        details: entry,
    };
    if let Err(e) = ctx.worlds.send_to_world(world_id as u32, msg.encode()).await {
        warn!(account = session.account_id, world = world_id, err = %e, "world send failed");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }

    flow.arm(Pending::Confirm {
        content_id: req.content_id,
    });
    Ok(Step::Continue)
}

async fn on_delete(
    payload: &Bytes,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    flow: &mut Flow,
) -> anyhow::Result<Step> {
    if flow.pending.is_some() {
        warn!(account = session.account_id, "delete while an operation is outstanding");
        return Ok(Step::Continue);
    }
    let req = match DeleteRequest::parse(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad DELETE_CHARACTER payload");
            return Ok(Step::Done);
        }
    };

    let owned = session
        .slots()
        .map(|slots| {
            slots.iter().any(|s| {
                s.content_id == req.content_id
                    && s.entry.character_id == req.character_id
                    && s.entry.character_id != 0
            })
        })
        .unwrap_or(false);
    if !owned {
        warn!(account = session.account_id, character = req.character_id,
            "delete for a character not in this session");
        if let Err(e) = ctx.store.clean_half_created(session.account_id).await {
            warn!(account = session.account_id, err = %e, "half-created purge failed");
        }
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }
    // The session list may be stale; the row itself has the last word.
    match ctx.store.query_character(req.content_id).await {
        Ok(Some(row)) if row.character_id == req.character_id => {}
        Ok(_) => {
            warn!(account = session.account_id, content = req.content_id,
                "delete does not match the stored character");
            send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
            return Ok(Step::Done);
        }
        Err(e) => {
            warn!(account = session.account_id, err = %e, "character lookup failed");
            send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
            return Ok(Step::Done);
        }
    }

    let world_id = CharacterEntry::world_of(req.character_id);
    let header = MsgHeader {
        msg_type: MSG_CHAR_DELETE,
        content_id: req.content_id,
        character_id: req.character_id,
        account_id: session.account_id,
    };
    let mut msg = Vec::with_capacity(gateproto::mq::HEADER_LEN);
    header.encode_into(&mut msg);
    if let Err(e) = ctx.worlds.send_to_world(world_id as u32, msg).await {
        warn!(account = session.account_id, world = world_id, err = %e, "world send failed");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }

    flow.arm(Pending::Delete {
        content_id: req.content_id,
        character_id: req.character_id,
    });
    Ok(Step::Continue)
}

async fn handle_world_reply(
    bytes: Bytes,
    origin_world: u16,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    flow: &mut Flow,
) -> anyhow::Result<Step> {
    let header = match MsgHeader::parse(&bytes) {
        Ok(h) => h,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "unparsable world reply");
            return Ok(Step::Continue);
        }
    };
    if header.account_id != session.account_id {
        warn!(account = session.account_id, claimed = header.account_id,
            "world reply with mismatched account");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }

    let Some(pending) = flow.pending else {
        warn!(account = session.account_id, msg_type = header.msg_type,
            "world reply with no operation outstanding");
        return Ok(Step::Continue);
    };
    flow.disarm();

    match pending {
        Pending::Login => on_login_ack(&bytes, header, origin_world, fw, session).await,
        Pending::Reserve { content_id } => {
            on_reserve_ack(&bytes, header, content_id, fw, session, ctx).await
        }
        Pending::Confirm { content_id } => {
            on_confirm_ack(&bytes, header, content_id, fw, session, ctx).await
        }
        Pending::Delete {
            content_id,
            character_id,
        } => on_delete_ack(&bytes, header, content_id, character_id, fw, session, ctx).await,
    }
}

async fn on_login_ack(
    bytes: &Bytes,
    header: MsgHeader,
    origin_world: u16,
    fw: &mut Writer,
    session: &Session,
) -> anyhow::Result<Step> {
    if header.msg_type != MSG_CHAR_LOGIN_ACK {
        warn!(account = session.account_id, msg_type = header.msg_type,
            "expected CHAR_LOGIN_ACK");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }
    let ack = match LoginAckMsg::parse(bytes) {
        Ok(a) => a,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad CHAR_LOGIN_ACK");
            send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
            return Ok(Step::Done);
        }
    };
    let Some(stored) = session.take_login_request() else {
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    };

    // The reply must line up with what this session actually asked for.
    let slot_ok = session
        .slots()
        .map(|slots| {
            slots.iter().any(|s| {
                s.content_id == header.content_id
                    && s.content_enabled
                    && s.entry.character_id == header.character_id
                    && CharacterEntry::world_of(s.entry.character_id) == origin_world
            })
        })
        .unwrap_or(false);
    if header.content_id != stored.content_id || !slot_ok {
        warn!(account = session.account_id, content = header.content_id,
            "CHAR_LOGIN_ACK identity mismatch");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }

    if ack.response_code != 0 {
        warn!(account = session.account_id, code = ack.response_code, "world refused login");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }

    let resp = LoginResponse {
        content_id: header.content_id,
        character_id: header.character_id,
        name: stored.name,
        zone_ip: ack.zone_ip,
        zone_port: ack.zone_port,
        search_ip: ack.search_ip,
        search_port: ack.search_port,
    };
    fw.write_frame(TYPE_LOGIN_RESPONSE, &resp.encode()).await?;
    info!(account = session.account_id, character = header.character_id,
        client_version = %session.client_version(), "login handed off to zone");
    // The client drops us now and talks to the zone.
    Ok(Step::Done)
}

async fn on_reserve_ack(
    bytes: &Bytes,
    header: MsgHeader,
    content_id: u32,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
) -> anyhow::Result<Step> {
    if header.msg_type != MSG_CHAR_RESERVE_ACK || header.content_id != content_id {
        warn!(account = session.account_id, msg_type = header.msg_type,
            "unexpected reply to CHAR_RESERVE");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }
    let ack = match GenericResponse::parse(bytes) {
        Ok(a) => a,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad CHAR_RESERVE_ACK");
            send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
            return Ok(Step::Done);
        }
    };
    if ack.response_code != 0 {
        warn!(account = session.account_id, code = ack.response_code, "reservation refused");
        purge_slot(session, ctx, content_id).await;
        send_error(fw, ERR_NAME_ALREADY_TAKEN).await?;
        return Ok(Step::Continue);
    }
    fw.write_frame(TYPE_DONE, &encode_done()).await?;
    Ok(Step::Continue)
}

async fn on_confirm_ack(
    bytes: &Bytes,
    header: MsgHeader,
    content_id: u32,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
) -> anyhow::Result<Step> {
    if header.msg_type != MSG_CHAR_CREATE_ACK || header.content_id != content_id {
        warn!(account = session.account_id, msg_type = header.msg_type,
            "unexpected reply to CHAR_CREATE");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }
    let ack = match CreateAckMsg::parse(bytes) {
        Ok(a) => a,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad CHAR_CREATE_ACK");
            send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
            return Ok(Step::Done);
        }
    };
    if ack.response_code != 0 {
        warn!(account = session.account_id, code = ack.response_code, "world refused creation");
        purge_slot(session, ctx, content_id).await;
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Continue);
    }

    // The world may have assigned a different character id; adopt it,
    // along with the starting zone it rolled.
    let committed = session.modify_slots(|slots| {
        slots
            .iter_mut()
            .find(|s| s.content_id == content_id)
            .map(|slot| {
                slot.entry.character_id = header.character_id;
                slot.entry.zone = ack.zone;
                slot.entry.clone()
            })
    });
    let Some(Some(entry)) = committed else {
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    };

    match ctx.store.update_character(session.account_id, &entry).await {
        Ok(()) => {}
        Err(UpdateError::NameTaken) => {
            warn!(account = session.account_id, name = %entry.name, "name taken at commit");
            purge_slot(session, ctx, content_id).await;
            send_error(fw, ERR_NAME_ALREADY_TAKEN).await?;
            return Ok(Step::Continue);
        }
        Err(e) => {
            warn!(account = session.account_id, err = %e, "character commit failed");
            purge_slot(session, ctx, content_id).await;
            send_error(fw, ERR_CREATE_DENIED).await?;
            return Ok(Step::Continue);
        }
    }

    info!(account = session.account_id, character = entry.character_id, "character created");
    fw.write_frame(TYPE_DONE, &encode_done()).await?;
    // Creation does not log the player in; the client re-requests the
    // list and then sends LOGIN_REQUEST on its own.
    Ok(Step::Continue)
}

async fn on_delete_ack(
    bytes: &Bytes,
    header: MsgHeader,
    content_id: u32,
    character_id: u32,
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
) -> anyhow::Result<Step> {
    if header.msg_type != MSG_CHAR_DELETE_ACK
        || header.content_id != content_id
        || header.character_id != character_id
    {
        warn!(account = session.account_id, msg_type = header.msg_type,
            "unexpected reply to CHAR_DELETE");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }
    let ack = match GenericResponse::parse(bytes) {
        Ok(a) => a,
        Err(e) => {
            warn!(account = session.account_id, err = %e, "bad CHAR_DELETE_ACK");
            send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
            return Ok(Step::Done);
        }
    };
    if ack.response_code != 0 {
        warn!(account = session.account_id, code = ack.response_code, "world refused deletion");
        if let Err(e) = ctx.store.clean_half_created(session.account_id).await {
            warn!(account = session.account_id, err = %e, "half-created purge failed");
        }
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Continue);
    }

    if let Err(e) = ctx.store.delete_character(character_id).await {
        warn!(account = session.account_id, err = %e, "character row delete failed");
        send_error(fw, ERR_MAP_CONNECT_FAILED).await?;
        return Ok(Step::Done);
    }
    // Blank name so the client renders the slot as vacant.
    session.modify_slots(|slots| {
        if let Some(slot) = slots.iter_mut().find(|s| s.content_id == content_id) {
            slot.entry = CharacterEntry {
                content_id,
                name: " ".to_string(),
                ..Default::default()
            };
        }
    });

    info!(account = session.account_id, character = character_id, "character deleted");
    fw.write_frame(TYPE_DONE, &encode_done()).await?;
    Ok(Step::Continue)
}

/// Shared failure path for create flows: purge leftovers, then report.
async fn fail_create(
    fw: &mut Writer,
    session: &Session,
    ctx: &ViewContext,
    code: u32,
) -> anyhow::Result<Step> {
    if let Err(e) = ctx.store.clean_half_created(session.account_id).await {
        warn!(account = session.account_id, err = %e, "half-created purge failed");
    }
    send_error(fw, code).await?;
    Ok(Step::Continue)
}

/// Drop an in-memory reservation and purge any half-created row.
async fn purge_slot(session: &Session, ctx: &ViewContext, content_id: u32) {
    session.modify_slots(|slots| {
        if let Some(slot) = slots.iter_mut().find(|s| s.content_id == content_id) {
            slot.entry = CharacterEntry {
                content_id,
                ..Default::default()
            };
        }
    });
    if let Err(e) = ctx.store.clean_half_created(session.account_id).await {
        warn!(account = session.account_id, err = %e, "half-created purge failed");
    }
}

async fn send_error(fw: &mut Writer, code: u32) -> std::io::Result<()> {
    fw.write_frame(TYPE_ERROR, &encode_error(code)).await
}

fn ip_to_u32(ip: IpAddr) -> u32 {
    match ip {
        // Octet order preserved on the little-endian wire.
        IpAddr::V4(v4) => u32::from_le_bytes(v4.octets()),
        IpAddr::V6(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CharacterSlot;

    #[test]
    fn version_gate_modes() {
        assert!(version_permitted(0, "30200101_0", "29990000_0"));
        assert!(version_permitted(1, "30200101_0", "30200101_0"));
        assert!(!version_permitted(1, "30200101_0", "30200101_1"));
        // Minimum mode: older rejected, newer accepted.
        assert!(!version_permitted(2, "30200101_0", "30191004_0"));
        assert!(version_permitted(2, "30200101_0", "30210101_0"));
        assert!(version_permitted(2, "30200101_0", "30200101_0"));
    }

    fn slot(content_id: u32, character_id: u32) -> CharacterSlot {
        CharacterSlot {
            content_id,
            content_enabled: true,
            entry: CharacterEntry {
                content_id,
                enabled: character_id != 0,
                character_id,
                world_id: CharacterEntry::world_of(character_id),
                ..Default::default()
            },
        }
    }

    #[test]
    fn suggested_id_continues_the_world_sequence() {
        let slots = vec![
            slot(672, (3 << 16) | 7),
            slot(673, (5 << 16) | 100),
            slot(674, 0),
        ];
        assert_eq!(next_character_id(&slots, 3), (3 << 16) + 8);
        assert_eq!(next_character_id(&slots, 5), (5 << 16) + 101);
        // Empty world starts at serial 1.
        assert_eq!(next_character_id(&slots, 9), (9 << 16) + 1);
    }

    #[test]
    fn confirm_clamps_job_and_forces_level_and_zone() {
        let reserved = CharacterEntry {
            content_id: 672,
            enabled: true,
            character_id: (3 << 16) | 1,
            name: "Bob".into(),
            world_id: 3,
            ..Default::default()
        };
        let mut details = CharacterEntry {
            race: 1,
            nation: 1,
            main_job: 99,
            main_job_level: 75,
            zone: 0x123,
            ..Default::default()
        };

        let e = build_confirm_entry(&reserved, &details);
        assert_eq!(e.main_job, JOB_WAR);
        assert_eq!(e.main_job_level, 1);
        assert_eq!(e.zone, 0);
        assert_eq!(e.name, "Bob");
        assert_eq!(e.character_id, (3 << 16) | 1);

        details.main_job = 0;
        assert_eq!(build_confirm_entry(&reserved, &details).main_job, JOB_WAR);
        details.main_job = 6;
        assert_eq!(build_confirm_entry(&reserved, &details).main_job, 6);
        details.main_job = 3;
        assert_eq!(build_confirm_entry(&reserved, &details).main_job, 3);
    }

    #[test]
    fn ipv4_keeps_octet_order_on_wire() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let raw = ip_to_u32(ip).to_le_bytes();
        assert_eq!(raw, [10, 0, 0, 5]);
    }
}
