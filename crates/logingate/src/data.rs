//! Bootloader data port handler.
//!
//! Strict three-step handshake: account id, session key, minimal character
//! list. Any deviation drops the connection without a reply. The handler
//! polls once a second so it can notice shutdown and the view handler's
//! ask-for-key signal while waiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gateproto::data::{
    encode_character_list, AccountIdPayload, ACCOUNT_ID_PAYLOAD_LEN, C2S_ACCOUNT_ID, C2S_KEY,
    KEY_LEN, S2C_SEND_ACCOUNT_ID, S2C_SEND_KEY,
};

use crate::db::Store;
use crate::ioutil::{PolledReader, ReadOutcome};
use crate::session::{self, DataSignal, Session, SessionRegistry, ViewSignal, SESSION_KEY_LEN};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace before the list goes out; clients dislike an immediate send.
const LIST_GRACE: Duration = Duration::from_secs(1);

/// TTL extension granted when the key arrives.
const KEY_TTL_EXTENSION: Duration = Duration::from_secs(30);

pub async fn handle_data_conn(
    stream: TcpStream,
    peer: SocketAddr,
    store: Store,
    sessions: Arc<SessionRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let (rd, mut wr) = stream.into_split();
    let mut pr = PolledReader::new(rd);

    if wr.write_all(&[S2C_SEND_ACCOUNT_ID]).await.is_err() {
        debug!(peer = %peer, "connection dropped before account id request");
        return;
    }

    let Some(session) = await_account_id(&mut pr, &sessions, peer, &shutdown).await else {
        return;
    };

    if let Err(e) = run_with_session(&mut pr, &mut wr, &store, &session, &shutdown).await {
        warn!(peer = %peer, account = session.account_id, err = %e, "data handler aborted");
    }
    session.set_data_done();
}

/// First state: nothing is accepted before the client identifies itself.
async fn await_account_id(
    pr: &mut PolledReader<OwnedReadHalf>,
    sessions: &SessionRegistry,
    peer: SocketAddr,
    shutdown: &watch::Receiver<bool>,
) -> Option<Arc<Session>> {
    let t = read_n(pr, 1, shutdown).await?;
    if t[0] != C2S_ACCOUNT_ID {
        warn!(peer = %peer, packet_type = t[0], "client spoke before identifying");
        return None;
    }
    let payload = read_n(pr, ACCOUNT_ID_PAYLOAD_LEN, shutdown).await?;
    let acct = AccountIdPayload::parse(&payload).ok()?;

    let session = match sessions.get(acct.account_id) {
        Ok(s) => s,
        Err(_) => {
            warn!(peer = %peer, account = acct.account_id,
                "data connection without prior authentication");
            return None;
        }
    };
    if session.client_ip != peer.ip() {
        warn!(peer = %peer, account = acct.account_id, "account id / address mismatch");
        return None;
    }
    if session.has_expired() {
        warn!(peer = %peer, account = acct.account_id, "session expired");
        return None;
    }
    debug!(account = acct.account_id, "account id check passed");
    Some(session)
}

async fn run_with_session(
    pr: &mut PolledReader<OwnedReadHalf>,
    wr: &mut OwnedWriteHalf,
    store: &Store,
    session: &Session,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<()> {
    wr.write_all(&[S2C_SEND_KEY]).await?;

    // await_key: poll for the key packet, re-prompting whenever the view
    // handler asks.
    let key = loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        if let Some(DataSignal::AskForKey) = session.take_data_signal() {
            wr.write_all(&[S2C_SEND_KEY]).await?;
        }
        let t = match pr.read_exact_timeout(1, POLL_INTERVAL).await? {
            ReadOutcome::TimedOut => continue,
            ReadOutcome::Eof => anyhow::bail!("client dropped before sending key"),
            ReadOutcome::Data(d) => d,
        };
        if t[0] != C2S_KEY {
            anyhow::bail!("unexpected packet type 0x{:02x} while awaiting key", t[0]);
        }
        let Some(raw) = read_n(pr, KEY_LEN, shutdown).await else {
            anyhow::bail!("client dropped mid key packet");
        };
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&raw);
        break key;
    };

    session.install_key(&key);
    // The session has to survive until the client actually enters the
    // game, which may take a while on the view port.
    session.set_expiry_relative(KEY_TTL_EXTENSION, false);

    tokio::time::sleep(LIST_GRACE).await;

    let slots = session::load_slots(store, session.account_id).await?;
    let pairs: Vec<(u32, u32)> = slots
        .iter()
        .map(|s| (s.content_id, s.entry.character_id))
        .collect();
    wr.write_all(&encode_character_list(&pairs)).await?;

    session.signal_view(ViewSignal::SendCharacterList);
    info!(account = session.account_id, "data handshake complete");
    Ok(())
}

/// Read exactly `n` bytes, polling for shutdown. `None` means the
/// connection ended or the process is going down.
async fn read_n(
    pr: &mut PolledReader<OwnedReadHalf>,
    n: usize,
    shutdown: &watch::Receiver<bool>,
) -> Option<Bytes> {
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match pr.read_exact_timeout(n, POLL_INTERVAL).await {
            Ok(ReadOutcome::TimedOut) => continue,
            Ok(ReadOutcome::Eof) => return None,
            Ok(ReadOutcome::Data(d)) => return Some(d),
            Err(_) => return None,
        }
    }
}
