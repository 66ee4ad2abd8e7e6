use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn, Level};

mod auth;
mod caps;
mod config;
mod data;
mod db;
mod ioutil;
mod mq;
mod session;
mod view;
mod worlds;

use caps::ConnCaps;
use mq::{CharMsgHandler, MqIngress};
use session::SessionRegistry;
use view::ViewContext;
use worlds::WorldRegistry;

#[derive(Debug, Clone, Copy)]
enum PortKind {
    Auth,
    Data,
    View,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,logingate=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = Arc::new(config::parse_args());
    let store = db::Store::connect(&cfg).await?;
    let sessions = Arc::new(SessionRegistry::new());

    let world_rows = store.load_worlds().await?;
    let handlers = Arc::new(vec![MqIngress::CharMessages(CharMsgHandler::new(
        sessions.clone(),
        store.clone(),
    ))]);
    let worlds = Arc::new(WorldRegistry::init(world_rows, handlers).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let caps = Arc::new(ConnCaps::new());

    let view_ctx = ViewContext {
        store: store.clone(),
        sessions: sessions.clone(),
        worlds: worlds.clone(),
        cfg: cfg.clone(),
    };

    for kind in [PortKind::Auth, PortKind::Data, PortKind::View] {
        let port = match kind {
            PortKind::Auth => cfg.auth_port,
            PortKind::Data => cfg.data_port,
            PortKind::View => cfg.view_port,
        };
        let listener = TcpListener::bind((cfg.login_ip, port)).await?;
        info!(?kind, addr = %listener.local_addr()?, "listening");
        tokio::spawn(serve_port(
            kind,
            listener,
            store.clone(),
            sessions.clone(),
            view_ctx.clone(),
            cfg.clone(),
            caps.clone(),
            shutdown_rx.clone(),
        ));
    }

    tokio::spawn(sweep_task(sessions.clone(), shutdown_rx.clone()));

    wait_for_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    // Handlers poll at a 1 s cadence; give them a tick to wind down.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_port(
    kind: PortKind,
    listener: TcpListener,
    store: db::Store,
    sessions: Arc<SessionRegistry>,
    view_ctx: ViewContext,
    cfg: Arc<config::Config>,
    caps: Arc<ConnCaps>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(?kind, err = %e, "accept failed");
                    continue;
                }
            },
        };

        // Cheap DoS guard: one address gets a bounded number of
        // concurrent connections across all three ports.
        let Some(guard) = caps.try_acquire(peer.ip(), cfg.max_client_connections) else {
            warn!(?kind, peer = %peer, "too many connections from address; rejecting");
            drop(stream);
            continue;
        };

        debug!(?kind, peer = %peer, "accepted connection");
        let store = store.clone();
        let sessions = sessions.clone();
        let view_ctx = view_ctx.clone();
        let cfg = cfg.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match kind {
                PortKind::Auth => {
                    auth::handle_auth_conn(stream, peer, store, sessions, cfg, shutdown).await
                }
                PortKind::Data => {
                    data::handle_data_conn(stream, peer, store, sessions, shutdown).await
                }
                PortKind::View => {
                    view::handle_view_conn(stream, peer, view_ctx, shutdown).await
                }
            }
        });
    }
}

/// Opportunistic eviction of expired sessions, on the same 1 s cadence the
/// handlers poll at.
async fn sweep_task(sessions: Arc<SessionRegistry>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                let removed = sessions.sweep_expired();
                if removed > 0 {
                    debug!(removed, "swept expired sessions");
                }
            }
        }
    }
}
