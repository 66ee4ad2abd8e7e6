use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tracing::{error, info, warn, Level};

use gateproto::mq::{LOGIN_MQ_NAME, WORLD_MQ_NAME};

mod charhnd;
mod config;
mod db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worldd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = config::parse_args();
    let store = db::WorldStore::connect(&cfg).await?;
    let mut handler = charhnd::CharMsgHnd::new(store, &cfg);

    let uri = amqp_uri(&cfg);
    let props = ConnectionProperties::default();
    let conn = if cfg.mq_ssl {
        // A pinned CA only matters when peer verification is wanted;
        // system verification itself always stays on.
        let cert_chain = match (&cfg.mq_ssl_ca_file, cfg.mq_ssl_verify) {
            (Some(path), true) => Some(std::fs::read_to_string(path)?),
            _ => None,
        };
        let identity = match &cfg.mq_ssl_client_cert {
            Some(path) => Some(OwnedIdentity {
                der: std::fs::read(path)?,
                password: cfg.mq_ssl_client_key.clone().unwrap_or_default(),
            }),
            None => None,
        };
        Connection::connect_with_config(
            &uri,
            props,
            OwnedTLSConfig {
                identity,
                cert_chain,
            },
        )
        .await?
    } else {
        Connection::connect(&uri, props).await?
    };

    let channel = conn.create_channel().await?;
    channel
        .queue_declare(
            WORLD_MQ_NAME,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    let mut consumer = channel
        .basic_consume(
            WORLD_MQ_NAME,
            &format!("worldd-{}", cfg.world_id),
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    info!(world = cfg.world_id, broker = %cfg.mq_server, "world daemon running");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        let delivery = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            d = consumer.next() => d,
        };
        let delivery = match delivery {
            Some(Ok(d)) => d,
            Some(Err(e)) => {
                error!(err = %e, "consumer failed");
                break;
            }
            None => {
                error!("broker closed the channel");
                break;
            }
        };

        let replies = match handler.handle(&delivery.data).await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "bad message from login server");
                continue;
            }
        };
        let mut publish_failed = false;
        for bytes in replies {
            if let Err(e) = channel
                .basic_publish(
                    "",
                    LOGIN_MQ_NAME,
                    BasicPublishOptions::default(),
                    &bytes,
                    BasicProperties::default()
                        .with_content_type("application/octet-stream".into()),
                )
                .await
            {
                error!(err = %e, "publish failed");
                publish_failed = true;
                break;
            }
        }
        if publish_failed {
            break;
        }
    }

    info!("shutting down");
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

fn amqp_uri(cfg: &config::Config) -> String {
    let scheme = if cfg.mq_ssl { "amqps" } else { "amqp" };
    format!(
        "{}://{}:{}@{}:{}/{}",
        scheme,
        pct_encode(&cfg.mq_username),
        pct_encode(&cfg.mq_password),
        cfg.mq_server,
        cfg.mq_port,
        pct_encode(&cfg.mq_vhost),
    )
}

fn pct_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
