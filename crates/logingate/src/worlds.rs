//! World catalog and the fan-out to per-world broker connections.
//!
//! World rows are loaded once at startup; each active row gets its own
//! broker connection task. A world whose broker cannot be reached is
//! skipped (and absent from the list packets) until the process restarts.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::WorldRow;
use crate::mq::{MqIngress, WorldConnection};

/// Unknown 4-byte header every world-list packet starts with.
const WORLD_LIST_HEADER: u32 = 0x20;

const WORLD_NAME_FIELD: usize = 16;

/// Outbound queue depth towards one world.
const WORLD_SEND_DEPTH: usize = 256;

#[derive(Debug)]
pub struct WorldHandle {
    pub name: String,
    pub is_test: bool,
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug)]
pub struct WorldRegistry {
    worlds: HashMap<u32, WorldHandle>,
    admin_packet: Bytes,
    user_packet: Bytes,
}

impl WorldRegistry {
    /// Connect every active world and build the cached list packets.
    pub async fn init(
        rows: Vec<WorldRow>,
        handlers: Arc<Vec<MqIngress>>,
    ) -> anyhow::Result<Self> {
        let mut worlds = HashMap::new();
        for row in rows {
            let (tx, rx) = mpsc::channel(WORLD_SEND_DEPTH);
            match WorldConnection::connect(&row, handlers.clone(), rx).await {
                Ok(conn) => {
                    info!(world = row.id, name = %row.name, "world broker connected");
                    tokio::spawn(conn.run());
                    worlds.insert(
                        row.id,
                        WorldHandle {
                            name: row.name,
                            is_test: row.is_test,
                            tx,
                        },
                    );
                }
                Err(e) => {
                    warn!(world = row.id, name = %row.name, err = %e,
                        "world broker connection failed; world disabled");
                }
            }
        }
        Self::from_handles(worlds)
    }

    /// Build the registry from already-connected handles.
    pub fn from_handles(worlds: HashMap<u32, WorldHandle>) -> anyhow::Result<Self> {
        if worlds.is_empty() {
            anyhow::bail!("no reachable worlds");
        }
        if worlds.values().all(|w| w.is_test) {
            anyhow::bail!("all reachable worlds are test worlds");
        }

        let mut ordered: Vec<(&u32, &WorldHandle)> = worlds.iter().collect();
        ordered.sort_by_key(|(id, _)| **id);

        let admin_packet = build_list_packet(ordered.iter().map(|(id, w)| (**id, w.name.as_str())));
        let user_packet = build_list_packet(
            ordered
                .iter()
                .filter(|(_, w)| !w.is_test)
                .map(|(id, w)| (**id, w.name.as_str())),
        );

        Ok(Self {
            worlds,
            admin_packet,
            user_packet,
        })
    }

    pub fn world_name(&self, id: u32) -> Option<&str> {
        self.worlds.get(&id).map(|w| w.name.as_str())
    }

    pub fn world_id_by_name(&self, name: &str) -> Option<u32> {
        self.worlds
            .iter()
            .find(|(_, w)| w.name == name)
            .map(|(id, _)| *id)
    }

    pub fn is_test(&self, id: u32) -> Option<bool> {
        self.worlds.get(&id).map(|w| w.is_test)
    }

    /// World list including test worlds.
    pub fn admin_worlds_packet(&self) -> Bytes {
        self.admin_packet.clone()
    }

    /// World list with test worlds filtered out.
    pub fn user_worlds_packet(&self) -> Bytes {
        self.user_packet.clone()
    }

    pub async fn send_to_world(&self, id: u32, bytes: Vec<u8>) -> anyhow::Result<()> {
        let w = self
            .worlds
            .get(&id)
            .with_context(|| format!("no such world: {id}"))?;
        w.tx.send(bytes)
            .await
            .map_err(|_| anyhow::anyhow!("world {id} connection is gone"))
    }

    /// Best-effort send to every connected world.
    pub async fn broadcast(&self, bytes: &[u8]) {
        for (id, w) in &self.worlds {
            if w.tx.send(bytes.to_vec()).await.is_err() {
                warn!(world = id, "broadcast to a dead world connection");
            }
        }
    }

    #[cfg(test)]
    pub fn test_handle(name: &str, is_test: bool) -> WorldHandle {
        let (tx, _rx) = mpsc::channel(1);
        WorldHandle {
            name: name.to_string(),
            is_test,
            tx,
        }
    }
}

fn build_list_packet<'a>(entries: impl Iterator<Item = (u32, &'a str)>) -> Bytes {
    let mut out = Vec::new();
    out.extend_from_slice(&WORLD_LIST_HEADER.to_le_bytes());
    for (id, name) in entries {
        out.extend_from_slice(&id.to_le_bytes());
        let bytes = name.as_bytes();
        let n = bytes.len().min(WORLD_NAME_FIELD - 1);
        out.extend_from_slice(&bytes[..n]);
        out.resize(out.len() + (WORLD_NAME_FIELD - n), 0);
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorldRegistry {
        let mut worlds = HashMap::new();
        worlds.insert(3, WorldRegistry::test_handle("Titan", false));
        worlds.insert(9, WorldRegistry::test_handle("TitanTest", true));
        WorldRegistry::from_handles(worlds).unwrap()
    }

    #[test]
    fn list_packets_differ_by_test_flag() {
        let reg = registry();
        // header + 2 entries vs header + 1 entry
        assert_eq!(reg.admin_worlds_packet().len(), 4 + 2 * 20);
        assert_eq!(reg.user_worlds_packet().len(), 4 + 20);

        let admin = reg.admin_worlds_packet();
        assert_eq!(&admin[..4], &0x20u32.to_le_bytes());
        assert_eq!(&admin[4..8], &3u32.to_le_bytes());
        assert_eq!(&admin[8..13], b"Titan");
    }

    #[test]
    fn lookups() {
        let reg = registry();
        assert_eq!(reg.world_id_by_name("Titan"), Some(3));
        assert_eq!(reg.world_id_by_name("Phoenix"), None);
        assert_eq!(reg.world_name(9), Some("TitanTest"));
        assert_eq!(reg.is_test(9), Some(true));
        assert_eq!(reg.is_test(3), Some(false));
    }

    #[test]
    fn all_test_worlds_fails_init() {
        let mut worlds = HashMap::new();
        worlds.insert(9, WorldRegistry::test_handle("TitanTest", true));
        assert!(WorldRegistry::from_handles(worlds).is_err());
    }

    #[test]
    fn zero_worlds_fails_init() {
        assert!(WorldRegistry::from_handles(HashMap::new()).is_err());
    }

    #[test]
    fn long_world_name_is_truncated() {
        let mut worlds = HashMap::new();
        worlds.insert(
            1,
            WorldRegistry::test_handle("WorldNameThatIsWayTooLong", false),
        );
        let reg = WorldRegistry::from_handles(worlds).unwrap();
        let p = reg.user_worlds_packet();
        assert_eq!(p.len(), 4 + 20);
        // 15 name bytes plus a guaranteed NUL.
        assert_eq!(&p[8..23], b"WorldNameThatIs");
        assert_eq!(p[23], 0);
    }
}
