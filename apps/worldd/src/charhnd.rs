//! Character allocator: reservation, creation, deletion and login acks.
//!
//! Creation is two-phase. The login server first reserves a character id
//! and name; the reservation lives in memory only so an abandoned creation
//! costs nothing. The confirm message turns the reservation into rows.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use gateproto::entry::CharacterEntry;
use gateproto::mq::{
    CreateAckMsg, CreateMsg, GenericResponse, LoginAckMsg, LoginRequestMsg, MsgHeader,
    ReserveMsg, UpdateMsg, MSG_CHAR_CREATE, MSG_CHAR_CREATE_ACK, MSG_CHAR_DELETE,
    MSG_CHAR_DELETE_ACK, MSG_CHAR_LOGIN, MSG_CHAR_LOGIN_ACK, MSG_CHAR_RESERVE,
    MSG_CHAR_RESERVE_ACK, MSG_CHAR_UPDATE, MSG_GET_ACCOUNT_CHARS, MSG_LOGIN_FULL_SYNC,
};

use crate::config::Config;
use crate::db::{NewCharacter, SyncCharacter, WorldStore};

const BASIC_JOB_MIN: u8 = 1;
const BASIC_JOB_MAX: u8 = 6;

/// Generic non-zero failure code carried in acks.
const RESPONSE_FAILED: u32 = 1;

#[derive(Debug, Clone)]
struct Reservation {
    serial: u16,
    content_id: u32,
    account_id: u32,
    expires_at: Instant,
}

/// In-memory reservation list with TTL eviction on every touch.
#[derive(Debug)]
struct ReservationList {
    items: Vec<Reservation>,
    ttl: Duration,
}

impl ReservationList {
    fn new(ttl: Duration) -> Self {
        Self {
            items: Vec::new(),
            ttl,
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        self.items.retain(|r| r.expires_at > now);
    }

    fn reserve(&mut self, account_id: u32, content_id: u32, serial: u16, now: Instant) {
        self.evict_expired(now);
        self.items.push(Reservation {
            serial,
            content_id,
            account_id,
            expires_at: now + self.ttl,
        });
    }

    fn take_by_serial(&mut self, serial: u16, now: Instant) -> Option<Reservation> {
        self.evict_expired(now);
        let idx = self.items.iter().position(|r| r.serial == serial)?;
        Some(self.items.remove(idx))
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Starting zone for a nation, rolled uniformly. Windurst Walls (0xEF) is
/// not a valid starting zone.
fn starting_zone(nation: u8) -> Option<u16> {
    let mut rng = rand::thread_rng();
    let zones: [u16; 3] = match nation {
        0 => [0xE6, 0xE7, 0xE8],
        1 => [0xEA, 0xEB, 0xEC],
        2 => [0xEE, 0xF0, 0xF1],
        _ => return None,
    };
    Some(zones[rng.gen_range(0..3)])
}

pub struct CharMsgHnd {
    store: WorldStore,
    world_id: u16,
    reservations: ReservationList,
    zone_ip: u32,
    zone_port: u16,
    search_ip: u32,
    search_port: u16,
}

impl CharMsgHnd {
    pub fn new(store: WorldStore, cfg: &Config) -> Self {
        Self {
            store,
            world_id: cfg.world_id,
            reservations: ReservationList::new(Duration::from_secs(cfg.reservation_timeout)),
            zone_ip: u32::from_le_bytes(cfg.zone_ip.octets()),
            zone_port: cfg.zone_port,
            search_ip: u32::from_le_bytes(cfg.search_ip.octets()),
            search_port: cfg.search_port,
        }
    }

    /// Handle one message from the login server; every returned buffer is
    /// published back on the login queue in order.
    pub async fn handle(&mut self, bytes: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let header = MsgHeader::parse(bytes)?;
        match header.msg_type {
            MSG_CHAR_RESERVE => {
                let msg = ReserveMsg::parse(bytes)?;
                let code = match self.reserve(&header).await {
                    Ok(()) => {
                        info!(account = header.account_id, content = header.content_id,
                            name = %msg.name, pending = self.reservations.len(),
                            "character reserved");
                        0
                    }
                    Err(e) => {
                        warn!(account = header.account_id, err = %e, "reservation rejected");
                        RESPONSE_FAILED
                    }
                };
                Ok(vec![ack_generic(header, MSG_CHAR_RESERVE_ACK, code)])
            }
            MSG_CHAR_CREATE => {
                let msg = CreateMsg::parse(bytes)?;
                match self.create(&header, &msg.details).await {
                    Ok((full_id, zone)) => {
                        info!(account = header.account_id, character = full_id, zone,
                            "character created");
                        let mut ack_header = header;
                        ack_header.msg_type = MSG_CHAR_CREATE_ACK;
                        ack_header.character_id = full_id;
                        Ok(vec![CreateAckMsg {
                            header: ack_header,
                            response_code: 0,
                            zone,
                        }
                        .encode()])
                    }
                    Err(e) => {
                        warn!(account = header.account_id, err = %e, "creation rejected");
                        let mut ack_header = header;
                        ack_header.msg_type = MSG_CHAR_CREATE_ACK;
                        Ok(vec![CreateAckMsg {
                            header: ack_header,
                            response_code: RESPONSE_FAILED,
                            zone: 0,
                        }
                        .encode()])
                    }
                }
            }
            MSG_CHAR_DELETE => {
                let serial = CharacterEntry::serial_of(header.character_id);
                let code = match self.store.delete_character(serial).await {
                    Ok(()) => {
                        info!(character = header.character_id, "character deleted");
                        0
                    }
                    Err(e) => {
                        warn!(character = header.character_id, err = %e, "deletion failed");
                        RESPONSE_FAILED
                    }
                };
                Ok(vec![ack_generic(header, MSG_CHAR_DELETE_ACK, code)])
            }
            MSG_CHAR_LOGIN => {
                let msg = LoginRequestMsg::parse(bytes)?;
                // The zone will validate the key on connect; from here the
                // hand-off endpoints are all the login server needs.
                debug!(account = header.account_id, character = header.character_id,
                    client_ip = msg.client_ip, "login acknowledged");
                let mut ack_header = header;
                ack_header.msg_type = MSG_CHAR_LOGIN_ACK;
                Ok(vec![LoginAckMsg {
                    header: ack_header,
                    response_code: 0,
                    zone_ip: self.zone_ip,
                    zone_port: self.zone_port,
                    search_ip: self.search_ip,
                    search_port: self.search_port,
                }
                .encode()])
            }
            MSG_GET_ACCOUNT_CHARS => {
                let chars = self.store.characters_for_sync(Some(header.account_id)).await?;
                info!(account = header.account_id, count = chars.len(),
                    "syncing account characters to login");
                Ok(chars.iter().map(|c| self.update_message(c)).collect())
            }
            MSG_LOGIN_FULL_SYNC => {
                let chars = self.store.characters_for_sync(None).await?;
                info!(count = chars.len(), "full character sync to login");
                Ok(chars.iter().map(|c| self.update_message(c)).collect())
            }
            other => {
                debug!(msg_type = other, "ignoring message");
                Ok(Vec::new())
            }
        }
    }

    /// A `CHAR_UPDATE` carrying one of this world's characters.
    fn update_message(&self, c: &SyncCharacter) -> Vec<u8> {
        let character_id = ((self.world_id as u32) << 16) | c.serial as u32;
        UpdateMsg {
            header: MsgHeader {
                msg_type: MSG_CHAR_UPDATE,
                content_id: c.content_id,
                character_id,
                account_id: c.account_id,
            },
            details: CharacterEntry {
                content_id: c.content_id,
                enabled: true,
                character_id,
                name: c.name.clone(),
                world_id: self.world_id,
                main_job: c.main_job,
                main_job_level: c.main_job_level,
                zone: c.zone,
                race: c.race,
                face: c.face,
                hair: c.hair,
                size: c.size,
                nation: c.nation,
                head: c.head,
                body: c.body,
                hands: c.hands,
                legs: c.legs,
                feet: c.feet,
                main: c.main,
                sub: c.sub,
            },
        }
        .encode()
    }

    /// Double-check store uniqueness, then hold the id and content id.
    /// Content ids are universal, so the login server has already vetted
    /// them; the store check guards against races between login servers.
    async fn reserve(&mut self, header: &MsgHeader) -> anyhow::Result<()> {
        let serial = CharacterEntry::serial_of(header.character_id);
        if self
            .store
            .content_or_char_exists(header.content_id, serial)
            .await?
        {
            anyhow::bail!("content id or character id already in use");
        }
        self.reservations
            .reserve(header.account_id, header.content_id, serial, Instant::now());
        Ok(())
    }

    /// Commit a reservation. Returns the (possibly replaced) full
    /// character id and the rolled starting zone.
    async fn create(
        &mut self,
        header: &MsgHeader,
        details: &CharacterEntry,
    ) -> anyhow::Result<(u32, u16)> {
        let suggested = CharacterEntry::serial_of(header.character_id);
        let reservation = self
            .reservations
            .take_by_serial(suggested, Instant::now())
            .ok_or_else(|| anyhow::anyhow!("character id has no live reservation"))?;
        if reservation.content_id != details.content_id {
            anyhow::bail!("content id does not match reservation");
        }
        if !(BASIC_JOB_MIN..=BASIC_JOB_MAX).contains(&details.main_job) {
            anyhow::bail!("starting job {} is not a basic job", details.main_job);
        }

        // Zero means "you decide"; a taken id also gets replaced.
        let serial = if suggested == 0 || self.store.char_exists(suggested).await? {
            self.store.max_serial().await? + 1
        } else {
            suggested
        };

        let zone = starting_zone(details.nation)
            .ok_or_else(|| anyhow::anyhow!("invalid nation {}", details.nation))?;

        self.store
            .insert_character(&NewCharacter {
                serial,
                content_id: reservation.content_id,
                account_id: reservation.account_id,
                name: details.name.clone(),
                zone,
                nation: details.nation,
                race: details.race,
                face: details.face,
                hair: details.hair,
                size: details.size,
                main_job: details.main_job,
            })
            .await?;

        Ok((((self.world_id as u32) << 16) | serial as u32, zone))
    }
}

fn ack_generic(mut header: MsgHeader, ack_type: u32, response_code: u32) -> Vec<u8> {
    header.msg_type = ack_type;
    GenericResponse {
        header,
        response_code,
    }
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_expire() {
        let mut list = ReservationList::new(Duration::from_secs(60));
        let t0 = Instant::now();
        list.reserve(42, 672, 1, t0);
        assert_eq!(list.len(), 1);

        // Still live just before the deadline.
        assert!(list
            .take_by_serial(1, t0 + Duration::from_secs(59))
            .is_some());

        list.reserve(42, 672, 2, t0);
        assert!(list
            .take_by_serial(2, t0 + Duration::from_secs(61))
            .is_none());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn take_matches_serial_only_once() {
        let mut list = ReservationList::new(Duration::from_secs(60));
        let t0 = Instant::now();
        list.reserve(42, 672, 7, t0);

        let r = list.take_by_serial(7, t0).unwrap();
        assert_eq!(r.content_id, 672);
        assert_eq!(r.account_id, 42);
        assert!(list.take_by_serial(7, t0).is_none());
    }

    #[test]
    fn starting_zones_stay_in_nation() {
        for _ in 0..64 {
            assert!([0xE6, 0xE7, 0xE8].contains(&starting_zone(0).unwrap()));
            assert!([0xEA, 0xEB, 0xEC].contains(&starting_zone(1).unwrap()));
            let z = starting_zone(2).unwrap();
            assert!([0xEE, 0xF0, 0xF1].contains(&z));
            assert_ne!(z, 0xEF);
        }
        assert!(starting_zone(3).is_none());
    }
}
