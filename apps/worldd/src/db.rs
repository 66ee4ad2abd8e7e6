//! World-side store access.
//!
//! The world only keeps the per-world serial (low 16 bits) of a character
//! id; the world id prefix is implied by whose database this is.

use anyhow::Context;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySqlPool, Row};

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct WorldStore {
    pool: MySqlPool,
    prefix: String,
}

/// Fields the world persists at creation time; the rest of a character
/// row accretes during play.
#[derive(Debug, Clone)]
pub struct NewCharacter {
    pub serial: u16,
    pub content_id: u32,
    pub account_id: u32,
    pub name: String,
    pub zone: u16,
    pub nation: u8,
    pub race: u8,
    pub face: u8,
    pub hair: u8,
    pub size: u8,
    pub main_job: u8,
}

impl WorldStore {
    pub async fn connect(cfg: &Config) -> anyhow::Result<Self> {
        let opts = MySqlConnectOptions::new()
            .host(&cfg.db_server)
            .port(cfg.db_port)
            .database(&cfg.db_database)
            .username(&cfg.db_username)
            .password(&cfg.db_password);
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .context("connecting to world store")?;
        Ok(Self {
            pool,
            prefix: cfg.db_prefix.clone(),
        })
    }

    fn t(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub async fn content_or_char_exists(
        &self,
        content_id: u32,
        serial: u16,
    ) -> anyhow::Result<bool> {
        let q = format!(
            "SELECT COUNT(*) FROM `{}` WHERE `contentid` = ? OR `charid` = ?",
            self.t("chars")
        );
        let (n,): (i64,) = sqlx::query_as(&q)
            .bind(content_id)
            .bind(serial)
            .fetch_one(&self.pool)
            .await?;
        Ok(n > 0)
    }

    pub async fn char_exists(&self, serial: u16) -> anyhow::Result<bool> {
        let q = format!(
            "SELECT COUNT(*) FROM `{}` WHERE `charid` = ?",
            self.t("chars")
        );
        let (n,): (i64,) = sqlx::query_as(&q)
            .bind(serial)
            .fetch_one(&self.pool)
            .await?;
        Ok(n > 0)
    }

    pub async fn max_serial(&self) -> anyhow::Result<u16> {
        let q = format!("SELECT MAX(`charid`) FROM `{}`", self.t("chars"));
        let (max,): (Option<u16>,) = sqlx::query_as(&q).fetch_one(&self.pool).await?;
        Ok(max.unwrap_or(0))
    }

    /// Character row plus the appearance and stats rows, in one shot.
    pub async fn insert_character(&self, c: &NewCharacter) -> anyhow::Result<()> {
        let q = format!(
            "INSERT INTO `{}` (`charid`, `contentid`, `acctid`, `charname`, `pos_zone`, `nation`) \
             VALUES (?, ?, ?, ?, ?, ?)",
            self.t("chars")
        );
        sqlx::query(&q)
            .bind(c.serial)
            .bind(c.content_id)
            .bind(c.account_id)
            .bind(&c.name)
            .bind(c.zone)
            .bind(c.nation)
            .execute(&self.pool)
            .await?;

        let q = format!(
            "INSERT INTO `{}` (`charid`, `face`, `race`, `size`, `hair`) VALUES (?, ?, ?, ?, ?)",
            self.t("char_look")
        );
        sqlx::query(&q)
            .bind(c.serial)
            .bind(c.face)
            .bind(c.race)
            .bind(c.size)
            .bind(c.hair)
            .execute(&self.pool)
            .await?;

        let q = format!(
            "INSERT INTO `{}` (`charid`, `mjob`, `mlvl`) VALUES (?, ?, 1)",
            self.t("char_stats")
        );
        sqlx::query(&q)
            .bind(c.serial)
            .bind(c.main_job)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_character(&self, serial: u16) -> anyhow::Result<()> {
        for table in ["char_stats", "char_look", "chars"] {
            let q = format!("DELETE FROM `{}` WHERE `charid` = ?", self.t(table));
            sqlx::query(&q).bind(serial).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Full character rows for sync-to-login, joined with look and stats.
    /// Pass `None` to read every character this world has.
    pub async fn characters_for_sync(
        &self,
        account_id: Option<u32>,
    ) -> anyhow::Result<Vec<SyncCharacter>> {
        let filter = if account_id.is_some() {
            " WHERE c.`acctid` = ?"
        } else {
            ""
        };
        let q = format!(
            "SELECT c.`charid`, c.`contentid`, c.`acctid`, c.`charname`, c.`pos_zone`, \
             c.`nation`, l.`race`, l.`face`, l.`hair`, l.`size`, \
             l.`head`, l.`body`, l.`hands`, l.`legs`, l.`feet`, l.`main`, l.`sub`, \
             s.`mjob`, s.`mlvl` \
             FROM `{}` c \
             JOIN `{}` l ON l.`charid` = c.`charid` \
             JOIN `{}` s ON s.`charid` = c.`charid`{}",
            self.t("chars"),
            self.t("char_look"),
            self.t("char_stats"),
            filter,
        );
        let mut query = sqlx::query(&q);
        if let Some(id) = account_id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Ok(SyncCharacter {
                    serial: r.try_get("charid")?,
                    content_id: r.try_get("contentid")?,
                    account_id: r.try_get("acctid")?,
                    name: r.try_get("charname")?,
                    zone: r.try_get("pos_zone")?,
                    nation: r.try_get("nation")?,
                    race: r.try_get("race")?,
                    face: r.try_get("face")?,
                    hair: r.try_get("hair")?,
                    size: r.try_get("size")?,
                    head: r.try_get("head")?,
                    body: r.try_get("body")?,
                    hands: r.try_get("hands")?,
                    legs: r.try_get("legs")?,
                    feet: r.try_get("feet")?,
                    main: r.try_get("main")?,
                    sub: r.try_get("sub")?,
                    main_job: r.try_get("mjob")?,
                    main_job_level: r.try_get("mlvl")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }
}

/// Everything a `CHAR_UPDATE` message carries, as this world stores it.
#[derive(Debug, Clone)]
pub struct SyncCharacter {
    pub serial: u16,
    pub content_id: u32,
    pub account_id: u32,
    pub name: String,
    pub zone: u16,
    pub nation: u8,
    pub race: u8,
    pub face: u8,
    pub hair: u8,
    pub size: u8,
    pub head: u16,
    pub body: u16,
    pub hands: u16,
    pub legs: u16,
    pub feet: u16,
    pub main: u16,
    pub sub: u16,
    pub main_job: u8,
    pub main_job_level: u8,
}
