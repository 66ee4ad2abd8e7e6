//! Store access for accounts, content ids, characters and world rows.
//!
//! All queries go through bind parameters; only the configured table-name
//! prefix is interpolated. The login side keeps a mirror of character data
//! that the worlds own authoritatively (synced over the bus), so inserts
//! and updates here are deliberately strict about identity.

use anyhow::Context;
use gateproto::entry::CharacterEntry;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySqlPool, Row};

use crate::config::Config;

/// Account is allowed to log in at all.
pub const ACCT_PRIV_ENABLED: u32 = 0x01;
/// Account may see and use test worlds.
pub const ACCT_PRIV_TEST_ACCESS: u32 = 0x02;

#[derive(Debug, Clone)]
pub struct CredRow {
    pub account_id: u32,
    pub password: String,
    pub salt: String,
    pub privileges: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ContentSlotRow {
    pub content_id: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct WorldRow {
    pub id: u32,
    pub name: String,
    pub mq_server: String,
    pub mq_port: u16,
    pub mq_use_ssl: bool,
    pub mq_ssl_verify: bool,
    pub mq_ssl_ca_cert: Option<String>,
    /// PKCS#12 bundle with the client certificate and key.
    pub mq_ssl_client_p12: Option<Vec<u8>>,
    pub mq_ssl_client_pass: Option<String>,
    pub mq_username: String,
    pub mq_password: String,
    pub mq_vhost: String,
    pub is_test: bool,
}

#[derive(Debug)]
pub enum UpdateError {
    /// Row exists but content id, world or name disagree with the entry.
    Mismatch,
    NoSuchContent,
    ContentTaken,
    NameTaken,
    Db(sqlx::Error),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::Mismatch => write!(f, "character identity mismatch"),
            UpdateError::NoSuchContent => write!(f, "content id does not exist"),
            UpdateError::ContentTaken => write!(f, "content id already carries a character"),
            UpdateError::NameTaken => write!(f, "character name already taken in world"),
            UpdateError::Db(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<sqlx::Error> for UpdateError {
    fn from(e: sqlx::Error) -> Self {
        UpdateError::Db(e)
    }
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: MySqlPool,
    prefix: String,
}

impl Store {
    pub async fn connect(cfg: &Config) -> anyhow::Result<Self> {
        let opts = MySqlConnectOptions::new()
            .host(&cfg.db_server)
            .port(cfg.db_port)
            .database(&cfg.db_database)
            .username(&cfg.db_username)
            .password(&cfg.db_password);
        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .context("connecting to store")?;
        Ok(Self {
            pool,
            prefix: cfg.db_prefix.clone(),
        })
    }

    fn t(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub async fn fetch_credentials(&self, username: &str) -> anyhow::Result<Option<CredRow>> {
        let q = format!(
            "SELECT `id`, `password`, `salt`, `privileges` FROM `{}` WHERE `username` = ?",
            self.t("accounts")
        );
        let row: Option<(u32, String, String, u32)> = sqlx::query_as(&q)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(account_id, password, salt, privileges)| CredRow {
            account_id,
            password,
            salt,
            privileges,
        }))
    }

    pub async fn username_taken(&self, username: &str) -> anyhow::Result<bool> {
        let q = format!(
            "SELECT COUNT(*) FROM `{}` WHERE `username` = ?",
            self.t("accounts")
        );
        let (n,): (i64,) = sqlx::query_as(&q)
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(n > 0)
    }

    /// Create an account plus its pre-allocated content id rows.
    pub async fn create_account(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
        email: Option<&str>,
        content_slots: u8,
    ) -> anyhow::Result<u32> {
        let q = format!(
            "INSERT INTO `{}` (`username`, `password`, `salt`, `email`, `privileges`) VALUES (?, ?, ?, ?, ?)",
            self.t("accounts")
        );
        let res = sqlx::query(&q)
            .bind(username)
            .bind(password_hash)
            .bind(salt)
            .bind(email)
            .bind(ACCT_PRIV_ENABLED)
            .execute(&self.pool)
            .await?;
        let account_id = res.last_insert_id() as u32;

        let q = format!(
            "INSERT INTO `{}` (`account_id`, `enabled`) VALUES (?, 1)",
            self.t("contents")
        );
        for _ in 0..content_slots {
            sqlx::query(&q).bind(account_id).execute(&self.pool).await?;
        }
        Ok(account_id)
    }

    pub async fn set_password(
        &self,
        account_id: u32,
        password_hash: &str,
        salt: &str,
    ) -> anyhow::Result<()> {
        let q = format!(
            "UPDATE `{}` SET `password` = ?, `salt` = ? WHERE `id` = ?",
            self.t("accounts")
        );
        sqlx::query(&q)
            .bind(password_hash)
            .bind(salt)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn account_entitlements(&self, account_id: u32) -> anyhow::Result<(u32, u32)> {
        let q = format!(
            "SELECT `expansions`, `features` FROM `{}` WHERE `id` = ?",
            self.t("accounts")
        );
        let row: Option<(u32, u32)> = sqlx::query_as(&q)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| anyhow::anyhow!("account {account_id} has no row"))
    }

    /// Content ids of the account in id order; slot positions in the
    /// session list follow this ordering.
    pub async fn content_slots(&self, account_id: u32) -> anyhow::Result<Vec<ContentSlotRow>> {
        let q = format!(
            "SELECT `id`, `enabled` FROM `{}` WHERE `account_id` = ? ORDER BY `id`",
            self.t("contents")
        );
        let rows: Vec<(u32, bool)> = sqlx::query_as(&q)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(content_id, enabled)| ContentSlotRow {
                content_id,
                enabled,
            })
            .collect())
    }

    fn entry_columns() -> &'static str {
        "`content_id`, `character_id`, `name`, `world_id`, `nation`, `main_job`, `main_job_lv`, \
         `zone`, `race`, `face`, `hair`, `size`, `head`, `body`, `hands`, `legs`, `feet`, \
         `main`, `sub`"
    }

    // Too many columns for sqlx's tuple FromRow limit, so rows are decoded
    // by hand. The DB keeps `nation` 1-based; 0 marks a half-created row,
    // the wire value is 0-based.
    fn decode_entry(row: &sqlx::mysql::MySqlRow) -> Result<CharacterEntry, sqlx::Error> {
        let nation_db: u8 = row.try_get("nation")?;
        Ok(CharacterEntry {
            content_id: row.try_get("content_id")?,
            enabled: true,
            character_id: row.try_get("character_id")?,
            name: row.try_get("name")?,
            world_id: row.try_get("world_id")?,
            nation: nation_db.saturating_sub(1),
            main_job: row.try_get("main_job")?,
            main_job_level: row.try_get("main_job_lv")?,
            zone: row.try_get("zone")?,
            race: row.try_get("race")?,
            face: row.try_get("face")?,
            hair: row.try_get("hair")?,
            size: row.try_get("size")?,
            head: row.try_get("head")?,
            body: row.try_get("body")?,
            hands: row.try_get("hands")?,
            legs: row.try_get("legs")?,
            feet: row.try_get("feet")?,
            main: row.try_get("main")?,
            sub: row.try_get("sub")?,
        })
    }

    pub async fn characters_by_account(
        &self,
        account_id: u32,
    ) -> anyhow::Result<Vec<CharacterEntry>> {
        let q = format!(
            "SELECT {} FROM `{}` WHERE `account_id` = ?",
            Self::entry_columns(),
            self.t("chars")
        );
        let rows = sqlx::query(&q)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::decode_entry(r).map_err(Into::into))
            .collect()
    }

    /// Purge rows stuck mid-creation (nation never committed).
    pub async fn clean_half_created(&self, account_id: u32) -> anyhow::Result<u64> {
        let q = format!(
            "DELETE FROM `{}` WHERE `account_id` = ? AND `nation` = 0",
            self.t("chars")
        );
        let res = sqlx::query(&q).bind(account_id).execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    pub async fn query_character(&self, content_id: u32) -> anyhow::Result<Option<CharacterEntry>> {
        let q = format!(
            "SELECT {} FROM `{}` WHERE `content_id` = ? LIMIT 1",
            Self::entry_columns(),
            self.t("chars")
        );
        let row = sqlx::query(&q)
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode_entry(&r).map_err(Into::into))
            .transpose()
    }

    pub async fn query_character_by_id(
        &self,
        character_id: u32,
        world_id: u16,
    ) -> anyhow::Result<Option<CharacterEntry>> {
        self.fetch_entry_by_id(character_id, world_id)
            .await
            .map_err(Into::into)
    }

    async fn fetch_entry_by_id(
        &self,
        character_id: u32,
        world_id: u16,
    ) -> Result<Option<CharacterEntry>, sqlx::Error> {
        let q = format!(
            "SELECT {} FROM `{}` WHERE `character_id` = ? AND `world_id` = ? LIMIT 1",
            Self::entry_columns(),
            self.t("chars")
        );
        let row = sqlx::query(&q)
            .bind(character_id)
            .bind(world_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode_entry(&r)).transpose()
    }

    /// Mirror an authoritative character entry.
    ///
    /// An existing row may only be refreshed in place: moving a character
    /// to a different content id or renaming it is rejected. A new row must
    /// claim a real, free content id and an unused name within its world.
    pub async fn update_character(
        &self,
        account_id: u32,
        e: &CharacterEntry,
    ) -> Result<(), UpdateError> {
        let existing = self.fetch_entry_by_id(e.character_id, e.world_id).await?;

        if let Some(row) = existing {
            if row.content_id != e.content_id || row.name != e.name {
                return Err(UpdateError::Mismatch);
            }
            let q = format!(
                "UPDATE `{}` SET `nation` = ?, `main_job` = ?, `main_job_lv` = ?, `zone` = ?, \
                 `race` = ?, `face` = ?, `hair` = ?, `size` = ?, `head` = ?, `body` = ?, \
                 `hands` = ?, `legs` = ?, `feet` = ?, `main` = ?, `sub` = ? \
                 WHERE `character_id` = ? AND `world_id` = ?",
                self.t("chars")
            );
            sqlx::query(&q)
                .bind(e.nation.saturating_add(1))
                .bind(e.main_job)
                .bind(e.main_job_level)
                .bind(e.zone)
                .bind(e.race)
                .bind(e.face)
                .bind(e.hair)
                .bind(e.size)
                .bind(e.head)
                .bind(e.body)
                .bind(e.hands)
                .bind(e.legs)
                .bind(e.feet)
                .bind(e.main)
                .bind(e.sub)
                .bind(e.character_id)
                .bind(e.world_id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let q = format!(
            "SELECT COUNT(*) FROM `{}` WHERE `id` = ?",
            self.t("contents")
        );
        let (content_exists,): (i64,) = sqlx::query_as(&q)
            .bind(e.content_id)
            .fetch_one(&self.pool)
            .await?;
        if content_exists == 0 {
            return Err(UpdateError::NoSuchContent);
        }

        let q = format!(
            "SELECT COUNT(*) FROM `{}` WHERE `content_id` = ?",
            self.t("chars")
        );
        let (content_used,): (i64,) = sqlx::query_as(&q)
            .bind(e.content_id)
            .fetch_one(&self.pool)
            .await?;
        if content_used > 0 {
            return Err(UpdateError::ContentTaken);
        }

        let q = format!(
            "SELECT COUNT(*) FROM `{}` WHERE `world_id` = ? AND `name` = ?",
            self.t("chars")
        );
        let (name_used,): (i64,) = sqlx::query_as(&q)
            .bind(e.world_id)
            .bind(&e.name)
            .fetch_one(&self.pool)
            .await?;
        if name_used > 0 {
            return Err(UpdateError::NameTaken);
        }

        let q = format!(
            "INSERT INTO `{}` (`character_id`, `content_id`, `account_id`, `world_id`, `name`, \
             `nation`, `main_job`, `main_job_lv`, `zone`, `race`, `face`, `hair`, `size`, \
             `head`, `body`, `hands`, `legs`, `feet`, `main`, `sub`) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.t("chars")
        );
        sqlx::query(&q)
            .bind(e.character_id)
            .bind(e.content_id)
            .bind(account_id)
            .bind(e.world_id)
            .bind(&e.name)
            .bind(e.nation.saturating_add(1))
            .bind(e.main_job)
            .bind(e.main_job_level)
            .bind(e.zone)
            .bind(e.race)
            .bind(e.face)
            .bind(e.hair)
            .bind(e.size)
            .bind(e.head)
            .bind(e.body)
            .bind(e.hands)
            .bind(e.legs)
            .bind(e.feet)
            .bind(e.main)
            .bind(e.sub)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_character(&self, character_id: u32) -> anyhow::Result<()> {
        let q = format!(
            "DELETE FROM `{}` WHERE `character_id` = ?",
            self.t("chars")
        );
        sqlx::query(&q)
            .bind(character_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_worlds(&self) -> anyhow::Result<Vec<WorldRow>> {
        let q = format!(
            "SELECT `id`, `name`, `mq_server_ip`, `mq_server_port`, `mq_use_ssl`, \
             `mq_ssl_verify_cert`, `mq_ssl_ca_cert`, `mq_ssl_client_cert`, `mq_ssl_client_key`, \
             `mq_username`, `mq_password`, `mq_vhost`, `is_test` \
             FROM `{}` WHERE `is_active` = 1",
            self.t("worlds")
        );
        let rows = sqlx::query(&q).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Ok(WorldRow {
                    id: r.try_get("id")?,
                    name: r.try_get("name")?,
                    mq_server: r.try_get("mq_server_ip")?,
                    mq_port: r.try_get("mq_server_port")?,
                    mq_use_ssl: r.try_get("mq_use_ssl")?,
                    mq_ssl_verify: r.try_get("mq_ssl_verify_cert")?,
                    mq_ssl_ca_cert: r.try_get("mq_ssl_ca_cert")?,
                    mq_ssl_client_p12: r.try_get("mq_ssl_client_cert")?,
                    mq_ssl_client_pass: r.try_get("mq_ssl_client_key")?,
                    mq_username: r.try_get("mq_username")?,
                    mq_password: r.try_get("mq_password")?,
                    mq_vhost: r.try_get("mq_vhost")?,
                    is_test: r.try_get("is_test")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }
}
