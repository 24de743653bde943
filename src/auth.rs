//! API-key authentication port and its sqlite-backed implementation.
//!
//! Keys are never stored: the table holds only a SHA-256 digest, and
//! verification hashes the presented key before lookup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthInfo {
    pub user_id: String,
    pub broker_name: String,
}

/// Port the proxy and REST surface consume; maps an API key to the
/// authenticated user and the broker that user trades through.
#[async_trait]
pub trait AuthPort: Send + Sync {
    async fn verify(&self, api_key: &str) -> Result<AuthInfo, AuthError>;
}

fn key_digest(api_key: &str) -> String {
    format!("{:x}", Sha256::digest(api_key.as_bytes()))
}

/// API keys stored in sqlite alongside the rest of the gateway state.
pub struct ApiKeyStore {
    db_path: String,
}

impl ApiKeyStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                key_hash TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                broker_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_used TEXT,
                revoked INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(())
    }

    /// Issue a key for (user, broker). Returns the raw key, the only time
    /// it exists outside the caller's hands.
    pub fn issue(&self, user_id: &str, broker_name: &str) -> Result<String> {
        let key = Uuid::new_v4().simple().to_string();
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO api_keys (id, key_hash, user_id, broker_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                key_digest(&key),
                user_id,
                broker_name,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(key)
    }

    pub fn revoke(&self, api_key: &str) -> Result<bool> {
        let conn = Connection::open(&self.db_path)?;
        let n = conn.execute(
            "UPDATE api_keys SET revoked = 1 WHERE key_hash = ?1",
            params![key_digest(api_key)],
        )?;
        Ok(n > 0)
    }

    /// Development seed: ensure a well-known key exists so the gateway is
    /// drivable on a fresh database.
    pub fn seed_dev_key(&self, api_key: &str, user_id: &str, broker_name: &str) -> Result<()> {
        let digest = key_digest(api_key);
        let conn = Connection::open(&self.db_path)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM api_keys WHERE key_hash = ?1",
                params![&digest],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO api_keys (id, key_hash, user_id, broker_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                &digest,
                user_id,
                broker_name,
                Utc::now().to_rfc3339(),
            ],
        )?;
        info!(user = user_id, broker = broker_name, "seeded development API key");
        Ok(())
    }

    fn lookup(&self, api_key: &str) -> Result<Option<AuthInfo>> {
        let digest = key_digest(api_key);
        let conn = Connection::open(&self.db_path).context("open auth db")?;
        let row: Option<AuthInfo> = conn
            .query_row(
                "SELECT user_id, broker_name FROM api_keys
                 WHERE key_hash = ?1 AND revoked = 0",
                params![&digest],
                |row| {
                    Ok(AuthInfo {
                        user_id: row.get(0)?,
                        broker_name: row.get(1)?,
                    })
                },
            )
            .optional()?;

        if row.is_some() {
            conn.execute(
                "UPDATE api_keys SET last_used = ?1 WHERE key_hash = ?2",
                params![Utc::now().to_rfc3339(), &digest],
            )
            .ok();
        }
        Ok(row)
    }
}

#[async_trait]
impl AuthPort for ApiKeyStore {
    async fn verify(&self, api_key: &str) -> Result<AuthInfo, AuthError> {
        if api_key.trim().is_empty() {
            return Err(AuthError::InvalidApiKey);
        }
        match self.lookup(api_key) {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(AuthError::InvalidApiKey),
            Err(e) => Err(AuthError::Other(e.to_string())),
        }
    }
}
