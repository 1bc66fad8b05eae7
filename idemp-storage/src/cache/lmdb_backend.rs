//! LMDB-backed shared tier.
//!
//! Uses heed to keep records in a memory-mapped store that several processes
//! on one host can open at once. Each value is laid out as
//! `[expiry millis: 8 bytes LE][json]`; reads treat a value whose expiry has
//! passed as absent.
//!
//! `save_if_absent` runs its check and write inside a single write
//! transaction, so it is atomic across every process sharing the environment.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use idemp_core::{IdempotencyError, IdempotencyResult, Timestamp};
use serde::{de::DeserializeOwned, Serialize};

use super::traits::SharedTier;

const EXPIRY_HEADER_LEN: usize = 8;

/// Error type for LMDB tier operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbTierError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Corrupt value for key {key}")]
    Corrupt { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbTierError> for IdempotencyError {
    fn from(e: LmdbTierError) -> Self {
        IdempotencyError::backend("lmdb", e.to_string())
    }
}

fn txn_err(e: heed::Error) -> LmdbTierError {
    LmdbTierError::Transaction(e.to_string())
}

/// Shared tier stored in an LMDB environment.
pub struct LmdbSharedTier {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbSharedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbSharedTier")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbSharedTier {
    /// Open (or create) the store under `path`, capped at `max_size_mb`.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbTierError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbTierError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbTierError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.as_ref().display(), "Opened LMDB shared tier");
        Ok(Self { env, db })
    }

    /// Drop expired values. Returns how many were dropped.
    pub fn purge_expired(&self) -> IdempotencyResult<usize> {
        let now = Utc::now();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let mut expired = Vec::new();
        for item in self.db.iter(&wtxn).map_err(txn_err)? {
            let (key, bytes) = item.map_err(txn_err)?;
            let live = decode_expiry(bytes).is_some_and(|expiry| now < expiry);
            if !live {
                expired.push(key.to_vec());
            }
        }

        for key in &expired {
            self.db.delete(&mut wtxn, key).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(expired.len())
    }

    /// Read the live payload bytes for `key`.
    fn read_live(&self, key: &str) -> Result<Option<Vec<u8>>, LmdbTierError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let Some(bytes) = self.db.get(&rtxn, key.as_bytes()).map_err(txn_err)? else {
            return Ok(None);
        };
        let expiry = decode_expiry(bytes).ok_or_else(|| LmdbTierError::Corrupt {
            key: key.to_string(),
        })?;
        if Utc::now() >= expiry {
            return Ok(None);
        }
        Ok(Some(bytes[EXPIRY_HEADER_LEN..].to_vec()))
    }
}

fn encode<T: Serialize + ?Sized>(value: &T, expiry: Timestamp) -> IdempotencyResult<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut bytes = Vec::with_capacity(EXPIRY_HEADER_LEN + json.len());
    bytes.extend_from_slice(&expiry.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

fn decode_expiry(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let header: [u8; EXPIRY_HEADER_LEN] = bytes.get(..EXPIRY_HEADER_LEN)?.try_into().ok()?;
    DateTime::from_timestamp_millis(i64::from_le_bytes(header))
}

fn require_key(key: &str) -> IdempotencyResult<()> {
    if key.is_empty() {
        return Err(IdempotencyError::invalid_argument(
            "key",
            "idempotency key must not be empty",
        ));
    }
    Ok(())
}

#[async_trait]
impl SharedTier for LmdbSharedTier {
    fn name(&self) -> &str {
        "lmdb"
    }

    async fn contains(&self, key: &str) -> IdempotencyResult<bool> {
        Ok(self.read_live(key)?.is_some())
    }

    async fn get<T>(&self, key: &str) -> IdempotencyResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.read_live(key)? {
            Some(json) => Ok(Some(serde_json::from_slice(&json)?)),
            None => Ok(None),
        }
    }

    async fn save<T>(&self, key: &str, value: &T, expiry: Timestamp) -> IdempotencyResult<()>
    where
        T: Serialize + Sync,
    {
        require_key(key)?;
        let bytes = encode(value, expiry)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn save_if_absent<T>(
        &self,
        key: &str,
        value: &T,
        expiry: Timestamp,
    ) -> IdempotencyResult<bool>
    where
        T: Serialize + Sync,
    {
        require_key(key)?;
        let bytes = encode(value, expiry)?;
        let now = Utc::now();

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let occupied = self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(txn_err)?
            .and_then(decode_expiry)
            .is_some_and(|existing| now < existing);
        if occupied {
            wtxn.abort();
            return Ok(false);
        }

        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> IdempotencyResult<()> {
        require_key(key)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn is_healthy(&self) -> IdempotencyResult<bool> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.db.len(&rtxn).map_err(txn_err)?;
        Ok(true)
    }
}
