//! Encrypted key/value records backed by SQLite.
//!
//! One `RecordStore` owns one table; the relay opens two of them (tokens and
//! sessions) over the same derived key. Every value is sealed with AES-256-GCM
//! and the record key is bound in as associated data.

use super::encryption::{self, CryptoError, DerivedKey};
use crate::config::{ConfigError, StorageConfig};
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Record store errors. None of these are retried except lock contention
/// inside [`RecordStore::put`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open record store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create directory for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("write to '{table}' failed after {attempts} attempts: database is locked")]
    Contention { table: String, attempts: u32 },
    /// The record exists but does not authenticate. Never treated as absent.
    #[error("record in '{table}' failed to decrypt: {source}")]
    Decryption {
        table: String,
        key: String,
        #[source]
        source: CryptoError,
    },
    #[error("failed to encrypt record for '{table}': {source}")]
    Encryption {
        table: String,
        #[source]
        source: CryptoError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("record store connection lock poisoned")]
    Poisoned,
}

impl StorageError {
    fn query(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StorageError::Query { context, source }
    }
}

/// Encrypted record table.
///
/// # Schema
/// ```sql
/// CREATE TABLE <table> (
///     key        TEXT PRIMARY KEY,
///     value      TEXT NOT NULL,     -- AES-256-GCM ciphertext (base64)
///     nonce      TEXT NOT NULL,     -- unique per write (base64)
///     tag        TEXT NOT NULL,     -- record type, e.g. "token" / "uuid"
///     created_at INTEGER NOT NULL   -- unix seconds of last write
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex and shared by all callers
/// - WAL journaling lets other processes read while one writes
/// - Writes that hit a lock held by another connection are retried with
///   exponential backoff, then fail with `StorageError::Contention`
pub struct RecordStore {
    conn: Mutex<Connection>,
    table: String,
    key: DerivedKey,
    max_write_attempts: u32,
    initial_backoff: Duration,
}

impl RecordStore {
    /// Opens (or creates) the database at `db_path` and ensures `table` exists.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        table: &str,
        key: DerivedKey,
        config: &StorageConfig,
    ) -> Result<Self, StorageError> {
        validate_table_name(table)?;

        let db_path = db_path.as_ref();
        let display_path = db_path.display().to_string();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                    path: display_path.clone(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|source| StorageError::Open {
            path: display_path.clone(),
            source,
        })?;

        conn.busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .map_err(StorageError::query("failed to set busy timeout"))?;

        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(StorageError::query("failed to enable WAL journal"))?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                nonce      TEXT NOT NULL,
                tag        TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_tag ON {table}(tag);",
        ))
        .map_err(StorageError::query("failed to create record table"))?;

        debug!(path = %display_path, table, journal_mode = %journal_mode, "Record store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            key,
            max_write_attempts: config.max_write_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Encrypts `plaintext` and upserts it under `key` (last write wins).
    pub fn put(&self, key: &str, plaintext: &str, tag: &str) -> Result<(), StorageError> {
        let (value, nonce) =
            encryption::encrypt(plaintext, &self.key, key.as_bytes()).map_err(|source| {
                StorageError::Encryption {
                    table: self.table.clone(),
                    source,
                }
            })?;
        let now = Utc::now().timestamp();

        let sql = format!(
            "INSERT INTO {} (key, value, nonce, tag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 nonce = excluded.nonce,
                 tag = excluded.tag,
                 created_at = excluded.created_at",
            self.table
        );

        let mut backoff = self.initial_backoff;
        for attempt in 1..=self.max_write_attempts {
            // Guard is released at the end of this statement, before any sleep
            let result = self
                .conn()?
                .execute(&sql, params![key, value, nonce, tag, now]);

            match result {
                Ok(_) => {
                    debug!(table = %self.table, tag, attempt, "Record stored");
                    return Ok(());
                }
                Err(e) if is_contention(&e) => {
                    if attempt == self.max_write_attempts {
                        break;
                    }
                    warn!(
                        table = %self.table,
                        attempt,
                        max_attempts = self.max_write_attempts,
                        "Record store locked, retrying in {:?}",
                        backoff
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(source) => {
                    return Err(StorageError::Query {
                        context: "failed to store record",
                        source,
                    })
                }
            }
        }

        error!(
            table = %self.table,
            attempts = self.max_write_attempts,
            "Record store write failed after retries"
        );
        Err(StorageError::Contention {
            table: self.table.clone(),
            attempts: self.max_write_attempts,
        })
    }

    /// Looks up and decrypts `key`.
    ///
    /// Returns `Ok(None)` when the key does not exist and
    /// `Err(StorageError::Decryption)` when it exists but fails to open.
    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.get_with_timestamp(key)?.map(|(plaintext, _)| plaintext))
    }

    /// Like [`get`](Self::get), also returning the unix time of the last write.
    pub fn get_with_timestamp(&self, key: &str) -> Result<Option<(String, i64)>, StorageError> {
        let row: Option<(String, String, i64)> = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT value, nonce, created_at FROM {} WHERE key = ?1",
                    self.table
                ),
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(StorageError::query("failed to read record"))?;

        row.map(|(value, nonce, created_at)| {
            self.open_record(key, &value, &nonce)
                .map(|plaintext| (plaintext, created_at))
        })
        .transpose()
    }

    /// Returns every decrypted record carrying `tag`, keyed by record key.
    ///
    /// A single record that fails to decrypt fails the whole listing.
    pub fn list_by_tag(&self, tag: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let rows: Vec<(String, String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT key, value, nonce FROM {} WHERE tag = ?1 ORDER BY key",
                    self.table
                ))
                .map_err(StorageError::query("failed to prepare listing"))?;

            let rows = stmt
                .query_map(params![tag], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(StorageError::query("failed to list records"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StorageError::query("failed to read records"))?;
            rows
        };

        rows.into_iter()
            .map(|(key, value, nonce)| {
                let plaintext = self.open_record(&key, &value, &nonce)?;
                Ok((key, plaintext))
            })
            .collect()
    }

    /// Deletes `key`. Returns whether a record was removed; an absent key is
    /// not an error.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let rows_affected = self
            .conn()?
            .execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.table),
                params![key],
            )
            .map_err(StorageError::query("failed to delete record"))?;

        Ok(rows_affected > 0)
    }

    /// Deletes every record last written before `cutoff` (unix seconds).
    pub fn delete_created_before(&self, cutoff: i64) -> Result<usize, StorageError> {
        self.conn()?
            .execute(
                &format!("DELETE FROM {} WHERE created_at < ?1", self.table),
                params![cutoff],
            )
            .map_err(StorageError::query("failed to delete stale records"))
    }

    /// Number of records in the table.
    pub fn count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn()?
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })
            .map_err(StorageError::query("failed to count records"))?;

        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn open_record(&self, key: &str, value: &str, nonce: &str) -> Result<String, StorageError> {
        encryption::decrypt(value, nonce, &self.key, key.as_bytes()).map_err(|source| {
            error!(table = %self.table, "Stored record failed authentication");
            StorageError::Decryption {
                table: self.table.clone(),
                key: key.to_string(),
                source,
            }
        })
    }
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table_name(table: &str) -> Result<(), ConfigError> {
    let mut chars = table.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_lowercase() || first == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTableName(table.to_string()))
    }
}
