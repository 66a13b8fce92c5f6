//! Durable, encrypted local persistence for sessions, answers, coupons,
//! biometric templates and the upload queue.
//!
//! SQLite in WAL mode behind a `Mutex<Connection>`; multi-field mutations
//! (answer write + index advance, coupon check-then-issue) run inside a
//! single transaction, so a crash never leaves a session in an
//! inconsistent state. Storage errors are the only class that aborts a
//! session outright; partial state stays on disk for manual recovery.

pub mod crypto;
pub mod queue;
pub mod schema;
pub mod sessions;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, info};

pub use crypto::StoreCrypto;
pub use queue::{UploadRecord, UploadStatus};
pub use sessions::{
    AnswerRow, AnswerValue, ConfirmedBy, PaymentRecord, SessionRecord, SessionState, TestResult,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Encrypted session database, one per device.
pub struct SessionDb {
    conn: Mutex<Connection>,
    crypto: StoreCrypto,
}

impl SessionDb {
    /// Open or create the database under `data_dir`, deriving the store key
    /// from the device passphrase and the persisted salt.
    pub fn open(data_dir: &Path, passphrase: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("tracelink.db");
        info!("Opening session store at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        Self::init(conn, passphrase)
    }

    /// In-memory database for tests.
    pub fn open_in_memory(passphrase: &str) -> Result<Self, StoreError> {
        debug!("Opening in-memory session store");
        let conn = Connection::open_in_memory()?;
        Self::init(conn, passphrase)
    }

    fn init(conn: Connection, passphrase: &str) -> Result<Self, StoreError> {
        // WAL for concurrent reads while a transaction commits.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::init_schema(&conn)?;

        let salt = load_or_create_salt(&conn)?;
        let crypto = StoreCrypto::derive(passphrase, &salt)?;

        Ok(Self {
            conn: Mutex::new(conn),
            crypto,
        })
    }

    pub(crate) fn crypto(&self) -> &StoreCrypto {
        &self.crypto
    }

    /// Run a read against the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Run a write with exclusive access (transactions start here).
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("lock poisoned: {e}")))?;
        f(&mut conn)
    }
}

fn load_or_create_salt(conn: &Connection) -> Result<Vec<u8>, StoreError> {
    let existing: Option<Vec<u8>> = conn
        .query_row("SELECT value FROM meta WHERE key = 'kdf_salt'", [], |row| {
            row.get(0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some(salt) => Ok(salt),
        None => {
            let salt = crypto::generate_salt();
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('kdf_salt', ?1)",
                [salt.as_slice()],
            )?;
            Ok(salt.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema_and_salt() {
        let dir = TempDir::new().unwrap();
        let db = SessionDb::open(dir.path(), "pass").unwrap();

        let tables: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN \
                     ('sessions','answers','coupons','templates','upload_queue')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_salt_is_stable_across_reopens() {
        let dir = TempDir::new().unwrap();
        {
            let db = SessionDb::open(dir.path(), "pass").unwrap();
            let sealed = db.crypto().seal(b"hello").unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('probe', ?1)",
                    [sealed.as_slice()],
                )?;
                Ok(())
            })
            .unwrap();
        }

        // Same passphrase after reopen decrypts data sealed before.
        let db = SessionDb::open(dir.path(), "pass").unwrap();
        let sealed: Vec<u8> = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT value FROM meta WHERE key = 'probe'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(db.crypto().open(&sealed).unwrap(), b"hello");
    }
}
