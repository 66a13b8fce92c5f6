//! Database schema for the session store.

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new session store schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating session store schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        [version],
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(TABLES_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

fn migrate_schema(conn: &Connection, _from_version: i32) -> Result<(), StoreError> {
    // Migration steps land here as the schema evolves.
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

const TABLES_SCHEMA: &str = r#"
-- Key/value metadata: key-derivation salt, device bookkeeping
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
);

-- One row per interview session. The session id is client-generated and
-- globally unique; it is also the server-side idempotency key.
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    subject_id TEXT NOT NULL,
    referral_coupon TEXT,
    survey_version INTEGER NOT NULL,
    language TEXT NOT NULL,
    state TEXT NOT NULL,
    question_index INTEGER NOT NULL DEFAULT 0,
    eligible INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Answer values are encrypted at rest (nonce || ciphertext of the
-- serialized typed value). seq is the monotonically increasing capture
-- position within the session.
CREATE TABLE IF NOT EXISTS answers (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    short_name TEXT NOT NULL,
    seq INTEGER NOT NULL,
    answer_type TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (session_id, short_name)
);

CREATE TABLE IF NOT EXISTS test_results (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    test_id TEXT NOT NULL,
    result TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (session_id, test_id)
);

-- The confirming identity is either 'participant' or 'admin'; admin
-- confirmations record the administrator's name.
CREATE TABLE IF NOT EXISTS payments (
    session_id TEXT PRIMARY KEY NOT NULL REFERENCES sessions(id),
    confirmed_role TEXT NOT NULL,
    confirmed_by TEXT,
    confirmed_at INTEGER NOT NULL
);

-- Coupon ledger. Status transitions are one-way:
-- UNUSED -> ISSUED -> USED.
CREATE TABLE IF NOT EXISTS coupons (
    code TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL DEFAULT 'UNUSED',
    issued_to_session TEXT,
    issued_at INTEGER,
    used_by_session TEXT,
    used_at INTEGER
);

-- Biometric templates never leave this table (and this device).
CREATE TABLE IF NOT EXISTS templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'participant',
    template BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

-- Completed-session upload queue.
CREATE TABLE IF NOT EXISTS upload_queue (
    session_id TEXT PRIMARY KEY NOT NULL REFERENCES sessions(id),
    status TEXT NOT NULL DEFAULT 'PENDING',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_answers_session ON answers(session_id, seq);
CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
CREATE INDEX IF NOT EXISTS idx_coupons_status ON coupons(status);
CREATE INDEX IF NOT EXISTS idx_templates_created ON templates(created_at);
CREATE INDEX IF NOT EXISTS idx_upload_status ON upload_queue(status, next_attempt_at);
"#;
