use rusqlite::{params, Connection, OptionalExtension};

use super::StoreError;

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contents (
    hash       TEXT PRIMARY KEY,
    size       INTEGER NOT NULL,
    bytes      BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS asts (
    content_hash   TEXT NOT NULL,
    parser_version INTEGER NOT NULL,
    kind           TEXT NOT NULL,
    document       TEXT NOT NULL,
    diagnostics    INTEGER NOT NULL,
    created_at     INTEGER NOT NULL,
    PRIMARY KEY (content_hash, parser_version)
);

CREATE TABLE IF NOT EXISTS symbols (
    content_hash   TEXT NOT NULL,
    parser_version INTEGER NOT NULL,
    name           TEXT NOT NULL,
    kind           TEXT NOT NULL,
    line           INTEGER NOT NULL,
    col            INTEGER NOT NULL,
    PRIMARY KEY (content_hash, parser_version, name, kind)
);
CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);

CREATE TABLE IF NOT EXISTS refs (
    content_hash   TEXT NOT NULL,
    parser_version INTEGER NOT NULL,
    name           TEXT NOT NULL,
    kind           TEXT NOT NULL,
    line           INTEGER NOT NULL,
    col            INTEGER NOT NULL,
    count          INTEGER NOT NULL,
    PRIMARY KEY (content_hash, parser_version, name, kind)
);
CREATE INDEX IF NOT EXISTS idx_refs_name ON refs(name);

CREATE TABLE IF NOT EXISTS files (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    root_id       TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    path          TEXT NOT NULL,
    mtime_ns      INTEGER NOT NULL,
    size          INTEGER NOT NULL,
    content_hash  TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    created_at    INTEGER NOT NULL,
    UNIQUE (path, mtime_ns, size, content_hash)
);
CREATE INDEX IF NOT EXISTS idx_files_path ON files(path, active);
CREATE INDEX IF NOT EXISTS idx_files_root ON files(root_id, relative_path);
CREATE INDEX IF NOT EXISTS idx_files_hash ON files(content_hash);

CREATE TABLE IF NOT EXISTS queue_items (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id     INTEGER NOT NULL REFERENCES files(id),
    envelope    TEXT NOT NULL,
    priority    INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    status      TEXT NOT NULL,
    error       TEXT,
    claimed_by  TEXT,
    created_at  INTEGER NOT NULL,
    claimed_at  INTEGER,
    finished_at INTEGER,
    UNIQUE (file_id, envelope, fingerprint)
);
CREATE INDEX IF NOT EXISTS idx_queue_claim ON queue_items(status, priority DESC, id);
"#;

/// Create every table and stamp the schema version. Idempotent.
pub(crate) fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    match read_version(conn)? {
        Some(found) if found > SCHEMA_VERSION => Err(StoreError::SchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        }),
        Some(_) => Ok(()),
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
            tracing::info!(version = SCHEMA_VERSION, "initialized store schema");
            Ok(())
        }
    }
}

/// Readers never create tables; they only confirm the writer already has.
pub(crate) fn check(conn: &Connection) -> Result<(), StoreError> {
    match read_version(conn)? {
        Some(found) if found > SCHEMA_VERSION => Err(StoreError::SchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        }),
        Some(_) => Ok(()),
        None => Err(StoreError::NotInitialized),
    }
}

fn read_version(conn: &Connection) -> Result<Option<u32>, StoreError> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meta')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(None);
    }
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| StoreError::Corrupt(format!("schema_version `{v}`")))
        })
        .transpose()
}
