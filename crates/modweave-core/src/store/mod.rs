//! Content-addressed store and AST cache.
//!
//! One SQLite file in WAL mode. [`Store`] is a read-only handle that any
//! number of processes may hold. [`StoreWriter`] can only be built from a
//! held [`WriterLock`] and owns every mutation.

mod queue;
mod schema;

pub use queue::{EnqueueOutcome, QueueCounts};
pub use schema::SCHEMA_VERSION;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use script_engine::{ParsedDocument, Reference, ReferenceKind, Symbol, SymbolKind};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::hash::ContentHash;
use crate::lock::WriterLock;
use crate::model::{millis_to_datetime, FileRecord, Fingerprint};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const FILE_COLUMNS: &str =
    "id, root_id, relative_path, path, mtime_ns, size, content_hash, active, created_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {0} does not exist; start the worker or run `modweave init` first")]
    Missing(PathBuf),

    #[error("store has no schema yet")]
    NotInitialized,

    #[error("store schema version {found} is newer than this build supports ({supported})")]
    SchemaVersion { found: u32, supported: u32 },

    #[error("attempted to write through a read-only store handle")]
    ReadOnly,

    #[error(
        "identity violation for {path}: recorded content {recorded} but found {observed} \
         with the same modification time and size"
    )]
    IdentityViolation {
        path: PathBuf,
        recorded: ContentHash,
        observed: ContentHash,
    },

    #[error("cached AST for {content_hash} (parser v{parser_version}) is unreadable: {source}")]
    CorruptAst {
        content_hash: ContentHash,
        parser_version: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt store row: {0}")]
    Corrupt(String),

    #[error("failed to encode document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ReadOnly) => StoreError::ReadOnly,
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Outcome of recording a file version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// The active version already has this fingerprint.
    Unchanged(FileRecord),
    /// A new version became active, superseding `superseded` if there was one.
    New {
        record: FileRecord,
        superseded: Option<i64>,
    },
}

impl Recorded {
    pub fn record(&self) -> &FileRecord {
        match self {
            Recorded::Unchanged(record) | Recorded::New { record, .. } => record,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Recorded::New { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub contents: usize,
    pub asts: usize,
    pub symbols: usize,
    pub references: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub active_files: u64,
    pub contents: u64,
    pub content_bytes: u64,
    pub asts: u64,
    pub symbols: u64,
    pub references: u64,
}

/// Where a symbol is defined, joined through active files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolLocation {
    pub root_id: String,
    pub relative_path: String,
    pub content_hash: ContentHash,
    pub kind: SymbolKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceLocation {
    pub root_id: String,
    pub relative_path: String,
    pub content_hash: ContentHash,
    pub kind: ReferenceKind,
    pub line: u32,
    pub column: u32,
    pub count: u32,
}

// ──────────────────────────────────────────────────────────────
// Read-only handle
// ──────────────────────────────────────────────────────────────

/// Query-only view of a store.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open an existing store read-only. Any write through this handle fails
    /// with [`StoreError::ReadOnly`].
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::Missing(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::check(&conn)?;
        debug!(path = %path.display(), "opened store read-only");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_content(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        let conn = self.conn();
        let found = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM contents WHERE hash = ?1)",
            params![hash.as_str()],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    pub fn get_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn();
        let bytes = conn
            .query_row(
                "SELECT bytes FROM contents WHERE hash = ?1",
                params![hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }

    pub fn has_ast(&self, hash: &ContentHash, parser_version: u32) -> Result<bool, StoreError> {
        let conn = self.conn();
        let found = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM asts WHERE content_hash = ?1 AND parser_version = ?2)",
            params![hash.as_str(), parser_version],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// The tree cached for exactly this parser version. A tree from any
    /// other version is never returned.
    pub fn get_ast(
        &self,
        hash: &ContentHash,
        parser_version: u32,
    ) -> Result<Option<ParsedDocument>, StoreError> {
        let json: Option<String> = {
            let conn = self.conn();
            conn.query_row(
                "SELECT document FROM asts WHERE content_hash = ?1 AND parser_version = ?2",
                params![hash.as_str(), parser_version],
                |row| row.get(0),
            )
            .optional()?
        };
        json.map(|json| {
            serde_json::from_str(&json).map_err(|source| StoreError::CorruptAst {
                content_hash: hash.clone(),
                parser_version,
                source,
            })
        })
        .transpose()
    }

    pub fn symbols_for(
        &self,
        hash: &ContentHash,
        parser_version: u32,
    ) -> Result<Vec<Symbol>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT name, kind, line, col FROM symbols
             WHERE content_hash = ?1 AND parser_version = ?2
             ORDER BY kind, name",
        )?;
        let rows = stmt.query_map(params![hash.as_str(), parser_version], |row| {
            Ok(Symbol {
                name: row.get(0)?,
                kind: parse_column(row, 1)?,
                line: row.get(2)?,
                column: row.get(3)?,
            })
        })?;
        let mut symbols: Vec<Symbol> = rows.collect::<Result<_, _>>()?;
        // Text order of the kind column differs from enum order.
        symbols.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
        Ok(symbols)
    }

    pub fn references_for(
        &self,
        hash: &ContentHash,
        parser_version: u32,
    ) -> Result<Vec<Reference>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT name, kind, line, col, count FROM refs
             WHERE content_hash = ?1 AND parser_version = ?2",
        )?;
        let rows = stmt.query_map(params![hash.as_str(), parser_version], |row| {
            Ok(Reference {
                name: row.get(0)?,
                kind: parse_column(row, 1)?,
                line: row.get(2)?,
                column: row.get(3)?,
                count: row.get(4)?,
            })
        })?;
        let mut references: Vec<Reference> = rows.collect::<Result<_, _>>()?;
        references.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
        Ok(references)
    }

    /// Every active file whose content defines `name`.
    pub fn symbol_locations(
        &self,
        name: &str,
        parser_version: u32,
    ) -> Result<Vec<SymbolLocation>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT f.root_id, f.relative_path, s.content_hash, s.kind, s.line, s.col
             FROM symbols s JOIN files f ON f.content_hash = s.content_hash AND f.active = 1
             WHERE s.name = ?1 AND s.parser_version = ?2
             ORDER BY f.root_id, f.relative_path",
        )?;
        let rows = stmt.query_map(params![name, parser_version], |row| {
            Ok(SymbolLocation {
                root_id: row.get(0)?,
                relative_path: row.get(1)?,
                content_hash: ContentHash::from_hex(row.get::<_, String>(2)?),
                kind: parse_column(row, 3)?,
                line: row.get(4)?,
                column: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every active file whose content uses `name`.
    pub fn reference_locations(
        &self,
        name: &str,
        parser_version: u32,
    ) -> Result<Vec<ReferenceLocation>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT f.root_id, f.relative_path, r.content_hash, r.kind, r.line, r.col, r.count
             FROM refs r JOIN files f ON f.content_hash = r.content_hash AND f.active = 1
             WHERE r.name = ?1 AND r.parser_version = ?2
             ORDER BY f.root_id, f.relative_path",
        )?;
        let rows = stmt.query_map(params![name, parser_version], |row| {
            Ok(ReferenceLocation {
                root_id: row.get(0)?,
                relative_path: row.get(1)?,
                content_hash: ContentHash::from_hex(row.get::<_, String>(2)?),
                kind: parse_column(row, 3)?,
                line: row.get(4)?,
                column: row.get(5)?,
                count: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn file(&self, id: i64) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// The current version of the file at `path`, if it is known and present.
    pub fn active_file(&self, path: &Path) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1 AND active = 1"),
                params![path.to_string_lossy()],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Active files, optionally limited to one content root, in
    /// (root, relative path) order.
    pub fn active_files(&self, root_id: Option<&str>) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE active = 1 AND (?1 IS NULL OR root_id = ?1)
             ORDER BY root_id, relative_path"
        ))?;
        let rows = stmt.query_map(params![root_id], file_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn();
        let count = |sql: &str| -> Result<u64, StoreError> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        };
        Ok(StoreStats {
            active_files: count("SELECT COUNT(*) FROM files WHERE active = 1")?,
            contents: count("SELECT COUNT(*) FROM contents")?,
            content_bytes: count("SELECT COALESCE(SUM(size), 0) FROM contents")?,
            asts: count("SELECT COUNT(*) FROM asts")?,
            symbols: count("SELECT COUNT(*) FROM symbols")?,
            references: count("SELECT COUNT(*) FROM refs")?,
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

// ──────────────────────────────────────────────────────────────
// Writer
// ──────────────────────────────────────────────────────────────

/// The single mutating handle. Holding one means holding the writer lock.
#[derive(Debug)]
pub struct StoreWriter {
    store: Store,
    _lock: WriterLock,
}

impl Deref for StoreWriter {
    type Target = Store;

    fn deref(&self) -> &Store {
        &self.store
    }
}

impl StoreWriter {
    /// Open (creating if needed) the store the lock guards.
    pub fn open(lock: WriterLock) -> Result<Self, StoreError> {
        let path = lock.store_path().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::initialize(&conn)?;
        info!(path = %path.display(), "opened store for writing");
        Ok(Self {
            store: Store {
                conn: Mutex::new(conn),
                path,
            },
            _lock: lock,
        })
    }

    /// Store `bytes` under their hash. Storing the same bytes again is a no-op.
    pub fn put_content(&self, bytes: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::of(bytes);
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO contents (hash, size, bytes, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(hash) DO NOTHING",
            params![
                hash.as_str(),
                bytes.len() as i64,
                bytes,
                Utc::now().timestamp_millis()
            ],
        )?;
        if inserted > 0 {
            debug!(content_hash = %hash.short(), size = bytes.len(), "stored new content");
        }
        Ok(hash)
    }

    pub fn put_ast(
        &self,
        hash: &ContentHash,
        parser_version: u32,
        document: &ParsedDocument,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(document)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO asts (content_hash, parser_version, kind, document, diagnostics, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(content_hash, parser_version) DO UPDATE SET
                kind = excluded.kind,
                document = excluded.document,
                diagnostics = excluded.diagnostics",
            params![
                hash.as_str(),
                parser_version,
                document.kind().as_str(),
                json,
                document.diagnostics().len() as i64,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Replace, never append, the symbol set of one AST.
    pub fn replace_symbols(
        &self,
        hash: &ContentHash,
        parser_version: u32,
        symbols: &[Symbol],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM symbols WHERE content_hash = ?1 AND parser_version = ?2",
            params![hash.as_str(), parser_version],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO symbols (content_hash, parser_version, name, kind, line, col)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for symbol in symbols {
                stmt.execute(params![
                    hash.as_str(),
                    parser_version,
                    symbol.name,
                    symbol.kind.as_str(),
                    symbol.line,
                    symbol.column
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace, never append, the reference set of one AST.
    pub fn replace_references(
        &self,
        hash: &ContentHash,
        parser_version: u32,
        references: &[Reference],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM refs WHERE content_hash = ?1 AND parser_version = ?2",
            params![hash.as_str(), parser_version],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO refs (content_hash, parser_version, name, kind, line, col, count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for reference in references {
                stmt.execute(params![
                    hash.as_str(),
                    parser_version,
                    reference.name,
                    reference.kind.to_string(),
                    reference.line,
                    reference.column,
                    reference.count
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Record `fingerprint` as the current version of its path.
    ///
    /// An existing version with the same modification time and size but
    /// different content is an identity violation and is refused.
    pub fn record_file(
        &self,
        root_id: &str,
        relative_path: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Recorded, StoreError> {
        let path = fingerprint.path.to_string_lossy().into_owned();
        let mtime_ns = fingerprint.mtime_ns;
        let size = fingerprint.size as i64;
        let hash = fingerprint.content_hash.as_str();

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let clash: Option<String> = tx
            .query_row(
                "SELECT content_hash FROM files
                 WHERE path = ?1 AND mtime_ns = ?2 AND size = ?3 AND content_hash <> ?4
                 LIMIT 1",
                params![path, mtime_ns, size, hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(recorded) = clash {
            return Err(StoreError::IdentityViolation {
                path: fingerprint.path.clone(),
                recorded: ContentHash::from_hex(recorded),
                observed: fingerprint.content_hash.clone(),
            });
        }

        let current = tx
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1 AND active = 1"),
                params![path],
                file_from_row,
            )
            .optional()?;
        if let Some(current) = current.as_ref() {
            if current.fingerprint == *fingerprint && current.root_id == root_id {
                return Ok(Recorded::Unchanged(current.clone()));
            }
            tx.execute("UPDATE files SET active = 0 WHERE id = ?1", params![current.id])?;
        }

        // A path can return to an earlier version; that row is revived.
        tx.execute(
            "INSERT INTO files (root_id, relative_path, path, mtime_ns, size, content_hash, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
             ON CONFLICT(path, mtime_ns, size, content_hash) DO UPDATE SET
                active = 1,
                root_id = excluded.root_id,
                relative_path = excluded.relative_path",
            params![
                root_id,
                relative_path,
                path,
                mtime_ns,
                size,
                hash,
                Utc::now().timestamp_millis()
            ],
        )?;
        let record = tx.query_row(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE path = ?1 AND mtime_ns = ?2 AND size = ?3 AND content_hash = ?4"
            ),
            params![path, mtime_ns, size, hash],
            file_from_row,
        )?;
        tx.commit()?;

        let superseded = current.map(|c| c.id);
        debug!(
            file_id = record.id,
            path = %record.relative_path,
            content_hash = %record.fingerprint.content_hash.short(),
            ?superseded,
            "recorded file version"
        );
        Ok(Recorded::New { record, superseded })
    }

    /// Mark the active version at `path` as gone. Shared content stays until
    /// garbage collection finds it unreferenced.
    pub fn tombstone(&self, path: &Path) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!(
                    "UPDATE files SET active = 0 WHERE path = ?1 AND active = 1
                     RETURNING {FILE_COLUMNS}"
                ),
                params![path.to_string_lossy()],
                file_from_row,
            )
            .optional()?;
        if let Some(record) = &record {
            debug!(file_id = record.id, path = %record.relative_path, "tombstoned file");
        }
        Ok(record)
    }

    /// Drop content no active file references, along with its trees and
    /// extracted records, and every tree from another parser version.
    pub fn collect_garbage(&self, parser_version: u32) -> Result<GcReport, StoreError> {
        const LIVE: &str = "SELECT content_hash FROM files WHERE active = 1";
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let derived = |table: &str| {
            tx.execute(
                &format!(
                    "DELETE FROM {table}
                     WHERE parser_version <> ?1 OR content_hash NOT IN ({LIVE})"
                ),
                params![parser_version],
            )
        };
        let report = GcReport {
            asts: derived("asts")?,
            symbols: derived("symbols")?,
            references: derived("refs")?,
            contents: tx.execute(&format!("DELETE FROM contents WHERE hash NOT IN ({LIVE})"), [])?,
        };
        tx.commit()?;
        if report != GcReport::default() {
            info!(
                contents = report.contents,
                asts = report.asts,
                symbols = report.symbols,
                references = report.references,
                "collected garbage"
            );
        }
        Ok(report)
    }
}

// ──────────────────────────────────────────────────────────────
// Row mapping
// ──────────────────────────────────────────────────────────────

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let path: String = row.get(3)?;
    let size: i64 = row.get(5)?;
    Ok(FileRecord {
        id: row.get(0)?,
        root_id: row.get(1)?,
        relative_path: row.get(2)?,
        fingerprint: Fingerprint {
            path: PathBuf::from(path),
            mtime_ns: row.get(4)?,
            size: u64::try_from(size).unwrap_or(0),
            content_hash: ContentHash::from_hex(row.get::<_, String>(6)?),
        },
        active: row.get(7)?,
        created_at: millis_to_datetime(row.get(8)?),
    })
}

/// Read a text column through the type's `FromStr`.
pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}
