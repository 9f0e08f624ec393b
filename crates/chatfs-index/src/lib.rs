//! Durable map from virtual path to file record, backed by an embedded
//! SQLite database. All writes are serialized by a single process-wide
//! mutex and wrapped in one transaction.

use std::path::Path;

use chatfs_core::model::{ChunkRef, FileRecord};
use chatfs_core::path::VirtualPath;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

type Result<T> = std::result::Result<T, IndexError>;

/// A single-writer embedded relational store mapping virtual paths to
/// [`FileRecord`]s and their ordered [`ChunkRef`]s.
pub struct MetadataIndex {
    conn: Mutex<Connection>,
}

impl MetadataIndex {
    /// Open (creating if absent) the database at `path` and apply the
    /// schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// An in-memory index, used in tests and for `--no-persist` scenarios.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS files (
                id            INTEGER PRIMARY KEY,
                virtual_path  TEXT NOT NULL UNIQUE,
                file_name     TEXT NOT NULL,
                size_bytes    INTEGER NOT NULL,
                created_at    TEXT NOT NULL,
                modified_at   TEXT NOT NULL,
                is_directory  INTEGER NOT NULL
             );
             CREATE UNIQUE INDEX IF NOT EXISTS idx_files_virtual_path ON files(virtual_path);
             CREATE TABLE IF NOT EXISTS chunks (
                id             INTEGER PRIMARY KEY,
                file_id        INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                chunk_index    INTEGER NOT NULL,
                message_id     INTEGER NOT NULL,
                attachment_url TEXT NOT NULL,
                size_bytes     INTEGER NOT NULL,
                crc32          INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id);",
        )?;
        Ok(())
    }

    /// Upsert `record` on `virtual_path`: replace name/size/modified_at,
    /// drop and re-insert its chunks. Returns the assigned row id.
    #[instrument(skip_all, fields(path = %record.virtual_path))]
    pub fn save(&self, record: &FileRecord) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM files WHERE virtual_path = ?1",
                params![record.virtual_path.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let file_id = if let Some(id) = existing {
            tx.execute(
                "UPDATE files SET file_name = ?1, size_bytes = ?2, modified_at = ?3, is_directory = ?4 WHERE id = ?5",
                params![
                    record.file_name,
                    record.size_bytes as i64,
                    to_iso8601(record.modified_at),
                    record.is_directory,
                    id
                ],
            )?;
            tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![id])?;
            id
        } else {
            tx.execute(
                "INSERT INTO files (virtual_path, file_name, size_bytes, created_at, modified_at, is_directory)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.virtual_path.as_str(),
                    record.file_name,
                    record.size_bytes as i64,
                    to_iso8601(record.created_at),
                    to_iso8601(record.modified_at),
                    record.is_directory
                ],
            )?;
            tx.last_insert_rowid()
        };

        for chunk in &record.chunks {
            tx.execute(
                "INSERT INTO chunks (file_id, chunk_index, message_id, attachment_url, size_bytes, crc32)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    file_id,
                    chunk.chunk_index,
                    chunk.message_id as i64,
                    chunk.attachment_url,
                    chunk.size_bytes as i64,
                    chunk.crc32
                ],
            )?;
        }

        tx.commit()?;
        Ok(file_id)
    }

    /// Fetch a record and its chunks (ascending `chunk_index`), if present.
    #[instrument(skip(self), fields(path = %path))]
    pub fn get(&self, path: &VirtualPath) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, file_name, size_bytes, created_at, modified_at, is_directory
                 FROM files WHERE virtual_path = ?1",
                params![path.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, file_name, size_bytes, created_at, modified_at, is_directory)) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT chunk_index, message_id, attachment_url, size_bytes, crc32
             FROM chunks WHERE file_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let chunks = stmt
            .query_map(params![id], |row| {
                Ok(ChunkRef {
                    chunk_index: row.get::<_, i64>(0)? as u32,
                    message_id: row.get::<_, i64>(1)? as u64,
                    attachment_url: row.get(2)?,
                    size_bytes: row.get::<_, i64>(3)? as u64,
                    crc32: row.get::<_, i64>(4)? as u32,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(FileRecord {
            virtual_path: path.clone(),
            file_name,
            size_bytes: size_bytes as u64,
            created_at: from_iso8601(&created_at),
            modified_at: from_iso8601(&modified_at),
            is_directory,
            chunks,
        }))
    }

    /// Cascade-delete `path` and its chunks.
    #[instrument(skip(self), fields(path = %path))]
    pub fn delete(&self, path: &VirtualPath) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM files WHERE virtual_path = ?1", params![path.as_str()])?;
        Ok(())
    }

    /// Immediate children of `dir`: entries at `dir + SEP + x` where `x`
    /// contains no further separator.
    #[instrument(skip(self), fields(dir = %dir))]
    pub fn list(&self, dir: &VirtualPath) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let like_pattern = if dir.is_root() {
            "%".to_string()
        } else {
            format!("{}/%", dir.as_str())
        };

        let mut stmt = conn.prepare(
            "SELECT id, virtual_path, file_name, size_bytes, created_at, modified_at, is_directory
             FROM files WHERE virtual_path LIKE ?1 ESCAPE '\\'",
        )?;
        let rows = stmt.query_map(params![like_pattern], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, virtual_path, file_name, size_bytes, created_at, modified_at, is_directory) = row?;
            let vp = VirtualPath::from(virtual_path);
            if vp == *dir || !dir.is_direct_child(&vp) {
                continue;
            }

            let mut cstmt = conn.prepare(
                "SELECT chunk_index, message_id, attachment_url, size_bytes, crc32
                 FROM chunks WHERE file_id = ?1 ORDER BY chunk_index ASC",
            )?;
            let chunks = cstmt
                .query_map(params![id], |row| {
                    Ok(ChunkRef {
                        chunk_index: row.get::<_, i64>(0)? as u32,
                        message_id: row.get::<_, i64>(1)? as u64,
                        attachment_url: row.get(2)?,
                        size_bytes: row.get::<_, i64>(3)? as u64,
                        crc32: row.get::<_, i64>(4)? as u32,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            out.push(FileRecord {
                virtual_path: vp,
                file_name,
                size_bytes: size_bytes as u64,
                created_at: from_iso8601(&created_at),
                modified_at: from_iso8601(&modified_at),
                is_directory,
                chunks,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(path = %path))]
    pub fn exists(&self, path: &VirtualPath) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM files WHERE virtual_path = ?1",
                params![path.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Update `virtual_path`, `file_name`, and `modified_at` for the row at
    /// `old`. If a row already exists at `new`, it is deleted first
    /// (cascading its chunks) so the rename overwrites it, matching POSIX
    /// `rename(2)` replace semantics; both steps run in one transaction.
    /// Returns the message ids of any chunks that belonged to the
    /// overwritten destination, so the caller can best-effort delete them
    /// from the remote store. Does not rewrite descendant paths; directory
    /// renames with children are therefore a known limitation (see
    /// DESIGN.md, OQ-2).
    #[instrument(skip(self), fields(old = %old, new = %new))]
    pub fn rename(&self, old: &VirtualPath, new: &VirtualPath, now: DateTime<Utc>) -> Result<Vec<u64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let overwritten_id: Option<i64> = tx
            .query_row("SELECT id FROM files WHERE virtual_path = ?1", params![new.as_str()], |row| row.get(0))
            .optional()?;

        let mut orphaned_message_ids = Vec::new();
        if let Some(id) = overwritten_id {
            let mut stmt = tx.prepare("SELECT message_id FROM chunks WHERE file_id = ?1")?;
            orphaned_message_ids = stmt
                .query_map(params![id], |row| row.get::<_, i64>(0).map(|v| v as u64))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            tx.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        }

        tx.execute(
            "UPDATE files SET virtual_path = ?1, file_name = ?2, modified_at = ?3 WHERE virtual_path = ?4",
            params![new.as_str(), new.file_name(), to_iso8601(now), old.as_str()],
        )?;

        tx.commit()?;
        Ok(orphaned_message_ids)
    }
}

fn to_iso8601(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn from_iso8601(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().expect("epoch is representable"))
}
