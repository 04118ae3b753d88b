// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence for embedding records and content bookkeeping.
//!
//! Each modality has its own `vectors_*` table keyed by chunk id. The
//! `contents` table records the hash of every indexed content item so that
//! unchanged inputs can be skipped.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::errors::{RagError, Result};
use crate::types::{ChunkId, ChunkMetadata, EmbeddingRecord, Modality};

const SCHEMA_VERSION: &str = "1";

/// Stored bookkeeping row for one content item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub content_id: String,
    pub modality: Modality,
    pub content_hash: String,
    pub chunk_count: usize,
    pub indexed_at: i64,
}

pub struct VectorStorage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl VectorStorage {
    /// Opens or creates a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let storage = Self {
            conn: Mutex::new(conn),
            path: Some(path),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<()> {
        let mut ddl = String::from(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contents (
                content_id TEXT PRIMARY KEY,
                modality TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                indexed_at INTEGER NOT NULL
            );
            "#,
        );
        for modality in Modality::ALL {
            let table = modality.table_name();
            ddl.push_str(&format!(
                r#"
            CREATE TABLE IF NOT EXISTS {table} (
                chunk_id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                content_id TEXT NOT NULL,
                vector BLOB NOT NULL,
                metadata TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_content ON {table}(content_id);
            "#
            ));
        }

        {
            let conn = self.conn.lock();
            conn.execute_batch(&ddl)?;
            conn.execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        match self.get_meta("schema_version")? {
            Some(version) if version != SCHEMA_VERSION => Err(RagError::invalid_config(format!(
                "vector database has schema version {}, expected {}; delete the data directory and re-index",
                version, SCHEMA_VERSION
            ))),
            _ => Ok(()),
        }
    }

    /// Inserts or replaces records in a single transaction.
    pub fn upsert_records(&self, records: &[EmbeddingRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        insert_records(&tx, records)?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes every record and the bookkeeping row owned by `content_id`.
    /// Returns the number of records removed.
    pub fn delete_content(&self, content_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = delete_vectors(&tx, content_id)?;
        tx.execute("DELETE FROM contents WHERE content_id = ?1", params![content_id])?;
        tx.commit()?;
        Ok(removed)
    }

    /// Replaces the records owned by `content_id` with `records` in one
    /// transaction. The bookkeeping row is left for the caller to update.
    pub fn replace_content(&self, content_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        delete_vectors(&tx, content_id)?;
        insert_records(&tx, records)?;
        tx.commit()?;
        Ok(())
    }

    /// All records of a modality in insertion order.
    pub fn load_modality(&self, modality: Modality) -> Result<Vec<EmbeddingRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT chunk_id, model_id, vector, metadata, created_at FROM {} ORDER BY rowid",
            modality.table_name()
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(chunk_id, model_id, blob, metadata, created_at)| {
                let metadata: ChunkMetadata = serde_json::from_str(&metadata)?;
                Ok(EmbeddingRecord {
                    chunk_id: ChunkId::from(chunk_id),
                    modality,
                    model_id,
                    vector: blob_to_vector(&blob),
                    metadata,
                    created_at,
                })
            })
            .collect()
    }

    pub fn count(&self, modality: Modality) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", modality.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn upsert_content(&self, entry: &ContentEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO contents (content_id, modality, content_hash, chunk_count, indexed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(content_id) DO UPDATE SET
                modality = excluded.modality,
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                indexed_at = excluded.indexed_at
            "#,
            params![
                entry.content_id,
                entry.modality.as_str(),
                entry.content_hash,
                entry.chunk_count as i64,
                entry.indexed_at,
            ],
        )?;
        Ok(())
    }

    pub fn content(&self, content_id: &str) -> Result<Option<ContentEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT modality, content_hash, chunk_count, indexed_at FROM contents WHERE content_id = ?1",
                params![content_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(modality, content_hash, chunk_count, indexed_at)| {
            Some(ContentEntry {
                content_id: content_id.to_string(),
                modality: modality.parse().ok()?,
                content_hash,
                chunk_count: chunk_count as usize,
                indexed_at,
            })
        }))
    }

    /// True when `content_id` is stored under `modality` with this hash.
    pub fn is_current(&self, content_id: &str, modality: Modality, content_hash: &str) -> Result<bool> {
        Ok(self
            .content(content_id)?
            .is_some_and(|e| e.modality == modality && e.content_hash == content_hash))
    }

    pub fn list_contents(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT content_id FROM contents ORDER BY content_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

}

fn insert_records(tx: &Transaction<'_>, records: &[EmbeddingRecord]) -> Result<()> {
    for record in records {
        let sql = format!(
            r#"
            INSERT INTO {} (chunk_id, model_id, content_id, vector, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model_id = excluded.model_id,
                content_id = excluded.content_id,
                vector = excluded.vector,
                metadata = excluded.metadata,
                created_at = excluded.created_at
            "#,
            record.modality.table_name()
        );
        let metadata = serde_json::to_string(&record.metadata)?;
        tx.prepare_cached(&sql)?.execute(params![
            record.chunk_id.as_str(),
            record.model_id,
            record.metadata.content_id,
            vector_to_blob(&record.vector),
            metadata,
            record.created_at,
        ])?;
    }
    Ok(())
}

fn delete_vectors(tx: &Transaction<'_>, content_id: &str) -> Result<usize> {
    let mut removed = 0;
    for modality in Modality::ALL {
        removed += tx.execute(
            &format!("DELETE FROM {} WHERE content_id = ?1", modality.table_name()),
            params![content_id],
        )?;
    }
    Ok(removed)
}

/// Hash used for change detection.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
