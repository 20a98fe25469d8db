//! Persistent vector store over SQLite.
//!
//! Two logical tables: `summaries(id, url, title, text, created_at)` and
//! `embeddings(summary_id, dim, vec_blob)`. Embedding blobs are
//! little-endian IEEE-754 float32, `dim * 4` bytes.
//!
//! Top-k has two paths selected at runtime: a `cosine_sim(q, v, dim)` SQL
//! function registered at connection time when the engine accepts it, and an
//! in-memory scan fallback. Cosine math always accumulates in f64 so that
//! near-ties order identically on both paths.
//!
//! Writes must be serialized; the orchestrator guarantees only the ASSEMBLE
//! stage writes. Concurrent readers are fine.

use crate::error::StoreError;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

/// A stored row joined with its score during retrieval.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub text: String,
}

pub struct VectorStore {
    conn: Mutex<Connection>,
    /// Whether the cosine_sim SQL function registered successfully.
    indexed: bool,
}

impl VectorStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS summaries (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 url TEXT NOT NULL,
                 title TEXT NOT NULL,
                 text TEXT NOT NULL,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE TABLE IF NOT EXISTS embeddings (
                 summary_id INTEGER NOT NULL,
                 dim INTEGER NOT NULL,
                 vec_blob BLOB NOT NULL,
                 FOREIGN KEY (summary_id) REFERENCES summaries(id)
             );",
        )?;

        let indexed = match register_cosine(&conn) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "cosine_sim registration failed; using in-memory ranking");
                false
            }
        };

        Ok(Self {
            conn: Mutex::new(conn),
            indexed,
        })
    }

    /// Whether the indexed (SQL function) top-k path is available.
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Insert summary rows with their embeddings, returning row ids in
    /// input order.
    ///
    /// All embeddings in the store must share one dimension; a mismatch
    /// against already-stored vectors is rejected.
    pub fn upsert(
        &self,
        records: &[(String, String, String, Vec<f32>)],
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");

        let existing_dim: Option<usize> = conn
            .query_row("SELECT dim FROM embeddings LIMIT 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|d| d as usize)
            .ok();

        let mut ids = Vec::with_capacity(records.len());
        for (url, title, text, embedding) in records {
            if let Some(expected) = existing_dim {
                if embedding.len() != expected {
                    return Err(StoreError::DimensionMismatch {
                        expected,
                        actual: embedding.len(),
                    });
                }
            }

            conn.execute(
                "INSERT INTO summaries (url, title, text) VALUES (?1, ?2, ?3)",
                params![url, title, text],
            )?;
            let summary_id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO embeddings (summary_id, dim, vec_blob) VALUES (?1, ?2, ?3)",
                params![summary_id, embedding.len() as i64, f32_vec_to_bytes(embedding)],
            )?;
            ids.push(summary_id);
        }

        debug!(stored = ids.len(), "Stored summaries with embeddings");
        Ok(ids)
    }

    /// Top-k rows by cosine similarity to the query embedding, descending.
    ///
    /// Result size is `min(k, rows with embeddings)`.
    pub fn top_k(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(StoredChunk, f64)>, StoreError> {
        self.top_k_filtered(query_embedding, k, None)
    }

    /// Top-k restricted to the given row ids (one run's summaries).
    pub fn top_k_in(
        &self,
        ids: &[i64],
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(StoredChunk, f64)>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.top_k_filtered(query_embedding, k, Some(ids))
    }

    fn top_k_filtered(
        &self,
        query_embedding: &[f32],
        k: usize,
        ids: Option<&[i64]>,
    ) -> Result<Vec<(StoredChunk, f64)>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        if self.indexed {
            let rows = self.top_k_sql(query_embedding, k, ids)?;
            if !rows.is_empty() {
                return Ok(rows);
            }
            // Empty scan: fall through to the in-memory path, which sees the
            // same data and returns the same (empty or non-empty) answer.
        }
        self.top_k_memory(query_embedding, k, ids)
    }

    fn top_k_sql(
        &self,
        query_embedding: &[f32],
        k: usize,
        ids: Option<&[i64]>,
    ) -> Result<Vec<(StoredChunk, f64)>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let query_blob = f32_vec_to_bytes(query_embedding);

        let (filter, mut params_vec): (String, Vec<Box<dyn rusqlite::ToSql>>) = match ids {
            Some(ids) => {
                let placeholders = vec!["?"; ids.len()].join(",");
                let boxed: Vec<Box<dyn rusqlite::ToSql>> =
                    ids.iter().map(|id| Box::new(*id) as Box<dyn rusqlite::ToSql>).collect();
                (format!("WHERE s.id IN ({placeholders})"), boxed)
            }
            None => (String::new(), Vec::new()),
        };

        let sql = format!(
            "SELECT s.id, s.url, s.title, s.text,
                    cosine_sim(?1, e.vec_blob, e.dim) AS score
             FROM summaries s
             JOIN embeddings e ON e.summary_id = s.id
             {filter}
             ORDER BY score DESC, s.id ASC
             LIMIT ?"
        );

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(query_blob)];
        all_params.append(&mut params_vec);
        all_params.push(Box::new(k as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(all_params.iter().map(|p| p.as_ref())),
            |row| {
                Ok((
                    StoredChunk {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        title: row.get(2)?,
                        text: row.get(3)?,
                    },
                    row.get::<_, f64>(4)?,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn top_k_memory(
        &self,
        query_embedding: &[f32],
        k: usize,
        ids: Option<&[i64]>,
    ) -> Result<Vec<(StoredChunk, f64)>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT s.id, s.url, s.title, s.text, e.dim, e.vec_blob
             FROM summaries s
             JOIN embeddings e ON e.summary_id = s.id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                StoredChunk {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    title: row.get(2)?,
                    text: row.get(3)?,
                },
                row.get::<_, i64>(4)? as usize,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?;

        let mut scored: Vec<(StoredChunk, f64)> = Vec::new();
        for row in rows {
            let (chunk, dim, blob) = row?;
            if let Some(ids) = ids {
                if !ids.contains(&chunk.id) {
                    continue;
                }
            }
            let stored = bytes_to_f32_vec(&blob, dim);
            let score = cosine_similarity(query_embedding, &stored);
            scored.push((chunk, score));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Number of rows with stored embeddings.
    pub fn embedded_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Register `cosine_sim(query_blob, vec_blob, dim) -> REAL` on a connection.
fn register_cosine(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "cosine_sim",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let query_blob: Vec<u8> = ctx.get(0)?;
            let vec_blob: Vec<u8> = ctx.get(1)?;
            let dim: i64 = ctx.get(2)?;
            let a = bytes_to_f32_vec(&query_blob, dim as usize);
            let b = bytes_to_f32_vec(&vec_blob, dim as usize);
            Ok(cosine_similarity(&a, &b))
        },
    )
}

/// Serialize f32 values as little-endian bytes.
pub(crate) fn f32_vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize little-endian bytes back into f32 values.
pub(crate) fn bytes_to_f32_vec(bytes: &[u8], expected_dim: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(expected_dim);
    for chunk in bytes.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    out
}

/// Cosine similarity with f64 accumulation over f32 inputs.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, text: &str, embedding: Vec<f32>) -> (String, String, String, Vec<f32>) {
        (url.to_string(), format!("title {url}"), text.to_string(), embedding)
    }

    #[test]
    fn test_blob_round_trip() {
        let v = vec![0.5f32, -1.25, 3.0, 0.0];
        let bytes = f32_vec_to_bytes(&v);
        assert_eq!(bytes.len(), v.len() * 4);
        assert_eq!(bytes_to_f32_vec(&bytes, v.len()), v);
    }

    #[test]
    fn test_cosine_identical() {
        let a = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal_and_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_upsert_and_top_k() {
        let store = VectorStore::open_in_memory().unwrap();
        let ids = store
            .upsert(&[
                record("https://a.example", "rust systems", vec![1.0, 0.0, 0.0]),
                record("https://b.example", "python data", vec![0.0, 1.0, 0.0]),
                record("https://c.example", "rust async", vec![0.9, 0.1, 0.0]),
            ])
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(store.embedded_count().unwrap(), 3);

        let results = store.top_k(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.url, "https://a.example");
        assert_eq!(results[1].0.url, "https://c.example");
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn test_top_k_size_bounded_by_store() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert(&[record("https://a.example", "only row", vec![1.0, 0.0])])
            .unwrap();
        let results = store.top_k(&[1.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_top_k_in_restricts_to_ids() {
        let store = VectorStore::open_in_memory().unwrap();
        let ids = store
            .upsert(&[
                record("https://a.example", "a", vec![1.0, 0.0]),
                record("https://b.example", "b", vec![0.99, 0.01]),
                record("https://c.example", "c", vec![0.98, 0.02]),
            ])
            .unwrap();

        let subset = &ids[1..];
        let results = store.top_k_in(subset, &[1.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(c, _)| subset.contains(&c.id)));
    }

    #[test]
    fn test_top_k_in_empty_ids() {
        let store = VectorStore::open_in_memory().unwrap();
        let results = store.top_k_in(&[], &[1.0, 0.0], 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let store = VectorStore::open_in_memory().unwrap();
        store
            .upsert(&[record("https://a.example", "a", vec![1.0, 0.0, 0.0])])
            .unwrap();
        let err = store
            .upsert(&[record("https://b.example", "b", vec![1.0, 0.0])])
            .unwrap_err();
        match err {
            StoreError::DimensionMismatch { expected, actual } => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("Expected DimensionMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_sql_and_memory_paths_agree() {
        let store = VectorStore::open_in_memory().unwrap();
        assert!(store.is_indexed());
        store
            .upsert(&[
                record("https://a.example", "a", vec![0.7, 0.3, 0.1]),
                record("https://b.example", "b", vec![0.1, 0.9, 0.2]),
                record("https://c.example", "c", vec![0.5, 0.5, 0.5]),
            ])
            .unwrap();

        let query = vec![0.6f32, 0.4, 0.2];
        let sql = store.top_k_sql(&query, 3, None).unwrap();
        let mem = store.top_k_memory(&query, 3, None).unwrap();
        assert_eq!(sql.len(), mem.len());
        for (s, m) in sql.iter().zip(mem.iter()) {
            assert_eq!(s.0.id, m.0.id);
            assert!((s.1 - m.1).abs() < 1e-12);
        }
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite");
        {
            let store = VectorStore::open(&path).unwrap();
            store
                .upsert(&[record("https://a.example", "persisted", vec![1.0, 0.0])])
                .unwrap();
        }
        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.embedded_count().unwrap(), 1);
        let results = store.top_k(&[1.0, 0.0], 1).unwrap();
        assert_eq!(results[0].0.text, "persisted");
    }
}
