//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Every record is one row of the `chunks` table with its vector stored as
//! a little-endian f32 BLOB. Queries load the candidate rows matching the
//! filter and rank them by cosine distance in Rust, ordered by `rowid` so
//! ties keep insertion order.
//!
//! Each batch is written inside one transaction: concurrent readers see
//! either none or all of it. A replacement deletes the old rows and inserts
//! the new ones in the same transaction.

use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};

use local_rag_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use local_rag_core::error::IndexError;
use local_rag_core::models::{ChunkRecord, DocumentSummary, ScoredChunk};
use local_rag_core::store::{RecordFilter, VectorIndex};

/// SQLite implementation of [`VectorIndex`].
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn unavailable(e: sqlx::Error) -> IndexError {
    IndexError::Unavailable(e.to_string())
}

fn query_failed(e: sqlx::Error) -> IndexError {
    IndexError::Query(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

const FILTER_CLAUSE: &str = "(?1 IS NULL OR document_id = ?1) \
     AND (?2 IS NULL OR embedding_model = ?2) \
     AND (?3 IS NULL OR embedding_dim = ?3)";

/// Insert `records` on `conn`. The caller owns the transaction; dropping it
/// after an error rolls every insert back.
async fn insert_records(conn: &mut SqliteConnection, records: &[ChunkRecord]) -> Result<(), IndexError> {
    let now = chrono::Utc::now().timestamp();
    for record in records {
        let result = sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, source, chunk_index, text, hash,
                                char_start, char_end, embedding, embedding_model,
                                embedding_dim, chunk_version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.chunk.id)
        .bind(&record.chunk.document_id)
        .bind(&record.source)
        .bind(record.chunk.chunk_index)
        .bind(&record.chunk.text)
        .bind(&record.chunk.hash)
        .bind(record.chunk.char_start as i64)
        .bind(record.chunk.char_end as i64)
        .bind(vec_to_blob(&record.embedding))
        .bind(&record.embedding_model)
        .bind(record.embedding_dim as i64)
        .bind(&record.chunk_version)
        .bind(now)
        .execute(&mut *conn)
        .await;

        if let Err(e) = result {
            if is_unique_violation(&e) {
                return Err(IndexError::Conflict(record.chunk.id.clone()));
            }
            return Err(IndexError::Write(e.to_string()));
        }
    }
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn write_batch(&self, records: Vec<ChunkRecord>) -> Result<usize, IndexError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        insert_records(&mut tx, &records).await?;
        tx.commit()
            .await
            .map_err(|e| IndexError::Write(e.to_string()))?;
        Ok(records.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT id, document_id, source, chunk_index, text, embedding \
             FROM chunks WHERE {} ORDER BY rowid ASC",
            FILTER_CLAUSE
        );
        let rows = sqlx::query(&sql)
            .bind(filter.document_id.as_deref())
            .bind(filter.embedding_model.as_deref())
            .bind(filter.embedding_dim.map(|d| d as i64))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredChunk {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    source: row.get("source"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    distance: cosine_distance(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);

        Ok(scored)
    }

    async fn replace_document(
        &self,
        document_id: &str,
        records: Vec<ChunkRecord>,
    ) -> Result<usize, IndexError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| IndexError::Write(e.to_string()))?
            .rows_affected();
        insert_records(&mut tx, &records).await?;
        tx.commit()
            .await
            .map_err(|e| IndexError::Write(e.to_string()))?;
        Ok(removed as usize)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(|e| IndexError::Write(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, IndexError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, MIN(source) AS source, COUNT(*) AS chunks
            FROM chunks
            GROUP BY document_id
            ORDER BY document_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(rows
            .iter()
            .map(|row| {
                let chunks: i64 = row.get("chunks");
                DocumentSummary {
                    document_id: row.get("document_id"),
                    source: row.get("source"),
                    chunks: chunks as usize,
                }
            })
            .collect())
    }

    async fn count_chunks(&self, filter: &RecordFilter) -> Result<usize, IndexError> {
        let sql = format!("SELECT COUNT(*) FROM chunks WHERE {}", FILTER_CLAUSE);
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(filter.document_id.as_deref())
            .bind(filter.embedding_model.as_deref())
            .bind(filter.embedding_dim.map(|d| d as i64))
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(count as usize)
    }
}
