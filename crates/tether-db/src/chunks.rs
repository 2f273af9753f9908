//! Chunk state store backed by PostgreSQL.
//!
//! `detection_state` and `detected_at` are always written together in one
//! statement, and a table CHECK constraint rejects rows where they disagree.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use tether_core::{
    new_v7, Chunk, ChunkContent, ChunkRepository, ChunkSummary, Detection, DetectionFilter,
    DetectionState, Error, NewChunk, Result,
};

/// PostgreSQL implementation of ChunkRepository.
pub struct PgChunkRepository {
    pool: Pool<Postgres>,
}

impl PgChunkRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_state(s: &str) -> Result<DetectionState> {
        DetectionState::parse(s)
            .ok_or_else(|| Error::Internal(format!("unknown detection state '{}'", s)))
    }

    fn parse_chunk_row(row: PgRow) -> Result<Chunk> {
        let state = Self::parse_state(row.get("detection_state"))?;
        Ok(Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            sequence_number: row.get("sequence_number"),
            detection: Detection::from_parts(state, row.get("detected_at"))?,
        })
    }

    fn parse_summary_row(row: PgRow) -> Result<ChunkSummary> {
        let content: String = row.get("preview");
        Ok(ChunkSummary {
            id: row.get("id"),
            sequence_number: row.get("sequence_number"),
            detection_state: Self::parse_state(row.get("detection_state"))?,
            detected_at: row.get("detected_at"),
            connection_count: row.get("connection_count"),
            preview: ChunkSummary::preview_of(&content),
        })
    }

    /// `UPDATE` helper that turns "no row" into `ChunkNotFound`.
    async fn set_detection(&self, id: Uuid, detection: Detection) -> Result<()> {
        let result = sqlx::query(
            "UPDATE chunk SET detection_state = $1, detected_at = $2 WHERE id = $3",
        )
        .bind(detection.state().as_str())
        .bind(detection.detected_at())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ChunkNotFound(id));
        }
        Ok(())
    }
}

fn insert_error(e: sqlx::Error, document_id: Uuid, sequence_number: i32) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return Error::InvalidInput(format!("duplicate sequence number {}", sequence_number));
        }
        if db.is_foreign_key_violation() {
            return Error::DocumentNotFound(document_id);
        }
    }
    Error::Database(e)
}

#[async_trait]
impl ChunkRepository for PgChunkRepository {
    async fn insert_batch(&self, document_id: Uuid, chunks: Vec<NewChunk>) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let id = new_v7();
            sqlx::query(
                "INSERT INTO chunk (id, document_id, sequence_number, content, detection_state)
                 VALUES ($1, $2, $3, $4, 'undetected')",
            )
            .bind(id)
            .bind(document_id)
            .bind(chunk.sequence_number)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await
            .map_err(|e| insert_error(e, document_id, chunk.sequence_number))?;
            ids.push(id);
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(ids)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT id, document_id, sequence_number, detection_state, detected_at
             FROM chunk WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_chunk_row).transpose()
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, document_id, sequence_number, detection_state, detected_at
             FROM chunk WHERE id = ANY($1)
             ORDER BY document_id, sequence_number",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_chunk_row).collect()
    }

    async fn get_state(&self, id: Uuid) -> Result<DetectionState> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT detection_state FROM chunk WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match state {
            Some(s) => Self::parse_state(&s),
            None => Err(Error::ChunkNotFound(id)),
        }
    }

    async fn mark_detected(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.set_detection(id, Detection::Detected { detected_at: at })
            .await
    }

    async fn mark_undetected(&self, id: Uuid) -> Result<()> {
        self.set_detection(id, Detection::Undetected).await
    }

    async fn list_by_document(
        &self,
        document_id: Uuid,
        filter: DetectionFilter,
    ) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, sequence_number, detection_state, detected_at
             FROM chunk
             WHERE document_id = $1 AND ($2::text IS NULL OR detection_state = $2)
             ORDER BY sequence_number",
        )
        .bind(document_id)
        .bind(filter.state().map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_chunk_row).collect()
    }

    async fn list_summaries(
        &self,
        document_id: Uuid,
        filter: DetectionFilter,
    ) -> Result<Vec<ChunkSummary>> {
        // Over-fetch a little and cut on a char boundary in Rust.
        let rows = sqlx::query(
            "SELECT c.id, c.sequence_number, c.detection_state, c.detected_at,
                    left(c.content, $3) AS preview,
                    (SELECT COUNT(*) FROM connection n WHERE n.source_chunk_id = c.id)
                        AS connection_count
             FROM chunk c
             WHERE c.document_id = $1 AND ($2::text IS NULL OR c.detection_state = $2)
             ORDER BY c.sequence_number",
        )
        .bind(document_id)
        .bind(filter.state().map(|s| s.as_str()))
        .bind(tether_core::defaults::SNIPPET_LENGTH as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_summary_row).collect()
    }

    async fn fetch_content(&self, id: Uuid) -> Result<ChunkContent> {
        let row = sqlx::query(
            "SELECT id, document_id, sequence_number, content FROM chunk WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::ChunkNotFound(id))?;

        Ok(ChunkContent {
            id: row.get("id"),
            document_id: row.get("document_id"),
            sequence_number: row.get("sequence_number"),
            content: row.get("content"),
        })
    }
}
