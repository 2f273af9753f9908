//! Connection store backed by PostgreSQL.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use tether_core::{
    new_v7, Connection, ConnectionKind, ConnectionRepository, ConnectionTarget,
    DetectedConnection, Error, RedetectPolicy, Result,
};

/// PostgreSQL implementation of ConnectionRepository.
pub struct PgConnectionRepository {
    pool: Pool<Postgres>,
}

impl PgConnectionRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_connection_row(row: PgRow) -> Result<Connection> {
        let target_chunk_id: Option<Uuid> = row.get("target_chunk_id");
        let target_ref: Option<String> = row.get("target_ref");
        let target = match (target_chunk_id, target_ref) {
            (Some(id), None) => ConnectionTarget::Chunk(id),
            (None, Some(r)) => ConnectionTarget::External(r),
            _ => {
                return Err(Error::Internal(
                    "connection row must have exactly one target".to_string(),
                ))
            }
        };
        let kind: String = row.get("kind");
        Ok(Connection {
            id: row.get("id"),
            source_chunk_id: row.get("source_chunk_id"),
            job_id: row.get("job_id"),
            target,
            kind: ConnectionKind::from(kind),
            strength: row.get("strength"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
        })
    }
}

/// Drop repeated `(target, kind)` pairs, keeping the first occurrence.
pub(crate) fn dedupe_run(connections: Vec<DetectedConnection>) -> Vec<DetectedConnection> {
    let mut seen = HashSet::new();
    connections
        .into_iter()
        .filter(|c| seen.insert((c.target.clone(), c.kind.clone())))
        .collect()
}

#[async_trait]
impl ConnectionRepository for PgConnectionRepository {
    async fn record(
        &self,
        source_chunk_id: Uuid,
        job_id: Uuid,
        connections: Vec<DetectedConnection>,
        policy: RedetectPolicy,
    ) -> Result<usize> {
        let connections = dedupe_run(connections);
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if policy == RedetectPolicy::Replace {
            let removed = sqlx::query(
                "DELETE FROM connection WHERE source_chunk_id = $1 AND job_id <> $2",
            )
            .bind(source_chunk_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            debug!(
                subsystem = "database",
                component = "connections",
                chunk_id = %source_chunk_id,
                removed = removed.rows_affected(),
                "Replaced earlier connections"
            );
        }

        let mut inserted = 0usize;
        for conn in connections {
            let (target_chunk_id, target_ref) = match &conn.target {
                ConnectionTarget::Chunk(id) => (Some(*id), None),
                ConnectionTarget::External(r) => (None, Some(r.as_str())),
            };
            let result = sqlx::query(
                "INSERT INTO connection
                     (id, source_chunk_id, job_id, target_chunk_id, target_ref, kind, strength,
                      metadata, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT DO NOTHING",
            )
            .bind(new_v7())
            .bind(source_chunk_id)
            .bind(job_id)
            .bind(target_chunk_id)
            .bind(target_ref)
            .bind(conn.kind.as_str())
            .bind(conn.strength)
            .bind(&conn.metadata)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(inserted)
    }

    async fn list_for_chunk(&self, chunk_id: Uuid) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT id, source_chunk_id, job_id, target_chunk_id, target_ref, kind, strength,
                    metadata, created_at
             FROM connection WHERE source_chunk_id = $1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_connection_row).collect()
    }

    async fn count_for_chunk(&self, chunk_id: Uuid) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM connection WHERE source_chunk_id = $1")
                .bind(chunk_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }
}
