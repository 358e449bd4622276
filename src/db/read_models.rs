//! Detection cache and fast read store on Postgres.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Projection, ProjectionRecord, RequestId};
use crate::store::{DetectionCache, ProjectionStore, decode_record, meaningful};

#[async_trait]
impl DetectionCache for super::Db {
    async fn append(&self, request: &RequestId, labels: &[String]) -> Result<usize> {
        let labels: Vec<&str> = meaningful(labels).map(String::as_str).collect();
        if labels.is_empty() {
            return Ok(0);
        }

        // One statement keeps the batch contiguous in insertion order.
        let result = sqlx::query(
            "INSERT INTO detections (request_uuid, label)
             SELECT $1, label FROM UNNEST($2::text[]) WITH ORDINALITY AS t(label, n)
             ORDER BY n",
        )
        .bind(request.as_str())
        .bind(&labels)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn labels(&self, request: &RequestId) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT label FROM detections WHERE request_uuid = $1 ORDER BY id")
                .bind(request.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(label,)| label).collect())
    }

    async fn clear(&self, request: &RequestId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM detections WHERE request_uuid = $1")
            .bind(request.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProjectionStore for super::Db {
    async fn put(&self, projection: &Projection) -> Result<()> {
        let record = serde_json::to_value(ProjectionRecord::from(projection))?;
        sqlx::query(
            "INSERT INTO projections (request_uuid, record, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (request_uuid)
             DO UPDATE SET record = EXCLUDED.record, updated_at = EXCLUDED.updated_at",
        )
        .bind(projection.request_uuid.as_str())
        .bind(&record)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, request: &RequestId) -> Result<Option<ProjectionRecord>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT record FROM projections WHERE request_uuid = $1")
                .bind(request.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| decode_record(request, value)))
    }
}
