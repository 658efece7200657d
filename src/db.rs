use crate::config::QueueConfig;
use crate::error::{QueueError, StoreLinkError};
use crate::queue::JobQueue;
use crate::store::{self, MetadataStore};
use crate::{Job, JobId, JobPayload, JobRequest, Priority, Status, StoreKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, Instrument};

/// Shared PostgreSQL pool backing both the job queue and the metadata store.
///
/// Created once at startup and handed to every component that needs it.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
    /// Record writes started by `create_key` that have not finished yet.
    writes: TaskTracker,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: JobId,
    topic: String,
    priority: Priority,
    payload: Json<JobPayload>,
    status: Status,
    created_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            topic: row.topic,
            priority: row.priority,
            payload: row.payload.0,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

impl DbHandle {
    pub async fn new(config: &QueueConfig, max_connections: u32) -> Result<Self, QueueError> {
        debug!(message = "Connecting to queue", config = ?config);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(config.connect_options())
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
            writes: TaskTracker::new(),
        })
    }

    /// Waits for pending record writes, then closes the pool.
    pub async fn close(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.pool.close().await;
    }

    async fn finish_job(
        &self,
        id: JobId,
        status: Status,
        msg: Option<&str>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE song_jobs \
                SET status = $1, \
                duration = extract(epoch from now() - started_at), \
                error = $2 \
            WHERE id = $3",
        )
        .bind(status)
        .bind(msg)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}

async fn upsert_record(pool: &PgPool, path: &str, value: Value) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO store_records (path, value) VALUES ($1, $2) \
        ON CONFLICT (path) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
    )
    .bind(path)
    .bind(Json(value))
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl JobQueue for DbHandle {
    async fn enqueue(&self, request: &JobRequest) -> Result<JobId, QueueError> {
        debug!(message = "Submitting job", topic = %request.topic, priority = %request.priority);
        let id = sqlx::query_scalar::<_, JobId>(
            "INSERT INTO song_jobs \
            (topic, priority, payload, status) \
            VALUES ($1, $2, $3, 'QUEUED') \
            RETURNING id",
        )
        .bind(&request.topic)
        .bind(request.priority)
        .bind(Json(&request.payload))
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    async fn dequeue(&self, topic: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE song_jobs \
                SET status = 'PROCESSING', \
                started_at = now() \
            WHERE id = ( \
                SELECT id FROM song_jobs \
                WHERE topic = $1 AND status = 'QUEUED' \
                ORDER BY priority DESC, id ASC \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING id, topic, priority, payload, status, created_at",
        )
        .bind(topic)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(Job::from))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        self.finish_job(id, Status::Completed, None).await
    }

    async fn fail(&self, id: JobId, message: &str) -> Result<(), QueueError> {
        self.finish_job(id, Status::Failed, Some(message)).await
    }

    async fn requeue_processing(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE song_jobs \
                SET status = 'QUEUED', \
                started_at = NULL \
            WHERE status = 'PROCESSING'",
        )
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn pending(&self, topic: &str) -> Result<Vec<Job>, QueueError> {
        debug!("Getting queued jobs of {}", topic);
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, topic, priority, payload, status, created_at \
            FROM song_jobs \
            WHERE topic = $1 AND status = 'QUEUED' \
            ORDER BY priority DESC, id ASC",
        )
        .bind(topic)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }
}

#[async_trait]
impl MetadataStore for DbHandle {
    fn create_key(&self, project: &str, record: Value) -> StoreKey {
        let key = store::new_key();
        let path = store::song_record_path(project, &key);
        let pool = self.pool.clone();
        self.writes.spawn(
            async move {
                if let Err(err) = upsert_record(&pool, &path, record).await {
                    error!(message = "Failed to write song record", path = %path, error = ?err);
                }
            }
            .in_current_span(),
        );
        key
    }

    async fn set_field(&self, path: &str, value: Value) -> Result<(), StoreLinkError> {
        upsert_record(&self.pool, path, value).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreLinkError> {
        let value = sqlx::query_scalar::<_, Json<Value>>(
            "SELECT value FROM store_records WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(value.map(|json| json.0))
    }
}
