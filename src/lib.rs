use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod builder;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod refresh;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;

/// Queue-assigned job identifier, monotonically increasing per queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch priority of a job. Higher values are served first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Priority(pub i64);

impl Priority {
    /// Captures the project's vote tally as it is right now.
    ///
    /// The value is frozen for the lifetime of the job: later up/down votes on
    /// the project do not reorder jobs that are already queued.
    pub fn snapshot(project: &Project) -> Self {
        Priority(project.votes)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Song metadata as delivered by the catalog or by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A named playback channel. The name doubles as the queue topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub votes: i64,
    #[serde(default, rename = "submitedBy", alias = "submittedBy")]
    pub submitted_by: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub voted_up_by: serde_json::Value,
    #[serde(default)]
    pub voted_down_by: serde_json::Value,
}

impl Project {
    /// Project shared by every track of an imported playlist.
    pub fn for_playlist(
        name: impl Into<String>,
        submitted_by: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Project {
            name: name.into(),
            votes: 0,
            submitted_by: submitted_by.into(),
            author: owner.into(),
            voted_up_by: serde_json::Value::String(String::new()),
            voted_down_by: serde_json::Value::String(String::new()),
        }
    }
}

/// Submitter's refresh credential, carried opaquely to the consumer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(token: impl Into<String>) -> Self {
        CredentialRef(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialRef(***)")
    }
}

/// Key of a song record in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(pub String);

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Data a consumer needs to play one song on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub title: String,
    pub project: String,
    #[serde(rename = "time")]
    pub time_ms: u64,
    pub uri: String,
    pub refresh_token: CredentialRef,
    pub device: String,
    pub key: StoreKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub topic: String,
    pub priority: Priority,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub topic: String,
    pub priority: Priority,
    pub payload: JobPayload,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "song_job_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Processing,
    Completed,
    Failed,
}
