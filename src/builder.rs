//! Turns a raw track plus its project context into an enqueueable job.
//!
//! Building is pure: nothing here touches the queue or the store. The store
//! key is attached afterwards with [`JobDraft::into_request`], so a job can
//! only reach the queue once its store record exists.

use crate::error::ValidationError;
use crate::{CredentialRef, JobPayload, JobRequest, Priority, Project, StoreKey, Track};
use serde::Serialize;
use serde_json::json;

/// A validated job that has not been assigned a store key yet.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDraft {
    pub priority: Priority,
    pub project: Project,
    pub track: Track,
    uri: String,
    time_ms: u64,
    device: String,
    credential: CredentialRef,
}

#[derive(Serialize)]
struct SongRecord<'a> {
    #[serde(flatten)]
    track: &'a Track,
    project: &'a Project,
}

impl JobDraft {
    pub fn topic(&self) -> &str {
        &self.project.name
    }

    pub fn title(&self) -> &str {
        &self.track.name
    }

    /// Record stored under `projects/{project}/Songs/{key}`.
    pub fn store_record(&self) -> serde_json::Value {
        json!({
            "song": SongRecord {
                track: &self.track,
                project: &self.project,
            }
        })
    }

    pub fn into_request(self, key: StoreKey) -> JobRequest {
        let topic = self.project.name;
        JobRequest {
            topic: topic.clone(),
            priority: self.priority,
            payload: JobPayload {
                title: self.track.name,
                project: topic,
                time_ms: self.time_ms,
                uri: self.uri,
                refresh_token: self.credential,
                device: self.device,
                key,
                source_id: self.track.id,
            },
        }
    }
}

/// A project name must be non-empty and usable as a single store path segment.
pub fn check_project_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::MissingField("project name"));
    }
    if name.contains('/') {
        return Err(ValidationError::InvalidProjectName(name.to_string()));
    }
    Ok(())
}

pub fn build(
    track: Option<&Track>,
    project: Option<&Project>,
    device: &str,
    credential: &CredentialRef,
) -> Result<JobDraft, ValidationError> {
    let track = track.ok_or(ValidationError::MissingTrack)?;
    let project = project.ok_or_else(|| ValidationError::MissingProject(track.name.clone()))?;

    check_project_name(&project.name)?;
    if device.is_empty() {
        return Err(ValidationError::MissingField("device"));
    }

    let uri = match track.uri.as_deref() {
        Some(uri) if !uri.is_empty() => uri.to_string(),
        _ => {
            return Err(ValidationError::IncompleteTrack {
                title: track.name.clone(),
                field: "uri",
            })
        }
    };
    let time_ms = track
        .duration_ms
        .ok_or_else(|| ValidationError::IncompleteTrack {
            title: track.name.clone(),
            field: "duration",
        })?;

    Ok(JobDraft {
        priority: Priority::snapshot(project),
        project: project.clone(),
        track: track.clone(),
        uri,
        time_ms,
        device: device.to_string(),
        credential: credential.clone(),
    })
}
