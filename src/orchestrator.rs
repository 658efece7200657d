//! Song submission protocol.
//!
//! A request moves through `received → validated`, then every track is
//! independently `built → enqueued → linked`, and the request is answered.
//! Request-level validation failures reject everything before any I/O.
//! Failures of a single track are logged and reported once in the response
//! while its siblings carry on. Remote catalog failures trigger a speculative
//! credential refresh that the request never waits for.

use crate::builder::{self, JobDraft};
use crate::catalog::{CatalogClient, Device};
use crate::config::AckMode;
use crate::error::{RemoteCallError, ValidationError};
use crate::queue::JobQueue;
use crate::refresh::RefreshCoordinator;
use crate::store::{self, MetadataStore};
use crate::{CredentialRef, JobId, JobRequest, Project, Track};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::*;

pub const NO_DEVICES: &str = "no devices";

/// Caller credentials sent along with every request.
#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Identity of the caller, used to file refreshed tokens.
    pub name: Option<String>,
}

impl Credentials {
    fn refresh_token(&self) -> &str {
        self.refresh_token.as_deref().unwrap_or_default()
    }

    fn identity(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("name", &self.name)
            .finish()
    }
}

/// One song of a direct submission, annotated with its project.
#[derive(Debug, Clone, Deserialize)]
pub struct SongSubmission {
    #[serde(flatten)]
    pub track: Track,
    #[serde(default)]
    pub project: Option<Project>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SongQueueRequest {
    #[serde(default)]
    pub songs: Vec<SongSubmission>,
    pub device: Option<String>,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaylistRequest {
    /// Owner of the playlist.
    pub user: Option<String>,
    #[serde(rename = "id")]
    pub playlist_id: Option<String>,
    #[serde(rename = "submitedBy", alias = "submittedBy")]
    pub submitted_by: Option<String>,
    #[serde(rename = "projectname")]
    pub project_name: Option<String>,
    pub device: Option<String>,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub search: String,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaylistsRequest {
    pub user: Option<String>,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionResponse {
    Accepted { queued: usize },
    /// Some tracks could not be queued; `msg` holds the first error.
    Partial { queued: usize, msg: String },
    Failed { msg: String },
}

/// Answer of a remote pass-through: the payload, or a message for the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Payload(T),
    Message { msg: String },
}

impl<T> Reply<T> {
    fn message(msg: impl Into<String>) -> Self {
        Reply::Message { msg: msg.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceList {
    pub devices: Vec<Device>,
}

/// Furthest point a track reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Built,
    Enqueued,
    Linked,
}

#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub title: String,
    pub topic: String,
    pub job_id: Option<JobId>,
    pub state: TrackState,
    pub error: Option<String>,
}

/// An answered submission whose per-track work may still be running.
#[derive(Debug)]
pub struct Submission {
    pub response: SubmissionResponse,
    tracks: Vec<JoinHandle<TrackOutcome>>,
}

impl Submission {
    fn failed(msg: String) -> Self {
        Submission {
            response: SubmissionResponse::Failed { msg },
            tracks: vec![],
        }
    }

    /// Waits for every track to be enqueued and linked.
    pub async fn completion(self) -> Vec<TrackOutcome> {
        let mut outcomes = Vec::with_capacity(self.tracks.len());
        for joined in futures::future::join_all(self.tracks).await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => error!(message = "Track task failed", error = ?err),
            }
        }
        outcomes
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, ValidationError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or(ValidationError::MissingField(field))
}

#[derive(Clone)]
pub struct Orchestrator {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn MetadataStore>,
    catalog: Arc<dyn CatalogClient>,
    refresher: RefreshCoordinator,
    ack_mode: AckMode,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn MetadataStore>,
        catalog: Arc<dyn CatalogClient>,
        refresher: RefreshCoordinator,
    ) -> Self {
        Self {
            queue,
            store,
            catalog,
            refresher,
            ack_mode: AckMode::default(),
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Queues every song of the request under its own project.
    #[instrument(skip_all, fields(songs = request.songs.len()))]
    pub async fn submit_songs(
        &self,
        request: SongQueueRequest,
    ) -> Result<Submission, ValidationError> {
        let device = required(request.device.as_deref(), "device")?;
        let credential = CredentialRef::new(required(
            request.credentials.refresh_token.as_deref(),
            "refresh_token",
        )?);
        if request.songs.is_empty() {
            return Err(ValidationError::NoSongs);
        }

        let drafts = request
            .songs
            .iter()
            .map(|song| {
                builder::build(Some(&song.track), song.project.as_ref(), device, &credential)
            })
            .collect();

        Ok(self.dispatch(drafts).await)
    }

    /// Imports a remote playlist into a fresh project and queues its tracks.
    #[instrument(skip_all, fields(playlist = ?request.playlist_id, project = ?request.project_name))]
    pub async fn submit_playlist(
        &self,
        request: PlaylistRequest,
    ) -> Result<Submission, ValidationError> {
        let credentials = &request.credentials;
        let access_token = required(credentials.access_token.as_deref(), "access_token")?;
        let refresh_token = required(credentials.refresh_token.as_deref(), "refresh_token")?;
        let owner = required(request.user.as_deref(), "user")?;
        let playlist_id = required(request.playlist_id.as_deref(), "id")?;
        let project_name = required(request.project_name.as_deref(), "projectname")?;
        builder::check_project_name(project_name)?;
        let device = required(request.device.as_deref(), "device")?;

        let tracks = match self
            .catalog
            .fetch_playlist_tracks(owner, playlist_id, access_token)
            .await
        {
            Ok(tracks) => tracks,
            Err(err) => {
                let msg = self.remote_failure(&err, refresh_token, credentials.identity(), false);
                return Ok(Submission::failed(msg));
            }
        };
        info!("Importing {} tracks into {}", tracks.len(), project_name);

        let project = Project::for_playlist(
            project_name,
            request.submitted_by.as_deref().unwrap_or_default(),
            owner,
        );
        let credential = CredentialRef::new(refresh_token);
        let drafts = tracks
            .iter()
            .map(|track| builder::build(Some(track), Some(&project), device, &credential))
            .collect();

        Ok(self.dispatch(drafts).await)
    }

    #[instrument(skip_all)]
    pub async fn search(&self, request: SearchRequest) -> Reply<Value> {
        info!("Searching for {}", request.search);
        let credentials = &request.credentials;
        let access_token = credentials.access_token.as_deref().unwrap_or_default();

        match self.catalog.search(&request.search, access_token).await {
            Ok(result) => Reply::Payload(result),
            Err(err) => Reply::message(self.remote_failure(
                &err,
                credentials.refresh_token(),
                credentials.identity(),
                false,
            )),
        }
    }

    #[instrument(skip_all, fields(user = ?request.user))]
    pub async fn list_playlists(&self, request: PlaylistsRequest) -> Reply<Value> {
        let user = match required(request.user.as_deref(), "user") {
            Ok(user) => user,
            Err(err) => return Reply::message(err.to_string()),
        };
        let credentials = &request.credentials;
        let access_token = credentials.access_token.as_deref().unwrap_or_default();

        match self.catalog.list_playlists(user, access_token).await {
            Ok(playlists) => Reply::Payload(playlists),
            Err(err) => Reply::message(self.remote_failure(
                &err,
                credentials.refresh_token(),
                credentials.identity(),
                false,
            )),
        }
    }

    #[instrument(skip_all)]
    pub async fn list_devices(&self, credentials: Credentials) -> Reply<DeviceList> {
        let access_token = match required(credentials.access_token.as_deref(), "access_token") {
            Ok(access_token) => access_token,
            Err(err) => return Reply::message(err.to_string()),
        };

        match self.catalog.list_devices(access_token).await {
            Ok(devices) if !devices.is_empty() => Reply::Payload(DeviceList { devices }),
            Ok(_) => {
                warn!("Device list is empty");
                self.refresher
                    .refresh(credentials.refresh_token(), credentials.identity(), true);
                Reply::message(NO_DEVICES)
            }
            Err(err) => Reply::message(self.remote_failure(
                &err,
                credentials.refresh_token(),
                credentials.identity(),
                true,
            )),
        }
    }

    /// Logs a failed remote call, schedules a speculative refresh and returns
    /// the message for the caller.
    fn remote_failure(
        &self,
        err: &RemoteCallError,
        refresh_token: &str,
        identity: &str,
        is_device_call: bool,
    ) -> String {
        error!(message = "Remote call failed", identity = %identity, error = %err);
        self.refresher.refresh(refresh_token, identity, is_device_call);
        err.to_string()
    }

    async fn dispatch(&self, drafts: Vec<Result<JobDraft, ValidationError>>) -> Submission {
        let mut first_error = None;
        let mut acks = vec![];
        let mut tracks = vec![];
        // Each track enqueues only after its predecessor did, so ids follow track order.
        let mut previous_turn: Option<oneshot::Receiver<()>> = None;

        for draft in drafts {
            let draft = match draft {
                Ok(draft) => draft,
                Err(err) => {
                    warn!(message = "Skipping track", error = %err);
                    first_error.get_or_insert_with(|| err.to_string());
                    continue;
                }
            };

            info!("Adding {} to {}", draft.title(), draft.topic());
            let key = self.store.create_key(draft.topic(), draft.store_record());
            let request = draft.into_request(key);
            let span = info_span!(
                "track",
                topic = %request.topic,
                key = %request.payload.key,
                priority = %request.priority
            );
            let (send_ack, recv_ack) = oneshot::channel();
            let (send_turn, recv_turn) = oneshot::channel();
            let turn = Turn {
                wait_for: previous_turn.replace(recv_turn),
                pass_to: send_turn,
            };
            tracks.push(tokio::spawn(
                enqueue_and_link(
                    self.queue.clone(),
                    self.store.clone(),
                    request,
                    turn,
                    send_ack,
                )
                .instrument(span),
            ));
            acks.push(recv_ack);
        }

        let mut queued = tracks.len();
        if self.ack_mode == AckMode::Completed {
            for ack in acks {
                let failure = match ack.await {
                    Ok(Ok(_)) => continue,
                    Ok(Err(msg)) => msg,
                    Err(_) => "enqueue was abandoned".to_string(),
                };
                queued -= 1;
                first_error.get_or_insert(failure);
            }
        }

        let response = match first_error {
            None => SubmissionResponse::Accepted { queued },
            Some(msg) => SubmissionResponse::Partial { queued, msg },
        };
        Submission { response, tracks }
    }
}

/// Position of a track in its submission's enqueue order.
struct Turn {
    wait_for: Option<oneshot::Receiver<()>>,
    pass_to: oneshot::Sender<()>,
}

async fn enqueue_and_link(
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn MetadataStore>,
    request: JobRequest,
    turn: Turn,
    send_ack: oneshot::Sender<Result<JobId, String>>,
) -> TrackOutcome {
    let mut outcome = TrackOutcome {
        title: request.payload.title.clone(),
        topic: request.topic.clone(),
        job_id: None,
        state: TrackState::Built,
        error: None,
    };

    // A predecessor that died still counts as done.
    if let Some(wait_for) = turn.wait_for {
        let _ = wait_for.await;
    }
    let enqueued = queue.enqueue(&request).await;
    let _ = turn.pass_to.send(());

    // The ack receiver is gone when the submission was answered early.
    let id = match enqueued {
        Ok(id) => {
            let _ = send_ack.send(Ok(id));
            id
        }
        Err(err) => {
            error!(message = "Failed to enqueue song", error = %err);
            let msg = err.to_string();
            let _ = send_ack.send(Err(msg.clone()));
            outcome.error = Some(msg);
            return outcome;
        }
    };
    debug!(message = "Enqueued song", job_id = %id);
    outcome.job_id = Some(id);
    outcome.state = TrackState::Enqueued;

    // A failed link leaves the job queued and playable, just not findable by id.
    let path = store::song_id_path(&request.topic, &request.payload.key);
    match store.set_field(&path, json!(id)).await {
        Ok(()) => outcome.state = TrackState::Linked,
        Err(err) => {
            error!(message = "Failed to link job to its song record", job_id = %id, path = %path, error = %err);
            outcome.error = Some(err.to_string());
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn song_submission_reads_track_and_project() {
        let request: SongQueueRequest = serde_json::from_str(
            r#"{
                "songs": [{
                    "name": "Song 2",
                    "uri": "spotify:track:1",
                    "duration_ms": 121000,
                    "album": {"name": "Blur"},
                    "project": {"name": "Friday Mix", "votes": 5}
                }],
                "device": "device-1",
                "refresh_token": "r",
                "name": "bob"
            }"#,
        )
        .unwrap();

        let song = &request.songs[0];
        assert_eq!(song.track.duration_ms, Some(121_000));
        assert_eq!(song.project.as_ref().unwrap().votes, 5);
        assert_eq!(request.credentials.identity(), "bob");
        assert_eq!(request.credentials.refresh_token(), "r");
    }

    #[test]
    fn playlist_request_reads_wire_field_names() {
        let request: PlaylistRequest = serde_json::from_str(
            r#"{"user":"alice","id":"p1","submitedBy":"bob","projectname":"Friday Mix",
                "device":"d","access_token":"a","refresh_token":"r","name":"bob"}"#,
        )
        .unwrap();

        assert_eq!(request.playlist_id.as_deref(), Some("p1"));
        assert_eq!(request.submitted_by.as_deref(), Some("bob"));
        assert_eq!(request.project_name.as_deref(), Some("Friday Mix"));
        assert_eq!(request.credentials.access_token.as_deref(), Some("a"));
    }

    #[test]
    fn responses_serialize_for_clients() {
        assert_eq!(
            serde_json::to_value(SubmissionResponse::Accepted { queued: 3 }).unwrap(),
            json!({"status": "accepted", "queued": 3})
        );
        assert_eq!(
            serde_json::to_value(Reply::<DeviceList>::message("The access token expired"))
                .unwrap(),
            json!({"msg": "The access token expired"})
        );
    }

    #[test]
    fn credentials_debug_hides_tokens() {
        let credentials = Credentials {
            access_token: Some("secret-a".into()),
            refresh_token: Some("secret-r".into()),
            name: Some("bob".into()),
        };
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("bob"));
    }

    #[test]
    fn blank_fields_are_missing() {
        assert_eq!(
            required(Some(""), "device"),
            Err(ValidationError::MissingField("device"))
        );
        assert_eq!(required(Some("d"), "device"), Ok("d"));
    }
}
