//! Fakes shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use songq::catalog::{CatalogClient, Device};
use songq::error::{QueueError, RefreshError, RemoteCallError, StoreLinkError};
use songq::orchestrator::Orchestrator;
use songq::queue::{JobQueue, MemoryJobQueue};
use songq::refresh::{AccessToken, RefreshCoordinator, RefreshOutcome, TokenRefresher};
use songq::store::{MemoryStore, MetadataStore};
use songq::{Job, JobId, JobRequest, Project, StoreKey, Track};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn track(name: &str) -> Track {
    Track {
        name: name.into(),
        uri: Some(format!("spotify:track:{}", name)),
        duration_ms: Some(180_000),
        id: Some(name.into()),
    }
}

pub fn project(name: &str, votes: i64) -> Project {
    Project {
        name: name.into(),
        votes,
        submitted_by: "bob".into(),
        author: "bob".into(),
        ..Default::default()
    }
}

pub fn song(name: &str, project: &Project) -> Value {
    json!({
        "name": name,
        "uri": format!("spotify:track:{}", name),
        "duration_ms": 180000,
        "project": project,
    })
}

/// Catalog answering every call from canned results.
pub struct FakeCatalog {
    pub tracks: Result<Vec<Track>, RemoteCallError>,
    pub devices: Result<Vec<Device>, RemoteCallError>,
    pub search: Result<Value, RemoteCallError>,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        FakeCatalog {
            tracks: Ok(vec![]),
            devices: Ok(vec![]),
            search: Ok(json!({"tracks": {"items": []}})),
        }
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn search(&self, _query: &str, _access_token: &str) -> Result<Value, RemoteCallError> {
        self.search.clone()
    }

    async fn list_playlists(
        &self,
        user: &str,
        _access_token: &str,
    ) -> Result<Value, RemoteCallError> {
        Ok(json!({"items": [{"name": format!("{}'s mix", user)}]}))
    }

    async fn fetch_playlist_tracks(
        &self,
        _user: &str,
        _playlist_id: &str,
        _access_token: &str,
    ) -> Result<Vec<Track>, RemoteCallError> {
        self.tracks.clone()
    }

    async fn list_devices(&self, _access_token: &str) -> Result<Vec<Device>, RemoteCallError> {
        self.devices.clone()
    }
}

/// Refresher that always succeeds and remembers who asked.
pub struct RecordingRefresher {
    calls: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl TokenRefresher for RecordingRefresher {
    async fn refresh(
        &self,
        refresh_token: &str,
        identity: &str,
    ) -> Result<AccessToken, RefreshError> {
        let _ = self
            .calls
            .send((refresh_token.to_string(), identity.to_string()));
        Ok(AccessToken {
            token: "fresh".into(),
            expires_in: Some(3600),
        })
    }
}

/// Store whose `set_field` waits for a permit before writing.
pub struct GatedStore {
    pub inner: MemoryStore,
    pub gate: Semaphore,
}

impl GatedStore {
    pub fn closed() -> Self {
        GatedStore {
            inner: MemoryStore::new(),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl MetadataStore for GatedStore {
    fn create_key(&self, project: &str, record: Value) -> StoreKey {
        self.inner.create_key(project, record)
    }

    async fn set_field(&self, path: &str, value: Value) -> Result<(), StoreLinkError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| StoreLinkError::Unavailable(err.to_string()))?;
        self.inner.set_field(path, value).await
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreLinkError> {
        self.inner.get(path).await
    }
}

/// Store that accepts new records but refuses every field update.
#[derive(Default)]
pub struct BrokenLinkStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl MetadataStore for BrokenLinkStore {
    fn create_key(&self, project: &str, record: Value) -> StoreKey {
        self.inner.create_key(project, record)
    }

    async fn set_field(&self, _path: &str, _value: Value) -> Result<(), StoreLinkError> {
        Err(StoreLinkError::Unavailable("connection reset".into()))
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreLinkError> {
        self.inner.get(path).await
    }
}

/// Queue that refuses jobs with one particular title.
pub struct PickyQueue {
    pub inner: MemoryJobQueue,
    pub refuse: &'static str,
}

#[async_trait]
impl JobQueue for PickyQueue {
    async fn enqueue(&self, request: &JobRequest) -> Result<JobId, QueueError> {
        if request.payload.title == self.refuse {
            return Err(QueueError::Unavailable("queue is full".into()));
        }
        self.inner.enqueue(request).await
    }

    async fn dequeue(&self, topic: &str) -> Result<Option<Job>, QueueError> {
        self.inner.dequeue(topic).await
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        self.inner.complete(id).await
    }

    async fn fail(&self, id: JobId, message: &str) -> Result<(), QueueError> {
        self.inner.fail(id, message).await
    }

    async fn requeue_processing(&self) -> Result<u64, QueueError> {
        self.inner.requeue_processing().await
    }

    async fn pending(&self, topic: &str) -> Result<Vec<Job>, QueueError> {
        self.inner.pending(topic).await
    }
}

/// A running refresh coordinator plus everything a test needs to observe it.
pub struct Refreshes {
    pub coordinator: RefreshCoordinator,
    pub calls: UnboundedReceiver<(String, String)>,
    pub outcomes: UnboundedReceiver<RefreshOutcome>,
    cancel_token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Refreshes {
    pub fn start() -> Self {
        let (send_call, calls) = mpsc::unbounded_channel();
        let (send_outcome, outcomes) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let (coordinator, workers) = RefreshCoordinator::spawn_with_observer(
            cancel_token.clone(),
            Arc::new(RecordingRefresher { calls: send_call }),
            1,
            send_outcome,
        );
        Refreshes {
            coordinator,
            calls,
            outcomes,
            cancel_token,
            workers,
        }
    }

    pub async fn stop(self) {
        self.cancel_token.cancel();
        futures::future::join_all(self.workers).await;
    }
}

pub fn orchestrator(
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn MetadataStore>,
    catalog: FakeCatalog,
    refreshes: &Refreshes,
) -> Orchestrator {
    Orchestrator::new(
        queue,
        store,
        Arc::new(catalog),
        refreshes.coordinator.clone(),
    )
}
