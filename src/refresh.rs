//! Best-effort background renewal of expired access credentials.
//!
//! A request whose remote call failed hands the submitter's refresh credential
//! to [`RefreshCoordinator::refresh`] and answers its caller right away. The
//! renewal runs on a pool of refresh workers; outcomes flow into a channel that
//! only the logging task reads.

use crate::catalog::classify;
use crate::error::RefreshError;
use crate::store::{access_token_path, MetadataStore};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Option<u64>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"***")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str, identity: &str)
        -> Result<AccessToken, RefreshError>;
}

/// Which remote call tripped the refresh. Only used to label log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPath {
    Devices,
    Api,
}

impl RefreshPath {
    pub fn from_device_call(is_device_call: bool) -> Self {
        if is_device_call {
            RefreshPath::Devices
        } else {
            RefreshPath::Api
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshPath::Devices => "devices",
            RefreshPath::Api => "api",
        }
    }
}

#[derive(Debug)]
struct RefreshRequest {
    refresh_token: String,
    identity: String,
    path: RefreshPath,
}

#[derive(Debug)]
pub struct RefreshOutcome {
    pub identity: String,
    pub path: RefreshPath,
    pub result: Result<(), RefreshError>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    sender: Sender<RefreshRequest>,
}

impl RefreshCoordinator {
    /// Starts `workers` refresh workers plus the task logging their outcomes.
    ///
    /// The returned handle resolves once the workers have stopped (on
    /// cancellation) and every outcome has been logged.
    pub fn spawn(
        cancel_token: CancellationToken,
        refresher: Arc<dyn TokenRefresher>,
        workers: u16,
    ) -> (Self, JoinHandle<()>) {
        let (send_outcome, recv_outcome) = mpsc::unbounded_channel();
        let observer = tokio::spawn(log_outcomes(recv_outcome).instrument(info_span!("refresh_log")));
        let (coordinator, workers) =
            Self::spawn_with_observer(cancel_token, refresher, workers, send_outcome);

        let handle = tokio::spawn(async move {
            futures::future::join_all(workers).await;
            if let Err(err) = observer.await {
                error!(message = "Refresh log task failed", error = ?err);
            }
        });
        (coordinator, handle)
    }

    /// Like [`RefreshCoordinator::spawn`], but outcomes go to `send_outcome`
    /// and the caller joins the worker handles itself.
    pub fn spawn_with_observer(
        cancel_token: CancellationToken,
        refresher: Arc<dyn TokenRefresher>,
        workers: u16,
        send_outcome: UnboundedSender<RefreshOutcome>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = async_channel::unbounded();

        let handles = (0..workers.max(1))
            .map(|_| {
                tokio::spawn(
                    run_worker(
                        cancel_token.clone(),
                        receiver.clone(),
                        refresher.clone(),
                        send_outcome.clone(),
                    )
                    .instrument(info_span!("refresh_worker")),
                )
            })
            .collect();

        (RefreshCoordinator { sender }, handles)
    }

    /// Schedules a refresh and returns immediately. Never fails: a refresh
    /// that cannot even be scheduled is logged and dropped.
    pub fn refresh(&self, refresh_token: &str, identity: &str, is_device_call: bool) {
        let path = RefreshPath::from_device_call(is_device_call);
        debug!(message = "Scheduling credential refresh", identity = %identity, path = path.as_str());
        let request = RefreshRequest {
            refresh_token: refresh_token.to_string(),
            identity: identity.to_string(),
            path,
        };
        if let Err(err) = self.sender.try_send(request) {
            warn!(message = "Dropping credential refresh", identity = %identity, error = %err);
        }
    }
}

async fn run_worker(
    cancel_token: CancellationToken,
    recv_request: Receiver<RefreshRequest>,
    refresher: Arc<dyn TokenRefresher>,
    send_outcome: UnboundedSender<RefreshOutcome>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Refresh worker cancelled");
                break;
            },
            request = recv_request.recv() => {
                match request {
                    Err(_) => {
                        debug!("Refresh queue closed, exiting");
                        break;
                    },
                    Ok(request) => {
                        let result = refresher
                            .refresh(&request.refresh_token, &request.identity)
                            .await
                            .map(|_| ());
                        let outcome = RefreshOutcome {
                            identity: request.identity,
                            path: request.path,
                            result,
                            finished_at: Utc::now(),
                        };
                        if send_outcome.send(outcome).is_err() {
                            warn!("Refresh outcome dropped, observer is gone");
                        }
                    }
                }
            }
        }
    }
    debug!("Refresh worker stopped.");
}

async fn log_outcomes(mut recv_outcome: UnboundedReceiver<RefreshOutcome>) {
    while let Some(outcome) = recv_outcome.recv().await {
        match &outcome.result {
            Ok(()) => info!(
                message = "Refreshed credential",
                identity = %outcome.identity,
                path = outcome.path.as_str(),
                finished_at = %outcome.finished_at
            ),
            Err(err) => error!(
                message = "Credential refresh failed",
                identity = %outcome.identity,
                path = outcome.path.as_str(),
                error = %err
            ),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Exchanges refresh tokens at the Spotify accounts service and stores the
/// new access token under `users/{identity}/access_token`.
pub struct SpotifyTokenRefresher {
    client: Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    store: Arc<dyn MetadataStore>,
}

impl SpotifyTokenRefresher {
    pub fn new(
        client: Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: TOKEN_URL.to_string(),
            store,
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }
}

#[async_trait]
impl TokenRefresher for SpotifyTokenRefresher {
    #[instrument(skip(self, refresh_token))]
    async fn refresh(
        &self,
        refresh_token: &str,
        identity: &str,
    ) -> Result<AccessToken, RefreshError> {
        if refresh_token.is_empty() {
            return Err(RefreshError::MissingRefreshToken);
        }

        let body = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(crate::error::RemoteCallError::from)?
            .text()
            .await
            .map_err(crate::error::RemoteCallError::from)?;
        let response: TokenResponse = classify(&body)?;

        self.store
            .set_field(&access_token_path(identity), json!(response.access_token))
            .await?;

        Ok(AccessToken {
            token: response.access_token,
            expires_in: response.expires_in,
        })
    }
}
