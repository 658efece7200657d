//! Client for the remote music catalog (search, playlists, devices).
//!
//! Every response body goes through [`classify`], which separates three
//! outcomes: a body that is not the JSON we expect, a well-formed body
//! carrying an `error` object, and a usable payload.

use crate::error::RemoteCallError;
use crate::Track;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

const API_BASE: &str = "https://api.spotify.com/v1";

const PLAYLIST_PAGE_SIZE: &str = "20";

/// An output device the submitter can play on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Option<String>,
}

#[derive(Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Deserialize)]
struct PlaylistTracks {
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Deserialize)]
struct PlaylistItem {
    track: Option<Track>,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn search(&self, query: &str, access_token: &str) -> Result<Value, RemoteCallError>;

    async fn list_playlists(&self, user: &str, access_token: &str)
        -> Result<Value, RemoteCallError>;

    async fn fetch_playlist_tracks(
        &self,
        user: &str,
        playlist_id: &str,
        access_token: &str,
    ) -> Result<Vec<Track>, RemoteCallError>;

    async fn list_devices(&self, access_token: &str) -> Result<Vec<Device>, RemoteCallError>;
}

/// Parses a remote response body into `T`.
pub fn classify<T: DeserializeOwned>(body: &str) -> Result<T, RemoteCallError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| RemoteCallError::Malformed(err.to_string()))?;

    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        return Err(api_error(error, &value));
    }

    serde_json::from_value(value).map_err(|err| RemoteCallError::Malformed(err.to_string()))
}

fn api_error(error: &Value, body: &Value) -> RemoteCallError {
    match error {
        // OAuth endpoints answer `{"error": "invalid_grant", "error_description": "..."}`
        Value::String(code) => RemoteCallError::Api {
            status: None,
            message: body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or(code)
                .to_string(),
        },
        _ => RemoteCallError::Api {
            status: error
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|status| u16::try_from(status).ok()),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown remote error")
                .to_string(),
        },
    }
}

/// Spotify Web API implementation of [`CatalogClient`].
pub struct SpotifyClient {
    client: Client,
    base_url: String,
}

impl SpotifyClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteCallError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| RemoteCallError::Transport(format!("bad catalog url: {}", err)))?;
        url.path_segments_mut()
            .map_err(|_| RemoteCallError::Transport("catalog url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
        access_token: &str,
    ) -> Result<T, RemoteCallError> {
        debug!(message = "Calling catalog", url = %url);
        let body = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await?
            .text()
            .await?;
        classify(&body)
    }
}

#[async_trait]
impl CatalogClient for SpotifyClient {
    #[instrument(skip(self, access_token))]
    async fn search(&self, query: &str, access_token: &str) -> Result<Value, RemoteCallError> {
        let url = self.endpoint(&["search"])?;
        self.get(url, &[("q", query), ("type", "track")], access_token)
            .await
    }

    #[instrument(skip(self, access_token))]
    async fn list_playlists(
        &self,
        user: &str,
        access_token: &str,
    ) -> Result<Value, RemoteCallError> {
        let url = self.endpoint(&["users", user, "playlists"])?;
        self.get(url, &[("limit", PLAYLIST_PAGE_SIZE)], access_token)
            .await
    }

    #[instrument(skip(self, access_token))]
    async fn fetch_playlist_tracks(
        &self,
        user: &str,
        playlist_id: &str,
        access_token: &str,
    ) -> Result<Vec<Track>, RemoteCallError> {
        let url = self.endpoint(&["users", user, "playlists", playlist_id, "tracks"])?;
        let page: PlaylistTracks = self.get(url, &[], access_token).await?;
        // Removed or local-only entries come back with a null track.
        Ok(page.items.into_iter().filter_map(|item| item.track).collect())
    }

    #[instrument(skip(self, access_token))]
    async fn list_devices(&self, access_token: &str) -> Result<Vec<Device>, RemoteCallError> {
        let url = self.endpoint(&["me", "player", "devices"])?;
        let list: DeviceList = self.get(url, &[], access_token).await?;
        Ok(list.devices)
    }
}
