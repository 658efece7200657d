use thiserror::Error;

/// Missing or unusable request input. Raised before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} undefined")]
    MissingField(&'static str),

    #[error("track is missing")]
    MissingTrack,

    #[error("project is missing for track {0:?}")]
    MissingProject(String),

    #[error("track {title:?} has no {field}")]
    IncompleteTrack { title: String, field: &'static str },

    #[error("no songs to queue")]
    NoSongs,

    /// Project names become store path segments.
    #[error("project name {0:?} must not contain '/'")]
    InvalidProjectName(String),
}

/// Failure of a call to the remote catalog or token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteCallError {
    /// The body was not JSON, or not the JSON shape we asked for.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The body was an explicit error object. Displays the embedded message only.
    #[error("{message}")]
    Api {
        status: Option<u16>,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for RemoteCallError {
    fn from(err: reqwest::Error) -> Self {
        RemoteCallError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job {0} not found")]
    NotFound(crate::JobId),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Failure to write a job id back onto its store record.
#[derive(Debug, Error)]
pub enum StoreLinkError {
    #[error("store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh_token undefined")]
    MissingRefreshToken,

    #[error(transparent)]
    Remote(#[from] RemoteCallError),

    #[error("could not persist refreshed token: {0}")]
    Store(#[from] StoreLinkError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),

    #[error("connection url has no host")]
    MissingHost,

    #[error("unsupported connection scheme {0:?}")]
    UnsupportedScheme(String),
}
