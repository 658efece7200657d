use crate::error::ValidationError;
use crate::orchestrator::{
    Credentials, DeviceList, Orchestrator, PlaylistRequest, PlaylistsRequest, Reply,
    SearchRequest, SongQueueRequest, Submission, SubmissionResponse,
};
use crate::queue::JobQueue;
use crate::worker::{self, PlaybackSink};
use anyhow::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Client operations, tagged by `op`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Command {
    SongQueue(SongQueueRequest),
    SubmitPlaylist(PlaylistRequest),
    Search(SearchRequest),
    UserPlaylist(PlaylistsRequest),
    Devices(Credentials),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SongQueue(_) => "song-queue",
            Command::SubmitPlaylist(_) => "submit-playlist",
            Command::Search(_) => "search",
            Command::UserPlaylist(_) => "user-playlist",
            Command::Devices(_) => "devices",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Submission(SubmissionResponse),
    Catalog(Reply<Value>),
    Devices(Reply<DeviceList>),
}

/// A command plus the channel its single response goes back on.
#[derive(Debug)]
pub struct Envelope {
    pub command: Command,
    pub reply: oneshot::Sender<Response>,
}

impl Envelope {
    pub fn new(command: Command) -> (Self, oneshot::Receiver<Response>) {
        let (reply, recv_reply) = oneshot::channel();
        (Envelope { command, reply }, recv_reply)
    }
}

/// Consumers started next to the command loop, one per topic.
pub struct Consumers {
    pub queue: Arc<dyn JobQueue>,
    pub sink: Arc<dyn PlaybackSink>,
    pub topics: Vec<String>,
    pub poll_interval: Duration,
}

/// Answers a command. Submissions are answered as soon as their response is
/// known; their track work is left running.
pub async fn handle(orchestrator: &Orchestrator, command: Command) -> Response {
    match command {
        Command::SongQueue(request) => {
            let (response, _) = submission(orchestrator.submit_songs(request).await);
            Response::Submission(response)
        }
        Command::SubmitPlaylist(request) => {
            let (response, _) = submission(orchestrator.submit_playlist(request).await);
            Response::Submission(response)
        }
        Command::Search(request) => Response::Catalog(orchestrator.search(request).await),
        Command::UserPlaylist(request) => {
            Response::Catalog(orchestrator.list_playlists(request).await)
        }
        Command::Devices(credentials) => {
            Response::Devices(orchestrator.list_devices(credentials).await)
        }
    }
}

fn submission(
    result: Result<Submission, ValidationError>,
) -> (SubmissionResponse, Option<Submission>) {
    match result {
        Ok(submission) => (submission.response.clone(), Some(submission)),
        Err(err) => {
            warn!(message = "Rejected request", error = %err);
            let msg = err.to_string();
            (SubmissionResponse::Failed { msg }, None)
        }
    }
}

/// Answers an envelope, then waits for the tracks of a submission so that
/// nothing accepted is still in flight once the request task ends.
async fn respond(orchestrator: &Orchestrator, envelope: Envelope) {
    let (response, pending) = match envelope.command {
        Command::SongQueue(request) => {
            let (response, pending) = submission(orchestrator.submit_songs(request).await);
            (Response::Submission(response), pending)
        }
        Command::SubmitPlaylist(request) => {
            let (response, pending) = submission(orchestrator.submit_playlist(request).await);
            (Response::Submission(response), pending)
        }
        command => (handle(orchestrator, command).await, None),
    };

    if envelope.reply.send(response).is_err() {
        warn!("Client went away before the response");
    }

    if let Some(pending) = pending {
        for outcome in pending.completion().await {
            if let Some(error) = outcome.error {
                debug!(
                    message = "Track finished with error",
                    title = %outcome.title,
                    error = %error
                );
            }
        }
    }
}

fn spawn_request(requests: &mut JoinSet<()>, orchestrator: &Orchestrator, envelope: Envelope) {
    let span = info_span!("request", op = envelope.command.name());
    let orchestrator = orchestrator.clone();
    requests.spawn(async move { respond(&orchestrator, envelope).await }.instrument(span));
}

pub async fn serve(
    cancel_token: CancellationToken,
    orchestrator: Orchestrator,
    consumers: Consumers,
    mut recv_from_client: mpsc::UnboundedReceiver<Envelope>,
) -> Result<(), Error> {
    // Jobs claimed before a crash go back to the queue (at-least-once delivery)
    let requeued = consumers.queue.requeue_processing().await?;
    if requeued > 0 {
        info!("Requeued {} interrupted jobs", requeued);
    }

    let mut workers = vec![];
    for topic in consumers.topics {
        let cancel_token = cancel_token.clone();
        let queue = consumers.queue.clone();
        let sink = consumers.sink.clone();
        let span = info_span!("worker", topic = %topic);
        let join_handle = tokio::spawn(
            worker::start(cancel_token, queue, topic, sink, consumers.poll_interval)
                .instrument(span),
        );
        workers.push(join_handle);
    }

    let mut requests = JoinSet::new();
    let mut clients_open = true;

    loop {
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Reap finished requests
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(err) = joined {
                    error!(message = "Request task failed", error = ?err);
                }
            },
            // Handle requests from clients
            chan_msg = recv_from_client.recv(), if clients_open => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed");
                        clients_open = false;
                        // Consumers keep running until cancelled.
                        if workers.is_empty() {
                            break;
                        }
                    },
                    Some(envelope) => spawn_request(&mut requests, &orchestrator, envelope),
                }
            }
        }
    }

    // Requests already sent are still answered
    recv_from_client.close();
    while let Some(envelope) = recv_from_client.recv().await {
        spawn_request(&mut requests, &orchestrator, envelope);
    }

    // Every accepted request still gets its response
    while let Some(joined) = requests.join_next().await {
        if let Err(err) = joined {
            error!(message = "Request task failed", error = ?err);
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}
