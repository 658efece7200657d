use crate::queue::JobQueue;
use crate::Job;
use anyhow::Error;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Hands a claimed job to whatever drives the output device.
///
/// Delivery is at-least-once, so the same job id may arrive more than once.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn play(&self, job: &Job) -> Result<(), Error>;
}

/// Sink that only records what would have been played.
pub struct LogSink;

#[async_trait]
impl PlaybackSink for LogSink {
    async fn play(&self, job: &Job) -> Result<(), Error> {
        info!(
            message = "Dispatching song",
            title = %job.payload.title,
            uri = %job.payload.uri,
            device = %job.payload.device
        );
        Ok(())
    }
}

/// Consumes `topic` in priority order until cancelled.
pub async fn start(
    cancel_token: CancellationToken,
    queue: Arc<dyn JobQueue>,
    topic: String,
    sink: Arc<dyn PlaybackSink>,
    poll_interval: Duration,
) {
    loop {
        if cancel_token.is_cancelled() {
            debug!("Worker Cancelled");
            break;
        }

        let job = match queue.dequeue(&topic).await {
            Ok(job) => job,
            Err(err) => {
                error!(message = "Error claiming job", topic = %topic, error = ?err);
                None
            }
        };

        let Some(job) = job else {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                    break;
                },
                _ = sleep(poll_interval) => {}
            }
            continue;
        };

        let job_id = job.id;
        let result = match process(&*sink, &job).await {
            Ok(()) => queue.complete(job_id).await,
            Err(err) => queue.fail(job_id, &err.to_string()).await,
        };
        if let Err(err) = result {
            error!(message = "Failed to record job result", job_id = %job_id, error = ?err);
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip(sink, job), fields(job_id = %job.id, priority = %job.priority))]
async fn process(sink: &dyn PlaybackSink, job: &Job) -> Result<(), Error> {
    sink.play(job).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryJobQueue;
    use crate::{CredentialRef, JobPayload, JobRequest, Priority, Status, StoreKey};
    use anyhow::anyhow;
    use tokio::sync::mpsc;

    struct ChannelSink {
        played: mpsc::UnboundedSender<String>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl PlaybackSink for ChannelSink {
        async fn play(&self, job: &Job) -> Result<(), Error> {
            self.played.send(job.payload.title.clone())?;
            if self.fail_on == Some(job.payload.title.as_str()) {
                return Err(anyhow!("device offline"));
            }
            Ok(())
        }
    }

    fn request(title: &str, priority: i64) -> JobRequest {
        JobRequest {
            topic: "mix".into(),
            priority: Priority(priority),
            payload: JobPayload {
                title: title.into(),
                project: "mix".into(),
                time_ms: 1,
                uri: "spotify:track:x".into(),
                refresh_token: CredentialRef::new("r"),
                device: "d".into(),
                key: StoreKey(title.into()),
                source_id: None,
            },
        }
    }

    #[tokio::test]
    async fn plays_in_priority_order_and_records_results() {
        let queue = Arc::new(MemoryJobQueue::new());
        let ok = queue.enqueue(&request("quiet", 0)).await.unwrap();
        let broken = queue.enqueue(&request("loud", 9)).await.unwrap();

        let (played, mut recv_played) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink {
            played,
            fail_on: Some("loud"),
        });
        let cancel_token = CancellationToken::new();
        let worker = tokio::spawn(start(
            cancel_token.clone(),
            queue.clone(),
            "mix".into(),
            sink,
            Duration::from_millis(5),
        ));

        assert_eq!(recv_played.recv().await.unwrap(), "loud");
        assert_eq!(recv_played.recv().await.unwrap(), "quiet");

        // Let the worker record the second result before stopping it.
        while queue.get(ok).await.unwrap().status != Status::Completed {
            sleep(Duration::from_millis(5)).await;
        }
        cancel_token.cancel();
        worker.await.unwrap();

        assert_eq!(queue.get(broken).await.unwrap().status, Status::Failed);
    }

    #[tokio::test]
    async fn idle_worker_stops_on_cancel() {
        let queue = Arc::new(MemoryJobQueue::new());
        let cancel_token = CancellationToken::new();
        let worker = tokio::spawn(start(
            cancel_token.clone(),
            queue,
            "empty".into(),
            Arc::new(LogSink),
            Duration::from_secs(60),
        ));

        cancel_token.cancel();
        worker.await.unwrap();
    }
}
