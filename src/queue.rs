//! Topic-partitioned priority queue of song jobs.
//!
//! Within one topic, jobs with a higher priority are claimed first and jobs of
//! equal priority are claimed in enqueue order. Topics never affect each other.
//! Delivery is at-least-once: a job claimed by a consumer that dies before
//! completing it goes back to the queue on the next [`JobQueue::requeue_processing`].

use crate::error::QueueError;
use crate::{Job, JobId, JobRequest, Priority, Status};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persists a job and returns its freshly assigned id. Never retries.
    async fn enqueue(&self, request: &JobRequest) -> Result<JobId, QueueError>;

    /// Claims the next queued job of `topic`, marking it as processing.
    async fn dequeue(&self, topic: &str) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, id: JobId) -> Result<(), QueueError>;

    async fn fail(&self, id: JobId, message: &str) -> Result<(), QueueError>;

    /// Puts every processing job back in the queue. Returns how many were moved.
    async fn requeue_processing(&self) -> Result<u64, QueueError>;

    /// Queued jobs of `topic` in the order they would be claimed.
    async fn pending(&self, topic: &str) -> Result<Vec<Job>, QueueError>;
}

type Slot = (Reverse<Priority>, JobId);

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    jobs: HashMap<JobId, Job>,
    topics: HashMap<String, BTreeSet<Slot>>,
}

impl MemoryState {
    fn schedule(&mut self, job: &Job) {
        self.topics
            .entry(job.topic.clone())
            .or_default()
            .insert((Reverse(job.priority), job.id));
    }

    fn finish(&mut self, id: JobId, status: Status) -> Result<(), QueueError> {
        let job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = status;
        Ok(())
    }
}

/// Process-local queue. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.state.lock().await.jobs.get(&id).cloned()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: &JobRequest) -> Result<JobId, QueueError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let job = Job {
            id: JobId(state.next_id),
            topic: request.topic.clone(),
            priority: request.priority,
            payload: request.payload.clone(),
            status: Status::Queued,
            created_at: Utc::now(),
        };
        state.schedule(&job);
        let id = job.id;
        state.jobs.insert(id, job);
        debug!(message = "Queued job", job_id = %id, topic = %request.topic, priority = %request.priority);
        Ok(id)
    }

    async fn dequeue(&self, topic: &str) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().await;
        let Some((_, id)) = state.topics.get_mut(topic).and_then(BTreeSet::pop_first) else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = Status::Processing;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        self.state.lock().await.finish(id, Status::Completed)
    }

    async fn fail(&self, id: JobId, message: &str) -> Result<(), QueueError> {
        debug!(message = "Job failed", job_id = %id, error = %message);
        self.state.lock().await.finish(id, Status::Failed)
    }

    async fn requeue_processing(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let mut requeued = vec![];
        for job in state.jobs.values_mut() {
            if job.status == Status::Processing {
                job.status = Status::Queued;
                requeued.push(job.clone());
            }
        }
        for job in &requeued {
            state.schedule(job);
        }
        Ok(requeued.len() as u64)
    }

    async fn pending(&self, topic: &str) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|(_, id)| state.jobs.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CredentialRef, JobPayload, StoreKey};

    fn request(topic: &str, title: &str, priority: i64) -> JobRequest {
        JobRequest {
            topic: topic.into(),
            priority: Priority(priority),
            payload: JobPayload {
                title: title.into(),
                project: topic.into(),
                time_ms: 1000,
                uri: format!("spotify:track:{}", title),
                refresh_token: CredentialRef::new("r"),
                device: "d".into(),
                key: StoreKey(title.into()),
                source_id: None,
            },
        }
    }

    async fn drain(queue: &MemoryJobQueue, topic: &str) -> Vec<String> {
        let mut titles = vec![];
        while let Some(job) = queue.dequeue(topic).await.unwrap() {
            titles.push(job.payload.title);
        }
        titles
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let queue = MemoryJobQueue::new();
        let first = queue.enqueue(&request("a", "1", 0)).await.unwrap();
        let second = queue.enqueue(&request("b", "2", 0)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn higher_priority_first_then_fifo() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&request("mix", "low", 1)).await.unwrap();
        queue.enqueue(&request("mix", "high-a", 7)).await.unwrap();
        queue.enqueue(&request("mix", "mid", 3)).await.unwrap();
        queue.enqueue(&request("mix", "high-b", 7)).await.unwrap();

        assert_eq!(
            drain(&queue, "mix").await,
            vec!["high-a", "high-b", "mid", "low"]
        );
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&request("a", "a1", 0)).await.unwrap();
        queue.enqueue(&request("b", "b1", 100)).await.unwrap();

        assert_eq!(drain(&queue, "a").await, vec!["a1"]);
        assert_eq!(drain(&queue, "b").await, vec!["b1"]);
        assert!(queue.dequeue("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_jobs_are_redelivered_after_requeue() {
        let queue = MemoryJobQueue::new();
        let id = queue.enqueue(&request("mix", "1", 0)).await.unwrap();

        let claimed = queue.dequeue("mix").await.unwrap().unwrap();
        assert_eq!(claimed.status, Status::Processing);
        assert!(queue.dequeue("mix").await.unwrap().is_none());

        assert_eq!(queue.requeue_processing().await.unwrap(), 1);
        let again = queue.dequeue("mix").await.unwrap().unwrap();
        assert_eq!(again.id, id);
    }

    #[tokio::test]
    async fn completion_and_failure_are_terminal() {
        let queue = MemoryJobQueue::new();
        let done = queue.enqueue(&request("mix", "1", 0)).await.unwrap();
        let broken = queue.enqueue(&request("mix", "2", 0)).await.unwrap();
        queue.dequeue("mix").await.unwrap();
        queue.dequeue("mix").await.unwrap();

        queue.complete(done).await.unwrap();
        queue.fail(broken, "device offline").await.unwrap();

        assert_eq!(queue.get(done).await.unwrap().status, Status::Completed);
        assert_eq!(queue.get(broken).await.unwrap().status, Status::Failed);
        assert_eq!(queue.requeue_processing().await.unwrap(), 0);
        assert!(matches!(
            queue.complete(JobId(99)).await,
            Err(QueueError::NotFound(JobId(99)))
        ));
    }

    #[tokio::test]
    async fn pending_lists_claim_order() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&request("mix", "a", 0)).await.unwrap();
        queue.enqueue(&request("mix", "b", 2)).await.unwrap();

        let titles: Vec<_> = queue
            .pending("mix")
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.payload.title)
            .collect();
        assert_eq!(titles, vec!["b", "a"]);
    }
}
