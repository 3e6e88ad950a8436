//! Job descriptors and the job store facade.
//!
//! The broker never persists job bodies itself. It creates jobs through the
//! [`JobStore`] facade, pushes the `(domain, job_id)` reference onto the
//! shared queue, and resolves references back to jobs when polling. Jobs
//! are uniquely identified by `(domain, job_id)`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No job with this identity exists.
    #[error("job '{job_id}' not found on domain '{domain}'")]
    NotFound { domain: String, job_id: String },

    /// The backing store rejected the operation.
    #[error("job store backend error: {0}")]
    Backend(String),
}

/// Request to enqueue a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Worker type that must execute the job.
    pub worker_type: String,
    /// Domain the job belongs to. Must not contain a `/`.
    pub domain: String,
    /// Whether the job goes to the high-priority lane.
    #[serde(default)]
    pub manual: bool,
    /// Arguments handed to the executor, opaque to the broker.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JobRequest {
    /// Creates a normal-priority request with an empty payload.
    pub fn new(worker_type: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            worker_type: worker_type.into(),
            domain: domain.into(),
            manual: false,
            payload: serde_json::Value::Null,
        }
    }

    /// Marks the request as manual (high-priority lane).
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    /// Sets the executor payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A persisted job, referenced on the queues by `<domain>/<job_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Identifier assigned by the store at creation.
    pub job_id: String,
    /// Domain the job belongs to.
    pub domain: String,
    /// Worker type that must execute the job.
    pub worker_type: String,
    /// Whether the job was enqueued on the high-priority lane.
    pub manual: bool,
    /// Arguments handed to the executor.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When the job was created.
    pub queued_at: DateTime<Utc>,
}

impl Job {
    /// The reference written to the queue list: `<domain>/<job_id>`.
    pub fn queue_payload(&self) -> String {
        format!("{}/{}", self.domain, self.job_id)
    }
}

/// Facade over job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job for the request and assigns its id.
    async fn create(&self, req: &JobRequest) -> Result<Job, StoreError>;

    /// Fetches an existing job.
    async fn get(&self, domain: &str, job_id: &str) -> Result<Job, StoreError>;
}

/// In-process job store backed by a map.
///
/// Serves tests and single-process deployments; multi-process fleets plug
/// in a store over their shared database instead.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<(String, String), Job>>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs ever created.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Returns whether the store holds no job.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, req: &JobRequest) -> Result<Job, StoreError> {
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            domain: req.domain.clone(),
            worker_type: req.worker_type.clone(),
            manual: req.manual,
            payload: req.payload.clone(),
            queued_at: Utc::now(),
        };

        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| StoreError::Backend("job store lock poisoned".to_string()))?;
        jobs.insert((job.domain.clone(), job.job_id.clone()), job.clone());
        Ok(job)
    }

    async fn get(&self, domain: &str, job_id: &str) -> Result<Job, StoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| StoreError::Backend("job store lock poisoned".to_string()))?;
        jobs.get(&(domain.to_string(), job_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                domain: domain.to_string(),
                job_id: job_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_assigns_id_and_get_round_trips() {
        let store = MemoryJobStore::new();
        let req = JobRequest::new("thumbnails", "alice.example").manual();

        let job = store.create(&req).await.unwrap();
        assert!(!job.job_id.is_empty());
        assert_eq!(job.domain, "alice.example");
        assert_eq!(job.worker_type, "thumbnails");
        assert!(job.manual);

        let fetched = store.get("alice.example", &job.job_id).await.unwrap();
        assert_eq!(fetched.job_id, job.job_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store.get("alice.example", "missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("alice.example"));
    }

    #[test]
    fn test_queue_payload_format() {
        let job = Job {
            job_id: "42".to_string(),
            domain: "alice.example".to_string(),
            worker_type: "thumbnails".to_string(),
            manual: false,
            payload: serde_json::Value::Null,
            queued_at: Utc::now(),
        };
        assert_eq!(job.queue_payload(), "alice.example/42");
    }

    #[test]
    fn test_job_serialization_round_trip() {
        let job = Job {
            job_id: "42".to_string(),
            domain: "alice.example".to_string(),
            worker_type: "thumbnails".to_string(),
            manual: true,
            payload: serde_json::json!({"file_id": "abc"}),
            queued_at: Utc::now(),
        };

        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed.job_id, job.job_id);
        assert_eq!(parsed.domain, job.domain);
        assert_eq!(parsed.payload, job.payload);
        assert!(parsed.manual);
    }

    #[test]
    fn test_job_request_builder() {
        let req = JobRequest::new("exports", "bob.example")
            .manual()
            .with_payload(serde_json::json!({"format": "zip"}));

        assert_eq!(req.worker_type, "exports");
        assert_eq!(req.domain, "bob.example");
        assert!(req.manual);
        assert_eq!(req.payload["format"], "zip");
    }
}
