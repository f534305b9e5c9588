//! Request/response correlation.
//!
//! A requester stores per-task state (for example the SRS it asked the
//! server to use) under the task id it sends, and looks it up again when the
//! matching output arrives. Entries live until resolved or forgotten.

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::InferenceError;

/// Task correlation id carried unchanged from request to output
pub type TaskId = String;

/// Shared map from task id to requester state
#[derive(Debug)]
pub struct TaskCorrelator<T> {
    tasks: DashMap<TaskId, T>,
}

impl<T> TaskCorrelator<T> {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Store `state` under a fresh task id
    pub fn begin(&self, state: T) -> TaskId {
        let task_id = Uuid::new_v4().to_string();
        self.tasks.insert(task_id.clone(), state);
        debug!("Began task {} ({} outstanding)", task_id, self.tasks.len());
        task_id
    }

    /// Store `state` under a caller-chosen id, replacing any previous entry
    pub fn insert(&self, task_id: impl Into<TaskId>, state: T) -> Option<T> {
        self.tasks.insert(task_id.into(), state)
    }

    /// Take the state for `task_id`
    pub fn resolve(&self, task_id: &str) -> Result<T, InferenceError> {
        self.tasks
            .remove(task_id)
            .map(|(_, state)| state)
            .ok_or_else(|| InferenceError::StaleOrUnknownTask(task_id.to_string()))
    }

    /// Drop the state for `task_id`, if any
    pub fn forget(&self, task_id: &str) -> bool {
        self.tasks.remove(task_id).is_some()
    }

    /// Whether `task_id` is outstanding
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Number of outstanding tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is outstanding
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<T> Default for TaskCorrelator<T> {
    fn default() -> Self {
        Self::new()
    }
}
