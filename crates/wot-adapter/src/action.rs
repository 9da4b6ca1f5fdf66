use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde_json::Value;

/// Status of an [`ActionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// The request has been created, but not performed yet.
    Created,
    /// The action is running.
    Pending,
    /// The action succeeded.
    Completed,
    /// The action failed.
    Error,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
        .fmt(f)
    }
}

/// A request to perform a device action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Request identifier.
    pub id: String,
    /// Action name.
    pub name: String,
    /// Action input.
    pub input: Option<Value>,
    /// Action output, once completed.
    pub output: Option<Value>,
    /// Current status.
    pub status: ActionStatus,
    /// Time of the request.
    pub time_requested: SystemTime,
    /// Time of completion, once finished.
    pub time_completed: Option<SystemTime>,
}

impl ActionRequest {
    /// Creates an [`ActionRequest`].
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Option<Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            output: None,
            status: ActionStatus::Created,
            time_requested: SystemTime::now(),
            time_completed: None,
        }
    }

    /// Creates an [`ActionRequest`] with an identifier unique within the
    /// process.
    #[must_use]
    pub fn fresh(name: impl Into<String>, input: Option<Value>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self::new(id.to_string(), name, input)
    }

    /// Checks whether the request is finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.time_completed.is_some()
    }

    pub(crate) const fn start(&mut self) {
        self.status = ActionStatus::Pending;
    }

    pub(crate) const fn fail(&mut self) {
        self.status = ActionStatus::Error;
    }

    // A failed request keeps its status.
    pub(crate) fn finish(&mut self) {
        if self.status != ActionStatus::Error {
            self.status = ActionStatus::Completed;
        }
        self.time_completed = Some(SystemTime::now());
    }
}
