//! Render jobs and their results

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// What a caller asks to have rendered
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub url: String,
    /// Request headers with lower-cased names
    pub headers: BTreeMap<String, String>,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// Lifecycle of a render job; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    fn can_move_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Running, JobState::Succeeded | JobState::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderJob {
    pub id: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    state: JobState,
    pub submitted_at: Instant,
}

impl RenderJob {
    pub fn new(request: RenderRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: request.url,
            headers: request.headers,
            state: JobState::Queued,
            submitted_at: Instant::now(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Moves the job forward; returns false and leaves the state untouched
    /// on any attempt to skip or regress.
    pub fn transition(&mut self, next: JobState) -> bool {
        if self.state.can_move_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Time since submission.
    pub fn queued_for(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent").map(String::as_str)
    }
}

/// Rendered page content plus the status the page reported about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    pub status_code: Option<String>,
    pub page_content: String,
}

impl RenderResult {
    /// HTTP status carried by the status marker, when it parses as one.
    pub fn http_status(&self) -> Option<u16> {
        self.status_code
            .as_deref()
            .and_then(|code| code.trim().parse::<u16>().ok())
            .filter(|code| (100..=599).contains(code))
    }
}
