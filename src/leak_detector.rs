//! Tracking of network requests that never complete
//!
//! A `LeakDetector` lives for one page session. Every started request gets
//! an entry; a finished or failed event removes the oldest entry with the
//! same URL, so duplicate in-flight URLs are retired one at a time. When a
//! render dies on a navigation timeout whatever is still tracked is stamped
//! and reported.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// Network request that was still in flight when a render gave up
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakedRequest {
    pub url: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "elapsedMs",
        serialize_with = "serialize_elapsed_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub elapsed: Option<Duration>,
}

fn serialize_elapsed_ms<S>(elapsed: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match elapsed {
        Some(elapsed) => serializer.serialize_u64(elapsed.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug)]
struct TrackedRequest {
    url: String,
    start_time: DateTime<Utc>,
    started: Instant,
}

#[derive(Debug, Default)]
pub struct LeakDetector {
    tracked: Mutex<Vec<TrackedRequest>>,
}

impl LeakDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn tracked(&self) -> MutexGuard<'_, Vec<TrackedRequest>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_started(&self, url: &str) {
        self.tracked().push(TrackedRequest {
            url: url.to_string(),
            start_time: Utc::now(),
            started: Instant::now(),
        });
    }

    /// Returns false when no tracked request matched.
    pub fn on_finished(&self, url: &str) -> bool {
        self.retire(url, "finished")
    }

    /// Returns false when no tracked request matched.
    pub fn on_failed(&self, url: &str) -> bool {
        self.retire(url, "failed")
    }

    fn retire(&self, url: &str, outcome: &'static str) -> bool {
        let mut tracked = self.tracked();
        match tracked.iter().position(|request| request.url == url) {
            Some(index) => {
                tracked.remove(index);
                true
            }
            None => {
                trace!(url, outcome, "Completion event for untracked request");
                false
            }
        }
    }

    /// Stamps every outstanding request with an end time and elapsed
    /// duration, then forgets them.
    pub fn snapshot_leaked(&self) -> Vec<LeakedRequest> {
        let end_time = Utc::now();
        let now = Instant::now();

        self.tracked()
            .drain(..)
            .map(|request| LeakedRequest {
                url: request.url,
                start_time: request.start_time,
                end_time: Some(end_time),
                elapsed: Some(now.saturating_duration_since(request.started)),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tracked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked().is_empty()
    }
}
