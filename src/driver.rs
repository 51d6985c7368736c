//! Page driver seam between render orchestration and the browser
//!
//! `PageDriver` opens pages on a shared browser; `RenderPage` is one page
//! session. Network and console activity is delivered as a stream of
//! `PageEvent`s so observers run on their own task and never hold up the
//! page's protocol handling.

use crate::{BasicAuthRule, RenderError, Viewport, WaitUntil};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub type PageEventStream = BoxStream<'static, PageEvent>;

/// Browser console message as reported by the page
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsoleMessage {
    /// Console API type: `log`, `warn`, `error`, ...
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum PageEvent {
    RequestStarted { url: String },
    RequestFinished { url: String },
    RequestFailed { url: String },
    /// A request held by interception; it stays paused until continued.
    RequestPaused { interception_id: String, url: String },
    Console(ConsoleMessage),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn RenderPage>, RenderError>;

    async fn shutdown(&self) {}
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), RenderError>;

    async fn set_cache_enabled(&self, enabled: bool) -> Result<(), RenderError>;

    async fn evaluate_on_new_document(&self, script: &str) -> Result<(), RenderError>;

    /// Answers HTTP auth challenges from URLs under the rule's prefix.
    async fn authenticate(&self, rule: &BasicAuthRule) -> Result<(), RenderError>;

    async fn set_request_interception(&self, enabled: bool) -> Result<(), RenderError>;

    async fn continue_request(&self, interception_id: &str) -> Result<(), RenderError>;

    /// Events emitted from now on; ends when the page closes.
    async fn subscribe(&self) -> Result<PageEventStream, RenderError>;

    async fn goto(&self, url: &str, wait_until: WaitUntil) -> Result<(), RenderError>;

    async fn add_style_tag(&self, css: &str) -> Result<(), RenderError>;

    async fn content(&self) -> Result<String, RenderError>;

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, RenderError>;

    async fn close(&self) -> Result<(), RenderError>;
}

/// Handle to a running event observer; dropping it unsubscribes at once,
/// `drain` first delivers every event already buffered.
#[derive(Debug)]
pub struct EventSubscription {
    task: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl EventSubscription {
    pub fn spawn<H>(mut events: PageEventStream, mut handler: H) -> Self
    where
        H: FnMut(PageEvent) + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    event = events.next() => match event {
                        Some(event) => handler(event),
                        None => return,
                    },
                }
            }

            while let Some(Some(event)) = events.next().now_or_never() {
                handler(event);
            }
        });

        Self {
            task: Some(task),
            stop: Some(stop),
        }
    }

    /// Handles the events that are ready now, then stops observing.
    pub async fn drain(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::unbounded;
    use std::sync::Mutex;

    fn started(url: &str) -> PageEvent {
        PageEvent::RequestStarted {
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn dropping_subscription_stops_observer() {
        let (sender, receiver) = unbounded();
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let subscription = EventSubscription::spawn(receiver.boxed(), move |_| {
            *counter.lock().unwrap() += 1;
        });

        sender.unbounded_send(started("https://a/")).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(subscription.is_active());

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        let _ = sender.unbounded_send(started("https://b/"));
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn drain_delivers_buffered_events() {
        let (sender, receiver) = unbounded();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let subscription = EventSubscription::spawn(receiver.boxed(), move |event| {
            if let PageEvent::RequestFinished { url } = event {
                log.lock().unwrap().push(url);
            }
        });

        // Nothing has been polled yet; all three sit in the buffer.
        for url in ["https://a/1", "https://a/2", "https://a/3"] {
            sender
                .unbounded_send(PageEvent::RequestFinished {
                    url: url.to_string(),
                })
                .unwrap();
        }

        subscription.drain().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["https://a/1", "https://a/2", "https://a/3"]
        );
    }

    #[tokio::test]
    async fn drain_returns_on_a_quiet_stream() {
        let events = futures::stream::pending::<PageEvent>().boxed();
        let subscription = EventSubscription::spawn(events, |_| {});
        tokio::time::timeout(std::time::Duration::from_millis(100), subscription.drain())
            .await
            .unwrap();
    }
}
