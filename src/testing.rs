//! Scripted in-memory page driver for tests

use crate::{
    BasicAuthRule, PageDriver, PageEvent, PageEventStream, RenderError, RenderPage, Viewport,
    WaitUntil,
};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What every page opened by a `ScriptedDriver` does
#[derive(Debug, Clone)]
pub(crate) struct PageScript {
    /// Emitted on the event stream when `goto` starts
    pub events_on_goto: Vec<PageEvent>,
    /// How long `goto` takes after emitting its events
    pub goto_delay: Duration,
    pub goto_error: Option<RenderError>,
    /// URLs whose navigation fails with a page error
    pub failing_urls: Vec<String>,
    pub content: String,
    /// Value returned for the status marker lookup
    pub status_marker: serde_json::Value,
    pub close_error: Option<RenderError>,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            events_on_goto: Vec::new(),
            goto_delay: Duration::ZERO,
            goto_error: None,
            failing_urls: Vec::new(),
            content: "<html><head></head><body>rendered</body></html>".to_string(),
            status_marker: serde_json::Value::Null,
            close_error: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct PageCounters {
    open: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
}

pub(crate) struct ScriptedPage {
    script: PageScript,
    calls: Mutex<Vec<String>>,
    events: Mutex<Option<UnboundedSender<PageEvent>>>,
    counters: Arc<PageCounters>,
}

impl ScriptedPage {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn emit(&self, event: PageEvent) {
        if let Some(sender) = self.events.lock().unwrap().as_ref() {
            let _ = sender.unbounded_send(event);
        }
    }
}

#[async_trait]
impl RenderPage for ScriptedPage {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), RenderError> {
        self.record(format!("set_viewport:{}x{}", viewport.width, viewport.height));
        Ok(())
    }

    async fn set_cache_enabled(&self, enabled: bool) -> Result<(), RenderError> {
        self.record(format!("set_cache_enabled:{enabled}"));
        Ok(())
    }

    async fn evaluate_on_new_document(&self, script: &str) -> Result<(), RenderError> {
        self.record(format!("evaluate_on_new_document:{script}"));
        Ok(())
    }

    async fn authenticate(&self, rule: &BasicAuthRule) -> Result<(), RenderError> {
        self.record(format!("authenticate:{}", rule.credentials.username));
        Ok(())
    }

    async fn set_request_interception(&self, enabled: bool) -> Result<(), RenderError> {
        self.record(format!("set_request_interception:{enabled}"));
        Ok(())
    }

    async fn continue_request(&self, interception_id: &str) -> Result<(), RenderError> {
        self.record(format!("continue_request:{interception_id}"));
        Ok(())
    }

    async fn subscribe(&self) -> Result<PageEventStream, RenderError> {
        self.record("subscribe");
        let (sender, receiver) = unbounded();
        *self.events.lock().unwrap() = Some(sender);
        Ok(receiver.boxed())
    }

    async fn goto(&self, url: &str, _wait_until: WaitUntil) -> Result<(), RenderError> {
        self.record(format!("goto:{url}"));
        for event in self.script.events_on_goto.clone() {
            self.emit(event);
        }
        if !self.script.goto_delay.is_zero() {
            tokio::time::sleep(self.script.goto_delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        if self.script.failing_urls.iter().any(|failing| failing == url) {
            return Err(RenderError::PageError(format!("net::ERR_FAILED at {url}")));
        }
        match &self.script.goto_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn add_style_tag(&self, css: &str) -> Result<(), RenderError> {
        self.record(format!("add_style_tag:{css}"));
        Ok(())
    }

    async fn content(&self) -> Result<String, RenderError> {
        self.record("content");
        Ok(self.script.content.clone())
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, RenderError> {
        self.record(format!("evaluate:{expression}"));
        Ok(self.script.status_marker.clone())
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.record("close");
        self.events.lock().unwrap().take();
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
        match &self.script.close_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Opens `ScriptedPage`s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct ScriptedDriver {
    script: PageScript,
    pages: Mutex<Vec<Arc<ScriptedPage>>>,
    counters: Arc<PageCounters>,
}

impl ScriptedDriver {
    pub fn new(script: PageScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    pub fn pages(&self) -> Vec<Arc<ScriptedPage>> {
        self.pages.lock().unwrap().clone()
    }

    pub fn last_page(&self) -> Arc<ScriptedPage> {
        self.pages().pop().expect("no page was opened")
    }

    /// Most pages that were open at the same time.
    pub fn peak_open_pages(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn open_pages(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn opened_pages(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn new_page(&self) -> Result<Arc<dyn RenderPage>, RenderError> {
        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(open, Ordering::SeqCst);
        self.counters.opened.fetch_add(1, Ordering::SeqCst);

        let page = Arc::new(ScriptedPage {
            script: self.script.clone(),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            counters: Arc::clone(&self.counters),
        });
        self.pages.lock().unwrap().push(Arc::clone(&page));
        Ok(page)
    }
}

pub(crate) fn started(url: &str) -> PageEvent {
    PageEvent::RequestStarted {
        url: url.to_string(),
    }
}

pub(crate) fn finished(url: &str) -> PageEvent {
    PageEvent::RequestFinished {
        url: url.to_string(),
    }
}

pub(crate) fn paused(interception_id: &str, url: &str) -> PageEvent {
    PageEvent::RequestPaused {
        interception_id: interception_id.to_string(),
        url: url.to_string(),
    }
}
