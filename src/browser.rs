//! Chromium page driver
//!
//! One headless Chromium is launched on first demand and shared by every
//! page. The Chrome DevTools Protocol handler is polled on its own task for
//! the lifetime of the browser. Each page gets a background task counting
//! in-flight requests so navigations can wait for network idle.

use crate::{
    create_browser_config, BasicAuthRule, Config, ConsoleMessage, PageDriver, PageEvent,
    PageEventStream, RenderError, RenderPage, Viewport, WaitUntil,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, SetCacheDisabledParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventDomContentEventFired, NavigateParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{EventConsoleApiCalled, RemoteObject};
use chromiumoxide::Page;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long the in-flight request count must stay under the threshold
/// before the network counts as idle.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);

struct SharedBrowser {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
}

/// `PageDriver` backed by a lazily launched, shared Chromium
pub struct ChromiumDriver {
    config: Config,
    browser: OnceCell<SharedBrowser>,
}

impl ChromiumDriver {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            browser: OnceCell::new(),
        }
    }

    /// Launches the browser on first use. A failed launch leaves the cell
    /// empty so the next page request tries again.
    async fn browser(&self) -> Result<&SharedBrowser, RenderError> {
        self.browser
            .get_or_try_init(|| launch_browser(&self.config))
            .await
    }

    pub fn is_launched(&self) -> bool {
        self.browser.initialized()
    }
}

async fn launch_browser(config: &Config) -> Result<SharedBrowser, RenderError> {
    let browser_config = create_browser_config(config)?;

    info!(chrome_path = ?config.chrome_path, "Launching shared browser");
    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .map_err(|e| RenderError::BrowserLaunch(e.to_string()))?;

    let handler = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!(error = %e, "Browser handler error");
            }
        }
        info!("Browser handler stream ended");
    });

    Ok(SharedBrowser {
        browser: Mutex::new(browser),
        handler,
    })
}

#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn new_page(&self) -> Result<Arc<dyn RenderPage>, RenderError> {
        let shared = self.browser().await?;
        let page = shared.browser.lock().await.new_page("about:blank").await?;
        let page = ChromiumPage::attach(page).await?;
        Ok(Arc::new(page))
    }

    async fn shutdown(&self) {
        let Some(shared) = self.browser.get() else {
            return;
        };

        if let Err(e) = shared.browser.lock().await.close().await {
            warn!(error = %e, "Error closing browser");
        }
        shared.handler.abort();
        info!("Shared browser closed");
    }
}

/// One Chromium tab used for a single render
pub struct ChromiumPage {
    page: Page,
    inflight: watch::Receiver<usize>,
    tracker: JoinHandle<()>,
    auth_rule: std::sync::Mutex<Option<BasicAuthRule>>,
    auth_responder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChromiumPage {
    async fn attach(page: Page) -> Result<Self, RenderError> {
        let signals = network_signals(&page).await?;
        let (count, inflight) = watch::channel(0);
        let tracker = tokio::spawn(track_inflight(signals, count));

        Ok(Self {
            page,
            inflight,
            tracker,
            auth_rule: std::sync::Mutex::new(None),
            auth_responder: std::sync::Mutex::new(None),
        })
    }

    fn auth_rule(&self) -> MutexGuard<'_, Option<BasicAuthRule>> {
        self.auth_rule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auth_responder(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.auth_responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_background_tasks(&self) {
        self.tracker.abort();
        if let Some(responder) = self.auth_responder().take() {
            responder.abort();
        }
    }

    /// Issues `Page.navigate` and returns once `DOMContentLoaded` fired.
    async fn navigate_until_dom_ready(&self, url: &str) -> Result<(), RenderError> {
        let mut dom_ready = self
            .page
            .event_listener::<EventDomContentEventFired>()
            .await?;
        let navigation = self.page.execute(NavigateParams::new(url)).await?;
        if let Some(error) = &navigation.result.error_text {
            return Err(RenderError::PageError(format!("{error} at {url}")));
        }

        dom_ready.next().await;
        Ok(())
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        self.stop_background_tasks();
    }
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), RenderError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(RenderError::PageError)?;

        self.page.execute(params).await?;
        Ok(())
    }

    async fn set_cache_enabled(&self, enabled: bool) -> Result<(), RenderError> {
        self.page.execute(SetCacheDisabledParams::new(!enabled)).await?;
        Ok(())
    }

    async fn evaluate_on_new_document(&self, script: &str) -> Result<(), RenderError> {
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
            .await?;
        Ok(())
    }

    /// Takes effect when interception is enabled; challenges are answered
    /// through `Fetch.authRequired`, no header is attached to requests.
    async fn authenticate(&self, rule: &BasicAuthRule) -> Result<(), RenderError> {
        *self.auth_rule() = Some(rule.clone());
        Ok(())
    }

    async fn set_request_interception(&self, enabled: bool) -> Result<(), RenderError> {
        if !enabled {
            if let Some(responder) = self.auth_responder().take() {
                responder.abort();
            }
            self.page.execute(fetch::DisableParams::default()).await?;
            return Ok(());
        }

        let rule = self.auth_rule().clone();
        let handle_auth = rule.is_some();
        if let Some(rule) = rule {
            let challenges = self.page.event_listener::<EventAuthRequired>().await?;
            let responder = tokio::spawn(answer_auth_challenges(
                self.page.clone(),
                challenges.boxed(),
                rule,
            ));
            if let Some(previous) = self.auth_responder().replace(responder) {
                previous.abort();
            }
        }

        let params = fetch::EnableParams::builder()
            .handle_auth_requests(handle_auth)
            .build();
        self.page.execute(params).await?;
        Ok(())
    }

    async fn continue_request(&self, interception_id: &str) -> Result<(), RenderError> {
        self.page
            .execute(ContinueRequestParams::new(fetch::RequestId::new(
                interception_id,
            )))
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<PageEventStream, RenderError> {
        let signals = network_signals(&self.page).await?;
        let paused = self.page.event_listener::<EventRequestPaused>().await?;
        let console = self.page.event_listener::<EventConsoleApiCalled>().await?;

        let mut translator = RequestTranslator::default();
        let network = signals.flat_map(move |signal| stream::iter(translator.translate(signal)));

        let paused = paused.map(|event| PageEvent::RequestPaused {
            interception_id: event.request_id.inner().clone(),
            url: event.request.url.clone(),
        });
        let console = console.map(|event| PageEvent::Console(console_message(&event)));

        Ok(stream::select_all(vec![network.boxed(), paused.boxed(), console.boxed()]).boxed())
    }

    /// `domcontentloaded` resolves on `Page.domContentEventFired`; the other
    /// criteria wait for the load chromiumoxide tracks, and the idle ones
    /// then wait for the network.
    async fn goto(&self, url: &str, wait_until: WaitUntil) -> Result<(), RenderError> {
        let inflight = self.inflight.clone();
        if wait_until.waits_for_load() {
            self.page.goto(url).await?;
        } else {
            self.navigate_until_dom_ready(url).await?;
        }

        if let Some(threshold) = wait_until.idle_threshold() {
            wait_for_network_idle(inflight, threshold).await;
        }
        Ok(())
    }

    async fn add_style_tag(&self, css: &str) -> Result<(), RenderError> {
        self.page.evaluate(style_tag_script(css)).await?;
        Ok(())
    }

    async fn content(&self) -> Result<String, RenderError> {
        Ok(self.page.content().await?)
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, RenderError> {
        let result = self.page.evaluate(expression.to_string()).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.stop_background_tasks();
        self.page.clone().close().await?;
        Ok(())
    }
}

/// Network lifecycle reduced to request ids
#[derive(Debug, Clone, PartialEq)]
enum NetworkSignal {
    Sent { request_id: String, url: String },
    Finished { request_id: String },
    Failed { request_id: String },
}

async fn network_signals(page: &Page) -> Result<BoxStream<'static, NetworkSignal>, RenderError> {
    let sent = page
        .event_listener::<EventRequestWillBeSent>()
        .await?
        .map(|event| NetworkSignal::Sent {
            request_id: event.request_id.inner().clone(),
            url: event.request.url.clone(),
        });
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await?
        .map(|event| NetworkSignal::Finished {
            request_id: event.request_id.inner().clone(),
        });
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await?
        .map(|event| NetworkSignal::Failed {
            request_id: event.request_id.inner().clone(),
        });

    Ok(stream::select_all(vec![sent.boxed(), finished.boxed(), failed.boxed()]).boxed())
}

/// Resolves completion events back to the URL their request was sent for.
#[derive(Debug, Default)]
struct RequestTranslator {
    urls: HashMap<String, String>,
}

impl RequestTranslator {
    fn translate(&mut self, signal: NetworkSignal) -> Vec<PageEvent> {
        match signal {
            NetworkSignal::Sent { request_id, url } => {
                let mut events = Vec::with_capacity(2);
                // A redirect reuses the request id; the previous hop is done.
                if let Some(previous) = self.urls.insert(request_id, url.clone()) {
                    events.push(PageEvent::RequestFinished { url: previous });
                }
                events.push(PageEvent::RequestStarted { url });
                events
            }
            NetworkSignal::Finished { request_id } => match self.urls.remove(&request_id) {
                Some(url) => vec![PageEvent::RequestFinished { url }],
                None => {
                    trace!(%request_id, "Finished event for unknown request");
                    Vec::new()
                }
            },
            NetworkSignal::Failed { request_id } => match self.urls.remove(&request_id) {
                Some(url) => vec![PageEvent::RequestFailed { url }],
                None => {
                    trace!(%request_id, "Failed event for unknown request");
                    Vec::new()
                }
            },
        }
    }
}

async fn track_inflight(mut signals: BoxStream<'static, NetworkSignal>, count: watch::Sender<usize>) {
    let mut inflight = HashSet::new();
    while let Some(signal) = signals.next().await {
        match signal {
            NetworkSignal::Sent { request_id, .. } => {
                inflight.insert(request_id);
            }
            NetworkSignal::Finished { request_id } | NetworkSignal::Failed { request_id } => {
                inflight.remove(&request_id);
            }
        }
        count.send_replace(inflight.len());
    }
}

/// Returns once at most `threshold` requests stayed in flight for the whole
/// idle window, or when the page stops reporting.
async fn wait_for_network_idle(mut inflight: watch::Receiver<usize>, threshold: usize) {
    loop {
        while *inflight.borrow_and_update() > threshold {
            if inflight.changed().await.is_err() {
                return;
            }
        }

        let quiet = tokio::time::sleep(NETWORK_IDLE_WINDOW);
        tokio::pin!(quiet);
        loop {
            tokio::select! {
                _ = &mut quiet => return,
                changed = inflight.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *inflight.borrow_and_update() > threshold {
                        break;
                    }
                }
            }
        }
    }
}

async fn answer_auth_challenges(
    page: Page,
    mut challenges: BoxStream<'static, Arc<EventAuthRequired>>,
    rule: BasicAuthRule,
) {
    while let Some(challenge) = challenges.next().await {
        let response = auth_challenge_response(&rule, &challenge.request.url);
        debug!(
            url = %challenge.request.url,
            response = ?response.response,
            "Answering auth challenge"
        );
        let params = ContinueWithAuthParams::new(challenge.request_id.clone(), response);
        if let Err(e) = page.execute(params).await {
            debug!(error = %e, "Failed to answer auth challenge");
        }
    }
}

/// Credentials only go to URLs under the rule's prefix; other challenges
/// are cancelled.
fn auth_challenge_response(rule: &BasicAuthRule, url: &str) -> AuthChallengeResponse {
    if rule.matches(url) {
        AuthChallengeResponse {
            response: AuthChallengeResponseResponse::ProvideCredentials,
            username: Some(rule.credentials.username.clone()),
            password: Some(rule.credentials.password.clone()),
        }
    } else {
        AuthChallengeResponse {
            response: AuthChallengeResponseResponse::CancelAuth,
            username: None,
            password: None,
        }
    }
}

fn style_tag_script(css: &str) -> String {
    format!(
        "(() => {{ const style = document.createElement(\"style\"); style.textContent = {}; (document.head || document.documentElement).appendChild(style); }})()",
        Value::String(css.to_string())
    )
}

fn console_message(event: &EventConsoleApiCalled) -> ConsoleMessage {
    let frames = event
        .stack_trace
        .as_ref()
        .map(|trace| trace.call_frames.as_slice())
        .unwrap_or_default();

    let location = frames
        .first()
        .map(|frame| format!("{}:{}:{}", frame.url, frame.line_number, frame.column_number));

    let stack = (!frames.is_empty()).then(|| {
        frames
            .iter()
            .map(|frame| {
                let function = if frame.function_name.is_empty() {
                    "<anonymous>"
                } else {
                    frame.function_name.as_str()
                };
                format!(
                    "at {function} ({}:{}:{})",
                    frame.url, frame.line_number, frame.column_number
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    });

    ConsoleMessage {
        kind: event.r#type.as_ref().to_string(),
        text: event
            .args
            .iter()
            .map(remote_object_text)
            .collect::<Vec<_>>()
            .join(" "),
        location,
        stack,
        args: event.args.iter().map(remote_object_value).collect(),
    }
}

fn remote_object_text(object: &RemoteObject) -> String {
    match &object.value {
        Some(Value::String(text)) => text.clone(),
        Some(value) => value.to_string(),
        None => object.description.clone().unwrap_or_default(),
    }
}

fn remote_object_value(object: &RemoteObject) -> Value {
    object
        .value
        .clone()
        .or_else(|| object.description.clone().map(Value::String))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(id: &str, url: &str) -> NetworkSignal {
        NetworkSignal::Sent {
            request_id: id.to_string(),
            url: url.to_string(),
        }
    }

    fn urls(events: &[PageEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| match event {
                PageEvent::RequestStarted { url } => format!("started {url}"),
                PageEvent::RequestFinished { url } => format!("finished {url}"),
                PageEvent::RequestFailed { url } => format!("failed {url}"),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn completion_events_resolve_to_request_urls() {
        let mut translator = RequestTranslator::default();

        assert_eq!(urls(&translator.translate(sent("1", "https://a/"))), ["started https://a/"]);
        assert_eq!(urls(&translator.translate(sent("2", "https://a/app.js"))), ["started https://a/app.js"]);

        let finished = translator.translate(NetworkSignal::Finished {
            request_id: "2".to_string(),
        });
        assert_eq!(urls(&finished), ["finished https://a/app.js"]);

        let failed = translator.translate(NetworkSignal::Failed {
            request_id: "1".to_string(),
        });
        assert_eq!(urls(&failed), ["failed https://a/"]);
    }

    #[test]
    fn redirect_finishes_previous_hop() {
        let mut translator = RequestTranslator::default();
        translator.translate(sent("1", "http://a/"));

        let events = translator.translate(sent("1", "https://a/"));
        assert_eq!(urls(&events), ["finished http://a/", "started https://a/"]);
    }

    #[test]
    fn unknown_completion_is_ignored() {
        let mut translator = RequestTranslator::default();
        let events = translator.translate(NetworkSignal::Finished {
            request_id: "missing".to_string(),
        });
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn idle_waits_for_quiet_window() {
        let (count, inflight) = watch::channel(1usize);

        let started = tokio::time::Instant::now();
        let waiter = tokio::spawn(wait_for_network_idle(inflight, 0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        count.send_replace(0);

        waiter.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100) + NETWORK_IDLE_WINDOW);
    }

    #[tokio::test]
    async fn idle_threshold_allows_background_requests() {
        let (_count, inflight) = watch::channel(2usize);

        let started = tokio::time::Instant::now();
        wait_for_network_idle(inflight, 2).await;
        assert!(started.elapsed() >= NETWORK_IDLE_WINDOW);
    }

    #[tokio::test]
    async fn idle_returns_when_tracking_stops() {
        let (count, inflight) = watch::channel(5usize);
        drop(count);
        tokio::time::timeout(Duration::from_millis(100), wait_for_network_idle(inflight, 0))
            .await
            .unwrap();
    }

    #[test]
    fn auth_challenges_get_credentials_only_under_the_prefix() {
        let rule: BasicAuthRule = "https%3A%2F%2Fstage.example%2F:bot:open sesame"
            .parse()
            .unwrap();

        let answer = auth_challenge_response(&rule, "https://stage.example/login");
        assert_eq!(answer.response, AuthChallengeResponseResponse::ProvideCredentials);
        assert_eq!(answer.username.as_deref(), Some("bot"));
        assert_eq!(answer.password.as_deref(), Some("open sesame"));

        let answer = auth_challenge_response(&rule, "https://cdn.example.net/app.js");
        assert_eq!(answer.response, AuthChallengeResponseResponse::CancelAuth);
        assert!(answer.username.is_none());
        assert!(answer.password.is_none());
    }

    #[test]
    fn style_script_escapes_css() {
        let script = style_tag_script("body::after { content: \"</style>\" }");
        assert!(script.contains(r#"style.textContent = "body::after { content: \"</style>\" }";"#));
    }

    #[test]
    fn driver_starts_without_browser() {
        let driver = ChromiumDriver::new(Config::default());
        assert!(!driver.is_launched());
    }
}
