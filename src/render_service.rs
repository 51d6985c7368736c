//! Render pipeline: one page session per job, run through the shared queue
//!
//! `RenderExecutor` drives a single page from open to close: it prepares the
//! page, observes its network and console activity, navigates, and extracts
//! the markup plus the page's self-reported status. `RenderService` wires the
//! executor behind the metrics wrapper and the bounded FIFO queue.

use crate::logging::{self, Severity};
use crate::{
    validate_url, Config, ConcurrencyQueue, ConsoleMessage, EventSubscription, InstrumentedRunner,
    JobHandle, JobRunner, LeakDetector, LeakedRequest, PageDriver, PageEvent, QueueStats, RenderError, RenderJob, RenderMetrics, RenderPage, RenderRequest, RenderResult,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Executes render jobs against pages opened by a `PageDriver`
pub struct RenderExecutor {
    driver: Arc<dyn PageDriver>,
    config: Arc<Config>,
    stylesheet: Option<Arc<str>>,
    status_marker_script: String,
}

impl RenderExecutor {
    pub fn new(driver: Arc<dyn PageDriver>, config: Config) -> Self {
        let status_marker_script = status_marker_script(&config.status_meta_name);
        Self {
            driver,
            config: Arc::new(config),
            stylesheet: None,
            status_marker_script,
        }
    }

    /// CSS injected into every page once navigation settles.
    pub fn with_stylesheet(mut self, css: impl Into<Arc<str>>) -> Self {
        self.stylesheet = Some(css.into());
        self
    }

    pub async fn execute(&self, job: &RenderJob) -> Result<RenderResult, RenderError> {
        self.attempt(job).await.outcome
    }

    /// Runs one render and hands back the leaked-request report alongside
    /// the outcome; the report is empty unless navigation timed out.
    pub(crate) async fn attempt(&self, job: &RenderJob) -> RenderAttempt {
        let page = match self.driver.new_page().await {
            Ok(page) => page,
            Err(err) => {
                log_render_error(job, &err);
                return RenderAttempt::failed(err);
            }
        };

        let detector = Arc::new(LeakDetector::new());
        let mut observer = None;
        let outcome = self.render_page(&page, job, &detector, &mut observer).await;

        let mut leaked = Vec::new();
        if let Err(err) = &outcome {
            if err.is_navigation_timeout() {
                if let Some(observer) = observer.take() {
                    observer.drain().await;
                }
                leaked = report_leaked_requests(job, &detector);
            }
            log_render_error(job, err);
        }
        drop(observer);

        if let Err(err) = self.bounded("close", page.close()).await {
            warn!(job_id = %job.id, url = %job.url, error = %err, "Error closing page");
        }

        RenderAttempt { outcome, leaked }
    }

    async fn render_page(
        &self,
        page: &Arc<dyn RenderPage>,
        job: &RenderJob,
        detector: &Arc<LeakDetector>,
        observer: &mut Option<EventSubscription>,
    ) -> Result<RenderResult, RenderError> {
        self.bounded("set_viewport", page.set_viewport(&self.config.viewport))
            .await?;
        self.bounded("set_cache_enabled", page.set_cache_enabled(false))
            .await?;

        let init_script = prerender_marker_script(job.user_agent());
        self.bounded(
            "evaluate_on_new_document",
            page.evaluate_on_new_document(&init_script),
        )
        .await?;

        if let Some(rule) = self.config.basic_auth.rule_for(&job.url) {
            debug!(job_id = %job.id, prefix = %rule.prefix, username = %rule.credentials.username, "Applying basic auth credentials");
            self.bounded("authenticate", page.authenticate(rule)).await?;
        }

        let events = self.bounded("subscribe", page.subscribe()).await?;
        *observer = Some(EventSubscription::spawn(
            events,
            page_observer(Arc::clone(page), Arc::clone(detector), job.id.clone()),
        ));

        self.bounded(
            "set_request_interception",
            page.set_request_interception(true),
        )
        .await?;

        self.navigate(page, &job.url).await?;

        if let Some(css) = &self.stylesheet {
            self.bounded("add_style_tag", page.add_style_tag(css)).await?;
        }

        let page_content = self.bounded("content", page.content()).await?;
        let marker = self
            .bounded("evaluate", page.evaluate(&self.status_marker_script))
            .await?;

        Ok(RenderResult {
            status_code: status_from_marker(marker),
            page_content,
        })
    }

    async fn navigate(&self, page: &Arc<dyn RenderPage>, url: &str) -> Result<(), RenderError> {
        let nav_timeout = self.config.nav_timeout;
        match tokio::time::timeout(nav_timeout, page.goto(url, self.config.wait_until)).await {
            Ok(Err(RenderError::BrowserTimeout)) | Err(_) => {
                Err(RenderError::NavigationTimeout(nav_timeout))
            }
            Ok(result) => result,
        }
    }

    /// Runs one page operation under the default operation timeout.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, RenderError>
    where
        F: Future<Output = Result<T, RenderError>>,
    {
        with_deadline(operation, self.config.default_timeout, fut).await
    }
}

#[async_trait]
impl JobRunner for RenderExecutor {
    async fn run(&self, job: &RenderJob) -> Result<RenderResult, RenderError> {
        self.execute(job).await
    }
}

async fn with_deadline<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, RenderError>
where
    F: Future<Output = Result<T, RenderError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Err(RenderError::BrowserTimeout)) | Err(_) => {
            Err(RenderError::OperationTimeout { operation, timeout })
        }
        Ok(result) => result,
    }
}

/// Outcome of one render plus the requests reported as leaked
pub(crate) struct RenderAttempt {
    pub outcome: Result<RenderResult, RenderError>,
    pub leaked: Vec<LeakedRequest>,
}

impl RenderAttempt {
    fn failed(err: RenderError) -> Self {
        Self {
            outcome: Err(err),
            leaked: Vec::new(),
        }
    }
}

/// Feeds network events to the leak detector, releases intercepted
/// requests and forwards console output.
fn page_observer(
    page: Arc<dyn RenderPage>,
    detector: Arc<LeakDetector>,
    job_id: String,
) -> impl FnMut(PageEvent) + Send + 'static {
    move |event| match event {
        PageEvent::RequestStarted { url } => detector.on_started(&url),
        PageEvent::RequestFinished { url } => {
            detector.on_finished(&url);
        }
        PageEvent::RequestFailed { url } => {
            detector.on_failed(&url);
        }
        PageEvent::RequestPaused {
            interception_id,
            url,
        } => {
            let page = Arc::clone(&page);
            tokio::spawn(async move {
                if let Err(err) = page.continue_request(&interception_id).await {
                    debug!(%url, error = %err, "Failed to continue intercepted request");
                }
            });
        }
        PageEvent::Console(message) => forward_console(&job_id, &message),
    }
}

fn forward_console(job_id: &str, message: &ConsoleMessage) {
    let extra = json!({
        "jobId": job_id,
        "stack": message.stack,
        "location": message.location,
        "args": message.args,
    });
    logging::emit(
        Severity::from_console_type(&message.kind),
        &format!("Browser log: {}", message.text),
        &extra,
    );
}

/// Stamps and logs every request still in flight, returning what was
/// reported.
pub(crate) fn report_leaked_requests(job: &RenderJob, detector: &LeakDetector) -> Vec<LeakedRequest> {
    let leaked = detector.snapshot_leaked();
    logging::emit(
        Severity::Error,
        "Leaked requests",
        &json!({
            "jobId": job.id,
            "url": job.url,
            "requests": leaked,
        }),
    );
    leaked
}

fn log_render_error(job: &RenderJob, err: &RenderError) {
    error!(
        job_id = %job.id,
        url = %job.url,
        kind = err.kind(),
        error = %err,
        "Render error"
    );
}

/// Script publishing `window.prerender = { userAgent }` before any page
/// script runs.
fn prerender_marker_script(user_agent: Option<&str>) -> String {
    format!(
        "Reflect.set(window, \"prerender\", {});",
        json!({ "userAgent": user_agent })
    )
}

fn status_marker_script(meta_name: &str) -> String {
    let selector = Value::String(format!("meta[name=\"{meta_name}\"]"));
    format!("document.head?.querySelector({selector})?.getAttribute(\"content\")")
}

/// A missing or empty marker means the page reported no status.
fn status_from_marker(marker: Value) -> Option<String> {
    match marker {
        Value::String(code) if code.trim().is_empty() => None,
        Value::String(code) => Some(code.trim().to_string()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

/// Render service combining the page driver, metrics and the FIFO queue
///
/// # Examples
///
/// ```rust,no_run
/// use botview::{Config, RenderRequest, RenderService};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = RenderService::new(Config::default()).await?;
///
///     let result = service
///         .render(RenderRequest::new("https://example.com").with_header("user-agent", "Googlebot"))
///         .await?;
///     println!("Rendered {} bytes", result.page_content.len());
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct RenderService {
    queue: ConcurrencyQueue,
    driver: Arc<dyn PageDriver>,
    config: Config,
}

impl RenderService {
    /// Creates a service backed by a lazily launched shared Chromium.
    pub async fn new(config: Config) -> Result<Self, RenderError> {
        config.validate()?;
        let driver = Arc::new(crate::ChromiumDriver::new(config.clone()));
        Self::with_driver(config, driver).await
    }

    pub async fn with_driver(
        config: Config,
        driver: Arc<dyn PageDriver>,
    ) -> Result<Self, RenderError> {
        config.validate()?;

        let metrics = RenderMetrics::register();
        let mut executor = RenderExecutor::new(Arc::clone(&driver), config.clone());
        if let Some(css) = load_stylesheet(config.stylesheet.as_deref()).await? {
            executor = executor.with_stylesheet(css);
        }

        let runner = InstrumentedRunner::new(executor, metrics.clone());
        let queue = ConcurrencyQueue::with_limits(
            Arc::new(runner),
            config.max_concurrency,
            config.max_backlog,
            metrics,
        );

        info!(
            max_concurrency = config.max_concurrency,
            max_backlog = ?config.max_backlog,
            wait_until = ?config.wait_until,
            auth_rules = config.basic_auth.len(),
            "Render service ready"
        );

        Ok(Self {
            queue,
            driver,
            config,
        })
    }

    pub async fn render(&self, request: RenderRequest) -> Result<RenderResult, RenderError> {
        self.submit(request)?.await
    }

    /// Queues a render without waiting for it.
    pub fn submit(&self, request: RenderRequest) -> Result<JobHandle, RenderError> {
        validate_url(&request.url)?;
        self.queue.submit(RenderJob::new(request))
    }

    /// Renders every URL, preserving input order in the results.
    pub async fn render_batch(&self, urls: Vec<String>) -> Vec<Result<RenderResult, RenderError>> {
        let pending: Vec<_> = urls
            .into_iter()
            .map(|url| self.submit(RenderRequest::new(url)))
            .collect();

        join_all(pending.into_iter().map(|handle| async move { handle?.await })).await
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn shutdown(&self) {
        info!("Shutting down render service");
        self.driver.shutdown().await;
    }
}

async fn load_stylesheet(path: Option<&Path>) -> Result<Option<String>, RenderError> {
    let Some(path) = path else {
        return Ok(None);
    };

    let css = tokio::fs::read_to_string(path).await.map_err(|e| {
        RenderError::Configuration(format!("cannot read stylesheet {}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), bytes = css.len(), "Loaded stylesheet");
    Ok(Some(css))
}
