use crate::{JobRunner, RenderError, RenderJob, RenderResult};
use async_trait::async_trait;
use metrics::{describe_counter, describe_gauge, describe_histogram, Counter, Gauge, Histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const ACTIVE_RENDER_JOBS: &str = "botview_active_render_jobs";
pub const RENDER_ERRORS_TOTAL: &str = "botview_render_errors_total";
pub const RENDER_DURATION_SECONDS: &str = "botview_render_duration_seconds";
pub const RENDER_QUEUE_DEPTH: &str = "botview_render_queue_depth";
pub const RESIDENT_MEMORY_BYTES: &str = "botview_process_resident_memory_bytes";

pub const RENDER_DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0];

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Clone)]
pub struct RenderMetrics {
    pub active_jobs: Gauge,
    pub errors: Counter,
    pub duration: Histogram,
    pub queue_depth: Gauge,
}

impl RenderMetrics {
    /// Registers handles against the currently installed recorder.
    pub fn register() -> Self {
        describe_metrics();
        Self {
            active_jobs: metrics::gauge!(ACTIVE_RENDER_JOBS),
            errors: metrics::counter!(RENDER_ERRORS_TOTAL),
            duration: metrics::histogram!(RENDER_DURATION_SECONDS),
            queue_depth: metrics::gauge!(RENDER_QUEUE_DEPTH),
        }
    }

    pub fn noop() -> Self {
        Self {
            active_jobs: Gauge::noop(),
            errors: Counter::noop(),
            duration: Histogram::noop(),
            queue_depth: Gauge::noop(),
        }
    }

    /// Bumps the active gauge until the guard drops.
    pub fn track_active(&self) -> ActiveRenderGuard {
        self.active_jobs.increment(1.0);
        ActiveRenderGuard {
            gauge: self.active_jobs.clone(),
        }
    }

    pub fn start_timer(&self) -> DurationTimer {
        DurationTimer {
            histogram: self.duration.clone(),
            started: Instant::now(),
        }
    }

    pub fn record_error(&self) {
        self.errors.increment(1);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }
}

impl Default for RenderMetrics {
    fn default() -> Self {
        Self::noop()
    }
}

pub struct ActiveRenderGuard {
    gauge: Gauge,
}

impl Drop for ActiveRenderGuard {
    fn drop(&mut self) {
        self.gauge.decrement(1.0);
    }
}

/// Records the elapsed time into the duration histogram exactly once,
/// either on `stop` or when dropped.
pub struct DurationTimer {
    histogram: Histogram,
    started: Instant,
}

impl DurationTimer {
    pub fn stop(self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for DurationTimer {
    fn drop(&mut self) {
        self.histogram.record(self.started.elapsed().as_secs_f64());
    }
}

/// Wraps a runner with the active gauge, duration histogram and error
/// counter.
pub struct InstrumentedRunner<R> {
    inner: R,
    metrics: RenderMetrics,
}

impl<R> InstrumentedRunner<R> {
    pub fn new(inner: R, metrics: RenderMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<R: JobRunner> JobRunner for InstrumentedRunner<R> {
    async fn run(&self, job: &RenderJob) -> Result<RenderResult, RenderError> {
        let _active = self.metrics.track_active();
        let timer = self.metrics.start_timer();

        let result = self.inner.run(job).await;
        if result.is_err() {
            self.metrics.record_error();
        }

        let elapsed = timer.stop();
        debug!(job_id = %job.id, elapsed_ms = elapsed.as_millis() as u64, "Render finished");
        result
    }
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            ACTIVE_RENDER_JOBS,
            Unit::Count,
            "Current number of render jobs being executed."
        );
        describe_counter!(
            RENDER_ERRORS_TOTAL,
            Unit::Count,
            "Total number of failed render jobs."
        );
        describe_histogram!(
            RENDER_DURATION_SECONDS,
            Unit::Seconds,
            "Page render time in seconds."
        );
        describe_gauge!(
            RENDER_QUEUE_DEPTH,
            Unit::Count,
            "Render jobs waiting for a concurrency slot."
        );
        describe_gauge!(
            RESIDENT_MEMORY_BYTES,
            Unit::Bytes,
            "Resident memory of the service process."
        );
    });
}

/// Installs the Prometheus recorder globally and returns the handle used
/// to render the exposition text.
pub fn install_metrics_exporter() -> Result<PrometheusHandle, RenderError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(RENDER_DURATION_SECONDS.to_string()),
            RENDER_DURATION_BUCKETS,
        )
        .map_err(|e| RenderError::Configuration(e.to_string()))?
        .install_recorder()
        .map_err(|e| RenderError::Configuration(e.to_string()))?;

    describe_metrics();
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

pub struct MetricsCollector {
    memory: Gauge,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            memory: metrics::gauge!(RESIDENT_MEMORY_BYTES),
            collection_interval: Duration::from_secs(10),
        }
    }

    pub fn start_collection(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(self.collection_interval);

            loop {
                interval_timer.tick().await;

                if let Some(memory) = resident_memory_bytes() {
                    self.memory.set(memory as f64);
                }
            }
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn resident_memory_bytes() -> Option<usize> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    content
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RenderRequest;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use std::collections::HashMap;

    struct FixedRunner(Result<RenderResult, RenderError>);

    #[async_trait]
    impl JobRunner for FixedRunner {
        async fn run(&self, _job: &RenderJob) -> Result<RenderResult, RenderError> {
            self.0.clone()
        }
    }

    fn local_metrics() -> (RenderMetrics, Snapshotter) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let metrics = metrics::with_local_recorder(&recorder, RenderMetrics::register);
        (metrics, snapshotter)
    }

    /// One snapshot per assertion block; histogram samples drain on read.
    fn snapshot(snapshotter: &Snapshotter) -> HashMap<String, DebugValue> {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| (key.key().name().to_string(), value))
            .collect()
    }

    fn gauge(values: &HashMap<String, DebugValue>, name: &str) -> f64 {
        match values.get(name) {
            Some(DebugValue::Gauge(value)) => value.into_inner(),
            other => panic!("expected gauge for {name}, got {other:?}"),
        }
    }

    fn counter(values: &HashMap<String, DebugValue>, name: &str) -> u64 {
        match values.get(name) {
            Some(DebugValue::Counter(value)) => *value,
            other => panic!("expected counter for {name}, got {other:?}"),
        }
    }

    fn samples(values: &HashMap<String, DebugValue>, name: &str) -> usize {
        match values.get(name) {
            Some(DebugValue::Histogram(values)) => values.len(),
            other => panic!("expected histogram for {name}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_execution_is_counted_once_and_gauge_returns_to_zero() {
        let (metrics, snapshotter) = local_metrics();
        let runner = InstrumentedRunner::new(
            FixedRunner(Err(RenderError::PageError("Target closed".into()))),
            metrics,
        );
        let job = RenderJob::new(RenderRequest::new("https://example.com"));

        assert!(runner.run(&job).await.is_err());

        let values = snapshot(&snapshotter);
        assert_eq!(gauge(&values, ACTIVE_RENDER_JOBS), 0.0);
        assert_eq!(counter(&values, RENDER_ERRORS_TOTAL), 1);
        assert_eq!(samples(&values, RENDER_DURATION_SECONDS), 1);
    }

    #[tokio::test]
    async fn successful_execution_records_duration_without_error() {
        let (metrics, snapshotter) = local_metrics();
        let runner = InstrumentedRunner::new(
            FixedRunner(Ok(RenderResult {
                status_code: None,
                page_content: "<html></html>".into(),
            })),
            metrics,
        );
        let job = RenderJob::new(RenderRequest::new("https://example.com"));

        assert!(runner.run(&job).await.is_ok());
        assert!(runner.run(&job).await.is_ok());

        let values = snapshot(&snapshotter);
        assert_eq!(gauge(&values, ACTIVE_RENDER_JOBS), 0.0);
        assert_eq!(counter(&values, RENDER_ERRORS_TOTAL), 0);
        assert_eq!(samples(&values, RENDER_DURATION_SECONDS), 2);
    }

    #[test]
    fn active_guard_decrements_on_unwind() {
        let (metrics, snapshotter) = local_metrics();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _active = metrics.track_active();
            assert_eq!(gauge(&snapshot(&snapshotter), ACTIVE_RENDER_JOBS), 1.0);
            panic!("render blew up");
        }));

        assert!(outcome.is_err());
        assert_eq!(gauge(&snapshot(&snapshotter), ACTIVE_RENDER_JOBS), 0.0);
    }

    #[test]
    fn queue_depth_gauge_tracks_backlog() {
        let (metrics, snapshotter) = local_metrics();
        metrics.set_queue_depth(5);
        assert_eq!(gauge(&snapshot(&snapshotter), RENDER_QUEUE_DEPTH), 5.0);
    }
}
