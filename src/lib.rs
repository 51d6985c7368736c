//! # botview
//!
//! A prerendering service for crawlers written in Rust. Pages are rendered in
//! a shared headless Chromium and returned as static markup, together with
//! the HTTP status the page reported about itself through a
//! `<meta name="prerender-status">` marker.
//!
//! ## How a render runs
//!
//! 1. The request is appended to a FIFO backlog. At most `max_concurrency`
//!    renders run at once; a finished render frees its slot and the oldest
//!    waiting job starts immediately.
//! 2. The executor opens a page on the shared browser, which is launched
//!    lazily on first demand, sets a mobile viewport, disables the cache and
//!    publishes `window.prerender = { userAgent }` before page scripts run.
//! 3. Basic-auth credentials are applied when a configured URL prefix
//!    matches. Rules are checked in order and the first match wins.
//! 4. Network requests are intercepted, continued and tracked. Browser
//!    console output is forwarded to the service log.
//! 5. Navigation waits for the configured readiness criterion under its own
//!    timeout; every other page operation has a separate timeout.
//! 6. If navigation times out, the requests still in flight are reported as
//!    leaked. The page is always closed.
//!
//! ## Observability
//!
//! | Metric | Type | Meaning |
//! |--------|------|---------|
//! | `botview_active_render_jobs` | gauge | Renders executing right now |
//! | `botview_render_errors_total` | counter | Failed renders |
//! | `botview_render_duration_seconds` | histogram | Render time |
//! | `botview_render_queue_depth` | gauge | Jobs waiting for a slot |
//! | `botview_process_resident_memory_bytes` | gauge | Process RSS |
//!
//! Logs are structured JSON by default (`--log-format compact` for humans)
//! and honour `RUST_LOG`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use botview::{Config, RenderRequest, RenderService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = RenderService::new(Config::default()).await?;
//!
//!     let result = service
//!         .render(RenderRequest::new("https://example.com").with_header("user-agent", "Googlebot"))
//!         .await?;
//!     println!("status marker: {:?}", result.status_code);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Prerender server
//! ```bash
//! botview serve --bind 0.0.0.0:3000 --max-concurrency 10 --wait-until networkidle0
//! curl 'http://localhost:3000/render?url=https%3A%2F%2Fexample.com%2F'
//! ```
//!
//! ### Single page
//! ```bash
//! botview render --url https://example.com --output example.html
//! ```
//!
//! ### Batch Processing
//! ```bash
//! botview batch --input urls.txt --output pages/
//! ```

/// Configuration and settings for the render service
pub mod config;

/// Error types and error classification
pub mod error;

/// Render jobs, requests and results
pub mod job;

/// Page driver traits and page events
pub mod driver;

/// Chromium-backed page driver
pub mod browser;

/// Tracking of requests that never complete
pub mod leak_detector;

/// Bounded-concurrency FIFO job queue
pub mod queue;

/// Render executor and service facade
pub mod render_service;

/// Prometheus metrics for render jobs
pub mod metrics;

/// Structured logging and the severity scale
pub mod logging;

/// HTTP endpoints
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use self::metrics::*;
pub use browser::*;
pub use cli::*;
pub use config::*;
pub use driver::*;
pub use error::*;
pub use job::*;
pub use leak_detector::*;
pub use logging::{setup_logging, LogFormat, Severity};
pub use queue::*;
pub use render_service::*;
pub use server::{router, serve, AppState, PRERENDER_STATUS_HEADER};
pub use utils::*;
