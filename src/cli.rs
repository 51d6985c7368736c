use crate::logging::LogFormat;
use crate::server::{self, AppState};
use crate::{
    format_bytes, format_duration, sanitize_filename, BasicAuthRules, Config, RenderRequest,
    RenderService, WaitUntil,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{info, warn};

fn parse_duration(raw: &str) -> Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(raw)
}

#[derive(Parser)]
#[command(name = "botview")]
#[command(about = "Headless browser prerendering service for crawlers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, env = "MAX_CONCURRENCY", help = "Maximum concurrent renders")]
    pub max_concurrency: Option<usize>,

    #[arg(long, global = true, env = "MAX_BACKLOG", help = "Maximum renders waiting for a slot")]
    pub max_backlog: Option<usize>,

    #[arg(long, global = true, env = "NAV_TIMEOUT", value_parser = parse_duration, help = "Navigation timeout, e.g. 30s")]
    pub nav_timeout: Option<Duration>,

    #[arg(long, global = true, env = "DEFAULT_TIMEOUT", value_parser = parse_duration, help = "Timeout for other page operations")]
    pub default_timeout: Option<Duration>,

    #[arg(long, global = true, env = "WAIT_UNTIL", value_enum, help = "When a navigation counts as finished")]
    pub wait_until: Option<WaitUntil>,

    #[arg(long, global = true, env = "BASIC_AUTH", hide_env_values = true, help = "Comma-separated prefix:user:pass rules")]
    pub basic_auth: Option<BasicAuthRules>,

    #[arg(long, global = true, env = "STYLESHEET", help = "CSS file injected into rendered pages")]
    pub stylesheet: Option<PathBuf>,

    #[arg(long, global = true, env = "CHROME_PATH", help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, value_enum, default_value = "json", help = "Log output format")]
    pub log_format: LogFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the prerender HTTP endpoint
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:3000", env = "BIND", help = "Bind address")]
        bind: SocketAddr,
    },

    /// Render a single URL
    Render {
        #[arg(short, long, help = "URL to render")]
        url: String,

        #[arg(short, long, help = "Output file path (default: stdout)")]
        output: Option<PathBuf>,

        #[arg(long, help = "User agent exposed to the page")]
        user_agent: Option<String>,
    },

    /// Render URLs from a file
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory for rendered pages")]
        output: PathBuf,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Configuration file (or defaults) with command-line and environment
    /// overrides applied on top.
    pub async fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => read_config(path).await?,
            None => Config::default(),
        };

        self.apply_overrides(&mut config);
        config.validate()?;

        info!(
            max_concurrency = config.max_concurrency,
            nav_timeout = %format_duration(config.nav_timeout),
            default_timeout = %format_duration(config.default_timeout),
            wait_until = ?config.wait_until,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(max_concurrency) = self.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        if let Some(max_backlog) = self.max_backlog {
            config.max_backlog = Some(max_backlog);
        }
        if let Some(nav_timeout) = self.nav_timeout {
            config.nav_timeout = nav_timeout;
        }
        if let Some(default_timeout) = self.default_timeout {
            config.default_timeout = default_timeout;
        }
        if let Some(wait_until) = self.wait_until {
            config.wait_until = wait_until;
        }
        if let Some(basic_auth) = &self.basic_auth {
            config.basic_auth = basic_auth.clone();
        }
        if let Some(stylesheet) = &self.stylesheet {
            config.stylesheet = Some(stylesheet.clone());
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
    }
}

async fn read_config(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<RenderService>,
    metrics: PrometheusHandle,
}

impl CliRunner {
    pub async fn new(config: Config, metrics: PrometheusHandle) -> anyhow::Result<Self> {
        let service = Arc::new(RenderService::new(config.clone()).await?);
        Ok(Self {
            config,
            service,
            metrics,
        })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Serve { bind } => self.run_server(bind).await,
            Commands::Render {
                url,
                output,
                user_agent,
            } => self.run_render(url, output, user_agent).await,
            Commands::Batch { input, output } => self.run_batch(&input, &output).await,
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    pub async fn run_server(&self, bind: SocketAddr) -> anyhow::Result<()> {
        let state = AppState {
            service: Arc::clone(&self.service),
            metrics: self.metrics.clone(),
        };
        server::serve(bind, state).await?;
        Ok(())
    }

    pub async fn run_render(
        &self,
        url: String,
        output: Option<PathBuf>,
        user_agent: Option<String>,
    ) -> anyhow::Result<()> {
        info!(%url, "Rendering page");
        let started = Instant::now();

        let mut request = RenderRequest::new(url.clone());
        if let Some(user_agent) = user_agent {
            request = request.with_header("user-agent", user_agent);
        }

        let result = self.service.render(request).await?;

        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&path, &result.page_content).await?;

                println!("Page rendered successfully:");
                println!("  URL: {url}");
                println!("  Output: {}", path.display());
                println!("  Size: {}", format_bytes(result.page_content.len()));
                println!("  Duration: {}", format_duration(started.elapsed()));
                if let Some(status) = &result.status_code {
                    println!("  Status marker: {status}");
                }
            }
            None => println!("{}", result.page_content),
        }

        Ok(())
    }

    pub async fn run_batch(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        let urls = read_urls_from_file(input).await?;
        info!(count = urls.len(), input = %input.display(), "Loaded URLs");

        fs::create_dir_all(output).await?;

        let started = Instant::now();
        let results = self.service.render_batch(urls.clone()).await;

        let mut success_count = 0;
        let mut error_count = 0;
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(result) => {
                    let path = output.join(generate_filename(url));
                    fs::write(&path, &result.page_content).await?;
                    success_count += 1;
                    info!(%url, path = %path.display(), status = ?result.status_code, "Saved rendered page");
                }
                Err(err) => {
                    error_count += 1;
                    warn!(%url, error = %err, "Failed to render page");
                }
            }
        }

        info!(
            success = success_count,
            errors = error_count,
            elapsed = %format_duration(started.elapsed()),
            "Batch rendering completed"
        );

        if success_count == 0 && error_count > 0 {
            anyhow::bail!("all {error_count} renders failed");
        }
        Ok(())
    }
}

pub async fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = read_config(config_path).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Max concurrency: {}", config.max_concurrency);
    match config.max_backlog {
        Some(limit) => println!("  Max backlog: {limit}"),
        None => println!("  Max backlog: unbounded"),
    }
    println!("  Navigation timeout: {}", format_duration(config.nav_timeout));
    println!("  Operation timeout: {}", format_duration(config.default_timeout));
    println!("  Wait until: {:?}", config.wait_until);
    println!(
        "  Viewport: {}x{}",
        config.viewport.width, config.viewport.height
    );
    println!("  Basic auth rules: {}", config.basic_auth.len());

    Ok(())
}

pub async fn read_urls_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading URL list {}", path.display()))?;

    Ok(parse_url_list(&content))
}

fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn generate_filename(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    format!("{}.html", sanitize_filename(stripped))
}
