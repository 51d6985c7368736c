//! Configuration management with serde serialization/deserialization
//!
//! This module holds the render service configuration: concurrency limits,
//! page timeouts, the readiness criterion used for navigation, the page
//! viewport and the ordered basic-auth rule list.

use crate::RenderError;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the render service
///
/// # Examples
///
/// ```rust
/// use botview::Config;
///
/// let config = Config {
///     max_concurrency: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of render jobs running at once (default: 10)
    pub max_concurrency: usize,

    /// Maximum number of jobs waiting for a slot (default: unbounded)
    ///
    /// When set, submissions beyond this bound fail with `QueueFull`
    /// before any browser work starts.
    pub max_backlog: Option<usize>,

    /// Deadline for a navigation to settle (default: 30 seconds)
    #[serde(with = "humantime_serde")]
    pub nav_timeout: Duration,

    /// Deadline for every other page operation (default: 30 seconds)
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Readiness criterion a navigation waits for (default: networkidle0)
    pub wait_until: WaitUntil,

    /// Page viewport, mobile sized by default
    pub viewport: Viewport,

    /// Ordered `prefix:user:pass` rules; the first matching prefix wins
    pub basic_auth: BasicAuthRules,

    /// Stylesheet injected into every rendered page after navigation
    pub stylesheet: Option<PathBuf>,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Name of the `<meta>` tag carrying the page's status code
    pub status_meta_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_backlog: None,
            nav_timeout: Duration::from_secs(30),
            default_timeout: Duration::from_secs(30),
            wait_until: WaitUntil::NetworkIdle0,
            viewport: Viewport::default(),
            basic_auth: BasicAuthRules::default(),
            stylesheet: None,
            chrome_path: None,
            status_meta_name: "prerender-status".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.max_concurrency == 0 {
            return Err(RenderError::Configuration(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.max_backlog == Some(0) {
            return Err(RenderError::Configuration(
                "max_backlog must be greater than 0 when set".to_string(),
            ));
        }

        if self.nav_timeout.is_zero() || self.default_timeout.is_zero() {
            return Err(RenderError::Configuration(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(RenderError::Configuration(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.status_meta_name.trim().is_empty() {
            return Err(RenderError::Configuration(
                "status_meta_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Browser viewport applied to every page
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 360)
    pub width: u32,

    /// Viewport height in pixels (default: 640)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 360,
            height: 640,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// When a navigation counts as finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
pub enum WaitUntil {
    /// The `load` event fired
    #[serde(rename = "load")]
    #[value(name = "load")]
    Load,
    /// The `DOMContentLoaded` event fired
    #[serde(rename = "domcontentloaded")]
    #[value(name = "domcontentloaded")]
    DomContentLoaded,
    /// No request in flight for 500 ms
    #[serde(rename = "networkidle0")]
    #[value(name = "networkidle0")]
    NetworkIdle0,
    /// At most two requests in flight for 500 ms
    #[serde(rename = "networkidle2")]
    #[value(name = "networkidle2")]
    NetworkIdle2,
}

impl WaitUntil {
    /// Whether navigation waits for the `load` event rather than
    /// `DOMContentLoaded`.
    pub fn waits_for_load(self) -> bool {
        !matches!(self, WaitUntil::DomContentLoaded)
    }

    /// In-flight request ceiling for the network-idle criteria.
    pub fn idle_threshold(self) -> Option<usize> {
        match self {
            WaitUntil::NetworkIdle0 => Some(0),
            WaitUntil::NetworkIdle2 => Some(2),
            WaitUntil::Load | WaitUntil::DomContentLoaded => None,
        }
    }
}

/// Username and password applied to a page before navigation
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials bound to a URL prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthRule {
    pub prefix: String,
    pub credentials: Credentials,
}

impl BasicAuthRule {
    pub fn matches(&self, url: &str) -> bool {
        url.starts_with(&self.prefix)
    }
}

impl FromStr for BasicAuthRule {
    type Err = RenderError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let mut parts = entry.trim().splitn(3, ':');
        let (Some(prefix), Some(username), Some(password)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RenderError::Configuration(format!(
                "basic auth entry '{}' must look like prefix:user:pass",
                redact_entry(entry)
            )));
        };

        let prefix = percent_decode_str(prefix)
            .decode_utf8()
            .map_err(|e| {
                RenderError::Configuration(format!("basic auth prefix is not valid UTF-8: {e}"))
            })?
            .into_owned();

        if prefix.is_empty() {
            return Err(RenderError::Configuration(
                "basic auth prefix must not be empty".to_string(),
            ));
        }

        Ok(Self {
            prefix,
            credentials: Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        })
    }
}

fn redact_entry(entry: &str) -> String {
    match entry.trim().split_once(':') {
        Some((prefix, _)) => format!("{prefix}:***"),
        None => entry.trim().to_string(),
    }
}

/// Ordered basic-auth rules, serialized as `prefix:user:pass,prefix:user:pass`
///
/// ```rust
/// use botview::BasicAuthRules;
///
/// let rules: BasicAuthRules = "https%3A%2F%2Fa%2F:u1:p1,https%3A%2F%2Fa%2Fb:u2:p2".parse().unwrap();
/// let credentials = rules.credentials_for("https://a/b/x").unwrap();
/// assert_eq!(credentials.username, "u1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct BasicAuthRules(Vec<BasicAuthRule>);

impl BasicAuthRules {
    pub fn new(rules: Vec<BasicAuthRule>) -> Self {
        Self(rules)
    }

    /// First rule in configured order whose prefix matches `url`.
    pub fn rule_for(&self, url: &str) -> Option<&BasicAuthRule> {
        self.0.iter().find(|rule| rule.matches(url))
    }

    pub fn credentials_for(&self, url: &str) -> Option<&Credentials> {
        self.rule_for(url).map(|rule| &rule.credentials)
    }

    pub fn rules(&self) -> &[BasicAuthRule] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromStr for BasicAuthRules {
    type Err = RenderError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        raw.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(BasicAuthRule::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl TryFrom<String> for BasicAuthRules {
    type Error = RenderError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<BasicAuthRules> for String {
    fn from(rules: BasicAuthRules) -> Self {
        rules
            .0
            .iter()
            .map(|rule| {
                format!(
                    "{}:{}:{}",
                    percent_encoding::utf8_percent_encode(
                        &rule.prefix,
                        percent_encoding::NON_ALPHANUMERIC
                    ),
                    rule.credentials.username,
                    rule.credentials.password
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// ```rust
/// use botview::{Config, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default());
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
    ]
}

/// Slack added on top of the longest render deadline for chromiumoxide's own
/// protocol request timeout.
const BROWSER_REQUEST_GRACE: Duration = Duration::from_secs(5);

/// chromiumoxide's per-request timeout; always longer than both render
/// deadlines so those fire first.
pub fn browser_request_timeout(config: &Config) -> Duration {
    config.nav_timeout.max(config.default_timeout) + BROWSER_REQUEST_GRACE
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .launch_timeout(config.nav_timeout)
        .request_timeout(browser_request_timeout(config))
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::BrowserLaunch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service_profile() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.max_backlog, None);
        assert_eq!(config.viewport.width, 360);
        assert_eq!(config.viewport.height, 640);
        assert_eq!(config.wait_until, WaitUntil::NetworkIdle0);
        assert!(config.basic_auth.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn first_matching_prefix_wins() {
        let rules: BasicAuthRules = "https%3A%2F%2Fa%2F:u1:p1,https%3A%2F%2Fa%2Fb:u2:p2"
            .parse()
            .unwrap();

        let credentials = rules.credentials_for("https://a/b/x").unwrap();
        assert_eq!(credentials.username, "u1");
        assert_eq!(credentials.password, "p1");
        assert!(rules.credentials_for("https://other/").is_none());
    }

    #[test]
    fn more_specific_rule_applies_when_listed_first() {
        let rules: BasicAuthRules = "https%3A%2F%2Fa%2Fb:u2:p2, https%3A%2F%2Fa%2F:u1:p1"
            .parse()
            .unwrap();
        assert_eq!(rules.credentials_for("https://a/b/x").unwrap().username, "u2");
        assert_eq!(rules.credentials_for("https://a/c").unwrap().username, "u1");
    }

    #[test]
    fn password_may_contain_colons() {
        let rule: BasicAuthRule = "https%3A%2F%2Fa:user:pa:ss".parse().unwrap();
        assert_eq!(rule.prefix, "https://a");
        assert_eq!(rule.credentials.password, "pa:ss");
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!("https%3A%2F%2Fa:onlyuser".parse::<BasicAuthRules>().is_err());
        assert!(":u:p".parse::<BasicAuthRules>().is_err());
        assert!("".parse::<BasicAuthRules>().unwrap().is_empty());
        assert_eq!(" , ".parse::<BasicAuthRules>().unwrap().len(), 0);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "bot".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("bot"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn only_domcontentloaded_skips_the_load_event() {
        assert!(!WaitUntil::DomContentLoaded.waits_for_load());
        assert!(WaitUntil::Load.waits_for_load());
        assert!(WaitUntil::NetworkIdle0.waits_for_load());
        assert!(WaitUntil::NetworkIdle2.waits_for_load());
        assert_eq!(WaitUntil::DomContentLoaded.idle_threshold(), None);
    }

    #[test]
    fn browser_request_timeout_outlasts_render_deadlines() {
        let config = Config {
            nav_timeout: Duration::from_secs(60),
            default_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(browser_request_timeout(&config) > config.nav_timeout);

        let config = Config {
            nav_timeout: Duration::from_secs(5),
            default_timeout: Duration::from_secs(20),
            ..Default::default()
        };
        assert!(browser_request_timeout(&config) > config.default_timeout);

        let config = Config::default();
        assert!(browser_request_timeout(&config) > config.nav_timeout);
    }

    #[test]
    fn config_file_uses_human_durations_and_auth_string() {
        let json = r#"{
            "max_concurrency": 3,
            "nav_timeout": "15s",
            "wait_until": "networkidle2",
            "basic_auth": "https%3A%2F%2Fstage.example%2F:bot:secret"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.nav_timeout, Duration::from_secs(15));
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.wait_until, WaitUntil::NetworkIdle2);
        assert_eq!(
            config
                .basic_auth
                .credentials_for("https://stage.example/page")
                .unwrap()
                .username,
            "bot"
        );

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["basic_auth"], "https%3A%2F%2Fstage%2Eexample%2F:bot:secret");
        assert_eq!(back["nav_timeout"], "15s");
    }

    #[test]
    fn validation_rejects_zero_limits() {
        let config = Config {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_backlog: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            nav_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn idle_thresholds() {
        assert_eq!(WaitUntil::NetworkIdle0.idle_threshold(), Some(0));
        assert_eq!(WaitUntil::NetworkIdle2.idle_threshold(), Some(2));
        assert_eq!(WaitUntil::Load.idle_threshold(), None);
    }

    #[test]
    fn chrome_args_follow_viewport() {
        let args = get_chrome_args(&Config::default());
        assert!(args.contains(&"--window-size=360,640".to_string()));
        assert!(args.contains(&"--headless".to_string()));
    }
}
