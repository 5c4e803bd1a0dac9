use cloudshim_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Backend base URLs in fallback order: daily sandbox, autopush sandbox, production.
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://autopush-cloudcode-pa.sandbox.googleapis.com",
    "https://cloudcode-pa.googleapis.com",
];

/// Main cloudshim configuration
///
/// Configuration is loaded from (in priority order):
/// 1. `cloudshim.jsonc` - JSON with comments
/// 2. `cloudshim.json` - Standard JSON
/// 3. `cloudshim.yml` / `cloudshim.yaml` - YAML format
///
/// Also checks hidden variants (`.cloudshim.*`) and `~/.config/cloudshim/` for global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShimConfig {
    /// Outbound transport, retry, and rewrite settings
    #[serde(default)]
    pub transport: TransportSettings,

    /// OAuth token storage and refresh client
    #[serde(default)]
    pub oauth: OAuthSettings,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Transport settings
///
/// # Example
///
/// ```yaml
/// transport:
///   project_id: my-project
///   tool_prefix: mcp_
///   timeout_secs: 600
///   retry:
///     max_retries: 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Candidate base URLs, tried in order on fallback
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Project placed in the request envelope (default: stored token's project,
    /// then a built-in constant)
    #[serde(default)]
    pub project_id: Option<String>,

    /// Prefix added to outbound tool names (default: mcp_)
    #[serde(default = "default_tool_prefix")]
    pub tool_prefix: String,

    /// Whole-request timeout in seconds (default: 600)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds (default: 30)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Optional HTTP(S) proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            project_id: None,
            tool_prefix: default_tool_prefix(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            proxy: None,
            retry: RetrySettings::default(),
        }
    }
}

fn default_endpoints() -> Vec<String> {
    DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect()
}

fn default_tool_prefix() -> String {
    "mcp_".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Retry and backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Failures tolerated per endpoint before giving up on it (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Ceiling on physical sends across all endpoints (default: 20)
    #[serde(default = "default_max_total_attempts")]
    pub max_total_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of the delay added as random jitter (default: 0.1)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Server-directed delays above this move to the next endpoint instead of
    /// sleeping (default: 5000)
    #[serde(default = "default_long_delay_threshold_ms")]
    pub long_delay_threshold_ms: u64,

    /// Delay used when `Retry-After` is present but unparsable (default: 2000)
    #[serde(default = "default_retry_after_ms")]
    pub default_retry_after_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_total_attempts: default_max_total_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            long_delay_threshold_ms: default_long_delay_threshold_ms(),
            default_retry_after_ms: default_retry_after_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_total_attempts() -> u32 {
    20
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_long_delay_threshold_ms() -> u64 {
    5_000
}

fn default_retry_after_ms() -> u64 {
    2_000
}

// ============================================================================
// OAuth Configuration
// ============================================================================

/// OAuth settings
///
/// ```yaml
/// oauth:
///   client_id: ${CLOUDSHIM_CLIENT_ID}
///   client_secret: ${CLOUDSHIM_CLIENT_SECRET}
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthSettings {
    /// Token file (default: platform data dir `cloudshim/oauth.json`)
    #[serde(default)]
    pub token_path: Option<PathBuf>,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Token endpoint override (default: Google's)
    #[serde(default)]
    pub token_url: Option<String>,
}
