//! File configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or an explicit path), then applies
//! `COMMAND_HOST_LOG_LEVEL` and `COMMAND_HOST_NAMESPACE` overrides. The
//! `[plugins.<id>]` tables seed the live [`HostConfig`] that extensions read
//! through their API.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::AppError;
use crate::platform::config::HostConfig;

/// Console (stdin) channel configuration.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Whether the console channel is started.
    pub enabled: bool,
    /// Namespace (team id) commands typed at the console are executed in.
    pub namespace: String,
    /// Actor identity attached to console invocations.
    pub actor: String,
    /// Channel id attached to console invocations.
    pub channel_id: String,
}

/// Dispatcher and lifecycle timing.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound for a single command handler invocation.
    pub timeout: Duration,
    /// Upper bound for one lifecycle hook (activate, deactivate, config change).
    pub hook_timeout: Duration,
}

/// Fully-resolved host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host_name: String,
    pub log_level: String,
    /// Optional log file (already expanded, no `~`). Stderr when absent.
    pub log_file: Option<PathBuf>,
    pub console: ConsoleConfig,
    pub dispatch: DispatchConfig,
    pub site_name: String,
    /// Per-extension configuration subtrees, keyed by extension id.
    pub plugins: BTreeMap<String, serde_json::Value>,
}

impl Config {
    /// Build the initial live configuration snapshot from the file config.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            site_name: self.site_name.clone(),
            plugins: self.plugins.clone(),
        }
    }
}

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    host: RawHost,
    #[serde(default)]
    console: RawConsole,
    #[serde(default)]
    dispatch: RawDispatch,
    #[serde(default)]
    site: RawSite,
    #[serde(default)]
    plugins: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawHost {
    name: String,
    log_level: String,
    #[serde(default)]
    log_file: Option<String>,
}

#[derive(Deserialize)]
struct RawConsole {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    namespace: String,
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(default = "default_channel_id")]
    channel_id: String,
}

impl Default for RawConsole {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: String::new(),
            actor: default_actor(),
            channel_id: default_channel_id(),
        }
    }
}

#[derive(Deserialize)]
struct RawDispatch {
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_hook_timeout_ms")]
    hook_timeout_ms: u64,
}

impl Default for RawDispatch {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            hook_timeout_ms: default_hook_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawSite {
    #[serde(default = "default_site_name")]
    name: String,
}

impl Default for RawSite {
    fn default() -> Self {
        Self { name: default_site_name() }
    }
}

fn default_true() -> bool { true }
fn default_actor() -> String { "console".to_string() }
fn default_channel_id() -> String { "console0".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_hook_timeout_ms() -> u64 { 10_000 }
fn default_site_name() -> String { "Command Host".to_string() }

/// Load config from `path` (or `config/default.toml`), then apply env-var overrides.
pub fn load(path: Option<&Path>) -> Result<Config, AppError> {
    let log_level_override = env::var("COMMAND_HOST_LOG_LEVEL").ok();
    let namespace_override = env::var("COMMAND_HOST_NAMESPACE").ok();
    load_from(
        path.unwrap_or_else(|| Path::new("config/default.toml")),
        log_level_override.as_deref(),
        namespace_override.as_deref(),
    )
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    log_level_override: Option<&str>,
    namespace_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    if parsed.dispatch.timeout_ms == 0 {
        return Err(AppError::Config("dispatch.timeout_ms must be greater than 0".into()));
    }
    if parsed.dispatch.hook_timeout_ms == 0 {
        return Err(AppError::Config("dispatch.hook_timeout_ms must be greater than 0".into()));
    }

    let h = parsed.host;
    let log_level = log_level_override.unwrap_or(&h.log_level).to_string();
    let namespace = namespace_override
        .map(str::to_string)
        .unwrap_or(parsed.console.namespace);

    Ok(Config {
        host_name: h.name,
        log_level,
        log_file: h.log_file.as_deref().map(expand_home),
        console: ConsoleConfig {
            enabled: parsed.console.enabled,
            namespace,
            actor: parsed.console.actor,
            channel_id: parsed.console.channel_id,
        },
        dispatch: DispatchConfig {
            timeout: Duration::from_millis(parsed.dispatch.timeout_ms),
            hook_timeout: Duration::from_millis(parsed.dispatch.hook_timeout_ms),
        },
        site_name: parsed.site.name,
        plugins: parsed.plugins,
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl Config {
    /// Safe `Config` for tests — short timeouts, console disabled.
    pub fn test_default() -> Self {
        Self {
            host_name: "test".into(),
            log_level: "info".into(),
            log_file: None,
            console: ConsoleConfig {
                enabled: false,
                namespace: "team1".into(),
                actor: "tester".into(),
                channel_id: "console0".into(),
            },
            dispatch: DispatchConfig {
                timeout: Duration::from_secs(5),
                hook_timeout: Duration::from_secs(5),
            },
            site_name: default_site_name(),
            plugins: BTreeMap::new(),
        }
    }
}
