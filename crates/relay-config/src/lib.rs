use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use relay_core::{
    CoreError, DedupRule, MonitorSettings, SettingsSource, DEFAULT_ENVIRONMENT,
    DEFAULT_HOUSEKEEPING_MARKER,
};

pub const ENV_RELAY_CONFIG: &str = "RELAY_CONFIG";

const DEFAULT_STORAGE_BACKEND: &str = "sqlite";
const DEFAULT_MONITOR_ENABLED: bool = true;
const DEFAULT_MONITOR_INTERVAL_MINUTES: u64 = 60;
const MAX_MONITOR_INTERVAL_MINUTES: u64 = 24 * 60;
const DEFAULT_NOTIFY_MAX_ITEMS: usize = 10;
const MAX_NOTIFY_MAX_ITEMS: usize = 100;
const DEFAULT_SOURCE_BASE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_SOURCE_HISTORY_PATH: &str = "/api/tickets/{ticket_id}/history";
const DEFAULT_SOURCE_ATTACHMENT_PATH: &str = "/api/tickets/{ticket_id}/attachments/{name}";
const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SOURCE_CREATE_PATH: &str = "/api/tickets";
const DEFAULT_INTAKE_POLL_SECONDS: u64 = 60;
const MIN_INTAKE_POLL_SECONDS: u64 = 5;
const MAX_INTAKE_POLL_SECONDS: u64 = 3600;
const FLOW_KINDS: &[&str] = &["TRANSITION", "COMMENT", "ATTACHMENT"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<ConfigError> for CoreError {
    fn from(error: ConfigError) -> Self {
        CoreError::Configuration(error.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    #[serde(default)]
    pub storage: StorageConfigToml,
    #[serde(default)]
    pub monitor: MonitorConfigToml,
    #[serde(default)]
    pub dedup: DedupConfigToml,
    #[serde(default)]
    pub intake: IntakeConfigToml,
    #[serde(default)]
    pub notify: NotifyConfigToml,
    #[serde(default)]
    pub source: SourceConfigToml,
    #[serde(default)]
    pub outbox: OutboxConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfigToml {
    /// `sqlite` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub sqlite_path: String,
}

impl Default for StorageConfigToml {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            data_dir: default_data_dir(),
            sqlite_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorConfigToml {
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub excluded_senders: Vec<String>,
    #[serde(default = "default_housekeeping_marker")]
    pub housekeeping_marker: String,
}

impl Default for MonitorConfigToml {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            interval_minutes: default_monitor_interval_minutes(),
            excluded_senders: Vec::new(),
            housekeeping_marker: default_housekeeping_marker(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupConfigToml {
    /// Ordered patterns. Entries with a capture group are regular
    /// expressions, the rest are keywords such as `MAC:`.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntakeConfigToml {
    #[serde(default)]
    pub blocked_senders: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Environment new tickets are created in.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_intake_enabled")]
    pub enabled: bool,
    /// Spool directory of inbound messages; defaults to `<data_dir>/inbox`.
    #[serde(default)]
    pub inbox_dir: String,
    #[serde(default = "default_intake_poll_seconds")]
    pub poll_seconds: u64,
}

impl Default for IntakeConfigToml {
    fn default() -> Self {
        Self {
            blocked_senders: Vec::new(),
            allowed_domains: Vec::new(),
            environment: default_environment(),
            enabled: default_intake_enabled(),
            inbox_dir: String::new(),
            poll_seconds: default_intake_poll_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyConfigToml {
    #[serde(default = "default_notify_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub ticket_link_template: String,
    #[serde(default)]
    pub flow: Vec<FlowRuleToml>,
}

impl Default for NotifyConfigToml {
    fn default() -> Self {
        Self {
            max_items: default_notify_max_items(),
            ticket_link_template: String::new(),
            flow: Vec::new(),
        }
    }
}

/// One `[[notify.flow]]` entry. Exactly one of `state_name` and `kind` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowRuleToml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_description: Option<String>,
    #[serde(default)]
    pub show_comment: bool,
    #[serde(default)]
    pub show_assignees: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfigToml {
    #[serde(default = "default_source_base_url")]
    pub base_url: String,
    #[serde(default = "default_source_history_path")]
    pub history_path: String,
    #[serde(default = "default_source_attachment_path")]
    pub attachment_path: String,
    #[serde(default = "default_source_create_path")]
    pub create_path: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfigToml {
    fn default() -> Self {
        Self {
            base_url: default_source_base_url(),
            history_path: default_source_history_path(),
            attachment_path: default_source_attachment_path(),
            create_path: default_source_create_path(),
            api_token: String::new(),
            timeout_secs: default_source_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxConfigToml {
    #[serde(default)]
    pub directory: String,
}

impl RelayConfig {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        let configured = self.storage.sqlite_path.trim();
        if configured.is_empty() {
            self.data_dir().join("ledger.db")
        } else {
            PathBuf::from(configured)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        let configured = self.outbox.directory.trim();
        if configured.is_empty() {
            self.data_dir().join("outbox")
        } else {
            PathBuf::from(configured)
        }
    }

    pub fn uses_memory_storage(&self) -> bool {
        self.storage.backend == "memory"
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            enabled: self.monitor.enabled,
            interval: Duration::from_secs(self.monitor.interval_minutes.saturating_mul(60)),
            excluded_senders: self.monitor.excluded_senders.clone(),
        }
    }

    pub fn dedup_rules(&self) -> Vec<DedupRule> {
        self.dedup
            .patterns
            .iter()
            .map(|pattern| DedupRule::infer(pattern.as_str()))
            .collect()
    }

    pub fn ticket_link_template(&self) -> Option<String> {
        let template = self.notify.ticket_link_template.trim();
        (!template.is_empty()).then(|| template.to_owned())
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }

    pub fn inbox_dir(&self) -> PathBuf {
        let configured = self.intake.inbox_dir.trim();
        if configured.is_empty() {
            self.data_dir().join("inbox")
        } else {
            PathBuf::from(configured)
        }
    }

    pub fn intake_poll_interval(&self) -> Duration {
        Duration::from_secs(self.intake.poll_seconds)
    }
}

pub fn load_from_env() -> Result<RelayConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<RelayConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home
        .join(".config")
        .join("ticket-relay")
        .join("config.toml"))
}

pub fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_RELAY_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "RELAY_CONFIG contained invalid UTF-8",
        )),
    }
}

/// Monitor settings read from the config file on every call, so edits take
/// effect on the next cycle without a restart.
#[derive(Debug, Clone)]
pub struct FileSettingsSource {
    path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for FileSettingsSource {
    fn snapshot(&self) -> Result<MonitorSettings, CoreError> {
        let config = read_config(&self.path)?;
        Ok(config.monitor_settings())
    }
}

fn resolve_home_dir() -> Option<PathBuf> {
    ["HOME", "USERPROFILE"].iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
}

fn default_storage_backend() -> String {
    DEFAULT_STORAGE_BACKEND.to_owned()
}

/// `~/.local/share/ticket-relay`, or a temp-dir fallback without a home.
fn default_data_dir() -> String {
    resolve_home_dir()
        .map(|home| home.join(".local").join("share"))
        .unwrap_or_else(std::env::temp_dir)
        .join("ticket-relay")
        .to_string_lossy()
        .into_owned()
}

fn default_monitor_enabled() -> bool {
    DEFAULT_MONITOR_ENABLED
}

fn default_monitor_interval_minutes() -> u64 {
    DEFAULT_MONITOR_INTERVAL_MINUTES
}

fn default_housekeeping_marker() -> String {
    DEFAULT_HOUSEKEEPING_MARKER.to_owned()
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_owned()
}

fn default_notify_max_items() -> usize {
    DEFAULT_NOTIFY_MAX_ITEMS
}

fn default_source_base_url() -> String {
    DEFAULT_SOURCE_BASE_URL.to_owned()
}

fn default_source_history_path() -> String {
    DEFAULT_SOURCE_HISTORY_PATH.to_owned()
}

fn default_source_attachment_path() -> String {
    DEFAULT_SOURCE_ATTACHMENT_PATH.to_owned()
}

fn default_source_timeout_secs() -> u64 {
    DEFAULT_SOURCE_TIMEOUT_SECS
}

fn default_source_create_path() -> String {
    DEFAULT_SOURCE_CREATE_PATH.to_owned()
}

fn default_intake_enabled() -> bool {
    true
}

fn default_intake_poll_seconds() -> u64 {
    DEFAULT_INTAKE_POLL_SECONDS
}

fn persist_config(path: &Path, config: &RelayConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!("cannot render config {}: {err}", path.display()))
    })?;
    std::fs::write(path, rendered)
        .map_err(|err| ConfigError::configuration(format!("cannot write config {}: {err}", path.display())))
}

fn parse_config(path: &Path, raw: &str) -> Result<RelayConfig, ConfigError> {
    toml::from_str(raw)
        .map_err(|err| ConfigError::configuration(format!("cannot parse config {}: {err}", path.display())))
}

/// Startup load: writes defaults when the file is missing and rewrites it
/// when normalization changed a value.
fn load_or_create_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    if !path.exists() {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                ConfigError::configuration(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        let defaults = RelayConfig::default();
        persist_config(path, &defaults)?;
        tracing::info!(path = %path.display(), "wrote default relay config");
        return Ok(defaults);
    }

    let mut config = read_raw(path).and_then(|raw| parse_config(path, &raw))?;
    if normalize_config(&mut config)? {
        persist_config(path, &config)?;
        tracing::info!(path = %path.display(), "normalized relay config");
    }
    Ok(config)
}

fn read_raw(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|err| ConfigError::configuration(format!("cannot read config {}: {err}", path.display())))
}

/// Reads and normalizes the file without touching it. A missing file is an
/// error here.
pub fn read_config(path: impl AsRef<Path>) -> Result<RelayConfig, ConfigError> {
    let path = path.as_ref();
    let mut config = parse_config(path, &read_raw(path)?)?;
    normalize_config(&mut config)?;
    Ok(config)
}

fn normalize_config(config: &mut RelayConfig) -> Result<bool, ConfigError> {
    let mut changed = false;

    changed |= normalize_storage_config(&mut config.storage)?;
    changed |= normalize_monitor_config(&mut config.monitor);
    changed |= normalize_string_vec(&mut config.dedup.patterns);
    changed |= normalize_string_vec(&mut config.dedup.allowed_senders);
    changed |= normalize_string_vec(&mut config.intake.blocked_senders);
    changed |= normalize_string_vec(&mut config.intake.allowed_domains);
    changed |= normalize_intake_config(&mut config.intake);
    changed |= normalize_notify_config(&mut config.notify)?;
    changed |= normalize_source_config(&mut config.source);
    changed |= normalize_trimmed(&mut config.outbox.directory);

    Ok(changed)
}

fn normalize_storage_config(config: &mut StorageConfigToml) -> Result<bool, ConfigError> {
    let mut changed = false;
    let backend = config.backend.trim().to_ascii_lowercase();
    let backend = if backend.is_empty() {
        default_storage_backend()
    } else {
        backend
    };
    if !matches!(backend.as_str(), "sqlite" | "memory") {
        return Err(ConfigError::configuration(format!(
            "Unsupported storage.backend '{}'; expected `sqlite` or `memory`",
            config.backend.trim()
        )));
    }
    if config.backend != backend {
        config.backend = backend;
        changed = true;
    }
    changed |= normalize_non_empty_string(&mut config.data_dir, default_data_dir());
    changed |= normalize_trimmed(&mut config.sqlite_path);
    Ok(changed)
}

fn normalize_monitor_config(config: &mut MonitorConfigToml) -> bool {
    let mut changed = false;
    let bounded = config
        .interval_minutes
        .clamp(1, MAX_MONITOR_INTERVAL_MINUTES);
    if bounded != config.interval_minutes {
        config.interval_minutes = bounded;
        changed = true;
    }
    changed |= normalize_string_vec(&mut config.excluded_senders);
    changed |= normalize_trimmed(&mut config.housekeeping_marker);
    changed
}

fn normalize_notify_config(config: &mut NotifyConfigToml) -> Result<bool, ConfigError> {
    let mut changed = false;
    let bounded = config.max_items.clamp(1, MAX_NOTIFY_MAX_ITEMS);
    if bounded != config.max_items {
        config.max_items = bounded;
        changed = true;
    }
    changed |= normalize_trimmed(&mut config.ticket_link_template);

    for (position, rule) in config.flow.iter_mut().enumerate() {
        changed |= normalize_optional(&mut rule.state_name);
        changed |= normalize_optional(&mut rule.step_description);
        if let Some(kind) = rule.kind.as_mut() {
            let upper = kind.trim().to_ascii_uppercase();
            if !FLOW_KINDS.contains(&upper.as_str()) {
                return Err(ConfigError::configuration(format!(
                    "notify.flow[{position}] has unknown kind '{}'; expected one of {}",
                    kind.trim(),
                    FLOW_KINDS.join(", ")
                )));
            }
            if *kind != upper {
                *kind = upper;
                changed = true;
            }
        }
        if rule.state_name.is_some() == rule.kind.is_some() {
            return Err(ConfigError::configuration(format!(
                "notify.flow[{position}] must set exactly one of `state_name` or `kind`"
            )));
        }
    }
    Ok(changed)
}

fn normalize_source_config(config: &mut SourceConfigToml) -> bool {
    let mut changed = false;
    changed |= normalize_non_empty_string(&mut config.base_url, default_source_base_url());
    let trimmed = config.base_url.trim_end_matches('/').to_owned();
    if trimmed != config.base_url && !trimmed.is_empty() {
        config.base_url = trimmed;
        changed = true;
    }
    changed |= normalize_non_empty_string(&mut config.history_path, default_source_history_path());
    changed |=
        normalize_non_empty_string(&mut config.attachment_path, default_source_attachment_path());
    changed |= normalize_non_empty_string(&mut config.create_path, default_source_create_path());
    changed |= normalize_trimmed(&mut config.api_token);
    if config.timeout_secs == 0 {
        config.timeout_secs = default_source_timeout_secs();
        changed = true;
    }
    changed
}

fn normalize_intake_config(config: &mut IntakeConfigToml) -> bool {
    let mut changed = normalize_environment(&mut config.environment);
    changed |= normalize_trimmed(&mut config.inbox_dir);
    let bounded = config
        .poll_seconds
        .clamp(MIN_INTAKE_POLL_SECONDS, MAX_INTAKE_POLL_SECONDS);
    if bounded != config.poll_seconds {
        config.poll_seconds = bounded;
        changed = true;
    }
    changed
}

fn normalize_environment(value: &mut String) -> bool {
    let normalized = value.trim().to_ascii_uppercase();
    let normalized = if normalized.is_empty() {
        default_environment()
    } else {
        normalized
    };
    if *value != normalized {
        *value = normalized;
        return true;
    }
    false
}

fn normalize_non_empty_string(value: &mut String, default: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != default {
            *value = default;
            return true;
        }
        return false;
    }

    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_trimmed(value: &mut String) -> bool {
    let trimmed = value.trim();
    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_optional(value: &mut Option<String>) -> bool {
    let normalized = value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);
    if *value != normalized {
        *value = normalized;
        return true;
    }
    false
}

fn normalize_string_vec(values: &mut Vec<String>) -> bool {
    let normalized = values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    if *values != normalized {
        *values = normalized;
        return true;
    }
    false
}
