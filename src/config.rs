//! Configuration loader and validator for the event relay.
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::isolation::IsolationMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub transformer: Transformer,
    #[serde(default)]
    pub webhook: Webhook,
    #[serde(default)]
    pub router: Router,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Transformation service client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Transformer {
    pub url: String,
    pub timeout_ms: u64,
    pub destination_timeout_ms: u64,
    pub max_retry: u32,
    pub retry_sleep_ms: u64,
    pub compaction_enabled: bool,
    pub oauth_v2_enabled: bool,
    pub oauth_expiration_time_diff_secs: u64,
    pub features_poll_interval_ms: u64,
}

impl Default for Transformer {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: 600_000,
            destination_timeout_ms: 30_000,
            max_retry: 30,
            retry_sleep_ms: 100,
            compaction_enabled: false,
            oauth_v2_enabled: false,
            oauth_expiration_time_diff_secs: 60,
            features_poll_interval_ms: 10_000,
        }
    }
}

/// Wire-format adapter used for a source type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AdapterVersion {
    #[default]
    V0,
    V1,
}

impl AdapterVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterVersion::V0 => "v0",
            AdapterVersion::V1 => "v1",
        }
    }
}

/// Webhook ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Webhook {
    pub max_req_size_kb: usize,
    pub max_transformer_process: usize,
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_pending_requests: usize,
    pub max_retry: u32,
    pub retry_sleep_ms: u64,
    pub source_list_for_parsing_params: Vec<String>,
    pub forward_get_request_for_srcs: Vec<String>,
    pub adapter_versions: HashMap<String, AdapterVersion>,
}

impl Default for Webhook {
    fn default() -> Self {
        Self {
            max_req_size_kb: 4000,
            max_transformer_process: 64,
            max_batch_size: 32,
            batch_timeout_ms: 20,
            max_pending_requests: 1000,
            max_retry: 5,
            retry_sleep_ms: 100,
            source_list_for_parsing_params: vec!["shopify".into(), "adjust".into()],
            forward_get_request_for_srcs: Vec::new(),
            adapter_versions: HashMap::new(),
        }
    }
}

/// Router scheduling settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Router {
    pub isolation_mode: IsolationMode,
    pub isolation_custom_val: String,
}

/// A statically configured webhook source, keyed by write key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceEntry {
    pub write_key: String,
    pub source_id: String,
    pub workspace_id: String,
    pub source_def_name: String,
    #[serde(default = "default_source_category")]
    pub source_category: String,
}

fn default_source_category() -> String {
    "webhook".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.listen_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.listen_addr must be non-empty"));
    }

    if cfg.transformer.url.trim().is_empty() {
        return Err(ConfigError::Invalid("transformer.url must be non-empty"));
    }
    if url::Url::parse(&cfg.transformer.url).is_err() {
        return Err(ConfigError::Invalid("transformer.url must be an absolute URL"));
    }
    if cfg.transformer.timeout_ms == 0 {
        return Err(ConfigError::Invalid("transformer.timeout_ms must be > 0"));
    }
    if cfg.transformer.destination_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "transformer.destination_timeout_ms must be > 0",
        ));
    }

    let wh = &cfg.webhook;
    if wh.max_req_size_kb == 0 {
        return Err(ConfigError::Invalid("webhook.max_req_size_kb must be > 0"));
    }
    if wh.max_transformer_process == 0 {
        return Err(ConfigError::Invalid(
            "webhook.max_transformer_process must be > 0",
        ));
    }
    if wh.max_batch_size == 0 {
        return Err(ConfigError::Invalid("webhook.max_batch_size must be > 0"));
    }
    if wh.max_pending_requests == 0 {
        return Err(ConfigError::Invalid("webhook.max_pending_requests must be > 0"));
    }

    let mut write_keys = HashSet::new();
    for source in &cfg.sources {
        if source.write_key.trim().is_empty() {
            return Err(ConfigError::Invalid("sources[].write_key must be non-empty"));
        }
        if source.source_def_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "sources[].source_def_name must be non-empty",
            ));
        }
        if !write_keys.insert(source.write_key.as_str()) {
            return Err(ConfigError::Invalid("sources[].write_key must be unique"));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen_addr: "0.0.0.0:8080"

transformer:
  url: "http://localhost:9090"
  timeout_ms: 600000
  destination_timeout_ms: 30000
  max_retry: 30
  retry_sleep_ms: 100
  compaction_enabled: false
  oauth_v2_enabled: false
  oauth_expiration_time_diff_secs: 60
  features_poll_interval_ms: 10000

webhook:
  max_req_size_kb: 4000
  max_transformer_process: 64
  max_batch_size: 32
  batch_timeout_ms: 20
  max_pending_requests: 1000
  max_retry: 5
  retry_sleep_ms: 100
  source_list_for_parsing_params:
    - shopify
    - adjust
  forward_get_request_for_srcs:
    - adjust
  adapter_versions:
    shopify: v1

router:
  isolation_mode: destination
  isolation_custom_val: ""

sources:
  - write_key: "WRITE_KEY_1"
    source_id: "source-1"
    workspace_id: "workspace-1"
    source_def_name: "Shopify"
    source_category: "webhook"
"#
}

/// A shared, live-reloadable value. Clones share the same cell, so a
/// component holding a clone observes every `store`.
pub struct Reloadable<T>(Arc<RwLock<T>>);

impl<T> Clone for Reloadable<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for Reloadable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reloadable").field(&*self.0.read()).finish()
    }
}

impl<T: Clone> Reloadable<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn current_value(&self) -> T {
        self.0.read().clone()
    }

    pub fn store(&self, value: T) {
        *self.0.write() = value;
    }
}

fn lowercased(names: &[String]) -> Vec<String> {
    names.iter().map(|s| s.to_ascii_lowercase()).collect()
}

/// Runtime view of the webhook settings.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub transformer_url: String,
    pub transformer_timeout: Duration,
    pub max_transformer_process: usize,
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub max_pending_requests: usize,
    pub max_req_size_kb: Reloadable<usize>,
    pub max_retry: Reloadable<u32>,
    pub retry_sleep: Reloadable<Duration>,
    pub source_list_for_parsing_params: Reloadable<Vec<String>>,
    pub forward_get_request_for_srcs: Reloadable<HashSet<String>>,
    pub adapter_versions: Reloadable<HashMap<String, AdapterVersion>>,
}

impl WebhookSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let wh = &cfg.webhook;
        Self {
            transformer_url: cfg.transformer.url.trim_end_matches('/').to_string(),
            transformer_timeout: Duration::from_millis(cfg.transformer.timeout_ms),
            max_transformer_process: wh.max_transformer_process,
            max_batch_size: wh.max_batch_size,
            batch_timeout: Duration::from_millis(wh.batch_timeout_ms),
            max_pending_requests: wh.max_pending_requests,
            max_req_size_kb: Reloadable::new(wh.max_req_size_kb),
            max_retry: Reloadable::new(wh.max_retry),
            retry_sleep: Reloadable::new(Duration::from_millis(wh.retry_sleep_ms)),
            source_list_for_parsing_params: Reloadable::new(lowercased(
                &wh.source_list_for_parsing_params,
            )),
            forward_get_request_for_srcs: Reloadable::new(
                lowercased(&wh.forward_get_request_for_srcs)
                    .into_iter()
                    .collect(),
            ),
            adapter_versions: Reloadable::new(adapter_map(&wh.adapter_versions)),
        }
    }

    /// Apply the reloadable subset of `cfg`. Pool sizes and queue bounds keep
    /// their startup values.
    pub fn reload(&self, cfg: &Config) {
        let wh = &cfg.webhook;
        self.max_req_size_kb.store(wh.max_req_size_kb);
        self.max_retry.store(wh.max_retry);
        self.retry_sleep
            .store(Duration::from_millis(wh.retry_sleep_ms));
        self.source_list_for_parsing_params
            .store(lowercased(&wh.source_list_for_parsing_params));
        self.forward_get_request_for_srcs
            .store(lowercased(&wh.forward_get_request_for_srcs).into_iter().collect());
        self.adapter_versions.store(adapter_map(&wh.adapter_versions));
    }
}

fn adapter_map(versions: &HashMap<String, AdapterVersion>) -> HashMap<String, AdapterVersion> {
    versions
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), *v))
        .collect()
}

/// Runtime view of the router transformer settings.
#[derive(Debug, Clone)]
pub struct TransformerSettings {
    pub url: String,
    pub timeout: Duration,
    pub destination_timeout: Duration,
    pub max_retry: Reloadable<u32>,
    pub retry_sleep: Reloadable<Duration>,
    pub compaction_enabled: Reloadable<bool>,
    pub oauth_v2_enabled: Reloadable<bool>,
    pub oauth_expiration_time_diff: Reloadable<Duration>,
}

impl TransformerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let t = &cfg.transformer;
        Self {
            url: t.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(t.timeout_ms),
            destination_timeout: Duration::from_millis(t.destination_timeout_ms),
            max_retry: Reloadable::new(t.max_retry),
            retry_sleep: Reloadable::new(Duration::from_millis(t.retry_sleep_ms)),
            compaction_enabled: Reloadable::new(t.compaction_enabled),
            oauth_v2_enabled: Reloadable::new(t.oauth_v2_enabled),
            oauth_expiration_time_diff: Reloadable::new(Duration::from_secs(
                t.oauth_expiration_time_diff_secs,
            )),
        }
    }

    pub fn reload(&self, cfg: &Config) {
        let t = &cfg.transformer;
        self.max_retry.store(t.max_retry);
        self.retry_sleep.store(Duration::from_millis(t.retry_sleep_ms));
        self.compaction_enabled.store(t.compaction_enabled);
        self.oauth_v2_enabled.store(t.oauth_v2_enabled);
        self.oauth_expiration_time_diff
            .store(Duration::from_secs(t.oauth_expiration_time_diff_secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.router.isolation_mode, IsolationMode::Destination);
        assert_eq!(
            cfg.webhook.adapter_versions.get("shopify"),
            Some(&AdapterVersion::V1)
        );
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "app:\n  data_dir: ./data\ntransformer:\n  url: http://localhost:9090\n",
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.transformer.max_retry, 30);
        assert_eq!(cfg.webhook, Webhook::default());
        assert_eq!(cfg.router.isolation_mode, IsolationMode::None);
        assert!(cfg.sources.is_empty());
    }

    #[test]
    fn invalid_transformer_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.transformer.url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("transformer.url")),
            _ => panic!("wrong error"),
        }

        cfg.transformer.url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_webhook_bounds() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.webhook.max_req_size_kb = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_req_size_kb")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.webhook.max_transformer_process = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.webhook.max_batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_write_keys_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        let dup = cfg.sources[0].clone();
        cfg.sources.push(dup);
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("unique")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.sources[0].write_key, "WRITE_KEY_1");
    }

    #[test]
    fn reloadable_clones_observe_updates() {
        let original = Reloadable::new(10usize);
        let held = original.clone();
        original.store(20);
        assert_eq!(held.current_value(), 20);
    }

    #[test]
    fn webhook_settings_reload_reaches_holders() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        let settings = WebhookSettings::from_config(&cfg);
        let size_cap = settings.max_req_size_kb.clone();
        assert!(settings
            .forward_get_request_for_srcs
            .current_value()
            .contains("adjust"));

        cfg.webhook.max_req_size_kb = 1;
        cfg.webhook.forward_get_request_for_srcs = vec!["Shopify".into()];
        settings.reload(&cfg);

        assert_eq!(size_cap.current_value(), 1);
        let allowed = settings.forward_get_request_for_srcs.current_value();
        assert!(allowed.contains("shopify"));
        assert!(!allowed.contains("adjust"));
    }

    #[test]
    fn transformer_settings_trim_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.transformer.url = "http://transformer:9090/".into();
        let settings = TransformerSettings::from_config(&cfg);
        assert_eq!(settings.url, "http://transformer:9090");
        assert!(!settings.compaction_enabled.current_value());

        cfg.transformer.compaction_enabled = true;
        settings.reload(&cfg);
        assert!(settings.compaction_enabled.current_value());
    }
}
