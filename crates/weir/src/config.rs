use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Top-level configuration, deserialized from a YAML file and hot-reloaded
/// on SIGHUP. In-flight requests keep whichever snapshot they started with.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub masking: MaskingConfig,
    pub wal: WalConfig,
    pub loki: LokiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Default token-bucket refill rate, tokens per second.
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,
    /// Default token-bucket capacity.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    /// Bearer token which authorizes the /v1/admin endpoints.
    pub admin_token: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    /// The bearer token presented by clients. Doubles as the tenancy key.
    pub token: String,
    /// Human-readable name, used for metric labels and masking overrides.
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    pub rate_limit_rps: Option<f64>,
    pub rate_limit_burst: Option<u32>,
    pub wal_quota_bytes: Option<u64>,
    pub wal_quota_age_hours: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaskingConfig {
    #[serde(default = "default_baseline_keys")]
    pub baseline_keys: Vec<String>,
    /// Partial replacement rules, keyed by the (case-insensitive) object key.
    #[serde(default)]
    pub partial_rules: BTreeMap<String, PartialRule>,
    /// Extra masking applied per token, keyed by token name.
    #[serde(default)]
    pub per_token_overrides: BTreeMap<String, MaskOverrides>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PartialRule {
    KeepPrefix { keep_prefix: usize },
    Email { mask_email: bool },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaskOverrides {
    #[serde(default)]
    pub extra_keys: Vec<String>,
    #[serde(default)]
    pub partial_rules: BTreeMap<String, PartialRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WalConfig {
    pub root_path: PathBuf,
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    #[serde(default = "default_token_wal_quota_bytes")]
    pub token_wal_quota_bytes: u64,
    #[serde(default = "default_token_wal_quota_age_hours")]
    pub token_wal_quota_age_hours: u64,
    #[serde(default = "default_disk_free_min_ratio")]
    pub disk_free_min_ratio: f64,
    #[serde(default = "default_rotation_time_active_minutes")]
    pub rotation_time_active_minutes: u64,
    #[serde(default = "default_rotation_time_idle_hours")]
    pub rotation_time_idle_hours: u64,
    #[serde(default = "default_idle_threshold_minutes")]
    pub idle_threshold_minutes: u64,
    #[serde(default = "default_min_rotation_bytes")]
    pub min_rotation_bytes: u64,
    #[serde(default = "default_force_rotation_hours")]
    pub force_rotation_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LokiConfig {
    /// Base URL of the Loki-compatible sink, e.g. "http://loki:3100".
    pub base_url: url::Url,
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: Vec<u64>,
    #[serde(default = "default_park_seconds")]
    pub park_seconds: u64,
    #[serde(default = "default_max_values_per_push")]
    pub max_values_per_push: usize,
    #[serde(default = "default_max_bytes_per_push")]
    pub max_bytes_per_push: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_rate_limit_rps() -> f64 {
    50.0
}
fn default_rate_limit_burst() -> u32 {
    100
}
fn default_true() -> bool {
    true
}
fn default_baseline_keys() -> Vec<String> {
    ["password", "passwd", "secret", "token", "api_key", "authorization"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_segment_max_bytes() -> u64 {
    128 << 20
}
fn default_token_wal_quota_bytes() -> u64 {
    1 << 30
}
fn default_token_wal_quota_age_hours() -> u64 {
    24
}
fn default_disk_free_min_ratio() -> f64 {
    0.20
}
fn default_rotation_time_active_minutes() -> u64 {
    5
}
fn default_rotation_time_idle_hours() -> u64 {
    1
}
fn default_idle_threshold_minutes() -> u64 {
    10
}
fn default_min_rotation_bytes() -> u64 {
    64 << 10
}
fn default_force_rotation_hours() -> u64 {
    6
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_seconds() -> Vec<u64> {
    vec![5, 10, 20]
}
fn default_park_seconds() -> u64 {
    60
}
fn default_max_values_per_push() -> usize {
    5000
}
fn default_max_bytes_per_push() -> usize {
    4 << 20
}

/// The resolved per-token view served by the registry: the raw `ApiKeyConfig`
/// with global defaults applied.
#[derive(Debug, Clone)]
pub struct TokenSpec {
    pub name: String,
    pub active: bool,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,
    pub wal_quota_bytes: u64,
    pub wal_quota_age: Duration,
}

/// An immutable, validated configuration snapshot with its derived token
/// index. Lookup by bearer token is constant-time.
#[derive(Debug)]
pub struct Snapshot {
    pub config: Config,
    tokens: HashMap<String, TokenSpec>,
}

impl Snapshot {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        if config.security.admin_token.is_empty() {
            anyhow::bail!("security.admin_token must not be empty");
        }
        if !(0.0..1.0).contains(&config.wal.disk_free_min_ratio) {
            anyhow::bail!("wal.disk_free_min_ratio must be within [0, 1)");
        }
        if config.loki.backoff_seconds.is_empty() {
            anyhow::bail!("loki.backoff_seconds must not be empty");
        }

        let mut tokens = HashMap::with_capacity(config.security.api_keys.len());
        for key in &config.security.api_keys {
            if key.token.is_empty() || key.name.is_empty() {
                anyhow::bail!("api key entries require non-empty token and name");
            }
            let spec = TokenSpec {
                name: key.name.clone(),
                active: key.active,
                rate_limit_rps: key.rate_limit_rps.unwrap_or(config.security.rate_limit_rps),
                rate_limit_burst: key
                    .rate_limit_burst
                    .unwrap_or(config.security.rate_limit_burst)
                    as f64,
                wal_quota_bytes: key.wal_quota_bytes.unwrap_or(config.wal.token_wal_quota_bytes),
                wal_quota_age: Duration::from_secs(
                    key.wal_quota_age_hours
                        .unwrap_or(config.wal.token_wal_quota_age_hours)
                        * 3600,
                ),
            };
            if tokens.insert(key.token.clone(), spec).is_some() {
                anyhow::bail!("duplicate api key token for name {:?}", key.name);
            }
        }
        Ok(Self { config, tokens })
    }

    /// Look up a bearer token. Returns None for unknown tokens; callers must
    /// still check `TokenSpec::active`.
    pub fn token(&self, bearer: &str) -> Option<&TokenSpec> {
        self.tokens.get(bearer)
    }
}

/// Shared handle over the current snapshot. Reads clone an `Arc`, so a reload
/// swap never blocks the hot path.
#[derive(Clone)]
pub struct Handle(Arc<RwLock<Arc<Snapshot>>>);

impl Handle {
    pub fn new(snapshot: Snapshot) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(snapshot))))
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.0.read().unwrap().clone()
    }

    pub fn swap(&self, snapshot: Snapshot) {
        *self.0.write().unwrap() = Arc::new(snapshot);
    }
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Re-read and swap the configuration on each SIGHUP until cancelled.
/// A snapshot that fails to load or validate is rejected and the previous
/// snapshot continues to serve.
pub async fn watch_reload(
    handle: Handle,
    path: PathBuf,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut hups = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(hups) => hups,
        Err(err) => {
            tracing::error!(?err, "failed to install SIGHUP handler; hot reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hups.recv() => (),
            _ = cancel.cancelled() => return,
        }

        match load(&path).and_then(Snapshot::build) {
            Ok(snapshot) => {
                handle.swap(snapshot);
                tracing::info!(path = %path.display(), "reloaded configuration");
            }
            Err(err) => {
                tracing::error!(?err, "config reload failed; keeping previous snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
security:
  admin_token: hunter2
  api_keys:
    - token: tok-a
      name: svc-a
    - token: tok-b
      name: svc-b
      active: false
      rate_limit_rps: 1
      rate_limit_burst: 1
      wal_quota_bytes: 1024
wal:
  root_path: /tmp/weir-wal
loki:
  base_url: "http://localhost:3100"
"#
    }

    #[test]
    fn snapshot_resolves_defaults_and_overrides() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        let snapshot = Snapshot::build(config).unwrap();

        let a = snapshot.token("tok-a").unwrap();
        assert!(a.active);
        assert_eq!(a.rate_limit_rps, 50.0);
        assert_eq!(a.wal_quota_bytes, 1 << 30);
        assert_eq!(a.wal_quota_age, Duration::from_secs(24 * 3600));

        let b = snapshot.token("tok-b").unwrap();
        assert!(!b.active);
        assert_eq!(b.rate_limit_rps, 1.0);
        assert_eq!(b.rate_limit_burst, 1.0);
        assert_eq!(b.wal_quota_bytes, 1024);

        assert!(snapshot.token("tok-unknown").is_none());
    }

    #[test]
    fn partial_rule_forms_parse() {
        let masking: MaskingConfig = serde_yaml::from_str(
            r#"
baseline_keys: [password]
partial_rules:
  authorization: {keep_prefix: 5}
  email: {mask_email: true}
"#,
        )
        .unwrap();
        assert_eq!(
            masking.partial_rules["authorization"],
            PartialRule::KeepPrefix { keep_prefix: 5 },
        );
        assert_eq!(
            masking.partial_rules["email"],
            PartialRule::Email { mask_email: true },
        );
    }

    #[test]
    fn empty_admin_token_is_rejected() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.security.admin_token.clear();
        assert!(Snapshot::build(config).is_err());
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        let mut dup = config.security.api_keys[0].clone();
        dup.name = "svc-dup".to_string();
        config.security.api_keys.push(dup);
        assert!(Snapshot::build(config).is_err());
    }
}
