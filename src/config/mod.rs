pub mod validation;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_max_blocking_threads: Option<usize>,
}

fn default_port() -> u16 {
    18081
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            log_level: default_log_level(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
        }
    }
}

/// One upstream origin. Index 0 in the site list is the designated primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub need_waf: bool,
}

/// WAF challenge-cookie cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_cookie_ttl_secs")]
    pub cookie_ttl_secs: u64,
    #[serde(default = "default_refresh_before_secs")]
    pub refresh_before_secs: u64,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_page_wait_ms")]
    pub page_wait_ms: u64,
    #[serde(default = "default_refresh_wait_secs")]
    pub refresh_wait_secs: u64,
}

fn default_login_url() -> String {
    "https://anyrouter.top/login".to_string()
}
fn default_cookie_ttl_secs() -> u64 {
    2700
}
fn default_refresh_before_secs() -> u64 {
    600
}
fn default_retry_interval_secs() -> u64 {
    30
}
fn default_page_wait_ms() -> u64 {
    3000
}
fn default_refresh_wait_secs() -> u64 {
    120
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            cookie_ttl_secs: default_cookie_ttl_secs(),
            refresh_before_secs: default_refresh_before_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            page_wait_ms: default_page_wait_ms(),
            refresh_wait_secs: default_refresh_wait_secs(),
        }
    }
}

/// Headless browser settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_restart_hours")]
    pub restart_hours: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chrome_executable: Option<String>,
}

fn default_restart_hours() -> u64 {
    6
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            restart_hours: default_restart_hours(),
            chrome_executable: None,
        }
    }
}

/// Scheduled check-in settings (hours-of-day list x minute, local time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_checkin_hours")]
    pub cron_hours: Vec<u32>,
    #[serde(default = "default_checkin_minute")]
    pub cron_minute: u32,
}

fn default_true() -> bool {
    true
}
fn default_checkin_hours() -> Vec<u32> {
    vec![2, 8, 14, 20]
}
fn default_checkin_minute() -> u32 {
    30
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            cron_hours: default_checkin_hours(),
            cron_minute: default_checkin_minute(),
        }
    }
}

/// Periodic primary-site recovery probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_primary_interval_minutes")]
    pub interval_minutes: u64,
}

fn default_primary_interval_minutes() -> u64 {
    5
}

impl Default for PrimaryCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_minutes: default_primary_interval_minutes(),
        }
    }
}

/// Client API-key validation against the external user-database service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValidationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_user_db_url")]
    pub user_db_url: String,
    #[serde(default = "default_key_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_user_db_url() -> String {
    "http://new-api:3000".to_string()
}
fn default_key_cache_ttl_secs() -> u64 {
    300
}

impl Default for KeyValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_db_url: default_user_db_url(),
            cache_ttl_secs: default_key_cache_ttl_secs(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_sites")]
    pub sites: Vec<SiteConfig>,
    #[serde(default = "default_accounts_file")]
    pub accounts_file: PathBuf,
    /// HTTP CONNECT forward proxy, used for proxied sites and the browser.
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default)]
    pub waf: WafConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub checkin: CheckinConfig,
    #[serde(default)]
    pub primary_check: PrimaryCheckConfig,
    #[serde(default)]
    pub key_validation: KeyValidationConfig,
}

fn default_sites() -> Vec<SiteConfig> {
    vec![SiteConfig {
        name: "primary".to_string(),
        url: "https://anyrouter.top".to_string(),
        use_proxy: true,
        need_waf: true,
    }]
}
fn default_accounts_file() -> PathBuf {
    PathBuf::from("/app/data/accounts.json")
}
fn default_proxy_url() -> String {
    "http://127.0.0.1:7890".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sites: default_sites(),
            accounts_file: default_accounts_file(),
            proxy_url: default_proxy_url(),
            waf: WafConfig::default(),
            browser: BrowserConfig::default(),
            checkin: CheckinConfig::default(),
            primary_check: PrimaryCheckConfig::default(),
            key_validation: KeyValidationConfig::default(),
        }
    }
}

/// Load configuration from a YAML file (falling back to defaults when the
/// file does not exist), apply environment overrides, and validate.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading an existing file fails,
/// [`ConfigError::Yaml`] when parsing fails, or [`ConfigError::Validation`]
/// when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let mut config = if std::path::Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)?
    } else {
        AppConfig::default()
    };
    apply_overrides(&mut config, |name| std::env::var(name).ok());
    validate_config(&config)?;
    Ok(config)
}

/// Apply environment-style overrides from a lookup function.
///
/// Unparseable values are ignored with a warning rather than failing startup.
pub fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("ANYROUTER_BASE_URL") {
        if let Some(primary) = config.sites.first_mut() {
            primary.url = url;
        }
    }
    if let Some(proxy) = lookup("HTTP_PROXY") {
        config.proxy_url = proxy;
    }
    if let Some(file) = lookup("ACCOUNTS_FILE") {
        config.accounts_file = PathBuf::from(file);
    }
    override_parsed(&lookup, "WAF_PROXY_PORT", &mut config.server.port);
    override_parsed(&lookup, "WAF_COOKIE_TTL", &mut config.waf.cookie_ttl_secs);
    override_parsed(
        &lookup,
        "WAF_COOKIE_REFRESH_BEFORE",
        &mut config.waf.refresh_before_secs,
    );
    override_parsed(
        &lookup,
        "WAF_COOKIE_RETRY_INTERVAL",
        &mut config.waf.retry_interval_secs,
    );
    if let Some(url) = lookup("WAF_LOGIN_URL") {
        config.waf.login_url = url;
    }
    override_parsed(&lookup, "WAF_PAGE_WAIT_MS", &mut config.waf.page_wait_ms);
    override_parsed(
        &lookup,
        "BROWSER_RESTART_HOURS",
        &mut config.browser.restart_hours,
    );
    override_bool(&lookup, "CHECKIN_ENABLED", &mut config.checkin.enabled);
    if let Some(raw) = lookup("CHECKIN_CRON_HOUR") {
        match parse_hour_list(&raw) {
            Some(hours) => config.checkin.cron_hours = hours,
            None => tracing::warn!(value = %raw, "ignoring unparseable CHECKIN_CRON_HOUR"),
        }
    }
    override_parsed(
        &lookup,
        "CHECKIN_CRON_MINUTE",
        &mut config.checkin.cron_minute,
    );
    override_bool(
        &lookup,
        "PRIMARY_SITE_CHECK_ENABLED",
        &mut config.primary_check.enabled,
    );
    override_parsed(
        &lookup,
        "PRIMARY_SITE_CHECK_INTERVAL",
        &mut config.primary_check.interval_minutes,
    );
    override_bool(
        &lookup,
        "API_KEY_VALIDATION_ENABLED",
        &mut config.key_validation.enabled,
    );
    if let Some(url) = lookup("NEWAPI_URL") {
        config.key_validation.user_db_url = url;
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(var = name, value = %raw, "ignoring unparseable override"),
    }
}

fn override_bool<F>(lookup: &F, name: &str, slot: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => *slot = true,
        "false" | "0" | "no" => *slot = false,
        _ => tracing::warn!(var = name, value = %raw, "ignoring unparseable boolean override"),
    }
}

fn parse_hour_list(raw: &str) -> Option<Vec<u32>> {
    let hours: Vec<u32> = raw
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if hours.is_empty() {
        return None;
    }
    Some(hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| map.get(name).map(|v| (*v).to_string())
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 18081);
        assert_eq!(config.waf.cookie_ttl_secs, 2700);
        assert_eq!(config.waf.refresh_before_secs, 600);
        assert_eq!(config.checkin.cron_hours, vec![2, 8, 14, 20]);
        assert_eq!(config.checkin.cron_minute, 30);
        assert_eq!(config.primary_check.interval_minutes, 5);
        assert!(!config.key_validation.enabled);
        assert!(config.sites[0].need_waf);
        assert!(config.sites[0].use_proxy);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        let map = HashMap::from([
            ("ANYROUTER_BASE_URL", "https://origin.example"),
            ("HTTP_PROXY", "http://10.0.0.1:7890"),
            ("WAF_PROXY_PORT", "9000"),
            ("WAF_COOKIE_TTL", "1800"),
            ("WAF_COOKIE_REFRESH_BEFORE", "300"),
            ("CHECKIN_CRON_HOUR", "1, 13"),
            ("CHECKIN_CRON_MINUTE", "15"),
            ("CHECKIN_ENABLED", "false"),
            ("PRIMARY_SITE_CHECK_INTERVAL", "10"),
            ("API_KEY_VALIDATION_ENABLED", "true"),
        ]);
        apply_overrides(&mut config, lookup_from(&map));
        assert_eq!(config.sites[0].url, "https://origin.example");
        assert_eq!(config.proxy_url, "http://10.0.0.1:7890");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.waf.cookie_ttl_secs, 1800);
        assert_eq!(config.waf.refresh_before_secs, 300);
        assert_eq!(config.checkin.cron_hours, vec![1, 13]);
        assert_eq!(config.checkin.cron_minute, 15);
        assert!(!config.checkin.enabled);
        assert_eq!(config.primary_check.interval_minutes, 10);
        assert!(config.key_validation.enabled);
    }

    #[test]
    fn test_unparseable_override_is_ignored() {
        let mut config = AppConfig::default();
        let map = HashMap::from([("WAF_COOKIE_TTL", "soon"), ("CHECKIN_ENABLED", "maybe")]);
        apply_overrides(&mut config, lookup_from(&map));
        assert_eq!(config.waf.cookie_ttl_secs, 2700);
        assert!(config.checkin.enabled);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
server:
  port: 8088
sites:
  - name: primary
    url: https://origin.example
    use_proxy: true
    need_waf: true
  - name: mirror1
    url: https://mirror.example
waf:
  cookie_ttl_secs: 900
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.sites.len(), 2);
        assert!(!config.sites[1].use_proxy);
        assert_eq!(config.waf.cookie_ttl_secs, 900);
        assert_eq!(config.waf.refresh_before_secs, 600);
    }
}
