use std::collections::HashSet;

use super::{AppConfig, ConfigError};

/// Validate semantic constraints that serde cannot express.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] describing the first violated rule.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.sites.is_empty() {
        return Err(validation("at least one site must be configured"));
    }

    let mut seen_names = HashSet::new();
    for site in &config.sites {
        if site.name.trim().is_empty() {
            return Err(validation("site name must not be empty"));
        }
        if !seen_names.insert(site.name.as_str()) {
            return Err(validation(&format!("duplicate site name '{}'", site.name)));
        }
        url::Url::parse(&site.url).map_err(|e| {
            validation(&format!("site '{}' has an invalid url: {e}", site.name))
        })?;
        if site.need_waf && !site.use_proxy {
            return Err(validation(&format!(
                "site '{}' sets need_waf without use_proxy; WAF-protected origins are reached through the forward proxy",
                site.name
            )));
        }
    }

    if config.sites.iter().any(|site| site.use_proxy) {
        url::Url::parse(&config.proxy_url)
            .map_err(|e| validation(&format!("invalid proxy_url: {e}")))?;
    }

    if config.waf.cookie_ttl_secs == 0 {
        return Err(validation("waf.cookie_ttl_secs must be positive"));
    }
    if config.waf.refresh_before_secs >= config.waf.cookie_ttl_secs {
        return Err(validation(
            "waf.refresh_before_secs must be smaller than waf.cookie_ttl_secs",
        ));
    }
    url::Url::parse(&config.waf.login_url)
        .map_err(|e| validation(&format!("invalid waf.login_url: {e}")))?;

    if config.checkin.enabled {
        if config.checkin.cron_hours.is_empty() {
            return Err(validation("checkin.cron_hours must not be empty"));
        }
        if config.checkin.cron_hours.iter().any(|&h| h > 23) {
            return Err(validation("checkin.cron_hours entries must be 0-23"));
        }
        if config.checkin.cron_minute > 59 {
            return Err(validation("checkin.cron_minute must be 0-59"));
        }
    }

    if config.primary_check.enabled && config.primary_check.interval_minutes == 0 {
        return Err(validation("primary_check.interval_minutes must be positive"));
    }

    Ok(())
}

fn validation(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;

    fn base_config() -> AppConfig {
        AppConfig::default()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_empty_sites_rejected() {
        let mut config = base_config();
        config.sites.clear();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_site_names_rejected() {
        let mut config = base_config();
        config.sites.push(SiteConfig {
            name: "primary".to_string(),
            url: "https://mirror.example".to_string(),
            use_proxy: false,
            need_waf: false,
        });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_need_waf_requires_proxy() {
        let mut config = base_config();
        config.sites[0].use_proxy = false;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("need_waf"));
    }

    #[test]
    fn test_refresh_window_must_fit_ttl() {
        let mut config = base_config();
        config.waf.refresh_before_secs = config.waf.cookie_ttl_secs;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_cron_bounds() {
        let mut config = base_config();
        config.checkin.cron_hours = vec![24];
        assert!(validate_config(&config).is_err());

        let mut config = base_config();
        config.checkin.cron_minute = 60;
        assert!(validate_config(&config).is_err());

        let mut config = base_config();
        config.checkin.enabled = false;
        config.checkin.cron_hours = vec![];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_site_url_rejected() {
        let mut config = base_config();
        config.sites[0].url = "not a url".to_string();
        assert!(validate_config(&config).is_err());
    }
}
