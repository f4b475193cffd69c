use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// `GET /health`: one synchronous view composed from every component's
/// counters.
pub async fn health_handler(state: &Arc<AppState>) -> Response {
    let accounts = state.accounts.counts();
    let router = state.sites.snapshot();
    let current = state.sites.site(router.current_index);
    let probe = state.sites.probe_stats();
    let browser = state.browser.stats().await;
    let waf = state.waf.stats_view().await;
    let checkin = state.checkin.view(
        state.config.checkin.enabled,
        &state.config.checkin.cron_hours,
        state.config.checkin.cron_minute,
    );

    Json(json!({
        "status": "ok",
        "accounts": accounts,
        "sites": {
            "current": current.name,
            "current_url": current.url,
            "use_proxy": current.use_proxy,
            "need_waf": current.need_waf,
            "fail_count": router.fail_count,
            "total_sites": state.sites.len(),
            "is_primary": router.is_primary,
            "all_sites": state.sites.sites().iter().map(|site| {
                json!({ "name": site.name, "url": site.url })
            }).collect::<Vec<_>>(),
        },
        "primary_site_check": {
            "enabled": state.config.primary_check.enabled,
            "interval_minutes": state.config.primary_check.interval_minutes,
            "last_check_unix": probe.last_check_unix,
            "last_check_result": probe.last_check_result,
            "last_recovery_unix": probe.last_recovery_unix,
            "check_count": probe.check_count,
            "recovery_count": probe.recovery_count,
        },
        "waf_cookies": waf,
        "browser": browser,
        "proxy": state.config.proxy_url,
        "api_key_validation": state.key_validator.stats(),
        "checkin": checkin,
    }))
    .into_response()
}
