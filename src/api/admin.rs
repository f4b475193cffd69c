//! Administrative operations. Unlike the proxy surface, these respond with
//! `{status, message, ...}` JSON envelopes.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// `POST /reload`: re-read the accounts snapshot.
pub fn reload(state: &Arc<AppState>) -> Response {
    match state.accounts.load() {
        Ok(count) => Json(json!({ "status": "ok", "accounts": count })).into_response(),
        Err(e) => Json(json!({ "status": "error", "message": e.to_string() })).into_response(),
    }
}

/// `POST /refresh-waf`: force a cookie refresh.
pub async fn refresh_waf(state: &Arc<AppState>) -> Response {
    match state.waf.force_refresh().await {
        Ok(cookies) => {
            let names: Vec<&String> = cookies.keys().collect();
            Json(json!({ "status": "ok", "cookies": names })).into_response()
        }
        Err(e) => Json(json!({ "status": "error", "message": e.to_string() })).into_response(),
    }
}

/// `POST /restart-browser`: cycle the headless browser process.
pub async fn restart_browser(state: &Arc<AppState>) -> Response {
    match state.browser.restart().await {
        Ok(()) => {
            let stats = state.browser.stats().await;
            Json(json!({ "status": "ok", "browser": stats })).into_response()
        }
        Err(e) => Json(json!({ "status": "error", "message": e.to_string() })).into_response(),
    }
}

/// `POST /switch-to-primary`: probe the primary first, switch only when it
/// looks healthy.
pub async fn switch_to_primary(state: &Arc<AppState>) -> Response {
    let (current_index, current) = state.sites.current();
    if current_index == 0 {
        return Json(json!({
            "status": "ok",
            "message": "Already using primary site",
            "current_site": current.name,
        }))
        .into_response();
    }

    let cookies = state.waf.peek().await;
    if state.sites.probe_primary(&state.transport, &cookies).await {
        let old_name = current.name.clone();
        state.sites.force_primary();
        Json(json!({
            "status": "ok",
            "message": format!("Switched from {old_name} to primary site"),
            "current_site": state.sites.site(0).name,
        }))
        .into_response()
    } else {
        let result = state
            .sites
            .probe_stats()
            .last_check_result
            .unwrap_or_else(|| "unknown".to_string());
        Json(json!({
            "status": "error",
            "message": format!("Primary site health check failed: {result}"),
            "current_site": state.sites.current().1.name,
        }))
        .into_response()
    }
}

/// `POST /force-switch-to-primary`: switch without probing.
pub fn force_switch_to_primary(state: &Arc<AppState>) -> Response {
    let old_name = state.sites.current().1.name.clone();
    state.sites.force_primary();
    Json(json!({
        "status": "ok",
        "message": format!("Force switched to primary site (from {old_name})"),
        "current_site": state.sites.site(0).name,
        "warning": "Primary site health was not verified",
    }))
    .into_response()
}

/// `POST /clear-api-key-cache`: drop all cached validation verdicts.
pub fn clear_api_key_cache(state: &Arc<AppState>) -> Response {
    state.key_validator.clear();
    Json(json!({
        "status": "ok",
        "message": "API key validation cache cleared",
    }))
    .into_response()
}
