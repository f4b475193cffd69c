use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::proxy::proxy_handler;
use crate::state::AppState;

use super::{admin, health};

const DEFAULT_BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

enum RouteMatch<'a> {
    Health,
    Reload,
    RefreshWaf,
    RestartBrowser,
    SwitchToPrimary,
    ForceSwitchToPrimary,
    ClearApiKeyCache,
    Proxy { suffix: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, request_body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path());

    let response = match route {
        RouteMatch::Health => health::health_handler(&state).await,
        RouteMatch::Reload => admin::reload(&state),
        RouteMatch::RefreshWaf => admin::refresh_waf(&state).await,
        RouteMatch::RestartBrowser => admin::restart_browser(&state).await,
        RouteMatch::SwitchToPrimary => admin::switch_to_primary(&state).await,
        RouteMatch::ForceSwitchToPrimary => admin::force_switch_to_primary(&state),
        RouteMatch::ClearApiKeyCache => admin::clear_api_key_cache(&state),
        RouteMatch::Proxy { suffix } => {
            let suffix = suffix.to_string();
            let query = parts.uri.query().map(str::to_string);
            let body_bytes = match read_request_body(request_body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            proxy_handler(
                state,
                parts.method,
                suffix,
                query,
                parts.headers,
                body_bytes,
            )
            .await
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

async fn read_request_body(request_body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(request_body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 16MiB)",
            )
                .into_response()
        })
}

fn match_route<'a>(method: &Method, path: &'a str) -> RouteMatch<'a> {
    if let Some(suffix) = path.strip_prefix("/v1/") {
        // All methods are proxied; the origin decides what it accepts.
        return RouteMatch::Proxy { suffix };
    }

    match path {
        "/health" => {
            if method == Method::GET {
                RouteMatch::Health
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/reload" => post_only(method, RouteMatch::Reload),
        "/refresh-waf" => post_only(method, RouteMatch::RefreshWaf),
        "/restart-browser" => post_only(method, RouteMatch::RestartBrowser),
        "/switch-to-primary" => post_only(method, RouteMatch::SwitchToPrimary),
        "/force-switch-to-primary" => post_only(method, RouteMatch::ForceSwitchToPrimary),
        "/clear-api-key-cache" => post_only(method, RouteMatch::ClearApiKeyCache),
        _ => RouteMatch::NotFound,
    }
}

fn post_only<'a>(method: &Method, route: RouteMatch<'a>) -> RouteMatch<'a> {
    if method == Method::POST {
        route
    } else {
        RouteMatch::MethodNotAllowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(method: &Method, path: &str) -> &'static str {
        match match_route(method, path) {
            RouteMatch::Health => "health",
            RouteMatch::Reload => "reload",
            RouteMatch::RefreshWaf => "refresh-waf",
            RouteMatch::RestartBrowser => "restart-browser",
            RouteMatch::SwitchToPrimary => "switch-to-primary",
            RouteMatch::ForceSwitchToPrimary => "force-switch-to-primary",
            RouteMatch::ClearApiKeyCache => "clear-api-key-cache",
            RouteMatch::Proxy { .. } => "proxy",
            RouteMatch::MethodNotAllowed => "method-not-allowed",
            RouteMatch::NotFound => "not-found",
        }
    }

    #[test]
    fn test_proxy_routes_accept_any_method() {
        for method in [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ] {
            assert_eq!(kind(&method, "/v1/messages"), "proxy");
        }
        match match_route(&Method::POST, "/v1/messages/count_tokens") {
            RouteMatch::Proxy { suffix } => assert_eq!(suffix, "messages/count_tokens"),
            _ => panic!("expected proxy route"),
        }
    }

    #[test]
    fn test_admin_routes_are_post_only() {
        assert_eq!(kind(&Method::POST, "/reload"), "reload");
        assert_eq!(kind(&Method::GET, "/reload"), "method-not-allowed");
        assert_eq!(kind(&Method::POST, "/refresh-waf"), "refresh-waf");
        assert_eq!(kind(&Method::POST, "/restart-browser"), "restart-browser");
        assert_eq!(kind(&Method::POST, "/switch-to-primary"), "switch-to-primary");
        assert_eq!(
            kind(&Method::POST, "/force-switch-to-primary"),
            "force-switch-to-primary"
        );
        assert_eq!(
            kind(&Method::POST, "/clear-api-key-cache"),
            "clear-api-key-cache"
        );
    }

    #[test]
    fn test_health_is_get_only() {
        assert_eq!(kind(&Method::GET, "/health"), "health");
        assert_eq!(kind(&Method::POST, "/health"), "method-not-allowed");
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        assert_eq!(kind(&Method::GET, "/dashboard"), "not-found");
        assert_eq!(kind(&Method::GET, "/v2/messages"), "not-found");
    }
}
