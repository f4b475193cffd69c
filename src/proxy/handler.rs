use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};

use crate::error::RelayError;
use crate::sites::Site;
use crate::state::AppState;
use crate::transport::{cookie_header, Profile};

use super::classify::{classify_response, ResponseClass, BODY_PREFIX_LIMIT};
use super::headers::{build_target_url, build_upstream_headers, is_stream_request, request_model};

/// Accounts tried for one client request before giving up.
const MAX_ACCOUNT_RETRIES: usize = 3;
/// Backoff before retrying an explicit capacity signal.
const CAPACITY_BACKOFF: Duration = Duration::from_secs(2);

enum AttemptVerdict {
    /// Response to hand to the client; both state machines were updated.
    Done(Response),
    /// Retry on the same site (WAF refresh or capacity backoff happened).
    RetryAttempt,
    /// Stop trying this account entirely; the credential is the problem.
    AccountError,
    /// Give up on this site after the attempt budget.
    SiteExhausted,
}

/// Serve one client request: pick an account, walk the site ring from the
/// sticky index, and retry within the per-site budget, attributing failures
/// to the account or the site as they are classified.
pub async fn proxy_handler(
    state: Arc<AppState>,
    method: http::Method,
    path: String,
    query: Option<String>,
    client_headers: http::HeaderMap,
    body: bytes::Bytes,
) -> Response {
    if state.key_validator.enabled() {
        let Some(key) = crate::keyauth::extract_api_key(&client_headers) else {
            return RelayError::Auth(
                "API key is required. Provide x-api-key or Authorization: Bearer <key>".to_string(),
            )
            .into_response();
        };
        if let Err(e) = state.key_validator.validate(&state.transport, key).await {
            return e.into_response();
        }
    }

    let is_stream = is_stream_request(&body);
    let model = request_model(&body);

    let mut attempted: HashSet<String> = HashSet::new();
    let mut last_error: Option<RelayError> = None;

    for account_round in 0..MAX_ACCOUNT_RETRIES {
        let Some(account) = state.accounts.pick(&attempted) else {
            if account_round == 0 {
                return RelayError::NoAccounts.into_response();
            }
            break;
        };
        attempted.insert(account.name.clone());
        let upstream_headers = build_upstream_headers(&client_headers, &account.api_key);

        let mut account_error = false;
        let start_index = state.sites.current_index();
        let site_count = state.sites.len();

        'sites: for offset in 0..site_count {
            let site_index = (start_index + offset) % site_count;
            let site = state.sites.site(site_index).clone();
            tracing::info!(
                site = %site.name,
                account = %account.name,
                stream = is_stream,
                model = %model,
                "trying upstream"
            );

            let mut cookies = if site.need_waf {
                match state.waf.get().await {
                    Ok(cookies) => cookies,
                    Err(e) => {
                        tracing::warn!(site = %site.name, error = %e, "no WAF cookies available");
                        last_error = Some(e);
                        state.sites.record_failure();
                        continue 'sites;
                    }
                }
            } else {
                HashMap::new()
            };

            let target_url = build_target_url(&site.url, &path, query.as_deref());
            let max_attempts = if site.need_waf { 4 } else { 2 };
            let mut capacity_waited = false;

            for attempt in 1..=max_attempts {
                let verdict = run_attempt(
                    &state,
                    &site,
                    site_index,
                    &account.name,
                    &method,
                    &target_url,
                    &upstream_headers,
                    &body,
                    is_stream,
                    &mut cookies,
                    &mut capacity_waited,
                    &mut last_error,
                    attempt == max_attempts,
                )
                .await;
                match verdict {
                    AttemptVerdict::Done(response) => return response,
                    AttemptVerdict::RetryAttempt => {}
                    AttemptVerdict::AccountError => {
                        account_error = true;
                        break 'sites;
                    }
                    AttemptVerdict::SiteExhausted => break,
                }
            }

            tracing::warn!(site = %site.name, "all retries failed, trying next site");
            state.sites.record_failure();
        }

        if account_error {
            state.accounts.record_failure(&account.name);
        }
        // Site-attributed exhaustion also moves on to the next account; the
        // loop ends only when the retry budget or the pool runs out.
    }

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no upstream attempt was possible".to_string());
    tracing::error!(error = %message, "all sites failed");
    RelayError::Exhausted(message).into_response()
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    state: &Arc<AppState>,
    site: &Site,
    site_index: usize,
    account_name: &str,
    method: &http::Method,
    target_url: &str,
    upstream_headers: &http::HeaderMap,
    body: &bytes::Bytes,
    is_stream: bool,
    cookies: &mut HashMap<String, String>,
    capacity_waited: &mut bool,
    last_error: &mut Option<RelayError>,
    is_last_attempt: bool,
) -> AttemptVerdict {
    let mut request_headers = upstream_headers.clone();
    if let Some(value) = cookie_header(cookies) {
        request_headers.insert(http::header::COOKIE, value);
    }

    let profile = if is_stream {
        Profile::Stream
    } else {
        Profile::Request
    };
    let response = match state
        .transport
        .execute(
            profile,
            site.use_proxy,
            method.clone(),
            target_url,
            request_headers,
            body.clone(),
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(site = %site.name, error = %e, "upstream request failed");
            *last_error = Some(e);
            return if is_last_attempt {
                AttemptVerdict::SiteExhausted
            } else {
                AttemptVerdict::RetryAttempt
            };
        }
    };

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    // Only a 5xx needs its body prefix for classification; reading it
    // consumes the response, which is fine since it will not be forwarded.
    let class = if status >= 500 && !super::classify::is_html_content_type(&content_type) {
        let prefix = response.bytes().await.unwrap_or_default();
        let prefix = &prefix[..prefix.len().min(BODY_PREFIX_LIMIT)];
        return handle_server_error(
            state,
            site,
            status,
            prefix,
            capacity_waited,
            last_error,
            cookies,
        )
        .await;
    } else {
        classify_response(status, Some(&content_type), b"")
    };

    match class {
        ResponseClass::WafChallenge => {
            drop(response);
            if site.need_waf {
                tracing::warn!(site = %site.name, "WAF challenge detected, refreshing cookies");
                refresh_cookies_into(state, cookies).await;
                *last_error = Some(RelayError::WafChallenge(site.name.clone()));
                AttemptVerdict::RetryAttempt
            } else {
                *last_error = Some(RelayError::Upstream {
                    status,
                    message: "unexpected HTML response".to_string(),
                });
                AttemptVerdict::SiteExhausted
            }
        }
        ResponseClass::AccountError => {
            tracing::warn!(
                site = %site.name,
                account = %account_name,
                status,
                "upstream rejected the account credential"
            );
            *last_error = Some(RelayError::Upstream {
                status,
                message: "account rejected by upstream".to_string(),
            });
            AttemptVerdict::AccountError
        }
        ResponseClass::Success => {
            state.sites.record_success(site_index);
            state.accounts.record_success(account_name);
            let response = if is_stream {
                build_streaming_response(site.name.clone(), response)
            } else {
                match build_buffered_response(response, &content_type).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(site = %site.name, error = %e, "failed reading response body");
                        *last_error = Some(e);
                        return AttemptVerdict::RetryAttempt;
                    }
                }
            };
            AttemptVerdict::Done(response)
        }
        // 5xx took the early-return path above.
        ResponseClass::ServerError { .. } => AttemptVerdict::SiteExhausted,
    }
}

async fn handle_server_error(
    state: &Arc<AppState>,
    site: &Site,
    status: u16,
    body_prefix: &[u8],
    capacity_waited: &mut bool,
    last_error: &mut Option<RelayError>,
    cookies: &mut HashMap<String, String>,
) -> AttemptVerdict {
    match classify_response(status, None, body_prefix) {
        ResponseClass::ServerError {
            empty_body: true, ..
        } if site.need_waf => {
            // The WAF swallows challenged API calls into bare 5xx responses.
            tracing::warn!(site = %site.name, status, "empty server error, treating as WAF problem");
            refresh_cookies_into(state, cookies).await;
            *last_error = Some(RelayError::Upstream {
                status,
                message: "empty server error from WAF-fronted site".to_string(),
            });
            AttemptVerdict::RetryAttempt
        }
        ResponseClass::ServerError { capacity: true, .. } => {
            if *capacity_waited {
                tracing::warn!(site = %site.name, status, "sustained capacity signal, marking account");
                *last_error = Some(RelayError::Upstream {
                    status,
                    message: "upstream capacity limit reached".to_string(),
                });
                AttemptVerdict::AccountError
            } else {
                *capacity_waited = true;
                tracing::info!(site = %site.name, status, "capacity signal, backing off");
                tokio::time::sleep(CAPACITY_BACKOFF).await;
                *last_error = Some(RelayError::Upstream {
                    status,
                    message: "upstream capacity limit reached".to_string(),
                });
                AttemptVerdict::RetryAttempt
            }
        }
        _ => {
            *last_error = Some(RelayError::Upstream {
                status,
                message: crate::util::truncate_message(
                    &String::from_utf8_lossy(body_prefix),
                    200,
                ),
            });
            AttemptVerdict::AccountError
        }
    }
}

async fn refresh_cookies_into(state: &Arc<AppState>, cookies: &mut HashMap<String, String>) {
    match state.waf.force_refresh().await {
        Ok(fresh) => *cookies = fresh,
        Err(e) => tracing::warn!(error = %e, "cookie refresh after challenge failed"),
    }
}

/// Forward the upstream body chunk-by-chunk. The `reqwest::Response` moves
/// into the stream state, so the upstream connection lives exactly as long
/// as the client is still reading and is released at end-of-stream.
fn build_streaming_response(site_name: String, response: reqwest::Response) -> Response {
    let status = response.status();
    let mut headers = http::HeaderMap::new();
    for (name, value) in response.headers() {
        if name == CONTENT_LENGTH
            || name == TRANSFER_ENCODING
            || name == CONTENT_ENCODING
            || name == CONNECTION
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(
            CONTENT_TYPE,
            http::HeaderValue::from_static("text/event-stream"),
        );
    }

    let upstream = response.bytes_stream();
    let counted = futures_util::stream::unfold(
        (upstream, site_name, 0u64, 0u64),
        |(mut upstream, site_name, chunk_count, total_bytes)| async move {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    let total_bytes = total_bytes + chunk.len() as u64;
                    Some((Ok(chunk), (upstream, site_name, chunk_count + 1, total_bytes)))
                }
                Some(Err(e)) => {
                    tracing::error!(
                        site = %site_name,
                        chunk_count,
                        total_bytes,
                        error = %e,
                        "stream error"
                    );
                    Some((Err(e), (upstream, site_name, chunk_count, total_bytes)))
                }
                None => {
                    tracing::info!(site = %site_name, chunk_count, total_bytes, "stream completed");
                    None
                }
            }
        },
    );

    let mut response = Response::new(axum::body::Body::from_stream(counted));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Buffer a non-streaming response: JSON passes through untouched, anything
/// else is wrapped as `{"raw": <text>}`.
async fn build_buffered_response(
    response: reqwest::Response,
    content_type: &str,
) -> Result<Response, RelayError> {
    let status = response.status();
    let body_bytes = response
        .bytes()
        .await
        .map_err(|e| RelayError::Transport(format!("failed to read response body: {e}")))?;

    let is_json = content_type.contains("json")
        && serde_json::from_slice::<serde_json::Value>(&body_bytes).is_ok();
    let payload = if is_json {
        body_bytes
    } else {
        let wrapped = serde_json::json!({ "raw": String::from_utf8_lossy(&body_bytes) });
        bytes::Bytes::from(serde_json::to_vec(&wrapped).unwrap_or_default())
    };

    let mut out = Response::new(axum::body::Body::from(payload));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(out)
}
