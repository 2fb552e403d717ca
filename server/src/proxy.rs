use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{
    ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use common::ApiKey;
use myerrors::ProxyError;
use serde_json::{json, Map, Value};

use crate::debug::log_payload;
use crate::handlers::AppState;
use crate::relay::{is_present, UsageTap};
use crate::service::KeyService;

const API_PREFIX: &str = "/v1/";

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const TRAILERS: HeaderName = HeaderName::from_static("trailers");

const REQUEST_SKIP: [HeaderName; 6] = [
    AUTHORIZATION,
    HOST,
    CONNECTION,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
    ACCEPT_ENCODING,
];

const RESPONSE_SKIP: [HeaderName; 10] = [
    CONNECTION,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
    KEEP_ALIVE,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRAILERS,
    UPGRADE,
];

/// Resolves the inbound bearer token to an active key.
pub async fn authenticate(headers: &HeaderMap, keys: &dyn KeyService) -> Result<ApiKey, ProxyError> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ProxyError::Unauthorized("Missing Authorization header".to_string()))?;
    let token = raw
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ProxyError::Unauthorized("Invalid Authorization header".to_string()))?;

    keys.get_active_key(token)
        .await?
        .ok_or_else(|| ProxyError::Unauthorized("Invalid or revoked API key".to_string()))
}

fn path_matches(path: &str, prefixes: &[String]) -> bool {
    let path = path.trim_matches('/');
    prefixes.iter().any(|p| {
        let p = p.trim_matches('/');
        path == p || path.strip_prefix(p).is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Forces the upstream to emit a usage record at the end of the stream.
/// Returns whether the payload changed.
fn force_include_usage(payload: &mut Map<String, Value>) -> bool {
    let options = payload
        .entry("stream_options")
        .or_insert_with(|| json!({}));
    if options.is_null() {
        *options = json!({});
    }
    match options.as_object_mut() {
        Some(options) => {
            if options.get("include_usage") == Some(&Value::Bool(true)) {
                return false;
            }
            options.insert("include_usage".to_string(), Value::Bool(true));
            true
        }
        None => {
            log::warn!("[proxy] stream_options is not an object, leaving it untouched");
            false
        }
    }
}

fn filter_headers(source: &HeaderMap, skip: &[HeaderName]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        if !skip.contains(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// The part of the inbound path after `/v1/`, still percent-encoded.
fn sub_path(uri: &Uri) -> &str {
    uri.path()
        .strip_prefix(API_PREFIX)
        .unwrap_or_default()
}

fn upstream_failure(path: &str, err: impl std::fmt::Display) -> ProxyError {
    log::error!("[proxy] upstream call failed for {path}: {err}");
    ProxyError::Upstream(format!("Upstream request failed: {err}"))
}

/// Forwards `/v1/{path}` to the upstream API with the proxy's own credential.
pub async fn forward(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let path = sub_path(&uri).to_string();
    let key = authenticate(&headers, state.keys.as_ref()).await?;

    let mut payload: Option<Value> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("[proxy] request body for {path} is not JSON: {e}");
                None
            }
        }
    };

    let wants_stream = payload
        .as_ref()
        .and_then(|p| p.get("stream"))
        .is_some_and(|s| s == &Value::Bool(true));

    let mut rewritten = false;
    if let Some(fields) = payload.as_mut().and_then(Value::as_object_mut) {
        if let Some(requested) = fields.get("model").and_then(Value::as_str).map(str::to_string) {
            if let Err(e) = state.models.ensure_loaded().await {
                log::warn!("[proxy] model resolution failed for {path} model {requested}: {e}");
            }
            let resolved = state.models.resolve(&requested);
            if resolved != requested {
                log::info!("[proxy] model {requested} -> {resolved}");
                fields.insert("model".to_string(), Value::String(resolved));
                rewritten = true;
            }
        }
        if wants_stream && !path_matches(&path, &state.usage_exempt_paths) {
            rewritten |= force_include_usage(fields);
        }
    }

    let outbound_body = match payload.as_ref().filter(|_| rewritten) {
        Some(mapped) => {
            state.debug.record_mapped(mapped);
            Bytes::from(serde_json::to_vec(mapped).map_err(anyhow::Error::from)?)
        }
        None => body,
    };

    let mut outbound_headers = filter_headers(&headers, &REQUEST_SKIP);
    if payload.is_some() {
        outbound_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    if wants_stream
        && path_matches(&path, &state.event_stream_paths)
        && !outbound_headers.contains_key(ACCEPT)
    {
        outbound_headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    let mut request = state
        .upstream
        .request(method.clone(), &path, uri.query())
        .map_err(|e| upstream_failure(&path, e))?
        .headers(outbound_headers);
    if !outbound_body.is_empty() {
        request = request.body(outbound_body);
    }

    log::info!(
        "[proxy] {method} /v1/{path} label {} stream {wants_stream}",
        key.label
    );

    if wants_stream {
        let upstream_resp = request
            .send()
            .await
            .map_err(|e| upstream_failure(&path, e))?;
        Ok(relay_stream(state, key, path, upstream_resp))
    } else {
        let upstream_resp = request
            .timeout(state.upstream.timeout())
            .send()
            .await
            .map_err(|e| upstream_failure(&path, e))?;
        relay_buffered(state, key, path, upstream_resp).await
    }
}

fn into_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn relay_buffered(
    state: AppState,
    key: ApiKey,
    path: String,
    upstream_resp: reqwest::Response,
) -> Result<Response, ProxyError> {
    let status = upstream_resp.status();
    let headers = filter_headers(upstream_resp.headers(), &RESPONSE_SKIP);
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
    let bytes = upstream_resp
        .bytes()
        .await
        .map_err(|e| upstream_failure(&path, e))?;

    log::info!("[proxy] upstream {status} for /v1/{path}");

    if is_json {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(data) => {
                log_payload("upstream_response", &data);
                state.debug.record_upstream(&data);
                let usage = data.get("usage").filter(|u| is_present(u));
                let model = data
                    .get("model")
                    .or_else(|| data.get("data").and_then(|d| d.get("model")))
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty());
                if let (Some(usage), Some(model)) = (usage, model) {
                    state
                        .recorder
                        .record(&key.token, &key.label, model, usage)
                        .await;
                }
            }
            Err(e) => {
                log::warn!("[proxy] could not parse JSON response for /v1/{path} ({status}): {e}");
                state.debug.record_error(e.to_string());
            }
        }
    }

    Ok(into_response(status, headers, Body::from(bytes)))
}

fn relay_stream(
    state: AppState,
    key: ApiKey,
    path: String,
    upstream_resp: reqwest::Response,
) -> Response {
    let status = upstream_resp.status();
    let headers = filter_headers(upstream_resp.headers(), &RESPONSE_SKIP);
    log::info!("[stream] upstream {status} for /v1/{path}");

    let (tap, done) = UsageTap::new(Box::pin(upstream_resp.bytes_stream()));
    let recorder = state.recorder.clone();
    tokio::spawn(async move {
        let Ok(capture) = done.await else {
            log::warn!("[stream] relay for /v1/{path} ended without a capture");
            return;
        };
        match capture.into_billable() {
            Some((model, usage)) => {
                recorder
                    .record(&key.token, &key.label, &model, &usage)
                    .await
            }
            None => log::info!("[stream] no usage observed for /v1/{path}"),
        }
    });

    into_response(status, headers, Body::from_stream(tap))
}
