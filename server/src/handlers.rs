use axum::extract::{Path, Query, State};
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::{DayCost, LabelCost, LabelDayCost, ModelUsage};
use myerrors::ProxyError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::debug::{DebugMirror, DebugState};
use crate::models::ModelCache;
use crate::service::KeyService;
use crate::usage::UsageRecorder;
use upstream::UpstreamClient;

const IDENTITY_HEADERS: [&str; 4] = ["x-user", "x-forwarded-user", "x-remote-user", "remote-user"];
const IDENTITY_COOKIE: &str = "proxy_username";
const ADMIN_HEADER: &str = "x-admin-token";
const DEFAULT_LABEL: &str = "user";

#[derive(Clone)]
pub struct AppState {
    pub keys: Arc<dyn KeyService>,
    pub models: Arc<ModelCache>,
    pub recorder: Arc<UsageRecorder>,
    pub upstream: Arc<UpstreamClient>,
    pub debug: Arc<DebugMirror>,
    pub admin_token: Option<String>,
    pub usage_exempt_paths: Vec<String>,
    pub event_stream_paths: Vec<String>,
}

#[derive(Deserialize)]
pub struct DateRangeParams {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// A report period covering whole UTC days, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Half-open `[start 00:00, end + 1 day 00:00)` bounds for store queries.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.start.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = (self.end + Duration::days(1))
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        (start, end)
    }
}

fn resolve_date_range(params: &DateRangeParams) -> DateWindow {
    let end = params
        .end
        .as_deref()
        .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
        .unwrap_or_else(|| Utc::now().date_naive());

    let start = params
        .start
        .as_deref()
        .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
        .unwrap_or_else(|| end - Duration::days(30));

    DateWindow { start, end }
}

pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return token.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = state.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(ProxyError::Misconfigured(
            "admin_token must be set to manage keys".to_string(),
        ));
    };
    let provided = headers.get(ADMIN_HEADER).and_then(|v| v.to_str().ok());
    if provided != Some(expected) {
        return Err(ProxyError::Unauthorized("Invalid admin token".to_string()));
    }
    Ok(())
}

/// Caller identity as set by a fronting auth proxy, or the login cookie.
fn require_user(headers: &HeaderMap) -> Result<String, ProxyError> {
    for name in IDENTITY_HEADERS {
        let value = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(user) = value {
            return Ok(user.to_string());
        }
    }

    let from_cookie = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == IDENTITY_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string());

    from_cookie.ok_or_else(|| {
        ProxyError::Unauthorized(
            "User identity not found in headers/cookie; login required".to_string(),
        )
    })
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProxyError> {
    require_user(&headers)?;
    let loaded = state.models.ensure_loaded().await;
    if let Err(e) = &loaded {
        log::warn!("[models] load failed: {e}");
    }
    let (models, loaded_at) = state.models.snapshot();
    if models.is_empty() {
        return Err(match loaded {
            Err(e) => ProxyError::Upstream(format!("Error fetching models: {e}")),
            Ok(()) => ProxyError::Upstream("Models cache is empty".to_string()),
        });
    }
    Ok(Json(json!({
        "models": models,
        "loaded_at": loaded_at.map(|t| t.timestamp()),
    })))
}

pub async fn last_response(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DebugState>, ProxyError> {
    require_user(&headers)?;
    Ok(Json(state.debug.snapshot()))
}

#[derive(Deserialize, Default)]
pub struct IssueKeyRequest {
    pub label: Option<String>,
    pub note: Option<String>,
}

pub async fn issue_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<IssueKeyRequest>,
) -> Result<Json<Value>, ProxyError> {
    require_admin(&state, &headers)?;
    let label = payload
        .label
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_LABEL.to_string());
    let token = state.keys.create_key(&label, payload.note.as_deref()).await?;
    log::info!("[admin] issued key for label {label}");
    Ok(Json(json!({ "token": token, "label": label, "note": payload.note })))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    require_admin(&state, &headers)?;
    if state.keys.revoke_key(&token).await? {
        log::info!("[admin] revoked key {}", mask_token(&token));
        Ok(Json(json!({ "status": "revoked", "token": token })))
    } else {
        Err(ProxyError::NotFound(
            "Token not found or already revoked".to_string(),
        ))
    }
}

#[derive(Serialize)]
pub struct TokenUsage {
    pub token: String,
    pub models: Vec<ModelUsage>,
}

pub async fn usage_for_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Json<TokenUsage>, ProxyError> {
    require_admin(&state, &headers)?;
    let models = state.keys.aggregate_usage(&token).await?;
    Ok(Json(TokenUsage { token, models }))
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Period {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Series {
    pub label: String,
    pub costs: Vec<f64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Stacked {
    pub days: Vec<String>,
    pub series: Vec<Series>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ReportData {
    pub period: Period,
    pub cost_by_user: Vec<LabelCost>,
    pub total_by_day: Vec<DayCost>,
    pub cumulative: Vec<DayCost>,
    pub stacked: Stacked,
}

fn running_total(by_day: &[DayCost]) -> Vec<DayCost> {
    let mut running = 0.0;
    by_day
        .iter()
        .map(|row| {
            running += row.cost;
            DayCost {
                day: row.day.clone(),
                cost: running,
            }
        })
        .collect()
}

/// One series per label, aligned on the sorted set of days that saw any cost.
fn stack(rows: &[LabelDayCost]) -> Stacked {
    let days: Vec<String> = rows
        .iter()
        .map(|r| r.day.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let labels: BTreeSet<&str> = rows.iter().map(|r| r.label.as_str()).collect();
    let costs: HashMap<(&str, &str), f64> = rows
        .iter()
        .map(|r| ((r.label.as_str(), r.day.as_str()), r.cost))
        .collect();

    let series = labels
        .into_iter()
        .map(|label| Series {
            label: label.to_string(),
            costs: days
                .iter()
                .map(|day| costs.get(&(label, day.as_str())).copied().unwrap_or(0.0))
                .collect(),
        })
        .collect();
    Stacked { days, series }
}

pub async fn reports_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DateRangeParams>,
) -> Result<Json<ReportData>, ProxyError> {
    require_user(&headers)?;
    let (start, end) = resolve_date_range(&params).bounds();

    let cost_by_user = state.keys.aggregate_cost_by_label(start, end).await?;
    let total_by_day = state.keys.aggregate_cost_by_day(start, end).await?;
    let by_label_day = state.keys.aggregate_cost_by_label_and_day(start, end).await?;

    Ok(Json(ReportData {
        period: Period {
            start: start.timestamp(),
            end: end.timestamp(),
        },
        cumulative: running_total(&total_by_day),
        stacked: stack(&by_label_day),
        cost_by_user,
        total_by_day,
    }))
}

#[derive(Deserialize, Default)]
pub struct PublicKeyRequest {
    pub username: Option<String>,
    pub note: Option<String>,
}

pub async fn public_issue_key(
    State(state): State<AppState>,
    Json(payload): Json<PublicKeyRequest>,
) -> Result<Json<Value>, ProxyError> {
    let username = payload.username.as_deref().unwrap_or_default().trim();
    if username.is_empty() {
        return Err(ProxyError::BadRequest("username is required".to_string()));
    }
    let note = payload
        .note
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let token = state.keys.create_key(username, note).await?;
    log::info!("[keys] self-service key issued for {username}");
    Ok(Json(json!({
        "token": token,
        "username": username,
        "note": note,
        "masked": mask_token(&token),
    })))
}

pub async fn public_list_keys(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ProxyError::BadRequest("username is required".to_string()));
    }
    let keys: Vec<Value> = state
        .keys
        .list_active_keys_for_label(username)
        .await?
        .into_iter()
        .map(|k| {
            json!({
                "token_masked": mask_token(&k.token),
                "note": k.note,
                "created_at": k.created_at.timestamp(),
            })
        })
        .collect();
    Ok(Json(json!({ "username": username, "keys": keys })))
}
