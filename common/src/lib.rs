use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKey {
    pub token: String,
    pub label: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

/// One row of the append-only usage ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub token: String,
    pub label: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelCost {
    pub label: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayCost {
    pub day: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelDayCost {
    pub label: String,
    pub day: String,
    pub cost: f64,
}

/// Dollars per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub input: f64,
    pub output: f64,
}
