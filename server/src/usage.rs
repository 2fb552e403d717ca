use chrono::Utc;
use common::UsageRecord;
use serde_json::Value;
use std::sync::Arc;

use crate::pricing::{compute_cost, PricingTable};
use crate::service::KeyService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

impl TokenCounts {
    /// Missing or malformed fields count as zero; total falls back to
    /// prompt + completion.
    pub fn from_usage(usage: &Value) -> Self {
        let prompt = count(usage, &["prompt_tokens", "input_tokens"]);
        let completion = count(usage, &["completion_tokens", "output_tokens"]);
        let total = match count(usage, &["total_tokens"]) {
            0 => prompt + completion,
            total => total,
        };
        Self {
            prompt,
            completion,
            total,
        }
    }
}

/// Reads the first of `keys` present in the usage object; later keys are
/// only fallbacks for when earlier ones are absent.
fn count(usage: &Value, keys: &[&str]) -> i64 {
    let Some(value) = keys
        .iter()
        .find_map(|key| usage.get(*key).filter(|v| !v.is_null()))
    else {
        return 0;
    };
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.filter(|n| *n > 0).unwrap_or(0)
}

/// Prices and persists completed requests. Failures are logged, never returned.
pub struct UsageRecorder {
    keys: Arc<dyn KeyService>,
    pricing: Arc<PricingTable>,
}

impl UsageRecorder {
    pub fn new(keys: Arc<dyn KeyService>, pricing: Arc<PricingTable>) -> Self {
        Self { keys, pricing }
    }

    pub fn build_record(&self, token: &str, label: &str, model: &str, usage: &Value) -> UsageRecord {
        let counts = TokenCounts::from_usage(usage);
        UsageRecord {
            token: token.to_string(),
            label: label.to_string(),
            model: model.to_string(),
            prompt_tokens: counts.prompt,
            completion_tokens: counts.completion,
            total_tokens: counts.total,
            cost: compute_cost(model, counts.prompt, counts.completion, &self.pricing),
            created_at: Utc::now(),
        }
    }

    pub async fn record(&self, token: &str, label: &str, model: &str, usage: &Value) {
        let record = self.build_record(token, label, model, usage);
        match self.keys.record_usage(&record).await {
            Ok(()) => log::info!(
                "[usage] label {} model {} prompt {} completion {} cost {:?}",
                record.label,
                record.model,
                record.prompt_tokens,
                record.completion_tokens,
                record.cost
            ),
            Err(e) => log::error!(
                "[usage] failed to record usage for label {} model {}: {e:#}",
                record.label,
                record.model
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_default_missing_fields() {
        let counts = TokenCounts::from_usage(&json!({"prompt_tokens": 12}));
        assert_eq!(
            counts,
            TokenCounts {
                prompt: 12,
                completion: 0,
                total: 12
            }
        );
    }

    #[test]
    fn counts_keep_reported_total() {
        let counts = TokenCounts::from_usage(
            &json!({"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 40}),
        );
        assert_eq!(counts.total, 40);
    }

    #[test]
    fn counts_accept_responses_api_names() {
        let counts = TokenCounts::from_usage(&json!({"input_tokens": 7, "output_tokens": 3}));
        assert_eq!(
            counts,
            TokenCounts {
                prompt: 7,
                completion: 3,
                total: 10
            }
        );
    }

    #[test]
    fn explicit_zero_is_not_replaced_by_fallback_name() {
        let counts = TokenCounts::from_usage(
            &json!({"prompt_tokens": 0, "input_tokens": 9, "completion_tokens": 2, "output_tokens": 7}),
        );
        assert_eq!(
            counts,
            TokenCounts {
                prompt: 0,
                completion: 2,
                total: 2
            }
        );
    }

    #[test]
    fn counts_degrade_to_zero_on_garbage() {
        let counts = TokenCounts::from_usage(
            &json!({"prompt_tokens": "lots", "completion_tokens": null, "total_tokens": [1]}),
        );
        assert_eq!(
            counts,
            TokenCounts {
                prompt: 0,
                completion: 0,
                total: 0
            }
        );
        assert_eq!(TokenCounts::from_usage(&json!("not an object")).total, 0);
    }
}
