use common::PricingEntry;
use std::collections::HashMap;

/// Per-model prices, fixed for the life of the process. A missing model is
/// a normal state and yields no cost.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    pub fn new(entries: HashMap<String, PricingEntry>) -> Self {
        Self { entries }
    }

    pub fn defaults() -> Self {
        let entries = [
            ("gpt-4o", 0.005, 0.015),
            ("gpt-4o-mini", 0.00015, 0.0006),
            ("gpt-3.5-turbo", 0.0015, 0.002),
        ]
        .into_iter()
        .map(|(model, input, output)| (model.to_string(), PricingEntry { input, output }))
        .collect();
        Self { entries }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let entries: HashMap<String, PricingEntry> = serde_json::from_str(raw)?;
        Ok(Self { entries })
    }

    pub fn get(&self, model: &str) -> Option<&PricingEntry> {
        self.entries.get(model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn compute_cost(
    model: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
    pricing: &PricingTable,
) -> Option<f64> {
    let price = pricing.get(model)?;
    Some(
        prompt_tokens as f64 / 1000.0 * price.input
            + completion_tokens as f64 / 1000.0 * price.output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_uses_per_thousand_prices() {
        let pricing = PricingTable::defaults();
        let cost = compute_cost("gpt-4o", 1000, 500, &pricing).unwrap();
        assert!((cost - 0.0125).abs() < 1e-12);
    }

    #[test]
    fn unknown_model_has_no_cost() {
        let pricing = PricingTable::defaults();
        assert_eq!(compute_cost("gpt-4o-2024-08-06", 1000, 500, &pricing), None);
        assert_eq!(compute_cost("gpt-4o", 10, 10, &PricingTable::default()), None);
    }

    #[test]
    fn from_json_reads_input_output_pairs() {
        let pricing = PricingTable::from_json(r#"{"m": {"input": 0.001, "output": 0.002}}"#).unwrap();
        assert_eq!(pricing.len(), 1);
        assert_eq!(compute_cost("m", 2000, 0, &pricing), Some(0.002));
        assert!(PricingTable::from_json("not json").is_err());
    }
}
