use common::PricingEntry;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::pricing::PricingTable;
use upstream::UpstreamSettings;

#[derive(Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_upstream_base")]
    pub upstream_base: String,
    #[serde(default)]
    pub upstream_api_key: String,
    pub upstream_api_version: Option<String>,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub admin_token: Option<String>,
    pub model_pricing_json: Option<String>,
    pub model_pricing: Option<HashMap<String, PricingEntry>>,
    #[serde(default = "default_special_paths")]
    pub usage_exempt_paths: Vec<String>,
    #[serde(default = "default_special_paths")]
    pub event_stream_paths: Vec<String>,
    #[serde(default = "default_models_connect_timeout_secs")]
    pub models_connect_timeout_secs: u64,
    #[serde(default = "default_models_timeout_secs")]
    pub models_timeout_secs: u64,
    #[serde(default = "default_upstream_connect_timeout_secs")]
    pub upstream_connect_timeout_secs: u64,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

fn default_upstream_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_database_url() -> String {
    "sqlite://data/proxy.sqlite".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_special_paths() -> Vec<String> {
    vec!["responses".to_string()]
}

fn default_models_connect_timeout_secs() -> u64 {
    5
}

fn default_models_timeout_secs() -> u64 {
    20
}

fn default_upstream_connect_timeout_secs() -> u64 {
    10
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn upstream_settings(&self) -> UpstreamSettings {
        UpstreamSettings {
            api_version: self
                .upstream_api_version
                .clone()
                .filter(|v| !v.trim().is_empty()),
            models_connect_timeout: Duration::from_secs(self.models_connect_timeout_secs),
            models_timeout: Duration::from_secs(self.models_timeout_secs),
            connect_timeout: Duration::from_secs(self.upstream_connect_timeout_secs),
            timeout: Duration::from_secs(self.upstream_timeout_secs),
            ..UpstreamSettings::new(&self.upstream_base, &self.upstream_api_key)
        }
    }

    /// JSON override first, then the config table, then built-in prices.
    pub fn resolve_pricing(&self) -> anyhow::Result<PricingTable> {
        if let Some(raw) = self.model_pricing_json.as_deref().filter(|r| !r.trim().is_empty()) {
            return PricingTable::from_json(raw)
                .map_err(|e| anyhow::anyhow!("model_pricing_json is not valid pricing JSON: {e}"));
        }
        if let Some(table) = &self.model_pricing {
            return Ok(PricingTable::new(table.clone()));
        }
        Ok(PricingTable::defaults())
    }
}

pub async fn load_config(config_file: &str) -> anyhow::Result<AppConfig> {
    let app_config: AppConfig = Config::builder()
        .add_source(File::with_name(config_file).required(false))
        .add_source(
            Environment::default()
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("usage_exempt_paths")
                .with_list_parse_key("event_stream_paths"),
        )
        .build()?
        .try_deserialize()?;
    Ok(app_config)
}
