use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

const API_VERSION_PARAM: &str = "api-version";
const ERROR_BODY_PREVIEW: usize = 300;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream {status} error: {body}")]
    Status { status: u16, body: String },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned unparseable JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream did not return models")]
    NoModels,
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
}

/// Anything that can list the upstream's real model ids.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn list_models(&self) -> Result<Vec<String>, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base: String,
    pub api_key: String,
    pub api_version: Option<String>,
    pub models_connect_timeout: Duration,
    pub models_timeout: Duration,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl UpstreamSettings {
    pub fn new(base: &str, api_key: &str) -> Self {
        Self {
            base: base.to_string(),
            api_key: api_key.to_string(),
            api_version: None,
            models_connect_timeout: Duration::from_secs(5),
            models_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct UpstreamClient {
    base: String,
    api_key: String,
    api_version: Option<String>,
    models_http: Client,
    http: Client,
    timeout: Duration,
}

pub fn new_client(settings: &UpstreamSettings) -> anyhow::Result<UpstreamClient> {
    let models_http = Client::builder()
        .connect_timeout(settings.models_connect_timeout)
        .timeout(settings.models_timeout)
        .build()?;
    // Streams can outlive any overall deadline, so only idle reads are bounded here.
    let http = Client::builder()
        .connect_timeout(settings.connect_timeout)
        .read_timeout(settings.timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    Ok(UpstreamClient {
        base: normalize_base(&settings.base),
        api_key: settings.api_key.clone(),
        api_version: settings.api_version.clone(),
        models_http,
        http,
        timeout: settings.timeout,
    })
}

/// Drops any query string and trailing slashes from the configured base.
pub fn normalize_base(raw_base: &str) -> String {
    raw_base
        .split('?')
        .next()
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_string()
}

impl UpstreamClient {
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Overall deadline for a buffered call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    /// `sub_path` and `raw_query` are appended as given, so they must already
    /// be percent-encoded.
    pub fn url_for(&self, sub_path: &str, raw_query: Option<&str>) -> Result<Url, UpstreamError> {
        let mut url = format!("{}/{}", self.base, sub_path.trim_start_matches('/'));
        if let Some(query) = raw_query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        let mut url = Url::parse(&url).map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;

        if let Some(version) = &self.api_version {
            let present = url.query_pairs().any(|(k, _)| k == API_VERSION_PARAM);
            if !present {
                url.query_pairs_mut().append_pair(API_VERSION_PARAM, version);
            }
        }
        Ok(url)
    }

    /// A request to `{base}/{sub_path}` carrying the upstream credential.
    pub fn request(
        &self,
        method: Method,
        sub_path: &str,
        raw_query: Option<&str>,
    ) -> Result<RequestBuilder, UpstreamError> {
        let url = self.url_for(sub_path, raw_query)?;
        Ok(self
            .http
            .request(method, url)
            .header(AUTHORIZATION, self.bearer()))
    }

    pub async fn fetch_models(&self) -> Result<Vec<String>, UpstreamError> {
        let url = self.url_for("models", None)?;
        log::info!("[models] base {} full {}", self.base, url);

        let resp = self
            .models_http
            .get(url)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await?;

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_PREVIEW).collect(),
            });
        }

        let bytes = resp.bytes().await?;
        let data: Value = serde_json::from_slice(&bytes)?;
        parse_model_list(&data)
    }
}

#[async_trait]
impl ModelSource for UpstreamClient {
    async fn list_models(&self) -> Result<Vec<String>, UpstreamError> {
        self.fetch_models().await
    }
}

/// The shapes a model listing is known to come in, tried in declaration order.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelListing {
    Data { data: Vec<Value> },
    Value { value: Vec<Value> },
    Single { id: Value },
}

/// Sorted, de-duplicated model ids from any supported listing shape.
pub fn parse_model_list(data: &Value) -> Result<Vec<String>, UpstreamError> {
    let listing = ModelListing::deserialize(data).map_err(|_| UpstreamError::NoModels)?;

    let mut models = BTreeSet::new();
    match listing {
        ModelListing::Data { data } => {
            for item in &data {
                if let Some(id) = first_id(item, &["id", "model"]) {
                    models.insert(id);
                }
            }
        }
        ModelListing::Value { value } => {
            for item in &value {
                if let Some(id) = first_id(item, &["model", "id"]) {
                    models.insert(id);
                }
            }
        }
        ModelListing::Single { id } => {
            if let Some(id) = id_string(&id) {
                models.insert(id);
            }
        }
    }

    if models.is_empty() {
        return Err(UpstreamError::NoModels);
    }
    Ok(models.into_iter().collect())
}

fn first_id(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| item.get(*key).and_then(id_string))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn normalize_base_strips_query_and_trailing_slash() {
        assert_eq!(normalize_base("https://api.example.com/v1/"), "https://api.example.com/v1");
        assert_eq!(
            normalize_base("https://api.example.com/openai//?api-version=1"),
            "https://api.example.com/openai"
        );
        assert_eq!(normalize_base("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn parses_data_shape() {
        let data = json!({"data": [{"id": "gpt-4o"}, {"model": "gpt-4o-mini"}, {"id": "gpt-4o"}, {}]});
        assert_eq!(parse_model_list(&data).unwrap(), vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[test]
    fn parses_value_shape_preferring_model_field() {
        let data = json!({"value": [{"model": "b", "id": "ignored"}, {"id": "a"}]});
        assert_eq!(parse_model_list(&data).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn parses_single_id_shape() {
        let data = json!({"id": "solo-model", "object": "model"});
        assert_eq!(parse_model_list(&data).unwrap(), vec!["solo-model"]);
    }

    #[test]
    fn rejects_unknown_and_empty_shapes() {
        assert!(matches!(
            parse_model_list(&json!({"models": ["x"]})),
            Err(UpstreamError::NoModels)
        ));
        assert!(matches!(
            parse_model_list(&json!({"data": []})),
            Err(UpstreamError::NoModels)
        ));
        assert!(matches!(
            parse_model_list(&json!(["x"])),
            Err(UpstreamError::NoModels)
        ));
    }

    #[test]
    fn url_for_appends_api_version_once() {
        let mut settings = UpstreamSettings::new("https://up.example.com/openai/", "sk");
        settings.api_version = Some("2024-10-01".to_string());
        let client = new_client(&settings).unwrap();

        let url = client.url_for("chat/completions", Some("a=1")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://up.example.com/openai/chat/completions?a=1&api-version=2024-10-01"
        );

        let url = client
            .url_for("/responses", Some("api-version=preview"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://up.example.com/openai/responses?api-version=preview"
        );
    }

    #[test]
    fn url_for_keeps_encoded_path_segments() {
        let client = new_client(&UpstreamSettings::new("https://up.example.com/v1", "sk")).unwrap();
        let url = client
            .url_for("files/a%3Fb%23c%2Fd/content", Some("purpose=x"))
            .unwrap();
        assert_eq!(url.path(), "/v1/files/a%3Fb%23c%2Fd/content");
        assert_eq!(url.query(), Some("purpose=x"));
        assert!(url.fragment().is_none());
    }

    #[tokio::test]
    async fn fetch_models_sends_credential() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/models")
                    .header("authorization", "Bearer sk-upstream");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"data":[{"id":"gpt-4o-2024-08-06"},{"id":"gpt-4o-mini"}]}"#);
            })
            .await;

        let client = new_client(&UpstreamSettings::new(&server.url("/v1"), "sk-upstream")).unwrap();
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["gpt-4o-2024-08-06", "gpt-4o-mini"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_models_surfaces_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/models");
                then.status(503).body("overloaded");
            })
            .await;

        let client = new_client(&UpstreamSettings::new(&server.base_url(), "sk")).unwrap();
        match client.list_models().await {
            Err(UpstreamError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
