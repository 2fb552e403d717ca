use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ApiKey, DayCost, LabelCost, LabelDayCost, ModelUsage, UsageRecord};
use sqlx::SqlitePool;

/// The Key Store as seen by the proxy and the admin surface.
#[async_trait]
pub trait KeyService: Send + Sync {
    async fn create_key(&self, label: &str, note: Option<&str>) -> Result<String>;
    async fn get_active_key(&self, token: &str) -> Result<Option<ApiKey>>;
    async fn revoke_key(&self, token: &str) -> Result<bool>;
    async fn list_active_keys_for_label(&self, label: &str) -> Result<Vec<ApiKey>>;
    async fn record_usage(&self, record: &UsageRecord) -> Result<()>;
    async fn aggregate_usage(&self, token: &str) -> Result<Vec<ModelUsage>>;
    async fn aggregate_cost_by_label(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LabelCost>>;
    async fn aggregate_cost_by_day(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DayCost>>;
    async fn aggregate_cost_by_label_and_day(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LabelDayCost>>;
}

pub struct SqliteKeyService {
    pub pool: SqlitePool,
}

#[async_trait]
impl KeyService for SqliteKeyService {
    async fn create_key(&self, label: &str, note: Option<&str>) -> Result<String> {
        db::create_key(&self.pool, label, note).await
    }

    async fn get_active_key(&self, token: &str) -> Result<Option<ApiKey>> {
        db::get_active_key(&self.pool, token).await
    }

    async fn revoke_key(&self, token: &str) -> Result<bool> {
        db::revoke_key(&self.pool, token).await
    }

    async fn list_active_keys_for_label(&self, label: &str) -> Result<Vec<ApiKey>> {
        db::list_active_keys_for_label(&self.pool, label).await
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        db::record_usage(&self.pool, record).await
    }

    async fn aggregate_usage(&self, token: &str) -> Result<Vec<ModelUsage>> {
        db::aggregate_usage(&self.pool, token).await
    }

    async fn aggregate_cost_by_label(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LabelCost>> {
        db::aggregate_cost_by_label(&self.pool, start, end).await
    }

    async fn aggregate_cost_by_day(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DayCost>> {
        db::aggregate_cost_by_day(&self.pool, start, end).await
    }

    async fn aggregate_cost_by_label_and_day(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LabelDayCost>> {
        db::aggregate_cost_by_label_and_day(&self.pool, start, end).await
    }
}
