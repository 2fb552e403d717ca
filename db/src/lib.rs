use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{ApiKey, DayCost, LabelCost, LabelDayCost, ModelUsage, UsageRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// A single pinned connection, so the database lives as long as the pool.
pub async fn init_pool_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS api_keys (
            token TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            note TEXT,
            created_at INTEGER NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token TEXT NOT NULL,
            label TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            cost REAL,
            created_at INTEGER NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_token ON usage (token)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_created_at ON usage (created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_label ON api_keys (label)")
        .execute(pool)
        .await?;
    Ok(())
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// --- Keys ---

pub async fn create_key(pool: &SqlitePool, label: &str, note: Option<&str>) -> Result<String> {
    let token = Uuid::new_v4().simple().to_string();
    sqlx::query("INSERT INTO api_keys (token, label, note, created_at) VALUES ($1, $2, $3, $4)")
        .bind(&token)
        .bind(label)
        .bind(note)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(token)
}

pub async fn get_active_key(pool: &SqlitePool, token: &str) -> Result<Option<ApiKey>> {
    let row = sqlx::query_as::<_, (String, String, Option<String>, i64)>(
        "select token, label, note, created_at from api_keys where token = $1 and revoked = 0",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(token, label, note, created_at)| ApiKey {
        token,
        label,
        note,
        created_at: from_epoch(created_at),
        revoked: false,
    }))
}

pub async fn revoke_key(pool: &SqlitePool, token: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE api_keys SET revoked = 1 WHERE token = $1 AND revoked = 0")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_active_keys_for_label(pool: &SqlitePool, label: &str) -> Result<Vec<ApiKey>> {
    let rows = sqlx::query_as::<_, (String, String, Option<String>, i64)>(
        r#"select token, label, note, created_at
        from api_keys
        where label = $1 and revoked = 0
        order by created_at desc, rowid desc"#,
    )
    .bind(label)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(token, label, note, created_at)| ApiKey {
            token,
            label,
            note,
            created_at: from_epoch(created_at),
            revoked: false,
        })
        .collect())
}

// --- Usage ledger ---

pub async fn record_usage(pool: &SqlitePool, record: &UsageRecord) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO usage (token, label, model, prompt_tokens, completion_tokens, total_tokens, cost, created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
    )
    .bind(&record.token)
    .bind(&record.label)
    .bind(&record.model)
    .bind(record.prompt_tokens)
    .bind(record.completion_tokens)
    .bind(record.total_tokens)
    .bind(record.cost)
    .bind(record.created_at.timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn aggregate_usage(pool: &SqlitePool, token: &str) -> Result<Vec<ModelUsage>> {
    let rows = sqlx::query_as::<_, (String, i64, i64, i64, f64)>(
        r#"select
            model,
            coalesce(sum(prompt_tokens), 0),
            coalesce(sum(completion_tokens), 0),
            coalesce(sum(total_tokens), 0),
            coalesce(sum(cost), 0.0)
        from usage
        where token = $1
        group by model
        order by model"#,
    )
    .bind(token)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(
            |(model, prompt_tokens, completion_tokens, total_tokens, cost)| ModelUsage {
                model,
                prompt_tokens,
                completion_tokens,
                total_tokens,
                cost,
            },
        )
        .collect())
}

pub async fn aggregate_cost_by_label(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<LabelCost>> {
    let rows = sqlx::query_as::<_, (String, f64)>(
        r#"select label, coalesce(sum(cost), 0.0) as total
        from usage
        where created_at >= $1 and created_at < $2
        group by label
        order by total desc"#,
    )
    .bind(start.timestamp())
    .bind(end.timestamp())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(label, cost)| LabelCost { label, cost })
        .collect())
}

pub async fn aggregate_cost_by_day(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<DayCost>> {
    let rows = sqlx::query_as::<_, (String, f64)>(
        r#"select date(created_at, 'unixepoch') as day, coalesce(sum(cost), 0.0)
        from usage
        where created_at >= $1 and created_at < $2
        group by day
        order by day"#,
    )
    .bind(start.timestamp())
    .bind(end.timestamp())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(day, cost)| DayCost { day, cost })
        .collect())
}

pub async fn aggregate_cost_by_label_and_day(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<LabelDayCost>> {
    let rows = sqlx::query_as::<_, (String, String, f64)>(
        r#"select label, date(created_at, 'unixepoch') as day, coalesce(sum(cost), 0.0)
        from usage
        where created_at >= $1 and created_at < $2
        group by label, day
        order by day, label"#,
    )
    .bind(start.timestamp())
    .bind(end.timestamp())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(label, day, cost)| LabelDayCost { label, day, cost })
        .collect())
}
