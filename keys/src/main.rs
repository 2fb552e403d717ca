use anyhow::Result;
use clap::{Parser, Subcommand};
use common::ModelUsage;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "proxy-keys")]
struct Args {
    #[arg(long, default_value = "config")]
    config_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Issue a new key for a label
    Issue {
        #[arg(long)]
        label: String,

        #[arg(long)]
        note: Option<String>,
    },
    /// Revoke a key
    Revoke { token: String },
    /// List a label's active keys, newest first
    List {
        #[arg(long)]
        label: String,
    },
    /// Per-model usage totals for a key
    Usage { token: String },
}

#[derive(Deserialize)]
struct KeysConfig {
    #[serde(default = "default_database_url")]
    database_url: String,
}

fn default_database_url() -> String {
    "sqlite://data/proxy.sqlite".to_string()
}

fn load_config(config_file: &str) -> Result<KeysConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(config_file).required(false))
        .add_source(config::Environment::default())
        .build()?;
    let cfg: KeysConfig = settings.try_deserialize()?;
    Ok(cfg)
}

fn usage_line(row: &ModelUsage) -> String {
    format!(
        "{:<32} prompt {:>10} completion {:>10} total {:>10} cost {:>10.4}",
        row.model, row.prompt_tokens, row.completion_tokens, row.total_tokens, row.cost
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("keys=info"));

    let args = Args::parse();
    let cfg = load_config(&args.config_file)?;

    let pool = db::init_pool(&cfg.database_url).await?;
    db::create_tables(&pool).await?;

    match args.command {
        Command::Issue { label, note } => {
            let token = db::create_key(&pool, &label, note.as_deref()).await?;
            log::info!("Issued key for label {}", label);
            println!("{token}");
        }
        Command::Revoke { token } => {
            if db::revoke_key(&pool, &token).await? {
                log::info!("Revoked key");
            } else {
                anyhow::bail!("token not found or already revoked");
            }
        }
        Command::List { label } => {
            let keys = db::list_active_keys_for_label(&pool, &label).await?;
            log::info!("{} active keys for label {}", keys.len(), label);
            for key in keys {
                println!(
                    "{}\t{}\t{}",
                    key.token,
                    key.created_at.format("%Y-%m-%d %H:%M:%S"),
                    key.note.unwrap_or_default()
                );
            }
        }
        Command::Usage { token } => {
            let rows = db::aggregate_usage(&pool, &token).await?;
            if rows.is_empty() {
                log::info!("No usage recorded for this key");
            }
            for row in &rows {
                println!("{}", usage_line(row));
            }
        }
    }

    Ok(())
}
