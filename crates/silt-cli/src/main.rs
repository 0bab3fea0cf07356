use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use silt_core::{CollectionSchema, DistanceMetric, SiltConfig};
use silt_service::{Entity, SiltServer, DEFAULT_ALIAS};
use silt_storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};

#[derive(Parser, Debug)]
#[command(name = "silt")]
#[command(about = "Silt segment compaction engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./config/silt.toml and SILT_* variables)
    #[arg(long, env = "SILT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as JSON
    Config,

    /// Insert, delete and compact a scratch collection, then report the result
    Demo {
        /// Keep binlogs under this directory instead of in memory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of flushed segments to create
        #[arg(long, default_value = "4")]
        segments: i64,

        /// Rows per segment
        #[arg(long, default_value = "100")]
        rows: i64,

        /// Vector dimension
        #[arg(long, default_value = "8")]
        dimension: u32,

        /// Every n-th primary key is deleted before compacting
        #[arg(long, default_value = "5")]
        delete_every: i64,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SiltConfig> {
    let config = match path {
        Some(path) => SiltConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SiltConfig::load().context("failed to load config")?,
    };
    Ok(config)
}

fn init_logging(config: &SiltConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let subscriber = fmt().with_env_filter(env_filter).with_target(false);
    if config.logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config);

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Demo {
            data_dir,
            segments,
            rows,
            dimension,
            delete_every,
        } => {
            let objects: Arc<dyn ObjectStore> = match &data_dir {
                Some(dir) => Arc::new(LocalObjectStore::new(dir).await?),
                None => Arc::new(MemoryObjectStore::new()),
            };
            run_demo(config, objects, segments, rows, dimension, delete_every).await
        }
    }
}

async fn run_demo(
    config: SiltConfig,
    objects: Arc<dyn ObjectStore>,
    segments: i64,
    rows: i64,
    dimension: u32,
    delete_every: i64,
) -> Result<()> {
    anyhow::ensure!(delete_every > 0, "--delete-every must be positive");
    let wait = config.client.default_wait_timeout();
    let server = SiltServer::with_object_store(config, objects)?;
    server.start();
    server.connect(DEFAULT_ALIAS)?;

    let collection = server.create_collection(
        DEFAULT_ALIAS,
        CollectionSchema::new("silt_demo", dimension).with_shards(1),
    )?;

    for segment in 0..segments {
        let entities = (segment * rows..(segment + 1) * rows)
            .map(|pk| {
                let vector = (0..dimension).map(|d| (pk + i64::from(d)) as f32).collect();
                Entity::new(pk, vector).with_field("segment", json!(segment))
            })
            .collect();
        collection.insert(entities, None).await?;
        collection.flush().await?;
    }
    info!(segments, rows, "Demo data flushed");

    let doomed: Vec<String> = (0..segments * rows)
        .filter(|pk| pk % delete_every == 0)
        .map(|pk| pk.to_string())
        .collect();
    if !doomed.is_empty() {
        let result = collection
            .delete(&format!("int64 in [{}]", doomed.join(", ")))
            .await?;
        info!(deleted = result.delete_count, "Demo deletes applied");
    }

    let group = collection.compact()?;
    let summary = collection
        .wait_for_compaction_completed(Some(wait.max(Duration::from_secs(1))))
        .await?;
    let plans = collection.get_compaction_plans()?;

    collection.create_index("float_vector", DistanceMetric::L2)?;
    collection.load()?;
    let segments_after = collection.get_query_segment_info()?;
    let visible = collection.query("int64 >= 0", &[], None).await?;

    let report = json!({
        "plan_group": group,
        "state": summary,
        "plans": plans,
        "segments": segments_after,
        "num_entities": collection.num_entities().await?,
        "visible_rows": visible.records.len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", server.metrics_text());

    server.shutdown();
    Ok(())
}
