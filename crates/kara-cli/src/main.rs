use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use kara_core::KaraConfig;
use kara_pipeline::{
    build_scheduler, load_raw_directory, CommandTransform, HttpDetector, ImageEnricher, Pipeline, PipelineDeps,
    StageStatus, TransformRunner,
};
use kara_scraper::{preview_batches, ChannelScraper, TelegramGateway};
use kara_storage::{DataLake, DetectionSink, PgStore, RawRecordSink};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "kara-cli")]
#[command(about = "Kara medical analytics: Telegram scraping, staging, enrichment and reports")]
struct Cli {
    /// YAML configuration file; environment variables override its values.
    #[arg(long, global = true, env = "KARA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run scrape, load, transform and enrich once.
    Run,
    /// Run the pipeline on the configured cron schedule until Ctrl-C.
    Schedule,
    Scrape,
    /// Drop and recreate raw.telegram_messages.
    InitRaw,
    Load {
        /// Directory of JSON files; defaults to the configured raw import directory.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    Transform,
    /// Create analytics.fct_image_detections if it is missing.
    InitDetections,
    Enrich,
    /// Serve the report API.
    Serve,
    /// Print the first messages of every stored batch.
    Preview {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KaraConfig::load(cli.config.as_deref())?;
    let _log_guard = logging::init_logging(&config.log_level, &config.log_dir)?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = Pipeline::standard(&config, PipelineDeps::from_config(&config)?)?;
            let summary = pipeline.run_once().await;
            for stage in &summary.stages {
                println!(
                    "{:<10} {:<10} {:>6} ms {}",
                    stage.stage.to_string(),
                    format!("{:?}", stage.status).to_lowercase(),
                    stage.duration_ms,
                    stage.error.as_deref().unwrap_or("")
                );
            }
            if let Some((stage, message)) = summary.first_error() {
                bail!("pipeline run {} failed at {stage}: {message}", summary.run_id);
            }
            let completed = summary
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Completed)
                .count();
            println!("pipeline complete: run_id={} stages={completed}", summary.run_id);
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                println!("scheduler disabled (KARA_SCHEDULER_ENABLED=false)");
                return Ok(());
            }
            let pipeline = Arc::new(Pipeline::standard(&config, PipelineDeps::from_config(&config)?)?);
            let mut sched = build_scheduler(pipeline, &config.schedule_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler started (UTC)");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            println!("scheduler stopped");
        }
        Commands::Scrape => {
            config.validate_for_scrape()?;
            let gateway = TelegramGateway::new(
                &config.gateway_url,
                &config.api_credentials,
                Duration::from_secs(config.request_timeout_secs),
            )?;
            let scraper = ChannelScraper::new(Arc::new(gateway), DataLake::new(&config.data_lake_root));
            let summary = scraper
                .scrape(&config.channels, config.fetch_limit, Utc::now().date_naive())
                .await?;
            for path in &summary.written {
                println!("{}", path.display());
            }
            println!(
                "scrape complete: channels={} files={} messages={} photos={} failures={}",
                summary.channels,
                summary.written.len(),
                summary.messages,
                summary.photos,
                summary.failures.len()
            );
        }
        Commands::InitRaw => {
            pg_store(&config)?.create_raw_table().await?;
            println!("raw.telegram_messages recreated");
        }
        Commands::Load { dir } => {
            let dir = dir.unwrap_or_else(|| config.raw_import_dir().to_path_buf());
            let store = pg_store(&config)?;
            let summary = load_raw_directory(&store, &dir, config.expected_file_count).await?;
            println!(
                "load complete: files={}/{} rows={} skipped={}",
                summary.files_loaded,
                summary.files_seen,
                summary.rows_inserted,
                summary.failures.len()
            );
        }
        Commands::Transform => {
            let transform = CommandTransform::new(&config.transform_command, config.transform_dir.clone())?;
            let report = transform.run().await?;
            println!("transform complete: `{}` in {} ms", report.command, report.duration_ms);
        }
        Commands::InitDetections => {
            pg_store(&config)?.ensure_detection_table().await?;
            println!("analytics.fct_image_detections ready");
        }
        Commands::Enrich => {
            let folders = image_folders(&config).await?;
            let detector = HttpDetector::new(
                &config.detector_url,
                &config.model_path,
                Duration::from_secs(config.request_timeout_secs),
            )?;
            let enricher = ImageEnricher::new(
                Arc::new(detector),
                Arc::new(pg_store(&config)?),
                config.image_extension.clone(),
            );
            let summary = enricher.run(&folders).await?;
            println!(
                "enrich complete: images={}/{} detections={} dropped={} failures={}",
                summary.images_processed,
                summary.images_seen,
                summary.detections_inserted,
                summary.dropped_out_of_range,
                summary.failures.len()
            );
        }
        Commands::Serve => {
            kara_web::serve(&config).await?;
        }
        Commands::Preview { limit } => {
            let lake = DataLake::new(&config.data_lake_root);
            let previews = preview_batches(&lake, limit).await?;
            if previews.is_empty() {
                println!("no batches under {}", lake.root().display());
            }
            for preview in previews {
                println!("== {} ({} messages)", preview.path.display(), preview.total);
                if let Some(err) = &preview.error {
                    println!("   unreadable: {err}");
                }
                for line in &preview.sample {
                    println!("   [{}] {} {}", line.message_id, line.date.to_rfc3339(), line.text);
                }
            }
        }
    }

    Ok(())
}

fn pg_store(config: &KaraConfig) -> Result<PgStore> {
    PgStore::connect_lazy(
        &config.database_url,
        config.db_max_connections,
        Duration::from_secs(config.db_acquire_timeout_secs),
    )
    .context("configuring database pool")
}

/// Configured folders, or every data lake batch directory when none are configured.
async fn image_folders(config: &KaraConfig) -> Result<Vec<PathBuf>> {
    if !config.image_folders.is_empty() {
        return Ok(config.image_folders.clone());
    }
    let lake = DataLake::new(&config.data_lake_root);
    let dirs = lake
        .list_batches()
        .await?
        .iter()
        .filter_map(|path| path.parent().map(PathBuf::from))
        .collect::<BTreeSet<_>>();
    Ok(dirs.into_iter().collect())
}
