use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use kara_core::KaraConfig;
use kara_scraper::{ChannelScraper, MessageSource, TelegramGateway};
use kara_storage::{DataLake, DetectionSink, PgStore, RawRecordSink};
use tracing::info;

use crate::enrich::{HttpDetector, ImageEnricher, ObjectDetector};
use crate::graph::{GraphError, Pipeline, PipelineStage, StageContext, StageName, StageSignal};
use crate::loader::{load_raw_directory, load_raw_files, LoadSummary};
use crate::transform::{CommandTransform, TransformRunner};

/// External collaborators of the standard pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub source: Arc<dyn MessageSource>,
    pub raw_sink: Arc<dyn RawRecordSink>,
    pub detection_sink: Arc<dyn DetectionSink>,
    pub transform: Arc<dyn TransformRunner>,
    pub detector: Arc<dyn ObjectDetector>,
}

impl PipelineDeps {
    /// Production wiring: Postgres, the Telegram bridge, the configured transform command
    /// and the HTTP detector. Nothing connects until a stage runs.
    pub fn from_config(config: &KaraConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let store = Arc::new(
            PgStore::connect_lazy(
                &config.database_url,
                config.db_max_connections,
                Duration::from_secs(config.db_acquire_timeout_secs),
            )
            .context("configuring database pool")?,
        );
        let source = TelegramGateway::new(&config.gateway_url, &config.api_credentials, timeout)
            .context("configuring messaging gateway")?;
        let transform = CommandTransform::new(&config.transform_command, config.transform_dir.clone())?;
        let detector = HttpDetector::new(&config.detector_url, &config.model_path, timeout)
            .context("configuring object detector")?;
        Ok(Self {
            source: Arc::new(source),
            raw_sink: store.clone(),
            detection_sink: store,
            transform: Arc::new(transform),
            detector: Arc::new(detector),
        })
    }
}

pub struct ScrapeStage {
    scraper: ChannelScraper,
    channels: Vec<String>,
    limit: usize,
}

#[async_trait]
impl PipelineStage for ScrapeStage {
    fn name(&self) -> StageName {
        StageName::Scrape
    }

    fn depends_on(&self) -> Vec<StageName> {
        Vec::new()
    }

    async fn run(&self, _ctx: &StageContext) -> anyhow::Result<StageSignal> {
        if self.channels.is_empty() {
            bail!("no channels configured");
        }
        let date = Utc::now().date_naive();
        let summary = self.scraper.scrape(&self.channels, self.limit, date).await?;
        Ok(StageSignal::Scraped {
            files: summary.written,
            messages: summary.messages,
            failures: summary.failures.len(),
        })
    }
}

pub struct LoadStage {
    sink: Arc<dyn RawRecordSink>,
    import_dir: PathBuf,
    expected: usize,
}

#[async_trait]
impl PipelineStage for LoadStage {
    fn name(&self) -> StageName {
        StageName::Load
    }

    fn depends_on(&self) -> Vec<StageName> {
        vec![StageName::Scrape]
    }

    /// Appends this run's scraped batches to the staging table, creating it when missing.
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<StageSignal> {
        self.sink
            .ensure_raw_table()
            .await
            .context("ensuring raw staging table")?;
        let summary: LoadSummary = match ctx.scraped_files() {
            Some(files) => load_raw_files(self.sink.as_ref(), files, self.expected).await?,
            None => load_raw_directory(self.sink.as_ref(), &self.import_dir, self.expected).await?,
        };
        Ok(StageSignal::Loaded {
            files: summary.files_loaded,
            rows: summary.rows_inserted,
            failures: summary.failures.len(),
        })
    }
}

pub struct TransformStage {
    runner: Arc<dyn TransformRunner>,
}

#[async_trait]
impl PipelineStage for TransformStage {
    fn name(&self) -> StageName {
        StageName::Transform
    }

    fn depends_on(&self) -> Vec<StageName> {
        vec![StageName::Load]
    }

    async fn run(&self, _ctx: &StageContext) -> anyhow::Result<StageSignal> {
        self.runner.run().await?;
        Ok(StageSignal::Transformed)
    }
}

pub struct EnrichStage {
    enricher: ImageEnricher,
    sink: Arc<dyn DetectionSink>,
    folders: Vec<PathBuf>,
}

#[async_trait]
impl PipelineStage for EnrichStage {
    fn name(&self) -> StageName {
        StageName::Enrich
    }

    fn depends_on(&self) -> Vec<StageName> {
        vec![StageName::Transform]
    }

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<StageSignal> {
        let folders = if self.folders.is_empty() {
            scraped_folders(ctx)
        } else {
            self.folders.clone()
        };
        info!(folders = folders.len(), "enriching images");
        self.sink
            .ensure_detection_table()
            .await
            .context("ensuring detection table")?;
        let summary = self.enricher.run(&folders).await?;
        Ok(StageSignal::Enriched {
            images: summary.images_processed,
            detections: summary.detections_inserted,
            failures: summary.failures.len(),
        })
    }
}

/// Directories holding this run's scraped batches, where downloaded photos live.
fn scraped_folders(ctx: &StageContext) -> Vec<PathBuf> {
    ctx.scraped_files()
        .unwrap_or_default()
        .iter()
        .filter_map(|file| file.parent().map(PathBuf::from))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl Pipeline {
    /// Scrape, Load, Transform and Enrich chained in that order.
    pub fn standard(config: &KaraConfig, deps: PipelineDeps) -> Result<Self, GraphError> {
        let lake = DataLake::new(&config.data_lake_root);
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(ScrapeStage {
                scraper: ChannelScraper::new(deps.source, lake),
                channels: config.channels.clone(),
                limit: config.fetch_limit,
            }),
            Arc::new(LoadStage {
                sink: deps.raw_sink,
                import_dir: config.raw_import_dir().to_path_buf(),
                expected: config.expected_file_count,
            }),
            Arc::new(TransformStage {
                runner: deps.transform,
            }),
            Arc::new(EnrichStage {
                enricher: ImageEnricher::new(
                    deps.detector,
                    deps.detection_sink.clone(),
                    config.image_extension.clone(),
                ),
                sink: deps.detection_sink,
                folders: config.image_folders.clone(),
            }),
        ];
        Pipeline::new(stages)
    }
}
