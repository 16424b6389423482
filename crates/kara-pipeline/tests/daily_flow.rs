use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use kara_core::KaraConfig;
use kara_pipeline::{
    DetectError, Detection, ObjectDetector, Pipeline, PipelineDeps, StageName, StageSignal, StageStatus,
    TransformReport, TransformRunner,
};
use kara_scraper::{ChannelRef, MediaKind, MessageSource, ScrapeError, SourceMessage};
use kara_storage::MemoryStore;
use tempfile::tempdir;

/// Two messages per channel, or none once `quiet` is set.
#[derive(Default)]
struct FakeTelegram {
    quiet: AtomicBool,
}

#[async_trait]
impl MessageSource for FakeTelegram {
    async fn connect(&self) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn resolve_channel(&self, handle: &str) -> Result<ChannelRef, ScrapeError> {
        Ok(ChannelRef {
            handle: handle.to_string(),
            name: kara_core::normalize_channel_handle(handle),
        })
    }

    async fn recent_messages(
        &self,
        _channel: &ChannelRef,
        _limit: usize,
    ) -> Result<Vec<Result<SourceMessage, ScrapeError>>, ScrapeError> {
        if self.quiet.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let date = Utc
            .with_ymd_and_hms(2025, 1, 18, 9, 30, 0)
            .single()
            .expect("valid timestamp");
        Ok(vec![
            Ok(SourceMessage {
                id: 11,
                date,
                text: Some("Paracetamol 500mg".into()),
                sender_id: Some(1),
                views: Some(120),
                forwards: Some(2),
                media: MediaKind::Photo,
            }),
            Ok(SourceMessage {
                id: 10,
                date,
                text: None,
                sender_id: None,
                views: None,
                forwards: None,
                media: MediaKind::None,
            }),
        ])
    }

    async fn download_photo(&self, _channel: &ChannelRef, message_id: i64) -> Result<Vec<u8>, ScrapeError> {
        Ok(format!("jpeg {message_id}").into_bytes())
    }
}

#[derive(Default)]
struct CountingTransform {
    runs: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl TransformRunner for CountingTransform {
    async fn run(&self) -> anyhow::Result<TransformReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("dbt exited with status 1");
        }
        Ok(TransformReport {
            command: "dbt run".into(),
            duration_ms: 0,
        })
    }
}

struct BottleDetector;

#[async_trait]
impl ObjectDetector for BottleDetector {
    async fn detect(&self, _image: &Path) -> Result<Vec<Detection>, DetectError> {
        Ok(vec![Detection {
            class_name: "bottle".into(),
            confidence: 0.88,
        }])
    }
}

fn setup(lake: &Path, transform: Arc<CountingTransform>) -> (Pipeline, Arc<MemoryStore>) {
    setup_with_source(lake, Arc::new(FakeTelegram::default()), transform)
}

fn setup_with_source(
    lake: &Path,
    source: Arc<FakeTelegram>,
    transform: Arc<CountingTransform>,
) -> (Pipeline, Arc<MemoryStore>) {
    let config = KaraConfig {
        data_lake_root: lake.to_path_buf(),
        channels: vec!["@Chemed123".into(), "https://t.me/lobelia4cosmetics".into()],
        expected_file_count: 2,
        ..KaraConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let deps = PipelineDeps {
        source,
        raw_sink: store.clone(),
        detection_sink: store.clone(),
        transform,
        detector: Arc::new(BottleDetector),
    };
    (Pipeline::standard(&config, deps).expect("standard pipeline"), store)
}

#[tokio::test]
async fn daily_run_scrapes_loads_transforms_and_enriches() {
    let lake = tempdir().expect("tempdir");
    let transform = Arc::new(CountingTransform::default());
    let (pipeline, store) = setup(lake.path(), transform.clone());

    let summary = pipeline.run_once().await;
    assert!(summary.succeeded(), "{:?}", summary.first_error());

    match summary.stages[0].signal.as_ref() {
        Some(StageSignal::Scraped { files, messages, .. }) => {
            assert_eq!(files.len(), 2);
            assert_eq!(*messages, 4);
        }
        other => panic!("unexpected scrape signal {other:?}"),
    }

    let raw = store.raw_records().await;
    assert_eq!(raw.len(), 4);
    let channels = raw.iter().map(|r| r.channel_name.as_str()).collect::<Vec<_>>();
    assert!(channels.contains(&"Chemed123"));
    assert!(channels.contains(&"lobelia4cosmetics"));
    assert!(raw.iter().all(|r| r.file_name == "messages.json"));
    assert_eq!(raw[0].json_data["text"], "Paracetamol 500mg");
    assert_eq!(raw[1].json_data["text"], "");
    assert_eq!(raw[1].json_data["views"], 0);

    assert_eq!(transform.runs.load(Ordering::SeqCst), 1);

    let detections = store.detections().await;
    assert_eq!(detections.len(), 2);
    assert!(detections.iter().all(|d| d.image_path.ends_with("photo_11.jpg")));
}

#[tokio::test]
async fn raw_rows_and_detections_accumulate_across_runs() {
    let lake = tempdir().expect("tempdir");
    let (pipeline, store) = setup(lake.path(), Arc::new(CountingTransform::default()));

    assert!(pipeline.run_once().await.succeeded());
    assert!(pipeline.run_once().await.succeeded());

    assert_eq!(store.raw_records().await.len(), 8);
    assert_eq!(store.detections().await.len(), 4);
}

#[tokio::test]
async fn quiet_day_keeps_previously_staged_rows() {
    let lake = tempdir().expect("tempdir");
    let source = Arc::new(FakeTelegram::default());
    let (pipeline, store) = setup_with_source(lake.path(), source.clone(), Arc::new(CountingTransform::default()));

    assert!(pipeline.run_once().await.succeeded());
    assert_eq!(store.raw_records().await.len(), 4);

    source.quiet.store(true, Ordering::SeqCst);
    let summary = pipeline.run_once().await;
    assert_eq!(summary.status_of(StageName::Load), Some(StageStatus::Completed));
    match summary.stages[1].signal.as_ref() {
        Some(StageSignal::Loaded { rows, .. }) => assert_eq!(*rows, 0),
        other => panic!("unexpected load signal {other:?}"),
    }
    assert_eq!(store.raw_records().await.len(), 4);
}

#[tokio::test]
async fn failed_transform_skips_enrichment() {
    let lake = tempdir().expect("tempdir");
    let transform = Arc::new(CountingTransform {
        fail: true,
        ..CountingTransform::default()
    });
    let (pipeline, store) = setup(lake.path(), transform);

    let summary = pipeline.run_once().await;
    assert_eq!(summary.status_of(StageName::Load), Some(StageStatus::Completed));
    assert_eq!(summary.status_of(StageName::Transform), Some(StageStatus::Failed));
    assert_eq!(summary.status_of(StageName::Enrich), Some(StageStatus::Skipped));
    assert_eq!(store.raw_records().await.len(), 4);
    assert!(store.detections().await.is_empty());
}

#[tokio::test]
async fn unreachable_database_fails_load_and_halts() {
    let lake = tempdir().expect("tempdir");
    let transform = Arc::new(CountingTransform::default());
    let (pipeline, store) = setup(lake.path(), transform.clone());
    store.set_offline(true);

    let summary = pipeline.run_once().await;
    assert_eq!(summary.status_of(StageName::Scrape), Some(StageStatus::Completed));
    assert_eq!(summary.status_of(StageName::Load), Some(StageStatus::Failed));
    assert_eq!(summary.status_of(StageName::Transform), Some(StageStatus::Skipped));
    assert_eq!(transform.runs.load(Ordering::SeqCst), 0);
}
