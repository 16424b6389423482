use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kara_core::{ConfidenceScore, ErrorKind, NewDetection, UnitFailure};
use kara_storage::{DetectionSink, FetchError, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

/// One object found in an image, as reported by the model.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Detection {
    #[serde(alias = "class", alias = "name")]
    pub class_name: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("reading image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Request(#[from] FetchError),
    #[error("detector rejected {path}: {reason}")]
    Model { path: PathBuf, reason: String },
}

impl DetectError {
    /// The detector itself cannot be reached; retrying other images is pointless.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, DetectError::Request(err) if err.is_connectivity())
    }
}

/// Object detection over a single image. Only objects above the model's own
/// threshold are returned.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectError>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Client for a model-serving endpoint: image bytes are POSTed to
/// `<detector_url>?model=<model>` and a `{"detections": [...]}` body comes back.
#[derive(Debug)]
pub struct HttpDetector {
    endpoint: Url,
    fetcher: HttpFetcher,
}

impl HttpDetector {
    pub fn new(detector_url: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut endpoint = Url::parse(detector_url)?;
        endpoint.query_pairs_mut().append_pair("model", model);
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(format!("kara-pipeline/{}", env!("CARGO_PKG_VERSION"))),
            ..HttpClientConfig::default()
        })?;
        Ok(Self { endpoint, fetcher })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ObjectDetector for HttpDetector {
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectError> {
        let bytes = fs::read(image).await.map_err(|source| DetectError::Io {
            path: image.to_path_buf(),
            source,
        })?;
        let response: DetectResponse = self
            .fetcher
            .post_bytes_for_json("detector", self.endpoint.as_str(), content_type_for(image), bytes)
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, .. } if status == 400 || status == 422 => DetectError::Model {
                    path: image.to_path_buf(),
                    reason: format!("http status {status}"),
                },
                other => DetectError::Request(other),
            })?;
        Ok(response.detections)
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Image files directly inside each folder whose extension matches `extension`,
/// ignoring case. Missing folders are skipped with a warning.
pub async fn find_images(folders: &[PathBuf], extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    let wanted = extension.trim_start_matches('.');
    let mut images = Vec::new();
    for folder in folders {
        let mut entries = match fs::read_dir(folder).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(folder = %folder.display(), "image folder does not exist");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted));
            if matches && entry.file_type().await?.is_file() {
                images.push(path);
            }
        }
    }
    images.sort();
    images.dedup();
    Ok(images)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichSummary {
    pub images_seen: usize,
    pub images_processed: usize,
    pub detections_inserted: u64,
    pub dropped_out_of_range: usize,
    pub failures: Vec<UnitFailure>,
}

pub struct ImageEnricher {
    detector: Arc<dyn ObjectDetector>,
    sink: Arc<dyn DetectionSink>,
    extension: String,
}

impl ImageEnricher {
    pub fn new(detector: Arc<dyn ObjectDetector>, sink: Arc<dyn DetectionSink>, extension: impl Into<String>) -> Self {
        Self {
            detector,
            sink,
            extension: extension.into(),
        }
    }

    /// Detects objects in every image and appends all results in one transaction.
    /// Re-running over the same folders inserts the same detections again.
    pub async fn run(&self, folders: &[PathBuf]) -> anyhow::Result<EnrichSummary> {
        let images = find_images(folders, &self.extension).await?;
        let mut summary = EnrichSummary {
            images_seen: images.len(),
            ..EnrichSummary::default()
        };
        info!(images = images.len(), "running object detection");

        let mut pending = Vec::new();
        for image in &images {
            let found = match self.detector.detect(image).await {
                Ok(found) => found,
                Err(err) if err.is_connectivity() => {
                    return Err(anyhow::Error::new(err).context("object detector unreachable"));
                }
                Err(err) => {
                    error!(image = %image.display(), error = %err, "detection failed");
                    summary.failures.push(UnitFailure::new(
                        ErrorKind::PartialFetch,
                        image.display().to_string(),
                        err,
                    ));
                    continue;
                }
            };
            summary.images_processed += 1;

            for detection in found {
                let Some(confidence_score) = ConfidenceScore::new(detection.confidence) else {
                    warn!(
                        image = %image.display(),
                        class = %detection.class_name,
                        confidence = detection.confidence,
                        "dropping detection with out-of-range confidence"
                    );
                    summary.dropped_out_of_range += 1;
                    continue;
                };
                pending.push(NewDetection {
                    image_path: image.display().to_string(),
                    detected_object_class: detection.class_name,
                    confidence_score,
                });
            }
        }

        if !pending.is_empty() {
            summary.detections_inserted = self.sink.insert_detections(&pending).await?;
        }
        info!(
            images = summary.images_processed,
            detections = summary.detections_inserted,
            failures = summary.failures.len(),
            "image enrichment committed"
        );
        Ok(summary)
    }
}
