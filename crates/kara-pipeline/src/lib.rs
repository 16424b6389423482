//! Raw loading, transformation, image enrichment and the daily stage graph.

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub mod enrich;
pub mod graph;
pub mod loader;
pub mod stages;
pub mod transform;

pub use enrich::{find_images, DetectError, Detection, EnrichSummary, HttpDetector, ImageEnricher, ObjectDetector};
pub use graph::{
    GraphError, Pipeline, PipelineRunSummary, PipelineStage, StageContext, StageName, StageRun, StageSignal,
    StageStatus,
};
pub use loader::{
    channel_for_file, collect_from_files, collect_raw_records, find_json_files, load_raw_directory, load_raw_files,
    CollectedRecords, LoadSummary,
};
pub use stages::PipelineDeps;
pub use transform::{CommandTransform, TransformReport, TransformRunner};

/// Registers `pipeline` to run on `cron` (UTC). The scheduler is returned unstarted.
pub async fn build_scheduler(pipeline: Arc<Pipeline>, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            info!("scheduled pipeline run triggered");
            let summary = pipeline.run_once().await;
            match summary.first_error() {
                None => info!(run_id = %summary.run_id, "scheduled pipeline run finished"),
                Some((stage, message)) => error!(
                    run_id = %summary.run_id,
                    %stage,
                    error = message,
                    "scheduled pipeline run failed"
                ),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(Vec::new()).expect("empty pipeline"))
    }

    #[tokio::test]
    async fn daily_cron_is_accepted() {
        assert!(build_scheduler(empty_pipeline(), "0 0 2 * * *").await.is_ok());
    }

    #[tokio::test]
    async fn malformed_cron_is_rejected() {
        assert!(build_scheduler(empty_pipeline(), "every day at two").await.is_err());
    }
}
