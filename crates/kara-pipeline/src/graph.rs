use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Scrape,
    Load,
    Transform,
    Enrich,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageName::Scrape => "scrape",
            StageName::Load => "load",
            StageName::Transform => "transform",
            StageName::Enrich => "enrich",
        })
    }
}

/// What a completed stage hands to the stages that depend on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum StageSignal {
    Scraped {
        files: Vec<PathBuf>,
        messages: usize,
        failures: usize,
    },
    Loaded {
        files: usize,
        rows: u64,
        failures: usize,
    },
    Transformed,
    Enriched {
        images: usize,
        detections: u64,
        failures: usize,
    },
}

/// Signals of the stages that completed earlier in the current run.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    signals: BTreeMap<StageName, StageSignal>,
}

impl StageContext {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            signals: BTreeMap::new(),
        }
    }

    pub fn signal(&self, stage: StageName) -> Option<&StageSignal> {
        self.signals.get(&stage)
    }

    pub fn record(&mut self, stage: StageName, signal: StageSignal) {
        self.signals.insert(stage, signal);
    }

    /// Batch files written by the scrape stage of this run, if it ran.
    pub fn scraped_files(&self) -> Option<&[PathBuf]> {
        match self.signal(StageName::Scrape) {
            Some(StageSignal::Scraped { files, .. }) => Some(files),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> StageName;

    fn depends_on(&self) -> Vec<StageName>;

    async fn run(&self, ctx: &StageContext) -> anyhow::Result<StageSignal>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("stage {0} is registered twice")]
    DuplicateStage(StageName),
    #[error("stage {stage} depends on unregistered stage {missing}")]
    UnknownDependency { stage: StageName, missing: StageName },
    #[error("stages {0:?} form a dependency cycle")]
    Cycle(Vec<StageName>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub stage: StageName,
    pub status: StageStatus,
    pub duration_ms: u128,
    pub signal: Option<StageSignal>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageRun>,
}

impl PipelineRunSummary {
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.status == StageStatus::Completed)
    }

    pub fn status_of(&self, stage: StageName) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| s.status)
    }

    pub fn first_error(&self) -> Option<(StageName, &str)> {
        self.stages
            .iter()
            .find_map(|s| s.error.as_deref().map(|e| (s.stage, e)))
    }
}

/// A validated stage graph executed one stage at a time in dependency order.
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
    run_lock: Mutex<()>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("order", &self.order())
            .finish()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn PipelineStage>>) -> Result<Self, GraphError> {
        let mut by_name: BTreeMap<StageName, Arc<dyn PipelineStage>> = BTreeMap::new();
        for stage in stages {
            let name = stage.name();
            if by_name.insert(name, stage).is_some() {
                return Err(GraphError::DuplicateStage(name));
            }
        }

        let mut deps: BTreeMap<StageName, BTreeSet<StageName>> = BTreeMap::new();
        for (name, stage) in &by_name {
            let wanted = stage.depends_on().into_iter().collect::<BTreeSet<_>>();
            if let Some(missing) = wanted.iter().find(|d| !by_name.contains_key(*d)) {
                return Err(GraphError::UnknownDependency {
                    stage: *name,
                    missing: *missing,
                });
            }
            deps.insert(*name, wanted);
        }

        // Kahn's algorithm; ties resolve in `StageName` order.
        let mut ordered = Vec::with_capacity(by_name.len());
        let mut done = BTreeSet::new();
        while done.len() < deps.len() {
            let ready = deps
                .iter()
                .find(|(name, wanted)| !done.contains(*name) && wanted.is_subset(&done))
                .map(|(name, _)| *name);
            let Some(next) = ready else {
                let stuck = deps
                    .keys()
                    .filter(|name| !done.contains(*name))
                    .copied()
                    .collect();
                return Err(GraphError::Cycle(stuck));
            };
            done.insert(next);
            if let Some(stage) = by_name.remove(&next) {
                ordered.push(stage);
            }
        }

        Ok(Self {
            stages: ordered,
            run_lock: Mutex::new(()),
        })
    }

    /// Stage names in execution order.
    pub fn order(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage once. A failed stage marks all of its transitive dependents
    /// as skipped; nothing is retried. Concurrent calls wait for each other.
    pub async fn run_once(&self) -> PipelineRunSummary {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut ctx = StageContext::new(run_id, started_at);
        let mut runs: Vec<StageRun> = Vec::with_capacity(self.stages.len());

        info!(%run_id, stages = ?self.order(), "pipeline run started");
        for stage in &self.stages {
            let name = stage.name();
            let blocked = stage.depends_on().into_iter().find(|dep| {
                runs.iter()
                    .any(|r| r.stage == *dep && r.status != StageStatus::Completed)
            });
            if let Some(dep) = blocked {
                warn!(%run_id, stage = %name, upstream = %dep, "skipping stage");
                runs.push(StageRun {
                    stage: name,
                    status: StageStatus::Skipped,
                    duration_ms: 0,
                    signal: None,
                    error: None,
                });
                continue;
            }

            let started = Instant::now();
            let result = stage
                .run(&ctx)
                .instrument(info_span!("pipeline_stage", %run_id, stage = %name))
                .await;
            let duration_ms = started.elapsed().as_millis();
            match result {
                Ok(signal) => {
                    info!(%run_id, stage = %name, duration_ms, ?signal, "stage completed");
                    ctx.record(name, signal.clone());
                    runs.push(StageRun {
                        stage: name,
                        status: StageStatus::Completed,
                        duration_ms,
                        signal: Some(signal),
                        error: None,
                    });
                }
                Err(err) => {
                    error!(%run_id, stage = %name, duration_ms, error = %format!("{err:#}"), "stage failed");
                    runs.push(StageRun {
                        stage: name,
                        status: StageStatus::Failed,
                        duration_ms,
                        signal: None,
                        error: Some(format!("{err:#}")),
                    });
                }
            }
        }

        let summary = PipelineRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stages: runs,
        };
        if summary.succeeded() {
            info!(%run_id, "pipeline run succeeded");
        } else {
            warn!(%run_id, "pipeline run did not complete");
        }
        summary
    }
}
