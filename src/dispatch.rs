//! Batch dispatch for scheduled runs
//!
//! Iterates `(app, user)` pairs for one period key (e.g. `2026-10-16`). A
//! pair that already has a terminal run in the store for that period is
//! skipped, so re-running the same batch never executes a pair twice. The
//! remaining pairs run concurrently, bounded by a semaphore; each run is
//! fully independent.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::manifest::RawManifest;
use crate::runtime::{RunMode, RunRequest, RunStatus, Runtime};
use crate::store::RunStore;

const DEFAULT_CONCURRENCY: usize = 4;

/// One scheduled `(app, user)` pair
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub manifest: RawManifest,
    pub user_id: String,
    pub inputs: Map<String, Value>,
}

impl BatchJob {
    pub fn new(manifest: RawManifest, user_id: impl Into<String>) -> Self {
        Self {
            manifest,
            user_id: user_id.into(),
            inputs: Map::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    fn key(&self) -> (String, String) {
        (self.manifest.id.clone(), self.user_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Ran {
        app_id: String,
        user_id: String,
        run_id: Uuid,
        status: RunStatus,
    },
    /// Already ran this period (`existing` is `None` for a duplicate within the batch)
    Skipped {
        app_id: String,
        user_id: String,
        existing: Option<Uuid>,
    },
    /// Manifest or inputs rejected; no run was created
    Rejected {
        app_id: String,
        user_id: String,
        reason: String,
    },
    /// Store lookup or save failed; the pair is retried by the next batch
    Failed {
        app_id: String,
        user_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub period: String,
    pub outcomes: Vec<DispatchOutcome>,
}

impl BatchReport {
    pub fn ran(&self) -> usize {
        self.count(|o| matches!(o, DispatchOutcome::Ran { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, DispatchOutcome::Skipped { .. }))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, DispatchOutcome::Rejected { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DispatchOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&DispatchOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

pub struct BatchDispatcher {
    runtime: Arc<Runtime>,
    store: Arc<dyn RunStore>,
    concurrency: usize,
    fallback_allowed: bool,
}

impl BatchDispatcher {
    pub fn new(runtime: Arc<Runtime>, store: Arc<dyn RunStore>) -> Self {
        Self {
            runtime,
            store,
            concurrency: DEFAULT_CONCURRENCY,
            fallback_allowed: false,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Allow platform keys for users without their own credential
    pub fn with_fallback(mut self, allowed: bool) -> Self {
        self.fallback_allowed = allowed;
        self
    }

    /// Run every pair once for `period`; one pair's failure never hides the others
    #[instrument(skip_all, fields(period = %period, jobs = jobs.len()))]
    pub async fn dispatch(&self, period: &str, jobs: Vec<BatchJob>) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let mut outcomes = Vec::new();

        for job in jobs {
            let (app_id, user_id) = job.key();
            if !seen.insert(job.key()) {
                outcomes.push(DispatchOutcome::Skipped {
                    app_id,
                    user_id,
                    existing: None,
                });
                continue;
            }
            pending.push(self.dispatch_one(period, job, Arc::clone(&semaphore)));
        }

        outcomes.extend(join_all(pending).await);

        let report = BatchReport {
            period: period.to_string(),
            outcomes,
        };
        info!(
            ran = report.ran(),
            skipped = report.skipped(),
            rejected = report.rejected(),
            failed = report.failed(),
            "batch dispatched"
        );
        report
    }

    async fn dispatch_one(
        &self,
        period: &str,
        job: BatchJob,
        semaphore: Arc<Semaphore>,
    ) -> DispatchOutcome {
        let (app_id, user_id) = job.key();
        match self.try_dispatch(period, job, semaphore).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%app_id, %user_id, error = %e, "scheduled run not recorded");
                DispatchOutcome::Failed {
                    app_id,
                    user_id,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_dispatch(
        &self,
        period: &str,
        job: BatchJob,
        semaphore: Arc<Semaphore>,
    ) -> Result<DispatchOutcome, RuntimeError> {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| RuntimeError::Store {
                reason: "dispatch semaphore closed".to_string(),
            })?;

        let (app_id, user_id) = job.key();

        if let Some(existing) = self
            .store
            .find_terminal(&app_id, Some(&user_id), period)
            .await?
        {
            info!(%app_id, %user_id, run_id = %existing.id, "already ran this period, skipping");
            return Ok(DispatchOutcome::Skipped {
                app_id,
                user_id,
                existing: Some(existing.id),
            });
        }

        let request = RunRequest::new(job.manifest, RunMode::Use)
            .with_inputs(job.inputs)
            .with_user(user_id.clone())
            .with_fallback(self.fallback_allowed);

        match self.runtime.run_app(request).await {
            Ok(run) => {
                self.store.save(period, run.to_record()).await?;
                Ok(DispatchOutcome::Ran {
                    app_id,
                    user_id,
                    run_id: run.id(),
                    status: run.status(),
                })
            }
            Err(RuntimeError::Manifest(e)) => {
                warn!(%app_id, %user_id, kind = e.kind(), error = %e, "scheduled run rejected");
                Ok(DispatchOutcome::Rejected {
                    app_id,
                    user_id,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}
