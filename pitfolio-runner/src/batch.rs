//! Batch runs: several configurations over one history table.
//!
//! Jobs are independent, so they can run on the rayon pool. A shared cache
//! lets jobs with overlapping stages (same eligibility thresholds, same
//! preselection) reuse each other's work; single-flight keeps two workers
//! from computing the same entry at once.

use log::info;
use rayon::prelude::*;

use pitfolio_core::domain::HistoryTable;

use crate::cache::RebalanceCache;
use crate::config::ValidatedConfig;
use crate::optimizer;
use crate::orchestrator::{run_rebalancing, RunError, RunReport};

/// One named configuration to simulate.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub name: String,
    pub config: ValidatedConfig,
}

impl BatchJob {
    pub fn new(name: impl Into<String>, config: ValidatedConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub name: String,
    pub result: Result<RunReport, RunError>,
}

impl BatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs every job on its own schedule. Outcomes come back in job order
/// whether or not `parallel` is set; one job failing does not stop the rest.
pub struct BatchRunner<'a> {
    table: &'a HistoryTable,
    cache: Option<&'a RebalanceCache>,
    parallel: bool,
}

impl<'a> BatchRunner<'a> {
    pub fn new(table: &'a HistoryTable) -> Self {
        Self {
            table,
            cache: None,
            parallel: true,
        }
    }

    pub fn with_cache(mut self, cache: &'a RebalanceCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Enables or disables parallel execution.
    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn run(&self, jobs: &[BatchJob]) -> Vec<BatchOutcome> {
        info!("batch: {} jobs (parallel={})", jobs.len(), self.parallel);
        if self.parallel {
            jobs.par_iter().map(|job| self.run_job(job)).collect()
        } else {
            jobs.iter().map(|job| self.run_job(job)).collect()
        }
    }

    fn run_job(&self, job: &BatchJob) -> BatchOutcome {
        let dates = job.config.schedule.dates(self.table);
        let optimizer = optimizer::from_config(&job.config.optimizer);
        let result = run_rebalancing(self.table, &dates, &job.config, self.cache, optimizer.as_ref());
        match &result {
            Ok(report) => info!("job '{}': {} rebalances", job.name, report.events.len()),
            Err(err) => info!("job '{}' failed: {err}", job.name),
        }
        BatchOutcome {
            name: job.name.clone(),
            result,
        }
    }
}
