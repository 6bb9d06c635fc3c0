//! Rebalance orchestrator — drives the per-date pipeline.
//!
//! For each scheduled date, in strictly increasing order:
//! 1. eligibility on the history through the date (cached)
//! 2. preselection over the eligible assets (cached)
//! 3. membership policy against the current holdings
//! 4. weights from the optimizer over the trailing returns window
//! 5. a new `PortfolioState` with holding counters carried forward
//!
//! The orchestrator owns the evolving state. A failed step leaves it
//! untouched so the caller can skip the date, hold, or abort.

use std::borrow::Cow;

use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pitfolio_core::domain::{AssetId, DatasetHash, Fingerprint, HistoryTable, PortfolioState, PrefixHashes, SeriesKind};
use pitfolio_core::eligibility::{
    evaluate, evaluate_with_delistings, EligibilityError, EligibilityResult, LookaheadPermit,
};
use pitfolio_core::fingerprint::{FingerprintBuilder, FingerprintError};
use pitfolio_core::membership::{self, MembershipDecision, MembershipError};
use pitfolio_core::preselection::{self, Preselection, PreselectionError};

use crate::cache::{CacheStats, RebalanceCache};
use crate::config::{FailurePolicy, ValidatedConfig};
use crate::optimizer::{ConstructionError, PortfolioOptimizer, ReturnWindow, WeightConstraints};

/// Errors from a rebalance step or run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("date {date} is not after the last processed date {last}")]
    NonMonotonicDate { date: NaiveDate, last: NaiveDate },

    #[error("{date}: no eligible assets")]
    InsufficientHistory { date: NaiveDate },

    #[error("{date}: preselection failed: {source}")]
    Preselection {
        date: NaiveDate,
        #[source]
        source: PreselectionError,
    },

    #[error("{date}: membership policy infeasible: {source}")]
    MembershipInfeasible {
        date: NaiveDate,
        #[source]
        source: MembershipError,
    },

    #[error("{date}: no assets selected")]
    EmptySelection { date: NaiveDate },

    #[error("{date}: portfolio construction failed: {source}")]
    PortfolioConstruction {
        date: NaiveDate,
        #[source]
        source: ConstructionError,
    },

    #[error(transparent)]
    Lookahead(#[from] EligibilityError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

impl RunError {
    /// The date the error refers to, if any.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            RunError::NonMonotonicDate { date, .. }
            | RunError::InsufficientHistory { date }
            | RunError::Preselection { date, .. }
            | RunError::MembershipInfeasible { date, .. }
            | RunError::EmptySelection { date }
            | RunError::PortfolioConstruction { date, .. } => Some(*date),
            RunError::Lookahead(_) | RunError::Fingerprint(_) => None,
        }
    }
}

/// Which stages of a step were served from the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStages {
    pub eligibility: bool,
    pub preselection: bool,
    /// The whole step was replayed from the cache.
    pub rebalance: bool,
}

/// Outcome of one rebalance date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub date: NaiveDate,
    pub eligible_count: usize,
    /// Preselection shortlist, or every eligible asset without preselection.
    pub shortlist: Vec<AssetId>,
    pub decision: MembershipDecision,
    pub state: PortfolioState,
    /// ½·Σ|Δw| against the previous state.
    pub realized_turnover: f64,
    pub cached: CachedStages,
}

/// A date that failed under a non-aborting [`FailurePolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub date: NaiveDate,
    pub error: String,
    pub action: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub events: Vec<RebalanceEvent>,
    /// Dates on which holdings were carried without rebalancing.
    pub held: Vec<NaiveDate>,
    pub failures: Vec<StepFailure>,
    pub final_state: PortfolioState,
    pub cache_stats: Option<CacheStats>,
}

/// Stepwise driver. One orchestrator per simulated portfolio.
pub struct Orchestrator<'a> {
    table: &'a HistoryTable,
    returns: Cow<'a, HistoryTable>,
    prefix: PrefixHashes,
    config: &'a ValidatedConfig,
    cache: Option<&'a RebalanceCache>,
    optimizer: &'a dyn PortfolioOptimizer,
    permit: Option<LookaheadPermit>,
    state: PortfolioState,
    events: Vec<RebalanceEvent>,
    held: Vec<NaiveDate>,
    last_date: Option<NaiveDate>,
}

impl<'a> Orchestrator<'a> {
    /// Fails only when delisting detection is configured outside backtest mode.
    pub fn new(
        table: &'a HistoryTable,
        config: &'a ValidatedConfig,
        cache: Option<&'a RebalanceCache>,
        optimizer: &'a dyn PortfolioOptimizer,
    ) -> Result<Self, RunError> {
        let permit = match config.delisting_lookforward_days {
            Some(_) => Some(LookaheadPermit::for_mode(config.mode)?),
            None => None,
        };
        let returns = match table.kind() {
            SeriesKind::Returns => Cow::Borrowed(table),
            SeriesKind::Prices => Cow::Owned(table.to_returns()),
        };
        Ok(Self {
            table,
            returns,
            prefix: table.prefix_hashes(),
            config,
            cache,
            optimizer,
            permit,
            state: PortfolioState::empty(),
            events: Vec::new(),
            held: Vec::new(),
            last_date: None,
        })
    }

    /// Start from existing holdings instead of an empty portfolio.
    pub fn with_state(mut self, state: PortfolioState) -> Self {
        self.last_date = state.date;
        self.state = state;
        self
    }

    pub fn state(&self) -> &PortfolioState {
        &self.state
    }

    pub fn events(&self) -> &[RebalanceEvent] {
        &self.events
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.last_date
    }

    /// Rebalance at `date`. On error the state is unchanged and the date is
    /// not marked as processed.
    pub fn step(&mut self, date: NaiveDate) -> Result<&RebalanceEvent, RunError> {
        self.check_monotonic(date)?;

        let cache_steps = self.config.cache.enabled && self.config.cache.cache_rebalance;
        let event = if cache_steps {
            match self.cache {
                Some(cache) => {
                    let key = self.rebalance_key(date)?;
                    let (mut event, hit) = cache.get_or_compute(&key, || self.compute_event(date))?;
                    if hit {
                        event.cached = CachedStages {
                            rebalance: true,
                            ..CachedStages::default()
                        };
                    }
                    event
                }
                None => self.compute_event(date)?,
            }
        } else {
            self.compute_event(date)?
        };

        info!(
            "rebalance {date}: {} assets (+{} -{}), turnover {:.4}",
            event.state.len(),
            event.decision.added.len(),
            event.decision.removed.len(),
            event.realized_turnover
        );

        self.state = event.state.clone();
        self.last_date = Some(date);
        self.events.push(event);
        Ok(&self.events[self.events.len() - 1])
    }

    /// Keep the current holdings through `date` without rebalancing.
    pub fn hold(&mut self, date: NaiveDate) -> Result<(), RunError> {
        self.check_monotonic(date)?;
        debug!("hold {date}: carrying {} assets", self.state.len());
        self.state = self.state.held_through(date);
        self.last_date = Some(date);
        self.held.push(date);
        Ok(())
    }

    pub fn into_report(self) -> RunReport {
        RunReport {
            events: self.events,
            held: self.held,
            failures: Vec::new(),
            final_state: self.state,
            cache_stats: self.cache.map(|c| c.stats()),
        }
    }

    fn check_monotonic(&self, date: NaiveDate) -> Result<(), RunError> {
        match self.last_date {
            Some(last) if date <= last => Err(RunError::NonMonotonicDate { date, last }),
            _ => Ok(()),
        }
    }

    // ─── Pipeline ───────────────────────────────────────────────────

    fn compute_event(&self, date: NaiveDate) -> Result<RebalanceEvent, RunError> {
        let mut cached = CachedStages::default();

        let (eligibility, hit) = self.memoize(
            || self.stage_key("eligibility", date),
            || Ok(self.evaluate_eligibility(date)),
        )?;
        cached.eligibility = hit;
        if eligibility.eligible_count() == 0 {
            return Err(RunError::InsufficientHistory { date });
        }

        let (shortlist, decision) = match &self.config.preselection {
            Some(params) => {
                let (pre, hit): (Preselection, bool) = self.memoize(
                    || self.stage_key("preselection", date),
                    || {
                        preselection::select(&self.returns, &eligibility, date, params)
                            .map_err(|source| RunError::Preselection { date, source })
                    },
                )?;
                cached.preselection = hit;
                let decision = match &self.config.policy {
                    Some(policy) => membership::apply(policy, &pre, &self.state)
                        .map_err(|source| RunError::MembershipInfeasible { date, source })?,
                    None => membership::shortlist_only(&pre, &self.state),
                };
                (pre.shortlist.assets().cloned().collect(), decision)
            }
            None => {
                let assets: Vec<AssetId> = eligibility.eligible_assets().cloned().collect();
                let decision = membership::unconstrained(date, assets.clone(), &self.state);
                (assets, decision)
            }
        };

        if decision.assets.is_empty() {
            return Err(RunError::EmptySelection { date });
        }

        let state = self
            .construct(date, &decision)
            .map_err(|source| RunError::PortfolioConstruction { date, source })?;
        let realized_turnover = state.turnover_from(&self.state);

        Ok(RebalanceEvent {
            date,
            eligible_count: eligibility.eligible_count(),
            shortlist,
            decision,
            state,
            realized_turnover,
            cached,
        })
    }

    fn evaluate_eligibility(&self, date: NaiveDate) -> EligibilityResult {
        let criteria = self.config.criteria;
        let result = match (&self.permit, self.config.delisting_lookforward_days) {
            (Some(permit), Some(days)) => evaluate_with_delistings(self.table, date, criteria, days, permit),
            _ => evaluate(self.table, date, criteria),
        };
        match self.config.min_coverage {
            Some(pct) => result.with_min_coverage(pct),
            None => result,
        }
    }

    fn construct(&self, date: NaiveDate, decision: &MembershipDecision) -> Result<PortfolioState, ConstructionError> {
        let window = ReturnWindow::from_table(&self.returns, &decision.assets, date, self.config.window);
        let constraints = WeightConstraints {
            max_weight: self.config.optimizer.max_weight,
        };
        let weights = self.optimizer.construct(&window, &constraints)?;
        if let Some(stray) = weights.keys().find(|a| !decision.contains(a)) {
            return Err(ConstructionError::UnknownAsset(stray.clone()));
        }
        Ok(PortfolioState::from_weights(date, &weights, &self.state)?)
    }

    // ─── Caching ────────────────────────────────────────────────────

    fn memoize<T, K, F>(&self, key: K, compute: F) -> Result<(T, bool), RunError>
    where
        T: Serialize + serde::de::DeserializeOwned,
        K: FnOnce() -> Result<Fingerprint, RunError>,
        F: FnOnce() -> Result<T, RunError>,
    {
        match self.cache {
            Some(cache) if self.config.cache.enabled => cache.get_or_compute(&key()?, compute),
            _ => compute().map(|v| (v, false)),
        }
    }

    /// Identity of the data a step at `date` may read. Delisting detection
    /// reads past the date, so it keys on the whole table.
    fn data_hash(&self, date: NaiveDate) -> DatasetHash {
        if self.permit.is_some() {
            self.prefix.through(self.table.len())
        } else {
            self.prefix.through(self.table.rows_through(date))
        }
    }

    fn eligibility_fields(&self, namespace: &str, date: NaiveDate) -> Result<FingerprintBuilder, RunError> {
        Ok(FingerprintBuilder::new(namespace)
            .field("check_date", &date)?
            .field("criteria", &self.config.criteria)?
            .field("min_coverage", &self.config.min_coverage)?
            .field("delisting_lookforward_days", &self.config.delisting_lookforward_days)?
            .data("data", &self.data_hash(date)))
    }

    fn stage_key(&self, namespace: &str, date: NaiveDate) -> Result<Fingerprint, RunError> {
        let builder = self.eligibility_fields(namespace, date)?;
        let builder = match namespace {
            "preselection" => builder.field("params", &self.config.preselection)?,
            _ => builder,
        };
        Ok(builder.build())
    }

    fn rebalance_key(&self, date: NaiveDate) -> Result<Fingerprint, RunError> {
        Ok(self
            .eligibility_fields("rebalance", date)?
            .field("params", &self.config.preselection)?
            .field("policy", &self.config.policy)?
            .field("optimizer", &self.config.optimizer)?
            .field("optimizer_name", self.optimizer.name())?
            .field("window", &self.config.window)?
            .field("previous", &self.state)?
            .build())
    }
}

/// Run every date in `dates` and collect the report.
///
/// Failures follow `config.on_failure`: abort returns the error, hold
/// carries the holdings through the failed date, skip leaves the state as
/// it was. Non-monotonic dates always abort.
pub fn run_rebalancing(
    table: &HistoryTable,
    dates: &[NaiveDate],
    config: &ValidatedConfig,
    cache: Option<&RebalanceCache>,
    optimizer: &dyn PortfolioOptimizer,
) -> Result<RunReport, RunError> {
    let mut orchestrator = Orchestrator::new(table, config, cache, optimizer)?;
    let mut failures = Vec::new();

    for &date in dates {
        let err = match orchestrator.step(date) {
            Ok(_) => continue,
            Err(err @ RunError::NonMonotonicDate { .. }) => return Err(err),
            Err(err) => err,
        };
        match config.on_failure {
            FailurePolicy::Abort => return Err(err),
            FailurePolicy::Hold => {
                warn!("{err}; holding");
                orchestrator.hold(date)?;
            }
            FailurePolicy::Skip => warn!("{err}; skipping"),
        }
        failures.push(StepFailure {
            date,
            error: err.to_string(),
            action: config.on_failure,
        });
    }

    let mut report = orchestrator.into_report();
    report.failures = failures;
    Ok(report)
}
