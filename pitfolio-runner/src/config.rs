//! Serializable rebalance configuration.
//!
//! A `RebalanceConfig` is read from TOML and validated once into a
//! `ValidatedConfig`. Everything downstream consumes the validated form, so
//! invalid method or parameter combinations never reach the pipeline.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pitfolio_core::eligibility::{EligibilityCriteria, ExecutionMode};
use pitfolio_core::membership::{MembershipError, MembershipPolicy};
use pitfolio_core::preselection::{PreselectionError, PreselectionParams};

use crate::schedule::RebalanceSchedule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cardinality method '{0}' is not supported; only 'preselection' is implemented")]
    UnsupportedMethod(CardinalityMethod),

    #[error("[membership] requires a [preselection] section")]
    PolicyWithoutPreselection,

    #[error("invalid preselection: {0}")]
    Preselection(#[from] PreselectionError),

    #[error("invalid membership policy: {0}")]
    Membership(#[from] MembershipError),

    #[error("min_coverage must be in [0, 1], got {0}")]
    InvalidCoverage(f64),

    #[error("max_weight must be in (0, 1], got {0}")]
    InvalidMaxWeight(f64),

    #[error("optimizer window must be at least 2 rows")]
    InvalidWindow,

    #[error("cache memory_capacity must be at least 1")]
    ZeroMemoryCapacity,

    #[error("schedule start {start} is after end {end}")]
    InvertedSchedule {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn is_unsupported_method(&self) -> bool {
        matches!(self, ConfigError::UnsupportedMethod(_))
    }
}

// ─── Sections ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibilitySection {
    pub min_history_days: u32,
    pub min_price_rows: u32,
    /// Optional secondary coverage floor, applied after the history checks.
    #[serde(default)]
    pub min_coverage: Option<f64>,
    /// Backtest-only delisting detection window in calendar days.
    #[serde(default)]
    pub delisting_lookforward_days: Option<u32>,
}

impl EligibilitySection {
    pub fn criteria(&self) -> EligibilityCriteria {
        EligibilityCriteria {
            min_history_days: self.min_history_days,
            min_price_rows: self.min_price_rows,
        }
    }
}

/// How the asset-count constraint is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardinalityMethod {
    /// Two-stage: rank and shortlist, then optimize over the shortlist.
    #[default]
    Preselection,
    Miqp,
    Heuristic,
    Relaxation,
}

impl std::fmt::Display for CardinalityMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CardinalityMethod::Preselection => "preselection",
            CardinalityMethod::Miqp => "miqp",
            CardinalityMethod::Heuristic => "heuristic",
            CardinalityMethod::Relaxation => "relaxation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CardinalitySection {
    #[serde(default)]
    pub method: CardinalityMethod,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PreselectionSection {
    #[serde(flatten)]
    pub params: PreselectionParams,
    /// Cap on the final asset set, enforced by the membership stage.
    #[serde(default)]
    pub max_assets: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    EqualWeight,
    InverseVolatility,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimizerSection {
    #[serde(default)]
    pub kind: OptimizerKind,
    #[serde(default)]
    pub max_weight: Option<f64>,
    /// Return rows handed to the optimizer. Defaults to the preselection
    /// lookback, or 63 rows without preselection.
    #[serde(default)]
    pub window: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default)]
    pub enabled: bool,
    /// On-disk tier; memory-only when absent.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_cache_age_days: Option<u32>,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Also memoize whole per-date rebalance steps.
    #[serde(default)]
    pub cache_rebalance: bool,
}

fn default_memory_capacity() -> usize {
    512
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_dir: None,
            max_cache_age_days: None,
            memory_capacity: default_memory_capacity(),
            cache_rebalance: false,
        }
    }
}

/// What `run_rebalancing` does when a date fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Abort,
    /// Keep the previous holdings and advance their counters.
    Hold,
    /// Record the failure and leave the state as it was.
    Skip,
}

// ─── Root ───────────────────────────────────────────────────────────

/// Root configuration as written in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebalanceConfig {
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    pub eligibility: EligibilitySection,
    #[serde(default)]
    pub cardinality: CardinalitySection,
    #[serde(default)]
    pub preselection: Option<PreselectionSection>,
    #[serde(default)]
    pub membership: Option<MembershipPolicy>,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub schedule: RebalanceSchedule,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Backtest
}

/// Configuration that passed [`RebalanceConfig::validate`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidatedConfig {
    pub mode: ExecutionMode,
    pub on_failure: FailurePolicy,
    pub criteria: EligibilityCriteria,
    pub min_coverage: Option<f64>,
    pub delisting_lookforward_days: Option<u32>,
    pub preselection: Option<PreselectionParams>,
    /// Policy with `max_assets` folded in from the preselection section.
    pub policy: Option<MembershipPolicy>,
    pub optimizer: OptimizerSection,
    pub window: usize,
    pub cache: CacheSection,
    pub schedule: RebalanceSchedule,
}

const DEFAULT_WINDOW: usize = 63;

impl RebalanceConfig {
    pub fn from_toml_str(content: &str) -> Result<ValidatedConfig, ConfigError> {
        let raw: RebalanceConfig = toml::from_str(content)?;
        raw.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<ValidatedConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        if self.cardinality.method != CardinalityMethod::Preselection {
            return Err(ConfigError::UnsupportedMethod(self.cardinality.method));
        }

        if let Some(c) = self.eligibility.min_coverage {
            if !(0.0..=1.0).contains(&c) {
                return Err(ConfigError::InvalidCoverage(c));
            }
        }

        let preselection = match &self.preselection {
            Some(section) => {
                section.params.validate()?;
                Some(*section)
            }
            None => None,
        };

        let policy = match (&self.membership, &preselection) {
            (Some(_), None) => return Err(ConfigError::PolicyWithoutPreselection),
            (Some(policy), Some(section)) => {
                let mut policy = policy.clone();
                if section.max_assets.is_some() {
                    policy.max_assets = section.max_assets;
                }
                policy.validate(section.params.top_k)?;
                Some(policy)
            }
            // Without retention a shortlist never exceeds top_k, so a lone
            // cap only needs validating.
            (None, Some(section)) => match section.max_assets {
                Some(max_assets) => {
                    let policy = MembershipPolicy {
                        max_assets: Some(max_assets),
                        ..MembershipPolicy::default()
                    };
                    policy.validate(section.params.top_k)?;
                    None
                }
                None => None,
            },
            (None, None) => None,
        };

        if let Some(w) = self.optimizer.max_weight {
            if !(w > 0.0 && w <= 1.0) {
                return Err(ConfigError::InvalidMaxWeight(w));
            }
        }
        let window = self
            .optimizer
            .window
            .or(preselection.map(|s| s.params.lookback))
            .unwrap_or(DEFAULT_WINDOW);
        if window < 2 {
            return Err(ConfigError::InvalidWindow);
        }

        if self.cache.memory_capacity == 0 {
            return Err(ConfigError::ZeroMemoryCapacity);
        }

        if let (Some(start), Some(end)) = (self.schedule.start, self.schedule.end) {
            if start > end {
                return Err(ConfigError::InvertedSchedule { start, end });
            }
        }

        Ok(ValidatedConfig {
            mode: self.mode,
            on_failure: self.on_failure,
            criteria: self.eligibility.criteria(),
            min_coverage: self.eligibility.min_coverage,
            delisting_lookforward_days: self.eligibility.delisting_lookforward_days,
            preselection: preselection.map(|s| s.params),
            policy,
            optimizer: self.optimizer,
            window,
            cache: self.cache.clone(),
            schedule: self.schedule,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitfolio_core::preselection::FactorMethod;

    const FULL: &str = r#"
mode = "backtest"
on_failure = "hold"

[eligibility]
min_history_days = 252
min_price_rows = 200
min_coverage = 0.5
delisting_lookforward_days = 30

[cardinality]
method = "preselection"

[preselection]
method = "combined"
momentum_weight = 0.5
low_vol_weight = 0.5
top_k = 20
lookback = 252
skip = 21
min_periods = 200
max_assets = 25

[membership]
buffer_rank = 30
min_holding_periods = 2
max_new_assets = 5
max_removed_assets = 5
max_turnover = 0.4

[membership.group_limits.asset_groups]
AAPL = "tech"
MSFT = "tech"

[membership.group_limits.max_per_group]
tech = 1

[optimizer]
kind = "inverse_volatility"
max_weight = 0.2

[cache]
enabled = true
cache_dir = ".pitfolio-cache"
max_cache_age_days = 30
memory_capacity = 64
cache_rebalance = true

[schedule]
frequency = "quarterly"
start = "2020-01-01"
"#;

    #[test]
    fn full_config_parses_and_validates() {
        let cfg = RebalanceConfig::from_toml_str(FULL).unwrap();
        assert_eq!(cfg.mode, ExecutionMode::Backtest);
        assert_eq!(cfg.on_failure, FailurePolicy::Hold);
        assert_eq!(cfg.criteria.min_history_days, 252);
        assert_eq!(cfg.delisting_lookforward_days, Some(30));

        let pre = cfg.preselection.unwrap();
        assert_eq!(pre.top_k, 20);
        assert_eq!(pre.skip, 21);
        assert_eq!(
            pre.method,
            FactorMethod::Combined {
                momentum_weight: 0.5,
                low_vol_weight: 0.5
            }
        );

        let policy = cfg.policy.unwrap();
        assert_eq!(policy.buffer_rank, Some(30));
        assert_eq!(policy.max_assets, Some(25));
        assert_eq!(policy.group_limits.group_of("MSFT"), Some("tech"));

        assert_eq!(cfg.optimizer.kind, OptimizerKind::InverseVolatility);
        assert_eq!(cfg.window, 252);
        assert!(cfg.cache.enabled && cfg.cache.cache_rebalance);
        assert_eq!(cfg.cache.memory_capacity, 64);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = RebalanceConfig::from_toml_str(
            "[eligibility]\nmin_history_days = 10\nmin_price_rows = 10\n",
        )
        .unwrap();
        assert_eq!(cfg.mode, ExecutionMode::Backtest);
        assert_eq!(cfg.on_failure, FailurePolicy::Abort);
        assert!(cfg.preselection.is_none());
        assert!(cfg.policy.is_none());
        assert_eq!(cfg.window, 63);
        assert!(!cfg.cache.enabled);
    }

    #[test]
    fn unsupported_cardinality_methods_are_distinct() {
        for method in ["miqp", "heuristic", "relaxation"] {
            let toml = format!(
                "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n[cardinality]\nmethod = \"{method}\"\n"
            );
            let err = RebalanceConfig::from_toml_str(&toml).unwrap_err();
            assert!(err.is_unsupported_method(), "{method}: {err}");
        }
    }

    #[test]
    fn unknown_method_name_is_a_parse_error() {
        let err = RebalanceConfig::from_toml_str(
            "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n[cardinality]\nmethod = \"genetic\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(!err.is_unsupported_method());
    }

    #[test]
    fn policy_without_preselection_is_rejected() {
        let err = RebalanceConfig::from_toml_str(
            "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n[membership]\nmin_holding_periods = 2\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PolicyWithoutPreselection));
    }

    fn with_preselection(extra: &str) -> Result<ValidatedConfig, ConfigError> {
        RebalanceConfig::from_toml_str(&format!(
            "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n\
             [preselection]\nmethod = \"momentum\"\ntop_k = 5\nlookback = 20\nmin_periods = 10\n{extra}"
        ))
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        assert!(matches!(
            with_preselection("max_assets = 3\n").unwrap_err(),
            ConfigError::Membership(MembershipError::MaxAssetsBelowTopK { .. })
        ));
        assert!(matches!(
            with_preselection("[membership]\nbuffer_rank = 4\n").unwrap_err(),
            ConfigError::Membership(MembershipError::BufferBelowTopK { .. })
        ));
        assert!(matches!(
            with_preselection("[membership]\nmax_turnover = 1.5\n").unwrap_err(),
            ConfigError::Membership(MembershipError::InvalidTurnoverCap(_))
        ));
        assert!(matches!(
            with_preselection("[optimizer]\nmax_weight = 0.0\n").unwrap_err(),
            ConfigError::InvalidMaxWeight(_)
        ));
        assert!(matches!(
            with_preselection("[cache]\nmemory_capacity = 0\n").unwrap_err(),
            ConfigError::ZeroMemoryCapacity
        ));
    }

    #[test]
    fn zero_top_k_and_bad_weights_are_rejected() {
        let zero = RebalanceConfig::from_toml_str(
            "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n\
             [preselection]\nmethod = \"momentum\"\ntop_k = 0\nlookback = 20\nmin_periods = 10\n",
        )
        .unwrap_err();
        assert!(matches!(zero, ConfigError::Preselection(PreselectionError::ZeroTopK)));

        let weights = RebalanceConfig::from_toml_str(
            "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n\
             [preselection]\nmethod = \"combined\"\nmomentum_weight = -1.0\nlow_vol_weight = 0.5\n\
             top_k = 3\nlookback = 20\nmin_periods = 10\n",
        )
        .unwrap_err();
        assert!(matches!(
            weights,
            ConfigError::Preselection(PreselectionError::InvalidWeights { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RebalanceConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
