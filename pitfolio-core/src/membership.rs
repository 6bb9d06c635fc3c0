//! Membership policy — turnover and stability rules between rebalances.
//!
//! Takes the ranking produced by preselection and the previous portfolio,
//! and decides the asset set handed to the optimizer. Every cap is hard:
//! when the rules cannot all be met the decision fails instead of bending
//! one of them.
//!
//! Order of application:
//! 1. classify current holdings (top-K, buffer rank, minimum holding, exit)
//! 2. enforce the removal cap (worst-ranked candidates leave first)
//! 3. admit shortlist newcomers within the add budget, size cap and group limits
//! 4. trim the margin until the estimated turnover fits under the cap

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AssetId, PortfolioState};
use crate::preselection::Preselection;

/// Slack when comparing turnover against its cap.
const TURNOVER_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MembershipError {
    #[error("buffer_rank ({buffer_rank}) must be >= top_k ({top_k})")]
    BufferBelowTopK { buffer_rank: usize, top_k: usize },

    #[error("max_assets ({max_assets}) must be >= top_k ({top_k})")]
    MaxAssetsBelowTopK { max_assets: usize, top_k: usize },

    #[error("max_turnover must be in (0, 1], got {0}")]
    InvalidTurnoverCap(f64),

    #[error("{mandatory} holdings lost eligibility but max_removed_assets is {max_removed}")]
    MandatoryExitsExceedCap { mandatory: usize, max_removed: usize },

    #[error("{locked} holdings are locked by min_holding_periods but max_assets is {max_assets}")]
    LockedExceedMaxAssets { locked: usize, max_assets: usize },

    #[error("turnover {turnover:.4} cannot be brought under max_turnover {max_turnover:.4}")]
    TurnoverUnreachable { turnover: f64, max_turnover: f64 },

    #[error("group '{group}' holds {count} assets, limit is {limit}")]
    GroupLimitExceeded {
        group: String,
        count: usize,
        limit: usize,
    },
}

impl MembershipError {
    /// True when the policy is valid but cannot be satisfied for this rebalance.
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            MembershipError::MandatoryExitsExceedCap { .. }
                | MembershipError::LockedExceedMaxAssets { .. }
                | MembershipError::TurnoverUnreachable { .. }
                | MembershipError::GroupLimitExceeded { .. }
        )
    }
}

/// Per-group caps on the number of assets held.
///
/// Limits are hard: newcomers that would breach a limit are not admitted,
/// and retained holdings that breach one fail the decision. A penalized
/// variant would replace [`GroupLimits::check`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupLimits {
    #[serde(default)]
    pub asset_groups: BTreeMap<AssetId, String>,
    #[serde(default)]
    pub max_per_group: BTreeMap<String, usize>,
}

impl GroupLimits {
    pub fn is_empty(&self) -> bool {
        self.max_per_group.is_empty()
    }

    pub fn group_of(&self, asset: &str) -> Option<&str> {
        self.asset_groups.get(asset).map(|g| g.as_str())
    }

    fn counts<'a>(&self, assets: impl IntoIterator<Item = &'a AssetId>) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for asset in assets {
            if let Some(group) = self.group_of(asset) {
                *counts.entry(group.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn admits(&self, counts: &BTreeMap<String, usize>, asset: &str) -> bool {
        let Some(group) = self.group_of(asset) else {
            return true;
        };
        match self.max_per_group.get(group) {
            Some(&limit) => counts.get(group).copied().unwrap_or(0) < limit,
            None => true,
        }
    }

    pub fn check<'a>(&self, assets: impl IntoIterator<Item = &'a AssetId>) -> Result<(), MembershipError> {
        for (group, count) in self.counts(assets) {
            if let Some(&limit) = self.max_per_group.get(&group) {
                if count > limit {
                    return Err(MembershipError::GroupLimitExceeded { group, count, limit });
                }
            }
        }
        Ok(())
    }
}

/// Turnover and stability rules. `None` disables a cap.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MembershipPolicy {
    /// Held assets ranked at or above this survive even outside top-K.
    #[serde(default)]
    pub buffer_rank: Option<usize>,
    /// Held assets younger than this many rebalances are kept regardless of rank.
    #[serde(default)]
    pub min_holding_periods: u32,
    #[serde(default)]
    pub max_new_assets: Option<usize>,
    #[serde(default)]
    pub max_removed_assets: Option<usize>,
    /// Cap on estimated one-way turnover, in (0, 1].
    #[serde(default)]
    pub max_turnover: Option<f64>,
    /// Cap on the size of the final asset set.
    #[serde(default)]
    pub max_assets: Option<usize>,
    #[serde(default)]
    pub group_limits: GroupLimits,
}

impl MembershipPolicy {
    pub fn validate(&self, top_k: usize) -> Result<(), MembershipError> {
        if let Some(buffer_rank) = self.buffer_rank {
            if buffer_rank < top_k {
                return Err(MembershipError::BufferBelowTopK { buffer_rank, top_k });
            }
        }
        if let Some(max_assets) = self.max_assets {
            if max_assets < top_k {
                return Err(MembershipError::MaxAssetsBelowTopK { max_assets, top_k });
            }
        }
        if let Some(t) = self.max_turnover {
            if !(t > 0.0 && t <= 1.0) {
                return Err(MembershipError::InvalidTurnoverCap(t));
            }
        }
        Ok(())
    }
}

/// Where an asset stands after a rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MembershipState {
    Absent,
    /// In the final set; counter includes this rebalance.
    Held { holding_periods: u32 },
    /// Held, ranked outside top-K but inside the buffer rank.
    Buffered,
    /// Due to leave, but kept this rebalance because a removal or turnover
    /// cap deferred the exit.
    Exiting,
}

/// Why a previously held asset stayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionReason {
    TopK,
    BufferRank,
    MinHolding,
    RemovalCap,
    TurnoverCap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipDecision {
    pub check_date: NaiveDate,
    /// Final asset set, best rank first.
    pub assets: Vec<AssetId>,
    /// Newcomers, best rank first.
    pub added: Vec<AssetId>,
    /// Leavers: lost-eligibility exits by id, then the rest worst rank first.
    pub removed: Vec<AssetId>,
    pub retained: BTreeMap<AssetId, RetentionReason>,
    pub states: BTreeMap<AssetId, MembershipState>,
    pub estimated_turnover: f64,
    /// First construction; add budget and turnover cap do not apply.
    pub initial: bool,
}

impl MembershipDecision {
    pub fn contains(&self, asset: &str) -> bool {
        self.assets.iter().any(|a| a == asset)
    }

    pub fn asset_set(&self) -> BTreeSet<AssetId> {
        self.assets.iter().cloned().collect()
    }
}

/// Asset-count turnover proxy used before weights are known.
///
/// Equals the exact one-way turnover when equal-weighted portfolios swap
/// assets: `max(|added|, |removed|) / max(|previous|, |new|)`.
pub fn estimated_turnover(previous: usize, added: usize, removed: usize, new: usize) -> f64 {
    if previous == 0 {
        return if new == 0 { 0.0 } else { 1.0 };
    }
    let denom = previous.max(new).max(1) as f64;
    added.max(removed) as f64 / denom
}

/// Apply `policy` to `preselection` given the `previous` holdings.
pub fn apply(
    policy: &MembershipPolicy,
    preselection: &Preselection,
    previous: &PortfolioState,
) -> Result<MembershipDecision, MembershipError> {
    let top_k = preselection.top_k;
    policy.validate(top_k)?;

    let ranks = preselection.ranks();
    let buffer_rank = policy.buffer_rank.unwrap_or(top_k);
    let initial = previous.is_empty();

    // 1. Classify holdings.
    let mut retained: BTreeMap<AssetId, RetentionReason> = BTreeMap::new();
    let mut mandatory: Vec<AssetId> = Vec::new();
    let mut optional: Vec<(AssetId, usize)> = Vec::new();
    let mut buffered: Vec<(AssetId, usize)> = Vec::new();

    for asset in previous.assets() {
        match ranks.get(asset) {
            None => mandatory.push(asset.clone()),
            Some(&r) if r <= top_k => {
                retained.insert(asset.clone(), RetentionReason::TopK);
            }
            Some(&r) if r <= buffer_rank => {
                retained.insert(asset.clone(), RetentionReason::BufferRank);
                buffered.push((asset.clone(), r));
            }
            Some(_) if previous.holding_periods(asset) < policy.min_holding_periods => {
                retained.insert(asset.clone(), RetentionReason::MinHolding);
            }
            Some(&r) => optional.push((asset.clone(), r)),
        }
    }

    // Buffer retention yields to the size cap, worst rank first.
    if let Some(max_assets) = policy.max_assets {
        buffered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (asset, r) in buffered {
            if retained.len() <= max_assets {
                break;
            }
            retained.remove(&asset);
            optional.push((asset, r));
        }
        if retained.len() > max_assets {
            return Err(MembershipError::LockedExceedMaxAssets {
                locked: retained.len(),
                max_assets,
            });
        }
    }

    // 2. Removal cap.
    // Worst rank first; ties leave in ascending id order.
    optional.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let removal_budget = policy.max_removed_assets.unwrap_or(usize::MAX);
    if mandatory.len() > removal_budget {
        return Err(MembershipError::MandatoryExitsExceedCap {
            mandatory: mandatory.len(),
            max_removed: removal_budget,
        });
    }
    let optional_budget = removal_budget - mandatory.len();
    let mut removed_optional: Vec<(AssetId, usize)> = Vec::new();
    for (asset, r) in optional {
        if removed_optional.len() < optional_budget {
            removed_optional.push((asset, r));
        } else {
            retained.insert(asset, RetentionReason::RemovalCap);
        }
    }
    if let Some(max_assets) = policy.max_assets {
        if retained.len() > max_assets {
            return Err(MembershipError::LockedExceedMaxAssets {
                locked: retained.len(),
                max_assets,
            });
        }
    }

    // 3. Additions.
    policy.group_limits.check(retained.keys())?;
    let add_budget = if initial {
        usize::MAX
    } else {
        policy.max_new_assets.unwrap_or(usize::MAX)
    };
    let size_cap = policy.max_assets.unwrap_or(usize::MAX);
    let mut group_counts = policy.group_limits.counts(retained.keys());
    let mut added: Vec<(AssetId, usize)> = Vec::new();

    for entry in &preselection.shortlist.entries {
        if previous.holds(&entry.asset) {
            continue;
        }
        if added.len() >= add_budget || retained.len() + added.len() >= size_cap {
            break;
        }
        if !policy.group_limits.admits(&group_counts, &entry.asset) {
            continue;
        }
        if let Some(group) = policy.group_limits.group_of(&entry.asset) {
            *group_counts.entry(group.to_string()).or_insert(0) += 1;
        }
        added.push((entry.asset.clone(), entry.rank));
    }

    // 4. Turnover cap.
    let turnover_of = |retained: &BTreeMap<AssetId, RetentionReason>,
                       added: &[(AssetId, usize)],
                       removed: usize| {
        estimated_turnover(previous.len(), added.len(), removed, retained.len() + added.len())
    };

    if let (false, Some(max_turnover)) = (initial, policy.max_turnover) {
        loop {
            let removed_count = mandatory.len() + removed_optional.len();
            let turnover = turnover_of(&retained, &added, removed_count);
            if turnover <= max_turnover + TURNOVER_EPSILON {
                break;
            }
            let can_restore = !removed_optional.is_empty() && retained.len() + added.len() < size_cap;
            if removed_count >= added.len() && can_restore {
                restore_best(&mut removed_optional, &mut retained);
            } else if !added.is_empty() {
                added.pop();
            } else if can_restore {
                restore_best(&mut removed_optional, &mut retained);
            } else {
                return Err(MembershipError::TurnoverUnreachable {
                    turnover,
                    max_turnover,
                });
            }
        }
    }

    // 5. Assemble.
    let mut assets: Vec<(AssetId, usize)> = retained
        .keys()
        .map(|a| (a.clone(), ranks.get(a).copied().unwrap_or(usize::MAX)))
        .chain(added.iter().cloned())
        .collect();
    assets.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let assets: Vec<AssetId> = assets.into_iter().map(|(a, _)| a).collect();

    policy.group_limits.check(assets.iter())?;

    mandatory.sort();
    let removed: Vec<AssetId> = mandatory
        .into_iter()
        .chain(removed_optional.into_iter().map(|(a, _)| a))
        .collect();
    let added: Vec<AssetId> = added.into_iter().map(|(a, _)| a).collect();

    let mut states: BTreeMap<AssetId, MembershipState> = preselection
        .ranking
        .iter()
        .map(|r| (r.asset.clone(), MembershipState::Absent))
        .collect();
    for asset in previous.assets() {
        states.insert(asset.clone(), MembershipState::Absent);
    }
    for (asset, reason) in &retained {
        let state = match reason {
            RetentionReason::BufferRank => MembershipState::Buffered,
            RetentionReason::RemovalCap | RetentionReason::TurnoverCap => MembershipState::Exiting,
            RetentionReason::TopK | RetentionReason::MinHolding => MembershipState::Held {
                holding_periods: previous.holding_periods(asset) + 1,
            },
        };
        states.insert(asset.clone(), state);
    }
    for asset in &added {
        states.insert(asset.clone(), MembershipState::Held { holding_periods: 1 });
    }

    let estimated_turnover = estimated_turnover(previous.len(), added.len(), removed.len(), assets.len());

    debug!(
        "membership {}: {} assets (+{} -{}), est. turnover {:.4}",
        preselection.check_date,
        assets.len(),
        added.len(),
        removed.len(),
        estimated_turnover
    );

    Ok(MembershipDecision {
        check_date: preselection.check_date,
        assets,
        added,
        removed,
        retained,
        states,
        estimated_turnover,
        initial,
    })
}

/// Move the best-ranked optional removal back into the retained set.
fn restore_best(
    removed_optional: &mut Vec<(AssetId, usize)>,
    retained: &mut BTreeMap<AssetId, RetentionReason>,
) {
    // `removed_optional` is worst rank first, so the margin is at the end.
    if let Some((asset, _)) = removed_optional.pop() {
        retained.insert(asset, RetentionReason::TurnoverCap);
    }
}

/// Decision used when no membership policy is configured: the shortlist,
/// as is.
pub fn shortlist_only(preselection: &Preselection, previous: &PortfolioState) -> MembershipDecision {
    let assets = preselection.shortlist.assets().cloned().collect();
    unconstrained(preselection.check_date, assets, previous)
}

/// Take `assets` as the new set with no policy applied. `assets` keeps its
/// order.
pub fn unconstrained(check_date: NaiveDate, assets: Vec<AssetId>, previous: &PortfolioState) -> MembershipDecision {
    let keep: BTreeSet<&AssetId> = assets.iter().collect();
    let added: Vec<AssetId> = assets.iter().filter(|a| !previous.holds(a)).cloned().collect();
    let removed: Vec<AssetId> = previous.assets().filter(|a| !keep.contains(a)).cloned().collect();
    let retained = assets
        .iter()
        .filter(|a| previous.holds(a))
        .map(|a| (a.clone(), RetentionReason::TopK))
        .collect();
    let mut states: BTreeMap<AssetId, MembershipState> = previous
        .assets()
        .map(|a| (a.clone(), MembershipState::Absent))
        .collect();
    for asset in &assets {
        states.insert(
            asset.clone(),
            MembershipState::Held {
                holding_periods: previous.holding_periods(asset) + 1,
            },
        );
    }
    let estimated_turnover = estimated_turnover(previous.len(), added.len(), removed.len(), assets.len());

    MembershipDecision {
        check_date,
        assets,
        added,
        removed,
        retained,
        states,
        estimated_turnover,
        initial: previous.is_empty(),
    }
}
