//! Pitfolio Core — point-in-time universe selection for periodic rebalancing.
//!
//! This crate contains the pure, data-in/data-out stages of a rebalance:
//! - Domain types (history tables, prefix hashes, portfolio state, ids)
//! - Eligibility evaluation with look-ahead-free history checks
//! - Factor preselection (momentum, low volatility, combined z-score)
//! - Membership policy engine (buffers, holding periods, churn caps, group limits)
//! - Canonical fingerprints for deterministic caching
//! - Seeded synthetic universes for tests and demos

pub mod domain;
pub mod eligibility;
pub mod fingerprint;
pub mod membership;
pub mod preselection;
pub mod rng;
pub mod synthetic;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: every stage output can cross threads, so the
    /// runner can evaluate dates in parallel and share cached payloads.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::HistoryTable>();
        require_sync::<domain::HistoryTable>();
        require_send::<domain::PrefixHashes>();
        require_sync::<domain::PrefixHashes>();
        require_send::<domain::PortfolioState>();
        require_sync::<domain::PortfolioState>();
        require_send::<domain::Fingerprint>();
        require_sync::<domain::Fingerprint>();

        require_send::<eligibility::EligibilityResult>();
        require_sync::<eligibility::EligibilityResult>();
        require_send::<eligibility::LookaheadPermit>();
        require_sync::<eligibility::LookaheadPermit>();

        require_send::<preselection::Preselection>();
        require_sync::<preselection::Preselection>();
        require_send::<preselection::PreselectionParams>();
        require_sync::<preselection::PreselectionParams>();

        require_send::<membership::MembershipPolicy>();
        require_sync::<membership::MembershipPolicy>();
        require_send::<membership::MembershipDecision>();
        require_sync::<membership::MembershipDecision>();

        require_send::<fingerprint::FingerprintBuilder>();
        require_sync::<fingerprint::FingerprintBuilder>();
        require_send::<rng::SeedHierarchy>();
        require_sync::<rng::SeedHierarchy>();
    }

    /// Architecture contract: preselection cannot be handed a look-ahead
    /// permit. It sees the table, the eligibility result and a date, and
    /// slices rows itself with `rows_through`.
    #[test]
    fn preselection_takes_no_lookahead_permit() {
        fn _check_signature(
            table: &domain::HistoryTable,
            eligibility: &eligibility::EligibilityResult,
            date: chrono::NaiveDate,
            params: &preselection::PreselectionParams,
        ) -> Result<preselection::Preselection, preselection::PreselectionError> {
            preselection::select(table, eligibility, date, params)
        }
    }
}
