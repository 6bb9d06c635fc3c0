//! BDD scenarios for the rebalance orchestrator.
//!
//! Tables are built from hand-written return columns so every score and
//! every eligibility count is known in advance.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate};
use pitfolio_core::domain::{HistoryTable, SeriesKind};
use pitfolio_core::membership::MembershipError;
use pitfolio_core::synthetic::SyntheticUniverse;
use pitfolio_runner::optimizer::{EqualWeight, InverseVolatility};
use pitfolio_runner::{
    run_rebalancing, FailurePolicy, Orchestrator, RebalanceCache, RebalanceConfig, RunError, RunReport,
    ValidatedConfig,
};

fn day(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
}

/// Daily returns table; `f(asset_index, day)` gives the cell.
fn returns_table(assets: &[&str], days: i64, f: impl Fn(usize, i64) -> f64) -> HistoryTable {
    let dates = (0..days).map(day).collect();
    let columns: BTreeMap<String, Vec<f64>> = assets
        .iter()
        .enumerate()
        .map(|(k, a)| (a.to_string(), (0..days).map(|i| f(k, i)).collect()))
        .collect();
    HistoryTable::new(SeriesKind::Returns, dates, columns).unwrap()
}

fn config(toml: &str) -> ValidatedConfig {
    RebalanceConfig::from_toml_str(toml).unwrap()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn bdd_scenario_history_thresholds_decide_eligibility() {
    // GIVEN five assets where A has exactly 10 rows spanning 10 days at D,
    // and B has a gap leaving 9 rows
    let table = returns_table(&["A", "B", "C", "D", "E"], 20, |k, i| match k {
        0 if i >= 10 => f64::NAN,
        1 if i == 5 || i >= 10 => f64::NAN,
        _ => 0.001,
    });
    let cfg = config("[eligibility]\nmin_history_days = 10\nmin_price_rows = 10\n");

    // WHEN the orchestrator rebalances at D
    let mut orch = Orchestrator::new(&table, &cfg, None, &EqualWeight).unwrap();
    let event = orch.step(day(10)).unwrap().clone();

    // THEN A is eligible and B is not
    assert_eq!(event.eligible_count, 4);
    assert_eq!(event.shortlist, vec!["A", "C", "D", "E"]);
    assert!(!event.state.holds("B"));

    // AND without preselection every eligible asset is held equally
    for asset in ["A", "C", "D", "E"] {
        assert!((event.state.weight(asset) - 0.25).abs() < 1e-12);
    }
}

#[test]
fn bdd_scenario_tied_scores_break_by_asset_id() {
    // GIVEN A and B with identical histories and C strictly worse
    let table = returns_table(&["C", "B", "A"], 15, |k, _| if k == 0 { 0.003 } else { 0.005 });
    let cfg = config(
        "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n\
         [preselection]\nmethod = \"momentum\"\ntop_k = 2\nlookback = 10\nmin_periods = 5\n",
    );

    // WHEN we rebalance
    let mut orch = Orchestrator::new(&table, &cfg, None, &EqualWeight).unwrap();
    let event = orch.step(day(14)).unwrap();

    // THEN the shortlist is [A, B] and C is excluded
    assert_eq!(event.shortlist, vec!["A", "B"]);
    assert_eq!(event.state.assets().cloned().collect::<Vec<_>>(), vec!["A", "B"]);
}

#[test]
fn bdd_scenario_buffer_and_new_asset_cap() {
    // GIVEN ranks A>B>C>D>E for the first half and A>D>E>B>C afterwards
    let phase1 = [0.05, 0.04, 0.03, 0.01, 0.00];
    let phase2 = [0.05, 0.02, 0.01, 0.04, 0.03];
    let table = returns_table(&["A", "B", "C", "D", "E"], 30, |k, i| {
        if i < 15 {
            phase1[k]
        } else {
            phase2[k]
        }
    });
    let cfg = config(
        "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n\
         [preselection]\nmethod = \"momentum\"\ntop_k = 3\nlookback = 5\nmin_periods = 5\n\
         [membership]\nbuffer_rank = 4\nmax_new_assets = 1\n",
    );
    let mut orch = Orchestrator::new(&table, &cfg, None, &EqualWeight).unwrap();

    // WHEN the first rebalance builds {A, B, C}
    let first = orch.step(day(14)).unwrap();
    assert!(first.decision.initial);
    assert_eq!(first.decision.asset_set(), set(&["A", "B", "C"]));

    // AND the second sees shortlist {A, D, E}
    let second = orch.step(day(29)).unwrap();
    assert_eq!(second.shortlist, vec!["A", "D", "E"]);

    // THEN B survives on the buffer, only D enters, and C leaves
    assert_eq!(second.decision.asset_set(), set(&["A", "B", "D"]));
    assert_eq!(second.decision.added, vec!["D"]);
    assert_eq!(second.decision.removed, vec!["C"]);
    assert_eq!(orch.state().holding_periods("A"), 2);
    assert_eq!(orch.state().holding_periods("D"), 1);
}

#[test]
fn bdd_scenario_infeasible_policy_keeps_prior_state() {
    // GIVEN two holdings that stop trading, so they drop out of the ranking
    let table = returns_table(&["A", "B", "C", "D"], 30, |k, i| {
        let early = [0.04, 0.03, 0.0, 0.0];
        let late = [f64::NAN, f64::NAN, 0.04, 0.03];
        if i < 15 {
            early[k]
        } else {
            late[k]
        }
    });
    // AND a policy that allows only one removal per rebalance
    let cfg = config(
        "[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n\
         [preselection]\nmethod = \"momentum\"\ntop_k = 2\nlookback = 5\nmin_periods = 5\n\
         [membership]\nmax_removed_assets = 1\n",
    );
    let mut orch = Orchestrator::new(&table, &cfg, None, &EqualWeight).unwrap();
    orch.step(day(14)).unwrap();
    let before = orch.state().clone();
    assert_eq!(before.assets().cloned().collect::<Vec<_>>(), vec!["A", "B"]);

    // WHEN both holdings must exit at once
    let err = orch.step(day(29)).unwrap_err();

    // THEN the rebalance fails loudly and the previous holdings are untouched
    match err {
        RunError::MembershipInfeasible { date, source } => {
            assert_eq!(date, day(29));
            assert!(source.is_infeasible());
            assert!(matches!(
                source,
                MembershipError::MandatoryExitsExceedCap { mandatory: 2, max_removed: 1 }
            ));
        }
        other => panic!("expected MembershipInfeasible, got {other}"),
    }
    assert_eq!(orch.state(), &before);
    assert_eq!(orch.last_date(), Some(day(14)));
}

#[test]
fn bdd_scenario_hold_policy_carries_holdings_through_failures() {
    // GIVEN a schedule whose first date precedes any listing history
    let table = returns_table(&["A", "B"], 20, |_, _| 0.001);
    let cfg = config(
        "on_failure = \"hold\"\n[eligibility]\nmin_history_days = 5\nmin_price_rows = 5\n",
    );
    let dates = [day(2), day(9), day(10)];

    // WHEN the run proceeds
    let report = run_rebalancing(&table, &dates, &cfg, None, &EqualWeight).unwrap();

    // THEN the first date is held (empty), the others rebalance
    assert_eq!(report.held, vec![day(2)]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].action, FailurePolicy::Hold);
    assert_eq!(report.events.len(), 2);
    assert_eq!(report.final_state.holding_periods("A"), 2);
}

// ─── Determinism and caching ────────────────────────────────────────

fn synthetic_universe() -> HistoryTable {
    let mut universe = SyntheticUniverse::new(20, NaiveDate::from_ymd_opt(2021, 1, 4).unwrap(), 400);
    universe.gap_probability = 0.02;
    universe.delisting_probability = 0.1;
    universe.generate(7).unwrap()
}

const PIPELINE: &str = r#"
on_failure = "skip"

[eligibility]
min_history_days = 90
min_price_rows = 60
min_coverage = 0.5

[preselection]
method = "combined"
momentum_weight = 0.6
low_vol_weight = 0.4
top_k = 6
lookback = 60
skip = 5
min_periods = 40

[membership]
buffer_rank = 9
min_holding_periods = 2
max_new_assets = 3
max_removed_assets = 3

[optimizer]
kind = "inverse_volatility"
max_weight = 0.3

[cache]
enabled = true
"#;

fn assert_bit_identical(a: &RunReport, b: &RunReport) {
    let bits = |r: &RunReport| -> Vec<Vec<(String, u64)>> {
        r.events
            .iter()
            .map(|e| e.state.weights.iter().map(|(k, w)| (k.clone(), w.to_bits())).collect())
            .collect()
    };
    assert_eq!(a.events.len(), b.events.len());
    for (x, y) in a.events.iter().zip(&b.events) {
        assert_eq!(x.date, y.date);
        assert_eq!(x.shortlist, y.shortlist);
        assert_eq!(x.decision, y.decision);
        assert_eq!(x.state.holding_periods, y.state.holding_periods);
    }
    assert_eq!(bits(a), bits(b));
    assert_eq!(a.final_state, b.final_state);
}

#[test]
fn bdd_scenario_cached_and_uncached_runs_are_bit_identical() {
    // GIVEN a synthetic universe and a monthly schedule
    let table = synthetic_universe();
    let cfg = config(PIPELINE);
    let dates = cfg.schedule.dates(&table);
    assert!(dates.len() >= 12);

    // WHEN we run without a cache, then twice with a shared cache
    let plain = run_rebalancing(&table, &dates, &cfg, None, &InverseVolatility).unwrap();
    let cache = RebalanceCache::in_memory(4096);
    let cold = run_rebalancing(&table, &dates, &cfg, Some(&cache), &InverseVolatility).unwrap();
    let warm = run_rebalancing(&table, &dates, &cfg, Some(&cache), &InverseVolatility).unwrap();

    // THEN all three produce the same states
    assert!(!plain.events.is_empty());
    assert_bit_identical(&plain, &cold);
    assert_bit_identical(&plain, &warm);

    // AND the warm run took every eligibility and preselection from the cache
    assert!(warm.events.iter().all(|e| e.cached.eligibility && e.cached.preselection));
    assert!(cold.events.iter().all(|e| !e.cached.eligibility));
}

#[test]
fn bdd_scenario_whole_step_replay_is_bit_identical() {
    // GIVEN whole-step caching on a disk-backed cache
    let table = synthetic_universe();
    let cfg = config(&format!("{PIPELINE}cache_rebalance = true\n"));
    let dates = cfg.schedule.dates(&table);
    let dir = tempfile::tempdir().unwrap();
    let options = pitfolio_runner::CacheOptions {
        memory_capacity: 8,
        disk_dir: Some(dir.path().to_path_buf()),
        max_age_days: None,
    };

    // WHEN a second process-like handle replays the run from disk
    let first = RebalanceCache::new(options.clone()).unwrap();
    let cold = run_rebalancing(&table, &dates, &cfg, Some(&first), &InverseVolatility).unwrap();
    let second = RebalanceCache::new(options).unwrap();
    let replay = run_rebalancing(&table, &dates, &cfg, Some(&second), &InverseVolatility).unwrap();

    // THEN every step is a replay and the states match bit for bit
    assert!(replay.events.iter().all(|e| e.cached.rebalance));
    assert_bit_identical(&cold, &replay);
}

#[test]
fn bdd_scenario_future_edits_do_not_invalidate_past_entries() {
    // GIVEN a cache warmed on a table
    let table = returns_table(&["A", "B", "C"], 40, |k, i| 0.001 * (k as f64 + 1.0) + 0.0001 * (i % 3) as f64);
    let cfg = config(
        "[eligibility]\nmin_history_days = 5\nmin_price_rows = 5\n\
         [preselection]\nmethod = \"momentum\"\ntop_k = 2\nlookback = 10\nmin_periods = 5\n\
         [cache]\nenabled = true\n",
    );
    let cache = RebalanceCache::in_memory(64);
    run_rebalancing(&table, &[day(19)], &cfg, Some(&cache), &EqualWeight).unwrap();

    // WHEN a value after the check date changes
    let mut columns = table.columns().clone();
    columns.get_mut("A").unwrap()[30] = 0.5;
    let edited_future = HistoryTable::new(SeriesKind::Returns, table.dates().to_vec(), columns).unwrap();
    let report = run_rebalancing(&edited_future, &[day(19)], &cfg, Some(&cache), &EqualWeight).unwrap();

    // THEN the earlier date is still served from the cache
    assert!(report.events[0].cached.eligibility);

    // WHEN a value before the check date changes
    let mut columns = table.columns().clone();
    columns.get_mut("A").unwrap()[15] = 0.5;
    let edited_past = HistoryTable::new(SeriesKind::Returns, table.dates().to_vec(), columns).unwrap();
    let report = run_rebalancing(&edited_past, &[day(19)], &cfg, Some(&cache), &EqualWeight).unwrap();

    // THEN the entry is recomputed and A now leads
    assert!(!report.events[0].cached.eligibility);
    assert_eq!(report.events[0].shortlist[0], "A");
}

#[test]
fn bdd_scenario_dates_out_of_order_abort_regardless_of_policy() {
    let table = returns_table(&["A"], 10, |_, _| 0.001);
    let cfg = config("on_failure = \"skip\"\n[eligibility]\nmin_history_days = 1\nmin_price_rows = 1\n");
    let err = run_rebalancing(&table, &[day(5), day(3)], &cfg, None, &EqualWeight).unwrap_err();
    assert!(matches!(err, RunError::NonMonotonicDate { .. }));
}
