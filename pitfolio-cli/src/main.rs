//! Pitfolio CLI — rebalancing simulations, synthetic data and cache management.
//!
//! Commands:
//! - `run`: simulate one TOML config over a wide CSV history table
//! - `batch`: simulate several configs over the same table, sharing the cache
//! - `synthetic`: write a seeded synthetic price universe as wide CSV
//! - `cache status` / `cache clear`: inspect or empty a config's cache

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

use pitfolio_core::domain::{HistoryTable, SeriesKind};
use pitfolio_core::synthetic::SyntheticUniverse;
use pitfolio_runner::{
    load_wide_csv, optimizer, run_rebalancing, save_wide_csv, write_report, BatchJob, BatchRunner, CacheOptions,
    RebalanceCache, RebalanceConfig, RunReport, ValidatedConfig,
};

#[derive(Parser)]
#[command(
    name = "pitfolio",
    about = "Pitfolio — point-in-time universe selection and rebalancing simulator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a rebalancing config over a history table.
    Run {
        /// Path to a TOML config file.
        #[arg(long)]
        config: PathBuf,

        /// Wide CSV: a `date` column followed by one column per asset.
        #[arg(long)]
        data: PathBuf,

        /// The CSV holds periodic returns rather than prices.
        #[arg(long, default_value_t = false)]
        returns: bool,

        /// Output directory for report.json, weights.csv and summary.csv.
        #[arg(long, default_value = "results")]
        out: PathBuf,
    },
    /// Simulate several configs over the same history table.
    Batch {
        /// TOML config files; each becomes one job named after its file stem.
        #[arg(long = "config", required = true)]
        configs: Vec<PathBuf>,

        #[arg(long)]
        data: PathBuf,

        #[arg(long, default_value_t = false)]
        returns: bool,

        /// Run jobs one after another instead of on the thread pool.
        #[arg(long, default_value_t = false)]
        sequential: bool,

        #[arg(long, default_value = "results")]
        out: PathBuf,
    },
    /// Write a seeded synthetic price universe as wide CSV.
    Synthetic {
        #[arg(long, default_value_t = 50)]
        assets: usize,

        #[arg(long, default_value_t = 1000)]
        periods: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// First calendar date (YYYY-MM-DD).
        #[arg(long, default_value = "2015-01-01")]
        start: String,

        /// Probability that an asset stops trading partway through.
        #[arg(long, default_value_t = 0.0)]
        delisting_probability: f64,

        /// Per-row probability of a missing observation.
        #[arg(long, default_value_t = 0.0)]
        gap_probability: f64,

        #[arg(long)]
        out: PathBuf,
    },
    /// Cache management for the cache configured in a TOML file.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report the cache directory and entry count.
    Status {
        #[arg(long)]
        config: PathBuf,
    },
    /// Delete every cached entry.
    Clear {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data,
            returns,
            out,
        } => run_cmd(&config, &data, returns, &out),
        Commands::Batch {
            configs,
            data,
            returns,
            sequential,
            out,
        } => batch_cmd(&configs, &data, returns, !sequential, &out),
        Commands::Synthetic {
            assets,
            periods,
            seed,
            start,
            delisting_probability,
            gap_probability,
            out,
        } => {
            let start = NaiveDate::parse_from_str(&start, "%Y-%m-%d")
                .with_context(|| format!("invalid --start '{start}'"))?;
            let mut universe = SyntheticUniverse::new(assets, start, periods);
            universe.delisting_probability = delisting_probability;
            universe.gap_probability = gap_probability;
            synthetic_cmd(&universe, seed, &out)
        }
        Commands::Cache { action } => match action {
            CacheAction::Status { config } => cache_status(&config),
            CacheAction::Clear { config } => cache_clear(&config),
        },
    }
}

fn load_table(data: &Path, returns: bool) -> Result<HistoryTable> {
    let kind = if returns {
        SeriesKind::Returns
    } else {
        SeriesKind::Prices
    };
    let table = load_wide_csv(data, kind).with_context(|| format!("failed to load {}", data.display()))?;
    if table.is_empty() {
        bail!("{} has no rows", data.display());
    }
    Ok(table)
}

fn open_cache(config: &ValidatedConfig) -> Result<Option<RebalanceCache>> {
    if !config.cache.enabled {
        return Ok(None);
    }
    Ok(Some(RebalanceCache::new(CacheOptions::from(&config.cache))?))
}

fn run_cmd(config_path: &Path, data: &Path, returns: bool, out: &Path) -> Result<()> {
    let config = RebalanceConfig::load(config_path)?;
    let table = load_table(data, returns)?;
    let cache = open_cache(&config)?;
    let optimizer = optimizer::from_config(&config.optimizer);

    let dates = config.schedule.dates(&table);
    if dates.is_empty() {
        bail!("schedule selects no dates from {}", data.display());
    }
    info!("{} rebalance dates from {} to {}", dates.len(), dates[0], dates[dates.len() - 1]);

    let report = run_rebalancing(&table, &dates, &config, cache.as_ref(), optimizer.as_ref())?;
    print_summary("run", &report);

    let dir = write_report(&report, Some(&config), out)?;
    println!("Artifacts saved to: {}", dir.display());
    Ok(())
}

fn batch_cmd(config_paths: &[PathBuf], data: &Path, returns: bool, parallel: bool, out: &Path) -> Result<()> {
    let table = load_table(data, returns)?;

    let mut jobs = Vec::with_capacity(config_paths.len());
    for path in config_paths {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("job{}", jobs.len()));
        jobs.push(BatchJob::new(name, RebalanceConfig::load(path)?));
    }

    // Jobs share the first config's cache settings.
    let cache = match jobs.first() {
        Some(job) => open_cache(&job.config)?,
        None => None,
    };
    let mut runner = BatchRunner::new(&table).with_parallelism(parallel);
    if let Some(cache) = &cache {
        runner = runner.with_cache(cache);
    }

    let mut failed = 0;
    for (job, outcome) in jobs.iter().zip(runner.run(&jobs)) {
        match outcome.result {
            Ok(report) => {
                print_summary(&outcome.name, &report);
                write_report(&report, Some(&job.config), &out.join(&outcome.name))?;
            }
            Err(err) => {
                eprintln!("{}: {err}", outcome.name);
                failed += 1;
            }
        }
    }
    if let Some(cache) = &cache {
        let stats = cache.stats();
        println!("Cache: {} hits, {} misses ({:.1}% hit rate)", stats.hits, stats.misses, stats.hit_rate() * 100.0);
    }
    if failed > 0 {
        bail!("{failed} of {} jobs failed", jobs.len());
    }
    Ok(())
}

fn synthetic_cmd(universe: &SyntheticUniverse, seed: u64, out: &Path) -> Result<()> {
    let table = universe.generate(seed)?;
    save_wide_csv(&table, out)?;
    println!(
        "Wrote {} assets x {} dates to {}",
        table.asset_count(),
        table.len(),
        out.display()
    );
    Ok(())
}

fn cache_status(config_path: &Path) -> Result<()> {
    let config = RebalanceConfig::load(config_path)?;
    let Some(dir) = &config.cache.cache_dir else {
        println!("No cache_dir configured; the cache is memory-only.");
        return Ok(());
    };
    if !dir.exists() {
        println!("Cache directory does not exist: {}", dir.display());
        return Ok(());
    }
    let cache = RebalanceCache::new(CacheOptions::from(&config.cache))?;
    println!("Cache: {}", dir.display());
    println!("Entries: {}", cache.disk_entries());
    match config.cache.max_cache_age_days {
        Some(days) => println!("Max age: {days} days"),
        None => println!("Max age: unlimited"),
    }
    Ok(())
}

fn cache_clear(config_path: &Path) -> Result<()> {
    let config = RebalanceConfig::load(config_path)?;
    let Some(dir) = &config.cache.cache_dir else {
        println!("No cache_dir configured; nothing to clear.");
        return Ok(());
    };
    if !dir.exists() {
        println!("Cache directory does not exist: {}", dir.display());
        return Ok(());
    }
    let cache = RebalanceCache::new(CacheOptions::from(&config.cache))?;
    let before = cache.disk_entries();
    cache.clear()?;
    println!("Removed {before} entries from {}", dir.display());
    Ok(())
}

fn print_summary(name: &str, report: &RunReport) {
    println!();
    println!("=== {name} ===");
    println!("Rebalances:  {}", report.events.len());
    println!("Held dates:  {}", report.held.len());
    println!("Failures:    {}", report.failures.len());
    for failure in &report.failures {
        println!("  {} ({:?}): {}", failure.date, failure.action, failure.error);
    }
    if let Some(last) = report.events.last() {
        println!("Last rebalance: {} ({} eligible)", last.date, last.eligible_count);
    }
    let turnover: f64 = report.events.iter().map(|e| e.realized_turnover).sum();
    if !report.events.is_empty() {
        println!("Avg turnover: {:.4}", turnover / report.events.len() as f64);
    }
    println!();
    println!("{:<12} {:>10} {:>8}", "Asset", "Weight", "Periods");
    println!("{}", "-".repeat(32));
    for (asset, weight) in &report.final_state.weights {
        println!(
            "{:<12} {:>9.2}% {:>8}",
            asset,
            weight * 100.0,
            report.final_state.holding_periods(asset)
        );
    }
    if let Some(stats) = &report.cache_stats {
        println!();
        println!(
            "Cache: {} hits, {} misses, {} corrupt recovered",
            stats.hits, stats.misses, stats.corrupt_recovered
        );
    }
}
