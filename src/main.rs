//! Benchmark the built-in strategies, plus an optional rules file.
//!
//! ```text
//! engravesim [rules-file]
//! ```
//!
//! The simulation is configured from `SIM_*` variables, the benchmark from
//! `BENCH_RUNS` and `BENCH_SEED`. Reports go to stdout as JSON, logs to stderr.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;

use engravesim::bench::benchmark;
use engravesim::builtin::register_builtins;
use engravesim::config::SimulationConfig;
use engravesim::logging::{log, obj, run_id, v_num, v_str, Domain, Level};
use engravesim::registry::StrategyRegistry;
use engravesim::strategy::StrategyDefinition;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = SimulationConfig::from_env();
    config.validate().context("simulation config")?;
    let runs = env_u64("BENCH_RUNS", 1000);
    let seed = env_u64("BENCH_SEED", 1);

    let mut registry = StrategyRegistry::new();
    register_builtins(&mut registry);

    if let Some(path) = std::env::args().nth(1) {
        let source = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
        let name = std::path::Path::new(&path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("rules")
            .to_string();
        let mut definition = StrategyDefinition::source(&name, &format!("Rules loaded from {}", path), &source)
            .with_tags(["user"]);
        if let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) {
            definition = definition.modified_at(DateTime::<Utc>::from(modified));
        }
        let strategy = registry.register(definition);
        if let Some(err) = strategy.compile_error() {
            bail!("{}: {}", path, err);
        }
    }

    log(
        Level::Info,
        Domain::System,
        "bench_start",
        obj(&[
            ("run_id", v_str(run_id())),
            ("strategies", v_num(registry.len() as f64)),
            ("runs", v_num(runs as f64)),
            ("steps_per_run", v_num(config.total_steps() as f64)),
            ("seed", v_num(seed as f64)),
        ]),
    );

    let mut reports = Vec::with_capacity(registry.len());
    for strategy in registry.iter() {
        let report = benchmark(strategy, &config, runs, seed)
            .await
            .with_context(|| format!("benchmarking '{}'", strategy.name()))?;
        reports.push(report);
    }

    let out = json!({
        "runId": run_id(),
        "config": config,
        "reports": reports,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
