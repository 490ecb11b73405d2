//! Pilot Simulator CLI
//!
//! Run deterministic closed-loop driving scenarios against the full stack.

use clap::Parser;
use pilot_core::{ControlAlgorithm, PilotConfig, PlanningAlgorithm};
use pilot_sim::{ScenarioId, ScenarioResult, ScenarioRunner, SimError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Pilot deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "pilot-sim")]
#[command(about = "Run deterministic closed-loop scenarios for Pilot", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (straight_cruise, follow_lead, lead_brake, pedestrian_crossing,
    /// red_light, slow_lead, obstacle_detour, sensor_fusion, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Simulated seconds per scenario (defaults to each scenario's own)
    #[arg(short, long)]
    duration: Option<f64>,

    /// Control rate in Hz
    #[arg(long, default_value = "10")]
    tick_rate: u32,

    /// Planning algorithm (astar, hybrid-astar, rrt, rrt-star, frenet)
    #[arg(long)]
    planner: Option<PlanningAlgorithm>,

    /// Controller (pure-pursuit, stanley, pid, lqr, mpc)
    #[arg(long)]
    controller: Option<ControlAlgorithm>,

    /// JSON file with a full PilotConfig
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the tracking/control validation report per run
    #[arg(long)]
    report: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

fn load_config(args: &Args) -> Result<PilotConfig, SimError> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| SimError::Io {
                path: path.clone(),
                source,
            })?;
            PilotConfig::from_json(&text)?
        }
        None => PilotConfig::default(),
    };
    if let Some(planner) = args.planner {
        config.planner.algorithm = planner;
    }
    if let Some(controller) = args.controller {
        config.controller.algorithm = controller;
    }
    config.validate()?;
    Ok(config)
}

/// Runs every requested scenario and seed. `Ok(false)` when any failed.
fn run(args: &Args) -> Result<bool, SimError> {
    if !args.json {
        info!("Pilot Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let config = load_config(args)?;

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse()?]
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();

    for seed_offset in 0..args.seeds.max(1) {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let mut runner = ScenarioRunner::new(seed)
            .with_config(config.clone())
            .with_tick_rate(args.tick_rate);
        if let Some(duration) = args.duration {
            runner = runner.with_duration(duration);
        }

        for scenario in &scenarios {
            let result = runner.run(*scenario)?;

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
                if args.report {
                    result.validation.print();
                }
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "planner": config.planner.algorithm.name(),
            "controller": config.controller.algorithm.name(),
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                    "track_rmse": r.validation.global.position_rmse(),
                    "lateral_rmse": r.validation.global.lateral_rmse(),
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            // List failed seeds
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(failed_count == 0)
}
