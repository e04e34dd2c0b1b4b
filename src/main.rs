use anyhow::Result;
use cellsim_common::{BalanceStrategyKind, SimulationConfig};
use cellsim_engine::output;
use cellsim_engine::{
    BranchingModel, CsvPersistence, LogObserver, ProgressBarObserver, RunReport, SimulationRun, TimingRecorder,
};
use clap::Parser;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Lockstep parallel population simulator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override [run].workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Override [run].max_cycles
    #[arg(long)]
    max_cycles: Option<u32>,

    /// Override [balancing].strategy (empty, equalize_count, duty_ratio, duty_gain)
    #[arg(long)]
    strategy: Option<String>,

    /// Override [run].seed
    #[arg(long)]
    seed: Option<u64>,

    /// Log progress instead of drawing a progress bar
    #[arg(long, default_value_t = false)]
    no_progress_bar: bool,
}

fn main() -> Result<()> {
    // Initialize the logger
    Builder::from_default_env().filter(None, LevelFilter::Info).init();

    let args = Args::parse();
    info!("Starting cellsim...");

    // --- Load Configuration ---
    let mut config = SimulationConfig::load(&args.config)?;
    apply_overrides(&mut config, &args)?;

    let params = config.get_sim_params();
    debug!("Simulation Parameters: {:#?}", params);

    let iterations = config.run.iterations.max(1);
    let start_time = Instant::now();

    for iteration in 0..iterations {
        // Successive iterations differ only in their seed.
        let iter_params = params.with_seed(params.seed.wrapping_add(iteration as u64));
        let base = output::iteration_base(&config.output.base_filename, iteration, iterations);
        info!(
            "--- Iteration {}/{} (seed {}, {} workers, {} cells) ---",
            iteration + 1,
            iterations,
            iter_params.seed,
            iter_params.workers,
            iter_params.initial_cells
        );

        let model = BranchingModel::new(&iter_params)?;
        let mut run = SimulationRun::new(iter_params, Arc::new(model));
        if args.no_progress_bar {
            run = run.with_observer(Box::new(LogObserver::new()));
        } else {
            run = run.with_observer(Box::new(ProgressBarObserver::new()));
        }

        if config.output.persist_units {
            let units_path = format!("{}_units.csv", base);
            match CsvPersistence::create(&units_path) {
                Ok(sink) => run = run.with_persistence(Arc::new(sink)),
                Err(e) => error!("Unit persistence disabled: {:#}", e),
            }
        }

        let recorder = Arc::new(TimingRecorder::new());
        if config.output.save_benchmarks {
            run = run.with_benchmark(recorder.clone());
        }

        let report = match run.run() {
            Ok(report) => report,
            Err(e) => {
                error!("Iteration {} failed: {}", iteration + 1, e);
                anyhow::bail!("Simulation run failed.");
            }
        };
        info!(
            "Iteration {} ended ({}) after {} cycles with {} cells in {:.3} s.",
            iteration + 1,
            report.reason,
            report.cycles_completed,
            report.total_cells,
            report.elapsed.as_secs_f64()
        );

        save_outputs(&config, &base, &report, &recorder);
    }

    let total_duration = start_time.elapsed();
    info!(
        "{} iteration(s) finished in {:.3} seconds ({:.3} minutes).",
        iterations,
        total_duration.as_secs_f64(),
        total_duration.as_secs_f64() / 60.0
    );
    info!("Simulation Complete.");
    Ok(())
}

fn apply_overrides(config: &mut SimulationConfig, args: &Args) -> Result<()> {
    if let Some(workers) = args.workers {
        config.run.workers = workers;
    }
    if let Some(max_cycles) = args.max_cycles {
        config.run.max_cycles = max_cycles;
    }
    if let Some(seed) = args.seed {
        config.run.seed = seed;
    }
    if let Some(strategy) = &args.strategy {
        config.balancing.strategy = strategy.parse::<BalanceStrategyKind>()?;
    }
    // Overrides can break constraints the file satisfied.
    config.validate()
}

/// Writes the configured outputs. Failures are logged, never fatal.
fn save_outputs(config: &SimulationConfig, base: &str, report: &RunReport, recorder: &TimingRecorder) {
    info!("Saving recorded data...");

    if config.output.save_snapshots {
        if let Err(e) = output::save_snapshots(base, config.output.format, &report.snapshots) {
            error!("Error saving snapshots: {:#}", e);
        }
    } else {
        info!("Skipping saving snapshots as per config (save_snapshots is false).");
    }

    if config.output.save_history {
        if let Err(e) = output::save_history_csv(format!("{}_history.csv", base), report) {
            error!("Error saving history: {:#}", e);
        }
    }

    if let Err(e) = output::save_summary_json(format!("{}_summary.json", base), report) {
        error!("Error saving run summary: {:#}", e);
    }

    if config.output.save_benchmarks {
        let path = format!("{}_benchmarks.csv", base);
        match recorder.write_csv(&path) {
            Ok(()) => info!("Benchmark samples saved to {}", path),
            Err(e) => error!("Error saving benchmark samples: {:#}", e),
        }
    }
}
