// src/main.rs
use clap::Parser;
use mobile_miner_rs::engine::MiningState;
use mobile_miner_rs::miner::benchmark;
use mobile_miner_rs::utils::logging::init_bench_logging;
use mobile_miner_rs::{self, *};
use std::time::Duration;
use tokio::runtime::Runtime;

/// Main entry point for the mobile miner
///
/// # Returns
/// - `Ok(())` on successful execution
/// - `Err(MinerError)` if any operation fails
///
/// # Flow
/// 1. Parses command line arguments
/// 2. Delegates to appropriate subcommand handler
/// 3. Propagates any errors upward
fn main() -> Result<(), MinerError> {
    let cli = cli::Commands::parse();

    match cli.action {
        cli::Action::Start(opts) => start_mining(opts),
        cli::Action::Benchmark(opts) => run_benchmark(opts),
        cli::Action::Config(opts) => generate_config(opts),
    }
}

/// Starts mining with the given options and runs until Ctrl-C
///
/// # Operations
/// 1. Initializes logging
/// 2. Loads the configuration and applies CLI overrides
/// 3. Starts the mining engine against the configured pool
/// 4. Waits for Ctrl-C or a terminal engine error, then stops cleanly
fn start_mining(opts: cli::StartOptions) -> Result<(), MinerError> {
    utils::init_logging();

    let mut config = config::load(&opts.config)?;
    // Apply CLI overrides; an explicit worker count beats the preset
    if let Some(mode) = opts.energy_mode.or(config.energy_mode) {
        config.apply_energy_mode(mode, num_cpus::get());
    }
    if let Some(workers) = opts.workers {
        config.resources.worker_count = workers;
    }
    if let Some(algo) = opts.algorithm {
        config.algorithm = algo;
    }
    config.validate()?;

    let rt = Runtime::new()?;
    rt.block_on(async {
        let engine = MiningEngine::with_system_sensors();
        engine.start(config).await?;

        let mut state = engine.subscribe_state();
        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                log::info!("Interrupt received, shutting down");
                signal.map_err(MinerError::from)
            }
            reason = wait_for_error(&mut state) => {
                Err(MinerError::ConnectionError(reason))
            }
        };

        let stats = engine.stats();
        engine.stop().await;
        log::info!(
            "Session totals: {} hashes, {} accepted, {} rejected, {} stale, uptime {:?}",
            stats.total_hashes,
            stats.shares.accepted,
            stats.shares.rejected,
            stats.shares.stale,
            stats.uptime
        );
        outcome
    })
}

/// Resolves with the reason once the engine reports a terminal error
async fn wait_for_error(state: &mut tokio::sync::watch::Receiver<MiningState>) -> String {
    loop {
        if let MiningState::Error(reason) = &*state.borrow_and_update() {
            return reason.clone();
        }
        if state.changed().await.is_err() {
            return "engine dropped".into();
        }
    }
}

/// Runs a hashing benchmark
///
/// # Arguments
/// * `opts` - Benchmark configuration options
fn run_benchmark(opts: cli::BenchmarkOptions) -> Result<(), MinerError> {
    init_bench_logging();

    log::info!(
        "Starting {} benchmark for {} seconds on {} thread(s)",
        opts.algorithm,
        opts.duration,
        opts.threads
    );

    let report = benchmark::run(
        opts.algorithm,
        Duration::from_secs(opts.duration),
        opts.threads,
    )?;

    log::info!("Benchmark results:");
    log::info!("Total hashes: {}", report.hashes);
    log::info!("Average hashrate: {:.2} H/s", report.hashrate());
    log::logger().flush(); // Ensure final results appear

    Ok(())
}

/// Writes the configuration template to `opts.output`
fn generate_config(opts: cli::ConfigOptions) -> Result<(), MinerError> {
    let template = config::generate_template();
    std::fs::write(&opts.output, template)?;
    println!("Configuration template written to {}", opts.output.display());
    Ok(())
}
