//! PayWallet Simulator
//!
//! Drives the transaction engine over an in-memory ledger with concurrent
//! clients, then checks that funds were conserved and no wallet went
//! negative.

use clap::Parser;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod scenario;

use paywallet_engine::EngineConfig;
use paywallet_ledger::MemoryStoreConfig;

use controller::{SimulationConfig, SimulationController};
use scenario::Scenario;

/// PayWallet Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "paywallet-sim")]
#[command(about = "PayWallet load and scenario simulator")]
struct Args {
    /// Number of wallets to provision
    #[arg(short, long, default_value = "8")]
    wallets: usize,

    /// Scenario to run: random, contention, ping-pong or faults
    #[arg(short, long, default_value = "random")]
    scenario: String,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Concurrent client tasks
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Total operations across all clients
    #[arg(short, long, default_value = "2000")]
    operations: usize,

    /// Opening balance of every wallet
    #[arg(long, default_value = "1000.00")]
    initial_balance: Decimal,

    /// Emit JSON logs and a JSON report
    #[arg(long)]
    json: bool,

    /// Print engine counters in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let scenario = Scenario::load(&args.scenario)?;
    let seed = args.seed.unwrap_or_else(rand::random);

    info!("Starting PayWallet Simulator");
    info!("Wallets: {}", args.wallets);
    info!("Seed: {}", seed);

    let config = SimulationConfig {
        wallets: args.wallets,
        concurrency: args.concurrency,
        operations: args.operations,
        initial_balance: args.initial_balance,
        seed,
    };
    let engine_config = EngineConfig::from_env();
    engine_config.validate()?;

    let mut controller =
        SimulationController::new(config, MemoryStoreConfig::from_env(), engine_config)?;
    controller.initialize().await?;

    let report = controller.run_scenario(&scenario).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let client = &report.client;
        info!("Simulation complete in {}ms", report.elapsed_ms);
        info!("Total operations: {}", client.total_operations);
        info!("Successful: {}", client.successful_operations);
        info!("Failed: {}", client.failed_operations);
        for (code, count) in &client.failures_by_code {
            info!("  {}: {}", code, count);
        }
        info!("Throughput: {:.1} ops/s", client.throughput_per_sec);
        info!(
            "Latency: avg {}us, p50 {}us, p95 {}us, p99 {}us",
            client.average_latency_us,
            client.p50_latency_us,
            client.p95_latency_us,
            client.p99_latency_us
        );
        info!(
            "Engine: {} completed, {} replays, {} storage retries",
            report.engine.completed(),
            report.engine.replays,
            report.engine.storage_retries
        );
        info!("Total funds: {} (expected {})", report.actual_total, report.expected_total);
    }

    if args.prometheus {
        print!("{}", controller.engine().metrics().to_prometheus());
    }

    Ok(())
}
