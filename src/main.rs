//! Basis Vault - Main Entry Point
//!
//! Runs a deterministic paper simulation of the vault and strategy against
//! mock legs, driving the same keeper loop a production deployment would.

use anyhow::Result;
use basis_vault::config::Config;
use basis_vault::engine::BasisEngine;
use basis_vault::legs::{MockHedgeLeg, MockSpotLeg, SwapKind};
use basis_vault::oracle::FixedOracle;
use basis_vault::strategy::DeutilizeAmount;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Basis Vault CLI
#[derive(Parser)]
#[command(name = "basis-vault")]
#[command(version, about = "Pooled delta-neutral basis trading vault")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted paper simulation on mock legs
    Simulate {
        /// Initial depositor balance
        #[arg(short = 'b', long, default_value = "100000")]
        deposit: f64,

        /// Product price at simulation start
        #[arg(short, long, default_value = "2000")]
        price: f64,

        /// Price after the mid-simulation shock (0 disables the shock)
        #[arg(short = 's', long, default_value = "2390")]
        shock_price: f64,
    },

    /// Validate the effective configuration and print it
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load().unwrap_or_else(|err| {
        warn!(error = %err, "Falling back to default configuration");
        Config::default()
    });
    config.validate()?;

    match cli.command {
        Some(Commands::Simulate {
            deposit,
            price,
            shock_price,
        }) => {
            let deposit = Decimal::try_from(deposit)?;
            let price = Decimal::try_from(price)?;
            let shock_price = Decimal::try_from(shock_price)?;
            simulate(config, deposit, price, shock_price).await
        }
        Some(Commands::ShowConfig) | None => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let file_appender = tracing_appender::rolling::daily("logs", "basis-vault.log");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
        )
        .with_writer(file_appender.and(std::io::stdout))
        .init();
}

/// Deposit, ramp into the legs, survive a price shock, and drain back out.
async fn simulate(
    config: Config,
    deposit: Decimal,
    price: Decimal,
    shock_price: Decimal,
) -> Result<()> {
    let asset = config.vault.asset_symbol.clone();
    let product = config.vault.product_symbol.clone();

    let oracle = Arc::new(FixedOracle::new());
    oracle.set_price(&asset, Decimal::ONE).await;
    oracle.set_price(&product, price).await;
    let spot = Arc::new(MockSpotLeg::new(price));
    let hedge = Arc::new(MockHedgeLeg::new(price));

    let mut engine = BasisEngine::new(
        config,
        oracle.clone(),
        spot.clone(),
        hedge.clone(),
        Utc::now(),
    );

    info!(%deposit, %price, "Simulation start");
    engine.deposit("depositor", deposit, Utc::now()).await?;

    // Ramp in: the per-call utilization cap forces several rounds.
    loop {
        let pending = engine.pending_utilizations().await?;
        if pending.utilization <= dec!(1) {
            break;
        }
        engine
            .utilize(pending.utilization, SwapKind::Direct, &[], Utc::now())
            .await?;
        settle_hedge(&mut engine, &hedge).await?;
    }
    log_state(&engine, "after ramp-in").await?;

    if shock_price > Decimal::ZERO && shock_price != price {
        info!(%shock_price, "Applying price shock");
        oracle.set_price(&product, shock_price).await;
        spot.set_price(shock_price).await;
        hedge.set_mark_price(shock_price).await;

        run_keeper(&mut engine, &hedge).await?;
        log_state(&engine, "after keeper recovery").await?;
    }

    // Drain: redeem everything and serve the request queue.
    let shares = engine.vault().balance_of("depositor");
    let outcome = engine
        .request_redeem("depositor", "depositor", shares, Utc::now())
        .await?;
    if let Some(key) = outcome.request_key {
        // Swap fees mean each settlement can land slightly short of the
        // backlog; keep deutilizing what pending_utilizations reports until
        // the queue is covered.
        let mut rounds = 0u32;
        loop {
            let pending = engine.pending_utilizations().await?;
            if pending.deutilization <= Decimal::ZERO {
                break;
            }
            let amount = if pending.full_deutilization {
                DeutilizeAmount::All
            } else {
                DeutilizeAmount::Exact(pending.deutilization)
            };
            engine
                .deutilize(amount, SwapKind::Direct, &[], Utc::now())
                .await?;
            settle_hedge(&mut engine, &hedge).await?;
            rounds += 1;
            anyhow::ensure!(rounds < 50, "withdrawal drain failed to converge");
        }
        let paid = engine.claim(key, "depositor", Utc::now())?;
        info!(%paid, "Queued withdrawal claimed");
    }
    run_keeper(&mut engine, &hedge).await?;
    log_state(&engine, "after drain").await?;
    Ok(())
}

/// Loop perform_upkeep until it reports nothing left, settling each parked
/// hedge order in between as an off-chain agent would.
async fn run_keeper(engine: &mut BasisEngine, hedge: &Arc<MockHedgeLeg>) -> Result<()> {
    let mut iterations = 0u32;
    while engine.perform_upkeep(Utc::now()).await? {
        iterations += 1;
        anyhow::ensure!(iterations < 100, "keeper failed to converge");
        settle_hedge(engine, hedge).await?;
    }
    info!(iterations, "Keeper loop converged");
    Ok(())
}

async fn settle_hedge(engine: &mut BasisEngine, hedge: &Arc<MockHedgeLeg>) -> Result<()> {
    if let Some(payload) = hedge.settle_next().await {
        engine.after_adjust_position(payload, Utc::now()).await?;
    }
    Ok(())
}

async fn log_state(engine: &BasisEngine, label: &str) -> Result<()> {
    let view = engine.state_view().await?;
    info!(target: "simulation", "{}: {}", label, serde_json::to_string_pretty(&view)?);
    Ok(())
}
