use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stopguard::config::Settings;
use stopguard::exchange::{PaperExchange, PaperExchangeConfig};
use stopguard::{OpenOutcome, PositionManager};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stopguard", about = "Single-position manager with protective stops")]
struct Cli {
    /// TOML settings file, layered over defaults and under STOPGUARD__* env vars
    #[arg(long)]
    config: Option<PathBuf>,

    /// Submit orders (overrides position.trading)
    #[arg(long)]
    trade: bool,

    /// Starting quote balance of the paper account
    #[arg(long, default_value_t = 10_000.0)]
    quote_balance: f64,

    /// Paper exchange swallows fill reports, forcing the rollback path
    #[arg(long)]
    hide_fills: bool,

    /// Give up waiting for the entry fill after this many seconds
    #[arg(long)]
    fill_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a long position at the given ask and report the outcome
    Open {
        #[arg(long, default_value_t = 100.0)]
        ask: f64,
    },
    /// Open, trail the stop along a price path, then close
    Session {
        /// Comma-separated bid prices, the first one is the entry market
        #[arg(long, value_delimiter = ',', required = true)]
        prices: Vec<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    let mut manager_config = settings.manager_config();
    manager_config.trading |= cli.trade;

    let entry_ask = match &cli.command {
        Command::Open { ask } => *ask,
        Command::Session { prices } => *prices.first().context("no session prices")?,
    };

    let exchange = Arc::new(PaperExchange::new(PaperExchangeConfig {
        base_asset: manager_config.base_asset.clone(),
        quote_asset: manager_config.quote_asset.clone(),
        bid: entry_ask * 0.999,
        ask: entry_ask,
        quote_balance: cli.quote_balance,
        base_balance: 0.0,
        report_fills: !cli.hide_fills,
    }));

    let mut strategy = settings.stop_strategy()?;
    // Seed the average so the floor strategy has something to compare against
    strategy.record_price(entry_ask);

    let mut manager = PositionManager::new(exchange.clone(), manager_config, strategy);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let outcome = open(&mut manager, &cancel, cli.fill_timeout_secs).await?;
    tracing::info!(?outcome, "Entry finished");

    if let (Command::Session { prices }, OpenOutcome::Opened { .. }) = (&cli.command, &outcome) {
        run_session(&mut manager, &exchange, &prices[1..]).await?;
    }

    let balances = exchange.balances()?;
    tracing::info!(?balances, state = ?manager.state(), "Done");
    Ok(())
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stopguard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open(
    manager: &mut PositionManager<PaperExchange>,
    cancel: &CancellationToken,
    fill_timeout_secs: Option<u64>,
) -> stopguard::Result<OpenOutcome> {
    match fill_timeout_secs {
        Some(secs) => manager.open_long_position_within(Duration::from_secs(secs)).await,
        None => manager.open_long_position_until(cancel).await,
    }
}

/// Cancels `token` on Ctrl+C; an entry in flight rolls back instead of dying mid-poll
async fn shutdown_signal(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Received Ctrl+C, cancelling fill wait");
        token.cancel();
    }
}

async fn run_session(
    manager: &mut PositionManager<PaperExchange>,
    exchange: &PaperExchange,
    prices: &[f64],
) -> anyhow::Result<()> {
    for &bid in prices {
        let triggered = exchange.set_prices(bid, bid * 1.001)?;
        if triggered > 0 {
            tracing::warn!(bid, "Stop order filled");
            if manager.sync_position().await? {
                return Ok(());
            }
        }

        manager.strategy_mut().record_price(bid);
        let candidate = manager.strategy().compute_stop_price(bid)?;
        // Only ever tighten the stop
        if manager.current_stop_price().is_some_and(|current| candidate > current) {
            manager.update_stop_order_price(candidate).await?;
        }

        if let Some(target) = manager.profit_target_price() {
            if bid >= target {
                tracing::info!(bid, target, "Profit target reached");
                break;
            }
        }
    }

    if manager.is_position_open() {
        manager.close_position().await?;
    }
    Ok(())
}
