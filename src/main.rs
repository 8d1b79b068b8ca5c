//! Kraken auto-trader CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use kraken_auto::backtest::Backtester;
use kraken_auto::bot::Bot;
use kraken_auto::config::AppConfig;
use kraken_auto::db::PaperStore;
use kraken_auto::exchange::{Exchange, PaperExchange, ReplayFeed};
use kraken_auto::models::split_symbol;
use kraken_auto::trading::build_strategy;

/// Moving-average trading bot with stop-loss risk management.
#[derive(Parser)]
#[command(name = "kraken-auto")]
#[command(about = "Trade moving-average crossovers with fixed and trailing stops", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "KRAKEN_AUTO_CONFIG", default_value = "kraken_auto.toml")]
    config: PathBuf,

    /// Database file path for the paper account
    #[arg(short, long, env = "KRAKEN_AUTO_DATABASE", default_value = "sqlite:./kraken_auto.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the strategy on the latest bars of a feed
    Signal {
        /// Recorded bar feed (JSON); defaults to exchange.feed_path
        #[arg(short, long)]
        feed: Option<PathBuf>,
    },

    /// Replay a whole feed and report performance
    Backtest {
        /// Recorded bar feed (JSON); defaults to exchange.feed_path
        #[arg(short, long)]
        feed: Option<PathBuf>,

        /// Initial capital; defaults to exchange.paper_balance
        #[arg(short, long)]
        capital: Option<f64>,
    },

    /// Start paper trading over a feed, one bar per poll interval
    Paper {
        /// Recorded bar feed (JSON); defaults to exchange.feed_path
        #[arg(short, long)]
        feed: Option<PathBuf>,

        /// Polling interval in seconds; defaults to bot.poll_interval_secs
        #[arg(short, long)]
        interval: Option<u64>,

        /// Discard the saved paper account and start fresh
        #[arg(long)]
        reset: bool,
    },

    /// Show the paper account balances
    Balance,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Signal { feed } => {
            let feed = load_feed(&config, feed.as_deref())?;
            let bars = feed.bars();
            let window = &bars[bars.len().saturating_sub(config.exchange.history_limit)..];

            let mut strategy = build_strategy(&config.strategy, &config.risk)?;
            let signal = strategy.generate_signal(window)?;
            println!("{}", signal);

            if signal.is_buy() {
                let size = strategy.calculate_position_size(&signal, config.exchange.paper_balance);
                println!(
                    "Suggested size: {:.8} {} (${:.2} of ${:.2})",
                    size,
                    base_currency(&config.exchange.symbol),
                    size * signal.price,
                    config.exchange.paper_balance
                );
            }
        }

        Commands::Backtest { feed, capital } => {
            if let Some(capital) = capital {
                config.exchange.paper_balance = capital;
            }
            let feed = load_feed(&config, feed.as_deref())?;

            println!("\n=== Backtest ===");
            println!("Symbol:   {} ({})", feed.symbol(), feed.timeframe());
            println!("Bars:     {}", feed.len());
            println!("Capital:  ${:.2}", config.exchange.paper_balance);
            println!(
                "Strategy: {} ({}/{})",
                config.strategy.kind.as_str(),
                config.strategy.short_window,
                config.strategy.long_window
            );

            let backtester = Backtester::new(config)?;
            let results = backtester.run(feed).await?;
            println!("{}", results);

            if !results.trades.is_empty() {
                println!("\n--- Trades by Exit Reason ---");
                for (reason, count, pnl) in results.by_exit_reason() {
                    println!("  {:<20} {:>3} trades  ${:.2}", reason, count, pnl);
                }

                println!("\n--- Trades ---");
                for trade in &results.trades {
                    println!(
                        "  {} -> {} | {:.2} -> {:.2} | P&L: ${:.2} ({:+.2}%) | {}",
                        trade.entry_time.format("%Y-%m-%d %H:%M"),
                        trade.exit_time.format("%Y-%m-%d %H:%M"),
                        trade.entry_price,
                        trade.exit_price,
                        trade.pnl,
                        trade.return_pct * 100.0,
                        trade.exit_reason
                    );
                }
            }
        }

        Commands::Paper {
            feed,
            interval,
            reset,
        } => {
            if let Some(interval) = interval {
                config.bot.poll_interval_secs = interval;
            }
            let feed = load_feed(&config, feed.as_deref())?;

            let store = PaperStore::new(&cli.database).await?;
            if reset {
                store.reset().await?;
                info!("Paper account reset");
            }

            let (_, quote) = split_symbol(&config.exchange.symbol)
                .with_context(|| format!("Symbol {} is not BASE/QUOTE", config.exchange.symbol))?;
            let initial = HashMap::from([(
                quote.to_string(),
                Decimal::try_from(config.exchange.paper_balance)?,
            )]);

            let paper = Arc::new(PaperExchange::open(feed, store.clone(), initial).await?);
            let mut bot = Bot::new(paper.clone(), &config)?;
            bot.resume(&paper.orders().await)?;

            println!("\n=== Paper Trading Mode ===");
            println!("Symbol:           {} ({})", config.exchange.symbol, config.exchange.timeframe);
            println!("Polling interval: {}s", config.bot.poll_interval_secs);
            println!("Fixed stop:       {}%", config.risk.fixed_stop_loss_pct);
            match (config.risk.trailing_stop_loss_pct, config.risk.trailing_activation_pct) {
                (Some(trailing), Some(activation)) => {
                    println!("Trailing stop:    {}% after {}% profit", trailing, activation)
                }
                _ => println!("Trailing stop:    disabled"),
            }
            println!("\nThis is SIMULATED trading - no real money involved.");
            println!("Press Ctrl+C to stop.\n");

            bot.run_paper(&paper).await?;

            println!("\nStopped after {} cycles.", bot.cycles());
            print_balances(paper.as_ref()).await?;
            println!("Equity:     ${:.2}", paper.equity().await?);
            store.close().await;
        }

        Commands::Balance => {
            let store = PaperStore::new(&cli.database).await?;
            let balances = store.load_balances().await?;
            if balances.is_empty() {
                println!("No paper account found. Run 'kraken-auto paper' to start one.");
                return Ok(());
            }

            let orders = store.load_orders().await?;
            println!("\n=== Paper Account ===");
            let mut currencies: Vec<_> = balances.into_iter().collect();
            currencies.sort();
            for (currency, amount) in currencies {
                println!("  {:<8} {:>20}", currency, amount.normalize());
            }
            println!("\nOrders:     {}", orders.len());
            if let Some(last) = orders.last() {
                println!(
                    "Last order: {} {} {:.8} @ {:.2} ({})",
                    last.id,
                    last.side.as_str(),
                    last.amount,
                    last.price,
                    last.datetime.format("%Y-%m-%d %H:%M")
                );
            }
        }

        Commands::Config => {
            println!("\n=== Configuration ({}) ===\n", cli.config.display());
            print!("{}", config.to_toml()?);

            println!("\n=== Derived ===\n");
            println!("Bars needed for a signal: {}", config.strategy.min_bars());
            println!("Trailing stop enabled:    {}", config.risk.trailing_enabled());
        }
    }

    Ok(())
}

/// Feed from `path`, or from the configured feed path.
fn load_feed(config: &AppConfig, path: Option<&Path>) -> Result<ReplayFeed> {
    let path = path
        .or(config.exchange.feed_path.as_deref())
        .context("No bar feed given: pass --feed or set exchange.feed_path")?;
    ReplayFeed::load(path, &config.exchange.symbol, &config.exchange.timeframe)
}

fn base_currency(symbol: &str) -> &str {
    split_symbol(symbol).map_or(symbol, |(base, _)| base)
}

async fn print_balances(exchange: &dyn Exchange) -> Result<()> {
    let balances = exchange.fetch_balance().await?;
    let mut currencies: Vec<_> = balances.into_iter().collect();
    currencies.sort_by(|a, b| a.0.cmp(&b.0));

    println!("\n=== Balances ===");
    for (currency, balance) in currencies {
        println!("  {:<8} {:>18.8}", currency, balance.total);
    }
    Ok(())
}
