use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

use crate::client::{CommandOutcome, DerivClient};
use crate::config::AppConfig;
use crate::domain::{Contract, Tick};
use crate::error::{DerivError, Result};

#[derive(Parser)]
#[command(name = "deriv-trader")]
#[command(version = "0.1.0")]
#[command(about = "Deriv WebSocket trading client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory
    #[arg(short, long, default_value = "config")]
    pub config: String,

    /// Application id (overrides the config file)
    #[arg(long, env = "DERIV_APP_ID")]
    pub app_id: Option<String>,

    /// API token (overrides the config file)
    #[arg(long, env = "DERIV_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect, authorize, load market data, place one order and show the portfolio
    Run {
        #[arg(short, long, default_value = "R_100")]
        symbol: String,
        /// Stake in account currency
        #[arg(short, long, default_value = "8.5")]
        amount: Decimal,
        #[arg(short, long, default_value = "1")]
        duration: u32,
        /// t, s, m, h or d
        #[arg(short, long, default_value = "d")]
        unit: String,
        /// CALL or PUT
        #[arg(long, default_value = "PUT")]
        contract_type: String,
        /// Take-profit as a price or percentage (e.g. 15%)
        #[arg(long)]
        tp: Option<String>,
        /// Stop-loss as a price or percentage (e.g. 10%)
        #[arg(long)]
        sl: Option<String>,
    },
    /// Show the account balance
    Balance,
    /// List tradable symbols
    Symbols,
    /// Contract types offered for a symbol
    Contracts { symbol: String },
    /// Stream ticks until Ctrl+C
    Ticks {
        symbol: String,
        /// Stop after this many ticks
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Show open positions
    Portfolio,
    /// Run a text command such as "buy R_100"
    Command {
        command: String,
        /// Stake
        #[arg(short = 'q', long)]
        quantity: Option<Decimal>,
        /// Duration in days
        #[arg(short = 't', long)]
        duration: Option<u32>,
        #[arg(long)]
        tp: Option<String>,
        #[arg(long)]
        sl: Option<String>,
        #[arg(long)]
        contract_id: Option<String>,
    },
    /// Sell an open contract at market
    Close { contract_id: String },
    /// Set take-profit / stop-loss on an open contract
    Modify {
        contract_id: String,
        #[arg(long)]
        tp: Option<String>,
        #[arg(long)]
        sl: Option<String>,
    },
}

impl Cli {
    /// Config from files and environment, with flags taking precedence
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = match AppConfig::load_from(&self.config) {
            Ok(config) => config,
            Err(e) => match &self.app_id {
                Some(app_id) => AppConfig::default_config(app_id, None),
                None => return Err(e.into()),
            },
        };

        if let Some(app_id) = &self.app_id {
            config.connection.app_id = app_id.clone();
        }
        if let Some(token) = &self.token {
            config.connection.api_token = Some(token.clone());
        }

        config
            .validate()
            .map_err(|errors| DerivError::InvalidParameters(errors.join("; ")))?;
        Ok(config)
    }
}

pub async fn show_balance(client: &DerivClient) -> Result<()> {
    let balance = client.fetch_balance().await?;
    println!("Balance: {} {}", balance.balance, balance.currency);
    if let Some(loginid) = &balance.loginid {
        println!("  Account: {}", loginid);
    }
    Ok(())
}

pub async fn show_symbols(client: &DerivClient) -> Result<()> {
    let types = client.fetch_trade_types().await?;
    println!("{} symbols\n", types.len());

    let mut market = String::new();
    for t in &types {
        if t.market != market {
            market = t.market.clone();
            println!("\x1b[1m{}\x1b[0m", market);
        }
        println!("  {:<12} {:<20} {}", t.symbol, t.submarket, t.display_name);
    }
    Ok(())
}

pub async fn show_contracts(client: &DerivClient, symbol: &str) -> Result<()> {
    let offers = client.fetch_contracts_for(symbol).await?;
    println!("Contracts for {}:\n", symbol);
    if offers.is_empty() {
        println!("  (none)");
    }
    for offer in offers.iter() {
        println!(
            "  {:<10} {:>6} .. {:<6} {}",
            offer.contract_type, offer.min_duration, offer.max_duration, offer.barriers
        );
    }
    Ok(())
}

pub async fn show_portfolio(client: &DerivClient) -> Result<()> {
    let contracts = client.fetch_portfolio().await?;
    println!("Open positions: {}\n", contracts.len());
    for c in &contracts {
        println!(
            "  {:<14} {:<10} {:<6} buy {} payout {}",
            c.contract_id,
            c.symbol,
            c.contract_type,
            c.buy_price,
            c.payout.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

pub fn print_tick(tick: &Tick) {
    let time = tick
        .timestamp()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    println!("{} {:<10} {}", time, tick.symbol, tick.quote);
}

pub fn print_contract(contract: &Contract) {
    println!(
        "Contract {} [{}] {} {} stake {}",
        contract.id().unwrap_or("-"),
        contract.state,
        contract.symbol,
        contract.contract_type,
        contract.stake
    );
    if let Some(tp) = contract.barriers.take_profit {
        println!("  Take profit: {}", tp);
    }
    if let Some(sl) = contract.barriers.stop_loss {
        println!("  Stop loss: {}", sl);
    }
    if let Some(sold_for) = contract.sold_for {
        println!("  Sold for: {}", sold_for);
    }
}

pub fn print_outcome(outcome: &CommandOutcome) {
    match outcome {
        CommandOutcome::Opened(contract) | CommandOutcome::Cancelled(contract) => {
            print_contract(contract)
        }
        CommandOutcome::Unsubscribed(keys) => {
            println!("Unsubscribed {} stream(s)", keys.len());
        }
    }
}
