use clap::Parser;
use deriv_trader::cli::{self, Cli, Commands};
use deriv_trader::domain::{BarrierSpec, ContractType, DurationUnit, OrderSpec, Tick};
use deriv_trader::error::Result;
use deriv_trader::{CommandParams, DerivClient, SubscriptionEvent};
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{graceful_shutdown, init_logging, init_logging_simple, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Run {
            symbol,
            amount,
            duration,
            unit,
            contract_type,
            tp,
            sl,
        }) => {
            let config = cli.load_config()?;
            init_logging(&config.logging);
            let spec = OrderSpec::new(
                symbol,
                *amount,
                *duration,
                unit.parse::<DurationUnit>()?,
                contract_type.parse::<ContractType>()?,
            )
            .with_limits(
                tp.as_deref().map(str::parse::<BarrierSpec>).transpose()?,
                sl.as_deref().map(str::parse::<BarrierSpec>).transpose()?,
            );

            let client = DerivClient::new(config);
            tokio::select! {
                result = run_session(&client, spec) => {
                    if let Err(e) = result {
                        error!("Session failed: {}", e);
                    }
                }
                _ = shutdown_signal() => {}
            }
            graceful_shutdown(&client).await?;
        }
        Some(Commands::Balance) => {
            let client = open_session(&cli).await?;
            let result = cli::show_balance(&client).await;
            finish(&client, result).await?;
        }
        Some(Commands::Symbols) => {
            let client = open_session(&cli).await?;
            let result = cli::show_symbols(&client).await;
            finish(&client, result).await?;
        }
        Some(Commands::Contracts { symbol }) => {
            let client = open_session(&cli).await?;
            let result = cli::show_contracts(&client, symbol).await;
            finish(&client, result).await?;
        }
        Some(Commands::Ticks { symbol, count }) => {
            let client = open_session(&cli).await?;
            let result = watch_ticks(&client, symbol, *count).await;
            finish(&client, result).await?;
        }
        Some(Commands::Portfolio) => {
            let client = open_session(&cli).await?;
            let result = cli::show_portfolio(&client).await;
            finish(&client, result).await?;
        }
        Some(Commands::Command {
            command,
            quantity,
            duration,
            tp,
            sl,
            contract_id,
        }) => {
            let params = CommandParams {
                quantity: *quantity,
                duration: *duration,
                take_profit: tp.clone(),
                stop_loss: sl.clone(),
                contract_id: contract_id.clone(),
            };
            let client = open_session(&cli).await?;
            if contract_id.is_some() {
                sync_portfolio(&client).await;
            }
            let result = client
                .process_command(command, &params)
                .await
                .map(|outcome| cli::print_outcome(&outcome));
            finish(&client, result).await?;
        }
        Some(Commands::Close { contract_id }) => {
            let client = open_session(&cli).await?;
            sync_portfolio(&client).await;
            let result = client
                .close_position(contract_id)
                .await
                .map(|contract| cli::print_contract(&contract));
            finish(&client, result).await?;
        }
        Some(Commands::Modify { contract_id, tp, sl }) => {
            let client = open_session(&cli).await?;
            sync_portfolio(&client).await;
            let result = client
                .modify_order(contract_id, tp.as_deref(), sl.as_deref())
                .await
                .map(|contract| cli::print_contract(&contract));
            finish(&client, result).await?;
        }
        None => {
            println!("No command given. Run with --help to see available commands.");
        }
    }

    Ok(())
}

/// Connected and authorized client for one-shot commands
async fn open_session(cli: &Cli) -> Result<DerivClient> {
    init_logging_simple();
    let config = cli.load_config()?;
    let client = DerivClient::new(config);
    if let Err(e) = client.start().await {
        let _ = client.shutdown().await;
        return Err(e);
    }
    Ok(client)
}

/// Close the session, then surface the command's own result
async fn finish(client: &DerivClient, result: Result<()>) -> Result<()> {
    if let Err(e) = client.shutdown().await {
        warn!("Shutdown failed: {}", e);
    }
    result
}

/// Track existing positions so they can be modified or closed by id
async fn sync_portfolio(client: &DerivClient) {
    match client.sync_portfolio().await {
        Ok(adopted) => info!("Tracking {} open contract(s)", adopted.len()),
        Err(e) => warn!("Portfolio sync failed: {}", e),
    }
}

/// connect -> authorize -> market data -> one order -> portfolio
async fn run_session(client: &DerivClient, spec: OrderSpec) -> Result<()> {
    let authorization = client.start().await?;
    println!(
        "Authorized as {} ({})",
        authorization.loginid, authorization.currency
    );

    cli::show_balance(client).await?;

    let types = client.fetch_trade_types().await?;
    info!("{} tradable symbols", types.len());
    let offers = client.fetch_contracts_for(&spec.symbol).await?;
    info!("{} contract offers for {}", offers.len(), spec.symbol);

    let tick = client.fetch_ticker(&spec.symbol).await?;
    cli::print_tick(&tick);

    let contract = client.place_order(spec).await?;
    cli::print_contract(&contract);

    client.sync_portfolio().await?;
    cli::show_portfolio(client).await?;

    info!("Session running. Press Ctrl+C to stop.");
    std::future::pending::<()>().await;
    Ok(())
}

async fn watch_ticks(client: &DerivClient, symbol: &str, count: Option<usize>) -> Result<()> {
    let mut handle = client.subscribe_ticks(symbol).await?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut seen = 0usize;
    loop {
        tokio::select! {
            event = handle.recv() => match event {
                Some(SubscriptionEvent::Update(body)) => {
                    if let Some(tick) = body.get("tick").cloned() {
                        let tick: Tick = serde_json::from_value(tick)?;
                        cli::print_tick(&tick);
                        seen += 1;
                    }
                    if count.is_some_and(|limit| seen >= limit) {
                        break;
                    }
                }
                Some(SubscriptionEvent::Stale) => {
                    warn!("Tick stream lost with the connection");
                    break;
                }
                Some(SubscriptionEvent::Ended(reason)) => {
                    info!("Tick stream ended: {}", reason);
                    break;
                }
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}
