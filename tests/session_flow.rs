//! End-to-end trading sessions against the scripted broker.

use deriv_trader::config::AppConfig;
use deriv_trader::domain::{BarrierSpec, ContractState, ContractType, DurationUnit, OrderSpec};
use deriv_trader::protocol::value_decimal;
use deriv_trader::transport::{MockTransport, ScriptedBroker};
use deriv_trader::{CommandOutcome, CommandParams, DerivClient, DerivError};
use rust_decimal_macros::dec;
use std::sync::Arc;

const TOKEN: &str = "a1-test-token";

fn config() -> AppConfig {
    let mut config = AppConfig::default_config("1089", Some(TOKEN.to_string()));
    config.connection.auto_reconnect = false;
    config
}

async fn ready_client(broker: &ScriptedBroker) -> (DerivClient, MockTransport) {
    let transport = broker.transport();
    let client = DerivClient::with_transport(config(), Arc::new(transport.clone()));
    client.start().await.unwrap();
    (client, transport)
}

fn put_order() -> OrderSpec {
    OrderSpec::new("R_100", dec!(8.5), 1, DurationUnit::Day, ContractType::Put)
}

#[tokio::test]
async fn test_place_modify_close_round_trip() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;

    let contract = client.place_order(put_order()).await.unwrap();
    assert_eq!(contract.id(), Some("C1"));
    assert_eq!(contract.state, ContractState::Open);
    assert_eq!(contract.proposal_id.as_deref(), Some("Q1"));
    assert_eq!(contract.buy_price, Some(dec!(8.5)));

    let proposal = &transport.sent_op("proposal")[0];
    assert_eq!(proposal["symbol"], "R_100");
    assert_eq!(proposal["contract_type"], "PUT");
    assert_eq!(proposal["duration_unit"], "d");
    let buy = &transport.sent_op("buy")[0];
    assert_eq!(buy["buy"], "Q1");

    // spot is 140
    let modified = client
        .modify_order("C1", Some("150.0"), Some("100.0"))
        .await
        .unwrap();
    assert_eq!(modified.state, ContractState::Open);
    assert_eq!(modified.barriers.take_profit, Some(dec!(150.00)));
    assert_eq!(modified.barriers.stop_loss, Some(dec!(100.00)));

    let limits = broker.limit_orders();
    assert_eq!(limits.len(), 1);
    assert_eq!(value_decimal(&limits[0]["take_profit"]), Some(dec!(150)));
    assert_eq!(value_decimal(&limits[0]["stop_loss"]), Some(dec!(100)));

    let settled = client.close_position("C1").await.unwrap();
    assert_eq!(settled.state, ContractState::Settled);
    assert!(settled.sold_for.is_some());
    assert!(broker.open_contracts().is_empty());
    assert!(client.orders().contract("C1").is_none());
    assert_eq!(client.orders().lock_count(), 0);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_percentage_limits_resolve_against_spot() {
    let broker = ScriptedBroker::new(TOKEN);
    broker.set_spot(dec!(100));
    let (client, _transport) = ready_client(&broker).await;

    client.place_order(put_order()).await.unwrap();
    let modified = client
        .modify_order("C1", Some("15%"), Some("10%"))
        .await
        .unwrap();

    assert_eq!(modified.barriers.take_profit, Some(dec!(115.00)));
    assert_eq!(modified.barriers.stop_loss, Some(dec!(90.00)));
    assert_eq!(modified.take_profit, Some(BarrierSpec::Percent(dec!(15))));
}

#[tokio::test]
async fn test_limits_on_place_go_through_modify() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;

    let spec = put_order().with_limits(Some(BarrierSpec::Absolute(dec!(160))), None);
    let contract = client.place_order(spec).await.unwrap();

    assert_eq!(contract.state, ContractState::Open);
    assert_eq!(contract.barriers.take_profit, Some(dec!(160.00)));
    assert_eq!(contract.barriers.stop_loss, None);
    assert_eq!(transport.sent_op("contract_update").len(), 1);
}

#[tokio::test]
async fn test_unknown_symbol_sends_no_quote() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;

    let spec = OrderSpec::new("NOPE", dec!(5), 1, DurationUnit::Day, ContractType::Call);
    let result = client.place_order(spec).await;

    assert!(matches!(result, Err(DerivError::InvalidSymbol(ref s)) if s == "NOPE"));
    assert!(transport.sent_op("proposal").is_empty());
}

#[tokio::test]
async fn test_invalid_parameters_fail_before_any_request() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;
    transport.clear_sent();

    let zero = OrderSpec::new("R_100", dec!(0), 1, DurationUnit::Day, ContractType::Call);
    assert!(matches!(
        client.place_order(zero).await,
        Err(DerivError::InvalidParameters(_))
    ));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_closed_market_surfaces_market_closed() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;

    let spec = OrderSpec::new("OTC_SPC", dec!(10), 1, DurationUnit::Day, ContractType::Call);
    let result = client.place_order(spec).await;

    assert!(matches!(result, Err(DerivError::MarketClosed(ref s)) if s == "OTC_SPC"));
    // not retried
    assert_eq!(transport.sent_op("buy").len(), 1);
    assert!(client.orders().contracts().is_empty());
}

#[tokio::test]
async fn test_modify_on_closed_market_leaves_contract_unchanged() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;
    client.place_order(put_order()).await.unwrap();

    broker.set_market_open("R_100", false);
    let result = client.modify_order("C1", Some("150"), None).await;

    assert!(matches!(result, Err(DerivError::MarketClosed(_))));
    assert!(transport.sent_op("contract_update").is_empty());
    let contract = client.orders().contract("C1").unwrap();
    assert_eq!(contract.state, ContractState::Open);
    assert_eq!(contract.barriers.take_profit, None);
}

#[tokio::test]
async fn test_out_of_range_limits_leave_contract_unchanged() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;
    client.place_order(put_order()).await.unwrap();

    let result = client
        .modify_order("C1", Some("79228162514264337593543950335%"), None)
        .await;
    assert!(matches!(result, Err(DerivError::InvalidParameters(_))));

    let result = client.modify_order("C1", None, Some("100%")).await;
    assert!(matches!(result, Err(DerivError::InvalidParameters(_))));

    assert!(transport.sent_op("contract_update").is_empty());
    let contract = client.orders().contract("C1").unwrap();
    assert_eq!(contract.state, ContractState::Open);
    assert_eq!(contract.barriers.take_profit, None);
    assert_eq!(contract.barriers.stop_loss, None);
}

#[tokio::test]
async fn test_failed_close_stays_open() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, _transport) = ready_client(&broker).await;
    client.place_order(put_order()).await.unwrap();

    broker.fail_op("sell", "InvalidSellContractProposal", "Resale is not offered.");
    let result = client.close_position("C1").await;
    match result {
        Err(DerivError::Server { code, .. }) => assert_eq!(code, "InvalidSellContractProposal"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        client.orders().contract("C1").unwrap().state,
        ContractState::Open
    );

    broker.clear_failure("sell");
    let settled = client.cancel_order("C1").await.unwrap();
    assert_eq!(settled.state, ContractState::Settled);
}

#[tokio::test]
async fn test_operations_on_unknown_contract() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;

    assert!(matches!(
        client.close_position("C404").await,
        Err(DerivError::ContractNotFound(_))
    ));
    assert!(matches!(
        client.modify_order("C404", Some("1"), None).await,
        Err(DerivError::ContractNotFound(_))
    ));
    assert!(matches!(
        client.cancel_order("C404").await,
        Err(DerivError::ContractNotFound(_))
    ));
    assert!(transport.sent_op("sell").is_empty());
    assert_eq!(client.orders().lock_count(), 0);
}

#[tokio::test]
async fn test_concurrent_modifies_on_one_contract_are_serialized() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;
    client.place_order(put_order()).await.unwrap();

    let (first, second) = tokio::join!(
        client.modify_order("C1", Some("150"), None),
        client.modify_order("C1", None, Some("120")),
    );

    first.unwrap();
    second.unwrap();
    let contract = client.orders().contract("C1").unwrap();
    assert_eq!(contract.state, ContractState::Open);
    assert_eq!(contract.barriers.take_profit, Some(dec!(150.00)));
    assert_eq!(contract.barriers.stop_loss, Some(dec!(120.00)));
    assert_eq!(transport.sent_op("contract_update").len(), 2);
}

#[tokio::test]
async fn test_different_contracts_close_concurrently() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, _transport) = ready_client(&broker).await;
    client.place_order(put_order()).await.unwrap();
    client.place_order(put_order()).await.unwrap();

    let (a, b) = tokio::join!(client.close_position("C1"), client.close_position("C2"));
    assert_eq!(a.unwrap().state, ContractState::Settled);
    assert_eq!(b.unwrap().state, ContractState::Settled);
    assert!(broker.open_contracts().is_empty());
}

#[tokio::test]
async fn test_market_data_is_cached() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;

    let symbols = client.fetch_active_symbols().await.unwrap();
    assert_eq!(symbols.len(), 2);
    let types = client.fetch_trade_types().await.unwrap();
    assert_eq!(types[0].market, "indices");
    assert_eq!(types[1].symbol, "R_100");
    client.place_order(put_order()).await.unwrap();
    assert_eq!(transport.sent_op("active_symbols").len(), 1);

    let offers = client.fetch_contracts_for("R_100").await.unwrap();
    assert_eq!(offers.len(), 2);
    assert_eq!(
        offers[0].min_duration_parts(),
        Some((1, DurationUnit::Day))
    );
    client.fetch_contracts_for("R_100").await.unwrap();
    assert_eq!(transport.sent_op("contracts_for").len(), 1);
}

#[tokio::test]
async fn test_balance_and_ticker() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker).await;

    let balance = client.fetch_balance().await.unwrap();
    assert_eq!(balance.balance, dec!(10000));
    assert_eq!(balance.currency, "USD");

    let tick = client.fetch_ticker("R_100").await.unwrap();
    assert_eq!(tick.symbol, "R_100");
    assert_eq!(tick.quote, dec!(140));
    let request = &transport.sent_op("ticks")[0];
    assert!(request.get("subscribe").is_none());
}

#[tokio::test]
async fn test_sync_portfolio_adopts_open_contracts() {
    let broker = ScriptedBroker::new(TOKEN);
    broker.seed_contract("C77", "R_100", "CALL", dec!(10));
    broker.seed_contract("C78", "R_100", "DIGITMATCH", dec!(3));
    let (client, transport) = ready_client(&broker).await;

    let portfolio = client.fetch_portfolio().await.unwrap();
    assert_eq!(portfolio.len(), 2);

    let adopted = client.sync_portfolio().await.unwrap();
    assert_eq!(adopted, vec!["C77".to_string()]);
    assert!(client.sync_portfolio().await.unwrap().is_empty());

    let contract = client.orders().contract("C77").unwrap();
    assert_eq!(contract.state, ContractState::Open);
    assert_eq!(contract.contract_type, ContractType::Call);

    let settled = client.close_position("C77").await.unwrap();
    assert_eq!(settled.state, ContractState::Settled);
    assert_eq!(transport.sent_op("sell")[0]["sell"], "C77");
}

#[tokio::test]
async fn test_process_command_opens_and_cancels() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, _transport) = ready_client(&broker).await;

    let params = CommandParams {
        quantity: Some(dec!(8.5)),
        duration: Some(1),
        ..CommandParams::default()
    };
    let contract = match client.process_command("short R_100", &params).await.unwrap() {
        CommandOutcome::Opened(contract) => contract,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(contract.contract_type, ContractType::Put);
    assert_eq!(contract.duration_unit, DurationUnit::Day);

    let cancel = CommandParams {
        contract_id: contract.contract_id.clone(),
        ..CommandParams::default()
    };
    match client.process_command("cancel", &cancel).await.unwrap() {
        CommandOutcome::Cancelled(settled) => assert_eq!(settled.state, ContractState::Settled),
        other => panic!("unexpected {other:?}"),
    }

    assert!(matches!(
        client.process_command("hold R_100", &params).await,
        Err(DerivError::InvalidParameters(_))
    ));
}

#[tokio::test]
async fn test_authorize_without_token_is_rejected() {
    let broker = ScriptedBroker::new(TOKEN);
    let transport = broker.transport();
    let client = DerivClient::with_transport(
        AppConfig::default_config("1089", None),
        Arc::new(transport.clone()),
    );

    client.connect().await.unwrap();
    assert!(matches!(
        client.authorize(None).await,
        Err(DerivError::InvalidParameters(_))
    ));
    assert!(transport.sent_op("authorize").is_empty());

    client.authorize(Some(TOKEN)).await.unwrap();
    assert!(client.state().is_ready());
}
