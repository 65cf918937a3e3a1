//! Correlation, subscriptions and connection loss through the public client.

use deriv_trader::config::AppConfig;
use deriv_trader::protocol::Request;
use deriv_trader::transport::{MockTransport, ScriptedBroker};
use deriv_trader::{ConnectionState, DerivClient, DerivError, SubscriptionEvent};
use futures_util::future::join_all;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

const TOKEN: &str = "a1-test-token";
const WAIT: Duration = Duration::from_secs(2);

fn config(auto_reconnect: bool) -> AppConfig {
    let mut config = AppConfig::default_config("1089", Some(TOKEN.to_string()));
    config.connection.auto_reconnect = auto_reconnect;
    config.connection.reconnect_base_ms = 10;
    config.connection.reconnect_cap_ms = 50;
    config
}

async fn ready_client(broker: &ScriptedBroker, auto_reconnect: bool) -> (DerivClient, MockTransport) {
    let transport = broker.transport();
    let client = DerivClient::with_transport(config(auto_reconnect), Arc::new(transport.clone()));
    client.start().await.unwrap();
    (client, transport)
}

async fn until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_requests_before_authorize_are_not_ready() {
    let broker = ScriptedBroker::new(TOKEN);
    let transport = broker.transport();
    let client = DerivClient::with_transport(config(false), Arc::new(transport.clone()));

    match client.fetch_balance().await {
        Err(DerivError::NotReady { state }) => assert_eq!(state, ConnectionState::Disconnected),
        other => panic!("unexpected {other:?}"),
    }

    client.connect().await.unwrap();
    assert!(matches!(
        client.fetch_portfolio().await,
        Err(DerivError::NotReady { .. })
    ));
    assert!(matches!(
        client.subscribe_ticks("R_100").await,
        Err(DerivError::NotReady { .. })
    ));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_match_their_own_responses() {
    const N: usize = 16;
    let held: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let buffer = Arc::clone(&held);

    // Authorize normally, then hold every balance reply and release them reversed
    let transport = MockTransport::with_responder(move |request| {
        let req_id = request["req_id"].clone();
        if request.get("authorize").is_some() {
            return vec![json!({
                "msg_type": "authorize",
                "req_id": req_id,
                "authorize": {"loginid": "CR1", "currency": "USD"}
            })];
        }
        let mut held = buffer.lock().unwrap();
        held.push(json!({
            "msg_type": "balance",
            "req_id": req_id,
            "balance": {"balance": req_id, "currency": "USD"}
        }));
        if held.len() == N {
            held.drain(..).rev().collect()
        } else {
            Vec::new()
        }
    });
    let client = DerivClient::with_transport(config(false), Arc::new(transport.clone()));
    client.start().await.unwrap();

    let correlator = client.correlator();
    let mut handles = Vec::new();
    for _ in 0..N {
        handles.push(correlator.issue(Request::balance()).await.unwrap());
    }
    let ids: Vec<u64> = handles.iter().map(|h| h.req_id()).collect();
    let responses = join_all(handles.into_iter().map(|h| h.wait())).await;

    for (req_id, response) in ids.iter().zip(responses) {
        let response = response.unwrap();
        assert_eq!(response.req_id, *req_id);
        assert_eq!(response.body["balance"]["balance"], json!(req_id));
    }

    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), N);
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_disconnect_fails_every_pending_request() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker, false).await;
    broker.silence("balance");

    let pending = async {
        join_all((0..3).map(|_| client.fetch_balance())).await
    };
    let drop_later = async {
        until(|| client.correlator().pending_count() == 3).await;
        transport.drop_link("server went away");
    };
    let (results, _) = tokio::join!(pending, drop_later);

    assert_eq!(results.len(), 3);
    for result in results {
        assert!(matches!(result, Err(DerivError::ConnectionLost)));
    }
    assert_eq!(client.correlator().pending_count(), 0);
    until(|| client.state() == ConnectionState::Disconnected).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_times_out() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, _transport) = ready_client(&broker, false).await;
    broker.silence("portfolio");

    match client.fetch_portfolio().await {
        Err(DerivError::RequestTimeout { .. }) => {}
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.correlator().pending_count(), 0);
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_duplicate_subscribe_shares_one_stream() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker, false).await;

    let mut first = client.subscribe_ticks("R_100").await.unwrap();
    let mut second = client.subscribe_ticks("R_100").await.unwrap();
    assert_eq!(transport.sent_op("ticks").len(), 1);

    // initial snapshot from the subscribe response
    match timeout(WAIT, first.recv()).await.unwrap() {
        Some(SubscriptionEvent::Update(body)) => assert_eq!(body["tick"]["symbol"], "R_100"),
        other => panic!("unexpected {other:?}"),
    }

    transport.inject(broker.tick_push("R_100", dec!(141.25)).unwrap());
    for handle in [&mut first, &mut second] {
        match timeout(WAIT, handle.recv()).await.unwrap() {
            Some(SubscriptionEvent::Update(body)) => {
                assert_eq!(body["tick"]["quote"], json!(141.25))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // served from the stream, no extra request
    let tick = client.fetch_ticker("R_100").await.unwrap();
    assert_eq!(tick.quote, dec!(141.25));
    assert_eq!(transport.sent_op("ticks").len(), 1);

    assert!(client.unsubscribe_ticks("R_100").await.unwrap());
    assert!(matches!(
        timeout(WAIT, first.recv()).await.unwrap(),
        Some(SubscriptionEvent::Ended(_))
    ));
    assert!(!client.unsubscribe_ticks("R_100").await.unwrap());
    assert_eq!(transport.sent_op("forget").len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_all_ticks_clears_every_stream() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker, false).await;

    client.subscribe_ticks("R_100").await.unwrap();
    client.subscribe_ticks("OTC_SPC").await.unwrap();
    assert_eq!(client.correlator().registry().len(), 2);

    let removed = client.unsubscribe_all_ticks().await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(client.correlator().registry().is_empty());
    assert_eq!(transport.sent_op("forget_all")[0]["forget_all"], "ticks");
}

#[tokio::test]
async fn test_subscriptions_go_stale_on_disconnect() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker, false).await;

    let mut handle = client.subscribe_ticks("R_100").await.unwrap();
    assert!(matches!(
        timeout(WAIT, handle.recv()).await.unwrap(),
        Some(SubscriptionEvent::Update(_))
    ));

    transport.drop_link("network down");
    assert!(matches!(
        timeout(WAIT, handle.recv()).await.unwrap(),
        Some(SubscriptionEvent::Stale)
    ));
    until(|| client.state() == ConnectionState::Disconnected).await;
    assert!(client.correlator().registry().is_empty());
}

#[tokio::test]
async fn test_reconnects_and_reauthorizes_after_drop() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker, true).await;
    client.subscribe_ticks("R_100").await.unwrap();

    transport.drop_link("network blip");
    until(|| transport.open_count() >= 2).await;
    until(|| client.state() == ConnectionState::Ready).await;

    assert_eq!(transport.sent_op("authorize").len(), 2);
    // streams are not carried over; the caller subscribes again
    assert!(client.correlator().registry().is_empty());
    client.subscribe_ticks("R_100").await.unwrap();
    assert_eq!(transport.sent_op("ticks").len(), 2);

    client.shutdown().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_replies_to_failed_requests_are_not_bound_after_reconnect() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker, true).await;
    broker.silence("balance");

    let pending = async { join_all((0..3).map(|_| client.fetch_balance())).await };
    let drop_later = async {
        until(|| client.correlator().pending_count() == 3).await;
        transport.drop_link("network blip");
    };
    let (results, _) = tokio::join!(pending, drop_later);
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(DerivError::ConnectionLost))));
    let failed_ids: Vec<Value> = transport
        .sent_op("balance")
        .iter()
        .map(|frame| frame["req_id"].clone())
        .collect();

    until(|| transport.open_count() >= 2).await;
    until(|| client.state() == ConnectionState::Ready).await;

    let handle = client.correlator().issue(Request::balance()).await.unwrap();
    let fresh_id = handle.req_id();
    assert!(!failed_ids.contains(&json!(fresh_id)));

    // The old replies show up late on the new link, ahead of the real one
    for (n, req_id) in failed_ids.iter().enumerate() {
        transport.inject(json!({
            "msg_type": "balance",
            "req_id": req_id,
            "balance": {"balance": n, "currency": "USD"}
        }));
    }
    transport.inject(json!({
        "msg_type": "balance",
        "req_id": fresh_id,
        "balance": {"balance": 777, "currency": "USD"}
    }));

    let response = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(response.req_id, fresh_id);
    assert_eq!(response.body["balance"]["balance"], json!(777));
    assert_eq!(client.correlator().pending_count(), 0);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_unsubscribes_and_closes() {
    let broker = ScriptedBroker::new(TOKEN);
    let (client, transport) = ready_client(&broker, true).await;
    client.subscribe_ticks("R_100").await.unwrap();

    client.shutdown().await.unwrap();

    assert_eq!(transport.sent_op("forget_all").len(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.open_count(), 1);
}
