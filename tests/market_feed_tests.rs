/// Integration tests for the market data feed over an in-process connector.
///
/// Timing tests run on a paused clock and move it with `tokio::time::advance`.
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[path = "../src/api.rs"]
mod api;
#[path = "../src/config.rs"]
mod config;
#[path = "../src/market_feed.rs"]
mod market_feed;
#[path = "../src/models.rs"]
mod models;
#[path = "../src/requests.rs"]
mod requests;
#[path = "../src/session.rs"]
mod session;
#[path = "../src/socket.rs"]
mod socket;
#[path = "../src/store.rs"]
mod store;

mod support;

use market_feed::{MarketChannel, MarketEvent, MarketFeed, MarketParams};
use session::Session;
use socket::ConnectionStatus;
use support::{logged_in_session, settle, socket_options, MockConnector};

const HEARTBEAT: Duration = Duration::from_secs(30);

fn start(session: Session, connector: &MockConnector, symbols: &[&str]) -> MarketFeed {
    MarketFeed::spawn(
        MarketChannel::new("/ws/market"),
        MarketParams::new(symbols.iter().copied(), "1m"),
        true,
        session,
        Arc::new(connector.clone()),
        socket_options(HEARTBEAT),
    )
}

fn scheduled(attempt: u32, secs: u64) -> ConnectionStatus {
    ConnectionStatus::ReconnectScheduled {
        attempt,
        delay: Duration::from_secs(secs),
    }
}

// ---------------------------------------------------------------------------
// Subscribe / dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribes_with_token_and_tracks_acknowledgement() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;

    let mut server = connector.take_server().expect("feed connected");
    assert_eq!(server.url.path(), "/ws/market");
    assert_eq!(server.url.query(), Some("token=a1"));
    assert_eq!(
        server.recv_json().await.unwrap(),
        json!({"type": "subscribe_candles", "symbols": ["NSE:INFY"], "interval": "1m"})
    );
    assert_eq!(feed.status(), ConnectionStatus::Connected);
    assert!(feed.subscribed().is_empty());

    server
        .send(json!({"type": "candles_subscribed", "symbols": ["NSE:INFY"]}))
        .await;
    settle().await;
    assert_eq!(feed.subscribed(), vec!["NSE:INFY".to_string()]);

    feed.shutdown().await;
}

#[tokio::test]
async fn acknowledged_set_is_the_server_list_not_the_request() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY", "NSE:TCS"]);
    settle().await;

    let mut server = connector.take_server().unwrap();
    assert_eq!(
        server.recv_json().await.unwrap()["symbols"],
        json!(["NSE:INFY", "NSE:TCS"])
    );

    server
        .send(json!({"type": "candles_subscribed", "symbols": ["NSE:INFY"]}))
        .await;
    settle().await;
    assert_eq!(feed.subscribed(), vec!["NSE:INFY".to_string()]);

    feed.shutdown().await;
}

#[tokio::test]
async fn quotes_and_candles_update_state_and_emit_events() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    let mut events = feed.events();
    settle().await;
    let server = connector.take_server().unwrap();

    server
        .send(json!({"type": "quote", "symbol": "NSE:INFY",
                     "data": {"ltp": 1500.5, "bid": 1500.0, "ask": 1501.0}}))
        .await;
    server
        .send(json!({"type": "candle", "symbol": "NSE:INFY", "is_partial": true,
                     "data": {"timestamp": "2024-05-01T09:15:00", "open": 1498.0,
                              "high": 1502.0, "low": 1497.0, "close": 1500.5, "volume": 1200}}))
        .await;
    settle().await;

    match events.recv().await.unwrap() {
        MarketEvent::Quote { symbol, quote } => {
            assert_eq!(symbol, "NSE:INFY");
            assert_eq!(quote.last_price, 1500.5);
        }
        other => panic!("expected quote, got {other:?}"),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        MarketEvent::Candle { is_partial: true, .. }
    ));

    assert_eq!(feed.quote("NSE:INFY").unwrap().ask, Some(1501.0));
    let candle = feed.candle("NSE:INFY").unwrap();
    assert!(candle.is_partial);
    assert_eq!(candle.candle.high, 1502.0);

    feed.shutdown().await;
}

#[tokio::test]
async fn server_errors_and_malformed_frames_are_recorded() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;
    let server = connector.take_server().unwrap();

    server.send(json!({"type": "market_status", "open": true})).await;
    settle().await;
    assert_eq!(feed.last_error(), None);

    server.send(json!({"type": "error", "message": "Unknown symbol"})).await;
    settle().await;
    assert_eq!(feed.last_error().as_deref(), Some("Unknown symbol"));

    server.to_client.send("{not json".into()).await.unwrap();
    settle().await;
    assert!(feed.last_error().unwrap().starts_with("malformed frame"));
    // A bad frame does not cost the connection.
    assert_eq!(feed.status(), ConnectionStatus::Connected);

    feed.shutdown().await;
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_unsubscribes_closes_and_ignores_late_frames() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    let mut events = feed.events();
    let status = feed.watch_status();
    settle().await;

    let mut server = connector.take_server().unwrap();
    server.recv_json().await.unwrap();

    feed.shutdown().await;

    assert_eq!(
        server.drain(),
        vec![json!({"type": "unsubscribe_candles", "symbols": ["NSE:INFY"], "interval": "1m"})]
    );
    assert!(server.from_client.recv().await.is_none(), "socket still open");
    assert!(!server.send(json!({"type": "quote", "symbol": "NSE:INFY", "data": {"ltp": 1.0}})).await);
    assert!(events.try_recv().is_err());
    assert_eq!(*status.borrow(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn emptying_the_symbol_list_tears_down() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;
    let mut server = connector.take_server().unwrap();
    server.recv_json().await.unwrap();

    feed.update(MarketParams::new(Vec::<String>::new(), "1m"));
    settle().await;

    assert_eq!(server.drain()[0]["type"], "unsubscribe_candles");
    assert_eq!(feed.status(), ConnectionStatus::Idle);
    assert_eq!(connector.attempts(), 1);

    feed.shutdown().await;
}

#[tokio::test]
async fn changing_symbols_resubscribes_on_a_fresh_connection() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;
    let mut first = connector.take_server().unwrap();
    first.recv_json().await.unwrap();
    first
        .send(json!({"type": "candles_subscribed", "symbols": ["NSE:INFY"]}))
        .await;
    settle().await;

    feed.update(MarketParams::new(["NSE:TCS", "NSE:INFY"], "1m"));
    settle().await;

    assert_eq!(
        first.drain(),
        vec![json!({"type": "unsubscribe_candles", "symbols": ["NSE:INFY"], "interval": "1m"})]
    );
    let mut second = connector.take_server().expect("reconnected");
    assert_eq!(
        second.recv_json().await.unwrap()["symbols"],
        json!(["NSE:TCS", "NSE:INFY"])
    );
    // Acknowledgements belong to the old connection.
    assert!(feed.subscribed().is_empty());

    feed.shutdown().await;
}

#[tokio::test]
async fn missing_token_leaves_feed_failed_without_connecting() {
    let session = Session::new(Arc::new(store::MemoryStore::new()));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;

    assert_eq!(connector.attempts(), 0);
    assert_eq!(
        feed.status(),
        ConnectionStatus::Failed("not authenticated".into())
    );
    assert!(feed.last_error().is_some());

    feed.shutdown().await;
}

// ---------------------------------------------------------------------------
// Reconnect
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnect_fires_after_five_seconds_and_not_before() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;
    let server = connector.take_server().unwrap();
    server
        .send(json!({"type": "candles_subscribed", "symbols": ["NSE:INFY"]}))
        .await;
    settle().await;

    drop(server);
    settle().await;
    assert_eq!(feed.status(), scheduled(1, 5));
    assert!(feed.subscribed().is_empty());

    tokio::time::advance(Duration::from_millis(4_999)).await;
    settle().await;
    assert_eq!(connector.attempts(), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(feed.status(), ConnectionStatus::Connected);

    let mut server = connector.take_server().unwrap();
    assert_eq!(server.recv_json().await.unwrap()["type"], "subscribe_candles");

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabling_cancels_the_scheduled_reconnect() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;
    drop(connector.take_server().unwrap());
    settle().await;
    assert_eq!(feed.status(), scheduled(1, 5));

    feed.set_enabled(false);
    settle().await;
    assert_eq!(feed.status(), ConnectionStatus::Idle);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(connector.attempts(), 1);

    feed.set_enabled(true);
    settle().await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(feed.status(), ConnectionStatus::Connected);

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_then_gives_up() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;

    connector.refuse(true);
    drop(connector.take_server().unwrap());
    settle().await;
    assert_eq!(feed.status(), scheduled(1, 5));

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(feed.status(), scheduled(2, 10));

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(feed.status(), scheduled(3, 20));

    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    assert!(matches!(feed.status(), ConnectionStatus::Failed(_)));
    assert_eq!(connector.attempts(), 4);

    // Stays down until asked.
    tokio::time::advance(Duration::from_secs(600)).await;
    settle().await;
    assert_eq!(connector.attempts(), 4);

    connector.refuse(false);
    feed.reconnect();
    settle().await;
    assert_eq!(feed.status(), ConnectionStatus::Connected);

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_accept_then_close_still_backs_off_to_failed() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;

    drop(connector.take_server().unwrap());
    settle().await;
    assert_eq!(feed.status(), scheduled(1, 5));

    for (wait, next) in [(5, scheduled(2, 10)), (10, scheduled(3, 20))] {
        tokio::time::advance(Duration::from_secs(wait)).await;
        settle().await;
        drop(connector.take_server().expect("reconnected"));
        settle().await;
        assert_eq!(feed.status(), next);
    }

    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    drop(connector.take_server().unwrap());
    settle().await;
    assert!(matches!(feed.status(), ConnectionStatus::Failed(_)));
    assert_eq!(connector.attempts(), 4);

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_live_connection_resets_the_backoff() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;

    drop(connector.take_server().unwrap());
    settle().await;
    assert_eq!(feed.status(), scheduled(1, 5));

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    let server = connector.take_server().unwrap();
    server
        .send(json!({"type": "candles_subscribed", "symbols": ["NSE:INFY"]}))
        .await;
    settle().await;
    drop(server);
    settle().await;
    assert_eq!(feed.status(), scheduled(1, 5));

    feed.shutdown().await;
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn answered_pings_keep_the_connection() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;
    let mut server = connector.take_server().unwrap();
    server.recv_json().await.unwrap();

    for _ in 0..3 {
        tokio::time::advance(HEARTBEAT).await;
        settle().await;
        assert_eq!(server.recv_json().await.unwrap(), json!({"type": "ping"}));
        server.send(json!({"type": "pong"})).await;
        settle().await;
    }
    assert_eq!(feed.status(), ConnectionStatus::Connected);
    assert_eq!(connector.attempts(), 1);

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_ping_drops_a_half_open_connection() {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let connector = MockConnector::new();
    let feed = start(session, &connector, &["NSE:INFY"]);
    settle().await;
    let mut server = connector.take_server().unwrap();
    server.recv_json().await.unwrap();

    tokio::time::advance(HEARTBEAT).await;
    settle().await;
    assert_eq!(server.recv_json().await.unwrap(), json!({"type": "ping"}));
    assert_eq!(feed.status(), ConnectionStatus::Connected);

    tokio::time::advance(HEARTBEAT).await;
    settle().await;
    assert_eq!(feed.status(), scheduled(1, 5));

    feed.shutdown().await;
}
