//! Shared fakes for the integration tests: a scripted HTTP transport and an
//! in-process WebSocket connector.
//!
//! Test binaries include the crate modules via `#[path]`, then pull this file
//! in with `mod support;`. Not every test uses every fake.
#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::{ApiError, ApiRequest, ApiResponse, HttpTransport};
use crate::models::{TokenPair, User};
use crate::session::Session;
use crate::store::MemoryStore;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub fn user() -> User {
    User {
        id: "1".into(),
        email: "trader@example.com".into(),
        full_name: Some("Test Trader".into()),
        is_admin: false,
        plan: Some("pro".into()),
    }
}

pub fn logged_in_session(access: &str, refresh: Option<&str>) -> (Session, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let session = Session::new(store.clone());
    session.establish(
        Some(user()),
        TokenPair {
            access_token: access.into(),
            refresh_token: refresh.map(str::to_string),
        },
    );
    (session, store)
}

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

type Responder = Box<dyn Fn(&ApiRequest) -> ApiResponse + Send + Sync>;

/// Transport answering every request through a closure and recording it.
/// Yields once per call so concurrent requests interleave.
pub struct MockTransport {
    responder: Responder,
    calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<ApiRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, req: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.calls.lock().unwrap().push(req.clone());
        tokio::task::yield_now().await;
        Ok((self.responder)(req))
    }
}

pub fn respond(status: u16, body: Value) -> ApiResponse {
    ApiResponse { status, body }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Server side of one fake connection.
pub struct ServerEnd {
    pub url: Url,
    /// Frames the client sent.
    pub from_client: mpsc::Receiver<String>,
    /// Push frames to the client; drop to simulate the server closing.
    pub to_client: mpsc::Sender<String>,
}

impl ServerEnd {
    pub async fn send(&self, frame: Value) -> bool {
        self.to_client.send(frame.to_string()).await.is_ok()
    }

    /// Next frame the client sent, parsed.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).expect("client sent invalid JSON"))
    }

    /// Drain client frames already queued without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            out.push(serde_json::from_str(&text).expect("client sent invalid JSON"));
        }
        out
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    servers: Arc<Mutex<VecDeque<ServerEnd>>>,
    attempts: Arc<Mutex<u32>>,
    refuse: Arc<Mutex<bool>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }

    /// Make subsequent connects fail.
    pub fn refuse(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }

    /// Oldest connection not yet taken by the test.
    pub fn take_server(&self) -> Option<ServerEnd> {
        self.servers.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl crate::socket::Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<crate::socket::Connection, crate::socket::SocketError> {
        *self.attempts.lock().unwrap() += 1;
        if *self.refuse.lock().unwrap() {
            return Err(crate::socket::SocketError::Connection("refused".into()));
        }
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        self.servers.lock().unwrap().push_back(ServerEnd {
            url: url.clone(),
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(crate::socket::Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

pub fn socket_options(heartbeat: Duration) -> crate::socket::SocketOptions {
    crate::socket::SocketOptions {
        base_url: "ws://test.local".into(),
        heartbeat,
        backoff: crate::socket::Backoff {
            initial: Duration::from_millis(5_000),
            max: Duration::from_millis(60_000),
            multiplier: 2.0,
            jitter: Duration::ZERO,
            max_attempts: 3,
        },
    }
}
