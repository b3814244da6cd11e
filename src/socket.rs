/// socket.rs – Resilient subscription socket shared by the realtime feeds.
///
/// One background task per feed owns the WebSocket connection and runs the
/// connection state machine:
///
///   idle → connecting → connected → (lost) → reconnect-scheduled → connecting
///
/// What a feed subscribes to, and how inbound frames change its state, is
/// supplied by a `Channel` implementation; the market and strategy feeds are
/// two instances of the same socket. Callers talk to the task through a
/// `SubscriptionSocket` handle: commands go in over an mpsc channel, state is
/// read from a shared `RwLock`, connection status is published on a `watch`
/// channel and per-frame events on a `broadcast` channel.
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Url;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::{ReconnectConfig, SocketConfig};
use crate::session::Session;

const EVENT_CHANNEL_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// Errors / status
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("invalid socket URL: {0}")]
    Url(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("no access token – log in first")]
    NotAuthenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    /// Disabled or nothing to subscribe to.
    Idle,
    Connecting,
    Connected,
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted or no credentials; waits for a command.
    Failed(String),
    /// Torn down by `shutdown`.
    Closed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn label(&self) -> String {
        match self {
            ConnectionStatus::Idle => "idle".into(),
            ConnectionStatus::Connecting => "connecting".into(),
            ConnectionStatus::Connected => "connected".into(),
            ConnectionStatus::ReconnectScheduled { attempt, delay } => {
                format!("retry #{attempt} in {:.1}s", delay.as_secs_f64())
            }
            ConnectionStatus::Failed(reason) => format!("failed: {reason}"),
            ConnectionStatus::Closed => "closed".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Capped exponential backoff with additive jitter.
///
/// The jitter is only ever added, so no attempt fires before its base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    /// 0 = retry forever.
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.initial_delay_ms),
            max: Duration::from_millis(cfg.max_delay_ms),
            multiplier: cfg.multiplier,
            jitter: Duration::from_millis(cfg.jitter_ms),
            max_attempts: cfg.max_attempts,
        }
    }

    /// Base delay (without jitter) before the 1-based `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Delay before the 1-based `attempt`, or `None` once attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts > 0 && attempt > self.max_attempts {
            return None;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        Some(self.base_delay(attempt) + jitter)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// An open connection as a pair of text-frame channels. Dropping `outgoing`
/// closes the socket; `incoming` yields `None` once the server side is gone.
pub struct Connection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Connection, SocketError>;
}

/// tokio-tungstenite connector; one writer and one reader task per connection.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, SocketError> {
        let (ws, _) = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(SocketError::Connection(e.to_string())),
            Err(_) => return Err(SocketError::Timeout),
        };

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, in_rx) = mpsc::channel::<String>(512);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!("WebSocket write failed: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("WebSocket closed by server: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Outcome of applying one inbound frame.
#[derive(Debug)]
pub enum Dispatch<E> {
    Pong,
    /// State changed; nothing to broadcast.
    Applied,
    /// State changed; broadcast the event.
    Event(E),
    /// Addressed to a different subscription.
    Filtered,
    /// Well-formed frame of a type this feed does not handle.
    Ignored,
    /// Server-reported error, already recorded in state.
    ServerError(String),
}

/// Everything that distinguishes one feed from another.
pub trait Channel: Send + Sync + 'static {
    /// Feed inputs (symbol set, subscription scope, ...).
    type Params: Clone + Debug + PartialEq + Send + Sync + 'static;
    type Outbound: Serialize;
    /// Tagged enum parsed from each text frame.
    type Inbound: DeserializeOwned;
    type State: Send + Sync + 'static;
    type Event: Clone + Debug + Send + 'static;

    fn name(&self) -> &'static str;
    fn path(&self) -> &str;
    fn initial_state(&self) -> Self::State;
    /// True when `params` leaves nothing to subscribe to.
    fn is_idle(&self, params: &Self::Params) -> bool;
    fn subscribe(&self, params: &Self::Params) -> Vec<Self::Outbound>;
    fn unsubscribe(&self, params: &Self::Params) -> Vec<Self::Outbound>;
    fn ping(&self) -> Self::Outbound;
    fn dispatch(
        &self,
        params: &Self::Params,
        state: &mut Self::State,
        frame: Self::Inbound,
    ) -> Dispatch<Self::Event>;
    fn record_error(&self, state: &mut Self::State, message: String);
    /// Called whenever a connection ends, for state that does not survive it.
    fn on_disconnect(&self, _state: &mut Self::State) {}
}

/// Parse one text frame into the feed's tagged enum.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, SocketError> {
    serde_json::from_str(text).map_err(|e| SocketError::Malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// WebSocket origin; the channel path is appended.
    pub base_url: String,
    pub heartbeat: Duration,
    pub backoff: Backoff,
}

impl SocketOptions {
    pub fn from_config(sockets: &SocketConfig, reconnect: &ReconnectConfig) -> Self {
        Self {
            base_url: sockets.ws_url.clone(),
            heartbeat: sockets.heartbeat(),
            backoff: Backoff::from_config(reconnect),
        }
    }
}

enum Command<P> {
    Update(P),
    SetEnabled(bool),
    Reconnect,
    Shutdown(Option<oneshot::Sender<()>>),
}

pub struct SubscriptionSocket<C: Channel> {
    commands: mpsc::UnboundedSender<Command<C::Params>>,
    state: Arc<RwLock<C::State>>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<C::Event>,
    task: Option<JoinHandle<()>>,
}

impl<C: Channel> SubscriptionSocket<C> {
    /// Start the feed's background task. Must be called inside a tokio runtime.
    pub fn spawn(
        channel: C,
        params: C::Params,
        enabled: bool,
        session: Session,
        connector: Arc<dyn Connector>,
        options: SocketOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(channel.initial_state()));

        let driver = Driver {
            channel,
            params,
            enabled,
            session,
            connector,
            options,
            state: Arc::clone(&state),
            status: status_tx,
            events: events_tx.clone(),
            commands: cmd_rx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            commands: cmd_tx,
            state,
            status: status_rx,
            events: events_tx,
            task: Some(task),
        }
    }

    /// Replace the feed inputs. A change reconnects with the new inputs;
    /// inputs with nothing to subscribe to tear the connection down.
    pub fn update(&self, params: C::Params) {
        let _ = self.commands.send(Command::Update(params));
    }

    pub fn set_enabled(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetEnabled(enabled));
    }

    /// Retry now, e.g. after `Failed` or a fresh login.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<C::Event> {
        self.events.subscribe()
    }

    pub fn read<R>(&self, f: impl FnOnce(&C::State) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(|p| p.into_inner());
        f(&guard)
    }

    /// Unsubscribe, close the socket, cancel timers, and wait for the task.
    pub async fn shutdown(mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<C: Channel> Drop for SubscriptionSocket<C> {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Command::Shutdown(None));
        }
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

enum Control {
    /// Nothing relevant changed.
    Stay,
    /// Inputs or enablement changed; re-evaluate from the top.
    Changed,
    Stop(Option<oneshot::Sender<()>>),
}

enum SessionEnd {
    Lost(String),
    Changed,
    Stop(Option<oneshot::Sender<()>>),
}

struct Driver<C: Channel> {
    channel: C,
    params: C::Params,
    enabled: bool,
    session: Session,
    connector: Arc<dyn Connector>,
    options: SocketOptions,
    state: Arc<RwLock<C::State>>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<C::Event>,
    commands: mpsc::UnboundedReceiver<Command<C::Params>>,
}

impl<C: Channel> Driver<C> {
    async fn run(mut self) {
        let name = self.channel.name();
        let mut attempt: u32 = 0;

        loop {
            if !self.active() {
                attempt = 0;
                self.set_status(ConnectionStatus::Idle);
                match self.wait_for_command().await {
                    Some(ack) => return self.finish(ack),
                    None => continue,
                }
            }

            self.set_status(ConnectionStatus::Connecting);
            let end = match self.open().await {
                Ok(conn) => {
                    self.set_status(ConnectionStatus::Connected);
                    self.run_connection(conn, &mut attempt).await
                }
                Err(SocketError::NotAuthenticated) => {
                    warn!("{name} socket: no access token – waiting");
                    self.with_state(|c, s| c.record_error(s, "not authenticated".into()));
                    self.set_status(ConnectionStatus::Failed("not authenticated".into()));
                    match self.wait_for_command().await {
                        Some(ack) => return self.finish(ack),
                        None => continue,
                    }
                }
                Err(e) => SessionEnd::Lost(e.to_string()),
            };

            let reason = match end {
                SessionEnd::Changed => continue,
                SessionEnd::Stop(ack) => return self.finish(ack),
                SessionEnd::Lost(reason) => reason,
            };

            self.with_state(|c, s| c.on_disconnect(s));
            if !self.active() {
                continue;
            }

            attempt += 1;
            let Some(delay) = self.options.backoff.delay(attempt) else {
                let msg = format!("gave up after {} reconnect attempts", attempt - 1);
                warn!("{name} socket: {msg} (last error: {reason})");
                self.with_state(|c, s| c.record_error(s, msg.clone()));
                self.set_status(ConnectionStatus::Failed(msg));
                attempt = 0;
                match self.wait_for_command().await {
                    Some(ack) => return self.finish(ack),
                    None => continue,
                }
            };

            info!("{name} socket lost ({reason}) – reconnecting in {delay:?} (attempt {attempt})");
            self.set_status(ConnectionStatus::ReconnectScheduled { attempt, delay });

            let timer = tokio::time::sleep(delay);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => break,
                    cmd = self.commands.recv() => match self.apply(cmd) {
                        Control::Stay => {}
                        Control::Changed => {
                            debug!("{name} socket: scheduled reconnect cancelled");
                            attempt = 0;
                            break;
                        }
                        Control::Stop(ack) => return self.finish(ack),
                    },
                }
            }
        }
    }

    fn active(&self) -> bool {
        self.enabled && !self.channel.is_idle(&self.params)
    }

    fn apply(&mut self, cmd: Option<Command<C::Params>>) -> Control {
        match cmd {
            // Every handle is gone: behave like shutdown.
            None => Control::Stop(None),
            Some(Command::Update(params)) => {
                if params == self.params {
                    Control::Stay
                } else {
                    self.params = params;
                    Control::Changed
                }
            }
            Some(Command::SetEnabled(enabled)) => {
                if enabled == self.enabled {
                    Control::Stay
                } else {
                    self.enabled = enabled;
                    Control::Changed
                }
            }
            Some(Command::Reconnect) => Control::Changed,
            Some(Command::Shutdown(ack)) => Control::Stop(ack),
        }
    }

    /// Block until a command changes something. `Some(ack)` means stop.
    async fn wait_for_command(&mut self) -> Option<Option<oneshot::Sender<()>>> {
        loop {
            let cmd = self.commands.recv().await;
            match self.apply(cmd) {
                Control::Stay => {}
                Control::Changed => return None,
                Control::Stop(ack) => return Some(ack),
            }
        }
    }

    fn url(&self) -> Result<Url, SocketError> {
        let token = self
            .session
            .access_token()
            .ok_or(SocketError::NotAuthenticated)?;
        let raw = format!(
            "{}{}",
            self.options.base_url.trim_end_matches('/'),
            self.channel.path()
        );
        let mut url = Url::parse(&raw).map_err(|e| SocketError::Url(format!("{raw}: {e}")))?;
        url.query_pairs_mut().append_pair("token", &token);
        Ok(url)
    }

    async fn open(&self) -> Result<Connection, SocketError> {
        let url = self.url()?;
        info!(
            "Connecting to {} socket: {}{}",
            self.channel.name(),
            self.options.base_url.trim_end_matches('/'),
            self.channel.path()
        );
        self.connector.connect(&url).await
    }

    /// Drive one open connection. `attempt` is reset once the server sends
    /// its first frame, so a socket that accepts and immediately closes
    /// still counts towards `max_attempts`.
    async fn run_connection(&mut self, mut conn: Connection, attempt: &mut u32) -> SessionEnd {
        let name = self.channel.name();

        let frames: Vec<String> = self
            .channel
            .subscribe(&self.params)
            .iter()
            .map(encode)
            .collect();
        for text in frames {
            if conn.outgoing.send(text).await.is_err() {
                return SessionEnd::Lost("closed before subscribe".into());
            }
        }
        info!("{name} socket connected – subscribing {:?}", self.params);

        let period = self.options.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    let previous = self.params.clone();
                    match self.apply(cmd) {
                        Control::Stay => {}
                        Control::Changed => {
                            self.teardown(conn, &previous).await;
                            return SessionEnd::Changed;
                        }
                        Control::Stop(ack) => {
                            self.teardown(conn, &previous).await;
                            return SessionEnd::Stop(ack);
                        }
                    }
                }

                frame = conn.incoming.recv() => match frame {
                    Some(text) => {
                        // Any inbound frame proves the connection is alive.
                        awaiting_pong = false;
                        *attempt = 0;
                        self.handle_frame(&text);
                    }
                    None => return SessionEnd::Lost("closed by server".into()),
                },

                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        warn!("{name} socket: no pong within {period:?}");
                        return SessionEnd::Lost("heartbeat timeout".into());
                    }
                    let ping = encode(&self.channel.ping());
                    if conn.outgoing.send(ping).await.is_err() {
                        return SessionEnd::Lost("closed while sending ping".into());
                    }
                    awaiting_pong = true;
                }
            }
        }
    }

    /// Unsubscribe and close. Consumes the connection, so frames still in
    /// flight are never read.
    async fn teardown(&self, conn: Connection, params: &C::Params) {
        let frames: Vec<String> = self.channel.unsubscribe(params).iter().map(encode).collect();
        for text in frames {
            if conn.outgoing.send(text).await.is_err() {
                break;
            }
        }
        drop(conn);
        self.with_state(|c, s| c.on_disconnect(s));
        debug!("{} socket torn down", self.channel.name());
    }

    fn handle_frame(&self, text: &str) {
        let name = self.channel.name();
        let frame = match decode_frame::<C::Inbound>(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("{name} socket: {e}");
                self.with_state(|c, s| c.record_error(s, e.to_string()));
                return;
            }
        };

        let outcome = self.with_state(|c, s| c.dispatch(&self.params, s, frame));
        match outcome {
            Dispatch::Pong | Dispatch::Applied => {}
            Dispatch::Event(ev) => {
                // No receivers is fine.
                let _ = self.events.send(ev);
            }
            Dispatch::Filtered => {}
            Dispatch::Ignored => {
                debug!("{name} socket: ignoring frame {}", truncate(text, 120));
            }
            Dispatch::ServerError(msg) => warn!("{name} socket server error: {msg}"),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&C, &mut C::State) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        f(&self.channel, &mut guard)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn finish(&self, ack: Option<oneshot::Sender<()>>) {
        self.set_status(ConnectionStatus::Closed);
        debug!("{} socket task finished", self.channel.name());
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

fn encode<T: Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter_ms: u64, max_attempts: u32) -> Backoff {
        Backoff {
            initial: Duration::from_millis(5_000),
            max: Duration::from_millis(60_000),
            multiplier: 2.0,
            jitter: Duration::from_millis(jitter_ms),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = backoff(0, 0);
        assert_eq!(b.delay(1), Some(Duration::from_secs(5)));
        assert_eq!(b.delay(2), Some(Duration::from_secs(10)));
        assert_eq!(b.delay(3), Some(Duration::from_secs(20)));
        assert_eq!(b.delay(5), Some(Duration::from_secs(60)));
        assert_eq!(b.delay(500), Some(Duration::from_secs(60)));
    }

    #[test]
    fn backoff_jitter_is_additive() {
        let b = backoff(1_000, 0);
        for _ in 0..100 {
            let d = b.delay(1).unwrap();
            assert!(d >= Duration::from_secs(5));
            assert!(d <= Duration::from_secs(6));
        }
    }

    #[test]
    fn backoff_stops_after_max_attempts() {
        let b = backoff(0, 3);
        assert!(b.delay(3).is_some());
        assert!(b.delay(4).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
