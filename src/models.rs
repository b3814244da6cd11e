/// models.rs – Data types shared by the REST client, socket feeds, and dashboard.
///
/// Backend-owned records are deserialised leniently (`#[serde(default)]`)
/// because the client only holds transient copies of them.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Accept identifiers sent either as JSON strings or as integers.
pub fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or integer id, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Auth / session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub is_admin: bool,
    pub plan: Option<String>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    /// Refresh responses may omit this; the previous refresh token is kept.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    #[serde(default)]
    pub user: Option<User>,
}

/// Persisted picture of the session, stored under the `auth-storage` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSnapshot {
    pub user: Option<User>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub is_authenticated: bool,
}

impl SessionSnapshot {
    pub fn new(user: Option<User>, access: Option<String>, refresh: Option<String>) -> Self {
        let is_authenticated = access.is_some() && refresh.is_some();
        Self {
            user,
            access_token: access,
            refresh_token: refresh,
            is_authenticated,
        }
    }

    /// True when both tokens are present and the flag agrees with them.
    pub fn is_consistent(&self) -> bool {
        self.is_authenticated == (self.access_token.is_some() && self.refresh_token.is_some())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quote {
    #[serde(alias = "ltp", alias = "last")]
    pub last_price: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    #[serde(alias = "prev_close")]
    pub close: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Candle {
    #[serde(alias = "time", alias = "ts")]
    pub timestamp: Value,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }
}

/// The latest candle per symbol; partial and completed bars both land here.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentCandle {
    pub candle: Candle,
    pub is_partial: bool,
}

// ---------------------------------------------------------------------------
// Strategy status stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
    Paused,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Stopped => "stopped",
            SubscriptionStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyStatusUpdate {
    #[serde(deserialize_with = "id_string")]
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub message: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PnlUpdate {
    #[serde(deserialize_with = "id_string")]
    pub subscription_id: String,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: Option<f64>,
    pub day_pnl: Option<f64>,
    pub timestamp: Option<String>,
}

impl PnlUpdate {
    pub fn total(&self) -> f64 {
        self.total_pnl
            .unwrap_or(self.realized_pnl + self.unrealized_pnl)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderUpdate {
    #[serde(deserialize_with = "id_string")]
    pub subscription_id: String,
    #[serde(deserialize_with = "id_string")]
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: String,
    /// Simulated order that never reached a broker.
    pub dry_run: bool,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionUpdate {
    #[serde(deserialize_with = "id_string")]
    pub subscription_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub average_price: f64,
    pub last_price: Option<f64>,
    pub pnl: Option<f64>,
    pub timestamp: Option<String>,
}

/// Order/position activity kept in the strategy feed's ring buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEvent {
    Order(OrderUpdate),
    Position(PositionUpdate),
}

impl StrategyEvent {
    pub fn subscription_id(&self) -> &str {
        match self {
            StrategyEvent::Order(o) => &o.subscription_id,
            StrategyEvent::Position(p) => &p.subscription_id,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            StrategyEvent::Order(o) => format!(
                "{}{} {} {} x{} @ {}",
                if o.dry_run { "[DRY] " } else { "" },
                o.status,
                o.side,
                o.symbol,
                o.quantity,
                o.price.map(|p| format!("{p:.2}")).unwrap_or_else(|| "MKT".into()),
            ),
            StrategyEvent::Position(p) => format!(
                "POS {} qty={} avg={:.2} pnl={}",
                p.symbol,
                p.quantity,
                p.average_price,
                p.pnl.map(|v| format!("{v:+.2}")).unwrap_or_else(|| "—".into()),
            ),
        }
    }
}

/// Bounded most-recent-first buffer.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_front(item);
        while self.items.len() > self.capacity {
            self.items.pop_back();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(50)
    }
}

// ---------------------------------------------------------------------------
// REST records (backend-owned, transient copies)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub min_capital: Option<f64>,
    pub tags: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySubscription {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub strategy_id: String,
    pub strategy_name: Option<String>,
    pub status: SubscriptionStatus,
    pub capital: f64,
    pub mode: TradingMode,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub capital: f64,
    pub mode: TradingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_connection_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Start,
    Pause,
    Stop,
}

impl SubscriptionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionAction::Start => "start",
            SubscriptionAction::Pause => "pause",
            SubscriptionAction::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioSummary {
    pub total_capital: f64,
    pub total_pnl: f64,
    pub day_pnl: f64,
    pub active_strategies: u32,
    pub open_positions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Backtest {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub strategy_id: String,
    pub symbol: Option<String>,
    pub status: JobStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub results: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Optimization {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub strategy_id: String,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub best_params: Option<Value>,
    pub best_score: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConnection {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub broker: String,
    pub status: String,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlogPost {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub slug: String,
    pub title: String,
    pub excerpt: Option<String>,
    pub content: Option<String>,
    pub tags: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    /// Price in the smallest currency unit (e.g. paise).
    pub price: i64,
    pub currency: String,
    pub interval: String,
    pub features: Vec<String>,
}

/// Server-created order descriptor handed to the checkout provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentOrder {
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    /// Public key id of the provider account.
    pub key_id: String,
    pub plan_id: String,
}

/// Provider success payload, checked server-side before success is declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentReceipt {
    pub plan_id: String,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchScope {
    Global,
    User,
    Strategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchStatus {
    pub active: bool,
    pub scope: Option<KillSwitchScope>,
    pub reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_accept_numbers_and_strings() {
        let u: User = serde_json::from_value(json!({"id": 42, "email": "a@b.c"})).unwrap();
        assert_eq!(u.id, "42");
        let u: User = serde_json::from_value(json!({"id": "u-1", "email": "a@b.c"})).unwrap();
        assert_eq!(u.id, "u-1");
    }

    #[test]
    fn snapshot_authenticated_requires_both_tokens() {
        let s = SessionSnapshot::new(None, Some("a".into()), None);
        assert!(!s.is_authenticated);
        let s = SessionSnapshot::new(None, Some("a".into()), Some("r".into()));
        assert!(s.is_authenticated);
        assert!(s.is_consistent());
    }

    #[test]
    fn ring_buffer_keeps_newest_first() {
        let mut buf = RingBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![4, 3, 2]);
    }

    #[test]
    fn unknown_status_does_not_fail_parsing() {
        let s: StrategyStatusUpdate =
            serde_json::from_value(json!({"subscription_id": 7, "status": "liquidating"})).unwrap();
        assert_eq!(s.status, SubscriptionStatus::Unknown);
        assert_eq!(s.subscription_id, "7");
    }

    #[test]
    fn only_terminal_job_states_are_finished() {
        let bt: Backtest =
            serde_json::from_value(json!({"id": 3, "strategy_id": 7, "status": "running"})).unwrap();
        assert!(!bt.status.is_finished());
        assert!(!JobStatus::Pending.is_finished());
        assert!(JobStatus::Completed.is_finished());
        assert!(JobStatus::Failed.is_finished());
        assert!(JobStatus::Cancelled.is_finished());
    }
}
