/// strategy_feed.rs – Status, P&L and order/position activity of running strategies.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Settings;
use crate::models::{
    OrderUpdate, PnlUpdate, PositionUpdate, RingBuffer, StrategyEvent, StrategyStatusUpdate,
};
use crate::session::Session;
use crate::socket::{Channel, Connector, Dispatch, SocketOptions, SubscriptionSocket};

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyScope {
    /// One strategy subscription; an empty id means nothing to watch.
    Subscription(String),
    All,
}

impl StrategyScope {
    fn accepts(&self, subscription_id: &str) -> bool {
        match self {
            StrategyScope::All => true,
            StrategyScope::Subscription(id) => id == subscription_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortfolioRequest {
    SubscribeStrategy { subscription_id: String },
    UnsubscribeStrategy { subscription_id: String },
    SubscribeAllStrategies,
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortfolioFrame {
    Pong,
    StrategyStatus(StrategyStatusUpdate),
    PnlUpdate(PnlUpdate),
    OrderUpdate(OrderUpdate),
    PositionUpdate(PositionUpdate),
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        subscription_id: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyFeedEvent {
    Status(StrategyStatusUpdate),
    Pnl(PnlUpdate),
    Activity(StrategyEvent),
}

#[derive(Debug, Clone)]
pub struct StrategyFeedState {
    pub statuses: HashMap<String, StrategyStatusUpdate>,
    pub pnl: HashMap<String, PnlUpdate>,
    /// Order and position updates, most recent first.
    pub events: RingBuffer<StrategyEvent>,
    pub error: Option<String>,
}

pub struct StrategyChannel {
    path: String,
    event_capacity: usize,
}

impl StrategyChannel {
    pub fn new(path: impl Into<String>, event_capacity: usize) -> Self {
        Self {
            path: path.into(),
            event_capacity,
        }
    }
}

impl Channel for StrategyChannel {
    type Params = StrategyScope;
    type Outbound = PortfolioRequest;
    type Inbound = PortfolioFrame;
    type State = StrategyFeedState;
    type Event = StrategyFeedEvent;

    fn name(&self) -> &'static str {
        "portfolio"
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn initial_state(&self) -> StrategyFeedState {
        StrategyFeedState {
            statuses: HashMap::new(),
            pnl: HashMap::new(),
            events: RingBuffer::new(self.event_capacity),
            error: None,
        }
    }

    fn is_idle(&self, scope: &StrategyScope) -> bool {
        matches!(scope, StrategyScope::Subscription(id) if id.trim().is_empty())
    }

    fn subscribe(&self, scope: &StrategyScope) -> Vec<PortfolioRequest> {
        match scope {
            StrategyScope::All => vec![PortfolioRequest::SubscribeAllStrategies],
            StrategyScope::Subscription(id) => vec![PortfolioRequest::SubscribeStrategy {
                subscription_id: id.clone(),
            }],
        }
    }

    fn unsubscribe(&self, scope: &StrategyScope) -> Vec<PortfolioRequest> {
        match scope {
            // The server drops the all-strategies subscription with the socket.
            StrategyScope::All => Vec::new(),
            StrategyScope::Subscription(id) if id.trim().is_empty() => Vec::new(),
            StrategyScope::Subscription(id) => vec![PortfolioRequest::UnsubscribeStrategy {
                subscription_id: id.clone(),
            }],
        }
    }

    fn ping(&self) -> PortfolioRequest {
        PortfolioRequest::Ping
    }

    fn dispatch(
        &self,
        scope: &StrategyScope,
        state: &mut StrategyFeedState,
        frame: PortfolioFrame,
    ) -> Dispatch<StrategyFeedEvent> {
        match frame {
            PortfolioFrame::Pong => Dispatch::Pong,
            PortfolioFrame::StrategyStatus(update) => {
                if !scope.accepts(&update.subscription_id) {
                    return Dispatch::Filtered;
                }
                state
                    .statuses
                    .insert(update.subscription_id.clone(), update.clone());
                Dispatch::Event(StrategyFeedEvent::Status(update))
            }
            PortfolioFrame::PnlUpdate(update) => {
                if !scope.accepts(&update.subscription_id) {
                    return Dispatch::Filtered;
                }
                state
                    .pnl
                    .insert(update.subscription_id.clone(), update.clone());
                Dispatch::Event(StrategyFeedEvent::Pnl(update))
            }
            PortfolioFrame::OrderUpdate(order) => {
                record_activity(scope, state, StrategyEvent::Order(order))
            }
            PortfolioFrame::PositionUpdate(position) => {
                record_activity(scope, state, StrategyEvent::Position(position))
            }
            PortfolioFrame::Error {
                message,
                subscription_id,
            } => {
                if let Some(id) = subscription_id.as_ref().map(id_text) {
                    if !scope.accepts(&id) {
                        return Dispatch::Filtered;
                    }
                }
                state.error = Some(message.clone());
                Dispatch::ServerError(message)
            }
            PortfolioFrame::Unknown => Dispatch::Ignored,
        }
    }

    fn record_error(&self, state: &mut StrategyFeedState, message: String) {
        state.error = Some(message);
    }
}

fn record_activity(
    scope: &StrategyScope,
    state: &mut StrategyFeedState,
    event: StrategyEvent,
) -> Dispatch<StrategyFeedEvent> {
    if !scope.accepts(event.subscription_id()) {
        return Dispatch::Filtered;
    }
    state.events.push(event.clone());
    Dispatch::Event(StrategyFeedEvent::Activity(event))
}

fn id_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub type StrategyFeed = SubscriptionSocket<StrategyChannel>;

impl SubscriptionSocket<StrategyChannel> {
    pub fn start(
        settings: &Settings,
        scope: StrategyScope,
        session: Session,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::spawn(
            StrategyChannel::new(
                settings.sockets.portfolio_path.clone(),
                settings.sockets.event_buffer,
            ),
            scope,
            true,
            session,
            connector,
            SocketOptions::from_config(&settings.sockets, &settings.reconnect),
        )
    }

    pub fn recent_events(&self) -> Vec<StrategyEvent> {
        self.read(|s| s.events.iter().cloned().collect())
    }

    pub fn status_of(&self, subscription_id: &str) -> Option<StrategyStatusUpdate> {
        self.read(|s| s.statuses.get(subscription_id).cloned())
    }

    pub fn pnl_of(&self, subscription_id: &str) -> Option<PnlUpdate> {
        self.read(|s| s.pnl.get(subscription_id).cloned())
    }
}
