/// market_feed.rs – Live quotes and candles for a symbol list.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Settings;
use crate::models::{Candle, CurrentCandle, Quote};
use crate::session::Session;
use crate::socket::{Channel, Connector, Dispatch, SocketOptions, SubscriptionSocket};

#[derive(Debug, Clone, PartialEq)]
pub struct MarketParams {
    pub symbols: Vec<String>,
    /// Bar interval, e.g. `1m` or `5m`.
    pub interval: String,
}

impl MarketParams {
    pub fn new(symbols: impl IntoIterator<Item = impl Into<String>>, interval: &str) -> Self {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            interval: interval.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketRequest {
    SubscribeCandles { symbols: Vec<String>, interval: String },
    UnsubscribeCandles { symbols: Vec<String>, interval: String },
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketFrame {
    Pong,
    CandlesSubscribed {
        #[serde(default)]
        symbols: Vec<String>,
    },
    CandlesUnsubscribed {
        #[serde(default)]
        symbols: Vec<String>,
    },
    Quote {
        symbol: String,
        data: Quote,
    },
    Candle {
        symbol: String,
        data: Candle,
        #[serde(default)]
        is_partial: bool,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Quote {
        symbol: String,
        quote: Quote,
    },
    Candle {
        symbol: String,
        candle: Candle,
        is_partial: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MarketFeedState {
    /// Symbols the server has acknowledged on the current connection.
    pub subscribed: Vec<String>,
    pub quotes: HashMap<String, Quote>,
    pub candles: HashMap<String, CurrentCandle>,
    pub error: Option<String>,
}

pub struct MarketChannel {
    path: String,
}

impl MarketChannel {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Channel for MarketChannel {
    type Params = MarketParams;
    type Outbound = MarketRequest;
    type Inbound = MarketFrame;
    type State = MarketFeedState;
    type Event = MarketEvent;

    fn name(&self) -> &'static str {
        "market"
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn initial_state(&self) -> MarketFeedState {
        MarketFeedState::default()
    }

    fn is_idle(&self, params: &MarketParams) -> bool {
        params.symbols.is_empty()
    }

    fn subscribe(&self, params: &MarketParams) -> Vec<MarketRequest> {
        vec![MarketRequest::SubscribeCandles {
            symbols: params.symbols.clone(),
            interval: params.interval.clone(),
        }]
    }

    fn unsubscribe(&self, params: &MarketParams) -> Vec<MarketRequest> {
        if params.symbols.is_empty() {
            return Vec::new();
        }
        vec![MarketRequest::UnsubscribeCandles {
            symbols: params.symbols.clone(),
            interval: params.interval.clone(),
        }]
    }

    fn ping(&self) -> MarketRequest {
        MarketRequest::Ping
    }

    fn dispatch(
        &self,
        _params: &MarketParams,
        state: &mut MarketFeedState,
        frame: MarketFrame,
    ) -> Dispatch<MarketEvent> {
        match frame {
            MarketFrame::Pong => Dispatch::Pong,
            MarketFrame::CandlesSubscribed { symbols } => {
                state.subscribed = symbols;
                Dispatch::Applied
            }
            MarketFrame::CandlesUnsubscribed { symbols } => {
                state.subscribed.retain(|s| !symbols.contains(s));
                Dispatch::Applied
            }
            MarketFrame::Quote { symbol, data } => {
                state.quotes.insert(symbol.clone(), data.clone());
                Dispatch::Event(MarketEvent::Quote {
                    symbol,
                    quote: data,
                })
            }
            MarketFrame::Candle {
                symbol,
                data,
                is_partial,
            } => {
                state.candles.insert(
                    symbol.clone(),
                    CurrentCandle {
                        candle: data.clone(),
                        is_partial,
                    },
                );
                Dispatch::Event(MarketEvent::Candle {
                    symbol,
                    candle: data,
                    is_partial,
                })
            }
            MarketFrame::Error { message } => {
                state.error = Some(message.clone());
                Dispatch::ServerError(message)
            }
            MarketFrame::Unknown => Dispatch::Ignored,
        }
    }

    fn record_error(&self, state: &mut MarketFeedState, message: String) {
        state.error = Some(message);
    }

    fn on_disconnect(&self, state: &mut MarketFeedState) {
        state.subscribed.clear();
    }
}

pub type MarketFeed = SubscriptionSocket<MarketChannel>;

impl SubscriptionSocket<MarketChannel> {
    pub fn start(
        settings: &Settings,
        params: MarketParams,
        session: Session,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::spawn(
            MarketChannel::new(settings.sockets.market_path.clone()),
            params,
            true,
            session,
            connector,
            SocketOptions::from_config(&settings.sockets, &settings.reconnect),
        )
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.read(|s| s.quotes.get(symbol).cloned())
    }

    pub fn candle(&self, symbol: &str) -> Option<CurrentCandle> {
        self.read(|s| s.candles.get(symbol).cloned())
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.read(|s| s.subscribed.clone())
    }

    pub fn last_error(&self) -> Option<String> {
        self.read(|s| s.error.clone())
    }
}
