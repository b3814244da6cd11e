/// main.rs – Entry point for the StratDesk trading-platform client.
///
/// One-shot REST commands (login, catalog, jobs, billing, admin) plus the
/// `watch` command that runs the market and strategy feeds behind the live
/// ratatui dashboard.
mod api;
mod checkout;
mod config;
mod dashboard;
mod market_feed;
mod models;
mod requests;
mod session;
mod socket;
mod store;
mod strategy_feed;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use crossterm::event::EventStream;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use api::ApiClient;
use checkout::{CheckoutFlow, ConsoleCheckout, LogListener};
use config::Settings;
use dashboard::DashboardState;
use market_feed::{MarketEvent, MarketFeed, MarketParams};
use models::{KillSwitchScope, RegisterRequest, SubscribeRequest, SubscriptionAction, TradingMode};
use requests::{BacktestRequest, OptimizationRequest, ParameterRange};
use session::Session;
use socket::{Connector, WsConnector};
use store::SqliteStore;
use strategy_feed::{StrategyFeed, StrategyFeedEvent, StrategyScope};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "stratdesk",
    about = "Terminal client for the strategy trading platform",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in; credentials default to STRATDESK_EMAIL / STRATDESK_PASSWORD.
    Login {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    Logout,
    Whoami,
    /// List the strategy catalog, show one strategy, or subscribe to one.
    Strategies {
        #[arg(long, conflicts_with = "subscribe")]
        show: Option<String>,
        #[arg(long)]
        subscribe: Option<String>,
        /// Capital allocated to a new subscription.
        #[arg(long, default_value_t = 0.0)]
        capital: f64,
        /// Trade live instead of paper.
        #[arg(long, default_value_t = false)]
        live: bool,
    },
    Subscriptions {
        #[command(subcommand)]
        action: Option<SubscriptionCmd>,
    },
    Portfolio,
    Backtests {
        #[command(subcommand)]
        action: Option<BacktestCmd>,
    },
    Optimizations {
        #[command(subcommand)]
        action: Option<OptimizationCmd>,
    },
    Brokers,
    /// List plans, or buy one with --buy <plan id>.
    Plans {
        #[arg(long)]
        buy: Option<String>,
    },
    Blog {
        /// Show one post instead of the list.
        slug: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    KillSwitch {
        #[command(subcommand)]
        action: Option<KillSwitchCmd>,
    },
    /// Stream quotes, candles and strategy activity.
    Watch {
        #[arg(long, value_delimiter = ',', default_value = "NSE:NIFTY50")]
        symbols: Vec<String>,
        #[arg(long, default_value = "1m")]
        interval: String,
        /// Watch a single subscription instead of all strategies.
        #[arg(long)]
        subscription: Option<String>,
        /// Disable the interactive dashboard and print logs to stdout instead.
        #[arg(long, default_value_t = false)]
        no_dashboard: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SubscriptionCmd {
    Start { id: String },
    Pause { id: String },
    Stop { id: String },
    Delete { id: String },
}

#[derive(clap::Args, Debug)]
struct JobArgs {
    #[arg(long)]
    strategy: String,
    #[arg(long)]
    symbol: String,
    #[arg(long, default_value = "1d")]
    interval: String,
    #[arg(long)]
    start: NaiveDate,
    #[arg(long)]
    end: NaiveDate,
    #[arg(long, default_value_t = 100_000.0)]
    capital: f64,
}

#[derive(Subcommand, Debug)]
enum BacktestCmd {
    Run {
        #[command(flatten)]
        job: JobArgs,
        /// Strategy parameter as name=value (repeatable).
        #[arg(long = "set", value_parser = parse_assignment)]
        parameters: Vec<(String, serde_json::Value)>,
    },
    Show { id: String },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum OptimizationCmd {
    Run {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long, default_value = "sharpe_ratio")]
        metric: String,
        /// Parameter range as name:min:max:step (repeatable).
        #[arg(long = "param", value_parser = parse_range)]
        parameters: Vec<ParameterRange>,
    },
    Show { id: String },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum KillSwitchCmd {
    On {
        #[arg(long, default_value = "global")]
        scope: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Off {
        #[arg(long, default_value = "global")]
        scope: String,
    },
}

fn parse_assignment(s: &str) -> Result<(String, serde_json::Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.into()));
    Ok((name.trim().to_string(), value))
}

fn parse_range(s: &str) -> Result<ParameterRange, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let &[name, min, max, step] = parts.as_slice() else {
        return Err(format!("expected name:min:max:step, got '{s}'"));
    };
    let num = |v: &str| v.trim().parse::<f64>().map_err(|e| format!("'{v}': {e}"));
    Ok(ParameterRange {
        name: name.trim().to_string(),
        min: num(min)?,
        max: num(max)?,
        step: num(step)?,
    })
}

fn parse_scope(s: &str) -> Result<KillSwitchScope> {
    match s.to_ascii_lowercase().as_str() {
        "global" => Ok(KillSwitchScope::Global),
        "user" => Ok(KillSwitchScope::User),
        "strategy" => Ok(KillSwitchScope::Strategy),
        other => bail!("unknown kill-switch scope '{other}' (global|user|strategy)"),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;

    // Logging – respects RUST_LOG env var; falls back to config
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.client.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let store = Arc::new(
        SqliteStore::open(&settings.client.storage_path)
            .with_context(|| format!("opening {}", settings.client.storage_path))?,
    );
    let session = Session::restore(store);

    let expired = Arc::new(Notify::new());
    {
        let expired = Arc::clone(&expired);
        session.set_on_unauthenticated(move || {
            warn!("Session expired – log in again with `stratdesk login`");
            expired.notify_one();
        });
    }

    let api = Arc::new(ApiClient::from_config(&settings.api, session.clone())?);

    match cli.command {
        Command::Login { email, password } => {
            let email = email
                .or_else(|| settings.email.clone())
                .ok_or_else(|| anyhow!("no email given (--email or STRATDESK_EMAIL)"))?;
            let password = password
                .or_else(|| settings.password.clone())
                .ok_or_else(|| anyhow!("no password given (--password or STRATDESK_PASSWORD)"))?;
            let user = api.login(&email, &password).await?;
            info!("Logged in as {}", user.display_name());
        }
        Command::Register {
            email,
            password,
            name,
        } => {
            let user = api
                .register(&RegisterRequest {
                    email,
                    password,
                    full_name: name,
                })
                .await?;
            info!("Registered and logged in as {}", user.display_name());
        }
        Command::Logout => {
            api.logout().await;
            info!("Logged out");
        }
        Command::Whoami => {
            require_login(&session)?;
            let user = api.me().await?;
            println!(
                "{} <{}>  plan={}  admin={}",
                user.display_name(),
                user.email,
                user.plan.as_deref().unwrap_or("free"),
                user.is_admin
            );
        }
        Command::Strategies {
            show,
            subscribe,
            capital,
            live,
        } => {
            require_login(&session)?;
            match (show, subscribe) {
                (Some(id), _) => {
                    let s = api.get_strategy(&id).await?;
                    let state = if s.is_active { "active" } else { "inactive" };
                    println!("{} {} ({state})", s.id, s.name);
                    if let Some(desc) = s.description {
                        println!("{desc}");
                    }
                    if !s.tags.is_empty() {
                        println!("tags: {}", s.tags.join(", "));
                    }
                }
                (None, Some(strategy_id)) => {
                    let request = SubscribeRequest {
                        capital,
                        mode: if live { TradingMode::Live } else { TradingMode::Paper },
                        broker_connection_id: None,
                    };
                    let sub = api.subscribe_strategy(&strategy_id, &request).await?;
                    info!("Subscribed: subscription {} ({})", sub.id, sub.status);
                }
                (None, None) => {
                    for s in api.list_strategies().await? {
                        println!(
                            "{:<8} {:<30} {:<12} min={}",
                            s.id,
                            s.name,
                            s.category.as_deref().unwrap_or("-"),
                            s.min_capital.map(|c| format!("{c:.0}")).unwrap_or_else(|| "-".into())
                        );
                    }
                }
            }
        }
        Command::Subscriptions { action } => {
            require_login(&session)?;
            let (id, action) = match action {
                None => {
                    for s in api.list_subscriptions().await? {
                        println!(
                            "{:<8} {:<30} {:<9} {:>12.2} {:?}",
                            s.id,
                            s.strategy_name.as_deref().unwrap_or(&s.strategy_id),
                            s.status,
                            s.capital,
                            s.mode
                        );
                    }
                    return Ok(());
                }
                Some(SubscriptionCmd::Delete { id }) => {
                    api.delete_subscription(&id).await?;
                    info!("Subscription {id} deleted");
                    return Ok(());
                }
                Some(SubscriptionCmd::Start { id }) => (id, SubscriptionAction::Start),
                Some(SubscriptionCmd::Pause { id }) => (id, SubscriptionAction::Pause),
                Some(SubscriptionCmd::Stop { id }) => (id, SubscriptionAction::Stop),
            };
            let sub = api.update_subscription(&id, action).await?;
            info!("Subscription {} is now {}", sub.id, sub.status);
        }
        Command::Portfolio => {
            require_login(&session)?;
            let p = api.portfolio_summary().await?;
            println!(
                "capital={:.2}  total P&L={:+.2}  day P&L={:+.2}  strategies={}  positions={}",
                p.total_capital, p.total_pnl, p.day_pnl, p.active_strategies, p.open_positions
            );
        }
        Command::Backtests { action } => {
            require_login(&session)?;
            run_backtests(&api, action).await?;
        }
        Command::Optimizations { action } => {
            require_login(&session)?;
            run_optimizations(&api, action).await?;
        }
        Command::Brokers => {
            require_login(&session)?;
            for b in api.list_broker_connections().await? {
                println!("{:<8} {:<16} {}", b.id, b.broker, b.status);
            }
        }
        Command::Plans { buy } => match buy {
            Some(plan_id) => {
                require_login(&session)?;
                let provider = Arc::new(ConsoleCheckout {
                    checkout_url: settings.billing.checkout_url.clone(),
                });
                let flow = CheckoutFlow::new(Arc::clone(&api), provider);
                flow.pay(&plan_id, &LogListener).await;
            }
            None => {
                for p in api.list_plans().await? {
                    println!(
                        "{:<8} {:<16} {:>10.2} {}/{}  {}",
                        p.id,
                        p.name,
                        p.price as f64 / 100.0,
                        p.currency,
                        p.interval,
                        p.features.join(", ")
                    );
                }
            }
        },
        Command::Blog { slug, page } => match slug {
            Some(slug) => {
                let post = api.get_post(&slug).await?;
                println!("{}\n\n{}", post.title, post.content.unwrap_or_default());
            }
            None => {
                for p in api.list_posts(page).await? {
                    println!("{:<32} {}", p.slug, p.title);
                }
            }
        },
        Command::KillSwitch { action } => {
            require_login(&session)?;
            let status = match action {
                None => api.kill_switch_status().await?,
                Some(KillSwitchCmd::On { scope, reason }) => {
                    api.set_kill_switch(parse_scope(&scope)?, true, reason.as_deref())
                        .await?
                }
                Some(KillSwitchCmd::Off { scope }) => {
                    api.set_kill_switch(parse_scope(&scope)?, false, None).await?
                }
            };
            println!(
                "kill switch: {}  scope={:?}  reason={}",
                if status.active { "ACTIVE" } else { "off" },
                status.scope,
                status.reason.as_deref().unwrap_or("-")
            );
        }
        Command::Watch {
            symbols,
            interval,
            subscription,
            no_dashboard,
        } => {
            require_login(&session)?;
            // Validates (and if needed refreshes) the session before the
            // sockets pick up the access token.
            let user = api.me().await?;
            let scope = match subscription {
                Some(id) => StrategyScope::Subscription(id),
                None => StrategyScope::All,
            };
            watch(
                &settings,
                session,
                user.display_name().to_string(),
                MarketParams { symbols, interval },
                scope,
                no_dashboard,
                expired,
            )
            .await?;
        }
    }

    Ok(())
}

fn require_login(session: &Session) -> Result<()> {
    if !session.is_authenticated() {
        bail!("not logged in – run `stratdesk login` first");
    }
    Ok(())
}

async fn run_backtests(api: &ApiClient, action: Option<BacktestCmd>) -> Result<()> {
    match action {
        None => {
            for b in api.list_backtests().await? {
                println!(
                    "{:<8} strategy={:<8} {:<12} {}",
                    b.id,
                    b.strategy_id,
                    b.symbol.as_deref().unwrap_or("-"),
                    b.status
                );
            }
        }
        Some(BacktestCmd::Run { job, parameters }) => {
            let request = BacktestRequest {
                strategy_id: job.strategy,
                symbol: job.symbol,
                interval: job.interval,
                start_date: job.start,
                end_date: job.end,
                initial_capital: job.capital,
                parameters: parameters.into_iter().collect::<BTreeMap<_, _>>(),
            };
            let bt = api.create_backtest(&request).await?;
            info!("Backtest {} submitted ({})", bt.id, bt.status);
        }
        Some(BacktestCmd::Show { id }) => {
            let bt = api.get_backtest(&id).await?;
            println!("{} {}", bt.id, bt.status);
            if !bt.status.is_finished() {
                println!("still {}; results appear once it finishes", bt.status);
                return Ok(());
            }
            if let Some(err) = bt.error {
                println!("error: {err}");
            }
            if let Some(results) = bt.results {
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
        }
        Some(BacktestCmd::Delete { id }) => {
            api.delete_backtest(&id).await?;
            info!("Backtest {id} deleted");
        }
    }
    Ok(())
}

async fn run_optimizations(api: &ApiClient, action: Option<OptimizationCmd>) -> Result<()> {
    match action {
        None => {
            for o in api.list_optimizations().await? {
                println!(
                    "{:<8} strategy={:<8} {:<10} {}",
                    o.id,
                    o.strategy_id,
                    o.status,
                    o.progress.map(|p| format!("{:.0}%", p * 100.0)).unwrap_or_default()
                );
            }
        }
        Some(OptimizationCmd::Run {
            job,
            metric,
            parameters,
        }) => {
            let request = OptimizationRequest {
                strategy_id: job.strategy,
                symbol: job.symbol,
                interval: job.interval,
                start_date: job.start,
                end_date: job.end,
                initial_capital: job.capital,
                metric,
                parameters,
            };
            let opt = api.create_optimization(&request).await?;
            info!(
                "Optimization {} submitted ({} combinations, {})",
                opt.id,
                request.combinations(),
                opt.status
            );
        }
        Some(OptimizationCmd::Show { id }) => {
            let o = api.get_optimization(&id).await?;
            println!(
                "{} {} best_score={}",
                o.id,
                o.status,
                o.best_score.map(|s| format!("{s:.4}")).unwrap_or_else(|| "-".into())
            );
            if !o.status.is_finished() {
                println!("still {}; best parameters appear once it finishes", o.status);
            } else if let Some(best) = o.best_params {
                println!("{}", serde_json::to_string_pretty(&best)?);
            }
        }
        Some(OptimizationCmd::Delete { id }) => {
            api.delete_optimization(&id).await?;
            info!("Optimization {id} deleted");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// watch
// ---------------------------------------------------------------------------

async fn watch(
    settings: &Settings,
    session: Session,
    user: String,
    market_params: MarketParams,
    scope: StrategyScope,
    no_dashboard: bool,
    expired: Arc<Notify>,
) -> Result<()> {
    let connector: Arc<dyn Connector> =
        Arc::new(WsConnector::new(settings.sockets.connect_timeout()));

    info!(
        "Watching {:?} ({}) and strategies {:?}",
        market_params.symbols, market_params.interval, scope
    );

    let mut state = DashboardState::new(user, market_params.symbols.clone());
    let market = MarketFeed::start(settings, market_params, session.clone(), Arc::clone(&connector));
    let strategies = StrategyFeed::start(settings, scope, session, connector);

    let mut market_events = market.events();
    let mut strategy_events = strategies.events();
    let mut market_status = market.watch_status();
    let mut strategy_status = strategies.watch_status();

    let mut terminal = if !no_dashboard {
        Some(dashboard::setup_terminal()?)
    } else {
        None
    };

    let refresh_ms = (settings.dashboard.refresh_rate * 1000.0) as u64;
    let mut dash_ticker = tokio::time::interval(Duration::from_millis(refresh_ms.max(50)));
    let mut event_stream = EventStream::new();

    info!("Watching.  Press 'q' to quit.");

    let result: Result<()> = async {
        loop {
            if let Some(ref mut term) = terminal {
                market.read(|s| state.sync_market(market.status(), s));
                strategies.read(|s| state.sync_strategies(strategies.status(), s));
                term.draw(|f| dashboard::render(f, &state))?;
            }

            tokio::select! {
                Some(Ok(event)) = event_stream.next(), if terminal.is_some() => {
                    if dashboard::handle_event(&event) {
                        break;
                    }
                }

                _ = tokio::signal::ctrl_c(), if terminal.is_none() => break,

                _ = expired.notified() => {
                    error!("Session expired – stopping feeds");
                    break;
                }

                _ = dash_ticker.tick() => {}

                Ok(()) = market_status.changed() => {
                    let status = market_status.borrow_and_update().clone();
                    info!("market feed {}", status.label());
                    state.add_log(format!("market feed {}", status.label()));
                }

                Ok(()) = strategy_status.changed() => {
                    let status = strategy_status.borrow_and_update().clone();
                    info!("strategy feed {}", status.label());
                    state.add_log(format!("strategy feed {}", status.label()));
                }

                event = market_events.recv() => match event {
                    Ok(MarketEvent::Candle { symbol, candle, is_partial: false }) => {
                        let line = format!(
                            "{symbol} bar closed O={:.2} H={:.2} L={:.2} C={:.2}",
                            candle.open, candle.high, candle.low, candle.close
                        );
                        if no_dashboard {
                            info!("{line}");
                        }
                        state.add_log(line);
                    }
                    Ok(MarketEvent::Quote { symbol, quote }) if no_dashboard => {
                        info!("{symbol} {:.2}", quote.last_price);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dashboard lagged {n} market events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },

                event = strategy_events.recv() => match event {
                    Ok(StrategyFeedEvent::Activity(ev)) => {
                        let line = format!("[{}] {}", ev.subscription_id(), ev.summary());
                        if no_dashboard {
                            info!("{line}");
                        }
                        state.add_log(line);
                    }
                    Ok(StrategyFeedEvent::Status(s)) => {
                        let line = format!("[{}] status {}", s.subscription_id, s.status);
                        if no_dashboard {
                            info!("{line}");
                        }
                        state.add_log(line);
                    }
                    Ok(StrategyFeedEvent::Pnl(p)) if no_dashboard => {
                        info!("[{}] P&L {:+.2}", p.subscription_id, p.total());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dashboard lagged {n} strategy events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }
        Ok(())
    }
    .await;

    if let Some(ref mut term) = terminal {
        dashboard::teardown_terminal(term)?;
    }

    market.shutdown().await;
    strategies.shutdown().await;
    info!("Feeds stopped");

    result
}
