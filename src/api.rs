/// api.rs – Authenticated client for the platform's REST API.
///
/// Responsibilities:
///  - Attach `Authorization: Bearer <access_token>` to every request
///  - On a 401, refresh the access token once and retry the request once
///  - Expire the session (and notify the host) when a refresh fails
///  - Typed wrappers for the auth, strategy, portfolio, backtest,
///    optimization, broker, blog, billing, and admin endpoints
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::models::{
    AuthResponse, Backtest, BlogPost, BrokerConnection, KillSwitchScope, KillSwitchStatus,
    Optimization, PaymentOrder, PaymentProof, PaymentReceipt, Plan, PortfolioSummary,
    RegisterRequest, Strategy, StrategySubscription, SubscribeRequest, SubscriptionAction,
    TokenPair, User,
};
use crate::requests::{BacktestRequest, OptimizationRequest};
use crate::session::Session;

const REFRESH_PATH: &str = "/auth/refresh";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(String),

    /// Non-2xx response; `detail` is the backend's human-readable message.
    #[error("{detail}")]
    Http { status: u16, detail: String },

    #[error("session expired – please log in again")]
    SessionExpired,

    #[error("session ended while the request was in flight")]
    SessionEnded,

    /// Rejected client-side before any request was sent.
    #[error("{0}")]
    Validation(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// 400/422: the backend rejected the payload; retrying cannot help.
    pub fn is_rejection(&self) -> bool {
        matches!(self.status(), Some(400 | 422))
    }

    fn from_response(resp: &ApiResponse) -> Self {
        ApiError::Http {
            status: resp.status,
            detail: extract_detail(&resp.body)
                .unwrap_or_else(|| format!("request failed with status {}", resp.status)),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e.to_string())
    }
}

/// Pull the message out of `{"detail": "..."}`, FastAPI-style
/// `{"detail": [{"msg": ...}]}`, or `{"message": "..."}` bodies.
pub fn extract_detail(body: &Value) -> Option<String> {
    match body.get("detail") {
        Some(Value::String(s)) => return Some(s.clone()),
        Some(Value::Array(items)) => {
            let msgs: Vec<&str> = items
                .iter()
                .filter_map(|i| i.get("msg").and_then(|m| m.as_str()))
                .collect();
            if !msgs.is_empty() {
                return Some(msgs.join("; "));
            }
        }
        _ => {}
    }
    body.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API origin, including the version prefix.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    /// Set on the single resubmission after a token refresh.
    pub retried: bool,
    /// Auth endpoints answer 401 for bad credentials; never refresh on those.
    pub allow_refresh: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
            retried: false,
            allow_refresh: true,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn without_refresh(mut self) -> Self {
        self.allow_refresh = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body; `Null` when empty, a JSON string when not JSON.
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, req: &ApiRequest) -> Result<ApiResponse, ApiError>;
}

pub struct ReqwestTransport {
    base_url: String,
    http: Client,
}

impl ReqwestTransport {
    pub fn new(cfg: &ApiConfig) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(cfg.timeout()).build()?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, req: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, req.path);
        let request_id = Uuid::new_v4().to_string();

        let mut builder = self
            .http
            .request(req.method.clone(), &url)
            .header("X-Request-Id", &request_id);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(token) = &req.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        debug!("→ {} {} [{request_id}]", req.method, req.path);
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        debug!("← {status} {} [{request_id}]", req.path);
        Ok(ApiResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

pub struct ApiClient {
    transport: std::sync::Arc<dyn HttpTransport>,
    session: Session,
    prefix: String,
    /// Serialises refreshes so concurrent 401s share one refresh call.
    refresh_lock: Mutex<()>,
}

impl ApiClient {
    pub fn new(
        transport: std::sync::Arc<dyn HttpTransport>,
        session: Session,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            session,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &ApiConfig, session: Session) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(cfg)?;
        Ok(Self::new(std::sync::Arc::new(transport), session, cfg.prefix.clone()))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn path(&self, p: &str) -> String {
        format!("{}{}", self.prefix, p)
    }

    // ------------------------------------------------------------------
    // Core send with refresh-and-retry
    // ------------------------------------------------------------------

    /// Send *req* with the current bearer token and return the JSON body.
    pub async fn send(&self, mut req: ApiRequest) -> Result<Value, ApiError> {
        req.bearer = self.session.access_token();
        let resp = self.transport.execute(&req).await?;

        if resp.status == 401 && req.allow_refresh && !req.retried {
            let failed_token = req.bearer.take();
            self.refresh_after_unauthorized(failed_token.as_deref(), &resp)
                .await?;
            req.retried = true;
            req.bearer = self.session.access_token();
            debug!("Retrying {} {} with refreshed token", req.method, req.path);
            let retry = self.transport.execute(&req).await?;
            return into_result(retry);
        }
        into_result(resp)
    }

    async fn refresh_after_unauthorized(
        &self,
        failed_token: Option<&str>,
        unauthorized: &ApiResponse,
    ) -> Result<(), ApiError> {
        let _guard = self.refresh_lock.lock().await;

        // Another request refreshed while we waited for the lock.
        let current = self.session.access_token();
        if current.is_some() && current.as_deref() != failed_token {
            debug!("Access token already refreshed by a concurrent request");
            return Ok(());
        }

        let Some(refresh_token) = self.session.refresh_token() else {
            return Err(ApiError::from_response(unauthorized));
        };
        let generation = self.session.generation();

        let req = ApiRequest::new(Method::POST, self.path(REFRESH_PATH))
            .json(json!({ "refresh_token": refresh_token }))
            .without_refresh();
        let outcome = match self.transport.execute(&req).await {
            Ok(resp) if resp.is_success() => decode::<TokenPair>(resp.body),
            Ok(resp) => Err(ApiError::from_response(&resp)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(tokens) => {
                if self.session.apply_refresh(generation, tokens) {
                    info!("Access token refreshed");
                    Ok(())
                } else {
                    Err(ApiError::SessionEnded)
                }
            }
            Err(_) if self.session.generation() != generation => Err(ApiError::SessionEnded),
            Err(e) => {
                warn!("Token refresh failed: {e}");
                self.session.expire();
                Err(ApiError::SessionExpired)
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let body = self.send(ApiRequest::new(Method::GET, self.path(path))).await?;
        decode(body)
    }

    async fn get_list<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<Vec<T>, ApiError> {
        let body = self.send(req).await?;
        decode_list(body)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        let resp = self
            .send(ApiRequest::new(Method::POST, self.path(path)).json(body))
            .await?;
        decode(resp)
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::new(Method::DELETE, self.path(path)))
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------

    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let req = ApiRequest::new(Method::POST, self.path("/auth/login"))
            .json(json!({ "email": email, "password": password }))
            .without_refresh();
        let auth: AuthResponse = decode(self.send(req).await?)?;
        self.complete_auth(auth).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<User, ApiError> {
        let body = serde_json::to_value(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        let req = ApiRequest::new(Method::POST, self.path("/auth/register"))
            .json(body)
            .without_refresh();
        let auth: AuthResponse = decode(self.send(req).await?)?;
        self.complete_auth(auth).await
    }

    async fn complete_auth(&self, auth: AuthResponse) -> Result<User, ApiError> {
        let user = auth.user.clone();
        self.session.establish(user.clone(), auth.tokens);
        match user {
            Some(u) => Ok(u),
            None => self.me().await,
        }
    }

    pub async fn me(&self) -> Result<User, ApiError> {
        let user: User = self.get("/users/me").await?;
        self.session.set_user(user.clone());
        Ok(user)
    }

    /// Best-effort server-side revocation, then local logout.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.session.refresh_token() {
            let req = ApiRequest::new(Method::POST, self.path("/auth/logout"))
                .json(json!({ "refresh_token": refresh_token }))
                .without_refresh();
            if let Err(e) = self.send(req).await {
                debug!("Server logout failed (ignored): {e}");
            }
        }
        self.session.clear();
    }

    // ------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------

    pub async fn list_strategies(&self) -> Result<Vec<Strategy>, ApiError> {
        self.get_list(ApiRequest::new(Method::GET, self.path("/strategies")))
            .await
    }

    pub async fn get_strategy(&self, id: &str) -> Result<Strategy, ApiError> {
        self.get(&format!("/strategies/{id}")).await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<StrategySubscription>, ApiError> {
        self.get_list(ApiRequest::new(Method::GET, self.path("/subscriptions")))
            .await
    }

    pub async fn subscribe_strategy(
        &self,
        strategy_id: &str,
        request: &SubscribeRequest,
    ) -> Result<StrategySubscription, ApiError> {
        if !request.capital.is_finite() || request.capital <= 0.0 {
            return Err(ApiError::Validation(
                "allocated capital must be greater than zero".into(),
            ));
        }
        self.post(&format!("/strategies/{strategy_id}/subscribe"), request)
            .await
    }

    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        action: SubscriptionAction,
    ) -> Result<StrategySubscription, ApiError> {
        self.post(
            &format!("/subscriptions/{subscription_id}/{}", action.as_str()),
            &json!({}),
        )
        .await
    }

    pub async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ApiError> {
        self.delete(&format!("/subscriptions/{subscription_id}"))
            .await
    }

    pub async fn portfolio_summary(&self) -> Result<PortfolioSummary, ApiError> {
        self.get("/portfolio/summary").await
    }

    // ------------------------------------------------------------------
    // Backtests / optimizations
    // ------------------------------------------------------------------

    pub async fn create_backtest(&self, request: &BacktestRequest) -> Result<Backtest, ApiError> {
        request.validate()?;
        self.post("/backtests", request).await
    }

    pub async fn list_backtests(&self) -> Result<Vec<Backtest>, ApiError> {
        self.get_list(ApiRequest::new(Method::GET, self.path("/backtests")))
            .await
    }

    pub async fn get_backtest(&self, id: &str) -> Result<Backtest, ApiError> {
        self.get(&format!("/backtests/{id}")).await
    }

    pub async fn delete_backtest(&self, id: &str) -> Result<(), ApiError> {
        self.delete(&format!("/backtests/{id}")).await
    }

    pub async fn create_optimization(
        &self,
        request: &OptimizationRequest,
    ) -> Result<Optimization, ApiError> {
        request.validate()?;
        self.post("/optimizations", request).await
    }

    pub async fn list_optimizations(&self) -> Result<Vec<Optimization>, ApiError> {
        self.get_list(ApiRequest::new(Method::GET, self.path("/optimizations")))
            .await
    }

    pub async fn get_optimization(&self, id: &str) -> Result<Optimization, ApiError> {
        self.get(&format!("/optimizations/{id}")).await
    }

    pub async fn delete_optimization(&self, id: &str) -> Result<(), ApiError> {
        self.delete(&format!("/optimizations/{id}")).await
    }

    // ------------------------------------------------------------------
    // Brokers / blog
    // ------------------------------------------------------------------

    pub async fn list_broker_connections(&self) -> Result<Vec<BrokerConnection>, ApiError> {
        self.get_list(ApiRequest::new(Method::GET, self.path("/brokers/connections")))
            .await
    }

    pub async fn list_posts(&self, page: u32) -> Result<Vec<BlogPost>, ApiError> {
        self.get_list(ApiRequest::new(Method::GET, self.path("/blog/posts")).query("page", page))
            .await
    }

    pub async fn get_post(&self, slug: &str) -> Result<BlogPost, ApiError> {
        self.get(&format!("/blog/posts/{slug}")).await
    }

    // ------------------------------------------------------------------
    // Billing
    // ------------------------------------------------------------------

    pub async fn list_plans(&self) -> Result<Vec<Plan>, ApiError> {
        self.get_list(ApiRequest::new(Method::GET, self.path("/billing/plans")))
            .await
    }

    pub async fn create_payment_order(&self, plan_id: &str) -> Result<PaymentOrder, ApiError> {
        self.post("/billing/orders", &json!({ "plan_id": plan_id }))
            .await
    }

    pub async fn verify_payment(&self, proof: &PaymentProof) -> Result<PaymentReceipt, ApiError> {
        self.post("/billing/verify", proof).await
    }

    // ------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------

    pub async fn kill_switch_status(&self) -> Result<KillSwitchStatus, ApiError> {
        self.get("/admin/kill-switch").await
    }

    pub async fn set_kill_switch(
        &self,
        scope: KillSwitchScope,
        active: bool,
        reason: Option<&str>,
    ) -> Result<KillSwitchStatus, ApiError> {
        self.post(
            "/admin/kill-switch",
            &json!({ "scope": scope, "active": active, "reason": reason }),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn into_result(resp: ApiResponse) -> Result<Value, ApiError> {
    if resp.is_success() {
        Ok(resp.body)
    } else {
        Err(ApiError::from_response(&resp))
    }
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Lists arrive either bare or wrapped in `items` / `results` / `data`.
fn decode_list<T: DeserializeOwned>(body: Value) -> Result<Vec<T>, ApiError> {
    let items = match body {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut o) => ["items", "results", "data"]
            .iter()
            .find_map(|k| o.remove(*k).filter(|v| v.is_array()))
            .unwrap_or(Value::Array(vec![])),
        Value::Null => Value::Array(vec![]),
        other => return Err(ApiError::Decode(format!("expected a list, got {other}"))),
    };
    decode(items)
}
