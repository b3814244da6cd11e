/// config.rs – Load settings from config.yaml + environment variables.
///
/// Environment variables always override YAML values.
/// Login credentials are read exclusively from the environment / .env file.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub log_level: String,
    /// Path to the SQLite file holding the persisted session.
    pub storage_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".into(),
            storage_path: "stratdesk-session.db".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Backend origin, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Versioned path prefix prepended to every endpoint.
    pub prefix: String,
    pub timeout_seconds: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            prefix: "/api/v1".into(),
            timeout_seconds: 15.0,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    /// WebSocket origin, e.g. `wss://api.example.com`.
    pub ws_url: String,
    pub market_path: String,
    pub portfolio_path: String,
    /// Interval between `ping` frames; an unanswered ping at the next tick
    /// drops the connection.
    pub heartbeat_seconds: f64,
    pub connect_timeout_seconds: f64,
    /// Capacity of the strategy feed's order/position ring buffer.
    pub event_buffer: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000".into(),
            market_path: "/api/v1/ws/market".into(),
            portfolio_path: "/api/v1/ws/portfolio".into(),
            heartbeat_seconds: 30.0,
            connect_timeout_seconds: 10.0,
            event_buffer: 50,
        }
    }
}

impl SocketConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for the exponential delay (before jitter).
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Random extra delay in `[0, jitter_ms]` added to every attempt.
    pub jitter_ms: u64,
    /// Consecutive failed attempts before the feed gives up. 0 = never.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_ms: 1_000,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Dashboard refresh rate in seconds.
    pub refresh_rate: f64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { refresh_rate: 1.0 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Hosted payment page the provider order is completed on.
    pub checkout_url: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            checkout_url: "http://localhost:8000/billing/checkout".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientConfig,
    pub api: ApiConfig,
    pub sockets: SocketConfig,
    pub reconnect: ReconnectConfig,
    pub dashboard: DashboardConfig,
    pub billing: BillingConfig,

    // Credentials – populated from env, not from YAML.
    #[serde(skip)]
    pub email: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

impl Settings {
    /// Load settings from *config_path* YAML file, then overlay env vars.
    pub fn load(config_path: &str) -> Result<Self> {
        // Try to load .env file (ignore error if absent)
        let _ = dotenvy::dotenv();

        let mut settings = if std::path::Path::new(config_path).exists() {
            let yaml = std::fs::read_to_string(config_path).context("reading config file")?;
            serde_yaml::from_str::<Settings>(&yaml).context("parsing config YAML")?
        } else {
            Settings::default()
        };

        if let Ok(url) = std::env::var("STRATDESK_API_URL") {
            settings.api.base_url = url;
        }
        if let Ok(url) = std::env::var("STRATDESK_WS_URL") {
            settings.sockets.ws_url = url;
        }
        if let Ok(path) = std::env::var("STRATDESK_STORAGE") {
            settings.client.storage_path = path;
        }
        settings.email = std::env::var("STRATDESK_EMAIL").ok();
        settings.password = std::env::var("STRATDESK_PASSWORD").ok();

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        validate_url("api.base_url", &self.api.base_url, &["http://", "https://"])?;
        validate_url("sockets.ws_url", &self.sockets.ws_url, &["ws://", "wss://"])?;
        validate_url(
            "billing.checkout_url",
            &self.billing.checkout_url,
            &["http://", "https://"],
        )?;
        if !self.api.prefix.is_empty() && !self.api.prefix.starts_with('/') {
            bail!("api.prefix must be empty or start with '/'");
        }
        for (name, path) in [
            ("sockets.market_path", &self.sockets.market_path),
            ("sockets.portfolio_path", &self.sockets.portfolio_path),
        ] {
            if !path.starts_with('/') {
                bail!("{name} must start with '/'");
            }
        }

        validate_positive("api.timeout_seconds", self.api.timeout_seconds)?;
        validate_positive("sockets.heartbeat_seconds", self.sockets.heartbeat_seconds)?;
        validate_positive(
            "sockets.connect_timeout_seconds",
            self.sockets.connect_timeout_seconds,
        )?;
        validate_positive("dashboard.refresh_rate", self.dashboard.refresh_rate)?;

        if self.sockets.event_buffer == 0 {
            bail!("sockets.event_buffer must be > 0");
        }
        if self.reconnect.initial_delay_ms == 0 {
            bail!("reconnect.initial_delay_ms must be > 0");
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            bail!("reconnect.max_delay_ms must be >= reconnect.initial_delay_ms");
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            bail!("reconnect.multiplier must be a finite number >= 1");
        }
        if self.reconnect.jitter_ms > self.reconnect.max_delay_ms {
            bail!("reconnect.jitter_ms must be <= reconnect.max_delay_ms");
        }

        Ok(())
    }
}

fn validate_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{name} must be a finite number > 0");
    }
    Ok(())
}

fn validate_url(name: &str, value: &str, schemes: &[&str]) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{name} must not be empty");
    }
    if !schemes.iter().any(|s| value.starts_with(s)) {
        bail!("{name} must start with one of {schemes:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn default_reconnect_starts_at_five_seconds() {
        assert_eq!(ReconnectConfig::default().initial_delay_ms, 5_000);
        assert_eq!(SocketConfig::default().heartbeat_seconds, 30.0);
    }

    #[test]
    fn validate_rejects_zero_heartbeat() {
        let mut settings = Settings::default();
        settings.sockets.heartbeat_seconds = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_delay_bounds() {
        let mut settings = Settings::default();
        settings.reconnect.initial_delay_ms = 10_000;
        settings.reconnect.max_delay_ms = 5_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_shrinking_multiplier() {
        let mut settings = Settings::default();
        settings.reconnect.multiplier = 0.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_http_socket_url() {
        let mut settings = Settings::default();
        settings.sockets.ws_url = "http://localhost:8000".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_event_buffer() {
        let mut settings = Settings::default();
        settings.sockets.event_buffer = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn yaml_sections_are_optional() {
        let s: Settings = serde_yaml::from_str("api:\n  base_url: https://x.io\n").unwrap();
        assert_eq!(s.api.base_url, "https://x.io");
        assert_eq!(s.api.prefix, "/api/v1");
        assert_eq!(s.reconnect.max_attempts, 10);
    }
}
