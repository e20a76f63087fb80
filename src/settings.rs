use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub database: Database,
    pub device: Device,
    pub limiter: Limiter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Public base URL devices and browsers reach this server on, e.g.
    /// https://login.example.com. Verification and callback URIs are built
    /// from it, so behind a proxy it must be set to the outside address;
    /// unset, the listen address is used.
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// Connection string for the store holding device requests, device
    /// tokens, and rate-limit state, e.g. sqlite://perigee.db?mode=rwc
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Lifetime of a device request and its paired device token, in seconds.
    pub requests_valid_for_secs: i64,
    /// Whether a rejected poll stores the increased poll interval on the
    /// record. Off by default: the rejected poll still advances the window,
    /// but slow_down does not tighten it.
    pub persist_slow_down_interval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limiter {
    /// Nominal allowed gap between requests for one key, in seconds.
    pub base_interval_secs: i64,
    /// Lifetime of an idle request-limit record, in seconds.
    pub default_expiry_secs: i64,
    /// Grow the enforced interval linearly while a key keeps violating it.
    pub backoff: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_base_url: None,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://perigee.db?mode=rwc".to_string(),
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self {
            requests_valid_for_secs: 300,
            persist_slow_down_interval: false,
        }
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self {
            base_interval_secs: 1,
            default_expiry_secs: 3600,
            backoff: true,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default("database.url", Database::default().url)
            .into_diagnostic()?
            .set_default(
                "device.requests_valid_for_secs",
                Device::default().requests_valid_for_secs,
            )
            .into_diagnostic()?
            .set_default(
                "device.persist_slow_down_interval",
                Device::default().persist_slow_down_interval,
            )
            .into_diagnostic()?
            .set_default("limiter.base_interval_secs", Limiter::default().base_interval_secs)
            .into_diagnostic()?
            .set_default("limiter.default_expiry_secs", Limiter::default().default_expiry_secs)
            .into_diagnostic()?
            .set_default("limiter.backoff", Limiter::default().backoff)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: PERIGEE__SERVER__PORT=9090, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("PERIGEE").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let s: Settings = cfg.try_deserialize().into_diagnostic()?;
        Ok(s)
    }

    /// Base URL baked into `verification_uri`, the `/auth` hand-off, and
    /// the callback redirect. A device caches whatever this returns for the
    /// lifetime of its flow, so it has to stay stable while requests are
    /// outstanding.
    pub fn issuer(&self) -> String {
        match &self.server.public_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.server.host, self.server.port),
        }
    }
}
