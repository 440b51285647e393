//! Adapter contracts and the HTTP-backed device implementations.
//!
//! The supervisor only ever talks to devices through these traits, so tests
//! substitute mocks the same way the relay and thermostat clients plug in.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;
use tracing::debug;

use crate::event::{FloorHeatingMode, FloorHeatingReading, McbState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("request timed out")]
    Timeout,
    #[error("http status {status}")]
    Http { status: u16 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout
        } else if let Some(status) = e.status() {
            AdapterError::Http {
                status: status.as_u16(),
            }
        } else {
            AdapterError::Protocol(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// The smart circuit breaker switching the heater.
#[async_trait]
pub trait McbDevice: Send + Sync {
    async fn turn_on(&self) -> AdapterResult<()>;
    async fn turn_off(&self) -> AdapterResult<()>;
    async fn status(&self) -> AdapterResult<McbState>;
    async fn close(&self) {}
}

/// The ventilator relay.
#[async_trait]
pub trait VentilatorRelay: Send + Sync {
    async fn set(&self, on: bool) -> AdapterResult<()>;
    async fn status(&self) -> AdapterResult<bool>;
}

/// The floor-heating thermostat.
#[async_trait]
pub trait Thermostat: Send + Sync {
    async fn set_mode(&self, mode: FloorHeatingMode) -> AdapterResult<()>;
    async fn set_target_c(&self, target_c: f64) -> AdapterResult<()>;
    async fn status(&self) -> AdapterResult<FloorHeatingReading>;
}

/// The notification gateway. Whatever transport sits behind it is opaque.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, body: &str) -> AdapterResult<()>;
}

// ---------------------------------------------------------------------------
// MCB over local HTTP RPC (authoritative channel)
// ---------------------------------------------------------------------------

pub struct HttpMcb {
    client: reqwest::Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    output: bool,
}

impl HttpMcb {
    pub fn new(host: &str, timeout: Duration) -> AdapterResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: format!("http://{host}"),
        })
    }

    async fn set(&self, on: bool) -> AdapterResult<()> {
        let url = format!("{}/rpc/Switch.Set?id=0&on={on}", self.base);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AdapterError::Http {
                status: resp.status().as_u16(),
            });
        }
        debug!(on, "mcb switch command accepted");
        Ok(())
    }
}

#[async_trait]
impl McbDevice for HttpMcb {
    async fn turn_on(&self) -> AdapterResult<()> {
        self.set(true).await
    }

    async fn turn_off(&self) -> AdapterResult<()> {
        self.set(false).await
    }

    async fn status(&self) -> AdapterResult<McbState> {
        let url = format!("{}/rpc/Switch.GetStatus?id=0", self.base);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AdapterError::Http {
                status: resp.status().as_u16(),
            });
        }
        let status: SwitchStatus = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;
        Ok(if status.output {
            McbState::On
        } else {
            McbState::Off
        })
    }
}

// ---------------------------------------------------------------------------
// Notification gateway over HTTP
// ---------------------------------------------------------------------------

pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpNotifier {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> AdapterResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            token,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_text(&self, body: &str) -> AdapterResult<()> {
        let mut req = self.client.post(&self.url).json(&json!({ "body": body }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(AdapterError::Http {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
