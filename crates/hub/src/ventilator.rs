//! Ventilator control: delayed-off after the sauna stops, keep-alive relay
//! cycling while it runs, and the HTTP relay adapter.
//!
//! ## State machine (states = set of timers active)
//!
//! ```text
//! Idle ──[mcb on]──▶ Running ──[mcb off]──▶ Cooling ──[delay-off fires]──▶ Idle
//!  ▲                    ▲                      │
//!  │                    └──────[mcb on]────────┘   (delay-off cancelled)
//!  └──[mcb off, relay observed off]── Running
//! ```
//!
//! The controller lives inside the supervisor task; relay commands are
//! dispatched fire-and-forget and failures never alter the state machine.

use serde::Serialize;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, AdapterResult, VentilatorRelay};
use crate::config::VentilatorConfig;
use crate::timer::{TimerHandle, TimerId, TimerService};

/// Pause between OFF and ON when cycling the relay to defeat an upstream
/// auto-off timer.
const KEEP_ALIVE_CYCLE_GAP: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct DelayedOff {
    handle: TimerHandle,
    deadline: Instant,
}

pub struct VentilatorController {
    relay: Option<Arc<dyn VentilatorRelay>>,
    timers: Arc<TimerService>,
    delay_off: Duration,
    keep_alive_every: Duration,
    relay_is_on: Option<bool>,
    delayed_off: Option<DelayedOff>,
    keep_alive: Option<TimerHandle>,
    last_observed_at: Option<Instant>,
}

/// What the snapshot reports about the ventilator.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VentilatorSummary {
    pub enabled: bool,
    pub relay_is_on: Option<bool>,
    pub has_delayed_off: bool,
    pub delayed_off_remaining_ms: Option<u64>,
    pub keep_alive_active: bool,
}

impl VentilatorController {
    pub fn new(
        relay: Option<Arc<dyn VentilatorRelay>>,
        timers: Arc<TimerService>,
        cfg: &VentilatorConfig,
    ) -> Self {
        Self {
            relay,
            timers,
            delay_off: Duration::from_secs(cfg.delay_off_minutes * 60),
            keep_alive_every: Duration::from_secs(cfg.keep_alive_minutes * 60),
            relay_is_on: None,
            delayed_off: None,
            keep_alive: None,
            last_observed_at: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.relay.is_some()
    }

    /// Sauna heater came on: cancel any pending delayed-off, switch the
    /// relay on, and make sure the keep-alive cycler runs.
    pub fn on_mcb_on(&mut self) {
        if !self.enabled() {
            return;
        }
        if let Some(pending) = self.delayed_off.take() {
            self.timers.cancel(&pending.handle);
            debug!("delayed-off cancelled, sauna back on");
        }
        self.spawn_set(true);
        if self.keep_alive.is_none() {
            self.keep_alive = Some(self.timers.every(self.keep_alive_every));
            info!(
                every_min = self.keep_alive_every.as_secs() / 60,
                "ventilator keep-alive started"
            );
        }
    }

    /// Sauna heater went off. If the relay is observed ON (or we do not
    /// know), keep ventilating and (re-)arm the delayed-off; the keep-alive
    /// cycler keeps running until the delayed-off fires. If the relay is
    /// observed OFF there is nothing to cool down: stop the cycler now.
    pub fn on_mcb_off(&mut self) {
        if !self.enabled() {
            return;
        }
        if self.relay_is_on == Some(false) {
            let observed_secs_ago = self.last_observed_at.map(|t| t.elapsed().as_secs());
            debug!(observed_secs_ago, "relay already off, stopping keep-alive");
            self.stop_keep_alive();
            return;
        }
        if let Some(pending) = self.delayed_off.take() {
            self.timers.cancel(&pending.handle);
        }
        let handle = self.timers.after(self.delay_off);
        self.delayed_off = Some(DelayedOff {
            handle,
            deadline: Instant::now() + self.delay_off,
        });
        info!(
            delay_min = self.delay_off.as_secs() / 60,
            "ventilator delayed-off armed"
        );
    }

    /// Dispatch a timer firing. Returns false when the id is not ours.
    pub fn handle_timer(&mut self, id: TimerId) -> bool {
        if let Some(pending) = self.delayed_off.take() {
            if pending.handle.id() == id {
                self.timers.cancel(&pending.handle);
                info!("ventilator cooldown elapsed, relay off");
                self.spawn_set(false);
                self.stop_keep_alive();
                return true;
            }
            self.delayed_off = Some(pending);
        }
        if self.keep_alive.as_ref().is_some_and(|h| h.id() == id) {
            self.spawn_cycle();
            return true;
        }
        false
    }

    /// A status observation arrived from the relay's push stream.
    pub fn observe_status(&mut self, on: bool, now: Instant) {
        self.relay_is_on = Some(on);
        self.last_observed_at = Some(now);
    }

    /// Cancel both timers and clear state. Used at shutdown.
    pub fn stop_all(&mut self) {
        if let Some(pending) = self.delayed_off.take() {
            self.timers.cancel(&pending.handle);
        }
        self.stop_keep_alive();
    }

    pub fn summary(&self, now: Instant) -> VentilatorSummary {
        let remaining = self
            .delayed_off
            .as_ref()
            .map(|p| p.deadline.saturating_duration_since(now).as_millis() as u64);
        VentilatorSummary {
            enabled: self.enabled(),
            relay_is_on: self.relay_is_on,
            has_delayed_off: self.delayed_off.is_some(),
            delayed_off_remaining_ms: remaining,
            keep_alive_active: self.keep_alive.is_some(),
        }
    }

    fn stop_keep_alive(&mut self) {
        if let Some(handle) = self.keep_alive.take() {
            self.timers.cancel(&handle);
            info!("ventilator keep-alive stopped");
        }
    }

    fn spawn_set(&self, on: bool) {
        let Some(relay) = self.relay.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = relay.set(on).await {
                warn!(on, "ventilator relay set failed: {e}");
            }
        });
    }

    /// Cycle the relay OFF, wait a second, back ON. Defeats the upstream
    /// auto-off. Failures are logged and the cycle continues.
    fn spawn_cycle(&self) {
        let Some(relay) = self.relay.clone() else {
            return;
        };
        tokio::spawn(async move {
            debug!("ventilator keep-alive cycle");
            if let Err(e) = relay.set(false).await {
                warn!("keep-alive cycle off failed: {e}");
            }
            tokio::time::sleep(KEEP_ALIVE_CYCLE_GAP).await;
            if let Err(e) = relay.set(true).await {
                warn!("keep-alive cycle on failed: {e}");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// HTTP relay adapter
// ---------------------------------------------------------------------------

pub struct HttpVentilatorRelay {
    client: reqwest::Client,
    base: String,
}

impl HttpVentilatorRelay {
    pub fn new(ip: &str, timeout: Duration) -> AdapterResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: format!("http://{ip}"),
        })
    }
}

#[async_trait::async_trait]
impl VentilatorRelay for HttpVentilatorRelay {
    async fn set(&self, on: bool) -> AdapterResult<()> {
        let turn = if on { "on" } else { "off" };
        let url = format!("{}/relay/0?turn={turn}", self.base);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AdapterError::Http {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn status(&self) -> AdapterResult<bool> {
        let url = format!("{}/status", self.base);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AdapterError::Http {
                status: resp.status().as_u16(),
            });
        }
        let body = resp.bytes().await?;
        parse_relay_status(&body)
            .ok_or_else(|| AdapterError::Protocol("unrecognised relay status shape".to_string()))
    }
}

/// Relay status JSON arrives in one of four shapes, depending on firmware:
/// `{output}`, `{"switch:0":{output}}`, `{status}`, `{state:"on"|"off"}`.
pub fn parse_relay_status(payload: &[u8]) -> Option<bool> {
    let v: serde_json::Value = serde_json::from_slice(payload).ok()?;

    if let Some(output) = v.get("output").and_then(|o| o.as_bool()) {
        return Some(output);
    }
    if let Some(output) = v
        .get("switch:0")
        .and_then(|s| s.get("output"))
        .and_then(|o| o.as_bool())
    {
        return Some(output);
    }
    if let Some(status) = v.get("status").and_then(|s| s.as_bool()) {
        return Some(status);
    }
    if let Some(state) = v.get("state").and_then(|s| s.as_str()) {
        return match state.to_ascii_lowercase().as_str() {
            "on" => Some(true),
            "off" => Some(false),
            _ => None,
        };
    }
    None
}

// ===========================================================================
// Tests
// ===========================================================================
