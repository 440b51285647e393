//! Floor-heating control: setpoint/mode driving around the sauna state and
//! a periodic status poll, plus the thermostat's local TCP client.
//!
//! Setpoint commands are best-effort: a failure is logged and reported
//! nowhere else, and never blocks an MCB transition.

use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::adapter::{AdapterError, AdapterResult, Thermostat};
use crate::config::FloorHeatingConfig;
use crate::event::{BusSender, Event, FloorHeatingAction, FloorHeatingMode, FloorHeatingReading};
use crate::timer::{TimerHandle, TimerId, TimerService};

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct FloorHeatingController {
    thermostat: Option<Arc<dyn Thermostat>>,
    bus: BusSender,
    timers: Arc<TimerService>,
    target_on_c: f64,
    target_off_c: f64,
    poll_every: Duration,
    poll_timer: Option<TimerHandle>,
    reading: Option<FloorHeatingReading>,
}

impl FloorHeatingController {
    pub fn new(
        thermostat: Option<Arc<dyn Thermostat>>,
        bus: BusSender,
        timers: Arc<TimerService>,
        cfg: &FloorHeatingConfig,
    ) -> Self {
        Self {
            thermostat,
            bus,
            timers,
            target_on_c: cfg.target_on_c,
            target_off_c: cfg.target_off_c,
            poll_every: Duration::from_secs(cfg.poll_interval_s),
            poll_timer: None,
            reading: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.thermostat.is_some()
    }

    /// Arm the periodic status poll.
    pub fn start(&mut self) {
        if self.enabled() && self.poll_timer.is_none() {
            self.poll_timer = Some(self.timers.every(self.poll_every));
        }
    }

    /// Sauna came on: manual mode, comfort target.
    pub fn on_sauna_on(&self) {
        self.apply_setpoint(self.target_on_c);
    }

    /// Sauna went off: manual mode, standby target.
    pub fn on_sauna_off(&self) {
        self.apply_setpoint(self.target_off_c);
    }

    /// Dispatch a timer firing. Returns false when the id is not ours.
    pub fn handle_timer(&mut self, id: TimerId) -> bool {
        if !self.poll_timer.as_ref().is_some_and(|h| h.id() == id) {
            return false;
        }
        let Some(thermostat) = self.thermostat.clone() else {
            return true;
        };
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match thermostat.status().await {
                Ok(reading) => bus.send(Event::FloorHeatingStatus(reading)).await,
                Err(e) => warn!("floor heating status poll failed: {e}"),
            }
        });
        true
    }

    /// A fresh reading arrived (poll result).
    pub fn update(&mut self, reading: FloorHeatingReading) {
        self.reading = Some(reading);
    }

    pub fn reading(&self) -> Option<FloorHeatingReading> {
        self.reading
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.poll_timer.take() {
            self.timers.cancel(&handle);
        }
    }

    fn apply_setpoint(&self, target_c: f64) {
        let Some(thermostat) = self.thermostat.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = thermostat.set_mode(FloorHeatingMode::Manual).await {
                warn!("floor heating set_mode failed: {e}");
                return;
            }
            if let Err(e) = thermostat.set_target_c(target_c).await {
                warn!(target_c, "floor heating set_target failed: {e}");
            } else {
                debug!(target_c, "floor heating setpoint applied");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Local thermostat client (line-delimited JSON key-value protocol over TCP)
// ---------------------------------------------------------------------------

pub struct LocalThermostat {
    addr: String,
    device_id: String,
    local_key: String,
    version: String,
    timeout: Duration,
}

impl LocalThermostat {
    pub fn new(host: &str, cfg: &FloorHeatingConfig) -> Self {
        Self {
            addr: host.to_string(),
            device_id: cfg.device_id.clone(),
            local_key: cfg.local_key.clone(),
            version: cfg.protocol_version.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }

    fn request(&self, cmd: &str, dps: Option<Value>) -> Value {
        let mut req = json!({
            "device_id": self.device_id,
            "local_key": self.local_key,
            "version": self.version,
            "cmd": cmd,
        });
        if let Some(dps) = dps {
            req["dps"] = dps;
        }
        req
    }

    async fn exchange(&self, req: Value) -> AdapterResult<Value> {
        let io = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            let mut line = req.to_string().into_bytes();
            line.push(b'\n');
            stream.write_all(&line).await?;

            let mut reader = BufReader::new(stream);
            let mut resp = String::new();
            reader.read_line(&mut resp).await?;

            let v: Value = serde_json::from_str(resp.trim())
                .map_err(|e| AdapterError::Protocol(format!("bad thermostat reply: {e}")))?;
            if v.get("ok").and_then(Value::as_bool) == Some(false) {
                let msg = v
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified device error");
                return Err(AdapterError::Protocol(msg.to_string()));
            }
            Ok(v)
        };
        match timeout(self.timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout),
        }
    }
}

#[async_trait::async_trait]
impl Thermostat for LocalThermostat {
    async fn set_mode(&self, mode: FloorHeatingMode) -> AdapterResult<()> {
        let mode = match mode {
            FloorHeatingMode::Auto => "auto",
            FloorHeatingMode::Manual => "manual",
            FloorHeatingMode::Unknown => {
                return Err(AdapterError::Protocol(
                    "cannot command unknown mode".to_string(),
                ))
            }
        };
        self.exchange(self.request("set", Some(json!({ "mode": mode }))))
            .await?;
        Ok(())
    }

    async fn set_target_c(&self, target_c: f64) -> AdapterResult<()> {
        self.exchange(self.request("set", Some(json!({ "target_c": target_c }))))
            .await?;
        Ok(())
    }

    async fn status(&self) -> AdapterResult<FloorHeatingReading> {
        let resp = self.exchange(self.request("status", None)).await?;
        let dps = resp
            .get("dps")
            .ok_or_else(|| AdapterError::Protocol("status reply missing dps".to_string()))?;
        parse_status_dps(dps)
            .ok_or_else(|| AdapterError::Protocol("status reply missing fields".to_string()))
    }
}

/// Decode a thermostat `dps` object into a reading. Unrecognised mode and
/// work-state strings map to `Unknown` rather than failing the poll.
pub fn parse_status_dps(dps: &Value) -> Option<FloorHeatingReading> {
    let mode = match dps.get("mode").and_then(Value::as_str) {
        Some("auto") => FloorHeatingMode::Auto,
        Some("manual") => FloorHeatingMode::Manual,
        Some(_) => FloorHeatingMode::Unknown,
        None => return None,
    };
    let action = match dps.get("work_state").and_then(Value::as_str) {
        Some("heating") => FloorHeatingAction::Heating,
        Some("warming") => FloorHeatingAction::Warming,
        Some("idle") => FloorHeatingAction::Idle,
        _ => FloorHeatingAction::Unknown,
    };
    Some(FloorHeatingReading {
        mode,
        action,
        target_c: dps.get("target_c").and_then(Value::as_f64)?,
        current_c: dps.get("current_c").and_then(Value::as_f64)?,
        at: OffsetDateTime::now_utc(),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
