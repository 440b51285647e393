//! The supervisor: a single task consuming the event bus, holding the
//! authoritative MCB state, and arbitrating every transition.
//!
//! All decisions happen here, one event at a time. Peripheral side-effects
//! (ventilator, floor heating) are dispatched fire-and-forget so they never
//! block the loop; MCB and notifier calls are awaited inline under explicit
//! timeouts. The loop itself never returns an error: every failure is
//! logged, surfaced in the snapshot, or reported to the commanding caller.

use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::adapter::{McbDevice, Notifier};
use crate::config::{Config, FlicAction, FlicConfig};
use crate::event::{
    BusReceiver, ButtonAction, ButtonPress, CommandError, CommandOutcome, Event, McbSource,
    McbState, OperatorCommand, PhaseReading,
};
use crate::floorheating::FloorHeatingController;
use crate::ratelimit::{Decision, NotificationKind, RateLimiter};
use crate::safety::{check_thresholds, format_offenders, Offender, ThresholdCheck};
use crate::snapshot::{Broadcaster, Snapshot};
use crate::timer::TimerService;
use crate::ventilator::VentilatorController;

/// How long the supervisor keeps consuming queued events after `Shutdown`.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub amperage_threshold: f64,
    pub safety_enabled: bool,
    pub switch_off_cooldown: Duration,
    pub temperature_alert_celsius: f64,
    pub mcb_timeout: Duration,
    pub notifier_timeout: Duration,
    pub flic: FlicConfig,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            amperage_threshold: cfg.amperage_threshold,
            safety_enabled: cfg.safety_enabled,
            switch_off_cooldown: Duration::from_millis(cfg.switch_off_cooldown_ms),
            temperature_alert_celsius: cfg.temperature_alert_celsius,
            mcb_timeout: Duration::from_millis(cfg.mcb.timeout_ms),
            notifier_timeout: Duration::from_millis(
                cfg.notifier.as_ref().map(|n| n.timeout_ms).unwrap_or(10_000),
            ),
            flic: cfg.flic,
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

pub struct Supervisor {
    bus: BusReceiver,
    timers: Arc<TimerService>,
    broadcaster: Arc<Broadcaster>,
    mcb: Arc<dyn McbDevice>,
    notifier: Option<Arc<dyn Notifier>>,
    ventilator: VentilatorController,
    floor: FloorHeatingController,
    limiter: RateLimiter,
    settings: SupervisorSettings,

    mcb_state: McbState,
    mcb_source: McbSource,
    last_phases: Option<PhaseReading>,
    last_temp: Option<crate::event::TemperatureReading>,
    last_door: Option<crate::event::DoorReading>,
    last_switch_off_at: Option<Instant>,
    last_safety_error: Option<String>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: BusReceiver,
        timers: Arc<TimerService>,
        broadcaster: Arc<Broadcaster>,
        mcb: Arc<dyn McbDevice>,
        notifier: Option<Arc<dyn Notifier>>,
        ventilator: VentilatorController,
        floor: FloorHeatingController,
        limiter: RateLimiter,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            bus,
            timers,
            broadcaster,
            mcb,
            notifier,
            ventilator,
            floor,
            limiter,
            settings,
            mcb_state: McbState::Unknown,
            mcb_source: McbSource::Local,
            last_phases: None,
            last_temp: None,
            last_door: None,
            last_switch_off_at: None,
            last_safety_error: None,
        }
    }

    /// Consume the bus until shutdown. Intended to be `tokio::spawn`-ed.
    pub async fn run(mut self) {
        self.floor.start();
        self.publish();
        info!("supervisor running");

        loop {
            let event = self.bus.recv().await;
            if matches!(self.handle_event(event).await, Flow::Stop) {
                break;
            }
        }

        self.shutdown().await;
    }

    // -- event handling -----------------------------------------------------

    async fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::McbObserved(state, source) => {
                self.apply_mcb(state, source);
            }

            Event::PhaseReading(reading) => {
                self.last_phases = Some(reading);
                self.publish();
                if self.mcb_state == McbState::On && self.settings.safety_enabled {
                    match check_thresholds(&reading, self.settings.amperage_threshold) {
                        ThresholdCheck::Within => {}
                        ThresholdCheck::Exceeded(offenders) => {
                            self.run_safety_shutdown(&offenders).await;
                        }
                    }
                }
            }

            Event::Temperature(reading) => {
                self.last_temp = Some(reading);
                self.publish();
                if reading.celsius >= self.settings.temperature_alert_celsius {
                    self.try_temperature_alert(reading.celsius).await;
                }
            }

            Event::Door(reading) => {
                self.last_door = Some(reading);
                self.publish();
            }

            Event::Button(press) => {
                self.handle_button(press).await;
            }

            Event::Command(request) => {
                let result = self.execute_command(request.command).await;
                if let Err(e) = &result {
                    warn!(command = ?request.command, "operator command failed: {e}");
                }
                if let Some(reply) = request.reply {
                    // A dropped HTTP caller is not our problem.
                    let _ = reply.send(result);
                }
            }

            Event::VentilatorStatus(on) => {
                self.ventilator.observe_status(on, self.timers.now());
                self.publish();
            }

            Event::FloorHeatingStatus(reading) => {
                self.floor.update(reading);
                self.publish();
            }

            Event::TimerFired(id) => {
                if !self.timers.is_live(id) {
                    debug!(id, "stale timer firing dropped");
                } else if self.ventilator.handle_timer(id) {
                    self.publish();
                } else if self.floor.handle_timer(id) {
                    // Poll result comes back as FloorHeatingStatus.
                } else {
                    debug!(id, "timer firing with no owner");
                }
            }

            Event::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    /// Record a fresh MCB state, fan out peripheral side-effects on a real
    /// transition, and publish.
    fn apply_mcb(&mut self, state: McbState, source: McbSource) {
        let previous = self.mcb_state;
        self.mcb_state = state;
        self.mcb_source = source;

        if previous != state {
            info!(?previous, ?state, ?source, "mcb state changed");
            match (previous, state) {
                (McbState::On, McbState::Off) => {
                    self.ventilator.on_mcb_off();
                    self.floor.on_sauna_off();
                }
                (_, McbState::On) => {
                    self.ventilator.on_mcb_on();
                    self.floor.on_sauna_on();
                }
                (previous, state) => {
                    debug!(?previous, ?state, "no peripheral side-effects for transition");
                }
            }
        }
        self.publish();
    }

    async fn handle_button(&mut self, press: ButtonPress) {
        let mapped = match press.action {
            ButtonAction::Click => self.settings.flic.click,
            ButtonAction::DoubleClick => self.settings.flic.double_click,
            ButtonAction::Hold => self.settings.flic.hold,
            ButtonAction::Unknown => {
                warn!(button_id = ?press.button_id, "unrecognised button action ignored");
                return;
            }
        };
        let command = match mapped {
            FlicAction::Toggle => OperatorCommand::Toggle,
            FlicAction::ForceOn => OperatorCommand::ForceOn,
            FlicAction::ForceOff => OperatorCommand::ForceOff,
            FlicAction::None => {
                debug!(action = ?press.action, "button gesture mapped to nothing");
                return;
            }
        };
        info!(action = ?press.action, ?command, "button press");
        if let Err(e) = self.execute_command(command).await {
            warn!(?command, "button command failed: {e}");
        }
    }

    // -- operator commands --------------------------------------------------

    async fn execute_command(
        &mut self,
        command: OperatorCommand,
    ) -> Result<CommandOutcome, CommandError> {
        match command {
            OperatorCommand::TurnOn | OperatorCommand::ForceOn => self.set_mcb(true).await,
            OperatorCommand::TurnOff | OperatorCommand::ForceOff => self.set_mcb(false).await,
            OperatorCommand::Toggle => match self.mcb_state {
                McbState::On => self.set_mcb(false).await,
                McbState::Off => self.set_mcb(true).await,
                McbState::Unknown => Err(CommandError::StateUnknown),
            },
            OperatorCommand::TestNotify => self.test_notify().await,
        }
    }

    async fn set_mcb(&mut self, on: bool) -> Result<CommandOutcome, CommandError> {
        let mcb = Arc::clone(&self.mcb);
        let result = if on {
            timeout(self.settings.mcb_timeout, mcb.turn_on()).await
        } else {
            timeout(self.settings.mcb_timeout, mcb.turn_off()).await
        };

        match result {
            Ok(Ok(())) => {
                let state = if on { McbState::On } else { McbState::Off };
                self.last_safety_error = None;
                self.apply_mcb(state, McbSource::Command);
                Ok(CommandOutcome { mcb: state })
            }
            Ok(Err(crate::adapter::AdapterError::Timeout)) | Err(_) => Err(CommandError::Timeout),
            Ok(Err(e)) => Err(CommandError::Device(e.to_string())),
        }
    }

    /// Test notifications are operator-initiated and deliberately skip the
    /// cooldown gate; everything system-initiated goes through it.
    async fn test_notify(&mut self) -> Result<CommandOutcome, CommandError> {
        let Some(notifier) = self.notifier.clone() else {
            return Err(CommandError::NotifierUnavailable);
        };
        let send = notifier.send_text("Sauna hub notification test");
        match timeout(self.settings.notifier_timeout, send).await {
            Ok(Ok(())) => Ok(CommandOutcome {
                mcb: self.mcb_state,
            }),
            Ok(Err(e)) => Err(CommandError::Notify(e.to_string())),
            Err(_) => Err(CommandError::Notify("request timed out".to_string())),
        }
    }

    // -- safety -------------------------------------------------------------

    async fn run_safety_shutdown(&mut self, offenders: &[Offender]) {
        let now = self.timers.now();
        if let Some(last) = self.last_switch_off_at {
            if now.duration_since(last) < self.settings.switch_off_cooldown {
                debug!("threshold exceeded inside trip cooldown, no action");
                return;
            }
        }
        // The cooldown is committed before the command goes out, so a
        // failing breaker is not hammered by every subsequent reading.
        self.last_switch_off_at = Some(now);

        let summary = format_offenders(offenders);
        warn!(
            offenders = %summary,
            threshold = self.settings.amperage_threshold,
            "phase threshold exceeded, tripping mcb"
        );

        let mcb = Arc::clone(&self.mcb);
        match timeout(self.settings.mcb_timeout, mcb.turn_off()).await {
            Ok(Ok(())) => {
                self.last_safety_error = None;
                self.apply_mcb(McbState::Off, McbSource::Command);
                self.send_shutdown_alert(&summary).await;
            }
            Ok(Err(e)) => self.note_safety_failure(e.to_string()),
            Err(_) => self.note_safety_failure("mcb command timed out".to_string()),
        }
    }

    fn note_safety_failure(&mut self, message: String) {
        error!("safety shutdown failed: {message}");
        self.last_safety_error = Some(message);
        self.publish();
    }

    async fn send_shutdown_alert(&mut self, summary: &str) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let now = self.timers.now();
        match self.limiter.allow(NotificationKind::SafetyShutdown, now) {
            Decision::Ok => {
                let body = format!("Sauna safety shutdown: {summary}");
                match timeout(self.settings.notifier_timeout, notifier.send_text(&body)).await {
                    Ok(Ok(())) => {
                        self.limiter.mark_sent(NotificationKind::SafetyShutdown, now);
                        info!("shutdown alert sent");
                    }
                    Ok(Err(e)) => warn!("shutdown alert failed: {e}"),
                    Err(_) => warn!("shutdown alert timed out"),
                }
            }
            Decision::Denied { remaining } => {
                debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "shutdown alert rate-limited"
                );
            }
        }
    }

    async fn try_temperature_alert(&mut self, celsius: f64) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let now = self.timers.now();
        match self.limiter.allow(NotificationKind::TemperatureAlert, now) {
            Decision::Ok => {
                let body = format!("Sauna temperature alert: {celsius:.1} C");
                match timeout(self.settings.notifier_timeout, notifier.send_text(&body)).await {
                    Ok(Ok(())) => {
                        self.limiter
                            .mark_sent(NotificationKind::TemperatureAlert, now);
                        info!(celsius, "temperature alert sent");
                    }
                    Ok(Err(e)) => warn!("temperature alert failed: {e}"),
                    Err(_) => warn!("temperature alert timed out"),
                }
            }
            Decision::Denied { remaining } => {
                debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "temperature alert rate-limited"
                );
            }
        }
    }

    // -- snapshot -----------------------------------------------------------

    fn publish(&mut self) {
        let now = self.timers.now();
        let snapshot = Snapshot {
            mcb: self.mcb_state,
            mcb_source: self.mcb_source,
            phases: self.last_phases,
            temperature: self.last_temp,
            door: self.last_door,
            ventilator: self
                .ventilator
                .enabled()
                .then(|| self.ventilator.summary(now)),
            floor_heating: self.floor.reading(),
            last_safety_error: self.last_safety_error.clone(),
            at: OffsetDateTime::now_utc(),
        };
        self.broadcaster.publish(snapshot);
    }

    // -- shutdown -----------------------------------------------------------

    async fn shutdown(&mut self) {
        info!("supervisor shutting down, draining bus");
        let deadline = Instant::now() + DRAIN_DEADLINE;
        loop {
            let event = match self.bus.try_recv() {
                Some(event) => event,
                None => match timeout_at(deadline, self.bus.recv()).await {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            if !matches!(event, Event::Shutdown) {
                let _ = self.handle_event(event).await;
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        self.ventilator.stop_all();
        self.floor.stop();
        self.timers.cancel_all();
        self.mcb.close().await;
        info!("supervisor stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
