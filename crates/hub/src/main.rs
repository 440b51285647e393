//! Hub entry point: reads config, wires up the event bus, timers, adapters,
//! supervisor, MQTT ingest, and web server.
//!
//! Safety features:
//! - Phase-threshold shutdown: any phase above the configured current trips
//!   the breaker, with a cooldown against duplicate trips
//! - Critical events (breaker observations, phase readings) are never
//!   dropped by the bus overflow policy
//! - Every outbound device call carries an explicit timeout
//! - Signal handler: SIGTERM/SIGINT drains the bus and stops all timers
//!   before exit; the breaker keeps its own durable state

mod adapter;
mod config;
mod event;
mod floorheating;
mod mqtt;
mod ratelimit;
mod safety;
mod snapshot;
mod supervisor;
mod timer;
mod ventilator;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::time::{timeout, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use adapter::{HttpMcb, HttpNotifier, McbDevice, Notifier, Thermostat, VentilatorRelay};
use event::{Event, McbSource};
use floorheating::{FloorHeatingController, LocalThermostat};
use mqtt::Topics;
use ratelimit::RateLimiter;
use snapshot::Broadcaster;
use supervisor::{Supervisor, SupervisorSettings};
use timer::TimerService;
use ventilator::{HttpVentilatorRelay, VentilatorController};

/// Event bus depth. Producers outpacing the supervisor start losing their
/// oldest non-critical events beyond this.
const BUS_CAPACITY: usize = 256;

/// A fresh MCB connection must report its state within this window.
const MCB_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the supervisor gets to drain the bus after shutdown is signalled.
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        threshold_a = cfg.amperage_threshold,
        safety_enabled = cfg.safety_enabled,
        "config loaded"
    );

    // ── Bus, timers, broadcaster ────────────────────────────────────
    let (bus_tx, bus_rx) = event::channel(BUS_CAPACITY);
    let timers = Arc::new(TimerService::new(bus_tx.clone()));
    let broadcaster = Arc::new(Broadcaster::new());

    // ── Adapters ────────────────────────────────────────────────────
    let mcb_host = cfg
        .mcb
        .host
        .clone()
        .context("mcb.host must be configured")?;
    let mcb: Arc<dyn McbDevice> = Arc::new(HttpMcb::new(
        &mcb_host,
        Duration::from_millis(cfg.mcb.timeout_ms),
    )?);

    let relay: Option<Arc<dyn VentilatorRelay>> = match &cfg.ventilator.ip {
        Some(ip) => Some(Arc::new(HttpVentilatorRelay::new(
            ip,
            Duration::from_millis(cfg.ventilator.timeout_ms),
        )?)),
        None => {
            info!("ventilator relay not configured");
            None
        }
    };

    let thermostat: Option<Arc<dyn Thermostat>> = match &cfg.floor_heating.host {
        Some(host) => Some(Arc::new(LocalThermostat::new(host, &cfg.floor_heating))),
        None => {
            info!("floor heating thermostat not configured");
            None
        }
    };

    let notifier: Option<Arc<dyn Notifier>> = match &cfg.notifier {
        Some(n) => Some(Arc::new(HttpNotifier::new(
            &n.url,
            n.token.clone(),
            Duration::from_millis(n.timeout_ms),
        )?)),
        None => {
            warn!("notifier not configured, operator alerts disabled");
            None
        }
    };

    // ── Controllers + supervisor ────────────────────────────────────
    let ventilator = VentilatorController::new(relay, Arc::clone(&timers), &cfg.ventilator);
    let floor = FloorHeatingController::new(
        thermostat,
        bus_tx.clone(),
        Arc::clone(&timers),
        &cfg.floor_heating,
    );
    let limiter = RateLimiter::new(
        Duration::from_millis(cfg.notification_cooldown_ms.safety_shutdown),
        Duration::from_millis(cfg.notification_cooldown_ms.temperature_alert),
    );
    let settings = SupervisorSettings::from_config(&cfg);

    let supervisor = Supervisor::new(
        bus_rx,
        Arc::clone(&timers),
        Arc::clone(&broadcaster),
        Arc::clone(&mcb),
        notifier,
        ventilator,
        floor,
        limiter,
        settings,
    );
    let mut supervisor_handle = tokio::spawn(supervisor.run());

    // ── Initial MCB observation ─────────────────────────────────────
    {
        let mcb = Arc::clone(&mcb);
        let bus = bus_tx.clone();
        tokio::spawn(async move {
            match timeout(MCB_INIT_TIMEOUT, mcb.status()).await {
                Ok(Ok(state)) => {
                    info!(?state, "mcb initial state observed");
                    bus.send(Event::McbObserved(state, McbSource::Local)).await;
                }
                Ok(Err(e)) => error!("mcb initialisation failed: {e}"),
                Err(_) => error!(
                    "mcb did not report its state within {}s",
                    MCB_INIT_TIMEOUT.as_secs()
                ),
            }
        });
    }

    // ── Periodic MCB status re-read (authoritative channel) ─────────
    let mut poll_handle = {
        let mcb = Arc::clone(&mcb);
        let bus = bus_tx.clone();
        let period = Duration::from_millis(cfg.polling_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick; the init probe covers it
            loop {
                ticker.tick().await;
                match mcb.status().await {
                    Ok(state) => bus.send(Event::McbObserved(state, McbSource::Local)).await,
                    Err(e) => warn!("mcb status poll failed: {e}"),
                }
            }
        })
    };

    // ── MQTT ingest ─────────────────────────────────────────────────
    let mqtt_connected = Arc::new(AtomicBool::new(false));
    let topics = Topics::from_config(&cfg.mqtt, cfg.mcb.status_topic.clone());
    let mut mqtt_handle = tokio::spawn(mqtt::run(
        cfg.mqtt.clone(),
        topics,
        bus_tx.clone(),
        Arc::clone(&mqtt_connected),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let app_state = web::AppState {
        bus: bus_tx.clone(),
        broadcaster: Arc::clone(&broadcaster),
        mqtt_connected: Arc::clone(&mqtt_connected),
        started_at: std::time::Instant::now(),
    };
    let mut web_handle = tokio::spawn(web::serve(app_state, cfg.web_port));

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // ── Main wait loop ──────────────────────────────────────────────
    let exit_reason: &str;
    let mut supervisor_alive = true;

    loop {
        tokio::select! {
            result = &mut supervisor_handle => {
                error!("CRITICAL: supervisor task exited unexpectedly: {result:?}");
                supervisor_alive = false;
                exit_reason = "supervisor task died";
                break;
            }

            result = &mut web_handle => {
                // Not safety-critical; the supervisor keeps running.
                error!("web server task exited unexpectedly: {result:?}");
                web_handle = tokio::spawn(async { std::future::pending::<()>().await });
            }

            result = &mut mqtt_handle => {
                error!("mqtt ingest task exited unexpectedly: {result:?}");
                mqtt_handle = tokio::spawn(async { std::future::pending::<()>().await });
            }

            result = &mut poll_handle => {
                error!("mcb poll task exited unexpectedly: {result:?}");
                poll_handle = tokio::spawn(async { std::future::pending::<()>().await });
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");

    if supervisor_alive {
        bus_tx.send(Event::Shutdown).await;
        match timeout(SUPERVISOR_STOP_TIMEOUT, &mut supervisor_handle).await {
            Ok(_) => info!("supervisor drained and stopped"),
            Err(_) => {
                warn!("supervisor did not stop in time, aborting");
                supervisor_handle.abort();
            }
        }
    }

    mqtt_handle.abort();
    poll_handle.abort();
    web_handle.abort();

    info!("shutdown complete");
    Ok(())
}
