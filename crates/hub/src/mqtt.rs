//! MQTT ingest: subscribes to the configured sensor topics, parses payloads
//! at the adapter boundary, and feeds typed events into the bus.
//!
//! Malformed payloads are dropped here, counted, and never reach the
//! supervisor. Reconnects re-issue every subscription because the broker may
//! have lost the session.

use rumqttc::{AsyncClient, Event as MqttEvent, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::event::{
    BusSender, ButtonAction, ButtonPress, DoorReading, Event, McbSource, McbState, PhaseReading,
    TemperatureReading,
};
use crate::safety::Phase;
use crate::ventilator::parse_relay_status;

/// Retained topic announcing hub liveness (mirrored by the last will).
const HUB_STATUS_TOPIC: &str = "sauna/hub/status";

// ---------------------------------------------------------------------------
// Topic routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Topics {
    pub phase_prefix: Option<String>,
    pub ruuvi: Option<String>,
    pub door: Option<String>,
    pub button: Option<String>,
    pub ventilator_status: Option<String>,
    pub mcb_status: Option<String>,
}

impl Topics {
    pub fn from_config(mqtt: &MqttConfig, mcb_status: Option<String>) -> Self {
        Self {
            phase_prefix: mqtt.phase_topic_prefix.clone(),
            ruuvi: mqtt.ruuvi_topic.clone(),
            door: mqtt.door_topic.clone(),
            button: mqtt.button_topic.clone(),
            ventilator_status: mqtt.ventilator_status_topic.clone(),
            mcb_status,
        }
    }

    /// Everything we subscribe to.
    fn subscriptions(&self) -> Vec<String> {
        let mut subs = Vec::new();
        if let Some(prefix) = &self.phase_prefix {
            subs.push(format!("{prefix}/#"));
        }
        for topic in [
            &self.ruuvi,
            &self.door,
            &self.button,
            &self.ventilator_status,
            &self.mcb_status,
        ]
        .into_iter()
        .flatten()
        {
            subs.push(topic.clone());
        }
        subs
    }
}

// ---------------------------------------------------------------------------
// Phase accumulator
// ---------------------------------------------------------------------------

/// Collects per-phase field updates and emits a complete reading only once
/// all three phases have been observed since connection. After that, every
/// field update yields a fresh reading.
#[derive(Debug, Default)]
pub(crate) struct PhaseAccumulator {
    l1: Option<f64>,
    l2: Option<f64>,
    l3: Option<f64>,
    last_update: Option<OffsetDateTime>,
}

impl PhaseAccumulator {
    pub(crate) fn update(
        &mut self,
        phase: Phase,
        amps: f64,
        at: OffsetDateTime,
    ) -> Option<PhaseReading> {
        match phase {
            Phase::L1 => self.l1 = Some(amps),
            Phase::L2 => self.l2 = Some(amps),
            Phase::L3 => self.l3 = Some(amps),
        }
        self.last_update = Some(at);
        match (self.l1, self.l2, self.l3) {
            (Some(l1), Some(l2), Some(l3)) => Some(PhaseReading {
                l1,
                l2,
                l3,
                // Stamped with the instant the reading was assembled.
                at: self.last_update.unwrap_or(at),
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Identify the phase from the last topic segment, case-insensitive.
pub(crate) fn phase_from_segment(segment: &str) -> Option<Phase> {
    match segment.to_ascii_lowercase().as_str() {
        "l1_a" => Some(Phase::L1),
        "l2_a" => Some(Phase::L2),
        "l3_a" => Some(Phase::L3),
        _ => None,
    }
}

/// Phase payloads are plain decimal text in amperes: no JSON, no units.
pub(crate) fn parse_phase_amps(payload: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(payload).ok()?;
    let amps: f64 = s.trim().parse().ok()?;
    if amps.is_finite() && amps >= 0.0 {
        Some(amps)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct RuuviMsg {
    temp: f64,
    humidity: Option<f64>,
    batt: Option<f64>,
    rssi: Option<i64>,
}

pub(crate) fn parse_ruuvi(payload: &[u8], at: OffsetDateTime) -> Option<TemperatureReading> {
    let msg: RuuviMsg = serde_json::from_slice(payload).ok()?;
    Some(TemperatureReading {
        celsius: msg.temp,
        humidity: msg.humidity,
        battery_v: msg.batt,
        rssi: msg.rssi,
        at,
    })
}

#[derive(Debug, Deserialize)]
struct DoorMsg {
    #[serde(rename = "Window")]
    window: i64,
    #[serde(rename = "Battery")]
    battery: Option<f64>,
}

pub(crate) fn parse_door(payload: &[u8], at: OffsetDateTime) -> Option<DoorReading> {
    let msg: DoorMsg = serde_json::from_slice(payload).ok()?;
    let is_open = match msg.window {
        0 => false,
        1 => true,
        _ => return None,
    };
    Some(DoorReading {
        is_open,
        battery_pct: msg.battery,
        at,
    })
}

#[derive(Debug, Deserialize)]
struct ButtonMsg {
    action: String,
    button_id: Option<String>,
}

/// Raw button action strings vary by firmware; normalise here.
pub(crate) fn normalise_action(raw: &str) -> ButtonAction {
    match raw.to_ascii_lowercase().as_str() {
        "click" | "single_click" | "single" => ButtonAction::Click,
        "double_click" | "doubleclick" | "double" => ButtonAction::DoubleClick,
        "hold" | "long_press" => ButtonAction::Hold,
        _ => ButtonAction::Unknown,
    }
}

pub(crate) fn parse_button(payload: &[u8], at: OffsetDateTime) -> Option<ButtonPress> {
    let msg: ButtonMsg = serde_json::from_slice(payload).ok()?;
    Some(ButtonPress {
        action: normalise_action(&msg.action),
        button_id: msg.button_id,
        at,
    })
}

/// Fallback MCB status observations: plain text or `{output: bool}` JSON.
pub(crate) fn parse_mcb_status(payload: &[u8]) -> Option<McbState> {
    if let Some(on) = parse_relay_status(payload) {
        return Some(if on { McbState::On } else { McbState::Off });
    }
    let s = std::str::from_utf8(payload).ok()?;
    match s.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(McbState::On),
        "off" | "false" | "0" => Some(McbState::Off),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Dispatcher (one per connection; owns the phase accumulator)
// ---------------------------------------------------------------------------

pub(crate) struct Dispatcher {
    topics: Topics,
    accumulator: PhaseAccumulator,
    malformed: u64,
    ignored: u64,
}

impl Dispatcher {
    pub(crate) fn new(topics: Topics) -> Self {
        Self {
            topics,
            accumulator: PhaseAccumulator::default(),
            malformed: 0,
            ignored: 0,
        }
    }

    /// Route one publish to at most one typed event. `None` means dropped
    /// at the boundary (malformed or uninteresting).
    pub(crate) fn dispatch(&mut self, topic: &str, payload: &[u8]) -> Option<Event> {
        let now = OffsetDateTime::now_utc();

        if let Some(prefix) = self.topics.phase_prefix.clone() {
            if let Some(rest) = topic.strip_prefix(&format!("{prefix}/")) {
                let segment = rest.rsplit('/').next().unwrap_or(rest);
                let Some(phase) = phase_from_segment(segment) else {
                    // Other meter channels (voltage, power) share the prefix.
                    self.ignored += 1;
                    debug!(topic, ignored = self.ignored, "meter channel ignored");
                    return None;
                };
                let Some(amps) = parse_phase_amps(payload) else {
                    self.note_malformed(topic);
                    return None;
                };
                return self
                    .accumulator
                    .update(phase, amps, now)
                    .map(Event::PhaseReading);
            }
        }

        if self.topics.ruuvi.as_deref() == Some(topic) {
            return match parse_ruuvi(payload, now) {
                Some(t) => Some(Event::Temperature(t)),
                None => self.note_malformed(topic),
            };
        }
        if self.topics.door.as_deref() == Some(topic) {
            return match parse_door(payload, now) {
                Some(d) => Some(Event::Door(d)),
                None => self.note_malformed(topic),
            };
        }
        if self.topics.button.as_deref() == Some(topic) {
            return match parse_button(payload, now) {
                Some(b) => Some(Event::Button(b)),
                None => self.note_malformed(topic),
            };
        }
        if self.topics.ventilator_status.as_deref() == Some(topic) {
            return match parse_relay_status(payload) {
                Some(on) => Some(Event::VentilatorStatus(on)),
                None => self.note_malformed(topic),
            };
        }
        if self.topics.mcb_status.as_deref() == Some(topic) {
            return match parse_mcb_status(payload) {
                Some(state) => Some(Event::McbObserved(state, McbSource::Mqtt)),
                None => self.note_malformed(topic),
            };
        }

        self.ignored += 1;
        debug!(topic, ignored = self.ignored, "unhandled topic");
        None
    }

    fn note_malformed(&mut self, topic: &str) -> Option<Event> {
        self.malformed += 1;
        warn!(topic, dropped = self.malformed, "malformed payload dropped");
        None
    }
}

// ---------------------------------------------------------------------------
// Ingest task
// ---------------------------------------------------------------------------

/// Run the MQTT ingest loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    cfg: MqttConfig,
    topics: Topics,
    bus: BusSender,
    connected: Arc<AtomicBool>,
) {
    let subscriptions = topics.subscriptions();
    if subscriptions.is_empty() {
        info!("no mqtt topics configured, ingest disabled");
        return;
    }

    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(false);
    options.set_last_will(LastWill::new(
        HUB_STATUS_TOPIC,
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));

    if let (Some(user), Some(pass)) = (cfg.username.clone(), cfg.password.clone()) {
        options.set_credentials(user, pass);
        info!("mqtt: using password authentication");
    } else {
        warn!("mqtt credentials not set, connecting without authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(options, 20);
    let mut dispatcher = Dispatcher::new(topics);

    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(p))) => {
                if let Some(event) = dispatcher.dispatch(&p.topic, &p.payload) {
                    bus.send(event).await;
                }
            }

            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                connected.store(true, Ordering::Relaxed);

                // Re-subscribe on every (re)connect; the broker may have
                // lost our session even with clean_session(false).
                for sub in &subscriptions {
                    if let Err(e) = client.subscribe(sub.clone(), QoS::AtLeastOnce).await {
                        error!(topic = %sub, "mqtt subscribe failed: {e}");
                    }
                }
                let _ = client
                    .publish(HUB_STATUS_TOPIC, QoS::AtLeastOnce, true, b"online".to_vec())
                    .await;
            }

            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                connected.store(false, Ordering::Relaxed);
            }

            Ok(_) => {}

            Err(e) => {
                connected.store(false, Ordering::Relaxed);
                warn!("mqtt error, retrying in 2s: {e}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics {
            phase_prefix: Some("meter/sauna".to_string()),
            ruuvi: Some("ruuvi/sauna".to_string()),
            door: Some("zigbee/door".to_string()),
            button: Some("flic/sauna".to_string()),
            ventilator_status: Some("vent/status".to_string()),
            mcb_status: Some("breaker/status".to_string()),
        }
    }

    // -- phase topic parsing ------------------------------------------------

    #[test]
    fn phase_segment_matches_case_insensitively() {
        assert_eq!(phase_from_segment("l1_a"), Some(Phase::L1));
        assert_eq!(phase_from_segment("L2_A"), Some(Phase::L2));
        assert_eq!(phase_from_segment("L3_a"), Some(Phase::L3));
        assert_eq!(phase_from_segment("l1_v"), None);
        assert_eq!(phase_from_segment("total_w"), None);
    }

    #[test]
    fn phase_payload_is_plain_decimal_text() {
        assert_eq!(parse_phase_amps(b"12.0"), Some(12.0));
        assert_eq!(parse_phase_amps(b" 7 \n"), Some(7.0));
        assert_eq!(parse_phase_amps(b"0"), Some(0.0));
        assert_eq!(parse_phase_amps(b"-3.0"), None);
        assert_eq!(parse_phase_amps(b"NaN"), None);
        assert_eq!(parse_phase_amps(b"{\"amps\":12}"), None);
        assert_eq!(parse_phase_amps(b"12A"), None);
    }

    // -- accumulator (scenario: partial phase data) --------------------------

    #[test]
    fn accumulator_emits_only_when_complete() {
        let mut acc = PhaseAccumulator::default();
        let at = OffsetDateTime::UNIX_EPOCH;
        assert!(acc.update(Phase::L1, 12.0, at).is_none());
        assert!(acc.update(Phase::L2, 7.0, at).is_none());

        let reading = acc.update(Phase::L3, 3.0, at).unwrap();
        assert_eq!((reading.l1, reading.l2, reading.l3), (12.0, 7.0, 3.0));
    }

    #[test]
    fn accumulator_emits_on_every_update_once_complete() {
        let mut acc = PhaseAccumulator::default();
        let at = OffsetDateTime::UNIX_EPOCH;
        acc.update(Phase::L1, 12.0, at);
        acc.update(Phase::L2, 7.0, at);
        acc.update(Phase::L3, 3.0, at);

        let reading = acc.update(Phase::L1, 28.0, at).unwrap();
        assert_eq!((reading.l1, reading.l2, reading.l3), (28.0, 7.0, 3.0));
    }

    #[test]
    fn accumulator_repeated_same_phase_stays_incomplete() {
        let mut acc = PhaseAccumulator::default();
        let at = OffsetDateTime::UNIX_EPOCH;
        assert!(acc.update(Phase::L1, 12.0, at).is_none());
        assert!(acc.update(Phase::L1, 13.0, at).is_none());
        assert!(acc.update(Phase::L1, 14.0, at).is_none());
    }

    // -- dispatcher: phases --------------------------------------------------

    #[test]
    fn dispatch_assembles_phase_reading() {
        let mut d = Dispatcher::new(topics());
        assert!(d.dispatch("meter/sauna/l1_a", b"12.0").is_none());
        assert!(d.dispatch("meter/sauna/l2_a", b"7.0").is_none());
        match d.dispatch("meter/sauna/l3_a", b"3.0") {
            Some(Event::PhaseReading(p)) => {
                assert_eq!((p.l1, p.l2, p.l3), (12.0, 7.0, 3.0));
            }
            other => panic!("expected phase reading, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_ignores_other_meter_channels() {
        let mut d = Dispatcher::new(topics());
        assert!(d.dispatch("meter/sauna/l1_v", b"231.4").is_none());
        assert!(d.dispatch("meter/sauna/total_w", b"9100").is_none());
        assert_eq!(d.malformed, 0);
    }

    #[test]
    fn dispatch_counts_malformed_phase_payload() {
        let mut d = Dispatcher::new(topics());
        assert!(d.dispatch("meter/sauna/l1_a", b"garbage").is_none());
        assert_eq!(d.malformed, 1);
    }

    #[test]
    fn dispatch_matches_nested_phase_topic() {
        let mut d = Dispatcher::new(topics());
        // Deeper nesting still keys off the last segment.
        assert!(d.dispatch("meter/sauna/emeter/0/l1_a", b"5.0").is_none());
        assert!(d.dispatch("meter/sauna/emeter/0/l2_a", b"5.0").is_none());
        assert!(d
            .dispatch("meter/sauna/emeter/0/l3_a", b"5.0")
            .is_some_and(|e| matches!(e, Event::PhaseReading(_))));
    }

    // -- dispatcher: sensors --------------------------------------------------

    #[test]
    fn dispatch_ruuvi_reading() {
        let mut d = Dispatcher::new(topics());
        let payload = br#"{"temp":71.5,"humidity":14.0,"batt":2.93,"rssi":-72}"#;
        match d.dispatch("ruuvi/sauna", payload) {
            Some(Event::Temperature(t)) => {
                assert_eq!(t.celsius, 71.5);
                assert_eq!(t.humidity, Some(14.0));
                assert_eq!(t.battery_v, Some(2.93));
                assert_eq!(t.rssi, Some(-72));
            }
            other => panic!("expected temperature, got {other:?}"),
        }
    }

    #[test]
    fn ruuvi_temp_is_required() {
        let mut d = Dispatcher::new(topics());
        assert!(d.dispatch("ruuvi/sauna", br#"{"humidity":14.0}"#).is_none());
        assert_eq!(d.malformed, 1);
    }

    #[test]
    fn dispatch_door_reading() {
        let mut d = Dispatcher::new(topics());
        match d.dispatch("zigbee/door", br#"{"Window":1,"Battery":95}"#) {
            Some(Event::Door(r)) => {
                assert!(r.is_open);
                assert_eq!(r.battery_pct, Some(95.0));
            }
            other => panic!("expected door, got {other:?}"),
        }
        match d.dispatch("zigbee/door", br#"{"Window":0}"#) {
            Some(Event::Door(r)) => assert!(!r.is_open),
            other => panic!("expected door, got {other:?}"),
        }
    }

    #[test]
    fn door_window_out_of_range_is_malformed() {
        let mut d = Dispatcher::new(topics());
        assert!(d.dispatch("zigbee/door", br#"{"Window":2}"#).is_none());
        assert_eq!(d.malformed, 1);
    }

    #[test]
    fn dispatch_button_press() {
        let mut d = Dispatcher::new(topics());
        match d.dispatch("flic/sauna", br#"{"action":"single_click","button_id":"flic-1"}"#) {
            Some(Event::Button(b)) => {
                assert_eq!(b.action, ButtonAction::Click);
                assert_eq!(b.button_id.as_deref(), Some("flic-1"));
            }
            other => panic!("expected button, got {other:?}"),
        }
    }

    #[test]
    fn action_normalisation_table() {
        assert_eq!(normalise_action("click"), ButtonAction::Click);
        assert_eq!(normalise_action("single_click"), ButtonAction::Click);
        assert_eq!(normalise_action("double_click"), ButtonAction::DoubleClick);
        assert_eq!(normalise_action("doubleclick"), ButtonAction::DoubleClick);
        assert_eq!(normalise_action("HOLD"), ButtonAction::Hold);
        assert_eq!(normalise_action("long_press"), ButtonAction::Hold);
        assert_eq!(normalise_action("quadruple_click"), ButtonAction::Unknown);
    }

    #[test]
    fn dispatch_ventilator_status_shapes() {
        let mut d = Dispatcher::new(topics());
        for (payload, expected) in [
            (br#"{"output":true}"#.as_slice(), true),
            (br#"{"switch:0":{"output":false}}"#.as_slice(), false),
            (br#"{"status":true}"#.as_slice(), true),
            (br#"{"state":"Off"}"#.as_slice(), false),
        ] {
            match d.dispatch("vent/status", payload) {
                Some(Event::VentilatorStatus(on)) => assert_eq!(on, expected),
                other => panic!("expected ventilator status, got {other:?}"),
            }
        }
    }

    // -- dispatcher: mcb fallback observer ------------------------------------

    #[test]
    fn dispatch_mcb_status_text_and_json() {
        let mut d = Dispatcher::new(topics());
        match d.dispatch("breaker/status", b"on") {
            Some(Event::McbObserved(McbState::On, McbSource::Mqtt)) => {}
            other => panic!("expected mcb observed, got {other:?}"),
        }
        match d.dispatch("breaker/status", b"OFF") {
            Some(Event::McbObserved(McbState::Off, McbSource::Mqtt)) => {}
            other => panic!("expected mcb observed, got {other:?}"),
        }
        match d.dispatch("breaker/status", br#"{"output":true}"#) {
            Some(Event::McbObserved(McbState::On, McbSource::Mqtt)) => {}
            other => panic!("expected mcb observed, got {other:?}"),
        }
    }

    #[test]
    fn mcb_status_garbage_is_malformed() {
        let mut d = Dispatcher::new(topics());
        assert!(d.dispatch("breaker/status", b"maybe").is_none());
        assert_eq!(d.malformed, 1);
    }

    // -- dispatcher: routing ---------------------------------------------------

    #[test]
    fn unrelated_topics_are_ignored_not_malformed() {
        let mut d = Dispatcher::new(topics());
        assert!(d.dispatch("some/other/topic", b"1").is_none());
        assert_eq!(d.malformed, 0);
    }

    #[test]
    fn subscriptions_cover_configured_topics() {
        let t = topics();
        let subs = t.subscriptions();
        assert!(subs.contains(&"meter/sauna/#".to_string()));
        assert!(subs.contains(&"ruuvi/sauna".to_string()));
        assert!(subs.contains(&"breaker/status".to_string()));
        assert_eq!(subs.len(), 6);
    }
}
