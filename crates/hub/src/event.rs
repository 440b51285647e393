//! Typed events and the bounded single-consumer bus feeding the supervisor.
//!
//! Everything that can change supervisor state arrives here: device
//! observations, sensor readings, button presses, operator commands, timer
//! firings, and shutdown. Producers run on their own tasks and only ever
//! enqueue; the supervisor is the sole consumer.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::timer::TimerId;

/// How long a producer of a critical event is willing to wait for queue
/// space before evicting a non-critical entry.
const CRITICAL_ENQUEUE_WAIT_MS: u64 = 100;

// ---------------------------------------------------------------------------
// Domain value types carried by events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McbState {
    On,
    Off,
    Unknown,
}

/// Which channel the latest MCB knowledge came from. The local RPC channel
/// is authoritative; the MQTT status topic is a fallback observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McbSource {
    Local,
    Mqtt,
    Command,
}

/// One complete three-phase current reading. Only ever constructed once all
/// three per-phase fields have been observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseReading {
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub humidity: Option<f64>,
    pub battery_v: Option<f64>,
    pub rssi: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DoorReading {
    pub is_open: bool,
    pub battery_pct: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Click,
    DoubleClick,
    Hold,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ButtonPress {
    pub action: ButtonAction,
    pub button_id: Option<String>,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FloorHeatingMode {
    Auto,
    Manual,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FloorHeatingAction {
    Heating,
    Warming,
    Idle,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FloorHeatingReading {
    pub mode: FloorHeatingMode,
    pub action: FloorHeatingAction,
    pub target_c: f64,
    pub current_c: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Operator commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    TurnOn,
    TurnOff,
    Toggle,
    ForceOn,
    ForceOff,
    TestNotify,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CommandOutcome {
    pub mcb: McbState,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("device call timed out")]
    Timeout,
    #[error("device error: {0}")]
    Device(String),
    #[error("mcb state unknown; use force-on or force-off")]
    StateUnknown,
    #[error("notification failed: {0}")]
    Notify(String),
    #[error("notifications are not configured")]
    NotifierUnavailable,
}

impl CommandError {
    /// Stable machine-readable kind for the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Timeout => "timeout",
            CommandError::Device(_) => "device",
            CommandError::StateUnknown => "state_unknown",
            CommandError::Notify(_) => "notify",
            CommandError::NotifierUnavailable => "notifier_unavailable",
        }
    }
}

pub type CommandReply = oneshot::Sender<Result<CommandOutcome, CommandError>>;

/// An operator command plus the channel its result goes back on. Button
/// presses resolve to commands without a reply channel.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: OperatorCommand,
    pub reply: Option<CommandReply>,
}

// ---------------------------------------------------------------------------
// The event union
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Event {
    McbObserved(McbState, McbSource),
    PhaseReading(PhaseReading),
    Temperature(TemperatureReading),
    Door(DoorReading),
    Button(ButtonPress),
    Command(CommandRequest),
    VentilatorStatus(bool),
    FloorHeatingStatus(FloorHeatingReading),
    TimerFired(TimerId),
    Shutdown,
}

impl Event {
    /// Critical events are never dropped by the bus overflow policy.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Event::McbObserved(..) | Event::PhaseReading(_) | Event::Shutdown
        )
    }

    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::McbObserved(..) => "mcb_observed",
            Event::PhaseReading(_) => "phase_reading",
            Event::Temperature(_) => "temperature",
            Event::Door(_) => "door",
            Event::Button(_) => "button",
            Event::Command(_) => "command",
            Event::VentilatorStatus(_) => "ventilator_status",
            Event::FloorHeatingStatus(_) => "floor_heating_status",
            Event::TimerFired(_) => "timer_fired",
            Event::Shutdown => "shutdown",
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded single-consumer bus
// ---------------------------------------------------------------------------

struct BusShared {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    /// Signalled when an event is enqueued.
    consumer: Notify,
    /// Signalled when the consumer pops and space opens up.
    space: Notify,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct BusSender {
    shared: Arc<BusShared>,
}

pub struct BusReceiver {
    shared: Arc<BusShared>,
}

/// Create a bus with the given capacity. One receiver, any number of
/// cloned senders.
pub fn channel(capacity: usize) -> (BusSender, BusReceiver) {
    let shared = Arc::new(BusShared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        consumer: Notify::new(),
        space: Notify::new(),
        dropped: AtomicU64::new(0),
    });
    (
        BusSender {
            shared: Arc::clone(&shared),
        },
        BusReceiver { shared },
    )
}

impl BusSender {
    /// Enqueue an event.
    ///
    /// Non-critical events on a full queue evict the oldest non-critical
    /// entry (or are themselves discarded if the queue holds only critical
    /// entries). Critical events wait up to 100 ms for space, then evict the
    /// oldest non-critical entry; if every entry is critical the queue is
    /// allowed to exceed capacity rather than lose a safety event.
    pub async fn send(&self, event: Event) {
        if event.is_critical() {
            self.send_critical(event).await;
        } else {
            self.send_droppable(event);
        }
    }

    fn send_droppable(&self, event: Event) {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() < self.shared.capacity {
            queue.push_back(event);
            drop(queue);
            self.shared.consumer.notify_one();
            return;
        }

        match queue.iter().position(|e| !e.is_critical()) {
            Some(pos) => {
                let evicted = queue.remove(pos);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    evicted = evicted.as_ref().map(Event::tag),
                    "event bus full, evicted oldest non-critical event"
                );
                queue.push_back(event);
                drop(queue);
                self.shared.consumer.notify_one();
            }
            None => {
                // Queue entirely critical; the incoming non-critical event
                // is the one that loses.
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    dropped = event.tag(),
                    "event bus full of critical events, dropped incoming event"
                );
            }
        }
    }

    async fn send_critical(&self, event: Event) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(CRITICAL_ENQUEUE_WAIT_MS);
        loop {
            let notified = self.shared.space.notified();
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if queue.len() < self.shared.capacity {
                    queue.push_back(event);
                    drop(queue);
                    self.shared.consumer.notify_one();
                    return;
                }
            }

            if timeout(deadline.saturating_duration_since(tokio::time::Instant::now()), notified)
                .await
                .is_ok()
            {
                // Space may have opened; retry the push.
                continue;
            }

            // Waited the full grace period; make room.
            let mut queue = self.shared.queue.lock().unwrap();
            if let Some(pos) = queue.iter().position(|e| !e.is_critical()) {
                let evicted = queue.remove(pos);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    evicted = evicted.as_ref().map(Event::tag),
                    "event bus full, evicted non-critical event for critical producer"
                );
            }
            queue.push_back(event);
            drop(queue);
            self.shared.consumer.notify_one();
            return;
        }
    }

    /// Number of events discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl BusReceiver {
    /// Receive the next event, waiting if the queue is empty.
    pub async fn recv(&mut self) -> Event {
        loop {
            let notified = self.shared.consumer.notified();
            let popped = self.shared.queue.lock().unwrap().pop_front();
            if let Some(event) = popped {
                self.shared.space.notify_one();
                return event;
            }
            notified.await;
        }
    }

    /// Non-blocking receive, used when draining at shutdown.
    pub fn try_recv(&mut self) -> Option<Event> {
        let popped = self.shared.queue.lock().unwrap().pop_front();
        if popped.is_some() {
            self.shared.space.notify_one();
        }
        popped
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn door_event() -> Event {
        Event::Door(DoorReading {
            is_open: false,
            battery_pct: None,
            at: OffsetDateTime::UNIX_EPOCH,
        })
    }

    fn phase_event(l1: f64) -> Event {
        Event::PhaseReading(PhaseReading {
            l1,
            l2: 0.0,
            l3: 0.0,
            at: OffsetDateTime::UNIX_EPOCH,
        })
    }

    // -- criticality --------------------------------------------------------

    #[test]
    fn phase_and_mcb_and_shutdown_are_critical() {
        assert!(phase_event(1.0).is_critical());
        assert!(Event::McbObserved(McbState::On, McbSource::Local).is_critical());
        assert!(Event::Shutdown.is_critical());
    }

    #[test]
    fn sensor_events_are_droppable() {
        assert!(!door_event().is_critical());
        assert!(!Event::VentilatorStatus(true).is_critical());
        assert!(!Event::TimerFired(7).is_critical());
    }

    // -- FIFO ordering ------------------------------------------------------

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (tx, mut rx) = channel(16);
        tx.send(Event::TimerFired(1)).await;
        tx.send(Event::TimerFired(2)).await;
        tx.send(Event::TimerFired(3)).await;

        for expected in 1..=3u64 {
            match rx.recv().await {
                Event::TimerFired(id) => assert_eq!(id, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn recv_waits_for_producer() {
        let (tx, mut rx) = channel(4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.send(Event::TimerFired(42)).await;
        match handle.await.unwrap() {
            Event::TimerFired(42) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    // -- overflow policy ----------------------------------------------------

    #[tokio::test]
    async fn overflow_drops_oldest_non_critical() {
        let (tx, mut rx) = channel(2);
        tx.send(Event::TimerFired(1)).await;
        tx.send(Event::TimerFired(2)).await;
        // Full. The oldest non-critical entry (id 1) must go.
        tx.send(Event::TimerFired(3)).await;

        assert_eq!(tx.dropped(), 1);
        match rx.recv().await {
            Event::TimerFired(2) => {}
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await {
            Event::TimerFired(3) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn critical_events_survive_overflow() {
        let (tx, mut rx) = channel(2);
        tx.send(phase_event(1.0)).await;
        tx.send(Event::TimerFired(9)).await;
        // Full; the critical producer evicts the timer event after its
        // grace period instead of losing the reading.
        tx.send(phase_event(2.0)).await;

        assert_eq!(tx.dropped(), 1);
        match rx.recv().await {
            Event::PhaseReading(p) => assert_eq!(p.l1, 1.0),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await {
            Event::PhaseReading(p) => assert_eq!(p.l1, 2.0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_critical_queue_exceeds_capacity_rather_than_dropping() {
        let (tx, mut rx) = channel(2);
        tx.send(phase_event(1.0)).await;
        tx.send(phase_event(2.0)).await;
        tx.send(phase_event(3.0)).await;

        assert_eq!(tx.dropped(), 0);
        for expected in [1.0, 2.0, 3.0] {
            match rx.recv().await {
                Event::PhaseReading(p) => assert_eq!(p.l1, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn incoming_non_critical_dropped_when_queue_all_critical() {
        let (tx, _rx) = channel(1);
        tx.send(phase_event(1.0)).await;
        tx.send(Event::TimerFired(5)).await;
        assert_eq!(tx.dropped(), 1);
    }

    // -- try_recv -----------------------------------------------------------

    #[tokio::test]
    async fn try_recv_returns_none_when_empty() {
        let (_tx, mut rx) = channel(4);
        assert!(rx.try_recv().is_none());
    }

    // -- command error kinds ------------------------------------------------

    #[test]
    fn command_error_kinds_are_stable() {
        assert_eq!(CommandError::Timeout.kind(), "timeout");
        assert_eq!(CommandError::Device("x".into()).kind(), "device");
        assert_eq!(CommandError::StateUnknown.kind(), "state_unknown");
    }
}
