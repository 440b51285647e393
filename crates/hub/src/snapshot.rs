//! The live snapshot and its broadcaster.
//!
//! The supervisor publishes an immutable snapshot after every transition;
//! subscribers (the SSE layer, tests) observe them in publish order. Each
//! subscriber rides a depth-8 broadcast buffer: a slow consumer loses the
//! oldest pending snapshots and keeps the newest, never sees duplicates,
//! never sees reordering. A new subscriber gets the current snapshot
//! immediately as its first delivery.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::event::{
    DoorReading, FloorHeatingReading, McbSource, McbState, PhaseReading, TemperatureReading,
};
use crate::ventilator::VentilatorSummary;

/// Per-subscriber buffer depth. Liveness beats history.
pub const SUBSCRIBER_BUFFER: usize = 8;

// ---------------------------------------------------------------------------
// Snapshot record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub mcb: McbState,
    pub mcb_source: McbSource,
    pub phases: Option<PhaseReading>,
    pub temperature: Option<TemperatureReading>,
    pub door: Option<DoorReading>,
    pub ventilator: Option<VentilatorSummary>,
    pub floor_heating: Option<FloorHeatingReading>,
    pub last_safety_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

pub struct Subscription {
    pub id: u64,
    /// The snapshot current at subscribe time, delivered first.
    pub current: Option<Snapshot>,
    pub rx: broadcast::Receiver<Snapshot>,
}

pub struct Broadcaster {
    tx: broadcast::Sender<Snapshot>,
    latest: Mutex<Option<Snapshot>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            tx,
            latest: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Store the snapshot as latest and fan it out. Returns the number of
    /// subscribers it reached.
    pub fn publish(&self, snapshot: Snapshot) -> usize {
        // Send under the same lock subscribe takes, so a subscriber never
        // observes a snapshot both as `current` and on its channel.
        let mut latest = self.latest.lock().unwrap();
        *latest = Some(snapshot.clone());
        self.tx.send(snapshot).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        let latest = self.latest.lock().unwrap();
        Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            current: latest.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.lock().unwrap().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Named wire records (what a live subscriber actually receives)
// ---------------------------------------------------------------------------

/// One named record on the live stream, e.g. `mcb_status` with a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    pub name: &'static str,
    pub data: Value,
}

/// The synthetic first record of a new subscription.
pub fn connected_record(subscriber_id: u64) -> WireRecord {
    WireRecord {
        name: "connected",
        data: json!({ "subscriberId": subscriber_id }),
    }
}

/// Expand a snapshot into its named records, skipping subsystems that have
/// not reported yet.
pub fn wire_records(s: &Snapshot) -> Vec<WireRecord> {
    let mut records = vec![WireRecord {
        name: "mcb_status",
        data: json!({ "status": s.mcb, "source": s.mcb_source }),
    }];

    if let Some(p) = &s.phases {
        records.push(WireRecord {
            name: "sensor_data",
            data: json!({ "l1": p.l1, "l2": p.l2, "l3": p.l3 }),
        });
    }
    if let Some(t) = &s.temperature {
        records.push(WireRecord {
            name: "temperature",
            data: json!({ "temperature": t.celsius, "humidity": t.humidity }),
        });
    }
    if let Some(d) = &s.door {
        records.push(WireRecord {
            name: "door",
            data: json!({ "isOpen": d.is_open }),
        });
    }
    if let Some(v) = &s.ventilator {
        records.push(WireRecord {
            name: "ventilator",
            data: json!({
                "status": v.relay_is_on,
                "delayedOffRemaining": v.delayed_off_remaining_ms,
            }),
        });
    }
    if let Some(f) = &s.floor_heating {
        records.push(WireRecord {
            name: "floor_heating",
            data: json!({
                "currentTemp": f.current_c,
                "targetTemp": f.target_c,
                "mode": f.mode,
                "action": f.action,
            }),
        });
    }
    records
}

// ===========================================================================
// Tests
// ===========================================================================
