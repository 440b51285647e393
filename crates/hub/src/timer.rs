//! Clock and timer service.
//!
//! Timers never run logic of their own: firing delivers `Event::TimerFired`
//! into the bus and the owning component reacts inside the supervisor task.
//! Every armed timer gets a fresh id from a monotone counter; the id acts as
//! the handle's generation. `cancel` removes the id from the live registry
//! and aborts the backing task, so a firing that is already queued on the
//! bus is recognised as stale at dispatch (`is_live` returns false) and
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};

use crate::event::{BusSender, Event};

pub type TimerId = u64;

/// Handle to an armed timer. Owned by the component that armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    id: TimerId,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }
}

pub struct TimerService {
    bus: BusSender,
    next_id: AtomicU64,
    live: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(bus: BusSender) -> Self {
        Self {
            bus,
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Current monotonic instant.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Arm a one-shot timer that delivers `TimerFired` once after `dur`.
    pub fn after(&self, dur: Duration) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bus = self.bus.clone();
        let task = tokio::spawn(async move {
            sleep(dur).await;
            bus.send(Event::TimerFired(id)).await;
        });
        self.live.lock().unwrap().insert(id, task);
        TimerHandle { id }
    }

    /// Arm a periodic timer delivering `TimerFired` every `dur`, first
    /// firing one period from now.
    pub fn every(&self, dur: Duration) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bus = self.bus.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + dur, dur);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                bus.send(Event::TimerFired(id)).await;
            }
        });
        self.live.lock().unwrap().insert(id, task);
        TimerHandle { id }
    }

    /// Cancel a timer. Idempotent; guarantees no further firing of this
    /// handle is honoured, even one already queued on the bus.
    pub fn cancel(&self, handle: &TimerHandle) {
        if let Some(task) = self.live.lock().unwrap().remove(&handle.id) {
            task.abort();
        }
    }

    /// Whether a firing with this id should still be honoured.
    pub fn is_live(&self, id: TimerId) -> bool {
        self.live.lock().unwrap().contains_key(&id)
    }

    /// Cancel everything. Used at shutdown.
    pub fn cancel_all(&self) {
        let mut live = self.live.lock().unwrap();
        for (_, task) in live.drain() {
            task.abort();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;

    async fn expect_fired(rx: &mut event::BusReceiver) -> TimerId {
        match rx.recv().await {
            Event::TimerFired(id) => id,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn after_fires_once() {
        let (tx, mut rx) = event::channel(16);
        let timers = TimerService::new(tx);

        let handle = timers.after(Duration::from_secs(60));
        assert!(timers.is_live(handle.id()));

        let id = expect_fired(&mut rx).await;
        assert_eq!(id, handle.id());
        assert!(timers.is_live(id), "one-shot stays live until cancelled");

        // No second firing.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn every_fires_repeatedly() {
        let (tx, mut rx) = event::channel(16);
        let timers = TimerService::new(tx);

        let handle = timers.every(Duration::from_secs(10));
        for _ in 0..3 {
            assert_eq!(expect_fired(&mut rx).await, handle.id());
        }
        timers.cancel(&handle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_delivery() {
        let (tx, mut rx) = event::channel(16);
        let timers = TimerService::new(tx);

        let handle = timers.after(Duration::from_secs(60));
        timers.cancel(&handle);
        assert!(!timers.is_live(handle.id()));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (tx, _rx) = event::channel(16);
        let timers = TimerService::new(tx);

        let handle = timers.after(Duration::from_secs(1));
        timers.cancel(&handle);
        timers.cancel(&handle);
        assert!(!timers.is_live(handle.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_firing_is_stale_after_cancel() {
        let (tx, mut rx) = event::channel(16);
        let timers = TimerService::new(tx);

        let handle = timers.after(Duration::from_secs(5));
        // Let the timer fire and its event land on the bus.
        let id = expect_fired(&mut rx).await;

        // The consumer has not dispatched yet when cancel arrives.
        timers.cancel(&handle);
        assert!(
            !timers.is_live(id),
            "dispatch must treat the queued firing as stale"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handles_get_distinct_ids() {
        let (tx, _rx) = event::channel(16);
        let timers = TimerService::new(tx);

        let a = timers.after(Duration::from_secs(100));
        let b = timers.every(Duration::from_secs(100));
        assert_ne!(a.id(), b.id());
        timers.cancel_all();
        assert!(!timers.is_live(a.id()));
        assert!(!timers.is_live(b.id()));
    }
}
