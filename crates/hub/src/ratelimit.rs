//! Cooldown gate for outbound operator notifications.
//!
//! `allow` is pure and never shifts the window; `mark_sent` is the only
//! writer and must be called only after a notification actually went out.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    SafetyShutdown,
    TemperatureAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ok,
    Denied { remaining: Duration },
}

pub struct RateLimiter {
    cooldowns: HashMap<NotificationKind, Duration>,
    last_sent: HashMap<NotificationKind, Instant>,
}

impl RateLimiter {
    pub fn new(safety_shutdown: Duration, temperature_alert: Duration) -> Self {
        let mut cooldowns = HashMap::new();
        cooldowns.insert(NotificationKind::SafetyShutdown, safety_shutdown);
        cooldowns.insert(NotificationKind::TemperatureAlert, temperature_alert);
        Self {
            cooldowns,
            last_sent: HashMap::new(),
        }
    }

    /// Check whether a notification of `kind` may be sent at `now`.
    /// Side-effect free; a denied attempt does not shift the window.
    pub fn allow(&self, kind: NotificationKind, now: Instant) -> Decision {
        let cooldown = self.cooldown(kind);
        match self.last_sent.get(&kind) {
            Some(&sent) => {
                let elapsed = now.saturating_duration_since(sent);
                if elapsed >= cooldown {
                    Decision::Ok
                } else {
                    Decision::Denied {
                        remaining: cooldown - elapsed,
                    }
                }
            }
            None => Decision::Ok,
        }
    }

    /// Record a successful send. Ledger entries are monotone: an earlier
    /// instant never overwrites a later one.
    pub fn mark_sent(&mut self, kind: NotificationKind, now: Instant) {
        self.last_sent
            .entry(kind)
            .and_modify(|t| {
                if now > *t {
                    *t = now;
                }
            })
            .or_insert(now);
    }

    fn cooldown(&self, kind: NotificationKind) -> Duration {
        self.cooldowns.get(&kind).copied().unwrap_or(Duration::ZERO)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
