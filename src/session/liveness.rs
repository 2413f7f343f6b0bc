//! Per-session liveness and rekey bookkeeping
//!
//! The tracker is plain state driven by timestamps; the supervisor calls
//! [`LivenessTracker::evaluate`] on every tick and acts on the result.

use super::CloseReason;
use crate::policy::SessionTimers;
use tokio::time::Instant;

/// What the supervisor should do for a session right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessAction {
    Nothing,
    /// Send a DPD request on the control channel
    Probe,
    /// Start a new cipher epoch
    Rekey,
    Close(CloseReason),
}

#[derive(Debug, Clone)]
pub struct LivenessTracker {
    timers: SessionTimers,
    last_activity: Instant,
    last_data: Instant,
    /// Consecutive DPD intervals without any inbound traffic
    missed: u32,
    next_check: Instant,
    epoch_started: Instant,
    rekey_pending: bool,
}

impl LivenessTracker {
    pub fn new(timers: SessionTimers, now: Instant) -> Self {
        Self {
            timers,
            last_activity: now,
            last_data: now,
            missed: 0,
            next_check: now + timers.dpd_interval,
            epoch_started: now,
            rekey_pending: false,
        }
    }

    /// Record inbound traffic. Only `data` traffic defers the idle timeout.
    pub fn on_activity(&mut self, now: Instant, data: bool) {
        self.last_activity = now;
        if data {
            self.last_data = now;
        }
        self.missed = 0;
        self.next_check = now + self.timers.dpd_interval;
    }

    pub fn evaluate(&mut self, now: Instant) -> LivenessAction {
        if let Some(idle) = self.timers.idle_timeout {
            if now.saturating_duration_since(self.last_data) >= idle {
                return LivenessAction::Close(CloseReason::IdleTimeout);
            }
        }

        if now >= self.next_check {
            self.missed += 1;
            if self.missed >= self.timers.dpd_max_missed {
                return LivenessAction::Close(CloseReason::DeadPeer);
            }
            self.next_check = now + self.timers.dpd_interval;
            return LivenessAction::Probe;
        }

        if let Some(rekey) = self.timers.rekey_interval {
            if !self.rekey_pending && now.saturating_duration_since(self.epoch_started) >= rekey {
                self.rekey_pending = true;
                return LivenessAction::Rekey;
            }
        }

        LivenessAction::Nothing
    }

    /// A rekey finished (successfully or by degrading to control-only)
    pub fn on_rekeyed(&mut self, now: Instant) {
        self.epoch_started = now;
        self.rekey_pending = false;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn missed_probes(&self) -> u32 {
        self.missed
    }
}
