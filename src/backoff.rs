//! Exponential backoff.
//!
//! Doubles on every [`increment`](Backoff::increment), saturating at the
//! ceiling; [`reset`](Backoff::reset) returns to the base.  Shared by the
//! MQTT reconnect throttle and PDP activation retries.

/// Delay generator with `base ≤ current ≤ max` at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u32,
    max_ms: u32,
    current_ms: u32,
}

impl Backoff {
    /// A ceiling below the base is clamped up to the base.
    pub const fn new(base_ms: u32, max_ms: u32) -> Self {
        let max_ms = if max_ms < base_ms { base_ms } else { max_ms };
        Self {
            base_ms,
            max_ms,
            current_ms: base_ms,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&self) -> u32 {
        self.current_ms
    }

    pub fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }

    pub fn increment(&mut self) {
        self.current_ms = self.current_ms.saturating_mul(2).min(self.max_ms);
    }

    pub fn base_ms(&self) -> u32 {
        self.base_ms
    }

    pub fn max_ms(&self) -> u32 {
        self.max_ms
    }
}
