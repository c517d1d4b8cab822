//! Gate cooldown and request de-duplication.
//!
//! The backend retries commands it has not seen acknowledged, so the same
//! `requestId` may arrive more than once.  A small ring of recently handled
//! ids (oldest evicted first) keeps a retry from pulsing the relay twice, and
//! a cooldown keeps two distinct requests from re-triggering the motor
//! mid-travel.

use log::{debug, info};

use crate::protocol::RequestId;
use crate::text;

/// Number of request ids remembered.
pub const DEDUPE_CAPACITY: usize = 16;

pub struct GateControl {
    cooldown_ms: u32,
    last_open_ms: Option<u64>,
    processed: heapless::Deque<RequestId, DEDUPE_CAPACITY>,
}

impl GateControl {
    pub fn new(cooldown_ms: u32) -> Self {
        Self {
            cooldown_ms,
            last_open_ms: None,
            processed: heapless::Deque::new(),
        }
    }

    /// `(allowed, remaining_ms)`.  Always allowed before the first opening.
    pub fn can_execute_now(&self, now_ms: u64) -> (bool, u32) {
        let Some(last) = self.last_open_ms else {
            return (true, 0);
        };
        let elapsed = now_ms.saturating_sub(last);
        let cooldown = u64::from(self.cooldown_ms);
        if elapsed >= cooldown {
            (true, 0)
        } else {
            (false, (cooldown - elapsed) as u32)
        }
    }

    pub fn record_open(&mut self, now_ms: u64) {
        self.last_open_ms = Some(now_ms);
        info!(
            "Gate: opened at {} ms (cooldown {} ms)",
            now_ms, self.cooldown_ms
        );
    }

    /// Empty ids are never considered processed.
    pub fn was_processed(&self, request_id: &str) -> bool {
        if request_id.is_empty() {
            return false;
        }
        let key: RequestId = text::truncate(request_id);
        let hit = self.processed.iter().any(|id| *id == key);
        if hit {
            debug!("Gate: dedupe hit for {}", request_id);
        }
        hit
    }

    /// Remember `request_id`, evicting the oldest when full.  Empty ids are ignored.
    pub fn mark_processed(&mut self, request_id: &str) {
        if request_id.is_empty() {
            return;
        }
        if self.processed.is_full() {
            self.processed.pop_front();
        }
        // Cannot fail: a slot was freed above.
        let _ = self.processed.push_back(text::truncate(request_id));
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}
