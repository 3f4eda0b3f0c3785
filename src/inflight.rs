// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! In-flight event registry.
//!
//! Tracks which `event_id`s are currently between "download accepted them"
//! and "upload finished with them," so the reconciler's backlog scan never
//! re-offers an event that's already moving through the pipeline but hasn't
//! reached the ledger yet. Same keyed-set shape as `retry::RetryCounter`,
//! without the TTL — entries are added and removed explicitly by the two
//! stages that bracket the in-flight window, not swept on a timer.

use std::collections::HashSet;

use parking_lot::Mutex;

#[derive(Default)]
pub struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    pub fn new() -> Self {
        InFlight { ids: Mutex::new(HashSet::new()) }
    }

    /// Mark `event_id` as in flight. Called by the download stage once it
    /// commits to fetching an event.
    pub fn mark(&self, event_id: &str) {
        self.ids.lock().insert(event_id.to_string());
    }

    /// Clear `event_id`. Called by whichever stage stops handling the event
    /// without producing a ledger row for it — the download stage on a
    /// fetch failure, the upload stage once it resolves success or failure.
    pub fn clear(&self, event_id: &str) {
        self.ids.lock().remove(event_id);
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.ids.lock().contains(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_contains_then_clear() {
        let f = InFlight::new();
        assert!(!f.contains("E1"));
        f.mark("E1");
        assert!(f.contains("E1"));
        f.clear("E1");
        assert!(!f.contains("E1"));
    }

    #[test]
    fn clearing_an_absent_id_is_a_no_op() {
        let f = InFlight::new();
        f.clear("never-marked");
        assert!(!f.contains("never-marked"));
    }
}
