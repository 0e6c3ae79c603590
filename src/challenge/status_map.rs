use parking_lot::RwLock;
use std::collections::HashSet;

/// IDs of challenges queued or being processed.
///
/// Keeps the poller and the requeue pass from feeding the same challenge to the processor
/// twice. State changes are still serialized by the lock registry.
#[derive(Default)]
pub struct ChallengeStatusMap {
    in_flight: RwLock<HashSet<String>>,
}

impl ChallengeStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, challenge_id: &str) -> bool {
        self.in_flight.read().contains(challenge_id)
    }

    /// Returns `false` when the challenge is already in flight.
    pub fn insert(&self, challenge_id: &str) -> bool {
        if self.contains(challenge_id) {
            return false;
        }
        self.in_flight.write().insert(challenge_id.to_string())
    }

    pub fn remove(&self, challenge_id: &str) {
        self.in_flight.write().remove(challenge_id);
    }

    pub fn len(&self) -> usize {
        self.in_flight.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.read().is_empty()
    }
}
