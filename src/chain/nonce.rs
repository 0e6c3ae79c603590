use log::debug;
use parking_lot::Mutex;

/// Hands out transaction nonces for this node.
///
/// Seeded once from the chain's view of the client; afterwards nonces are counted locally.
/// A nonce whose transaction never reached a miner is handed back with `release` so the
/// sequence stays gap-free.
#[derive(Default)]
pub struct NonceMonitor {
    last: Mutex<Option<i64>>,
}

impl NonceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.last.lock().is_some()
    }

    /// Records the chain's latest nonce unless a value is already tracked.
    pub fn initialize(&self, chain_nonce: i64) {
        let mut last = self.last.lock();
        if last.is_none() {
            debug!("Nonce monitor seeded at {}", chain_nonce);
            *last = Some(chain_nonce);
        }
    }

    pub fn next(&self) -> i64 {
        let mut last = self.last.lock();
        let next = last.unwrap_or(0) + 1;
        *last = Some(next);
        next
    }

    /// Returns an unused nonce. Only the most recently issued nonce can be handed back.
    pub fn release(&self, nonce: i64) {
        let mut last = self.last.lock();
        if *last == Some(nonce) {
            *last = Some(nonce - 1);
        }
    }
}
