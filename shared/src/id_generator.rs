use std::sync::atomic::{AtomicU64, Ordering};

/// Source of process-unique 64-bit ids for channels, timers and entities
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// Hands out 1, 2, 3, ... Zero is never returned so it can mean "none".
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
