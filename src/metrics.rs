//! Decision counters for the permission resolver.
//! Process-wide, lock-free; read with [snapshot].
use std::sync::atomic::{AtomicU64, Ordering};

use crate::claims::types::ActionKind;

static ALLOWED: [AtomicU64; 4] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];
static DENIED: [AtomicU64; 4] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];
static LOOKUP_FAILURES: AtomicU64 = AtomicU64::new(0);

fn slot(action: ActionKind) -> usize {
    match action {
        ActionKind::Place => 0,
        ActionKind::Destroy => 1,
        ActionKind::Interact => 2,
        ActionKind::Spawn => 3,
    }
}

pub fn record_decision(action: ActionKind, allowed: bool) {
    let counters = if allowed { &ALLOWED } else { &DENIED };
    counters[slot(action)].fetch_add(1, Ordering::Relaxed);
}

/// A storage error forced a deny.
pub fn inc_lookup_failures() {
    LOOKUP_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecisionCounter {
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub place: DecisionCounter,
    pub destroy: DecisionCounter,
    pub interact: DecisionCounter,
    pub spawn: DecisionCounter,
    pub lookup_failures: u64,
}

impl Snapshot {
    pub fn counter(&self, action: ActionKind) -> DecisionCounter {
        match action {
            ActionKind::Place => self.place,
            ActionKind::Destroy => self.destroy,
            ActionKind::Interact => self.interact,
            ActionKind::Spawn => self.spawn,
        }
    }
}

fn load(action: ActionKind) -> DecisionCounter {
    DecisionCounter {
        allowed: ALLOWED[slot(action)].load(Ordering::Relaxed),
        denied: DENIED[slot(action)].load(Ordering::Relaxed),
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        place: load(ActionKind::Place),
        destroy: load(ActionKind::Destroy),
        interact: load(ActionKind::Interact),
        spawn: load(ActionKind::Spawn),
        lookup_failures: LOOKUP_FAILURES.load(Ordering::Relaxed),
    }
}
