use serde_json::Value;
use std::time::{Duration, Instant};

pub type TimeoutHandle = u64;

struct Entry {
    deadline: Instant,
    payload: Value,
    handle: TimeoutHandle,
}

/// Pending future events, kept sorted earliest first. Entries with equal
/// deadlines fire in insertion order.
pub struct TimeoutWheel {
    pending: Vec<Entry>,
    next_handle: TimeoutHandle,
}

impl TimeoutWheel {
    pub fn new() -> TimeoutWheel {
        TimeoutWheel {
            pending: Vec::new(),
            next_handle: 0,
        }
    }

    /// Insert an entry due `delay` from now and return its handle.
    pub fn add(&mut self, delay: Duration, payload: Value) -> TimeoutHandle {
        let deadline = Instant::now() + delay;
        let handle = self.next_handle;
        self.next_handle += 1;

        let mut pos = self.pending.len();
        for (idx, entry) in self.pending.iter().enumerate() {
            if entry.deadline > deadline {
                pos = idx;
                break;
            }
        }
        self.pending.insert(
            pos,
            Entry {
                deadline,
                payload,
                handle,
            },
        );

        handle
    }

    /// Remove an entry by handle. Silent when the entry already fired or the
    /// handle is unknown.
    pub fn cancel(&mut self, handle: TimeoutHandle) {
        if let Some(pos) = self.pending.iter().position(|entry| entry.handle == handle) {
            self.pending.remove(pos);
        }
    }

    /// Delay until the earliest deadline, or None when nothing is pending.
    pub fn next_delay(&self) -> Option<Duration> {
        self.pending
            .first()
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Remove and return all entries whose deadline has been reached, in
    /// deadline order.
    pub fn pop_due(&mut self) -> Vec<(TimeoutHandle, Value)> {
        let now = Instant::now();
        let due = self
            .pending
            .iter()
            .take_while(|entry| entry.deadline <= now)
            .count();

        self.pending
            .drain(..due)
            .map(|entry| (entry.handle, entry.payload))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
