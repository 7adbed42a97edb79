use crate::model::PendingHeartbeat;

/// Result of pushing into the pending buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Accepted into a buffer that was empty before.
    First,
    /// Accepted; carries the buffer length after the push.
    Appended(usize),
    /// Buffer is at capacity, the heartbeat was not stored.
    Rejected,
}

/// Bounded queue of heartbeats waiting for the next flush.
///
/// Not synchronized on its own; the coalescer keeps it behind a mutex and
/// only does constant-time work while holding it.
#[derive(Debug)]
pub struct PendingBuffer {
    entries: Vec<PendingHeartbeat>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Appends a heartbeat unless the buffer is full (drop-newest).
    pub fn push(&mut self, hb: PendingHeartbeat) -> Push {
        if self.entries.len() >= self.capacity {
            return Push::Rejected;
        }

        self.entries.push(hb);
        match self.entries.len() {
            1 => Push::First,
            n => Push::Appended(n),
        }
    }

    /// Swaps the contents out for a fresh empty buffer.
    pub fn take(&mut self) -> Vec<PendingHeartbeat> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
