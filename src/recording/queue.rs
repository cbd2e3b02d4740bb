//! Three-tier blocking priority queue feeding the writer thread

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Queue tier of a recorder message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dequeued before everything else
    High = 0,
    /// Default tier
    Normal = 1,
    /// Dequeued only when the other tiers are empty
    Low = 2,
}

const TIERS: usize = 3;

struct State<T> {
    tiers: [VecDeque<T>; TIERS],
    closed: bool,
}

/// Multi-producer, single-consumer queue with strict tier ordering
///
/// Messages within a tier are FIFO. A higher tier always drains first.
pub struct PriorityQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue `message`, handing it back if the queue is closed
    ///
    /// # Errors
    ///
    /// Returns the message if the queue no longer accepts pushes
    pub fn push(&self, priority: Priority, message: T) -> std::result::Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(message);
        }
        state.tiers[priority as usize].push_back(message);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Dequeue the oldest message of the highest non-empty tier, blocking
    /// while the queue is empty
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(message) = state.tiers.iter_mut().find_map(VecDeque::pop_front) {
                return Some(message);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Stop accepting pushes and wake blocked consumers
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Number of queued messages across all tiers
    pub fn len(&self) -> usize {
        self.state.lock().tiers.iter().map(VecDeque::len).sum()
    }

    /// Whether no messages are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
