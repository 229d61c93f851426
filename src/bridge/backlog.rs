//! Bounded backlog for messages submitted while a bridge is not yet
//! established.

use crate::command::Message;
use crate::core::error::{BraidError, BraidResult};
use std::collections::VecDeque;

/// Default backlog capacity.
pub const BACKLOG_CAPACITY: usize = 1024;

/// Fixed-capacity FIFO of messages awaiting an established link.
///
/// Admission policy is applied by the owning bridge; the backlog itself only
/// enforces the cap.
#[derive(Debug)]
pub struct Backlog {
    items: VecDeque<Message>,
    capacity: usize,
}

impl Backlog {
    /// Create a backlog with the given cap.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Admit a message, or hand it back when full.
    pub fn push(&mut self, message: Message) -> Result<(), Message> {
        if self.items.len() >= self.capacity {
            return Err(message);
        }
        self.items.push_back(message);
        Ok(())
    }

    /// Take everything, preserving submission order.
    pub fn drain(&mut self) -> Vec<Message> {
        self.items.drain(..).collect()
    }

    /// Current depth.
    pub fn depth(&self) -> usize {
        self.items.len()
    }

    /// Whether the backlog holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fail every held message with clones of `err`.
    pub fn fail_all(&mut self, err: &BraidError) {
        for message in self.items.drain(..) {
            let result: BraidResult<_> = Err(err.clone());
            message.resolve(result);
        }
    }
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new(BACKLOG_CAPACITY)
    }
}
