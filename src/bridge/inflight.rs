//! The in-flight queue: messages written to the socket, awaiting replies.
//!
//! Strict FIFO. The write loop pushes, the read loop pops; nothing else
//! touches the queue. Cancelled messages stay in place as tombstones so the
//! head-of-queue pairing with reply frames is never disturbed.

use crate::command::Message;
use crate::core::error::BraidError;
use crate::core::time::Tick;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO of messages awaiting replies on one bridge.
#[derive(Debug, Default)]
pub struct InFlight {
    queue: Mutex<VecDeque<Message>>,
}

impl InFlight {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a written message.
    pub fn push(&self, message: Message) {
        self.queue.lock().push_back(message);
    }

    /// Take the head for reply pairing.
    pub fn pop(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    /// Take the head only when it satisfies `predicate`.
    pub fn pop_if<F>(&self, predicate: F) -> Option<Message>
    where
        F: FnOnce(&Message) -> bool,
    {
        let mut queue = self.queue.lock();
        if queue.front().map(predicate).unwrap_or(false) {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Current depth, tombstones included.
    pub fn depth(&self) -> usize {
        self.queue.lock().len()
    }

    /// Send tick of the head message, for heartbeat-overdue checks.
    pub fn oldest_sent(&self) -> Option<Tick> {
        self.queue.lock().front().and_then(|m| m.shared().sent_tick())
    }

    /// Fail everything in flight with clones of `err`, preserving order of
    /// resolution.
    pub fn fail_all(&self, err: &BraidError) {
        let drained: Vec<Message> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for message in drained {
            message.resolve(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::processors::ResultProcessor;
    use crate::command::{CommandId, MessageFlags};
    use crate::core::time::TickClock;

    fn message() -> (Message, crate::command::MessageTicket) {
        Message::new(
            TickClock::new(),
            CommandId::Get,
            None,
            Vec::new(),
            ResultProcessor::BytesNullable,
            MessageFlags::empty(),
        )
    }

    #[test]
    fn fifo_order() {
        let inflight = InFlight::new();
        let (a, _ta) = message();
        let (b, _tb) = message();
        let a_shared = a.shared().clone();
        inflight.push(a);
        inflight.push(b);
        assert_eq!(inflight.depth(), 2);
        let head = inflight.pop().unwrap();
        assert!(std::sync::Arc::ptr_eq(head.shared(), &a_shared));
    }

    #[test]
    fn oldest_sent_reads_head() {
        let inflight = InFlight::new();
        let (a, _ta) = message();
        a.shared().mark_written(Tick::new(7));
        inflight.push(a);
        assert_eq!(inflight.oldest_sent(), Some(Tick::new(7)));
    }

    #[tokio::test]
    async fn fail_all_resolves_each() {
        let inflight = InFlight::new();
        let (a, ta) = message();
        let (b, tb) = message();
        inflight.push(a);
        inflight.push(b);
        inflight.fail_all(&BraidError::Disposed);
        assert!(ta.await_reply().await.is_err());
        assert!(tb.await_reply().await.is_err());
        assert_eq!(inflight.depth(), 0);
    }
}
