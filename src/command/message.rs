//! The in-flight unit of work.
//!
//! A [`Message`] travels caller → multiplexer → bridge mailbox → in-flight
//! queue → reply dispatch. Its [`MessageShared`] core records lifecycle
//! state and per-stage ticks; the caller holds a [`MessageTicket`] that
//! resolves when the message reaches a terminal state.
//!
//! State machine: Created → Queued → Written → AwaitingReply →
//! {Completed | Failed | Cancelled}. Exactly one terminal transition wins;
//! ticks are non-decreasing and each is recorded at most once.

use crate::command::processors::{self, Processed, ResultProcessor, TypedReply};
use crate::command::{CommandId, RedisKey, RedisValue};
use crate::core::error::{BraidError, BraidResult, FailureDetail, ServerError};
use crate::core::time::{Tick, TickClock};
use crate::protocol::RawFrame;
use crate::routing::Redirect;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Routing and delivery flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u16);

impl MessageFlags {
    /// Discard the reply; the caller's future completes on write success.
    pub const FIRE_AND_FORGET: Self = Self(1 << 0);
    /// Must execute on a primary.
    pub const DEMAND_PRIMARY: Self = Self(1 << 1);
    /// Must execute on a replica.
    pub const DEMAND_REPLICA: Self = Self(1 << 2);
    /// Prefer a primary, accept a replica.
    pub const PREFER_PRIMARY: Self = Self(1 << 3);
    /// Prefer a replica, accept a primary.
    pub const PREFER_REPLICA: Self = Self(1 << 4);
    /// Surface `-MOVED`/`-ASK` instead of following them.
    pub const NO_REDIRECT: Self = Self(1 << 5);
    /// Bypass the write-ready watermark (internal traffic).
    pub const HIGH_PRIORITY: Self = Self(1 << 6);

    /// No flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union.
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageState {
    /// Constructed, not yet admitted anywhere.
    Created = 0,
    /// Sitting in a backlog or write-ready mailbox.
    Queued = 1,
    /// Frame flushed to the socket.
    Written = 2,
    /// In the in-flight queue awaiting its reply.
    AwaitingReply = 3,
    /// Terminal: reply processed successfully.
    Completed = 4,
    /// Terminal: failed.
    Failed = 5,
    /// Terminal: deadline expired or caller cancelled.
    Cancelled = 6,
}

impl MessageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Queued,
            2 => Self::Written,
            3 => Self::AwaitingReply,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Whether the state is one of the three terminals.
    pub fn is_terminal(self) -> bool {
        self >= Self::Completed
    }
}

const TICK_UNSET: u64 = u64::MAX;

/// Shared lifecycle core, visible to the caller's ticket and the bridge.
#[derive(Debug)]
pub struct MessageShared {
    command: CommandId,
    key: Option<Bytes>,
    state: AtomicU8,
    created: Tick,
    enqueued: AtomicU64,
    sent: AtomicU64,
    responded: AtomicU64,
    completed: AtomicU64,
}

impl MessageShared {
    fn new(command: CommandId, key: Option<Bytes>, created: Tick) -> Self {
        Self {
            command,
            key,
            state: AtomicU8::new(MessageState::Created as u8),
            created,
            enqueued: AtomicU64::new(TICK_UNSET),
            sent: AtomicU64::new(TICK_UNSET),
            responded: AtomicU64::new(TICK_UNSET),
            completed: AtomicU64::new(TICK_UNSET),
        }
    }

    /// Current state.
    pub fn state(&self) -> MessageState {
        MessageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward through a non-terminal state. Terminal states and
    /// backward moves are ignored.
    pub fn advance(&self, to: MessageState) -> bool {
        debug_assert!(!to.is_terminal());
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= to as u8 || MessageState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Claim a terminal state. Exactly one claim wins per message.
    pub fn try_terminate(&self, to: MessageState) -> bool {
        debug_assert!(to.is_terminal());
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if MessageState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn record(&self, cell: &AtomicU64, tick: Tick) {
        let floor = tick.ms.max(self.created.ms);
        let _ = cell.compare_exchange(TICK_UNSET, floor, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Record entry into a queue.
    pub fn mark_enqueued(&self, tick: Tick) {
        self.record(&self.enqueued, tick);
        self.advance(MessageState::Queued);
    }

    /// Record the frame reaching the socket.
    pub fn mark_written(&self, tick: Tick) {
        self.record(&self.sent, tick);
        self.advance(MessageState::Written);
        self.advance(MessageState::AwaitingReply);
    }

    /// Record the reply frame arriving.
    pub fn mark_responded(&self, tick: Tick) {
        self.record(&self.responded, tick);
    }

    fn mark_completed(&self, tick: Tick) {
        self.record(&self.completed, tick);
    }

    /// Complete a fire-and-forget message at write success. Its queue slot
    /// stays in flight as a tombstone so the server's reply is consumed and
    /// discarded without disturbing head-of-queue pairing.
    pub fn finish_written(&self, tick: Tick) {
        if self.try_terminate(MessageState::Completed) {
            self.mark_completed(tick);
        }
    }

    fn tick_of(&self, cell: &AtomicU64) -> Option<Tick> {
        match cell.load(Ordering::Acquire) {
            TICK_UNSET => None,
            ms => Some(Tick::new(ms)),
        }
    }

    /// Tick when the message was created.
    pub fn created_tick(&self) -> Tick {
        self.created
    }

    /// Tick when the message was enqueued, once recorded.
    pub fn enqueued_tick(&self) -> Option<Tick> {
        self.tick_of(&self.enqueued)
    }

    /// Tick when the frame was written, once recorded.
    pub fn sent_tick(&self) -> Option<Tick> {
        self.tick_of(&self.sent)
    }

    /// Tick when the reply arrived, once recorded.
    pub fn responded_tick(&self) -> Option<Tick> {
        self.tick_of(&self.responded)
    }

    /// Tick at terminal transition, once recorded.
    pub fn completed_tick(&self) -> Option<Tick> {
        self.tick_of(&self.completed)
    }

    /// The command this message carries.
    pub fn command(&self) -> CommandId {
        self.command
    }

    /// Failure context from the recorded ticks.
    pub fn failure_detail(&self, include_detail: bool) -> FailureDetail {
        FailureDetail {
            command: Some(self.command.name()),
            key: self
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            endpoint: None,
            created: Some(self.created),
            enqueued: self.enqueued_tick(),
            sent: self.sent_tick(),
            responded: self.responded_tick(),
            write_ready_depth: None,
            in_flight_depth: None,
            backlog_depth: None,
            include_detail,
        }
    }
}

/// What reply dispatch decided about a message.
#[derive(Debug)]
pub enum Disposition {
    /// The message reached a terminal state (or was a tombstone).
    Resolved,
    /// Retry at the endpoint the server indicated.
    Redirect(Box<Message>, Redirect),
    /// Retry after a transient server condition (`LOADING`, `TRYAGAIN`,
    /// `CLUSTERDOWN`, `NOSCRIPT`).
    Retry(Box<Message>, ServerError),
}

/// A command in flight.
pub struct Message {
    command: CommandId,
    db: i32,
    flags: MessageFlags,
    key: Option<RedisKey>,
    args: Vec<RedisValue>,
    processor: ResultProcessor,
    sink: Option<oneshot::Sender<BraidResult<TypedReply>>>,
    shared: Arc<MessageShared>,
    clock: TickClock,
    attempts: u32,
    deadline: Option<Duration>,
    script: Option<Bytes>,
    slot_hint: Option<u16>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command.name())
            .field("db", &self.db)
            .field("state", &self.shared.state())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Message {
    /// Create a message and the ticket its caller awaits.
    ///
    /// With [`MessageFlags::FIRE_AND_FORGET`] the ticket is pre-completed
    /// and the reply slot is never occupied.
    pub fn new(
        clock: TickClock,
        command: CommandId,
        key: Option<RedisKey>,
        args: Vec<RedisValue>,
        processor: ResultProcessor,
        flags: MessageFlags,
    ) -> (Self, MessageTicket) {
        let shared = Arc::new(MessageShared::new(
            command,
            key.as_ref().map(RedisKey::to_bytes),
            clock.now(),
        ));
        let (tx, rx) = oneshot::channel();
        let sink = if flags.contains(MessageFlags::FIRE_AND_FORGET) {
            let _ = tx.send(Ok(TypedReply::Void));
            None
        } else {
            Some(tx)
        };
        let message = Self {
            command,
            db: -1,
            flags,
            key,
            args,
            processor,
            sink,
            shared: shared.clone(),
            clock,
            attempts: 0,
            deadline: None,
            script: None,
            slot_hint: None,
        };
        let ticket = MessageTicket {
            receiver: rx,
            shared,
        };
        (message, ticket)
    }

    /// Bind to a database index.
    pub fn with_db(mut self, db: i32) -> Self {
        self.db = db;
        self
    }

    /// Attach a caller deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach the script body for `NOSCRIPT` recovery of `EVALSHA`.
    pub fn with_script(mut self, script: Bytes) -> Self {
        self.script = Some(script);
        self
    }

    /// Route by an explicit slot when the routing key is not the first wire
    /// argument (`EVALSHA`, multi-key commands).
    pub fn with_slot_hint(mut self, slot: u16) -> Self {
        self.slot_hint = Some(slot);
        self
    }

    /// The slot this message routes by, from the hint or the key.
    pub fn route_slot(&self) -> Option<u16> {
        self.slot_hint
            .or_else(|| self.key.as_ref().map(crate::routing::hash_slot))
    }

    /// The command id.
    pub fn command(&self) -> CommandId {
        self.command
    }

    /// Routing and delivery flags.
    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// The routing key, if any.
    pub fn key(&self) -> Option<&RedisKey> {
        self.key.as_ref()
    }

    /// Bound database index; -1 means unselected.
    pub fn db(&self) -> i32 {
        self.db
    }

    /// Attempts so far (first try included once submitted).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count a dispatch attempt.
    pub fn bump_attempts(&mut self) {
        self.attempts += 1;
    }

    /// The caller deadline, if one was set.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// The script body for `NOSCRIPT` recovery, if carried.
    pub fn script(&self) -> Option<&Bytes> {
        self.script.as_ref()
    }

    /// The shared lifecycle core.
    pub fn shared(&self) -> &Arc<MessageShared> {
        &self.shared
    }

    /// Whether a terminal state has been claimed (e.g. by cancellation).
    pub fn is_finished(&self) -> bool {
        self.shared.state().is_terminal()
    }

    /// The clock this message records ticks on.
    pub fn clock(&self) -> TickClock {
        self.clock
    }

    /// Render the full wire argument list: command words, key, arguments.
    pub fn wire_parts(&self) -> Vec<Bytes> {
        let words = self.command.wire_words();
        let mut parts = Vec::with_capacity(words.len() + 1 + self.args.len());
        for word in words {
            parts.push(Bytes::from_static(word.as_bytes()));
        }
        if let Some(key) = &self.key {
            parts.push(key.to_bytes());
        }
        for arg in &self.args {
            parts.push(arg.to_arg());
        }
        parts
    }

    /// Resolve the message with a final result. At most one resolution
    /// takes effect; later calls are no-ops.
    pub fn resolve(mut self, result: BraidResult<TypedReply>) {
        let terminal = if result.is_ok() {
            MessageState::Completed
        } else {
            MessageState::Failed
        };
        if self.shared.try_terminate(terminal) {
            self.shared.mark_completed(self.clock.now());
            if let Some(sink) = self.sink.take() {
                let _ = sink.send(result);
            }
        }
    }

    /// Dispatch a reply frame: run the processor and resolve, or hand the
    /// message back for redirect/retry.
    ///
    /// A message whose terminal state was already claimed (cancellation
    /// tombstone) consumes the frame and resolves to nothing.
    pub fn apply_frame(mut self, frame: RawFrame) -> Disposition {
        self.shared.mark_responded(self.clock.now());
        if self.is_finished() {
            return Disposition::Resolved;
        }
        match processors::process(self.processor, self.command, frame) {
            Processed::Completed(reply) => {
                self.resolve(Ok(reply));
                Disposition::Resolved
            }
            Processed::NeedRedirect { redirect, error } => {
                if self.flags.contains(MessageFlags::NO_REDIRECT) {
                    self.resolve(Err(BraidError::Server { error }));
                    Disposition::Resolved
                } else {
                    Disposition::Redirect(Box::new(self), redirect)
                }
            }
            Processed::NeedRetry { error } => Disposition::Retry(Box::new(self), error),
            Processed::Failed(err) => {
                self.resolve(Err(err));
                Disposition::Resolved
            }
        }
    }

    /// Replace the processor (transaction body queueing).
    pub fn with_processor(mut self, processor: ResultProcessor) -> Self {
        self.processor = processor;
        self
    }

    /// The processor this message resolves through.
    pub fn processor(&self) -> ResultProcessor {
        self.processor
    }
}

/// The caller's handle on a submitted message.
pub struct MessageTicket {
    receiver: oneshot::Receiver<BraidResult<TypedReply>>,
    shared: Arc<MessageShared>,
}

impl MessageTicket {
    /// The shared lifecycle core.
    pub fn shared(&self) -> &Arc<MessageShared> {
        &self.shared
    }

    /// Await the result with no deadline.
    pub async fn await_reply(self) -> BraidResult<TypedReply> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(BraidError::Disposed),
        }
    }

    /// Await the result, cancelling at the deadline.
    ///
    /// On expiry the message's terminal state becomes `Cancelled`; if it was
    /// written, its in-flight slot is tombstoned and the reply will be
    /// consumed and discarded by the read loop. A race with concurrent
    /// completion is resolved in favour of the completion.
    pub async fn await_reply_within(
        mut self,
        deadline: Duration,
        include_detail: bool,
    ) -> BraidResult<TypedReply> {
        match tokio::time::timeout(deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BraidError::Disposed),
            Err(_elapsed) => {
                let before_write = self.shared.sent_tick().is_none();
                if self.shared.try_terminate(MessageState::Cancelled) {
                    let detail = self.shared.failure_detail(include_detail);
                    if before_write {
                        Err(BraidError::TimeoutBeforeWrite { detail })
                    } else {
                        Err(BraidError::TimeoutAfterWrite { detail })
                    }
                } else {
                    // Completed in the same instant; take the real result.
                    match self.receiver.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(BraidError::Disposed),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(flags: MessageFlags) -> (Message, MessageTicket) {
        Message::new(
            TickClock::new(),
            CommandId::Get,
            Some(RedisKey::from("k")),
            Vec::new(),
            ResultProcessor::BytesNullable,
            flags,
        )
    }

    #[test]
    fn flags_contains_and_union() {
        let flags = MessageFlags::HIGH_PRIORITY.with(MessageFlags::NO_REDIRECT);
        assert!(flags.contains(MessageFlags::HIGH_PRIORITY));
        assert!(flags.contains(MessageFlags::NO_REDIRECT));
        assert!(!flags.contains(MessageFlags::FIRE_AND_FORGET));
    }

    #[test]
    fn state_advances_forward_only() {
        let (msg, _ticket) = message(MessageFlags::empty());
        let shared = msg.shared().clone();
        assert_eq!(shared.state(), MessageState::Created);
        shared.mark_enqueued(Tick::new(1));
        assert_eq!(shared.state(), MessageState::Queued);
        shared.mark_written(Tick::new(2));
        assert_eq!(shared.state(), MessageState::AwaitingReply);
        // Backward move ignored.
        assert!(!shared.advance(MessageState::Queued));
        assert_eq!(shared.state(), MessageState::AwaitingReply);
    }

    #[test]
    fn ticks_are_monotonic_and_write_once() {
        let (msg, _ticket) = message(MessageFlags::empty());
        let shared = msg.shared().clone();
        shared.mark_enqueued(Tick::new(5));
        shared.mark_enqueued(Tick::new(99));
        assert_eq!(shared.enqueued_tick(), Some(Tick::new(5)));
        // A tick below creation is floored to the creation tick.
        shared.mark_written(Tick::zero());
        assert!(shared.sent_tick().unwrap() >= shared.created_tick());
    }

    #[test]
    fn exactly_one_terminal_transition() {
        let (msg, _ticket) = message(MessageFlags::empty());
        let shared = msg.shared().clone();
        assert!(shared.try_terminate(MessageState::Cancelled));
        assert!(!shared.try_terminate(MessageState::Completed));
        assert!(!shared.try_terminate(MessageState::Failed));
        assert_eq!(shared.state(), MessageState::Cancelled);
    }

    #[tokio::test]
    async fn resolve_delivers_to_ticket() {
        let (msg, ticket) = message(MessageFlags::empty());
        msg.resolve(Ok(TypedReply::Integer(7)));
        let reply = ticket.await_reply().await.unwrap();
        assert!(matches!(reply, TypedReply::Integer(7)));
    }

    #[tokio::test]
    async fn fire_and_forget_ticket_is_pre_completed() {
        let (_msg, ticket) = message(MessageFlags::FIRE_AND_FORGET);
        let reply = ticket.await_reply().await.unwrap();
        assert!(matches!(reply, TypedReply::Void));
    }

    #[tokio::test]
    async fn timeout_before_write_is_distinguished() {
        let (msg, ticket) = message(MessageFlags::empty());
        let err = ticket
            .await_reply_within(Duration::from_millis(10), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BraidError::TimeoutBeforeWrite { .. }));
        assert_eq!(msg.shared().state(), MessageState::Cancelled);
    }

    #[tokio::test]
    async fn timeout_after_write_is_distinguished() {
        let (msg, ticket) = message(MessageFlags::empty());
        msg.shared().mark_written(Tick::new(1));
        let err = ticket
            .await_reply_within(Duration::from_millis(10), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BraidError::TimeoutAfterWrite { .. }));
    }

    #[test]
    fn cancelled_message_consumes_frame_silently() {
        let (msg, _ticket) = message(MessageFlags::empty());
        assert!(msg.shared().try_terminate(MessageState::Cancelled));
        let disposition = msg.apply_frame(RawFrame::Simple("OK".into()));
        assert!(matches!(disposition, Disposition::Resolved));
    }

    #[tokio::test]
    async fn moved_reply_yields_redirect() {
        let (msg, _ticket) = message(MessageFlags::empty());
        let disposition = msg.apply_frame(RawFrame::Error("MOVED 42 10.0.0.9:7000".into()));
        match disposition {
            Disposition::Redirect(_, redirect) => {
                assert_eq!(redirect.slot, 42);
                assert_eq!(redirect.endpoint, "10.0.0.9:7000");
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_redirect_flag_surfaces_moved() {
        let (msg, ticket) = message(MessageFlags::NO_REDIRECT);
        let disposition = msg.apply_frame(RawFrame::Error("MOVED 42 10.0.0.9:7000".into()));
        assert!(matches!(disposition, Disposition::Resolved));
        let err = ticket.await_reply().await.unwrap_err();
        assert!(err.as_server_error().is_some());
    }

    #[test]
    fn wire_parts_include_words_key_args() {
        let (msg, _ticket) = Message::new(
            TickClock::new(),
            CommandId::ClientSetName,
            None,
            vec![RedisValue::Literal("braid")],
            ResultProcessor::OkStatus,
            MessageFlags::empty(),
        );
        let parts = msg.wire_parts();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].as_ref(), b"CLIENT");
        assert_eq!(parts[1].as_ref(), b"SETNAME");
        assert_eq!(parts[2].as_ref(), b"braid");
    }
}
