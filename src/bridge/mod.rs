//! The connection bridge: one physical link in one role.
//!
//! A bridge owns a socket and three queues. The **backlog** admits messages
//! while the link is down, the **write-ready** mailbox feeds the write loop
//! under a high-watermark, and the **in-flight** FIFO pairs replies with
//! their commands in strict order. A driver task runs the connect →
//! handshake → io-loops → teardown cycle and reconnects under the retry
//! policy.
//!
//! State machine: `Disconnected → Connecting → Handshaking →
//! ConnectedEstablishing → ConnectedEstablished`, leaving via
//! `ConnectedFailing` (read loop or overdue heartbeat) or `Disconnecting`
//! (shutdown only).

pub mod backlog;
pub mod handshake;
pub mod inflight;
mod loops;

pub use backlog::{Backlog, BACKLOG_CAPACITY};
pub use inflight::InFlight;

use crate::command::{Message, MessageFlags};
use crate::core::config::{BacklogPolicy, Options};
use crate::core::error::{
    BraidError, ConnectionFailureKind, ConnectionRole, ServerError,
};
use crate::core::time::TickClock;
use crate::protocol::{RawFrame, RespVersion};
use crate::routing::Redirect;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// Write-ready mailbox capacity; submissions beyond it apply backpressure.
pub const WRITE_READY_HIGH_WATERMARK: usize = 1024;

/// Bridge connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    /// No socket.
    Disconnected = 0,
    /// TCP (and TLS) establishment in progress.
    Connecting = 1,
    /// Socket up, protocol handshake running.
    Handshaking = 2,
    /// Handshake done, backlog being promoted.
    ConnectedEstablishing = 3,
    /// Serving traffic.
    ConnectedEstablished = 4,
    /// A loop observed a failure; teardown in progress.
    ConnectedFailing = 5,
    /// Shutting down for good.
    Disconnecting = 6,
}

impl BridgeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Handshaking,
            3 => Self::ConnectedEstablishing,
            4 => Self::ConnectedEstablished,
            5 => Self::ConnectedFailing,
            _ => Self::Disconnecting,
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::ConnectedEstablishing => "connected-establishing",
            Self::ConnectedEstablished => "connected-established",
            Self::ConnectedFailing => "connected-failing",
            Self::Disconnecting => "disconnecting",
        };
        write!(f, "{}", s)
    }
}

/// Per-bridge traffic counters.
#[derive(Debug, Default)]
pub struct BridgeCounters {
    /// Frames written to the socket.
    pub ops_written: AtomicU64,
    /// Replies paired with in-flight messages.
    pub replies_matched: AtomicU64,
    /// Messages failed by this bridge.
    pub failures: AtomicU64,
    /// Bytes flushed.
    pub bytes_sent: AtomicU64,
    /// Bytes received.
    pub bytes_received: AtomicU64,
    /// Completed reconnect cycles.
    pub reconnects: AtomicU64,
}

impl BridgeCounters {
    /// Record a flushed frame.
    pub fn op_written(&self) {
        self.ops_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a paired reply.
    pub fn reply_matched(&self) {
        self.replies_matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed message.
    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record flushed bytes.
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record received bytes.
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Events a bridge reports to its multiplexer.
#[derive(Debug)]
pub enum BridgeEvent {
    /// Handshake finished; the bridge serves traffic.
    Established {
        /// `host:port`.
        endpoint: String,
        /// Bridge role.
        role: ConnectionRole,
        /// Negotiated protocol.
        resp: RespVersion,
        /// Server version from `HELLO`, when learned.
        server_version: Option<String>,
    },
    /// The link failed.
    Failed {
        /// `host:port`.
        endpoint: String,
        /// Bridge role.
        role: ConnectionRole,
        /// Failure classification.
        kind: ConnectionFailureKind,
        /// Rendered cause.
        message: String,
    },
    /// A reply asked for a cluster redirect.
    Redirect {
        /// The message to re-dispatch.
        message: Box<Message>,
        /// Parsed target.
        redirect: Redirect,
        /// Endpoint that issued the redirect.
        from: String,
    },
    /// A reply asked for a transient retry (`LOADING`, `TRYAGAIN`,
    /// `CLUSTERDOWN`, `NOSCRIPT`).
    Retry {
        /// The message to re-dispatch.
        message: Box<Message>,
        /// The server condition.
        error: ServerError,
    },
    /// An out-of-band pub/sub frame arrived.
    Delivery {
        /// The push or delivery array frame.
        frame: RawFrame,
        /// Endpoint it arrived on.
        endpoint: String,
    },
}

/// A unit in the write-ready mailbox.
///
/// Batches are written contiguously with no interleaving from other
/// submissions (`ASKING` pairs, transaction bodies).
#[derive(Debug)]
pub enum WriteItem {
    /// One message.
    Single(Message),
    /// An atomic run of messages.
    Batch(Vec<Message>),
}

impl WriteItem {
    fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Single(m) => vec![m],
            Self::Batch(v) => v,
        }
    }
}

/// How the bridge is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CloseMode {
    None = 0,
    Drain = 1,
    Immediate = 2,
}

/// State shared between the bridge handle, its driver, and its loops.
pub(crate) struct BridgeShared {
    endpoint: String,
    role: ConnectionRole,
    options: Arc<Options>,
    clock: TickClock,
    state: AtomicU8,
    auth_failed: AtomicBool,
    auth_error: Mutex<Option<String>>,
    backlog: Mutex<Backlog>,
    in_flight: InFlight,
    ready_tx: mpsc::Sender<WriteItem>,
    priority_tx: mpsc::UnboundedSender<WriteItem>,
    pending_writes: AtomicUsize,
    counters: BridgeCounters,
    events: mpsc::UnboundedSender<BridgeEvent>,
    teardown: Notify,
    close_mode: AtomicU8,
    last_reply_ms: AtomicU64,
    last_selected_db: AtomicI64,
}

impl BridgeShared {
    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn role(&self) -> ConnectionRole {
        self.role
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn clock(&self) -> TickClock {
        self.clock
    }

    pub(crate) fn counters(&self) -> &BridgeCounters {
        &self.counters
    }

    pub(crate) fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub(crate) fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BridgeState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            tracing::debug!(
                endpoint = %self.endpoint,
                role = %self.role,
                from = %BridgeState::from_u8(prev),
                to = %state,
                "bridge state change"
            );
        }
    }

    pub(crate) fn close_mode(&self) -> CloseMode {
        match self.close_mode.load(Ordering::Acquire) {
            0 => CloseMode::None,
            1 => CloseMode::Drain,
            _ => CloseMode::Immediate,
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.close_mode() != CloseMode::None
    }

    pub(crate) fn auth_failed(&self) -> bool {
        self.auth_failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_auth_failed(&self, message: &str) {
        *self.auth_error.lock() = Some(message.to_string());
        self.auth_failed.store(true, Ordering::Release);
    }

    /// Clear the terminal auth marker (configuration changed).
    pub(crate) fn clear_auth_failed(&self) {
        self.auth_failed.store(false, Ordering::Release);
        *self.auth_error.lock() = None;
        self.teardown.notify_one();
    }

    fn auth_failure_error(&self) -> BraidError {
        BraidError::ConnectionFailure {
            kind: ConnectionFailureKind::AuthenticationFailure,
            endpoint: self.endpoint.clone(),
            role: self.role,
            message: self
                .auth_error
                .lock()
                .clone()
                .unwrap_or_else(|| "authentication failed".to_string()),
        }
    }

    pub(crate) fn note_reply(&self) {
        self.last_reply_ms
            .store(self.clock.now().ms, Ordering::Release);
    }

    /// Milliseconds since the last reply frame, if any arrived.
    pub(crate) fn reply_idle_ms(&self) -> u64 {
        let last = self.last_reply_ms.load(Ordering::Acquire);
        self.clock.now().ms.saturating_sub(last)
    }

    pub(crate) fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    /// `backlog_depth` is passed in because callers may already hold the
    /// backlog lock.
    fn unavailable(&self, message: &Message, backlog_depth: usize) -> BraidError {
        let mut detail = message
            .shared()
            .failure_detail(self.options.include_detail_in_exceptions);
        detail.endpoint = Some(self.endpoint.clone());
        detail.backlog_depth = Some(backlog_depth);
        detail.write_ready_depth = Some(self.pending_writes.load(Ordering::Relaxed));
        detail.in_flight_depth = Some(self.in_flight.depth());
        BraidError::ConnectionUnavailable { detail }
    }

    /// Submit one message: mailbox when established, backlog otherwise.
    pub(crate) async fn submit(&self, message: Message) {
        self.submit_item(WriteItem::Single(message)).await;
    }

    /// Submit an atomic run of messages.
    pub(crate) async fn submit_batch(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.submit_item(WriteItem::Batch(messages)).await;
    }

    async fn submit_item(&self, item: WriteItem) {
        let now = self.clock.now();
        let (high_priority, disposed) = match &item {
            WriteItem::Single(m) => {
                m.shared().mark_enqueued(now);
                (m.flags().contains(MessageFlags::HIGH_PRIORITY), self.is_closing())
            }
            WriteItem::Batch(ms) => {
                for m in ms {
                    m.shared().mark_enqueued(now);
                }
                let high = ms
                    .iter()
                    .any(|m| m.flags().contains(MessageFlags::HIGH_PRIORITY));
                (high, self.is_closing())
            }
        };

        if disposed {
            for message in item.into_messages() {
                self.counters.failure();
                message.resolve(Err(BraidError::Disposed));
            }
            return;
        }

        if self.auth_failed() {
            let err = self.auth_failure_error();
            for message in item.into_messages() {
                self.counters.failure();
                message.resolve(Err(err.clone()));
            }
            return;
        }

        if self.state() != BridgeState::ConnectedEstablished {
            // Admission is decided under the backlog lock so a concurrent
            // backlog promotion cannot strand the message.
            let mut backlog = self.backlog.lock();
            if self.state() != BridgeState::ConnectedEstablished {
                for message in item.into_messages() {
                    if self.options.backlog_policy == BacklogPolicy::FailFast {
                        let err = self.unavailable(&message, backlog.depth());
                        self.counters.failure();
                        message.resolve(Err(err));
                        continue;
                    }
                    if let Err(rejected) = backlog.push(message) {
                        let err = self.unavailable(&rejected, backlog.depth());
                        self.counters.failure();
                        rejected.resolve(Err(err));
                    }
                }
                return;
            }
            drop(backlog);
        }

        self.pending_writes.fetch_add(1, Ordering::Relaxed);
        if high_priority {
            if let Err(send_err) = self.priority_tx.send(item) {
                self.pending_writes.fetch_sub(1, Ordering::Relaxed);
                let depth = self.backlog.lock().depth();
                for message in send_err.0.into_messages() {
                    let err = self.unavailable(&message, depth);
                    self.counters.failure();
                    message.resolve(Err(err));
                }
            }
        } else if let Err(send_err) = self.ready_tx.send(item).await {
            self.pending_writes.fetch_sub(1, Ordering::Relaxed);
            let depth = self.backlog.lock().depth();
            for message in send_err.0.into_messages() {
                let err = self.unavailable(&message, depth);
                self.counters.failure();
                message.resolve(Err(err));
            }
        }
    }

    /// Promote the backlog into the priority mailbox and mark established.
    ///
    /// Runs under the backlog lock so submissions racing the promotion keep
    /// their order.
    pub(crate) fn promote_backlog(&self) {
        let mut backlog = self.backlog.lock();
        let drained = backlog.drain();
        if !drained.is_empty() {
            tracing::debug!(
                endpoint = %self.endpoint,
                role = %self.role,
                count = drained.len(),
                "promoting backlog"
            );
            self.pending_writes.fetch_add(1, Ordering::Relaxed);
            let _ = self.priority_tx.send(WriteItem::Batch(drained));
        }
        self.set_state(BridgeState::ConnectedEstablished);
    }

    /// Fail all in-flight messages after a link failure.
    pub(crate) fn fail_in_flight(&self, kind: ConnectionFailureKind, cause: &str) {
        let err = BraidError::ConnectionFailure {
            kind,
            endpoint: self.endpoint.clone(),
            role: self.role,
            message: cause.to_string(),
        };
        let depth = self.in_flight.depth();
        if depth > 0 {
            self.counters.failures.fetch_add(depth as u64, Ordering::Relaxed);
        }
        self.in_flight.fail_all(&err);
    }

    /// Fail everything still queued anywhere (final shutdown).
    pub(crate) fn fail_all_queues(&self, err: &BraidError) {
        self.in_flight.fail_all(err);
        self.backlog.lock().fail_all(err);
    }

    pub(crate) fn write_finished(&self) {
        self.pending_writes.fetch_sub(1, Ordering::Relaxed);
    }

    /// Ask the driver to tear the link down (heartbeat overdue).
    pub(crate) fn request_teardown(&self) {
        self.teardown.notify_one();
    }

    pub(crate) fn teardown_signal(&self) -> &Notify {
        &self.teardown
    }
}

/// Handle to one bridge.
pub struct Bridge {
    shared: Arc<BridgeShared>,
    close_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("endpoint", &self.shared.endpoint)
            .field("role", &self.shared.role)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Bridge {
    /// Create the bridge and start its connection driver.
    pub fn connect(
        endpoint: String,
        role: ConnectionRole,
        options: Arc<Options>,
        clock: TickClock,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::channel(WRITE_READY_HIGH_WATERMARK);
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let shared = Arc::new(BridgeShared {
            endpoint,
            role,
            options,
            clock,
            state: AtomicU8::new(BridgeState::Disconnected as u8),
            auth_failed: AtomicBool::new(false),
            auth_error: Mutex::new(None),
            backlog: Mutex::new(Backlog::default()),
            in_flight: InFlight::new(),
            ready_tx,
            priority_tx,
            pending_writes: AtomicUsize::new(0),
            counters: BridgeCounters::default(),
            events,
            teardown: Notify::new(),
            close_mode: AtomicU8::new(CloseMode::None as u8),
            last_reply_ms: AtomicU64::new(0),
            last_selected_db: AtomicI64::new(-1),
        });
        let driver = tokio::spawn(loops::run_driver(
            shared.clone(),
            ready_rx,
            priority_rx,
            close_rx,
        ));
        Arc::new(Self {
            shared,
            close_tx,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Submit one message.
    pub async fn submit(&self, message: Message) {
        self.shared.submit(message).await;
    }

    /// Submit an atomic batch (no interleaving with other submissions).
    pub async fn submit_batch(&self, messages: Vec<Message>) {
        self.shared.submit_batch(messages).await;
    }

    /// The endpoint this bridge serves.
    pub fn endpoint(&self) -> &str {
        self.shared.endpoint()
    }

    /// This bridge's role.
    pub fn role(&self) -> ConnectionRole {
        self.shared.role()
    }

    /// Current connection state.
    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    /// Whether the bridge serves traffic right now.
    pub fn is_established(&self) -> bool {
        self.state() == BridgeState::ConnectedEstablished
    }

    /// Whether the endpoint rejected our credentials (terminal until
    /// reconfiguration).
    pub fn auth_failed(&self) -> bool {
        self.shared.auth_failed()
    }

    /// Clear the terminal auth marker after configuration changes.
    pub fn clear_auth_failed(&self) {
        self.shared.clear_auth_failed()
    }

    /// Traffic counters.
    pub fn counters(&self) -> &BridgeCounters {
        self.shared.counters()
    }

    /// Depth of the in-flight queue.
    pub fn in_flight_depth(&self) -> usize {
        self.shared.in_flight().depth()
    }

    /// Send tick of the oldest in-flight message.
    pub fn oldest_in_flight_sent(&self) -> Option<crate::core::time::Tick> {
        self.shared.in_flight().oldest_sent()
    }

    /// Milliseconds since the last reply frame arrived.
    pub fn reply_idle_ms(&self) -> u64 {
        self.shared.reply_idle_ms()
    }

    /// Ask the driver to tear the link down and reconnect.
    pub fn request_teardown(&self) {
        self.shared.request_teardown();
    }

    /// Database index of the most recently dispatched `SELECT`, -1 if none.
    pub fn last_selected_db(&self) -> i64 {
        self.shared.last_selected_db.load(Ordering::Acquire)
    }

    /// Record a dispatched `SELECT`.
    pub fn set_last_selected_db(&self, db: i64) {
        self.shared.last_selected_db.store(db, Ordering::Release);
    }

    /// Shut the bridge down. With `allow_pending`, queued writes are
    /// drained first (bounded by `syncTimeout`); in-flight messages always
    /// get their replies failed.
    pub async fn close(&self, allow_pending: bool) {
        let mode = if allow_pending {
            CloseMode::Drain
        } else {
            CloseMode::Immediate
        };
        self.shared.close_mode.store(mode as u8, Ordering::Release);
        if allow_pending && self.is_established() {
            let deadline = tokio::time::Instant::now() + self.shared.options.sync_timeout();
            while self.shared.pending_writes.load(Ordering::Acquire) > 0
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
        let _ = self.close_tx.send(true);
        self.shared.teardown.notify_one();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
