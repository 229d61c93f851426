//! The multiplexer: lifetime, routing, heartbeat, reconfiguration.
//!
//! One multiplexer owns its endpoint table (insertion-ordered, unique
//! addresses, copy-on-write snapshots), the slot map, the subscription
//! table, and the background tasks: the bridge-event loop, the pub/sub
//! fanout worker, the heartbeat timer, and the serialized reconfiguration
//! worker with its coalesce flag.

pub mod database;
pub mod reconfigure;
pub mod sentinel;
pub mod subscriber;
pub mod transaction;

pub use database::Database;
pub use subscriber::{
    ChannelId, ChannelKind, ChannelMessage, MessageHandler, Subscriber, SubscriptionRouter,
    SubscriptionToken,
};
pub use transaction::{
    Condition, ConditionResult, Transaction, TransactionOp, TransactionOutcome,
};

use crate::bridge::BridgeEvent;
use crate::command::{
    CommandId, Message, MessageFlags, RedisKey, RedisValue, ResultProcessor, TypedReply,
};
use crate::core::config::Options;
use crate::core::error::{
    BraidError, BraidResult, ConnectionFailureKind, ConnectionRole, ServerError, ServerErrorKind,
};
use crate::core::time::TickClock;
use crate::endpoint::{ServerEndpoint, ServerRole, ServerVersion};
use crate::routing::{self, Redirect, RedirectKind, SlotMap};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Shared multiplexer state.
pub struct MultiplexerInner {
    options: Arc<Options>,
    clock: TickClock,
    endpoints: RwLock<Arc<Vec<Arc<ServerEndpoint>>>>,
    slots: SlotMap,
    subscriptions: Arc<SubscriptionRouter>,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    reconfigure_running: AtomicBool,
    reconfigure_pending: AtomicBool,
    reconfigure_notify: Notify,
    closed: AtomicBool,
}

impl MultiplexerInner {
    /// Client options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The shared tick clock.
    pub fn clock(&self) -> TickClock {
        self.clock
    }

    /// The subscription table.
    pub fn subscriptions(&self) -> &Arc<SubscriptionRouter> {
        &self.subscriptions
    }

    /// The slot map.
    pub fn slots(&self) -> &SlotMap {
        &self.slots
    }

    /// Whether `close` has been called.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Lock-free snapshot of the endpoint table.
    pub fn endpoints_snapshot(&self) -> Arc<Vec<Arc<ServerEndpoint>>> {
        self.endpoints.read().clone()
    }

    /// Whether the topology is (believed) clustered.
    pub fn is_cluster(&self) -> bool {
        self.slots.assigned() > 0
            || self
                .endpoints_snapshot()
                .iter()
                .any(|e| e.role() == ServerRole::ClusterNode)
    }

    /// Find an endpoint by address.
    pub fn endpoint_by_addr(&self, addr: &str) -> Option<Arc<ServerEndpoint>> {
        self.endpoints_snapshot()
            .iter()
            .find(|e| e.address() == addr)
            .cloned()
    }

    /// The endpoint a key routes to, when slot-routed.
    pub fn endpoint_for_key(&self, key: &RedisKey) -> Option<Arc<ServerEndpoint>> {
        if !self.is_cluster() {
            return self.primary_endpoint();
        }
        let slot = routing::hash_slot(key);
        let addr = self.slots.endpoint_for(slot)?;
        self.endpoint_by_addr(&addr)
    }

    /// The preferred write endpoint outside cluster mode.
    pub fn primary_endpoint(&self) -> Option<Arc<ServerEndpoint>> {
        let snapshot = self.endpoints_snapshot();
        snapshot
            .iter()
            .find(|e| e.role() == ServerRole::Primary && e.is_connected())
            .or_else(|| {
                snapshot
                    .iter()
                    .find(|e| e.role() != ServerRole::Sentinel && e.is_connected())
            })
            .or_else(|| snapshot.iter().find(|e| e.role() != ServerRole::Sentinel))
            .cloned()
    }

    /// Get or create the endpoint for an address, preserving table order.
    pub fn ensure_endpoint(&self, addr: &str) -> Arc<ServerEndpoint> {
        if let Some(existing) = self.endpoint_by_addr(addr) {
            return existing;
        }
        let mut guard = self.endpoints.write();
        if let Some(existing) = guard.iter().find(|e| e.address() == addr) {
            return existing.clone();
        }
        tracing::info!(endpoint = addr, "discovered endpoint");
        let endpoint = ServerEndpoint::connect(
            addr.to_string(),
            self.options.clone(),
            self.clock,
            self.events_tx.clone(),
        );
        let mut next: Vec<Arc<ServerEndpoint>> = guard.as_ref().clone();
        next.push(endpoint.clone());
        *guard = Arc::new(next);
        endpoint
    }

    /// Drop endpoints not in `keep` (seed endpoints are always kept).
    pub fn retire_absent_endpoints(&self, keep: &[String]) -> Vec<Arc<ServerEndpoint>> {
        let mut retired = Vec::new();
        let mut guard = self.endpoints.write();
        let next: Vec<Arc<ServerEndpoint>> = guard
            .iter()
            .filter(|e| {
                let keep_it = keep.iter().any(|k| k == e.address())
                    || self.options.endpoints.iter().any(|k| k == e.address());
                if !keep_it {
                    retired.push((*e).clone());
                }
                keep_it
            })
            .cloned()
            .collect();
        *guard = Arc::new(next);
        for endpoint in &retired {
            tracing::info!(endpoint = endpoint.address(), "retiring endpoint");
        }
        retired
    }

    /// Schedule a reconfiguration pass, coalescing with any in progress.
    pub fn request_reconfigure(&self, reason: &'static str) {
        if self.closed() {
            return;
        }
        tracing::debug!(reason, "reconfiguration requested");
        if self.reconfigure_running.load(Ordering::Acquire) {
            self.reconfigure_pending.store(true, Ordering::Release);
        } else {
            self.reconfigure_notify.notify_one();
        }
    }

    /// Pick the endpoint for a message per topology and flags.
    fn select_endpoint(&self, message: &Message) -> Option<Arc<ServerEndpoint>> {
        let snapshot = self.endpoints_snapshot();
        if snapshot.is_empty() {
            return None;
        }
        let hints = message.command().hints();
        let flags = message.flags();

        if self.is_cluster() {
            if let Some(slot) = message.route_slot() {
                if let Some(addr) = self.slots.endpoint_for(slot) {
                    if let Some(endpoint) =
                        snapshot.iter().find(|e| e.address() == addr.as_ref())
                    {
                        return Some(endpoint.clone());
                    }
                }
            }
            // Unassigned slot (or keyless command): any primary works as a
            // bootstrap probe; redirects correct us.
            return snapshot
                .iter()
                .find(|e| e.role().accepts_writes() && e.is_connected())
                .or_else(|| snapshot.first())
                .cloned();
        }

        let replica_legal = hints.replica_ok
            && !hints.writes
            && !flags.contains(MessageFlags::DEMAND_PRIMARY);
        let demand_replica = flags.contains(MessageFlags::DEMAND_REPLICA);
        if (demand_replica || flags.contains(MessageFlags::PREFER_REPLICA)) && replica_legal {
            if let Some(replica) = snapshot
                .iter()
                .find(|e| e.role() == ServerRole::Replica && e.is_connected())
            {
                return Some(replica.clone());
            }
            if demand_replica {
                return None;
            }
        }
        self.primary_endpoint()
    }

    /// Route a message to its endpoint and bridge.
    pub(crate) async fn dispatch(&self, mut message: Message) {
        if self.closed() {
            message.resolve(Err(BraidError::Disposed));
            return;
        }
        message.bump_attempts();
        let Some(endpoint) = self.select_endpoint(&message) else {
            let detail = message
                .shared()
                .failure_detail(self.options.include_detail_in_exceptions);
            message.resolve(Err(BraidError::ConnectionUnavailable { detail }));
            return;
        };
        self.submit_to(&endpoint, message).await;
    }

    /// Submit to a specific endpoint, inserting `SELECT` when the message's
    /// database differs from the bridge's last selected one.
    pub(crate) async fn submit_to(&self, endpoint: &Arc<ServerEndpoint>, message: Message) {
        let role = if message.command().hints().pubsub_state {
            ConnectionRole::Subscription
        } else {
            ConnectionRole::Interactive
        };
        let bridge = endpoint.bridge(role);
        let db = message.db();
        if role == ConnectionRole::Interactive && db >= 0 && i64::from(db) != bridge.last_selected_db()
        {
            let (select, _ticket) = Message::new(
                self.clock,
                CommandId::Select,
                None,
                vec![RedisValue::Integer(i64::from(db))],
                ResultProcessor::OkStatus,
                MessageFlags::empty(),
            );
            bridge.set_last_selected_db(i64::from(db));
            bridge
                .submit_batch(vec![select.with_db(db), message])
                .await;
        } else {
            bridge.submit(message).await;
        }
    }

    /// Issue the wire subscribe for a channel's first handler.
    pub(crate) async fn issue_subscribe(&self, channel: &ChannelId) -> BraidResult<()> {
        let (message, ticket) = Message::new(
            self.clock,
            channel.kind.subscribe_command(),
            Some(RedisKey::from(channel.name.clone())),
            Vec::new(),
            ResultProcessor::Raw,
            MessageFlags::HIGH_PRIORITY,
        );
        self.dispatch(message).await;
        ticket
            .await_reply_within(
                self.options.async_timeout(),
                self.options.include_detail_in_exceptions,
            )
            .await
            .map(|_| ())
    }

    /// Issue the wire unsubscribe for a channel's last handler.
    pub(crate) async fn issue_unsubscribe(&self, channel: &ChannelId) -> BraidResult<()> {
        let (message, ticket) = Message::new(
            self.clock,
            channel.kind.unsubscribe_command(),
            Some(RedisKey::from(channel.name.clone())),
            Vec::new(),
            ResultProcessor::Raw,
            MessageFlags::HIGH_PRIORITY,
        );
        self.dispatch(message).await;
        ticket
            .await_reply_within(
                self.options.async_timeout(),
                self.options.include_detail_in_exceptions,
            )
            .await
            .map(|_| ())
    }

    /// Re-issue every active subscription (after a subscription bridge
    /// reconnects).
    pub(crate) async fn reissue_subscriptions(&self) {
        for channel in self.subscriptions.active_channels() {
            if let Err(err) = self.issue_subscribe(&channel).await {
                tracing::warn!(
                    channel = %String::from_utf8_lossy(&channel.name),
                    error = %err,
                    "re-subscribe failed"
                );
            }
        }
    }

    async fn handle_redirect(self: &Arc<Self>, mut message: Message, redirect: Redirect, from: String) {
        if message.attempts() > self.options.connect_retry {
            let kind = match redirect.kind {
                RedirectKind::Moved => "MOVED",
                RedirectKind::Ask => "ASK",
            };
            message.resolve(Err(BraidError::server(format!(
                "{} {} {}",
                kind, redirect.slot, redirect.endpoint
            ))));
            return;
        }
        message.bump_attempts();
        tracing::debug!(
            slot = redirect.slot,
            from = %from,
            to = %redirect.endpoint,
            kind = ?redirect.kind,
            "following redirect"
        );
        let endpoint = self.ensure_endpoint(&redirect.endpoint);
        match redirect.kind {
            RedirectKind::Moved => {
                self.slots.assign(redirect.slot, &redirect.endpoint);
                endpoint.set_role(ServerRole::ClusterNode);
                self.request_reconfigure("slot-moved");
                self.submit_to(&endpoint, message).await;
            }
            RedirectKind::Ask => {
                // ASKING and the retried command ride one batch: nothing can
                // interleave between them.
                let (asking, _ticket) = Message::new(
                    self.clock,
                    CommandId::Asking,
                    None,
                    Vec::new(),
                    ResultProcessor::OkStatus,
                    MessageFlags::NO_REDIRECT,
                );
                let bridge = endpoint.bridge(ConnectionRole::Interactive);
                let mut batch = vec![asking, message];
                let db = batch[1].db();
                if db >= 0 && i64::from(db) != bridge.last_selected_db() {
                    let (select, _ticket) = Message::new(
                        self.clock,
                        CommandId::Select,
                        None,
                        vec![RedisValue::Integer(i64::from(db))],
                        ResultProcessor::OkStatus,
                        MessageFlags::empty(),
                    );
                    bridge.set_last_selected_db(i64::from(db));
                    batch.insert(0, select);
                }
                bridge.submit_batch(batch).await;
            }
        }
    }

    async fn handle_retry(self: &Arc<Self>, mut message: Message, error: ServerError) {
        if message.attempts() > self.options.connect_retry {
            message.resolve(Err(BraidError::Server { error }));
            return;
        }
        message.bump_attempts();

        if error.kind == ServerErrorKind::NoScript {
            let Some(script) = message.script().cloned() else {
                message.resolve(Err(BraidError::Server { error }));
                return;
            };
            let inner = self.clone();
            tokio::spawn(async move {
                let (load, ticket) = Message::new(
                    inner.clock,
                    CommandId::ScriptLoad,
                    None,
                    vec![RedisValue::Bytes(script)],
                    ResultProcessor::BytesNullable,
                    MessageFlags::HIGH_PRIORITY,
                );
                inner.dispatch(load).await;
                match ticket
                    .await_reply_within(
                        inner.options.async_timeout(),
                        inner.options.include_detail_in_exceptions,
                    )
                    .await
                {
                    Ok(_) => inner.dispatch(message).await,
                    Err(err) => message.resolve(Err(err)),
                }
            });
            return;
        }

        // LOADING / TRYAGAIN / CLUSTERDOWN: back off briefly, then re-route.
        if error.kind == ServerErrorKind::ClusterDown {
            self.request_reconfigure("cluster-down");
        }
        let inner = self.clone();
        let delay = std::time::Duration::from_millis(50 * u64::from(message.attempts()));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.dispatch(message).await;
        });
    }
}

async fn run_events(inner: Arc<MultiplexerInner>, mut rx: mpsc::UnboundedReceiver<BridgeEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            BridgeEvent::Established {
                endpoint,
                role,
                resp,
                server_version,
            } => {
                if let Some(ep) = inner.endpoint_by_addr(&endpoint) {
                    ep.note_established(resp, server_version.as_deref());
                    if role == ConnectionRole::Interactive {
                        ep.bridge(ConnectionRole::Interactive)
                            .set_last_selected_db(i64::from(inner.options.default_database));
                    }
                }
                if role == ConnectionRole::Subscription {
                    inner.reissue_subscriptions().await;
                }
                inner.request_reconfigure("bridge-established");
            }
            BridgeEvent::Failed {
                endpoint,
                role,
                kind,
                message,
            } => {
                tracing::warn!(
                    endpoint = %endpoint,
                    role = %role,
                    kind = %kind,
                    cause = %message,
                    "bridge failure"
                );
                if kind == ConnectionFailureKind::AuthenticationFailure {
                    // Terminal until configuration changes; nothing to retry.
                    continue;
                }
            }
            BridgeEvent::Redirect {
                message,
                redirect,
                from,
            } => {
                inner.handle_redirect(*message, redirect, from).await;
            }
            BridgeEvent::Retry { message, error } => {
                inner.handle_retry(*message, error).await;
            }
            BridgeEvent::Delivery { frame, .. } => {
                inner.subscriptions.dispatch_frame(frame);
            }
        }
    }
}

async fn run_heartbeat(inner: Arc<MultiplexerInner>) {
    let mut ticker = tokio::time::interval(inner.options.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let overdue_ms = inner.options.sync_timeout().as_millis() as u64;
    let idle_floor_ms = inner
        .options
        .heartbeat_interval()
        .as_millis()
        .min(inner.options.keep_alive().map(|d| d.as_millis()).unwrap_or(u128::MAX))
        as u64;
    loop {
        ticker.tick().await;
        if inner.closed() {
            break;
        }
        let snapshot = inner.endpoints_snapshot();
        for endpoint in snapshot.iter() {
            for role in [ConnectionRole::Interactive, ConnectionRole::Subscription] {
                let bridge = endpoint.bridge(role);
                if !bridge.is_established() {
                    continue;
                }
                if let Some(oldest) = bridge.oldest_in_flight_sent() {
                    if inner.clock.now().since(oldest) > overdue_ms {
                        tracing::warn!(
                            endpoint = %endpoint.address(),
                            role = %role,
                            "reply overdue; tearing bridge down"
                        );
                        bridge.request_teardown();
                        continue;
                    }
                }
                if bridge.in_flight_depth() == 0 && bridge.reply_idle_ms() >= idle_floor_ms {
                    let (ping, _ticket) = Message::new(
                        inner.clock,
                        CommandId::Ping,
                        None,
                        Vec::new(),
                        ResultProcessor::Void,
                        MessageFlags::HIGH_PRIORITY,
                    );
                    bridge.submit(ping).await;
                }
            }
        }
    }
}

async fn run_reconfigure_worker(inner: Arc<MultiplexerInner>) {
    loop {
        inner.reconfigure_notify.notified().await;
        if inner.closed() {
            break;
        }
        loop {
            inner.reconfigure_running.store(true, Ordering::Release);
            reconfigure::run(&inner).await;
            inner.reconfigure_running.store(false, Ordering::Release);
            if !inner.reconfigure_pending.swap(false, Ordering::AcqRel) {
                break;
            }
        }
    }
}

async fn run_reconfigure_timer(inner: Arc<MultiplexerInner>) {
    if inner.options.config_check_seconds == 0 {
        return;
    }
    let period = std::time::Duration::from_secs(inner.options.config_check_seconds);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick
    loop {
        ticker.tick().await;
        if inner.closed() {
            break;
        }
        inner.request_reconfigure("interval");
    }
}

/// Per-endpoint status snapshot.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    /// `host:port`.
    pub address: String,
    /// Believed role.
    pub role: ServerRole,
    /// Learned version.
    pub version: Option<ServerVersion>,
    /// Interactive bridge state.
    pub interactive: crate::bridge::BridgeState,
    /// Subscription bridge state.
    pub subscription: crate::bridge::BridgeState,
    /// Interactive in-flight depth.
    pub in_flight: usize,
}

/// Read-only view of one server for admin inspection.
#[derive(Clone)]
pub struct ServerView {
    endpoint: Arc<ServerEndpoint>,
}

impl ServerView {
    /// `host:port`.
    pub fn address(&self) -> &str {
        self.endpoint.address()
    }

    /// Believed role.
    pub fn role(&self) -> ServerRole {
        self.endpoint.role()
    }

    /// Learned version.
    pub fn version(&self) -> Option<ServerVersion> {
        self.endpoint.version()
    }

    /// Negotiated RESP version, once established.
    pub fn resp(&self) -> Option<crate::protocol::RespVersion> {
        self.endpoint.resp()
    }

    /// Whether the interactive bridge serves traffic.
    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }
}

/// The multiplexing client.
pub struct Multiplexer {
    inner: Arc<MultiplexerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    config_token: Mutex<Option<SubscriptionToken>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("endpoints", &self.inner.endpoints_snapshot().len())
            .field("closed", &self.inner.closed())
            .finish()
    }
}

impl Multiplexer {
    /// Connect from an option string (`"host:port,option=value,..."`).
    pub async fn connect_str(spec: &str) -> BraidResult<Self> {
        Self::connect(Options::parse(spec)?).await
    }

    /// Connect with explicit options.
    pub async fn connect(options: Options) -> BraidResult<Self> {
        options.validate()?;
        let options = Arc::new(options);
        let clock = TickClock::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (router, fanout_rx) = SubscriptionRouter::new();
        let inner = Arc::new(MultiplexerInner {
            options: options.clone(),
            clock,
            endpoints: RwLock::new(Arc::new(Vec::new())),
            slots: SlotMap::new(),
            subscriptions: Arc::new(router),
            events_tx,
            reconfigure_running: AtomicBool::new(false),
            reconfigure_pending: AtomicBool::new(false),
            reconfigure_notify: Notify::new(),
            closed: AtomicBool::new(false),
        });

        for addr in &options.endpoints {
            inner.ensure_endpoint(addr);
        }

        let tasks = vec![
            tokio::spawn(run_events(inner.clone(), events_rx)),
            tokio::spawn(subscriber::run_fanout(inner.subscriptions.clone(), fanout_rx)),
            tokio::spawn(run_heartbeat(inner.clone())),
            tokio::spawn(run_reconfigure_worker(inner.clone())),
            tokio::spawn(run_reconfigure_timer(inner.clone())),
        ];
        let mux = Self {
            inner: inner.clone(),
            tasks: Mutex::new(tasks),
            config_token: Mutex::new(None),
        };

        // Wait for a first bridge (or a terminal auth failure, which is
        // surfaced per command rather than here).
        let deadline = tokio::time::Instant::now() + options.connect_timeout();
        loop {
            let snapshot = inner.endpoints_snapshot();
            if snapshot.iter().any(|e| e.is_connected()) {
                break;
            }
            if snapshot
                .iter()
                .any(|e| e.bridge(ConnectionRole::Interactive).auth_failed())
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                if options.abort_connect {
                    mux.close(false).await;
                    return Err(BraidError::ConnectionFailure {
                        kind: ConnectionFailureKind::UnableToConnect,
                        endpoint: options.endpoints.join(","),
                        role: ConnectionRole::Interactive,
                        message: "no endpoint became ready before connectTimeout".to_string(),
                    });
                }
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Initial topology probe, inline so the first commands route well.
        reconfigure::run(&inner).await;

        // The config channel nudges reconfiguration on primary changes.
        if inner
            .endpoints_snapshot()
            .iter()
            .any(|e| e.is_connected())
        {
            let weak = Arc::downgrade(&inner);
            let handler: MessageHandler = Arc::new(move |_msg: &ChannelMessage| {
                if let Some(inner) = weak.upgrade() {
                    inner.request_reconfigure("config-channel");
                }
            });
            let channel = Bytes::from(options.config_channel.clone());
            if let Ok(token) = mux.subscriber().subscribe(channel, handler).await {
                *mux.config_token.lock() = Some(token);
            }
        }

        if options.service_name.is_some() {
            mux.tasks
                .lock()
                .push(tokio::spawn(sentinel::run(inner.clone())));
        }

        Ok(mux)
    }

    /// A database view bound to the given index.
    pub fn database(&self, index: u32) -> BraidResult<Database> {
        if index > 15 {
            return Err(BraidError::configuration(format!(
                "database index {} out of range 0..15",
                index
            )));
        }
        Ok(Database::new(self.inner.clone(), index))
    }

    /// The database view for the configured default index.
    pub fn default_database(&self) -> Database {
        Database::new(self.inner.clone(), self.inner.options.default_database)
    }

    /// The pub/sub view.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber {
            inner: self.inner.clone(),
        }
    }

    /// A view of one server, when known.
    pub fn server(&self, addr: &str) -> Option<ServerView> {
        self.inner
            .endpoint_by_addr(addr)
            .map(|endpoint| ServerView { endpoint })
    }

    /// Execute a raw command through routing, with the given processor.
    pub async fn execute(
        &self,
        command: CommandId,
        key: Option<RedisKey>,
        args: Vec<RedisValue>,
        processor: ResultProcessor,
        flags: MessageFlags,
    ) -> BraidResult<TypedReply> {
        if command.hints().admin && !self.inner.options.allow_admin {
            return Err(BraidError::configuration(format!(
                "admin command {} requires allowAdmin=true",
                command.name()
            )));
        }
        let (message, ticket) = Message::new(
            self.inner.clock,
            command,
            key,
            args,
            processor,
            flags,
        );
        let deadline = message
            .deadline()
            .unwrap_or_else(|| self.inner.options.async_timeout());
        self.inner.dispatch(message).await;
        if flags.contains(MessageFlags::FIRE_AND_FORGET) {
            return ticket.await_reply().await;
        }
        ticket
            .await_reply_within(deadline, self.inner.options.include_detail_in_exceptions)
            .await
    }

    /// Externally nudge reconfiguration.
    pub fn configure(&self) {
        self.inner.request_reconfigure("external");
    }

    /// Per-endpoint status snapshot.
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.inner
            .endpoints_snapshot()
            .iter()
            .map(|e| EndpointStatus {
                address: e.address().to_string(),
                role: e.role(),
                version: e.version(),
                interactive: e.bridge(ConnectionRole::Interactive).state(),
                subscription: e.bridge(ConnectionRole::Subscription).state(),
                in_flight: e.bridge(ConnectionRole::Interactive).in_flight_depth(),
            })
            .collect()
    }

    /// Shared inner handle (crate-internal plumbing).
    pub(crate) fn inner(&self) -> &Arc<MultiplexerInner> {
        &self.inner
    }

    /// Close the multiplexer. With `allow_pending`, queued writes drain
    /// first; everything else fails with `Disposed`.
    pub async fn close(&self, allow_pending: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(allow_pending, "closing multiplexer");
        self.inner.reconfigure_notify.notify_one();
        let snapshot = self.inner.endpoints_snapshot();
        for endpoint in snapshot.iter() {
            endpoint.close(allow_pending).await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
