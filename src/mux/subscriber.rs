//! Pub/sub routing: the subscription table and handler fanout.
//!
//! The table maps a channel descriptor (name + literal/pattern/sharded) to
//! an ordered handler list. The wire `SUBSCRIBE` is issued only for the
//! first handler and `UNSUBSCRIBE` for the last; deliveries fan out on a
//! worker task so the read loop never blocks on user code.

use crate::command::{CommandId, Message, MessageFlags, RedisKey, ResultProcessor};
use crate::core::error::{BraidError, BraidResult};
use crate::mux::MultiplexerInner;
use crate::protocol::RawFrame;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How a channel descriptor matches deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Exact channel name (`SUBSCRIBE`).
    Literal,
    /// Glob pattern (`PSUBSCRIBE`).
    Pattern,
    /// Sharded channel (`SSUBSCRIBE`).
    Sharded,
}

impl ChannelKind {
    pub(crate) fn subscribe_command(self) -> CommandId {
        match self {
            Self::Literal => CommandId::Subscribe,
            Self::Pattern => CommandId::PSubscribe,
            Self::Sharded => CommandId::SSubscribe,
        }
    }

    pub(crate) fn unsubscribe_command(self) -> CommandId {
        match self {
            Self::Literal => CommandId::Unsubscribe,
            Self::Pattern => CommandId::PUnsubscribe,
            Self::Sharded => CommandId::SUnsubscribe,
        }
    }
}

/// A channel or pattern key in the subscription table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    /// Channel name or pattern bytes.
    pub name: Bytes,
    /// Matching mode.
    pub kind: ChannelKind,
}

impl ChannelId {
    /// A literal channel.
    pub fn literal(name: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Literal,
        }
    }

    /// A glob pattern.
    pub fn pattern(name: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Pattern,
        }
    }

    /// A sharded channel.
    pub fn sharded(name: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Sharded,
        }
    }
}

/// A delivered pub/sub message.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// The channel the message was published to.
    pub channel: Bytes,
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<Bytes>,
    /// Message payload.
    pub payload: Bytes,
}

/// A registered delivery handler.
pub type MessageHandler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Handle identifying one registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionToken {
    id: u64,
    channel: ChannelId,
}

impl SubscriptionToken {
    /// The channel this token subscribes to.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }
}

struct ChannelEntry {
    handlers: Vec<(u64, MessageHandler)>,
}

/// The shared subscription table and fanout feed.
pub struct SubscriptionRouter {
    table: Mutex<HashMap<ChannelId, ChannelEntry>>,
    next_token: AtomicU64,
    fanout_tx: mpsc::UnboundedSender<(ChannelId, ChannelMessage)>,
}

impl SubscriptionRouter {
    /// Create the router and the receiver its fanout worker drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ChannelId, ChannelMessage)>) {
        let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();
        (
            Self {
                table: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                fanout_tx,
            },
            fanout_rx,
        )
    }

    /// Register a handler. Returns the token and whether this was the
    /// channel's first handler (wire command needed).
    pub fn add(&self, channel: ChannelId, handler: MessageHandler) -> (SubscriptionToken, bool) {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock();
        let entry = table.entry(channel.clone()).or_insert_with(|| ChannelEntry {
            handlers: Vec::new(),
        });
        let first = entry.handlers.is_empty();
        entry.handlers.push((id, handler));
        (SubscriptionToken { id, channel }, first)
    }

    /// Remove a handler. Returns whether the channel is now empty (wire
    /// command needed).
    pub fn remove(&self, token: &SubscriptionToken) -> bool {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(&token.channel) else {
            return false;
        };
        entry.handlers.retain(|(id, _)| *id != token.id);
        if entry.handlers.is_empty() {
            table.remove(&token.channel);
            true
        } else {
            false
        }
    }

    /// Handlers registered for a channel.
    pub fn handler_count(&self, channel: &ChannelId) -> usize {
        self.table
            .lock()
            .get(channel)
            .map(|e| e.handlers.len())
            .unwrap_or(0)
    }

    /// Whether the table holds no subscriptions at all.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// All channels with at least one handler.
    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.table.lock().keys().cloned().collect()
    }

    /// Route a delivery frame into the fanout queue.
    pub fn dispatch_frame(&self, frame: RawFrame) {
        let Some((channel_id, message)) = parse_delivery(&frame) else {
            tracing::debug!(kind = frame.kind_name(), "undeliverable pub/sub frame");
            return;
        };
        if self.table.lock().contains_key(&channel_id) {
            let _ = self.fanout_tx.send((channel_id, message));
        } else {
            tracing::debug!(
                channel = %String::from_utf8_lossy(&channel_id.name),
                "delivery for channel with no handlers"
            );
        }
    }

    /// Snapshot a channel's handlers in registration order.
    fn handlers_for(&self, channel: &ChannelId) -> Vec<MessageHandler> {
        self.table
            .lock()
            .get(channel)
            .map(|e| e.handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// Decode a delivery frame into its channel descriptor and message.
fn parse_delivery(frame: &RawFrame) -> Option<(ChannelId, ChannelMessage)> {
    let items = frame.as_items()?;
    let event = items.first()?.as_str()?;
    match event {
        "message" | "smessage" if items.len() >= 3 => {
            let channel = Bytes::copy_from_slice(items[1].as_bytes()?);
            let payload = Bytes::copy_from_slice(items[2].as_bytes()?);
            let kind = if event == "smessage" {
                ChannelKind::Sharded
            } else {
                ChannelKind::Literal
            };
            Some((
                ChannelId {
                    name: channel.clone(),
                    kind,
                },
                ChannelMessage {
                    channel,
                    pattern: None,
                    payload,
                },
            ))
        }
        "pmessage" if items.len() >= 4 => {
            let pattern = Bytes::copy_from_slice(items[1].as_bytes()?);
            let channel = Bytes::copy_from_slice(items[2].as_bytes()?);
            let payload = Bytes::copy_from_slice(items[3].as_bytes()?);
            Some((
                ChannelId {
                    name: pattern.clone(),
                    kind: ChannelKind::Pattern,
                },
                ChannelMessage {
                    channel,
                    pattern: Some(pattern),
                    payload,
                },
            ))
        }
        _ => None,
    }
}

/// Fanout worker: invokes handlers in registration order, off the read loop.
pub(crate) async fn run_fanout(
    router: Arc<SubscriptionRouter>,
    mut rx: mpsc::UnboundedReceiver<(ChannelId, ChannelMessage)>,
) {
    while let Some((channel, message)) = rx.recv().await {
        for handler in router.handlers_for(&channel) {
            handler(&message);
        }
    }
}

/// Pub/sub view over a multiplexer.
#[derive(Clone)]
pub struct Subscriber {
    pub(crate) inner: Arc<MultiplexerInner>,
}

impl Subscriber {
    /// Subscribe a handler to a literal channel.
    pub async fn subscribe(
        &self,
        channel: impl Into<Bytes>,
        handler: MessageHandler,
    ) -> BraidResult<SubscriptionToken> {
        self.register(ChannelId::literal(channel), handler).await
    }

    /// Subscribe a handler to a glob pattern.
    pub async fn psubscribe(
        &self,
        pattern: impl Into<Bytes>,
        handler: MessageHandler,
    ) -> BraidResult<SubscriptionToken> {
        self.register(ChannelId::pattern(pattern), handler).await
    }

    /// Subscribe a handler to a sharded channel.
    pub async fn ssubscribe(
        &self,
        channel: impl Into<Bytes>,
        handler: MessageHandler,
    ) -> BraidResult<SubscriptionToken> {
        self.register(ChannelId::sharded(channel), handler).await
    }

    async fn register(
        &self,
        channel: ChannelId,
        handler: MessageHandler,
    ) -> BraidResult<SubscriptionToken> {
        let (token, first) = self.inner.subscriptions().add(channel.clone(), handler);
        if first {
            if let Err(err) = self.inner.issue_subscribe(&channel).await {
                // Roll the registration back so refcounts stay truthful.
                self.inner.subscriptions().remove(&token);
                return Err(err);
            }
        }
        Ok(token)
    }

    /// Remove a handler; issues the wire unsubscribe for the last one.
    pub async fn unsubscribe(&self, token: SubscriptionToken) -> BraidResult<()> {
        let last = self.inner.subscriptions().remove(&token);
        if last {
            self.inner.issue_unsubscribe(token.channel()).await?;
        }
        Ok(())
    }

    /// Publish a payload; resolves to the receiver count.
    pub async fn publish(
        &self,
        channel: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> BraidResult<i64> {
        let (message, ticket) = Message::new(
            self.inner.clock(),
            CommandId::Publish,
            Some(RedisKey::from(channel.into())),
            vec![crate::command::RedisValue::Bytes(payload.into())],
            ResultProcessor::Integer,
            MessageFlags::empty(),
        );
        self.inner.dispatch(message).await;
        let reply = ticket
            .await_reply_within(
                self.inner.options().async_timeout(),
                self.inner.options().include_detail_in_exceptions,
            )
            .await?;
        reply
            .as_int()
            .ok_or(BraidError::UnexpectedReply {
                command: "PUBLISH",
                expected: "integer",
                got: "other",
            })
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> MessageHandler {
        Arc::new(|_msg: &ChannelMessage| {})
    }

    #[test]
    fn refcount_drives_wire_commands() {
        let (router, _rx) = SubscriptionRouter::new();
        let channel = ChannelId::literal(Bytes::from_static(b"c"));

        let (t1, first1) = router.add(channel.clone(), noop_handler());
        assert!(first1);
        let (t2, first2) = router.add(channel.clone(), noop_handler());
        assert!(!first2);
        assert_eq!(router.handler_count(&channel), 2);

        assert!(!router.remove(&t1));
        assert!(router.remove(&t2));
        assert!(router.is_empty());
    }

    #[test]
    fn removing_unknown_token_is_harmless() {
        let (router, _rx) = SubscriptionRouter::new();
        let channel = ChannelId::literal(Bytes::from_static(b"c"));
        let (token, _) = router.add(channel.clone(), noop_handler());
        assert!(router.remove(&token));
        assert!(!router.remove(&token));
    }

    #[test]
    fn delivery_parsing() {
        let frame = RawFrame::Push(vec![
            RawFrame::Bulk(Bytes::from_static(b"message")),
            RawFrame::Bulk(Bytes::from_static(b"news")),
            RawFrame::Bulk(Bytes::from_static(b"hello")),
        ]);
        let (channel, message) = parse_delivery(&frame).unwrap();
        assert_eq!(channel.kind, ChannelKind::Literal);
        assert_eq!(message.channel.as_ref(), b"news");
        assert_eq!(message.payload.as_ref(), b"hello");

        let pframe = RawFrame::Array(vec![
            RawFrame::Bulk(Bytes::from_static(b"pmessage")),
            RawFrame::Bulk(Bytes::from_static(b"n.*")),
            RawFrame::Bulk(Bytes::from_static(b"news")),
            RawFrame::Bulk(Bytes::from_static(b"hi")),
        ]);
        let (channel, message) = parse_delivery(&pframe).unwrap();
        assert_eq!(channel.kind, ChannelKind::Pattern);
        assert_eq!(message.pattern.as_deref(), Some(b"n.*".as_slice()));
    }

    #[tokio::test]
    async fn fanout_preserves_registration_order() {
        let (router, rx) = SubscriptionRouter::new();
        let router = Arc::new(router);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let channel = ChannelId::literal(Bytes::from_static(b"c"));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            router.add(
                channel.clone(),
                Arc::new(move |_msg: &ChannelMessage| {
                    seen.lock().push(tag);
                }),
            );
        }

        let worker = tokio::spawn(run_fanout(router.clone(), rx));
        router.dispatch_frame(RawFrame::Array(vec![
            RawFrame::Bulk(Bytes::from_static(b"message")),
            RawFrame::Bulk(Bytes::from_static(b"c")),
            RawFrame::Bulk(Bytes::from_static(b"payload")),
        ]));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec!["first", "second"]);
        worker.abort();
    }
}
