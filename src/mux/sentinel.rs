//! Sentinel topology monitoring.
//!
//! When `serviceName` is configured, this task subscribes to the sentinel
//! failover channels (`+switch-master`, `+odown`) and periodically asks
//! `SENTINEL get-master-addr-by-name` for the service's current primary.
//! Either signal nudges reconfiguration of the data-plane endpoints.

use crate::command::{CommandId, Message, MessageFlags, RedisValue, ResultProcessor, TypedReply};
use crate::endpoint::ServerRole;
use crate::mux::subscriber::{ChannelMessage, MessageHandler, Subscriber, SubscriptionToken};
use crate::mux::MultiplexerInner;
use bytes::Bytes;
use std::sync::Arc;

/// Poll cadence when pub/sub events are quiet.
const LOOKUP_INTERVAL_SECS: u64 = 10;

pub(crate) async fn run(inner: Arc<MultiplexerInner>) {
    let Some(service) = inner.options().service_name.clone() else {
        return;
    };
    let subscriber = Subscriber {
        inner: inner.clone(),
    };
    let mut switch_token: Option<SubscriptionToken> = None;
    let mut odown_token: Option<SubscriptionToken> = None;

    loop {
        if inner.closed() {
            break;
        }

        if switch_token.is_none() {
            let weak = Arc::downgrade(&inner);
            let handler: MessageHandler = Arc::new(move |message: &ChannelMessage| {
                if let Some(inner) = weak.upgrade() {
                    tracing::info!(
                        payload = %String::from_utf8_lossy(&message.payload),
                        "sentinel failover event"
                    );
                    inner.request_reconfigure("sentinel-event");
                }
            });
            switch_token = subscriber
                .subscribe(Bytes::from_static(b"+switch-master"), handler.clone())
                .await
                .ok();
            odown_token = subscriber
                .subscribe(Bytes::from_static(b"+odown"), handler)
                .await
                .ok();
        }

        lookup_primary(&inner, &service).await;

        tokio::time::sleep(std::time::Duration::from_secs(LOOKUP_INTERVAL_SECS)).await;
    }

    if let Some(token) = switch_token {
        let _ = subscriber.unsubscribe(token).await;
    }
    if let Some(token) = odown_token {
        let _ = subscriber.unsubscribe(token).await;
    }
}

/// Ask a sentinel for the service's primary; discovering a new address
/// nudges reconfiguration.
async fn lookup_primary(inner: &Arc<MultiplexerInner>, service: &str) {
    let snapshot = inner.endpoints_snapshot();
    let Some(sentinel) = snapshot
        .iter()
        .find(|e| e.role() == ServerRole::Sentinel && e.is_connected())
    else {
        return;
    };
    let (message, ticket) = Message::new(
        inner.clock(),
        CommandId::Sentinel,
        None,
        vec![
            RedisValue::Literal("get-master-addr-by-name"),
            RedisValue::Bytes(Bytes::from(service.to_string())),
        ],
        ResultProcessor::BulkArray,
        MessageFlags::HIGH_PRIORITY,
    );
    inner.submit_to(sentinel, message).await;
    let reply = ticket
        .await_reply_within(
            inner.options().sync_timeout(),
            inner.options().include_detail_in_exceptions,
        )
        .await;
    let Ok(TypedReply::BulkArray(items)) = reply else {
        return;
    };
    let (Some(Some(host)), Some(Some(port))) = (items.first(), items.get(1)) else {
        return;
    };
    let addr = format!(
        "{}:{}",
        String::from_utf8_lossy(host),
        String::from_utf8_lossy(port)
    );
    let known = inner.endpoint_by_addr(&addr).is_some();
    let endpoint = inner.ensure_endpoint(&addr);
    if !known || endpoint.role() != ServerRole::Primary {
        tracing::info!(service, primary = %addr, "sentinel names primary");
        inner.request_reconfigure("sentinel-primary");
    }
}
