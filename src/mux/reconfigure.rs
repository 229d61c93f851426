//! Topology discovery and reconfiguration.
//!
//! One pass probes connected endpoints (`CLUSTER NODES`, falling back to
//! `INFO`), rebuilds the slot map in cluster mode, discovers and retires
//! endpoints, resolves competing primaries through the tiebreaker key, and
//! re-asserts the tiebreaker on the elected primary. Passes are serialized
//! by the multiplexer's reconfigure worker.

use crate::command::{
    CommandId, Message, MessageFlags, RedisKey, RedisValue, ResultProcessor, TypedReply,
};
use crate::endpoint::{ServerEndpoint, ServerRole, ServerVersion};
use crate::mux::MultiplexerInner;
use crate::routing::ClusterNode;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

enum Probe {
    Cluster(Vec<ClusterNode>),
    Standalone {
        role: ServerRole,
        version: Option<ServerVersion>,
    },
    Failed,
}

/// Run one reconfiguration pass.
pub(crate) async fn run(inner: &Arc<MultiplexerInner>) {
    if inner.closed() {
        return;
    }
    tracing::debug!("reconfiguration pass");

    let snapshot = inner.endpoints_snapshot();
    let mut cluster: Option<Vec<ClusterNode>> = None;
    for endpoint in snapshot.iter() {
        if !endpoint.is_connected() {
            continue;
        }
        match probe_endpoint(inner, endpoint).await {
            Probe::Cluster(nodes) => {
                // One node's view describes the whole cluster.
                cluster = Some(nodes);
                break;
            }
            Probe::Standalone { role, version } => {
                endpoint.set_role(role);
                if let Some(version) = version {
                    endpoint.set_version(version);
                }
            }
            Probe::Failed => {}
        }
    }

    if let Some(nodes) = cluster {
        apply_cluster(inner, nodes);
        return;
    }

    resolve_primaries(inner).await;
    assert_tiebreaker(inner).await;
}

fn apply_cluster(inner: &Arc<MultiplexerInner>, nodes: Vec<ClusterNode>) {
    inner.slots().rebuild(&nodes);
    let mut keep = Vec::with_capacity(nodes.len());
    for node in nodes.iter().filter(|n| !n.is_failing()) {
        keep.push(node.addr.clone());
        let endpoint = inner.ensure_endpoint(&node.addr);
        endpoint.set_role(ServerRole::ClusterNode);
    }
    tracing::info!(
        nodes = keep.len(),
        slots = inner.slots().assigned(),
        "cluster topology applied"
    );
    for endpoint in inner.retire_absent_endpoints(&keep) {
        tokio::spawn(async move {
            endpoint.close(false).await;
        });
    }
}

/// When more than one endpoint claims to be primary, the tiebreaker key
/// decides: its value names the preferred endpoint address.
async fn resolve_primaries(inner: &Arc<MultiplexerInner>) {
    let snapshot = inner.endpoints_snapshot();
    let primaries: Vec<Arc<ServerEndpoint>> = snapshot
        .iter()
        .filter(|e| e.role() == ServerRole::Primary && e.is_connected())
        .cloned()
        .collect();
    if primaries.len() < 2 {
        return;
    }
    tracing::warn!(count = primaries.len(), "competing primaries; consulting tiebreaker");

    let mut tally: HashMap<Bytes, usize> = HashMap::new();
    for endpoint in &primaries {
        let value = read_tiebreaker(inner, endpoint).await;
        endpoint.set_tiebreaker_value(value.clone());
        if let Some(value) = value {
            *tally.entry(value).or_insert(0) += 1;
        }
    }
    let Some((winner, _)) = tally.into_iter().max_by_key(|(_, count)| *count) else {
        return;
    };
    let winner_addr = String::from_utf8_lossy(&winner).into_owned();
    if !primaries.iter().any(|e| e.address() == winner_addr) {
        tracing::warn!(value = %winner_addr, "tiebreaker names an unknown endpoint");
        return;
    }
    for endpoint in &primaries {
        if endpoint.address() != winner_addr {
            endpoint.set_role(ServerRole::Replica);
        }
    }
}

/// Write the tiebreaker on the elected primary to assert its identity.
/// Interaction with externally managed failover is advisory only.
async fn assert_tiebreaker(inner: &Arc<MultiplexerInner>) {
    let Some(primary) = inner.primary_endpoint() else {
        return;
    };
    if primary.role() != ServerRole::Primary {
        return;
    }
    let tiebreaker = inner.options().tiebreaker.clone();
    let (message, _ticket) = Message::new(
        inner.clock(),
        CommandId::Set,
        Some(RedisKey::from(tiebreaker)),
        vec![RedisValue::Bytes(Bytes::from(
            primary.address().to_string(),
        ))],
        ResultProcessor::OkStatus,
        MessageFlags::FIRE_AND_FORGET,
    );
    inner.submit_to(&primary, message).await;
}

async fn read_tiebreaker(
    inner: &Arc<MultiplexerInner>,
    endpoint: &Arc<ServerEndpoint>,
) -> Option<Bytes> {
    let (message, ticket) = Message::new(
        inner.clock(),
        CommandId::Get,
        Some(RedisKey::from(inner.options().tiebreaker.clone())),
        Vec::new(),
        ResultProcessor::BytesNullable,
        MessageFlags::HIGH_PRIORITY,
    );
    inner.submit_to(endpoint, message).await;
    match ticket
        .await_reply_within(
            inner.options().sync_timeout(),
            inner.options().include_detail_in_exceptions,
        )
        .await
    {
        Ok(TypedReply::Bytes(value)) => value,
        _ => None,
    }
}

async fn probe_endpoint(inner: &Arc<MultiplexerInner>, endpoint: &Arc<ServerEndpoint>) -> Probe {
    let flags = MessageFlags::HIGH_PRIORITY.with(MessageFlags::NO_REDIRECT);
    let timeout = inner.options().sync_timeout();
    let include_detail = inner.options().include_detail_in_exceptions;

    let (message, ticket) = Message::new(
        inner.clock(),
        CommandId::ClusterNodes,
        None,
        Vec::new(),
        ResultProcessor::ClusterNodesText,
        flags,
    );
    inner.submit_to(endpoint, message).await;
    match ticket.await_reply_within(timeout, include_detail).await {
        Ok(TypedReply::ClusterNodes(nodes))
            if nodes.iter().any(|n| !n.slots.is_empty()) =>
        {
            return Probe::Cluster(nodes);
        }
        // Standalone servers reply "-ERR This instance has cluster support
        // disabled"; fall through to INFO.
        _ => {}
    }

    let (message, ticket) = Message::new(
        inner.clock(),
        CommandId::Info,
        None,
        Vec::new(),
        ResultProcessor::BytesNullable,
        MessageFlags::HIGH_PRIORITY,
    );
    inner.submit_to(endpoint, message).await;
    match ticket.await_reply_within(timeout, include_detail).await {
        Ok(TypedReply::Bytes(Some(text))) => {
            let (role, version) = parse_info(&text);
            Probe::Standalone { role, version }
        }
        _ => Probe::Failed,
    }
}

/// Pull role, mode, and version out of an `INFO` reply.
fn parse_info(text: &[u8]) -> (ServerRole, Option<ServerVersion>) {
    let text = String::from_utf8_lossy(text);
    let mut role = ServerRole::Unknown;
    let mut version = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("redis_mode:") {
            match value {
                "cluster" => role = ServerRole::ClusterNode,
                "sentinel" => role = ServerRole::Sentinel,
                _ => {}
            }
        } else if let Some(value) = line.strip_prefix("role:") {
            if role == ServerRole::Unknown {
                role = match value {
                    "master" => ServerRole::Primary,
                    "slave" => ServerRole::Replica,
                    _ => ServerRole::Unknown,
                };
            }
        } else if let Some(value) = line.strip_prefix("redis_version:") {
            version = ServerVersion::parse(value);
        }
    }
    (role, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_info_primary() {
        let (role, version) = parse_info(
            b"# Server\r\nredis_version:7.2.4\r\nredis_mode:standalone\r\n# Replication\r\nrole:master\r\n",
        );
        assert_eq!(role, ServerRole::Primary);
        assert_eq!(version, ServerVersion::parse("7.2.4"));
    }

    #[test]
    fn parse_info_replica_and_sentinel() {
        let (role, _) = parse_info(b"role:slave\r\n");
        assert_eq!(role, ServerRole::Replica);

        let (role, _) = parse_info(b"redis_mode:sentinel\r\nrole:master\r\n");
        assert_eq!(role, ServerRole::Sentinel);
    }

    #[test]
    fn parse_info_cluster_mode() {
        let (role, _) = parse_info(b"redis_mode:cluster\r\nrole:master\r\n");
        assert_eq!(role, ServerRole::ClusterNode);
    }
}
