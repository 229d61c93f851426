//! Hash-slot routing and cluster topology.
//!
//! Keys are routed by CRC16-XMODEM over the key's hash tag, modulo 16384.
//! The slot map is learned from `CLUSTER NODES` and patched incrementally by
//! `-MOVED` redirects. Redirect parsing and the cluster-nodes text format
//! also live here.

use crate::command::RedisKey;
use crate::core::error::{ServerError, ServerErrorKind};
use parking_lot::RwLock;
use std::sync::Arc;

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC16-XMODEM (polynomial 0x1021, zero initial value).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// The hash slot a key routes to.
pub fn hash_slot(key: &RedisKey) -> u16 {
    crc16(key.routing_tag()) % SLOT_COUNT
}

/// Verify all keys share one slot; the common slot, else the first
/// conflicting pair.
pub fn common_slot<'a, I>(keys: I) -> Result<Option<u16>, (u16, u16)>
where
    I: IntoIterator<Item = &'a RedisKey>,
{
    let mut slot = None;
    for key in keys {
        let this = hash_slot(key);
        match slot {
            None => slot = Some(this),
            Some(first) if first != this => return Err((first, this)),
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// Kind of a cluster redirect reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `-MOVED`: the slot has permanently moved; update the slot map.
    Moved,
    /// `-ASK`: one-shot redirect; precede the retry with `ASKING`.
    Ask,
}

/// A parsed `-MOVED`/`-ASK` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Permanent or transient.
    pub kind: RedirectKind,
    /// The slot being redirected.
    pub slot: u16,
    /// `host:port` of the endpoint that owns the slot.
    pub endpoint: String,
}

impl Redirect {
    /// Parse a redirect out of a server error reply, when it is one.
    pub fn parse(error: &ServerError) -> Option<Self> {
        let kind = match error.kind {
            ServerErrorKind::Moved => RedirectKind::Moved,
            ServerErrorKind::Ask => RedirectKind::Ask,
            _ => return None,
        };
        let mut words = error.message.split_ascii_whitespace();
        let _tag = words.next()?;
        let slot: u16 = words.next()?.parse().ok()?;
        if slot >= SLOT_COUNT {
            return None;
        }
        let endpoint = words.next()?.to_string();
        if !endpoint.contains(':') {
            return None;
        }
        Some(Self {
            kind,
            slot,
            endpoint,
        })
    }
}

/// Slot-to-endpoint table.
///
/// Readers take the address for a slot with one lock acquisition; writers
/// replace single entries (`MOVED`) or rebuild wholesale (reconfiguration).
#[derive(Debug)]
pub struct SlotMap {
    slots: RwLock<Vec<Option<Arc<str>>>>,
}

impl SlotMap {
    /// An empty map: every slot unassigned.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; SLOT_COUNT as usize]),
        }
    }

    /// The endpoint owning `slot`, if known.
    pub fn endpoint_for(&self, slot: u16) -> Option<Arc<str>> {
        self.slots.read().get(slot as usize)?.clone()
    }

    /// Point one slot at an endpoint (from a `-MOVED` reply).
    pub fn assign(&self, slot: u16, endpoint: &str) {
        if let Some(entry) = self.slots.write().get_mut(slot as usize) {
            *entry = Some(Arc::from(endpoint));
        }
    }

    /// Rebuild the whole table from parsed cluster nodes.
    pub fn rebuild(&self, nodes: &[ClusterNode]) {
        let mut fresh = vec![None::<Arc<str>>; SLOT_COUNT as usize];
        for node in nodes {
            if !node.is_primary() {
                continue;
            }
            let addr: Arc<str> = Arc::from(node.addr.as_str());
            for &(lo, hi) in &node.slots {
                for slot in lo..=hi {
                    fresh[slot as usize] = Some(addr.clone());
                }
            }
        }
        *self.slots.write() = fresh;
    }

    /// Forget every assignment.
    pub fn clear(&self) {
        self.slots.write().iter_mut().for_each(|s| *s = None);
    }

    /// How many slots have an owner.
    pub fn assigned(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of `CLUSTER NODES` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// 40-hex-char node id.
    pub id: String,
    /// `host:port` with the cluster bus suffix stripped.
    pub addr: String,
    /// Raw flags (`myself`, `master`, `slave`, `fail`, ...).
    pub flags: Vec<String>,
    /// Primary's node id, for replicas.
    pub primary_id: Option<String>,
    /// Whether the cluster bus link is up.
    pub connected: bool,
    /// Inclusive served slot ranges.
    pub slots: Vec<(u16, u16)>,
}

impl ClusterNode {
    /// Whether this node serves as a primary.
    pub fn is_primary(&self) -> bool {
        self.flags.iter().any(|f| f == "master")
    }

    /// Whether this node is a replica.
    pub fn is_replica(&self) -> bool {
        self.flags.iter().any(|f| f == "slave")
    }

    /// Whether the node is marked failing.
    pub fn is_failing(&self) -> bool {
        self.flags.iter().any(|f| f == "fail" || f == "fail?")
    }

    /// Parse one `CLUSTER NODES` line, `None` for lines that do not parse.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut words = line.split_ascii_whitespace();
        let id = words.next()?.to_string();
        let raw_addr = words.next()?;
        // "127.0.0.1:30001@31001" - strip the cluster bus port.
        let addr = raw_addr.split('@').next()?.to_string();
        if !addr.contains(':') {
            return None;
        }
        let flags: Vec<String> = words.next()?.split(',').map(str::to_string).collect();
        let primary = words.next()?;
        let primary_id = (primary != "-").then(|| primary.to_string());
        let _ping_sent = words.next()?;
        let _pong_recv = words.next()?;
        let _config_epoch = words.next()?;
        let link_state = words.next()?;
        let mut slots = Vec::new();
        for word in words {
            // Migrating/importing markers ("[93->-<id>]") are transient; the
            // ASK path covers them.
            if word.starts_with('[') {
                continue;
            }
            let range = match word.split_once('-') {
                Some((lo, hi)) => (lo.parse().ok()?, hi.parse().ok()?),
                None => {
                    let slot = word.parse().ok()?;
                    (slot, slot)
                }
            };
            if range.0 > range.1 || range.1 >= SLOT_COUNT {
                return None;
            }
            slots.push(range);
        }
        Some(Self {
            id,
            addr,
            flags,
            primary_id,
            connected: link_state == "connected",
            slots,
        })
    }

    /// Parse full `CLUSTER NODES` output, skipping unparseable lines.
    pub fn parse_all(text: &str) -> Vec<Self> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(Self::parse_line)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // The XMODEM check value for "123456789".
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn well_known_slots() {
        assert_eq!(hash_slot(&RedisKey::from("foo")), 12182);
        assert_eq!(hash_slot(&RedisKey::from("bar")), 5061);
        assert_eq!(hash_slot(&RedisKey::from("123456789")), 0x31C3 % SLOT_COUNT);
    }

    #[test]
    fn hash_tag_slots_agree() {
        let a = RedisKey::from("{user1000}.following");
        let b = RedisKey::from("{user1000}.followers");
        assert_eq!(hash_slot(&a), hash_slot(&b));
        assert_eq!(hash_slot(&a), hash_slot(&RedisKey::from("user1000")));
    }

    #[test]
    fn empty_tag_hashes_whole_key() {
        let braces = RedisKey::from("{}x");
        assert_eq!(hash_slot(&braces), crc16(b"{}x") % SLOT_COUNT);
    }

    #[test]
    fn common_slot_detects_conflicts() {
        let keys = [RedisKey::from("{t}a"), RedisKey::from("{t}b")];
        assert!(matches!(common_slot(keys.iter()), Ok(Some(_))));

        let conflicting = [RedisKey::from("foo"), RedisKey::from("bar")];
        let err = common_slot(conflicting.iter()).unwrap_err();
        assert_eq!(err, (12182, 5061));

        let empty: [RedisKey; 0] = [];
        assert_eq!(common_slot(empty.iter()), Ok(None));
    }

    #[test]
    fn parse_moved_and_ask() {
        let moved = ServerError::from_wire("MOVED 16287 10.0.0.2:6380");
        let redirect = Redirect::parse(&moved).unwrap();
        assert_eq!(redirect.kind, RedirectKind::Moved);
        assert_eq!(redirect.slot, 16287);
        assert_eq!(redirect.endpoint, "10.0.0.2:6380");

        let ask = ServerError::from_wire("ASK 42 10.0.0.3:6379");
        let redirect = Redirect::parse(&ask).unwrap();
        assert_eq!(redirect.kind, RedirectKind::Ask);

        let not_redirect = ServerError::from_wire("ERR nope");
        assert!(Redirect::parse(&not_redirect).is_none());

        let bad_slot = ServerError::from_wire("MOVED 20000 10.0.0.2:6380");
        assert!(Redirect::parse(&bad_slot).is_none());
    }

    #[test]
    fn slot_map_assign_and_rebuild() {
        let map = SlotMap::new();
        assert_eq!(map.assigned(), 0);
        assert!(map.endpoint_for(100).is_none());

        map.assign(100, "10.0.0.1:6379");
        assert_eq!(map.endpoint_for(100).as_deref(), Some("10.0.0.1:6379"));
        assert_eq!(map.assigned(), 1);

        let nodes = ClusterNode::parse_all(
            "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460\n\
             67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922\n\
             292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383\n\
             07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected",
        );
        assert_eq!(nodes.len(), 4);
        assert!(nodes[0].is_primary());
        assert!(nodes[3].is_replica());
        assert_eq!(
            nodes[3].primary_id.as_deref(),
            Some("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca")
        );

        map.rebuild(&nodes);
        assert_eq!(map.assigned(), SLOT_COUNT as usize);
        assert_eq!(map.endpoint_for(0).as_deref(), Some("127.0.0.1:30001"));
        assert_eq!(map.endpoint_for(8000).as_deref(), Some("127.0.0.1:30002"));
        assert_eq!(map.endpoint_for(16383).as_deref(), Some("127.0.0.1:30003"));
    }

    #[test]
    fn cluster_node_line_with_migration_marker() {
        let node = ClusterNode::parse_line(
            "a1b2 127.0.0.1:30001@31001 master - 0 0 1 connected 0-10 [93->-somenodeid]",
        )
        .unwrap();
        assert_eq!(node.slots, vec![(0, 10)]);
    }
}
