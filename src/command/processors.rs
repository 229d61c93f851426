//! Result processors: typed adapters from reply frames to caller values.
//!
//! Processors are a closed set of tagged variants. Each takes the raw reply
//! frame and either completes with a [`TypedReply`], asks for a redirect or
//! retry, or fails. Error replies are classified once here so redirect and
//! retry policy is uniform across all processors.

use crate::command::CommandId;
use crate::core::error::{BraidError, ServerError, ServerErrorKind};
use crate::protocol::RawFrame;
use crate::routing::{ClusterNode, Redirect};
use bytes::Bytes;

/// One entry of a stream range reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// The entry id (`1526919030474-55`).
    pub id: String,
    /// Field/value pairs in server order.
    pub fields: Vec<(Bytes, Bytes)>,
}

/// Parsed `CLIENT INFO` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientInfo {
    /// `key=value` fields in server order.
    pub fields: Vec<(String, String)>,
}

impl ClientInfo {
    /// Parse the single-line `key=value key=value` format.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .split_ascii_whitespace()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Self { fields }
    }

    /// Look up a field by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A typed, caller-visible reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedReply {
    /// No payload (statuses the caller ignores).
    Void,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Double, `nan` and infinities included.
    Double(f64),
    /// Nullable byte sequence.
    Bytes(Option<Bytes>),
    /// Simple status line.
    Simple(String),
    /// Array of nullable bulk strings.
    BulkArray(Vec<Option<Bytes>>),
    /// Field/value pairs, from flat arrays or RESP3 maps.
    Pairs(Vec<(Bytes, Bytes)>),
    /// Sorted-set members with scores.
    Scored(Vec<(Bytes, f64)>),
    /// Geo positions; `None` for missing members.
    Geo(Vec<Option<(f64, f64)>>),
    /// Stream entries.
    Stream(Vec<StreamEntry>),
    /// Parsed cluster topology.
    ClusterNodes(Vec<ClusterNode>),
    /// Parsed `CLIENT INFO`.
    ClientInfo(ClientInfo),
    /// The frame as decoded, untouched.
    Raw(RawFrame),
}

impl TypedReply {
    /// Boolean content, when the reply is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Integer content, when the reply is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Byte content, when the reply is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// The raw frame, when carried through unprocessed.
    pub fn into_raw(self) -> Option<RawFrame> {
        match self {
            Self::Raw(frame) => Some(frame),
            _ => None,
        }
    }
}

/// The closed set of typed adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultProcessor {
    /// Accept anything, discard the payload.
    Void,
    /// `+OK` → true.
    OkStatus,
    /// `:0`/`:1` → bool.
    ZeroOne,
    /// Signed 64-bit integer.
    Integer,
    /// Double from RESP3 double or bulk text.
    Double,
    /// Nullable byte sequence.
    BytesNullable,
    /// Simple status line, verbatim.
    SimpleString,
    /// Array of nullable bulk strings.
    BulkArray,
    /// Field/value pairs from a flat array or RESP3 map.
    PairMap,
    /// Members with scores (`WITHSCORES` shapes).
    ScoredEntries,
    /// Geo position triples.
    GeoPositions,
    /// Stream range entries.
    StreamEntries,
    /// `CLUSTER NODES` text.
    ClusterNodesText,
    /// `CLIENT INFO` text.
    ClientInfoText,
    /// `+QUEUED` inside a `MULTI` block.
    QueuedStatus,
    /// Pass the raw frame through.
    Raw,
}

/// Outcome of processing one reply frame.
#[derive(Debug)]
pub enum Processed {
    /// The command completed; deliver the value.
    Completed(TypedReply),
    /// The server redirected the command.
    NeedRedirect {
        /// Parsed redirect target.
        redirect: Redirect,
        /// The original error, for when redirects are disabled or exhausted.
        error: ServerError,
    },
    /// A transient server condition; retry after policy allows.
    NeedRetry {
        /// The error that asked for the retry.
        error: ServerError,
    },
    /// The command failed; deliver the error.
    Failed(BraidError),
}

/// Run a processor over a reply frame.
pub fn process(processor: ResultProcessor, command: CommandId, frame: RawFrame) -> Processed {
    // Error replies get uniform classification before any typing.
    if let RawFrame::Error(line) = &frame {
        let error = ServerError::from_wire(line.clone());
        match error.kind {
            ServerErrorKind::Moved | ServerErrorKind::Ask => {
                return match Redirect::parse(&error) {
                    Some(redirect) => Processed::NeedRedirect { redirect, error },
                    None => Processed::Failed(BraidError::Server { error }),
                };
            }
            ServerErrorKind::Loading
            | ServerErrorKind::TryAgain
            | ServerErrorKind::ClusterDown
            | ServerErrorKind::NoScript => {
                return Processed::NeedRetry { error };
            }
            ServerErrorKind::ExecAbort => {
                return Processed::Failed(BraidError::ExecAborted);
            }
            _ => return Processed::Failed(BraidError::Server { error }),
        }
    }

    let mismatch = |expected: &'static str, frame: &RawFrame| {
        Processed::Failed(BraidError::UnexpectedReply {
            command: command.name(),
            expected,
            got: frame.kind_name(),
        })
    };

    match processor {
        ResultProcessor::Void => Processed::Completed(TypedReply::Void),
        ResultProcessor::Raw => Processed::Completed(TypedReply::Raw(frame)),
        ResultProcessor::OkStatus => match &frame {
            RawFrame::Simple(s) if s == "OK" => Processed::Completed(TypedReply::Bool(true)),
            RawFrame::Null => Processed::Completed(TypedReply::Bool(false)),
            other => mismatch("+OK", other),
        },
        ResultProcessor::QueuedStatus => match &frame {
            RawFrame::Simple(s) if s == "QUEUED" => Processed::Completed(TypedReply::Bool(true)),
            other => mismatch("+QUEUED", other),
        },
        ResultProcessor::ZeroOne => match frame.as_int() {
            Some(0) => Processed::Completed(TypedReply::Bool(false)),
            Some(1) => Processed::Completed(TypedReply::Bool(true)),
            _ => mismatch("0 or 1", &frame),
        },
        ResultProcessor::Integer => match frame.as_int() {
            Some(n) => Processed::Completed(TypedReply::Integer(n)),
            None if frame.is_null() => Processed::Completed(TypedReply::Integer(0)),
            None => mismatch("integer", &frame),
        },
        ResultProcessor::Double => match frame.as_double() {
            Some(d) => Processed::Completed(TypedReply::Double(d)),
            None => mismatch("double", &frame),
        },
        ResultProcessor::BytesNullable => match frame {
            RawFrame::Null => Processed::Completed(TypedReply::Bytes(None)),
            RawFrame::Bulk(b) => Processed::Completed(TypedReply::Bytes(Some(b))),
            RawFrame::Simple(s) => {
                Processed::Completed(TypedReply::Bytes(Some(Bytes::from(s))))
            }
            RawFrame::Verbatim { data, .. } => {
                Processed::Completed(TypedReply::Bytes(Some(data)))
            }
            RawFrame::Integer(n) => {
                Processed::Completed(TypedReply::Bytes(Some(Bytes::from(n.to_string()))))
            }
            other => mismatch("bulk string", &other),
        },
        ResultProcessor::SimpleString => match frame {
            RawFrame::Simple(s) => Processed::Completed(TypedReply::Simple(s)),
            RawFrame::Bulk(b) => Processed::Completed(TypedReply::Simple(
                String::from_utf8_lossy(&b).into_owned(),
            )),
            other => mismatch("status line", &other),
        },
        ResultProcessor::BulkArray => match frame {
            RawFrame::Null => Processed::Completed(TypedReply::BulkArray(Vec::new())),
            RawFrame::Array(items) | RawFrame::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        RawFrame::Null => out.push(None),
                        RawFrame::Bulk(b) => out.push(Some(b)),
                        RawFrame::Simple(s) => out.push(Some(Bytes::from(s))),
                        RawFrame::Integer(n) => out.push(Some(Bytes::from(n.to_string()))),
                        other => return mismatch("array of bulk strings", &other),
                    }
                }
                Processed::Completed(TypedReply::BulkArray(out))
            }
            other => mismatch("array", &other),
        },
        ResultProcessor::PairMap => match frame.into_pairs() {
            Some(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match bytes_of(k) {
                        Some(b) => b,
                        None => return mismatch("map of bulk strings", &RawFrame::Null),
                    };
                    let value = match bytes_of(v) {
                        Some(b) => b,
                        None => Bytes::new(),
                    };
                    out.push((key, value));
                }
                Processed::Completed(TypedReply::Pairs(out))
            }
            None => mismatch("map or even array", &RawFrame::Null),
        },
        ResultProcessor::ScoredEntries => process_scored(command, frame),
        ResultProcessor::GeoPositions => process_geo(command, frame),
        ResultProcessor::StreamEntries => process_stream(command, frame),
        ResultProcessor::ClusterNodesText => match frame.as_str() {
            Some(text) => {
                Processed::Completed(TypedReply::ClusterNodes(ClusterNode::parse_all(text)))
            }
            None => mismatch("bulk text", &frame),
        },
        ResultProcessor::ClientInfoText => match frame.as_str() {
            Some(text) => Processed::Completed(TypedReply::ClientInfo(ClientInfo::parse(text))),
            None => mismatch("bulk text", &frame),
        },
    }
}

fn bytes_of(frame: RawFrame) -> Option<Bytes> {
    match frame {
        RawFrame::Bulk(b) => Some(b),
        RawFrame::Simple(s) => Some(Bytes::from(s)),
        RawFrame::Integer(n) => Some(Bytes::from(n.to_string())),
        RawFrame::Double(d) => Some(Bytes::from(format!("{}", d))),
        RawFrame::BigNumber(s) => Some(Bytes::from(s)),
        _ => None,
    }
}

fn double_of(frame: &RawFrame) -> Option<f64> {
    frame.as_double()
}

/// `WITHSCORES` shapes: RESP2 flat `[member, score, ...]`, or an array of
/// `[member, score]` pairs.
fn process_scored(command: CommandId, frame: RawFrame) -> Processed {
    let mismatch = |got: &RawFrame| {
        Processed::Failed(BraidError::UnexpectedReply {
            command: command.name(),
            expected: "members with scores",
            got: got.kind_name(),
        })
    };
    let items = match frame {
        RawFrame::Null => return Processed::Completed(TypedReply::Scored(Vec::new())),
        RawFrame::Array(items) => items,
        other => return mismatch(&other),
    };
    let mut out = Vec::with_capacity(items.len() / 2 + 1);
    let paired = items
        .first()
        .map(|f| matches!(f, RawFrame::Array(inner) if inner.len() == 2))
        .unwrap_or(false);
    if paired {
        for item in items {
            let RawFrame::Array(mut pair) = item else {
                return mismatch(&item);
            };
            let (Some(score_frame), Some(member_frame), true) =
                (pair.pop(), pair.pop(), pair.is_empty())
            else {
                return mismatch(&RawFrame::Array(pair));
            };
            let (Some(member), Some(score)) =
                (bytes_of(member_frame), double_of(&score_frame))
            else {
                return mismatch(&score_frame);
            };
            out.push((member, score));
        }
    } else {
        if items.len() % 2 != 0 {
            return mismatch(&RawFrame::Array(items));
        }
        let mut iter = items.into_iter();
        while let (Some(member_frame), Some(score_frame)) = (iter.next(), iter.next()) {
            let (Some(member), Some(score)) =
                (bytes_of(member_frame), double_of(&score_frame))
            else {
                return mismatch(&RawFrame::Null);
            };
            out.push((member, score));
        }
    }
    Processed::Completed(TypedReply::Scored(out))
}

/// `GEOPOS` shape: array of nil or `[longitude, latitude]`.
fn process_geo(command: CommandId, frame: RawFrame) -> Processed {
    let mismatch = |got: &RawFrame| {
        Processed::Failed(BraidError::UnexpectedReply {
            command: command.name(),
            expected: "geo positions",
            got: got.kind_name(),
        })
    };
    let items = match frame {
        RawFrame::Null => return Processed::Completed(TypedReply::Geo(Vec::new())),
        RawFrame::Array(items) => items,
        other => return mismatch(&other),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RawFrame::Null => out.push(None),
            RawFrame::Array(coords) if coords.len() >= 2 => {
                let (Some(lon), Some(lat)) = (double_of(&coords[0]), double_of(&coords[1]))
                else {
                    return mismatch(&RawFrame::Array(coords));
                };
                out.push(Some((lon, lat)));
            }
            other => return mismatch(&other),
        }
    }
    Processed::Completed(TypedReply::Geo(out))
}

/// `XRANGE` shape: array of `[id, [field, value, ...]]`.
fn process_stream(command: CommandId, frame: RawFrame) -> Processed {
    let mismatch = |got: &RawFrame| {
        Processed::Failed(BraidError::UnexpectedReply {
            command: command.name(),
            expected: "stream entries",
            got: got.kind_name(),
        })
    };
    let items = match frame {
        RawFrame::Null => return Processed::Completed(TypedReply::Stream(Vec::new())),
        RawFrame::Array(items) => items,
        other => return mismatch(&other),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let RawFrame::Array(mut entry) = item else {
            return mismatch(&item);
        };
        let (Some(fields_frame), Some(id_frame), true) =
            (entry.pop(), entry.pop(), entry.is_empty())
        else {
            return mismatch(&RawFrame::Array(entry));
        };
        let Some(id) = id_frame.as_str().map(str::to_string) else {
            return mismatch(&id_frame);
        };
        let Some(pairs) = fields_frame.into_pairs() else {
            return mismatch(&RawFrame::Null);
        };
        let mut fields = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            let (Some(key), Some(value)) = (bytes_of(k), bytes_of(v)) else {
                return mismatch(&RawFrame::Null);
            };
            fields.push((key, value));
        }
        out.push(StreamEntry { id, fields });
    }
    Processed::Completed(TypedReply::Stream(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(processor: ResultProcessor, frame: RawFrame) -> Processed {
        process(processor, CommandId::Get, frame)
    }

    #[test]
    fn ok_status() {
        let Processed::Completed(TypedReply::Bool(true)) =
            run(ResultProcessor::OkStatus, RawFrame::Simple("OK".into()))
        else {
            panic!("expected true");
        };
    }

    #[test]
    fn zero_one() {
        assert!(matches!(
            run(ResultProcessor::ZeroOne, RawFrame::Integer(1)),
            Processed::Completed(TypedReply::Bool(true))
        ));
        assert!(matches!(
            run(ResultProcessor::ZeroOne, RawFrame::Integer(0)),
            Processed::Completed(TypedReply::Bool(false))
        ));
        assert!(matches!(
            run(ResultProcessor::ZeroOne, RawFrame::Integer(2)),
            Processed::Failed(BraidError::UnexpectedReply { .. })
        ));
    }

    #[test]
    fn double_special_values() {
        assert!(matches!(
            run(ResultProcessor::Double, RawFrame::Double(f64::INFINITY)),
            Processed::Completed(TypedReply::Double(d)) if d == f64::INFINITY
        ));
        assert!(matches!(
            run(ResultProcessor::Double, RawFrame::Bulk(Bytes::from_static(b"-inf"))),
            Processed::Completed(TypedReply::Double(d)) if d == f64::NEG_INFINITY
        ));
        assert!(matches!(
            run(ResultProcessor::Double, RawFrame::Bulk(Bytes::from_static(b"nan"))),
            Processed::Completed(TypedReply::Double(d)) if d.is_nan()
        ));
    }

    #[test]
    fn bytes_nullable_distinguishes_null_and_empty() {
        assert!(matches!(
            run(ResultProcessor::BytesNullable, RawFrame::Null),
            Processed::Completed(TypedReply::Bytes(None))
        ));
        assert!(matches!(
            run(ResultProcessor::BytesNullable, RawFrame::Bulk(Bytes::new())),
            Processed::Completed(TypedReply::Bytes(Some(b))) if b.is_empty()
        ));
    }

    #[test]
    fn pair_map_from_flat_array_and_map() {
        let flat = RawFrame::Array(vec![
            RawFrame::Bulk(Bytes::from_static(b"f1")),
            RawFrame::Bulk(Bytes::from_static(b"v1")),
        ]);
        let Processed::Completed(TypedReply::Pairs(pairs)) =
            run(ResultProcessor::PairMap, flat)
        else {
            panic!("expected pairs");
        };
        assert_eq!(pairs[0].0.as_ref(), b"f1");

        let map = RawFrame::Map(vec![(
            RawFrame::Bulk(Bytes::from_static(b"f2")),
            RawFrame::Bulk(Bytes::from_static(b"v2")),
        )]);
        let Processed::Completed(TypedReply::Pairs(pairs)) = run(ResultProcessor::PairMap, map)
        else {
            panic!("expected pairs");
        };
        assert_eq!(pairs[0].1.as_ref(), b"v2");
    }

    #[test]
    fn scored_flat_and_paired() {
        let flat = RawFrame::Array(vec![
            RawFrame::Bulk(Bytes::from_static(b"a")),
            RawFrame::Bulk(Bytes::from_static(b"1.5")),
            RawFrame::Bulk(Bytes::from_static(b"b")),
            RawFrame::Bulk(Bytes::from_static(b"2")),
        ]);
        let Processed::Completed(TypedReply::Scored(scored)) =
            run(ResultProcessor::ScoredEntries, flat)
        else {
            panic!("expected scored");
        };
        assert_eq!(scored.len(), 2);
        assert_eq!(scored[0].1, 1.5);

        let paired = RawFrame::Array(vec![RawFrame::Array(vec![
            RawFrame::Bulk(Bytes::from_static(b"a")),
            RawFrame::Double(3.0),
        ])]);
        let Processed::Completed(TypedReply::Scored(scored)) =
            run(ResultProcessor::ScoredEntries, paired)
        else {
            panic!("expected scored");
        };
        assert_eq!(scored[0].1, 3.0);
    }

    #[test]
    fn geo_positions_with_missing_member() {
        let frame = RawFrame::Array(vec![
            RawFrame::Array(vec![
                RawFrame::Bulk(Bytes::from_static(b"13.361389338970184")),
                RawFrame::Bulk(Bytes::from_static(b"38.115556395496299")),
            ]),
            RawFrame::Null,
        ]);
        let Processed::Completed(TypedReply::Geo(positions)) =
            run(ResultProcessor::GeoPositions, frame)
        else {
            panic!("expected geo");
        };
        assert_eq!(positions.len(), 2);
        assert!(positions[0].is_some());
        assert!(positions[1].is_none());
    }

    #[test]
    fn stream_entries() {
        let frame = RawFrame::Array(vec![RawFrame::Array(vec![
            RawFrame::Bulk(Bytes::from_static(b"1526919030474-55")),
            RawFrame::Array(vec![
                RawFrame::Bulk(Bytes::from_static(b"temperature")),
                RawFrame::Bulk(Bytes::from_static(b"18.2")),
            ]),
        ])]);
        let Processed::Completed(TypedReply::Stream(entries)) =
            run(ResultProcessor::StreamEntries, frame)
        else {
            panic!("expected stream");
        };
        assert_eq!(entries[0].id, "1526919030474-55");
        assert_eq!(entries[0].fields[0].0.as_ref(), b"temperature");
    }

    #[test]
    fn cluster_nodes_text() {
        let text = "e7d1ee 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-16383\n";
        let Processed::Completed(TypedReply::ClusterNodes(nodes)) = run(
            ResultProcessor::ClusterNodesText,
            RawFrame::Bulk(Bytes::copy_from_slice(text.as_bytes())),
        ) else {
            panic!("expected nodes");
        };
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_primary());
    }

    #[test]
    fn client_info_text() {
        let info = ClientInfo::parse("id=3 addr=127.0.0.1:64320 name=braid db=2");
        assert_eq!(info.get("id"), Some("3"));
        assert_eq!(info.get("db"), Some("2"));
        assert_eq!(info.get("missing"), None);
    }

    #[test]
    fn error_classification_drives_outcome() {
        assert!(matches!(
            run(ResultProcessor::Void, RawFrame::Error("MOVED 7 1.2.3.4:7000".into())),
            Processed::NeedRedirect { .. }
        ));
        assert!(matches!(
            run(ResultProcessor::Void, RawFrame::Error("LOADING loading".into())),
            Processed::NeedRetry { .. }
        ));
        assert!(matches!(
            run(ResultProcessor::Void, RawFrame::Error("NOSCRIPT missing".into())),
            Processed::NeedRetry { .. }
        ));
        assert!(matches!(
            run(
                ResultProcessor::Void,
                RawFrame::Error("EXECABORT Transaction discarded".into())
            ),
            Processed::Failed(BraidError::ExecAborted)
        ));
        assert!(matches!(
            run(ResultProcessor::Void, RawFrame::Error("ERR plain".into())),
            Processed::Failed(BraidError::Server { .. })
        ));
    }
}
