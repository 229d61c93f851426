//! Braid - multiplexing client core for Redis-compatible servers.
//!
//! Braid funnels many logical callers over a small, fixed set of long-lived
//! TCP (optionally TLS) connections, speaking RESP2 or RESP3. It serves two
//! workloads at once: request/response traffic with strict pipelining, and
//! pub/sub streaming with independent flow control.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Callers                               │
//! │      Database views   │   Subscriber   │   Transactions         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Multiplexer                             │
//! │   endpoint table │ slot map │ heartbeat │ reconfiguration       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Server endpoints                          │
//! │        interactive bridge   │   subscription bridge             │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Connection bridges                         │
//! │   backlog │ write-ready │ in-flight FIFO │ RESP codec │ socket  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Options, option-string parsing, retry policies
//! - [`core::error`] - Error taxonomy and failure detail
//! - [`core::time`] - Monotonic tick clock
//!
//! ## Protocol
//! - [`protocol::buffer`] - Read buffer and token primitives
//! - [`protocol::decode`] - Streaming RESP2/RESP3 frame decoder
//! - [`protocol::encode`] - Command frame encoder
//!
//! ## Commands
//! - [`command::message`] - Message lifecycle, flags, ticks
//! - [`command::processors`] - Typed reply adapters
//!
//! ## Connections
//! - [`bridge`] - Connection state machine, queues, io loops, handshake
//! - [`endpoint`] - Server endpoints and feature detection
//! - [`net`] - TCP establishment and TLS configuration
//!
//! ## Routing & orchestration
//! - [`routing`] - Hash slots, redirects, cluster topology parsing
//! - [`mux`] - Multiplexer, database views, pub/sub, transactions
//!
//! # Key invariants
//!
//! - Per-bridge replies dispatch in exactly the order writes succeeded;
//!   fire-and-forget keeps write order but no reply slot
//! - Every message reaches exactly one of Completed, Failed, or Cancelled
//! - A cancelled in-flight message tombstones its slot; the reply is
//!   consumed, never re-paired
//! - Multi-key commands whose keys span hash slots fail before any I/O

// Core infrastructure
pub mod core;

// Wire protocol
pub mod protocol;

// Command model
pub mod command;

// Slot routing and cluster topology
pub mod routing;

// Socket establishment
pub mod net;

// Connection bridges
pub mod bridge;

// Server endpoints
pub mod endpoint;

// Multiplexer and views
pub mod mux;

// Re-exports for convenience
pub use crate::core::config::{BacklogPolicy, Options, ProtocolChoice, RetryPolicy};
pub use crate::core::error::{
    BraidError, BraidResult, ConnectionFailureKind, ConnectionRole, ServerError, ServerErrorKind,
};
pub use command::{
    CommandId, Message, MessageFlags, RedisKey, RedisValue, ResultProcessor, TypedReply,
};
pub use mux::{
    ChannelMessage, Condition, Database, Multiplexer, Subscriber, SubscriptionToken, Transaction,
    TransactionOutcome,
};
pub use protocol::{RawFrame, RespVersion};
