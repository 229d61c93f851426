//! Optimistic transactions: conditions, `WATCH`, `MULTI`/`EXEC`.
//!
//! A transaction is a body of commands guarded by read conditions. The plan:
//! watch every conditioned key, run the condition reads, and only enter
//! `MULTI`/`EXEC` when every predicate held. A nil `EXEC` (watched key
//! changed server-side) yields `executed = false`, not an error. Every
//! command of one transaction maps to a single endpoint; cross-slot bodies
//! fail locally before any I/O.

use crate::command::processors::{self, Processed};
use crate::command::{
    CommandId, Message, MessageFlags, RedisKey, RedisValue, ResultProcessor, TypedReply,
};
use crate::core::error::{
    BraidError, BraidResult, ServerErrorKind, TransactionAbortReason,
};
use crate::mux::MultiplexerInner;
use crate::protocol::RawFrame;
use bytes::Bytes;
use std::sync::Arc;

/// A read check guarding a transaction.
#[derive(Debug, Clone)]
pub enum Condition {
    /// The key exists.
    KeyExists(RedisKey),
    /// The key does not exist.
    KeyNotExists(RedisKey),
    /// A hash field exists.
    HashFieldExists(RedisKey, Bytes),
    /// A hash field does not exist.
    HashFieldNotExists(RedisKey, Bytes),
    /// The string value equals the given bytes.
    StringEqual(RedisKey, Bytes),
    /// The string value differs from the given bytes (or is absent).
    StringNotEqual(RedisKey, Bytes),
    /// The hash holds exactly this many fields.
    HashLengthEqual(RedisKey, i64),
    /// The list has an element at this index.
    ListIndexExists(RedisKey, i64),
    /// The member's sorted-set score equals the given value.
    SortedSetScoreEqual(RedisKey, Bytes, f64),
    /// `ZCOUNT min max` equals the given count.
    SortedSetCountEqual(RedisKey, f64, f64, i64),
    /// At least one member starts with the given prefix (`ZRANGEBYLEX`).
    SortedSetContainsPrefix(RedisKey, Bytes),
}

impl Condition {
    /// The keys this condition watches.
    pub fn keys(&self) -> Vec<&RedisKey> {
        match self {
            Self::KeyExists(k)
            | Self::KeyNotExists(k)
            | Self::HashFieldExists(k, _)
            | Self::HashFieldNotExists(k, _)
            | Self::StringEqual(k, _)
            | Self::StringNotEqual(k, _)
            | Self::HashLengthEqual(k, _)
            | Self::ListIndexExists(k, _)
            | Self::SortedSetScoreEqual(k, _, _)
            | Self::SortedSetCountEqual(k, _, _, _)
            | Self::SortedSetContainsPrefix(k, _) => vec![k],
        }
    }

    /// The read command that samples this condition's state.
    fn read_op(&self) -> (CommandId, RedisKey, Vec<RedisValue>, ResultProcessor) {
        match self {
            Self::KeyExists(k) | Self::KeyNotExists(k) => (
                CommandId::Exists,
                k.clone(),
                Vec::new(),
                ResultProcessor::Integer,
            ),
            Self::HashFieldExists(k, f) | Self::HashFieldNotExists(k, f) => (
                CommandId::HExists,
                k.clone(),
                vec![RedisValue::Bytes(f.clone())],
                ResultProcessor::ZeroOne,
            ),
            Self::StringEqual(k, _) | Self::StringNotEqual(k, _) => (
                CommandId::Get,
                k.clone(),
                Vec::new(),
                ResultProcessor::BytesNullable,
            ),
            Self::HashLengthEqual(k, _) => (
                CommandId::HLen,
                k.clone(),
                Vec::new(),
                ResultProcessor::Integer,
            ),
            Self::ListIndexExists(k, index) => (
                CommandId::LIndex,
                k.clone(),
                vec![RedisValue::Integer(*index)],
                ResultProcessor::BytesNullable,
            ),
            Self::SortedSetScoreEqual(k, member, _) => (
                CommandId::ZScore,
                k.clone(),
                vec![RedisValue::Bytes(member.clone())],
                ResultProcessor::BytesNullable,
            ),
            Self::SortedSetCountEqual(k, min, max, _) => (
                CommandId::ZCount,
                k.clone(),
                vec![RedisValue::Double(*min), RedisValue::Double(*max)],
                ResultProcessor::Integer,
            ),
            Self::SortedSetContainsPrefix(k, prefix) => {
                let mut lo = Vec::with_capacity(prefix.len() + 1);
                lo.push(b'[');
                lo.extend_from_slice(prefix);
                (
                    CommandId::ZRangeByLex,
                    k.clone(),
                    vec![
                        RedisValue::Bytes(Bytes::from(lo)),
                        RedisValue::Literal("+"),
                        RedisValue::Literal("LIMIT"),
                        RedisValue::Integer(0),
                        RedisValue::Integer(1),
                    ],
                    ResultProcessor::BulkArray,
                )
            }
        }
    }

    /// Evaluate the predicate against the sampled reply.
    fn evaluate(&self, reply: &TypedReply) -> bool {
        match self {
            Self::KeyExists(_) => reply.as_int().map(|n| n > 0).unwrap_or(false),
            Self::KeyNotExists(_) => reply.as_int().map(|n| n == 0).unwrap_or(false),
            Self::HashFieldExists(_, _) => reply.as_bool().unwrap_or(false),
            Self::HashFieldNotExists(_, _) => !reply.as_bool().unwrap_or(true),
            Self::StringEqual(_, expected) => match reply {
                TypedReply::Bytes(Some(actual)) => actual == expected,
                _ => false,
            },
            Self::StringNotEqual(_, expected) => match reply {
                TypedReply::Bytes(Some(actual)) => actual != expected,
                TypedReply::Bytes(None) => true,
                _ => false,
            },
            Self::HashLengthEqual(_, expected) => {
                reply.as_int().map(|n| n == *expected).unwrap_or(false)
            }
            Self::ListIndexExists(_, _) => {
                matches!(reply, TypedReply::Bytes(Some(_)))
            }
            Self::SortedSetScoreEqual(_, _, expected) => match reply {
                TypedReply::Bytes(Some(raw)) => std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|score| score == *expected)
                    .unwrap_or(false),
                _ => false,
            },
            Self::SortedSetCountEqual(_, _, _, expected) => {
                reply.as_int().map(|n| n == *expected).unwrap_or(false)
            }
            Self::SortedSetContainsPrefix(_, prefix) => match reply {
                TypedReply::BulkArray(items) => items
                    .first()
                    .and_then(|i| i.as_ref())
                    .map(|member| member.starts_with(prefix))
                    .unwrap_or(false),
                _ => false,
            },
        }
    }
}

/// A condition plus what the sampled state said about it.
#[derive(Debug, Clone)]
pub struct ConditionResult {
    /// The condition as declared.
    pub condition: Condition,
    satisfied: Option<bool>,
}

impl ConditionResult {
    /// Whether the sampled state satisfied the condition; `None` when it
    /// was never evaluated (an earlier step failed).
    pub fn was_satisfied(&self) -> Option<bool> {
        self.satisfied
    }
}

/// One body command of a transaction.
#[derive(Debug, Clone)]
pub struct TransactionOp {
    /// Command identity.
    pub command: CommandId,
    /// The key, if the command takes one.
    pub key: Option<RedisKey>,
    /// Positional arguments after the key.
    pub args: Vec<RedisValue>,
    /// Processor applied to this command's slot of the `EXEC` reply.
    pub processor: ResultProcessor,
}

/// A transaction: conditions plus a body.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    conditions: Vec<Condition>,
    ops: Vec<TransactionOp>,
}

impl Transaction {
    /// An empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard the body with a condition.
    pub fn add_condition(&mut self, condition: Condition) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    /// Append a body command.
    pub fn add_op(
        &mut self,
        command: CommandId,
        key: Option<RedisKey>,
        args: Vec<RedisValue>,
        processor: ResultProcessor,
    ) -> &mut Self {
        self.ops.push(TransactionOp {
            command,
            key,
            args,
            processor,
        });
        self
    }

    /// Declared conditions.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Body commands.
    pub fn ops(&self) -> &[TransactionOp] {
        &self.ops
    }

    /// Every key the transaction touches.
    pub fn all_keys(&self) -> Vec<&RedisKey> {
        let mut keys: Vec<&RedisKey> = Vec::new();
        for condition in &self.conditions {
            keys.extend(condition.keys());
        }
        for op in &self.ops {
            if let Some(key) = &op.key {
                keys.push(key);
            }
        }
        keys
    }
}

/// What a transaction attempt produced.
#[derive(Debug)]
pub struct TransactionOutcome {
    /// Whether `EXEC` ran the body. False when a condition failed locally
    /// or the watched set changed server-side.
    pub executed: bool,
    /// Per-condition verdicts.
    pub conditions: Vec<ConditionResult>,
    /// Per-body-command results, present only when executed.
    pub results: Vec<BraidResult<TypedReply>>,
}

/// Execute a transaction against one endpoint.
pub(crate) async fn execute(
    inner: &Arc<MultiplexerInner>,
    db: i32,
    tx: Transaction,
) -> BraidResult<TransactionOutcome> {
    // Locality check before any I/O.
    if let Err((first, second)) = crate::routing::common_slot(tx.all_keys().into_iter()) {
        if inner.is_cluster() {
            return Err(BraidError::CrossSlot { first, second });
        }
    }

    let endpoint = tx
        .all_keys()
        .first()
        .and_then(|key| inner.endpoint_for_key(key))
        .or_else(|| inner.primary_endpoint())
        .ok_or(BraidError::ConnectionUnavailable {
            detail: Default::default(),
        })?;
    let bridge = endpoint.bridge(crate::core::error::ConnectionRole::Interactive);
    let clock = inner.clock();
    let flags = MessageFlags::NO_REDIRECT;
    let await_timeout = inner.options().async_timeout();
    let include_detail = inner.options().include_detail_in_exceptions;

    let mut condition_results: Vec<ConditionResult> = tx
        .conditions()
        .iter()
        .map(|c| ConditionResult {
            condition: c.clone(),
            satisfied: None,
        })
        .collect();

    // 1. WATCH every conditioned key.
    let watched: Vec<&RedisKey> = tx
        .conditions()
        .iter()
        .flat_map(|c| c.keys())
        .collect();
    if !watched.is_empty() {
        let args: Vec<RedisValue> = watched
            .iter()
            .map(|k| RedisValue::Bytes(k.to_bytes()))
            .collect();
        let (watch, ticket) = Message::new(
            clock,
            CommandId::Watch,
            None,
            args,
            ResultProcessor::OkStatus,
            flags,
        );
        inner.submit_to(&endpoint, watch.with_db(db)).await;
        abort_on_redirect(ticket.await_reply_within(await_timeout, include_detail).await)?;
    }

    // 2. Sample every condition, pipelined.
    let mut tickets = Vec::with_capacity(tx.conditions().len());
    for condition in tx.conditions() {
        let (command, key, args, processor) = condition.read_op();
        let (message, ticket) = Message::new(clock, command, Some(key), args, processor, flags);
        inner.submit_to(&endpoint, message.with_db(db)).await;
        tickets.push(ticket);
    }
    let mut all_satisfied = true;
    for (result, ticket) in condition_results.iter_mut().zip(tickets) {
        let reply =
            abort_on_redirect(ticket.await_reply_within(await_timeout, include_detail).await)?;
        let ok = result.condition.evaluate(&reply);
        result.satisfied = Some(ok);
        all_satisfied &= ok;
    }

    // 3. Conditions failed: release the watch and report.
    if !all_satisfied {
        if !watched.is_empty() {
            let (unwatch, ticket) = Message::new(
                clock,
                CommandId::Unwatch,
                None,
                Vec::new(),
                ResultProcessor::OkStatus,
                flags,
            );
            inner.submit_to(&endpoint, unwatch.with_db(db)).await;
            let _ = ticket.await_reply_within(await_timeout, include_detail).await;
        }
        return Ok(TransactionOutcome {
            executed: false,
            conditions: condition_results,
            results: Vec::new(),
        });
    }

    // 4. MULTI, body, EXEC as one uninterleaved batch.
    let (multi, multi_ticket) = Message::new(
        clock,
        CommandId::Multi,
        None,
        Vec::new(),
        ResultProcessor::OkStatus,
        flags,
    );
    let mut batch = vec![multi.with_db(db)];
    let mut body_tickets = Vec::with_capacity(tx.ops().len());
    for op in tx.ops() {
        let (message, ticket) = Message::new(
            clock,
            op.command,
            op.key.clone(),
            op.args.clone(),
            ResultProcessor::QueuedStatus,
            flags,
        );
        batch.push(message.with_db(db));
        body_tickets.push(ticket);
    }
    let (exec, exec_ticket) = Message::new(
        clock,
        CommandId::Exec,
        None,
        Vec::new(),
        ResultProcessor::Raw,
        flags,
    );
    batch.push(exec.with_db(db));
    // The batch is written contiguously; prepend the SELECT here rather
    // than letting per-message dispatch split it.
    if db >= 0 && i64::from(db) != bridge.last_selected_db() {
        let (select, _ticket) = Message::new(
            clock,
            CommandId::Select,
            None,
            vec![RedisValue::Integer(i64::from(db))],
            ResultProcessor::OkStatus,
            MessageFlags::empty(),
        );
        bridge.set_last_selected_db(i64::from(db));
        batch.insert(0, select.with_db(db));
    }
    bridge.submit_batch(batch).await;

    abort_on_redirect(
        multi_ticket
            .await_reply_within(await_timeout, include_detail)
            .await,
    )?;
    let mut queue_rejected = false;
    for ticket in body_tickets {
        if ticket
            .await_reply_within(await_timeout, include_detail)
            .await
            .is_err()
        {
            queue_rejected = true;
        }
    }

    let exec_reply = exec_ticket
        .await_reply_within(await_timeout, include_detail)
        .await;
    let frame = match exec_reply {
        Ok(reply) => reply.into_raw().ok_or(BraidError::UnexpectedReply {
            command: "EXEC",
            expected: "array or nil",
            got: "other",
        })?,
        Err(BraidError::ExecAborted) => {
            return Err(BraidError::TransactionAborted {
                reason: TransactionAbortReason::QueueRejected,
            })
        }
        Err(other) => return Err(other),
    };
    if queue_rejected {
        return Err(BraidError::TransactionAborted {
            reason: TransactionAbortReason::QueueRejected,
        });
    }

    match frame {
        // Nil EXEC: the watched set changed server-side.
        RawFrame::Null => Ok(TransactionOutcome {
            executed: false,
            conditions: condition_results,
            results: Vec::new(),
        }),
        RawFrame::Array(items) => {
            let mut results = Vec::with_capacity(items.len());
            for (op, item) in tx.ops().iter().zip(items) {
                let result = match processors::process(op.processor, op.command, item) {
                    Processed::Completed(reply) => Ok(reply),
                    Processed::Failed(err) => Err(err),
                    Processed::NeedRedirect { error, .. } | Processed::NeedRetry { error } => {
                        Err(BraidError::Server { error })
                    }
                };
                results.push(result);
            }
            Ok(TransactionOutcome {
                executed: true,
                conditions: condition_results,
                results,
            })
        }
        other => Err(BraidError::UnexpectedReply {
            command: "EXEC",
            expected: "array or nil",
            got: other.kind_name(),
        }),
    }
}

/// Map a redirect observed mid-transaction to the abort error.
fn abort_on_redirect(result: BraidResult<TypedReply>) -> BraidResult<TypedReply> {
    match result {
        Err(BraidError::Server { error })
            if matches!(error.kind, ServerErrorKind::Moved | ServerErrorKind::Ask) =>
        {
            Err(BraidError::TransactionAborted {
                reason: TransactionAbortReason::Redirected,
            })
        }
        other => other,
    }
}
