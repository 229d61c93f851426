//! Database views: lightweight handles bound to a database index.
//!
//! A view carries no connection state of its own; every operation funnels
//! through the multiplexer's `dispatch`, which inserts `SELECT` whenever the
//! bound index differs from the bridge's last selected one.

use crate::command::{
    CommandId, Message, MessageFlags, RedisKey, RedisValue, ResultProcessor, TypedReply,
};
use crate::core::error::{BraidError, BraidResult};
use crate::mux::transaction::{self, Transaction, TransactionOutcome};
use crate::mux::MultiplexerInner;
use bytes::Bytes;
use std::sync::Arc;

/// A view over one logical database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<MultiplexerInner>,
    index: u32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("index", &self.index).finish()
    }
}

impl Database {
    pub(crate) fn new(inner: Arc<MultiplexerInner>, index: u32) -> Self {
        Self { inner, index }
    }

    /// The bound database index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Execute a command against this database with the default
    /// (`asyncTimeout`) deadline.
    pub async fn execute(
        &self,
        command: CommandId,
        key: Option<RedisKey>,
        args: Vec<RedisValue>,
        processor: ResultProcessor,
        flags: MessageFlags,
    ) -> BraidResult<TypedReply> {
        self.execute_with_deadline(
            command,
            key,
            args,
            processor,
            flags,
            self.inner.options().async_timeout(),
        )
        .await
    }

    /// Execute a command with a caller-provided deadline. Expiry cancels
    /// the message; a cancelled in-flight slot is tombstoned and its reply
    /// discarded.
    pub async fn execute_with_deadline(
        &self,
        command: CommandId,
        key: Option<RedisKey>,
        args: Vec<RedisValue>,
        processor: ResultProcessor,
        flags: MessageFlags,
        deadline: std::time::Duration,
    ) -> BraidResult<TypedReply> {
        let (message, ticket) = Message::new(
            self.inner.clock(),
            command,
            key,
            args,
            processor,
            flags,
        );
        let message = message.with_db(self.index as i32).with_deadline(deadline);
        self.inner.dispatch(message).await;
        if flags.contains(MessageFlags::FIRE_AND_FORGET) {
            return ticket.await_reply().await;
        }
        ticket
            .await_reply_within(
                deadline,
                self.inner.options().include_detail_in_exceptions,
            )
            .await
    }

    /// `GET key`.
    pub async fn get(&self, key: impl Into<RedisKey>) -> BraidResult<Option<Bytes>> {
        let reply = self
            .execute(
                CommandId::Get,
                Some(key.into()),
                Vec::new(),
                ResultProcessor::BytesNullable,
                MessageFlags::empty(),
            )
            .await?;
        match reply {
            TypedReply::Bytes(value) => Ok(value),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// `SET key value`.
    pub async fn set(
        &self,
        key: impl Into<RedisKey>,
        value: impl Into<Bytes>,
    ) -> BraidResult<()> {
        self.execute(
            CommandId::Set,
            Some(key.into()),
            vec![RedisValue::Bytes(value.into())],
            ResultProcessor::OkStatus,
            MessageFlags::empty(),
        )
        .await
        .map(|_| ())
    }

    /// `DEL key`; resolves to the number of keys removed.
    pub async fn del(&self, key: impl Into<RedisKey>) -> BraidResult<i64> {
        let reply = self
            .execute(
                CommandId::Del,
                Some(key.into()),
                Vec::new(),
                ResultProcessor::Integer,
                MessageFlags::empty(),
            )
            .await?;
        reply.as_int().ok_or_else(|| unexpected("DEL", &reply))
    }

    /// `EXISTS key`.
    pub async fn exists(&self, key: impl Into<RedisKey>) -> BraidResult<bool> {
        let reply = self
            .execute(
                CommandId::Exists,
                Some(key.into()),
                Vec::new(),
                ResultProcessor::Integer,
                MessageFlags::empty(),
            )
            .await?;
        reply
            .as_int()
            .map(|n| n > 0)
            .ok_or_else(|| unexpected("EXISTS", &reply))
    }

    /// `INCR key`; resolves to the new value.
    pub async fn incr(&self, key: impl Into<RedisKey>) -> BraidResult<i64> {
        let reply = self
            .execute(
                CommandId::Incr,
                Some(key.into()),
                Vec::new(),
                ResultProcessor::Integer,
                MessageFlags::empty(),
            )
            .await?;
        reply.as_int().ok_or_else(|| unexpected("INCR", &reply))
    }

    /// `EVAL script numkeys key... arg...`.
    pub async fn eval(
        &self,
        script: impl Into<Bytes>,
        keys: Vec<RedisKey>,
        args: Vec<RedisValue>,
    ) -> BraidResult<TypedReply> {
        let script = script.into();
        self.run_script(CommandId::Eval, RedisValue::Bytes(script), keys, args, None)
            .await
    }

    /// `EVALSHA sha numkeys key... arg...`.
    ///
    /// When `script` is supplied, a `-NOSCRIPT` reply triggers an automatic
    /// `SCRIPT LOAD` followed by a retry.
    pub async fn eval_sha(
        &self,
        sha: impl Into<Bytes>,
        keys: Vec<RedisKey>,
        args: Vec<RedisValue>,
        script: Option<Bytes>,
    ) -> BraidResult<TypedReply> {
        self.run_script(
            CommandId::EvalSha,
            RedisValue::Bytes(sha.into()),
            keys,
            args,
            script,
        )
        .await
    }

    async fn run_script(
        &self,
        command: CommandId,
        token: RedisValue,
        keys: Vec<RedisKey>,
        args: Vec<RedisValue>,
        script: Option<Bytes>,
    ) -> BraidResult<TypedReply> {
        // All keys must share a slot before anything reaches the wire.
        let slot = match crate::routing::common_slot(keys.iter()) {
            Ok(slot) => slot,
            Err((first, second)) => {
                if self.inner.is_cluster() {
                    return Err(BraidError::CrossSlot { first, second });
                }
                None
            }
        };

        let mut wire_args = Vec::with_capacity(2 + keys.len() + args.len());
        wire_args.push(token);
        wire_args.push(RedisValue::Integer(keys.len() as i64));
        for key in &keys {
            wire_args.push(RedisValue::Bytes(key.to_bytes()));
        }
        wire_args.extend(args);

        let (message, ticket) = Message::new(
            self.inner.clock(),
            command,
            None,
            wire_args,
            ResultProcessor::Raw,
            MessageFlags::empty(),
        );
        let mut message = message.with_db(self.index as i32);
        if let Some(slot) = slot {
            message = message.with_slot_hint(slot);
        }
        if let Some(script) = script {
            message = message.with_script(script);
        }
        self.inner.dispatch(message).await;
        ticket
            .await_reply_within(
                self.inner.options().async_timeout(),
                self.inner.options().include_detail_in_exceptions,
            )
            .await
    }

    /// Run an optimistic transaction against this database.
    pub async fn run_transaction(&self, tx: Transaction) -> BraidResult<TransactionOutcome> {
        transaction::execute(&self.inner, self.index as i32, tx).await
    }
}

fn unexpected(command: &'static str, got: &TypedReply) -> BraidError {
    BraidError::UnexpectedReply {
        command,
        expected: "typed reply",
        got: match got {
            TypedReply::Void => "void",
            TypedReply::Bool(_) => "bool",
            TypedReply::Integer(_) => "integer",
            TypedReply::Double(_) => "double",
            TypedReply::Bytes(_) => "bytes",
            TypedReply::Simple(_) => "simple",
            TypedReply::BulkArray(_) => "bulk-array",
            TypedReply::Pairs(_) => "pairs",
            TypedReply::Scored(_) => "scored",
            TypedReply::Geo(_) => "geo",
            TypedReply::Stream(_) => "stream",
            TypedReply::ClusterNodes(_) => "cluster-nodes",
            TypedReply::ClientInfo(_) => "client-info",
            TypedReply::Raw(_) => "raw",
        },
    }
}
