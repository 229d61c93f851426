//! The bridge driver and its write/read loops.
//!
//! The driver runs the connect → handshake → serve → teardown cycle until
//! the bridge is closed. While connected, the write loop and read loop run
//! concurrently inside one task; they share nothing mutable beyond the
//! in-flight queue and the two socket halves.

use super::handshake;
use super::{BridgeEvent, BridgeShared, BridgeState, WriteItem};
use crate::command::message::Disposition;
use crate::command::{Message, MessageFlags, MessageShared};
use crate::core::error::{BraidError, ConnectionFailureKind, ConnectionRole};
use crate::net::{self, BridgeStream};
use crate::protocol::{encode_command, FrameDecoder, RawFrame, RespVersion};
use bytes::BytesMut;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

/// Why the connected phase ended.
type LoopExit = (ConnectionFailureKind, String);

pub(crate) async fn run_driver(
    shared: Arc<BridgeShared>,
    mut ready_rx: mpsc::Receiver<WriteItem>,
    mut priority_rx: mpsc::UnboundedReceiver<WriteItem>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    while !shared.is_closing() {
        if shared.auth_failed() {
            // Terminal until configuration changes; wait for a nudge.
            tokio::select! {
                _ = shared.teardown_signal().notified() => {}
                _ = close_rx.changed() => {}
            }
            continue;
        }

        shared.set_state(BridgeState::Connecting);
        let connect = net::connect(shared.endpoint(), shared.options(), shared.role());
        let mut stream = tokio::select! {
            result = connect => match result {
                Ok(stream) => stream,
                Err(err) => {
                    shared.set_state(BridgeState::Disconnected);
                    shared.emit(BridgeEvent::Failed {
                        endpoint: shared.endpoint().to_string(),
                        role: shared.role(),
                        kind: ConnectionFailureKind::UnableToConnect,
                        message: err.to_string(),
                    });
                    attempt += 1;
                    wait_retry(&shared, &mut close_rx, attempt).await;
                    continue;
                }
            },
            _ = close_rx.changed() => continue,
        };

        shared.set_state(BridgeState::Handshaking);
        let mut decoder = FrameDecoder::new(RespVersion::Resp2);
        let outcome = tokio::time::timeout(
            shared.options().connect_timeout(),
            handshake::run(shared.options(), &mut stream, &mut decoder),
        )
        .await;
        let negotiated = match outcome {
            Err(_elapsed) => {
                shared.set_state(BridgeState::Disconnected);
                shared.emit(BridgeEvent::Failed {
                    endpoint: shared.endpoint().to_string(),
                    role: shared.role(),
                    kind: ConnectionFailureKind::UnableToConnect,
                    message: "handshake timed out".to_string(),
                });
                attempt += 1;
                wait_retry(&shared, &mut close_rx, attempt).await;
                continue;
            }
            Ok(Err(failure)) => {
                shared.set_state(BridgeState::Disconnected);
                if failure.kind == ConnectionFailureKind::AuthenticationFailure {
                    shared.mark_auth_failed(&failure.message);
                    let err = BraidError::ConnectionFailure {
                        kind: failure.kind,
                        endpoint: shared.endpoint().to_string(),
                        role: shared.role(),
                        message: failure.message.clone(),
                    };
                    shared.fail_all_queues(&err);
                }
                shared.emit(BridgeEvent::Failed {
                    endpoint: shared.endpoint().to_string(),
                    role: shared.role(),
                    kind: failure.kind,
                    message: failure.message,
                });
                attempt += 1;
                if failure.kind != ConnectionFailureKind::AuthenticationFailure {
                    wait_retry(&shared, &mut close_rx, attempt).await;
                }
                continue;
            }
            Ok(Ok(negotiated)) => negotiated,
        };

        shared.set_state(BridgeState::ConnectedEstablishing);
        shared.counters().reconnects.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            endpoint = %shared.endpoint(),
            role = %shared.role(),
            resp = %negotiated.resp,
            "bridge established"
        );
        let (read_half, write_half) = tokio::io::split(stream);
        shared.promote_backlog();
        shared.emit(BridgeEvent::Established {
            endpoint: shared.endpoint().to_string(),
            role: shared.role(),
            resp: negotiated.resp,
            server_version: negotiated.server_version.clone(),
        });
        attempt = 0;

        let (kind, cause) = run_connected(
            &shared,
            &mut ready_rx,
            &mut priority_rx,
            &mut close_rx,
            read_half,
            write_half,
            decoder,
        )
        .await;

        if shared.is_closing() {
            shared.set_state(BridgeState::Disconnecting);
            break;
        }

        shared.set_state(BridgeState::ConnectedFailing);
        tracing::warn!(
            endpoint = %shared.endpoint(),
            role = %shared.role(),
            kind = %kind,
            cause = %cause,
            "bridge failed"
        );
        shared.fail_in_flight(kind, &cause);
        shared.emit(BridgeEvent::Failed {
            endpoint: shared.endpoint().to_string(),
            role: shared.role(),
            kind,
            message: cause,
        });
        shared.set_state(BridgeState::Disconnected);
        attempt += 1;
        wait_retry(&shared, &mut close_rx, attempt).await;
    }

    // Final shutdown: everything still queued fails with Disposed.
    shared.set_state(BridgeState::Disconnecting);
    shared.fail_all_queues(&BraidError::Disposed);
    while let Ok(item) = priority_rx.try_recv() {
        shared.write_finished();
        for message in item.into_messages() {
            message.resolve(Err(BraidError::Disposed));
        }
    }
    while let Ok(item) = ready_rx.try_recv() {
        shared.write_finished();
        for message in item.into_messages() {
            message.resolve(Err(BraidError::Disposed));
        }
    }
    shared.set_state(BridgeState::Disconnected);
}

async fn wait_retry(
    shared: &BridgeShared,
    close_rx: &mut watch::Receiver<bool>,
    attempt: u32,
) {
    let delay = shared
        .options()
        .reconnect_retry_policy
        .next_delay(attempt.saturating_sub(1));
    tracing::debug!(
        endpoint = %shared.endpoint(),
        role = %shared.role(),
        attempt,
        delay_ms = delay.as_millis() as u64,
        "reconnect backoff"
    );
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = close_rx.changed() => {}
        _ = shared.teardown_signal().notified() => {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connected(
    shared: &Arc<BridgeShared>,
    ready_rx: &mut mpsc::Receiver<WriteItem>,
    priority_rx: &mut mpsc::UnboundedReceiver<WriteItem>,
    close_rx: &mut watch::Receiver<bool>,
    read_half: ReadHalf<BridgeStream>,
    write_half: WriteHalf<BridgeStream>,
    decoder: FrameDecoder,
) -> LoopExit {
    let write = write_loop(shared, ready_rx, priority_rx, write_half);
    let read = read_loop(shared, read_half, decoder);
    tokio::select! {
        exit = read => exit,
        exit = write => exit,
        _ = shared.teardown_signal().notified() => (
            ConnectionFailureKind::SocketClosed,
            "connection torn down".to_string(),
        ),
        _ = close_rx.changed() => (
            ConnectionFailureKind::SocketClosed,
            "multiplexer closing".to_string(),
        ),
    }
}

/// Move messages write-ready → in-flight, serialize, flush.
async fn write_loop(
    shared: &Arc<BridgeShared>,
    ready_rx: &mut mpsc::Receiver<WriteItem>,
    priority_rx: &mut mpsc::UnboundedReceiver<WriteItem>,
    mut writer: WriteHalf<BridgeStream>,
) -> LoopExit {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        let item = tokio::select! {
            biased;
            item = priority_rx.recv() => match item {
                Some(item) => item,
                None => return (ConnectionFailureKind::SocketClosed, "mailbox closed".into()),
            },
            item = ready_rx.recv() => match item {
                Some(item) => item,
                None => return (ConnectionFailureKind::SocketClosed, "mailbox closed".into()),
            },
        };
        shared.write_finished();

        buf.clear();
        let mut staged: Vec<Message> = Vec::new();
        for message in item.into_messages() {
            // A message cancelled before its bytes were staged is dropped
            // whole; once staged, the frame always completes.
            if message.is_finished() {
                continue;
            }
            encode_command(&mut buf, message.wire_parts().iter());
            staged.push(message);
        }
        if staged.is_empty() {
            continue;
        }

        let cores: Vec<(Arc<MessageShared>, bool)> = staged
            .iter()
            .map(|m| {
                (
                    m.shared().clone(),
                    m.flags().contains(MessageFlags::FIRE_AND_FORGET),
                )
            })
            .collect();
        // Every staged message enters the in-flight queue before the flush
        // so an immediate reply finds its partner. Fire-and-forget entries
        // become tombstones at write success: the reply is consumed and
        // discarded, never surfaced.
        for message in staged {
            shared.in_flight().push(message);
        }

        let flushed = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        match flushed {
            Ok(()) => {
                let tick = shared.clock().now();
                for (core, fire_and_forget) in &cores {
                    core.mark_written(tick);
                    if *fire_and_forget {
                        core.finish_written(tick);
                    }
                }
                shared
                    .counters()
                    .ops_written
                    .fetch_add(cores.len() as u64, Ordering::Relaxed);
                shared.counters().record_sent(buf.len() as u64);
            }
            Err(err) => {
                return (ConnectionFailureKind::SocketFailure, err.to_string());
            }
        }
    }
}

/// Decode reply frames and pair them with in-flight messages, routing
/// out-of-band deliveries to the multiplexer.
async fn read_loop(
    shared: &Arc<BridgeShared>,
    mut reader: ReadHalf<BridgeStream>,
    mut decoder: FrameDecoder,
) -> LoopExit {
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        let n = match reader.read(&mut chunk).await {
            Err(err) => return (ConnectionFailureKind::SocketFailure, err.to_string()),
            Ok(0) => {
                return (
                    ConnectionFailureKind::SocketClosed,
                    "server closed the connection".to_string(),
                )
            }
            Ok(n) => n,
        };
        shared.counters().record_received(n as u64);
        if let Err(err) = decoder.feed(&chunk[..n]) {
            return (ConnectionFailureKind::ProtocolFailure, err.to_string());
        }
        loop {
            match decoder.next_frame() {
                Err(err) => {
                    return (ConnectionFailureKind::ProtocolFailure, err.to_string());
                }
                Ok(None) => break,
                Ok(Some(frame)) => {
                    shared.note_reply();
                    route_frame(shared, frame);
                }
            }
        }
    }
}

fn route_frame(shared: &Arc<BridgeShared>, frame: RawFrame) {
    let event = frame.pubsub_event();
    let is_message = matches!(event, Some("message" | "pmessage" | "smessage"));

    // Channel deliveries: RESP3 pushes anywhere, plain arrays on the
    // subscription bridge. Interactive-bridge arrays that merely look like
    // deliveries stay replies.
    let is_delivery = match &frame {
        RawFrame::Push(_) => is_message,
        _ => is_message && shared.role() == ConnectionRole::Subscription,
    };
    if is_delivery {
        shared.emit(BridgeEvent::Delivery {
            frame,
            endpoint: shared.endpoint().to_string(),
        });
        return;
    }

    if let RawFrame::Push(_) = &frame {
        // RESP3 subscription-state confirmations arrive as pushes; pair one
        // with the head command when it is waiting for exactly that.
        if event.is_some() {
            if let Some(message) = shared
                .in_flight()
                .pop_if(|m| m.command().hints().pubsub_state)
            {
                shared.counters().reply_matched();
                dispatch(shared, message, frame);
            } else {
                shared.emit(BridgeEvent::Delivery {
                    frame,
                    endpoint: shared.endpoint().to_string(),
                });
            }
        } else {
            // Server-initiated pushes we carry no state for (invalidate).
            shared.emit(BridgeEvent::Delivery {
                frame,
                endpoint: shared.endpoint().to_string(),
            });
        }
        return;
    }

    match shared.in_flight().pop() {
        Some(message) => {
            shared.counters().reply_matched();
            dispatch(shared, message, frame);
        }
        None => {
            tracing::warn!(
                endpoint = %shared.endpoint(),
                role = %shared.role(),
                kind = frame.kind_name(),
                "unsolicited reply frame discarded"
            );
        }
    }
}

fn dispatch(shared: &Arc<BridgeShared>, message: Message, frame: RawFrame) {
    match message.apply_frame(frame) {
        Disposition::Resolved => {}
        Disposition::Redirect(message, redirect) => {
            shared.emit(BridgeEvent::Redirect {
                message,
                redirect,
                from: shared.endpoint().to_string(),
            });
        }
        Disposition::Retry(message, error) => {
            shared.emit(BridgeEvent::Retry { message, error });
        }
    }
}
