pub mod frame;
pub mod handshake;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, OutboundMessage};
use crate::constants::{
    INBOUND_RATE_LIMIT, INBOUND_RATE_WINDOW_MS, MAX_FRAME_PAYLOAD, OUTBOUND_QUEUE_CAP,
    WRITE_STALL_GRACE_MS,
};
use crate::dispatch;
use crate::state::SharedState;
use crate::types::GameError;
use frame::{
    FrameError, CLOSE_POLICY_VIOLATION, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_BIG, OP_CLOSE, OP_PING,
    OP_PONG, OP_TEXT,
};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Accept loop for the game socket. Mints connection ids and spawns one
/// endpoint task per socket; on shutdown the listener is dropped first
/// (refusing new connections), every live connection is told to close, and
/// the endpoint tasks are joined with a bounded deadline.
pub async fn run_listener(
    listener: TcpListener,
    state: SharedState,
    broadcaster: Arc<Broadcaster>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
                        debug!(conn_id, %addr, "connection accepted");
                        connections.spawn(handle_connection(
                            socket,
                            addr,
                            conn_id,
                            state.clone(),
                            broadcaster.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    // stop accepting before touching the established connections
    drop(listener);
    broadcaster.close_all(1001, "server shutting down");

    let deadline = Instant::now() + Duration::from_secs(1);
    while !connections.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                left = connections.len(),
                "connection tasks missed the shutdown deadline; aborting"
            );
            connections.abort_all();
            break;
        }
        if tokio::time::timeout(remaining, connections.join_next())
            .await
            .is_err()
        {
            continue;
        }
    }
    while connections.join_next().await.is_some() {}
    info!("game listener stopped");
}

async fn handle_connection(
    mut socket: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    state: SharedState,
    broadcaster: Arc<Broadcaster>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(error) = handshake::accept(&mut socket).await {
        debug!(conn_id, %addr, %error, "handshake rejected");
        return;
    }

    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_QUEUE_CAP);
    let closing = Arc::new(Notify::new());
    broadcaster.register(conn_id, addr, tx, closing.clone());
    info!(conn_id, %addr, "websocket connection established");

    let writer = tokio::spawn(write_loop(write_half, rx));
    read_loop(
        read_half,
        conn_id,
        &state,
        &broadcaster,
        shutdown,
        closing,
    )
    .await;

    // reader is done: tear down, notify the dispatcher exactly once
    dispatch::handle_disconnect(&state, &broadcaster, conn_id).await;
    let _ = writer.await;
    debug!(conn_id, "connection closed");
}

/// Drains the bounded outbound queue onto the socket. A write that stalls
/// past the grace closes the connection; queue exhaustion (all senders
/// gone) flushes a final close frame best-effort.
async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<OutboundMessage>) {
    let grace = Duration::from_millis(WRITE_STALL_GRACE_MS);
    loop {
        let message = rx.recv().await;
        let (bytes, is_close) = match message {
            Some(OutboundMessage::Text(payload)) => (frame::encode_text(&payload), false),
            Some(OutboundMessage::Pong(payload)) => {
                (frame::encode_frame(OP_PONG, &payload), false)
            }
            Some(OutboundMessage::Close { code, reason }) => {
                debug!(code, %reason, "closing connection");
                (frame::encode_close(None), true)
            }
            None => (frame::encode_close(None), true),
        };
        match tokio::time::timeout(grace, write_half.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_stalled) => {
                debug!("socket write stalled past the grace period");
                break;
            }
        }
        if is_close {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

struct RateLimiter {
    window_start: Instant,
    count: usize,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start)
            >= Duration::from_millis(INBOUND_RATE_WINDOW_MS)
        {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= INBOUND_RATE_LIMIT
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    conn_id: u64,
    state: &SharedState,
    broadcaster: &Broadcaster,
    mut shutdown: watch::Receiver<bool>,
    closing: Arc<Notify>,
) {
    let mut limiter = RateLimiter::new();
    loop {
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = closing.notified() => break,
            frame = frame::read_frame(&mut read_half, MAX_FRAME_PAYLOAD) => frame,
        };

        match frame {
            Ok(received) if received.opcode == OP_TEXT && received.fin => {
                if !limiter.check() {
                    warn!(conn_id, "inbound rate limit exceeded");
                    let error = GameError::RateLimited;
                    broadcaster.send(
                        conn_id,
                        &dispatch::envelope(
                            "error",
                            serde_json::json!({
                                "code": error.wire_code(),
                                "message": error.to_string(),
                            }),
                        ),
                    );
                    broadcaster.close(conn_id, CLOSE_POLICY_VIOLATION, "rate limited");
                    break;
                }
                match String::from_utf8(received.payload) {
                    Ok(text) => {
                        dispatch::handle_message(state, broadcaster, conn_id, &text).await;
                    }
                    Err(_) => {
                        broadcaster.close(conn_id, CLOSE_PROTOCOL_ERROR, "invalid utf8");
                        break;
                    }
                }
            }
            Ok(received) if received.opcode == OP_PING => {
                broadcaster.send_pong(conn_id, received.payload);
            }
            Ok(received) if received.opcode == OP_PONG => {}
            Ok(received) if received.opcode == OP_CLOSE => {
                broadcaster.close(conn_id, 1000, "peer closed");
                break;
            }
            Ok(received) => {
                // fragmentation and binary data are unsupported
                debug!(
                    conn_id,
                    opcode = received.opcode,
                    fin = received.fin,
                    "unsupported frame"
                );
                broadcaster.close(conn_id, CLOSE_PROTOCOL_ERROR, "unsupported frame");
                break;
            }
            Err(FrameError::TooBig(size)) => {
                warn!(conn_id, size, "oversized frame");
                broadcaster.close(conn_id, CLOSE_TOO_BIG, "frame too large");
                break;
            }
            Err(FrameError::Protocol(reason)) => {
                debug!(conn_id, %reason, "frame protocol error");
                broadcaster.close(conn_id, CLOSE_PROTOCOL_ERROR, &reason);
                break;
            }
            Err(FrameError::Closed) => break,
            Err(FrameError::Io(error)) => {
                debug!(conn_id, %error, "socket read failed");
                break;
            }
        }
    }
}
