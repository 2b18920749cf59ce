//! Per-connection plumbing between a console WebSocket and its PTY.
//!
//! [`serve`] runs after the HTTP upgrade: it spawns the process, registers the
//! session and hands both to [`bridge`], which pumps bytes in both directions
//! until either side ends, then tears the session down.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::protocol::ClientFrame;
use crate::pty::PtyProcess;
use crate::session::{next_session_id, RegistryError, Session, SessionRegistry, SpawnMode};

/// Sent when the process cannot be started.
pub const SPAWN_FAILED_TEXT: &str = "Error: failed to start console\r\n";
/// Sent when the registry filled up between the capacity check and `add`.
pub const MAX_SESSIONS_TEXT: &str = "Error: max sessions reached\r\n";

const READ_BUF_SIZE: usize = 4096;
/// Output chunks buffered between the PTY reader thread and the socket.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Spawn a process for `mode`, register it, and bridge it to `socket`.
pub async fn serve(mut socket: WebSocket, peer: SocketAddr, mode: SpawnMode, state: AppState) {
    let id = next_session_id(peer);
    let command = state.config.command_for(mode);

    let pty = match PtyProcess::spawn_with_size(&command, state.config.window_size()) {
        Ok(pty) => Arc::new(pty),
        Err(e) => {
            tracing::error!(session = %id, %command, error = %e, "failed to start console");
            reject(&mut socket, SPAWN_FAILED_TEXT).await;
            return;
        }
    };

    let session = match state.registry.add(id.clone(), pty.clone(), mode) {
        Ok(session) => session,
        Err(e) => {
            pty.close();
            let text = match e {
                RegistryError::MaxSessionsReached => {
                    tracing::warn!(session = %id, "session limit reached after spawn");
                    MAX_SESSIONS_TEXT
                }
                RegistryError::IdExists(_) => {
                    tracing::error!(session = %id, error = %e, "failed to register console");
                    SPAWN_FAILED_TEXT
                }
            };
            reject(&mut socket, text).await;
            return;
        }
    };

    tracing::info!(
        session = %id,
        mode = session.mode.as_str(),
        pid = ?session.pty.pid(),
        %peer,
        "console session started"
    );

    bridge(socket, session, state.registry.clone(), state.shutdown.clone()).await;
}

async fn reject(socket: &mut WebSocket, text: &'static str) {
    let _ = socket.send(Message::Text(Utf8Bytes::from_static(text))).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        })))
        .await;
}

/// Pump bytes between `socket` and a registered session until one side ends.
///
/// Whatever ends first (process exit, client disconnect, reaper removal or
/// server shutdown) aborts the other direction and removes the session.
pub async fn bridge(
    socket: WebSocket,
    session: Session,
    registry: SessionRegistry,
    shutdown: CancellationToken,
) {
    let id = session.id.clone();
    let created_at = session.created_at;
    let (ws_tx, ws_rx) = socket.split();
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);

    // The reader outlives neither the process nor the channel: it stops on
    // EOF, on EIO from a dead slave, or once the receiver is gone.
    let reader_pty = session.pty.clone();
    let reader_id = id.clone();
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            read_pty(&reader_pty, &output_tx)
        }));
        if let Err(e) = result {
            tracing::error!(session = %reader_id, "pty reader panicked: {:?}", e);
        }
    });

    let mut tasks = JoinSet::new();
    tasks.spawn(forward_output(
        ws_tx,
        output_rx,
        session.cancelled.clone(),
        shutdown,
    ));
    tasks.spawn(forward_input(ws_rx, session, registry.clone()));

    if let Some(Err(e)) = tasks.join_next().await {
        if e.is_panic() {
            tracing::error!(session = %id, "console bridge task panicked: {:?}", e);
        }
    }
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    registry.remove(&id);
    tracing::info!(
        session = %id,
        lifetime_secs = created_at.elapsed().as_secs_f64(),
        remaining = registry.len(),
        "console session ended"
    );
}

fn read_pty(pty: &PtyProcess, output_tx: &mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match pty.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a hung-up slave.
                if e.raw_os_error() != Some(libc::EIO) {
                    tracing::debug!(error = %e, "pty read error");
                }
                break;
            }
        }
    }
}

/// Process → socket.
async fn forward_output(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut output_rx: mpsc::Receiver<Bytes>,
    cancelled: CancellationToken,
    shutdown: CancellationToken,
) {
    let (code, reason) = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break (close_code::AWAY, "server shutting down"),
            _ = cancelled.cancelled() => break (close_code::AWAY, "session closed"),
            chunk = output_rx.recv() => match chunk {
                Some(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    if ws_tx.send(Message::Binary(data)).await.is_err() {
                        return;
                    }
                }
                None => break (close_code::NORMAL, "process exited"),
            },
        }
    };

    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

/// Socket → process. Frames are applied strictly in order.
async fn forward_input(
    mut ws_rx: SplitStream<WebSocket>,
    session: Session,
    registry: SessionRegistry,
) {
    while let Some(msg) = ws_rx.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(session = %session.id, error = %e, "websocket receive error");
                break;
            }
        };

        registry.touch(&session.id);
        if let Err(e) = apply_frame(&session, data).await {
            tracing::debug!(session = %session.id, error = %e, "pty write failed");
            break;
        }
    }
}

/// Apply one client frame to the session's PTY.
///
/// Only a failed write is an error; bad control frames are dropped.
pub async fn apply_frame(session: &Session, data: Bytes) -> std::io::Result<()> {
    match ClientFrame::parse(&data) {
        ClientFrame::Empty => Ok(()),
        ClientFrame::Resize(msg) => {
            if let Err(e) = session.pty.resize(msg.cols, msg.rows) {
                tracing::debug!(session = %session.id, error = %e, "resize failed");
            }
            Ok(())
        }
        ClientFrame::Malformed(reason) => {
            tracing::debug!(session = %session.id, %reason, "dropping control frame");
            Ok(())
        }
        ClientFrame::Input(_) => {
            let pty = session.pty.clone();
            tokio::task::spawn_blocking(move || pty.write(&data))
                .await
                .map_err(std::io::Error::other)?
                .map(|_| ())
        }
    }
}
