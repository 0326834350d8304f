//! WebSocket Sessions
//!
//! One [`Session`] per upgraded socket. Three tasks serve it:
//!
//! - **read pump**: reads frames, enforces the frame size limit and the pong
//!   deadline, and pushes payloads onto the session's inbound buffer
//! - **write pump**: drains the outbound buffer and sends a ping every
//!   `ping_interval`; each write is bounded by `write_wait`
//! - **forwarder**: moves the inbound buffer onto the manager's shared
//!   inbound channel, tagged with the session id
//!
//! Whichever of the pumps or the manager gets there first closes the
//! session; [`Session::close`] only has an effect once.

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::auth::Role;
use super::messages::{Inbound, SessionId};

/// Live sessions by id
#[derive(Default)]
pub(super) struct Registry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl Registry {
    /// Insert `session`, returning the session it replaced
    pub(super) async fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.lock().await.insert(session.id, session)
    }

    /// Remove the entry for `id` if it still belongs to the session with
    /// `key`
    async fn remove(&self, id: SessionId, key: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(&id) {
            Some(current) if current.key == key => {
                sessions.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub(super) async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub(super) async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub(super) async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// One connected client
pub struct Session {
    id: SessionId,
    /// Distinguishes this session from a later one with the same id
    key: u64,
    role: Role,
    outbound: mpsc::Sender<Vec<u8>>,
    closing: AtomicBool,
    cancel: CancellationToken,
    registry: Weak<Registry>,
}

impl Session {
    pub(super) fn new(
        id: SessionId,
        key: u64,
        role: Role,
        outbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            id,
            key,
            role,
            outbound,
            closing: AtomicBool::new(false),
            cancel,
            registry,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue a payload without waiting; fails when the buffer is full
    pub(super) fn try_send(&self, payload: Vec<u8>) -> Result<(), TrySendError<Vec<u8>>> {
        if self.is_closed() {
            return Err(TrySendError::Closed(payload));
        }
        self.outbound.try_send(payload)
    }

    /// Close the session and remove it from the registry.
    ///
    /// Returns true for the one call that actually closed it.
    pub async fn close(&self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.cancel.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id, self.key).await;
        }

        tracing::info!(session_id = %self.id, role = %self.role, "Client disconnected");
        true
    }

    async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Read frames until the socket fails, the pong deadline passes, a frame
/// is oversized, or the session closes.
pub(super) async fn read_pump<R, E>(
    session: Arc<Session>,
    mut reader: R,
    inbound: mpsc::Sender<Vec<u8>>,
    pong_wait: Duration,
    max_frame_bytes: usize,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let id = session.id;
    let deadline = tokio::time::sleep(pong_wait);
    tokio::pin!(deadline);

    loop {
        let frame = tokio::select! {
            _ = session.closed() => break,
            _ = &mut deadline => {
                tracing::info!(session_id = %id, "Client missed pong deadline");
                break;
            }
            frame = reader.next() => frame,
        };

        let payload = match frame {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Pong(_))) => {
                deadline.as_mut().reset(Instant::now() + pong_wait);
                continue;
            }
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(session_id = %id, "Client closed connection");
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(session_id = %id, error = %e, "WebSocket receive error");
                break;
            }
        };

        if payload.len() > max_frame_bytes {
            tracing::warn!(
                session_id = %id,
                size = payload.len(),
                limit = max_frame_bytes,
                "Frame exceeds read limit"
            );
            break;
        }

        tokio::select! {
            _ = session.closed() => break,
            sent = inbound.send(payload) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
}

async fn write_frame<W>(writer: &mut W, frame: Message, write_wait: Duration) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(write_wait, writer.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

/// Write queued payloads and periodic pings until a write fails or the
/// session closes; on close, send a close frame.
pub(super) async fn write_pump<W>(
    session: Arc<Session>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    ping_interval: Duration,
    write_wait: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let id = session.id;
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut going_away = false;
    loop {
        let frame = tokio::select! {
            biased;
            _ = session.closed() => {
                going_away = true;
                break;
            }
            payload = outbound.recv() => match payload {
                Some(payload) => match String::from_utf8(payload) {
                    Ok(text) => Message::Text(text),
                    Err(e) => Message::Binary(e.into_bytes()),
                },
                None => break,
            },
            _ = ticker.tick() => Message::Ping(Vec::new()),
        };

        if let Err(e) = write_frame(&mut writer, frame, write_wait).await {
            tracing::debug!(session_id = %id, error = %e, "WebSocket write failed");
            break;
        }
    }

    // close frame and sink close share one write deadline
    let _ = tokio::time::timeout(write_wait, async {
        if going_away {
            let close = Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "conn shutting down".into(),
            }));
            if writer.send(close).await.is_err() {
                return;
            }
        }
        let _ = writer.close().await;
    })
    .await;
    session.close().await;
}

/// Move payloads from the session's inbound buffer to the shared inbound
/// channel
pub(super) async fn forward_inbound(
    session: Arc<Session>,
    mut buffer: mpsc::Receiver<Vec<u8>>,
    shared: mpsc::Sender<Inbound>,
) {
    let session_id = session.id;
    loop {
        let payload = tokio::select! {
            _ = session.closed() => break,
            payload = buffer.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        tokio::select! {
            _ = session.closed() => break,
            sent = shared.send(Inbound { session_id, payload }) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
