//! WebSocket Connection Manager
//!
//! Owns the session registry and the two routing channels between sessions
//! and the application:
//!
//! - **inbound**: every frame read from any session, tagged with its id
//! - **outbound**: `(session id, payload)` pairs routed to one session's
//!   buffer; a full buffer drops the message instead of blocking the router

use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::auth::Identity;
use super::messages::{Inbound, Outbound, SessionId, WsConfig};
use super::session::{forward_inbound, read_pump, write_pump, Registry, Session};

/// Manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    #[error("WebSocket manager is shutting down")]
    ShuttingDown,

    #[error("WebSocket sessions did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Registry of live sessions plus the shared routing channels
pub struct Manager {
    config: WsConfig,
    registry: Arc<Registry>,
    inbound_tx: Mutex<Option<mpsc::Sender<Inbound>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    shutdown_started: AtomicBool,
    next_key: AtomicU64,
    dropped: Arc<AtomicU64>,
}

impl Manager {
    pub fn new(config: WsConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.routing_buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.routing_buffer);

        Self {
            config,
            registry: Arc::new(Registry::default()),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shutdown_started: AtomicBool::new(false),
            next_key: AtomicU64::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Take the receiving end of the shared inbound channel.
    ///
    /// Returns `None` after the first call. The channel ends once the
    /// manager has shut down and every session task has finished.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound_rx.lock().await.take()
    }

    /// Sender for the shared outbound channel
    pub fn outbound(&self) -> mpsc::Sender<Outbound> {
        self.outbound_tx.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    pub async fn is_connected(&self, id: &SessionId) -> bool {
        self.registry.get(id).await.is_some()
    }

    /// The live session registered under `id`
    pub async fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.registry.get(id).await
    }

    /// Outbound messages dropped because a session buffer was full
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    /// Start the task that routes the outbound channel to sessions.
    /// Only the first call starts anything.
    pub async fn start_router(&self) {
        let Some(mut outbound) = self.outbound_rx.lock().await.take() else {
            tracing::warn!("Outbound router already started");
            return;
        };

        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        let dropped = Arc::clone(&self.dropped);

        self.tracker.spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = outbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                route(&registry, &dropped, message).await;
            }
            tracing::debug!("Outbound router stopped");
        });
    }

    /// Register a session for an upgraded socket and start its pumps.
    ///
    /// A session already registered under the same id is closed and
    /// replaced.
    pub async fn attach<S, E>(&self, identity: Identity, socket: S) -> Result<Arc<Session>, WsError>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(WsError::ShuttingDown);
        }
        let shared_inbound = self
            .inbound_tx
            .lock()
            .await
            .clone()
            .ok_or(WsError::ShuttingDown)?;

        let config = &self.config;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.session_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.session_buffer);

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            identity.user_id,
            key,
            identity.role,
            outbound_tx,
            self.cancel.child_token(),
            Arc::downgrade(&self.registry),
        ));

        if let Some(previous) = self.registry.insert(Arc::clone(&session)).await {
            tracing::info!(session_id = %identity.user_id, "Replacing existing session");
            previous.close().await;
        }

        let (writer, reader) = socket.split();
        self.tracker.spawn(read_pump(
            Arc::clone(&session),
            reader,
            inbound_tx,
            config.pong_wait,
            config.max_frame_bytes,
        ));
        self.tracker.spawn(write_pump(
            Arc::clone(&session),
            writer,
            outbound_rx,
            config.ping_interval(),
            config.write_wait,
        ));
        self.tracker.spawn(forward_inbound(
            Arc::clone(&session),
            inbound_rx,
            shared_inbound,
        ));

        tracing::info!(
            session_id = %identity.user_id,
            role = %identity.role,
            "WebSocket connection established"
        );
        Ok(session)
    }

    /// Close every session, wait up to `timeout` for their tasks, then
    /// close the shared inbound channel. Only the first call has effect.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), WsError> {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::info!("Shutting down WebSocket manager");
        self.cancel.cancel();

        let sessions = self.registry.snapshot().await;
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }

        self.tracker.close();
        let finished = tokio::time::timeout(timeout, self.tracker.wait()).await;
        self.inbound_tx.lock().await.take();

        match finished {
            Ok(()) => {
                tracing::info!(sessions = count, "WebSocket manager stopped");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(sessions = count, "WebSocket manager shutdown timeout exceeded");
                Err(WsError::ShutdownTimeout(timeout))
            }
        }
    }
}

async fn route(registry: &Registry, dropped: &AtomicU64, message: Outbound) {
    let Outbound {
        session_id,
        payload,
    } = message;

    let Some(session) = registry.get(&session_id).await else {
        tracing::warn!(client_id = %session_id, "Client not found for message");
        return;
    };

    match session.try_send(payload) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(client_id = %session_id, "Client outbound channel full");
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(client_id = %session_id, "Client closed before delivery");
        }
    }
}
