//! Supervised connection to the generation backend.
//!
//! [`SessionManager`] owns the single active [`Session`]: one socket to
//! the backend, opened on demand, replaced when it is found not open, and
//! closed on teardown. A stale session is always closed before its
//! replacement is created, and concurrent callers of
//! [`SessionManager::acquire`] share one opening attempt.
//!
//! Session state changes are published on a [`watch`] channel
//! ([`SessionManager::health`]) so display collaborators learn about an
//! errored session without polling the manager.
//!
//! ```text
//! idle -> connecting -> open
//!    connecting | open -> errored   (socket error, close, timeout)
//!    connecting | open | errored -> closed   (teardown)
//! ```

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use imagegen_core::types::Timestamp;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::SocketConnector;
use crate::processor::{process_frames, SessionMessage};
use crate::readiness::{wait_until_open, Readiness, ReadinessConfig};

/// Broadcast channel capacity for decoded session messages.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting | Open, Errored)
                | (Connecting | Open | Errored, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// Snapshot published on the health observable.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHealth {
    /// The session this snapshot describes; `None` before the first one.
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    /// Reason for the last `errored` transition.
    pub detail: Option<String>,
}

impl SessionHealth {
    fn idle() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            detail: None,
        }
    }
}

/// Errors surfaced by [`SessionManager::acquire`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// The socket did not open within the wait budget.
    #[error("Backend connection did not open within {}s", .budget.as_secs())]
    ConnectionTimeout { budget: Duration },

    /// The socket could not be opened at all.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// State shared between a session handle and its socket task.
struct SessionShared {
    id: Uuid,
    state: watch::Sender<SessionState>,
    last_error: StdMutex<Option<String>>,
    health: Arc<watch::Sender<SessionHealth>>,
}

impl SessionShared {
    /// Apply a state transition, publishing it on the health observable
    /// if this session is still the one being reported.
    fn transition(&self, next: SessionState, detail: Option<String>) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if !changed {
            return false;
        }

        if next == SessionState::Errored {
            if let Ok(mut last) = self.last_error.lock() {
                last.clone_from(&detail);
            }
            tracing::warn!(session_id = %self.id, detail = ?detail, "Session errored");
        } else {
            tracing::info!(session_id = %self.id, state = %next, "Session state changed");
        }

        self.health.send_if_modified(|health| {
            if health.session_id != Some(self.id) {
                return false;
            }
            health.state = next;
            health.detail = detail;
            true
        });
        true
    }
}

/// Handle to one socket connection.
///
/// Only [`SessionManager`] changes a session's state; executors borrow
/// sessions for the duration of one call.
pub struct Session {
    shared: Arc<SessionShared>,
    client_id: String,
    endpoint: String,
    created_at: Timestamp,
    messages: broadcast::Sender<SessionMessage>,
    cancel: CancellationToken,
}

impl Session {
    /// Create the session and spawn the task that opens and reads its socket.
    fn open(
        connector: Arc<dyn SocketConnector>,
        health: Arc<watch::Sender<SessionHealth>>,
    ) -> Arc<Self> {
        let id = Uuid::now_v7();
        let (state, _) = watch::channel(SessionState::Idle);
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let shared = Arc::new(SessionShared {
            id,
            state,
            last_error: StdMutex::new(None),
            health,
        });

        shared.health.send_replace(SessionHealth {
            session_id: Some(id),
            state: SessionState::Idle,
            detail: None,
        });
        shared.transition(SessionState::Connecting, None);

        let session = Arc::new(Self {
            shared: Arc::clone(&shared),
            client_id: Uuid::new_v4().to_string(),
            endpoint: connector.endpoint().to_string(),
            created_at: chrono::Utc::now(),
            messages: messages.clone(),
            cancel: CancellationToken::new(),
        });

        let cancel = session.cancel.clone();
        let client_id = session.client_id.clone();
        tokio::spawn(async move {
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = connector.connect(&client_id) => result,
            };
            let mut stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    shared.transition(SessionState::Errored, Some(e.to_string()));
                    return;
                }
            };
            shared.transition(SessionState::Open, None);

            let end = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                end = process_frames(&mut stream, shared.id, &messages) => end,
            };
            shared.transition(SessionState::Errored, Some(end.describe()));
        });

        session
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Client id the backend uses to address this socket.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Reason recorded by the last `errored` transition.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Receive messages arriving on this socket from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionMessage> {
        self.messages.subscribe()
    }

    /// Observe this session's state.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    fn fail(&self, detail: String) {
        self.shared.transition(SessionState::Errored, Some(detail));
        self.cancel.cancel();
    }

    fn close(&self) {
        self.shared.transition(SessionState::Closed, None);
        self.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Owns the lifecycle of the one active backend session.
///
/// Created once at startup; share it via `Arc`.
pub struct SessionManager {
    connector: Arc<dyn SocketConnector>,
    config: ReadinessConfig,
    active: Mutex<Option<Arc<Session>>>,
    health: Arc<watch::Sender<SessionHealth>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn SocketConnector>, config: ReadinessConfig) -> Self {
        let (health, _) = watch::channel(SessionHealth::idle());
        Self {
            connector,
            config,
            active: Mutex::new(None),
            health: Arc::new(health),
        }
    }

    /// Observe session health transitions.
    pub fn health(&self) -> watch::Receiver<SessionHealth> {
        self.health.subscribe()
    }

    pub fn readiness_config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// The active session, whatever its state.
    pub async fn current(&self) -> Option<Arc<Session>> {
        self.active.lock().await.clone()
    }

    /// Whether an active session exists and is open.
    pub async fn is_open(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    /// Return the open session, opening a new one if needed.
    ///
    /// A non-open session is closed before its replacement is created.
    /// The caller waits until the new socket opens or the wait budget
    /// elapses; on timeout the new session is left `errored` for the
    /// next caller to replace. Concurrent callers queue on the same lock
    /// and reuse the session opened by the first.
    pub async fn acquire(&self) -> Result<Arc<Session>, SessionError> {
        let mut active = self.active.lock().await;

        if let Some(session) = active.as_ref() {
            if session.is_open() {
                return Ok(Arc::clone(session));
            }
        }

        if let Some(stale) = active.take() {
            tracing::info!(
                session_id = %stale.id(),
                state = %stale.state(),
                "Replacing non-open session",
            );
            stale.close();
        }

        let session = Session::open(Arc::clone(&self.connector), Arc::clone(&self.health));
        *active = Some(Arc::clone(&session));
        tracing::info!(
            session_id = %session.id(),
            endpoint = %session.endpoint(),
            "Opening backend session",
        );

        match wait_until_open(|| session.state(), &self.config).await {
            Readiness::Open => Ok(session),
            Readiness::Failed(state) => {
                let detail = session
                    .last_error()
                    .unwrap_or_else(|| format!("session entered {state} while opening"));
                Err(SessionError::BackendUnavailable(detail))
            }
            Readiness::TimedOut => {
                let budget = self.config.wait_budget;
                session.fail(format!("not open after {}s", budget.as_secs()));
                Err(SessionError::ConnectionTimeout { budget })
            }
        }
    }

    /// Close the current session and open a fresh one.
    pub async fn reconnect(&self) -> Result<Arc<Session>, SessionError> {
        self.teardown().await;
        self.acquire().await
    }

    /// Close the active session, if any. Idempotent.
    pub async fn teardown(&self) {
        if let Some(session) = self.active.lock().await.take() {
            tracing::info!(session_id = %session.id(), "Tearing down backend session");
            session.close();
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("endpoint", &self.connector.endpoint())
            .field("config", &self.config)
            .finish()
    }
}
