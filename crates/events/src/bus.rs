//! Generation events and the broadcast hub that carries them.
//!
//! The executor is the only publisher. Display collaborators hold an
//! [`EventStream`] each; a slow stream loses the oldest events rather
//! than holding up generation.

use chrono::{DateTime, Utc};
use imagegen_core::generation::{JobStatus, Progress};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// GenerationEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// `progress` is `None` until the backend reports a step count
    /// (queued, loading models).
    Progress {
        job_id: Uuid,
        progress: Option<Progress>,
    },

    StatusChanged {
        job_id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
    },

    ArtifactReceived {
        job_id: Uuid,
        mime: String,
        size: usize,
    },
}

impl GenerationEvent {
    /// A status change stamped with the current time.
    pub fn status(job_id: Uuid, status: JobStatus) -> Self {
        GenerationEvent::StatusChanged {
            job_id,
            status,
            at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            GenerationEvent::Progress { job_id, .. }
            | GenerationEvent::StatusChanged { job_id, .. }
            | GenerationEvent::ArtifactReceived { job_id, .. } => *job_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Events buffered per subscriber before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out hub for [`GenerationEvent`]s, shared as `Arc<EventBus>`.
pub struct EventBus {
    sender: broadcast::Sender<GenerationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every live subscriber. Returns how many there
    /// were; publishing with none is not an error.
    pub fn publish(&self, event: GenerationEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Raw broadcast receiver; the caller handles lag.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.sender.subscribe()
    }

    /// Receiver that skips over lag and ends when the bus is dropped.
    pub fn stream(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Lag-tolerant subscription created by [`EventBus::stream`].
pub struct EventStream {
    receiver: broadcast::Receiver<GenerationEvent>,
    missed: u64,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<GenerationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                    tracing::debug!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
