//! Typed publish/subscribe surface for progress engine events.
//!
//! Two ways to observe events:
//! - [`ProgressMonitor::on`](super::ProgressMonitor::on) registers a callback
//!   for one [`MonitorEventKind`]; [`off`](super::ProgressMonitor::off) removes it.
//! - [`ProgressMonitor::subscribe`](super::ProgressMonitor::subscribe) returns a
//!   `broadcast::Receiver` carrying every event.
//!
//! Handlers run on the emitting task after internal locks are released, so a
//! handler may call back into the engine (e.g. cancel the session it was told about).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per broadcast subscriber before lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event discriminant used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorEventKind {
    Timeout,
    StuckDetected,
    ProgressResumed,
    SessionCompleted,
}

/// Lifecycle event emitted by the progress engine.
///
/// `Timeout` and `StuckDetected` are independent signals; either, both, or
/// neither may fire for a session.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// The session outlived its effective timeout. Informational only: the
    /// session stays tracked and the caller decides what to do.
    Timeout {
        session_id: String,
        library: String,
        elapsed: Duration,
    },
    /// No advancing snapshot for longer than the library's stuck threshold.
    /// Fires once per stall episode.
    StuckDetected {
        session_id: String,
        library: String,
        current: u32,
        stalled_for: Duration,
    },
    /// Progress advanced again after a reported stall.
    ProgressResumed { session_id: String, current: u32 },
    /// The session was completed and is no longer tracked.
    SessionCompleted {
        session_id: String,
        success: bool,
        duration: Duration,
        pages_completed: u32,
    },
}

impl MonitorEvent {
    #[must_use]
    pub fn kind(&self) -> MonitorEventKind {
        match self {
            Self::Timeout { .. } => MonitorEventKind::Timeout,
            Self::StuckDetected { .. } => MonitorEventKind::StuckDetected,
            Self::ProgressResumed { .. } => MonitorEventKind::ProgressResumed,
            Self::SessionCompleted { .. } => MonitorEventKind::SessionCompleted,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Timeout { session_id, .. }
            | Self::StuckDetected { session_id, .. }
            | Self::ProgressResumed { session_id, .. }
            | Self::SessionCompleted { session_id, .. } => session_id,
        }
    }
}

/// Callback registered with [`ProgressMonitor::on`](super::ProgressMonitor::on).
pub type EventHandler = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// Handle identifying a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Listener {
    kind: MonitorEventKind,
    handler: EventHandler,
}

pub(crate) struct EventBus {
    next_id: AtomicU64,
    listeners: DashMap<ListenerId, Listener>,
    sender: broadcast::Sender<MonitorEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            listeners: DashMap::new(),
            sender,
        }
    }

    pub(crate) fn on(&self, kind: MonitorEventKind, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, Listener { kind, handler });
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Delivers `event` to matching handlers in registration order, then to subscribers.
    pub(crate) fn emit(&self, event: &MonitorEvent) {
        let kind = event.kind();
        let mut handlers: Vec<(ListenerId, EventHandler)> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .map(|entry| (*entry.key(), Arc::clone(&entry.value().handler)))
            .collect();
        handlers.sort_by_key(|(id, _)| *id);

        trace!(?kind, session_id = event.session_id(), handlers = handlers.len(), "emitting event");
        for (_, handler) in handlers {
            handler(event);
        }

        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}
