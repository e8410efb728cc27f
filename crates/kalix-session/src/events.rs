use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::session::SessionState;
use crate::sync_utils::lock_or_recover;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Transition,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_key: String,
    pub kind: SessionEventKind,
    /// `None` for the event announcing a newly created session.
    pub old_state: Option<SessionState>,
    pub new_state: SessionState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn transition(
        session_key: &str,
        old_state: Option<SessionState>,
        new_state: SessionState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.to_string(),
            kind: SessionEventKind::Transition,
            old_state,
            new_state,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn removed(session_key: &str, state: SessionState) -> Self {
        Self {
            session_key: session_key.to_string(),
            kind: SessionEventKind::Removed,
            old_state: Some(state),
            new_state: state,
            message: "session removed".to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out of session events to channel subscribers.
///
/// Each subscriber owns an unbounded receiver and its own consumption loop.
/// Closed receivers are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<UnboundedSender<SessionEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        let (sender, receiver) = unbounded_channel();
        lock_or_recover(&self.subscribers).push(sender);
        receiver
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut subscribers = lock_or_recover(&self.subscribers);
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock_or_recover(&self.subscribers).len()
    }
}
