//! Events are collected while reconciling and published once the status write went through.

use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    pub action: String,
}

#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<RecordedEvent>,
}

impl EventBuffer {
    pub fn normal(&mut self, reason: &str, message: impl Into<String>) {
        self.push(EventKind::Normal, reason, message.into());
    }

    pub fn warning(&mut self, reason: &str, message: impl Into<String>) {
        self.push(EventKind::Warning, reason, message.into());
    }

    fn push(&mut self, kind: EventKind, reason: &str, message: String) {
        self.events.push(RecordedEvent {
            kind,
            reason: reason.to_string(),
            message,
            action: reason.to_string(),
        });
    }

    /// Move the events of `other` behind ours
    pub fn append(&mut self, other: &mut EventBuffer) {
        self.events.append(&mut other.events);
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn reasons(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.reason.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Send every buffered event; a failed publish is logged and does not fail the reconcile
    pub async fn publish(self, recorder: &Recorder) {
        for event in self.events {
            let type_ = match event.kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            };
            let result = recorder
                .publish(Event {
                    type_,
                    reason: event.reason.clone(),
                    note: Some(event.message),
                    action: event.action,
                    secondary: None,
                })
                .await;
            if let Err(e) = result {
                warn!(reason = event.reason, "failed to publish event: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_in_order() {
        let mut events = EventBuffer::default();
        events.normal("Processing", "Start to restart: Pod/a in Component: mysql");
        events.warning("Failed", "Failed to restart: Pod/b in Component: mysql");

        assert_eq!(events.reasons(), vec!["Processing", "Failed"]);
        assert_eq!(events.events()[1].kind, EventKind::Warning);
    }
}
