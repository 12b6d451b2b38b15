//! Event infrastructure for sync observers.
//!
//! Status, conflict, and local-change notifications fan out over unbounded
//! channels: `subscribe` hands back a receiver, dropping it unsubscribes.
//! Emission is synchronous and preserves order per subscriber, so an
//! observer that sees a status change has already been handed the conflict
//! list that preceded it. A slow subscriber only grows its own queue and
//! never blocks the engine.

use crate::resource::{Conflict, SyncResource, SyncStatus};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Events emitted by a synchronizer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The status changed. Fired exactly once per transition.
    StatusChanged {
        resource: SyncResource,
        status: SyncStatus,
    },
    /// The conflict list was replaced.
    ConflictsChanged {
        resource: SyncResource,
        conflicts: Vec<Conflict>,
    },
    /// A local change would alter the remote state; the outer orchestrator
    /// should drive a sync round.
    LocalChange { resource: SyncResource },
}

/// Channel fan-out for sync events.
///
/// Each subscriber owns an unbounded queue; queues whose receiver is gone
/// are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a subscription. Events emitted from now on are queued on the
    /// returned receiver; drop it to unsubscribe.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Queue an event on every live subscription.
    pub fn emit(&self, event: SyncEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(status: SyncStatus) -> SyncEvent {
        SyncEvent::StatusChanged {
            resource: SyncResource::Settings,
            status,
        }
    }

    #[test]
    fn test_conflicts_queue_ahead_of_the_status_flip() {
        // The engine announces the new conflict list before it flips status
        // to conflicted; the bus must hand both to a subscriber in that
        // order so the status event finds the conflicts already visible.
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::ConflictsChanged {
            resource: SyncResource::Settings,
            conflicts: vec![Conflict {
                local: "preview/settings.json.local".into(),
                remote: "preview/settings.json.remote".into(),
            }],
        });
        bus.emit(status_event(SyncStatus::HasConflicts));

        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::ConflictsChanged { conflicts, .. } if conflicts.len() == 1
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::StatusChanged {
                status: SyncStatus::HasConflicts,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gone_subscriber_does_not_stall_the_rest() {
        let bus = EventBus::new();
        let gone = bus.subscribe();
        let mut live = bus.subscribe();
        drop(gone);

        bus.emit(status_event(SyncStatus::Syncing));
        bus.emit(status_event(SyncStatus::Idle));

        assert!(matches!(
            live.try_recv().unwrap(),
            SyncEvent::StatusChanged {
                status: SyncStatus::Syncing,
                ..
            }
        ));
        assert!(matches!(
            live.try_recv().unwrap(),
            SyncEvent::StatusChanged {
                status: SyncStatus::Idle,
                ..
            }
        ));
    }

    #[test]
    fn test_late_subscriber_sees_no_history() {
        // Subscriptions observe transitions, not state: whoever needs the
        // current status asks the engine, the bus never replays.
        let bus = EventBus::new();
        bus.emit(status_event(SyncStatus::Syncing));

        let mut rx = bus.subscribe();
        bus.emit(status_event(SyncStatus::Idle));

        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::StatusChanged {
                status: SyncStatus::Idle,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(status_event(SyncStatus::Syncing));
        bus.emit(SyncEvent::LocalChange {
            resource: SyncResource::Snippets,
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::ConflictsChanged {
            resource: SyncResource::Settings,
            conflicts: vec![Conflict {
                local: "local-uri".into(),
                remote: "remote-uri".into(),
            }],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"conflictsChanged\""));
        assert!(json.contains("\"resource\":\"settings\""));
        assert!(json.contains("\"local\":\"local-uri\""));
    }
}
