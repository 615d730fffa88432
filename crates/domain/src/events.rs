//! Change notifications published after persisted writes.

use common::NaturalId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{ChildSnapshot, OtherSnapshot, ParentSnapshot};

/// Before and after images of one persisted write.
///
/// `before` is absent for a create and `after` is absent for a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainChangedEvent<S> {
    pub before: Option<S>,
    pub after: Option<S>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl<S> DomainChangedEvent<S> {
    pub fn new(before: Option<S>, after: Option<S>) -> Self {
        Self { before, after }
    }

    pub fn kind(&self) -> ChangeKind {
        match (&self.before, &self.after) {
            (None, _) => ChangeKind::Created,
            (Some(_), Some(_)) => ChangeKind::Updated,
            (Some(_), None) => ChangeKind::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "change")]
pub enum ChangedEvent {
    OtherChanged(DomainChangedEvent<OtherSnapshot>),
    ParentChanged(DomainChangedEvent<ParentSnapshot>),
    ChildChanged(DomainChangedEvent<ChildSnapshot>),
}

impl ChangedEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ChangedEvent::OtherChanged(_) => "OtherChanged",
            ChangedEvent::ParentChanged(_) => "ParentChanged",
            ChangedEvent::ChildChanged(_) => "ChildChanged",
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangedEvent::OtherChanged(e) => e.kind(),
            ChangedEvent::ParentChanged(e) => e.kind(),
            ChangedEvent::ChildChanged(e) => e.kind(),
        }
    }

    pub fn natural_id(&self) -> Option<&NaturalId> {
        match self {
            ChangedEvent::OtherChanged(e) => {
                e.after.as_ref().or(e.before.as_ref()).map(|s| &s.natural_id)
            }
            ChangedEvent::ParentChanged(e) => {
                e.after.as_ref().or(e.before.as_ref()).map(|s| &s.natural_id)
            }
            ChangedEvent::ChildChanged(e) => {
                e.after.as_ref().or(e.before.as_ref()).map(|s| &s.natural_id)
            }
        }
    }
}

/// Receives change events as writes complete.
pub trait ChangePublisher: Send + Sync {
    fn publish(&self, event: ChangedEvent);
}

/// Fan-out publisher backed by a tokio broadcast channel.
///
/// Publishing never blocks; subscribers that fall behind by more than the
/// channel capacity miss the oldest events.
#[derive(Clone)]
pub struct BroadcastChangeBus {
    sender: broadcast::Sender<ChangedEvent>,
}

impl BroadcastChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangedEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastChangeBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ChangePublisher for BroadcastChangeBus {
    fn publish(&self, event: ChangedEvent) {
        metrics::counter!("domain_change_events_total", "event_type" => event.event_type())
            .increment(1);
        tracing::debug!(
            event_type = event.event_type(),
            kind = ?event.kind(),
            natural_id = ?event.natural_id(),
            "publishing change event"
        );
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use row_store::Version;

    use super::*;

    fn other(version: i64) -> OtherSnapshot {
        OtherSnapshot {
            natural_id: NaturalId::from("o"),
            value: None,
            version: Version::new(version),
        }
    }

    #[test]
    fn kind_follows_images() {
        assert_eq!(
            DomainChangedEvent::new(None, Some(other(1))).kind(),
            ChangeKind::Created
        );
        assert_eq!(
            DomainChangedEvent::new(Some(other(1)), Some(other(2))).kind(),
            ChangeKind::Updated
        );
        assert_eq!(
            DomainChangedEvent::new(Some(other(2)), None).kind(),
            ChangeKind::Deleted
        );
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = ChangedEvent::OtherChanged(DomainChangedEvent::new(None, Some(other(1))));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "OtherChanged");
        assert_eq!(json["change"]["after"]["natural_id"], "o");
        assert!(json["change"]["before"].is_null());
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = BroadcastChangeBus::new(8);
        let mut rx = bus.subscribe();
        let event = ChangedEvent::OtherChanged(DomainChangedEvent::new(Some(other(1)), None));

        bus.publish(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(event.natural_id(), Some(&NaturalId::from("o")));
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        BroadcastChangeBus::default()
            .publish(ChangedEvent::OtherChanged(DomainChangedEvent::new(None, None)));
    }
}
