//! Shared setup for the domain integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use common::NaturalId;
use domain::{BroadcastChangeBus, ChangeKind, ChangedEvent, Persistence};
use row_store::InMemoryRowStore;
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An in-memory store, the factories wired to it, and a subscription to
/// every change event they publish.
pub struct Harness {
    pub store: Arc<InMemoryRowStore>,
    pub persistence: Persistence,
    events: broadcast::Receiver<ChangedEvent>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let store = Arc::new(InMemoryRowStore::new());
        let bus = BroadcastChangeBus::new(64);
        let events = bus.subscribe();
        let persistence = Persistence::new(store.clone(), Arc::new(bus));
        Self {
            store,
            persistence,
            events,
        }
    }

    /// Events published since the last call.
    pub fn drain(&mut self) -> Vec<ChangedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn writes(&self) -> usize {
        self.store.write_count().await
    }
}

pub fn nid(value: &str) -> NaturalId {
    NaturalId::from(value)
}

/// `(event type, kind, natural id)` for compact assertions.
pub fn summary(events: &[ChangedEvent]) -> Vec<(&'static str, ChangeKind, String)> {
    events
        .iter()
        .map(|event| {
            (
                event.event_type(),
                event.kind(),
                event
                    .natural_id()
                    .map(|id| id.as_str().to_owned())
                    .unwrap_or_default(),
            )
        })
        .collect()
}
