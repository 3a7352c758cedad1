use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::types::{DeviceIdentity, StatusSnapshot};

/// Buffered events per `events()` subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 64;

/// Change notification delivered to stream subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// The session snapshot changed
    StatusChanged(StatusSnapshot),
    /// Identity was (re)read from the Device Information Service
    IdentityUpdated(DeviceIdentity),
}

/// Callback interface for status consumers
///
/// Callbacks run on the session task; keep them short and never block.
pub trait StatusObserver: Send + Sync {
    /// A new snapshot was published
    fn on_status_changed(&self, snapshot: &StatusSnapshot);

    /// Identity was read or refreshed
    fn on_identity_updated(&self, _identity: &DeviceIdentity) {}
}

/// Fan-out of session snapshots
///
/// Holds the latest snapshot for polling, a watch channel for "latest value"
/// consumers, a broadcast stream of every change, and registered observers.
/// Identical consecutive snapshots are published once.
pub struct StatusPublisher {
    latest: watch::Sender<StatusSnapshot>,
    events: broadcast::Sender<StatusEvent>,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
}

impl StatusPublisher {
    /// Publisher starting from the disconnected default snapshot
    #[must_use]
    pub fn new() -> Self {
        let (latest, _) = watch::channel(StatusSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            latest,
            events,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.latest.borrow().clone()
    }

    /// Receiver that always holds the latest snapshot
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.latest.subscribe()
    }

    /// Stream of every change published after this call
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Register an observer; it receives changes published after registration
    pub fn add_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }

    /// Publish a snapshot; returns `false` when it equals the previous one
    pub fn publish(&self, snapshot: StatusSnapshot) -> bool {
        let changed = self.latest.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });

        if !changed {
            return false;
        }

        debug!(
            "Status: {} ({:?}), speed {}%",
            snapshot.connection, snapshot.phase, snapshot.locomotive.speed_percent
        );

        for observer in self.observer_list() {
            observer.on_status_changed(&snapshot);
        }
        // no receivers is fine
        let _ = self.events.send(StatusEvent::StatusChanged(snapshot));
        true
    }

    /// Announce a freshly read identity
    pub fn publish_identity(&self, identity: &DeviceIdentity) {
        for observer in self.observer_list() {
            observer.on_identity_updated(identity);
        }
        let _ = self
            .events
            .send(StatusEvent::IdentityUpdated(identity.clone()));
    }

    fn observer_list(&self) -> Vec<Arc<dyn StatusObserver>> {
        self.observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("latest", &*self.latest.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionState, SessionPhase};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<ConnectionState>>,
        identities: Mutex<Vec<DeviceIdentity>>,
    }

    impl StatusObserver for Recorder {
        fn on_status_changed(&self, snapshot: &StatusSnapshot) {
            self.states.lock().unwrap().push(snapshot.connection);
        }

        fn on_identity_updated(&self, identity: &DeviceIdentity) {
            self.identities.lock().unwrap().push(identity.clone());
        }
    }

    fn connected() -> StatusSnapshot {
        StatusSnapshot {
            connection: ConnectionState::Connected,
            phase: SessionPhase::Ready,
            ..StatusSnapshot::default()
        }
    }

    #[test]
    fn test_identical_snapshots_published_once() {
        let publisher = StatusPublisher::new();
        let recorder = Arc::new(Recorder::default());
        publisher.add_observer(recorder.clone());

        assert!(publisher.publish(connected()));
        assert!(!publisher.publish(connected()));
        assert!(publisher.publish(StatusSnapshot::default()));

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![ConnectionState::Connected, ConnectionState::Disconnected]
        );
        assert_eq!(publisher.snapshot(), StatusSnapshot::default());
    }

    #[tokio::test]
    async fn test_event_stream_and_watch() {
        let publisher = StatusPublisher::new();
        let mut events = publisher.events();
        let mut watch = publisher.watch();

        publisher.publish(connected());
        let identity = DeviceIdentity {
            model_number: Some("LC-2-8-0".to_string()),
            ..DeviceIdentity::default()
        };
        publisher.publish_identity(&identity);

        assert_eq!(
            events.recv().await.unwrap(),
            StatusEvent::StatusChanged(connected())
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StatusEvent::IdentityUpdated(identity)
        );

        assert!(watch.has_changed().unwrap());
        assert!(watch.borrow_and_update().is_connected());
    }

    #[test]
    fn test_late_observer_sees_only_new_changes() {
        let publisher = StatusPublisher::new();
        publisher.publish(connected());

        let recorder = Arc::new(Recorder::default());
        publisher.add_observer(recorder.clone());
        publisher.publish_identity(&DeviceIdentity::default());

        assert!(recorder.states.lock().unwrap().is_empty());
        assert_eq!(recorder.identities.lock().unwrap().len(), 1);
    }
}
