//! The session registry: the single authoritative routing table.
//!
//! One owned value shared by `Arc`, passed into every transport; no ambient
//! globals. Mutators serialise behind one mutex; the hot path reads
//! snapshots. Registry changes surface as typed [`RegistryEvent`]s on a
//! broadcast channel so transports can react without cross-thread callbacks.
//!
//! Stream gating follows the subscriber-set transitions: when a train's
//! subscriber set goes empty -> non-empty a `StartSending` event fires, and
//! non-empty -> empty fires `StopSending`.

use crate::endpoint::{Endpoint, TransportKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info};

/// Typed registry change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A train became reachable on its first transport.
    TrainJoined { train_id: String },
    /// A train's last transport went away.
    TrainGone { train_id: String },
    /// A console's last transport went away.
    ConsoleGone { console_id: String },
    Bound { console_id: String, train_id: String },
    Unbound { console_id: String, train_id: String },
    /// The train gained its first subscriber.
    StartSending { train_id: String },
    /// The train lost its last subscriber.
    StopSending { train_id: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown train: {0}")]
    UnknownTrain(String),
}

type EndpointMap = HashMap<TransportKind, Arc<Endpoint>>;

#[derive(Default)]
struct Inner {
    trains: HashMap<String, EndpointMap>,
    consoles: HashMap<String, EndpointMap>,
    console_to_train: HashMap<String, String>,
    train_to_consoles: HashMap<String, BTreeSet<String>>,
}

/// Process-wide session state. See module docs.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            events,
        })
    }

    /// Subscribe to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, events: Vec<RegistryEvent>) {
        for event in events {
            // No receivers is fine; events are best-effort notifications.
            let _ = self.events.send(event);
        }
    }

    /// Register a train endpoint on one transport. Idempotent: a second
    /// registration on the same transport replaces the handle.
    pub fn add_train(&self, train_id: &str, transport: TransportKind, endpoint: Arc<Endpoint>) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().expect("registry poisoned");
            let is_new = !inner.trains.contains_key(train_id);
            inner
                .trains
                .entry(train_id.to_string())
                .or_default()
                .insert(transport, endpoint);
            if is_new {
                info!(train_id, %transport, "train joined");
                events.push(RegistryEvent::TrainJoined {
                    train_id: train_id.to_string(),
                });
            }
            inner.verify(train_id);
        }
        self.emit(events);
    }

    /// Remove a train's endpoint on one transport. When the last transport
    /// goes away every console bound to the train is unbound.
    pub fn remove_train(&self, train_id: &str, transport: TransportKind) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().expect("registry poisoned");
            let gone = match inner.trains.get_mut(train_id) {
                Some(map) => {
                    map.remove(&transport);
                    map.is_empty()
                }
                None => return,
            };
            if !gone {
                inner.verify(train_id);
                return;
            }

            inner.trains.remove(train_id);
            if let Some(consoles) = inner.train_to_consoles.remove(train_id) {
                for console_id in consoles {
                    inner.console_to_train.remove(&console_id);
                    events.push(RegistryEvent::Unbound {
                        console_id,
                        train_id: train_id.to_string(),
                    });
                }
            }
            info!(train_id, "train gone");
            events.push(RegistryEvent::TrainGone {
                train_id: train_id.to_string(),
            });
            inner.verify(train_id);
        }
        self.emit(events);
    }

    /// Register a console endpoint on one transport. Idempotent.
    pub fn add_console(&self, console_id: &str, transport: TransportKind, endpoint: Arc<Endpoint>) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner
            .consoles
            .entry(console_id.to_string())
            .or_default()
            .insert(transport, endpoint);
        info!(console_id, %transport, "console joined");
    }

    /// Remove a console's endpoint on one transport; the last removal also
    /// dissolves its binding.
    pub fn remove_console(&self, console_id: &str, transport: TransportKind) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().expect("registry poisoned");
            let gone = match inner.consoles.get_mut(console_id) {
                Some(map) => {
                    map.remove(&transport);
                    map.is_empty()
                }
                None => return,
            };
            if !gone {
                return;
            }
            inner.consoles.remove(console_id);
            info!(console_id, "console gone");
            events.push(RegistryEvent::ConsoleGone {
                console_id: console_id.to_string(),
            });
            events.extend(inner.unbind_locked(console_id));
        }
        self.emit(events);
    }

    /// Attach a console to a train. Rebinding moves the console atomically;
    /// binding to the same train again is a no-op.
    pub fn bind(&self, console_id: &str, train_id: &str) -> Result<(), RegistryError> {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().expect("registry poisoned");
            if !inner.trains.contains_key(train_id) {
                return Err(RegistryError::UnknownTrain(train_id.to_string()));
            }
            if inner.console_to_train.get(console_id).map(String::as_str) == Some(train_id) {
                return Ok(());
            }

            events.extend(inner.unbind_locked(console_id));

            inner
                .console_to_train
                .insert(console_id.to_string(), train_id.to_string());
            let subscribers = inner
                .train_to_consoles
                .entry(train_id.to_string())
                .or_default();
            let was_empty = subscribers.is_empty();
            subscribers.insert(console_id.to_string());

            info!(console_id, train_id, "bound");
            events.push(RegistryEvent::Bound {
                console_id: console_id.to_string(),
                train_id: train_id.to_string(),
            });
            if was_empty {
                events.push(RegistryEvent::StartSending {
                    train_id: train_id.to_string(),
                });
            }
            inner.verify(train_id);
        }
        self.emit(events);
        Ok(())
    }

    /// Detach a console from its train; a no-op for unbound consoles.
    pub fn unbind(&self, console_id: &str) {
        let events = {
            let mut inner = self.inner.lock().expect("registry poisoned");
            inner.unbind_locked(console_id)
        };
        self.emit(events);
    }

    /// Snapshot of the consoles bound to a train; safe to iterate lock-free.
    pub fn subscribers_of(&self, train_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .train_to_consoles
            .get(train_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn train_of(&self, console_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.console_to_train.get(console_id).cloned()
    }

    pub fn list_trains(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        let mut trains: Vec<String> = inner.trains.keys().cloned().collect();
        trains.sort();
        trains
    }

    pub fn has_trains(&self) -> bool {
        !self.inner.lock().expect("registry poisoned").trains.is_empty()
    }

    pub fn console_count(&self) -> usize {
        self.inner.lock().expect("registry poisoned").consoles.len()
    }

    /// Highest-preference endpoint for a train.
    pub fn train_endpoint(&self, train_id: &str) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("registry poisoned");
        best_endpoint(inner.trains.get(train_id), false)
    }

    /// The train's endpoint on one specific transport, if registered.
    pub fn train_on_transport(
        &self,
        train_id: &str,
        transport: TransportKind,
    ) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.trains.get(train_id)?.get(&transport).cloned()
    }

    /// Highest-preference endpoint for a console.
    pub fn console_endpoint(&self, console_id: &str) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("registry poisoned");
        best_endpoint(inner.consoles.get(console_id), false)
    }

    /// Highest-preference endpoint for media fan-out: never MQTT.
    pub fn console_media_endpoint(&self, console_id: &str) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("registry poisoned");
        best_endpoint(inner.consoles.get(console_id), true)
    }

    /// Every console endpoint on every transport except MQTT; used for fleet
    /// notifications.
    pub fn all_console_media_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .consoles
            .values()
            .filter_map(|map| best_endpoint(Some(map), true))
            .collect()
    }

    /// Every registered endpoint; used by the liveness scan.
    pub fn all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .trains
            .values()
            .chain(inner.consoles.values())
            .flat_map(|map| map.values().cloned())
            .collect()
    }

    /// Remove a specific endpoint after a send failure or idle timeout.
    pub fn remove_endpoint(&self, endpoint: &Endpoint) {
        use crate::endpoint::EndpointRole;
        match endpoint.role {
            EndpointRole::Train => self.remove_train(&endpoint.id, endpoint.transport),
            EndpointRole::Console => self.remove_console(&endpoint.id, endpoint.transport),
        }
    }
}

impl Inner {
    /// Unbind under the lock, returning the events to emit after unlocking.
    fn unbind_locked(&mut self, console_id: &str) -> Vec<RegistryEvent> {
        let Some(train_id) = self.console_to_train.remove(console_id) else {
            return Vec::new();
        };
        let mut events = vec![RegistryEvent::Unbound {
            console_id: console_id.to_string(),
            train_id: train_id.clone(),
        }];
        if let Some(set) = self.train_to_consoles.get_mut(&train_id) {
            set.remove(console_id);
            if set.is_empty() {
                self.train_to_consoles.remove(&train_id);
                events.push(RegistryEvent::StopSending {
                    train_id: train_id.clone(),
                });
            }
        }
        info!(console_id, train_id, "unbound");
        self.verify(&train_id);
        events
    }

    /// Bidirectional index consistency. A violation is a programmer error;
    /// the process aborts rather than route on a corrupt table.
    fn verify(&self, context: &str) {
        for (console_id, train_id) in &self.console_to_train {
            let ok = self
                .train_to_consoles
                .get(train_id)
                .is_some_and(|set| set.contains(console_id));
            if !ok {
                error!(console_id, train_id, context, "registry invariant violated");
                std::process::abort();
            }
        }
        for (train_id, consoles) in &self.train_to_consoles {
            if consoles.is_empty() {
                error!(train_id, context, "registry invariant violated: empty subscriber set");
                std::process::abort();
            }
            for console_id in consoles {
                if self.console_to_train.get(console_id) != Some(train_id) {
                    error!(console_id, train_id, context, "registry invariant violated");
                    std::process::abort();
                }
            }
        }
    }
}

fn best_endpoint(map: Option<&EndpointMap>, media: bool) -> Option<Arc<Endpoint>> {
    map?.iter()
        .filter(|(kind, _)| !media || **kind != TransportKind::Mqtt)
        .max_by_key(|(kind, _)| **kind)
        .map(|(_, endpoint)| Arc::clone(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointRole;

    fn limits() -> railconf::LimitsConfig {
        railconf::LimitsConfig::default()
    }

    fn train(id: &str, transport: TransportKind) -> Arc<Endpoint> {
        Endpoint::new(id, EndpointRole::Train, transport, &limits())
    }

    fn console(id: &str, transport: TransportKind) -> Arc<Endpoint> {
        Endpoint::new(id, EndpointRole::Console, transport, &limits())
    }

    fn drain(rx: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn bind_unknown_train_fails() {
        let registry = SessionRegistry::new();
        registry.add_console("C1", TransportKind::Ws, console("C1", TransportKind::Ws));
        assert_eq!(
            registry.bind("C1", "T1"),
            Err(RegistryError::UnknownTrain("T1".into()))
        );
    }

    #[test]
    fn bind_and_subscribers() {
        let registry = SessionRegistry::new();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.add_console("C1", TransportKind::Ws, console("C1", TransportKind::Ws));
        registry.add_console("C2", TransportKind::Ws, console("C2", TransportKind::Ws));

        registry.bind("C1", "T1").unwrap();
        registry.bind("C2", "T1").unwrap();

        assert_eq!(registry.subscribers_of("T1"), vec!["C1", "C2"]);
        assert_eq!(registry.train_of("C1").as_deref(), Some("T1"));
    }

    #[test]
    fn bind_twice_is_idempotent() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.bind("C1", "T1").unwrap();
        drain(&mut rx);

        registry.bind("C1", "T1").unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.subscribers_of("T1"), vec!["C1"]);
    }

    #[test]
    fn start_stop_on_subscriber_transitions() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        drain(&mut rx);

        registry.bind("C1", "T1").unwrap();
        let events = drain(&mut rx);
        assert!(events.contains(&RegistryEvent::StartSending { train_id: "T1".into() }));

        // Second subscriber: no second START
        registry.bind("C2", "T1").unwrap();
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, RegistryEvent::StartSending { .. })));

        registry.unbind("C1");
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, RegistryEvent::StopSending { .. })));

        registry.unbind("C2");
        let events = drain(&mut rx);
        assert!(events.contains(&RegistryEvent::StopSending { train_id: "T1".into() }));
    }

    #[test]
    fn rebind_moves_console() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.add_train("T2", TransportKind::Ws, train("T2", TransportKind::Ws));
        registry.bind("C1", "T1").unwrap();
        drain(&mut rx);

        registry.bind("C1", "T2").unwrap();
        let events = drain(&mut rx);

        assert_eq!(registry.train_of("C1").as_deref(), Some("T2"));
        assert!(registry.subscribers_of("T1").is_empty());
        assert!(events.contains(&RegistryEvent::StopSending { train_id: "T1".into() }));
        assert!(events.contains(&RegistryEvent::StartSending { train_id: "T2".into() }));
    }

    #[test]
    fn remove_train_unbinds_all_consoles() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.bind("C1", "T1").unwrap();
        registry.bind("C2", "T1").unwrap();
        drain(&mut rx);

        registry.remove_train("T1", TransportKind::Ws);
        let events = drain(&mut rx);

        assert!(registry.train_of("C1").is_none());
        assert!(registry.train_of("C2").is_none());
        assert!(registry.list_trains().is_empty());
        assert!(events.contains(&RegistryEvent::TrainGone { train_id: "T1".into() }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RegistryEvent::Unbound { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn remove_train_twice_equals_once() {
        let registry = SessionRegistry::new();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.remove_train("T1", TransportKind::Ws);
        registry.remove_train("T1", TransportKind::Ws);
        assert!(registry.list_trains().is_empty());
    }

    #[test]
    fn unbind_unbound_console_is_noop() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.unbind("C1");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn multihomed_train_survives_single_transport_loss() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.add_train("T1", TransportKind::Quic, train("T1", TransportKind::Quic));
        registry.bind("C1", "T1").unwrap();
        drain(&mut rx);

        registry.remove_train("T1", TransportKind::Ws);
        assert_eq!(registry.train_of("C1").as_deref(), Some("T1"));
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, RegistryEvent::TrainGone { .. })));
    }

    #[test]
    fn preferred_endpoint_ranks_quic_over_ws() {
        let registry = SessionRegistry::new();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.add_train("T1", TransportKind::Quic, train("T1", TransportKind::Quic));

        let endpoint = registry.train_endpoint("T1").unwrap();
        assert_eq!(endpoint.transport, TransportKind::Quic);
    }

    #[test]
    fn media_endpoint_never_mqtt() {
        let registry = SessionRegistry::new();
        registry.add_console("C1", TransportKind::Mqtt, console("C1", TransportKind::Mqtt));
        assert!(registry.console_media_endpoint("C1").is_none());

        registry.add_console("C1", TransportKind::Ws, console("C1", TransportKind::Ws));
        let endpoint = registry.console_media_endpoint("C1").unwrap();
        assert_eq!(endpoint.transport, TransportKind::Ws);
    }

    #[test]
    fn console_disconnect_dissolves_binding() {
        let registry = SessionRegistry::new();
        registry.add_train("T1", TransportKind::Ws, train("T1", TransportKind::Ws));
        registry.add_console("C1", TransportKind::Ws, console("C1", TransportKind::Ws));
        registry.bind("C1", "T1").unwrap();

        registry.remove_console("C1", TransportKind::Ws);
        assert!(registry.subscribers_of("T1").is_empty());
        assert!(registry.train_of("C1").is_none());
    }
}
