//! Idle endpoint eviction.
//!
//! A single scheduler scans every registered endpoint once per second and
//! closes any that has been silent longer than its transport's idle timeout.
//! MQTT endpoints are exempt; the broker owns their liveness.

use crate::registry::SessionRegistry;
use railconf::LimitsConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(registry: Arc<SessionRegistry>, limits: LimitsConfig, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        for endpoint in registry.all_endpoints() {
            let Some(timeout) = endpoint.transport.idle_timeout(&limits) else {
                continue;
            };
            if endpoint.idle_for() > timeout {
                info!(
                    id = %endpoint.id,
                    transport = %endpoint.transport,
                    "evicting idle endpoint"
                );
                endpoint.close("idle timeout");
                registry.remove_endpoint(&endpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, EndpointRole, TransportKind};

    #[tokio::test]
    async fn idle_endpoint_is_evicted_within_grace() {
        let registry = SessionRegistry::new();
        let mut limits = LimitsConfig::default();
        limits.ws_idle_secs = 1;

        let endpoint = Endpoint::new("T1", EndpointRole::Train, TransportKind::Ws, &limits);
        registry.add_train("T1", TransportKind::Ws, Arc::clone(&endpoint));

        let cancel = CancellationToken::new();
        let scan = tokio::spawn(run(Arc::clone(&registry), limits, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert!(registry.list_trains().is_empty());
        assert!(endpoint.cancellation().is_cancelled());

        cancel.cancel();
        scan.await.unwrap();
    }

    #[tokio::test]
    async fn active_endpoint_survives() {
        let registry = SessionRegistry::new();
        let mut limits = LimitsConfig::default();
        limits.ws_idle_secs = 1;

        let endpoint = Endpoint::new("T1", EndpointRole::Train, TransportKind::Ws, &limits);
        registry.add_train("T1", TransportKind::Ws, Arc::clone(&endpoint));

        let cancel = CancellationToken::new();
        let scan = tokio::spawn(run(Arc::clone(&registry), limits, cancel.clone()));

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            endpoint.touch();
        }
        assert_eq!(registry.list_trains(), vec!["T1"]);

        cancel.cancel();
        scan.await.unwrap();
    }

    #[tokio::test]
    async fn mqtt_endpoints_are_exempt() {
        let registry = SessionRegistry::new();
        let mut limits = LimitsConfig::default();
        limits.ws_idle_secs = 1;
        limits.quic_idle_secs = 1;

        let endpoint = Endpoint::new("T1", EndpointRole::Train, TransportKind::Mqtt, &limits);
        registry.add_train("T1", TransportKind::Mqtt, endpoint);

        let cancel = CancellationToken::new();
        let scan = tokio::spawn(run(Arc::clone(&registry), limits, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(registry.list_trains(), vec!["T1"]);

        cancel.cancel();
        scan.await.unwrap();
    }
}
