//! Detached liveness pinger.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::AgentRegistry;
use crate::types::AgentKey;

/// Why the heartbeat stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    Cancelled,
    /// The next ping would land past the agent's deadline.
    Deadline,
    /// The registry no longer considers the agent running.
    Refused,
    /// The store could not be reached.
    Failed,
}

/// Ping every `period` until cancelled, refused, or the deadline is near.
///
/// Runs independently of the agent's main loop, so a wedged loop keeps
/// looking alive until the deadline. A refused ping cancels `lost` so the
/// loop can stop.
pub fn spawn_heartbeat(
    registry: AgentRegistry,
    key: AgentKey,
    period: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    lost: CancellationToken,
) -> JoinHandle<HeartbeatExit> {
    tokio::spawn(async move {
        loop {
            match registry.ping(&key, period).await {
                Ok(true) => tracing::debug!(agent = %key, "heartbeat"),
                Ok(false) => {
                    tracing::warn!("heartbeat_refused: agent={}", key);
                    lost.cancel();
                    return HeartbeatExit::Refused;
                }
                Err(e) => {
                    tracing::error!("heartbeat_failed: agent={}, error={}", key, e);
                    return HeartbeatExit::Failed;
                }
            }
            if deadline.is_some_and(|end| end < Instant::now() + period) {
                return HeartbeatExit::Deadline;
            }
            tokio::select! {
                _ = cancel.cancelled() => return HeartbeatExit::Cancelled,
                _ = tokio::time::sleep(period) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::registry::attrs;
    use crate::store::{Attributes, Database, MemoryTable};
    use std::sync::Arc;

    async fn registered() -> (AgentRegistry, AgentKey) {
        let registry = AgentRegistry::new(Database::new("agents", Arc::new(MemoryTable::new())));
        let key = AgentKey::from_string("n1".to_string()).unwrap();
        let mut fields = Attributes::new();
        fields.insert(attrs::STATUS.into(), "running".into());
        registry.register(&key, fields).await.unwrap();
        (registry, key)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_cancelled() {
        let (registry, key) = registered().await;
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(
            registry,
            key,
            Duration::from_secs(10),
            None,
            cancel.clone(),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_before_deadline() {
        let (registry, key) = registered().await;
        let deadline = Instant::now() + Duration::from_secs(25);
        let handle = spawn_heartbeat(
            registry,
            key,
            Duration::from_secs(10),
            Some(deadline),
            CancellationToken::new(),
            CancellationToken::new(),
        );
        assert_eq!(handle.await.unwrap(), HeartbeatExit::Deadline);
        assert!(Instant::now() >= deadline - Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_refused() {
        let (registry, key) = registered().await;
        let lost = CancellationToken::new();
        let handle = spawn_heartbeat(
            registry.clone(),
            key.clone(),
            Duration::from_secs(10),
            None,
            CancellationToken::new(),
            lost.clone(),
        );
        registry
            .database()
            .set(&crate::store::Key::name(key.as_str()), attrs::STATUS, "unavailable")
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), HeartbeatExit::Refused);
        assert!(lost.is_cancelled());
    }
}
