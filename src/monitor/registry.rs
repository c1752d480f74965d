//! Per-class registry owning the sampling loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::snapshot::{Sampled, Snapshot};
use crate::transport::TransportLink;

/// Minimum allowed sampling interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of removing a member from a registry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoveOutcome {
    /// Whether the handle was actually present.
    pub removed: bool,
    /// Whether this removal emptied the registry (it is now stopping).
    pub drained: bool,
}

/// Member set plus the transport link, behind one mutex.
///
/// A single lock covers the whole sampling pass (enumerate + encode + send),
/// so enrollment and retirement serialize against sampling and no two sends
/// for the same registry ever race.
struct RegistryInner {
    members: HashMap<usize, Weak<dyn Sampled>>,
    link: Option<TransportLink>,
}

/// Per-class owner of the member set and its sampling loop.
///
/// A registry is single-use: once its stop flag is set (by draining or by a
/// transport failure) it never samples again. The facade replaces drained
/// registries with fresh ones on the next enrollment.
pub(crate) struct Registry {
    class: String,
    interval: Duration,
    collector_addr: SocketAddr,
    inner: Mutex<RegistryInner>,
    stopped: AtomicBool,
}

impl Registry {
    /// Create a registry for `class`. The sampling loop is started
    /// separately with [`Registry::spawn_loop`], after the first member has
    /// been inserted.
    pub(crate) fn new(class: &str, interval: Duration, collector_addr: SocketAddr) -> Self {
        let interval = if interval < MIN_INTERVAL {
            tracing::warn!(
                class,
                min_interval = ?MIN_INTERVAL,
                "Sampling interval below minimum, clamping"
            );
            MIN_INTERVAL
        } else {
            interval
        };

        Self {
            class: class.to_owned(),
            interval,
            collector_addr,
            inner: Mutex::new(RegistryInner {
                members: HashMap::new(),
                link: None,
            }),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether the stop flag has been set. Once true, stays true.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Set the stop flag. The sampling loop observes it at the top of its
    /// next cycle, at most one interval later.
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!(class = %self.class, "Registry stop flag set");
        }
    }

    /// Insert a member handle. Returns false if the instance was already
    /// enrolled (the insert is a no-op).
    pub(crate) async fn insert_member(&self, key: usize, handle: Weak<dyn Sampled>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.members.contains_key(&key) {
            return false;
        }
        inner.members.insert(key, handle);
        true
    }

    /// Remove a member handle. Removing an absent handle is a no-op. A
    /// removal that empties the member set sets the stop flag.
    pub(crate) async fn remove_member(&self, key: usize) -> RemoveOutcome {
        let mut inner = self.inner.lock().await;
        let removed = inner.members.remove(&key).is_some();
        let drained = removed && inner.members.is_empty();
        if drained {
            self.stop();
        }
        RemoveOutcome { removed, drained }
    }

    /// Number of members whose backing instance is still alive.
    pub(crate) async fn live_member_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .members
            .values()
            .filter(|handle| handle.strong_count() > 0)
            .count()
    }

    /// Start the sampling loop on its own task.
    pub(crate) fn spawn_loop(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.run().await });
    }

    /// The sampling loop. Runs until the stop flag is observed, then
    /// releases the transport link.
    async fn run(self: Arc<Self>) {
        tracing::info!(class = %self.class, interval = ?self.interval, "Sampling loop started");

        while !self.is_stopped() {
            tokio::time::sleep(self.interval).await;
            if self.is_stopped() {
                break;
            }
            let mut inner = self.inner.lock().await;

            // Open the link lazily so enrollment never blocks on transport
            // availability. A failed connect ends sampling for this class.
            if inner.link.is_none() {
                match TransportLink::open(self.collector_addr).await {
                    Ok(link) => inner.link = Some(link),
                    Err(e) => {
                        tracing::warn!(class = %self.class, error = %e, "Collector unreachable, stopping sampling");
                        self.stop();
                        break;
                    }
                }
            }

            if !self.sample_pass(&mut inner).await {
                break;
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(mut link) = inner.link.take() {
            link.close().await;
        }
        tracing::info!(class = %self.class, "Sampling loop stopped");
    }

    /// One pass over the member set: snapshot, encode and send every live
    /// member, prune dead handles. Returns false when the loop should end.
    async fn sample_pass(&self, inner: &mut RegistryInner) -> bool {
        let RegistryInner { members, link } = inner;
        let Some(link) = link.as_mut() else {
            return false;
        };

        let mut dead = Vec::new();
        for (&key, handle) in members.iter() {
            // Dead handles are skipped and lazily pruned below.
            let Some(instance) = handle.upgrade() else {
                dead.push(key);
                continue;
            };
            let snapshot = Snapshot::capture(&self.class, key as u64, instance.as_ref());
            if let Err(e) = link.send(&snapshot.encode()).await {
                // Fail fast: a broken pipe to the collector ends monitoring
                // for this class rather than buffering unboundedly.
                tracing::warn!(class = %self.class, error = %e, "Snapshot send failed, stopping sampling");
                self.stop();
                return false;
            }
        }

        for key in dead {
            tracing::debug!(class = %self.class, instance = key, "Pruned dead instance handle");
            members.remove(&key);
        }
        if members.is_empty() {
            self.stop();
            return false;
        }
        true
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("class", &self.class)
            .field("interval", &self.interval)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Still;

    impl Sampled for Still {
        fn fields(&self) -> Vec<(String, String)> {
            vec![("state".into(), "still".into())]
        }
    }

    fn unreachable_collector() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    fn key_of<T>(instance: &Arc<T>) -> usize {
        Arc::as_ptr(instance) as usize
    }

    fn handle_of(instance: &Arc<Still>) -> Weak<dyn Sampled> {
        let weak = Arc::downgrade(instance);
        weak
    }

    #[tokio::test]
    async fn test_interval_clamped_to_minimum() {
        let registry = Registry::new("Still", Duration::ZERO, unreachable_collector());
        assert_eq!(registry.interval, MIN_INTERVAL);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_instance() {
        let registry = Registry::new("Still", MIN_INTERVAL, unreachable_collector());
        let instance = Arc::new(Still);
        let handle = handle_of(&instance);

        assert!(registry.insert_member(key_of(&instance), handle.clone()).await);
        assert!(!registry.insert_member(key_of(&instance), handle).await);
        assert_eq!(registry.live_member_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_absent_member_is_noop() {
        let registry = Registry::new("Still", MIN_INTERVAL, unreachable_collector());
        let outcome = registry.remove_member(0xdead).await;
        assert!(!outcome.removed);
        assert!(!outcome.drained);
        assert!(!registry.is_stopped());
    }

    #[tokio::test]
    async fn test_removing_last_member_sets_stop_flag() {
        let registry = Registry::new("Still", MIN_INTERVAL, unreachable_collector());
        let instance = Arc::new(Still);
        let handle = handle_of(&instance);
        registry.insert_member(key_of(&instance), handle).await;

        let outcome = registry.remove_member(key_of(&instance)).await;
        assert!(outcome.removed);
        assert!(outcome.drained);
        assert!(registry.is_stopped());
    }

    #[tokio::test]
    async fn test_unreachable_collector_stops_loop() {
        let registry = Arc::new(Registry::new(
            "Still",
            MIN_INTERVAL,
            unreachable_collector(),
        ));
        let instance = Arc::new(Still);
        let handle = handle_of(&instance);
        registry.insert_member(key_of(&instance), handle).await;
        registry.spawn_loop();

        // First tick attempts the connect, fails, and self-terminates.
        tokio::time::sleep(MIN_INTERVAL * 20).await;
        assert!(registry.is_stopped());
    }

    #[tokio::test]
    async fn test_dropping_instance_prunes_and_stops() {
        let registry = Arc::new(Registry::new(
            "Still",
            MIN_INTERVAL,
            unreachable_collector(),
        ));
        let instance = Arc::new(Still);
        let handle = handle_of(&instance);
        registry.insert_member(key_of(&instance), handle).await;

        drop(instance);
        assert_eq!(registry.live_member_count().await, 0);
    }
}
