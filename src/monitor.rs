//! Monitoring facade.
//!
//! The [`Monitor`] owns the process-wide class-to-registry table. Application
//! code (or an injection shim wrapping construction and disposal) calls
//! [`Monitor::enroll`] once per instance and [`Monitor::retire`] once on
//! disposal; everything else (sampling loops, transport links, teardown)
//! is managed behind the table.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::time::Duration;
//! use vitals::{Monitor, Sampled};
//!
//! struct Counter {
//!     count: AtomicU64,
//! }
//!
//! impl Sampled for Counter {
//!     fn fields(&self) -> Vec<(String, String)> {
//!         vec![("count".into(), self.count.load(Ordering::Relaxed).to_string())]
//!     }
//! }
//!
//! # async fn demo() {
//! let monitor = Arc::new(Monitor::new("127.0.0.1:8080".parse().unwrap()));
//! let counter = Arc::new(Counter { count: AtomicU64::new(0) });
//! monitor.enroll(&counter, "Counter", Duration::from_secs(1)).await;
//! // ... application runs, counter is sampled every second ...
//! monitor.retire(&counter).await;
//! # }
//! ```

mod registry;

pub use registry::MIN_INTERVAL;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::snapshot::Sampled;
use registry::Registry;

/// Class-to-registry table plus the instance-to-class owner index.
///
/// The owner index lets [`Monitor::retire`] resolve the one registry that
/// holds an instance without touching any other registry's inner mutex: a
/// registry mid-pass holds that mutex across sends, and retirement of one
/// class must never stall behind another class's slow transport.
struct MonitorState {
    registries: HashMap<String, Arc<Registry>>,
    owners: HashMap<usize, String>,
}

/// Process-lifetime table mapping each monitored class to its registry.
///
/// Construct one at process start and share it (`Arc<Monitor>`); the table
/// is an explicit concurrent map under its own lock, not a hidden global.
pub struct Monitor {
    collector_addr: SocketAddr,
    state: Mutex<MonitorState>,
}

impl Monitor {
    /// Create a monitor shipping snapshots to the collector at
    /// `collector_addr`.
    pub fn new(collector_addr: SocketAddr) -> Self {
        Self {
            collector_addr,
            state: Mutex::new(MonitorState {
                registries: HashMap::new(),
                owners: HashMap::new(),
            }),
        }
    }

    /// Enroll an instance under `class`, sampling every `interval`.
    ///
    /// Creates the class registry and starts its sampling loop on first
    /// enrollment, or when the previous registry for the class has already
    /// drained (a drained registry is never recycled, a fresh loop starts).
    /// Re-enrolling an already-enrolled instance is a no-op. Never fails and
    /// never blocks on transport availability; the first enrollment's
    /// `interval` wins for the lifetime of the class registry.
    pub async fn enroll<T: Sampled>(&self, instance: &Arc<T>, class: &str, interval: Duration) {
        let key = Arc::as_ptr(instance) as usize;
        let weak = Arc::downgrade(instance);
        let handle: Weak<dyn Sampled> = weak;

        // Resolve or create the registry under the table lock, but insert
        // the member only after releasing it: the registry's inner mutex is
        // held across whole sampling passes, and waiting on it here would
        // stall enrollment for every other class.
        let (registry, created) = {
            let mut state = self.state.lock().await;
            let resolved = state
                .registries
                .get(class)
                .filter(|r| !r.is_stopped())
                .cloned();
            let pair = match resolved {
                Some(registry) => (registry, false),
                None => {
                    let registry = Arc::new(Registry::new(class, interval, self.collector_addr));
                    state
                        .registries
                        .insert(class.to_owned(), Arc::clone(&registry));
                    (registry, true)
                }
            };
            state.owners.insert(key, class.to_owned());
            pair
        };

        if registry.insert_member(key, handle).await {
            tracing::debug!(class, instance = key, "Instance enrolled");
        } else {
            tracing::debug!(class, instance = key, "Instance already enrolled, ignoring");
        }
        if created {
            // The first member goes in before the loop starts so an initial
            // sampling pass can never observe an empty set.
            registry.spawn_loop();
            tracing::debug!(class, "Registry created");
        }
    }

    /// Retire an instance, removing its handle from the registry that holds
    /// it. Must be called once when the instance is disposed; retiring an
    /// instance that was never enrolled (or already retired) is a no-op.
    ///
    /// A retirement that empties a registry stops its sampling loop (the
    /// loop observes the flag within one interval and releases its
    /// transport link) and drops the registry from the table.
    pub async fn retire<T: Sampled>(&self, instance: &Arc<T>) {
        let key = Arc::as_ptr(instance) as usize;

        // Resolve the owning registry through the index and release the
        // table lock before waiting on that registry's inner mutex.
        let target = {
            let mut state = self.state.lock().await;
            match state.owners.remove(&key) {
                Some(class) => state
                    .registries
                    .get(&class)
                    .cloned()
                    .map(|registry| (class, registry)),
                None => None,
            }
        };
        let Some((class, registry)) = target else {
            return;
        };

        let outcome = registry.remove_member(key).await;
        if outcome.removed {
            tracing::debug!(class, instance = key, "Instance retired");
        }
        if outcome.drained {
            let mut state = self.state.lock().await;
            // Only drop the entry if it still refers to the registry that
            // drained; a concurrent enrollment may have replaced it.
            if let Some(current) = state.registries.get(&class) {
                if Arc::ptr_eq(current, &registry) {
                    state.registries.remove(&class);
                    tracing::info!(class, "Last instance retired, registry drained");
                }
            }
        }
    }

    /// Number of live (upgradable) members currently enrolled under
    /// `class`, or `None` if no registry exists for it.
    pub async fn live_member_count(&self, class: &str) -> Option<usize> {
        let registry = {
            let state = self.state.lock().await;
            state.registries.get(class).cloned()
        };
        match registry {
            Some(registry) => Some(registry.live_member_count().await),
            None => None,
        }
    }

    /// Whether a sampling loop is currently running for `class`.
    pub async fn is_sampling(&self, class: &str) -> bool {
        let state = self.state.lock().await;
        state
            .registries
            .get(class)
            .map(|r| !r.is_stopped())
            .unwrap_or(false)
    }

    /// Number of classes with a registry entry.
    pub async fn class_count(&self) -> usize {
        self.state.lock().await.registries.len()
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("collector_addr", &self.collector_addr)
            .finish_non_exhaustive()
    }
}
