//! Instance registry and lifecycle.
//!
//! One concurrent map holds both running instances and port reservations,
//! keyed by a tagged enum. Putting the port sentinel in the same keyspace as
//! instances makes the reservation map the single source of truth for which
//! ports the host considers taken: a port is claimed by inserting its
//! sentinel BEFORE the bind probe runs, so two concurrent cold starts can
//! never both probe the same port and both think it is free.
//!
//! Eviction is driven by a periodic sweep, not per-instance timers. The
//! sweep marks an instance for removal when it has been idle past the idle
//! timeout or alive past the hard TTL, signals its monitor task to shut the
//! child down, and deletes the working directory best-effort.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::HostConfig;
use crate::error::HostError;

// ---------------------------------------------------------------------------
// Running instance
// ---------------------------------------------------------------------------

/// A live plugin instance: an extracted working directory plus the static
/// server process bound to its reserved port.
pub struct RunningInstance {
    pub plugin_id: Uuid,
    pub working_dir: PathBuf,
    pub port: u16,
    /// `None` while spawning, and for synthetic instances in tests.
    pub pid: Option<u32>,
    /// Monotonic birth time, used for the hard TTL.
    pub created_at: Instant,
    /// Wall-clock birth time for the status endpoint.
    pub started_at_ms: i64,
    /// Monotonic time of the last proxied request.
    last_access: Mutex<Instant>,
    pub access_count: AtomicU64,
    /// False until the supervisor confirms readiness; entries that never
    /// flip to true are unusable and get dropped on lookup.
    pub installed: AtomicBool,
    /// Taken (once) by eviction to signal the monitor task.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl RunningInstance {
    pub fn new(
        plugin_id: Uuid,
        working_dir: PathBuf,
        port: u16,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            plugin_id,
            working_dir,
            port,
            pid: None,
            created_at: Instant::now(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            last_access: Mutex::new(Instant::now()),
            access_count: AtomicU64::new(0),
            installed: AtomicBool::new(false),
            shutdown: Mutex::new(Some(shutdown)),
        }
    }

    /// Record a proxied request.
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_access.lock().elapsed()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Fire the shutdown signal. Safe to call more than once; only the
    /// first call delivers.
    pub fn signal_shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKey {
    Plugin(Uuid),
    Port(u16),
}

pub enum RegistryEntry {
    Instance(Arc<RunningInstance>),
    /// Sentinel: the port is spoken for while a cold start is in flight.
    PortReservation,
}

/// Why the sweep decided to evict an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Idle,
    Expired,
    Crashed,
    Shutdown,
}

impl EvictionReason {
    fn as_str(self) -> &'static str {
        match self {
            EvictionReason::Idle => "idle",
            EvictionReason::Expired => "expired",
            EvictionReason::Crashed => "crashed",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

/// Snapshot row for the status endpoint.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub plugin_id: Uuid,
    pub port: u16,
    pub pid: Option<u32>,
    pub started_at_ms: i64,
    pub idle_secs: u64,
    pub age_secs: u64,
    pub access_count: u64,
    pub ready: bool,
}

pub struct InstanceRegistry {
    entries: DashMap<RegistryKey, RegistryEntry>,
    /// Rolling cursor into the port window; wraps within the span.
    next_port_offset: AtomicU16,
    config: HostConfig,
}

impl InstanceRegistry {
    pub fn new(config: HostConfig) -> Self {
        Self {
            entries: DashMap::new(),
            next_port_offset: AtomicU16::new(0),
            config,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Look up a usable cached instance. Entries past the hard TTL or never
    /// marked ready are evicted on the spot and reported as a miss.
    pub fn get(&self, plugin_id: Uuid) -> Option<Arc<RunningInstance>> {
        let instance = match self.entries.get(&RegistryKey::Plugin(plugin_id)) {
            Some(entry) => match entry.value() {
                RegistryEntry::Instance(i) => Arc::clone(i),
                RegistryEntry::PortReservation => return None,
            },
            None => return None,
        };

        if !instance.installed.load(Ordering::Acquire) {
            return None;
        }
        if instance.age() >= self.config.hard_ttl() {
            self.evict(&instance, EvictionReason::Expired);
            return None;
        }
        Some(instance)
    }

    /// Register a ready instance under both its plugin ID and its port.
    /// The port key replaces the reservation sentinel placed by
    /// [`reserve_port`].
    pub fn put(&self, instance: Arc<RunningInstance>) {
        instance.installed.store(true, Ordering::Release);
        self.entries.insert(
            RegistryKey::Port(instance.port),
            RegistryEntry::Instance(Arc::clone(&instance)),
        );
        self.entries.insert(
            RegistryKey::Plugin(instance.plugin_id),
            RegistryEntry::Instance(instance),
        );
    }

    /// Drop an instance's keys without signalling it. Used when the caller
    /// has already handled the process (crash path).
    pub fn remove(&self, plugin_id: Uuid) -> Option<Arc<RunningInstance>> {
        let removed = match self.entries.remove(&RegistryKey::Plugin(plugin_id)) {
            Some((_, RegistryEntry::Instance(i))) => Some(i),
            _ => None,
        };
        if let Some(instance) = &removed {
            self.entries.remove(&RegistryKey::Port(instance.port));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.key(), RegistryKey::Plugin(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Port allocation --

    /// Claim a free port in the configured window.
    ///
    /// A sentinel is inserted under the port's key before the bind probe,
    /// so a port can never be handed to two cold starts at once. The probe
    /// confirms nothing outside the host is already listening; on probe
    /// failure the sentinel is released and the scan moves on.
    pub async fn reserve_port(&self) -> Result<u16, HostError> {
        for _ in 0..self.config.max_port_attempts {
            let offset = self.next_port_offset.fetch_add(1, Ordering::Relaxed)
                % self.config.port_span;
            // A window configured past u16::MAX just yields fewer candidates.
            let Some(port) = self.config.port_base.checked_add(offset) else {
                continue;
            };

            let key = RegistryKey::Port(port);
            {
                let entry = self.entries.entry(key);
                match entry {
                    dashmap::mapref::entry::Entry::Occupied(_) => continue,
                    dashmap::mapref::entry::Entry::Vacant(v) => {
                        v.insert(RegistryEntry::PortReservation);
                    }
                }
            }

            let free = tokio::task::spawn_blocking(move || {
                TcpListener::bind(("127.0.0.1", port)).is_ok()
            })
            .await
            .map_err(|e| HostError::Internal(format!("bind probe task failed: {e}")))?;

            if free {
                tracing::debug!(port, "port reserved");
                return Ok(port);
            }
            self.entries.remove(&key);
        }
        Err(HostError::NoPortAvailable)
    }

    /// Release a reservation that never became an instance (spawn failed).
    pub fn release_port(&self, port: u16) {
        if let dashmap::mapref::entry::Entry::Occupied(o) =
            self.entries.entry(RegistryKey::Port(port))
        {
            if matches!(o.get(), RegistryEntry::PortReservation) {
                o.remove();
            }
        }
    }

    // -- Eviction --

    /// Signal the instance's monitor, drop its keys, and delete its working
    /// directory in the background.
    pub fn evict(&self, instance: &Arc<RunningInstance>, reason: EvictionReason) {
        tracing::info!(
            plugin = %instance.plugin_id,
            port = instance.port,
            reason = reason.as_str(),
            "evicting instance"
        );
        instance.signal_shutdown();
        self.entries.remove(&RegistryKey::Plugin(instance.plugin_id));
        self.entries.remove(&RegistryKey::Port(instance.port));

        let dir = instance.working_dir.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("could not remove {}: {e}", dir.display());
                }
            }
        });
    }

    fn eviction_reason(&self, instance: &RunningInstance) -> Option<EvictionReason> {
        if instance.age() >= self.config.hard_ttl() {
            Some(EvictionReason::Expired)
        } else if instance.idle_for() >= self.config.idle_timeout() {
            Some(EvictionReason::Idle)
        } else {
            None
        }
    }

    /// One sweep pass. Collects candidates first, then evicts, so no map
    /// shard lock is held across an eviction.
    pub fn sweep_once(&self) -> usize {
        let candidates: Vec<(Arc<RunningInstance>, EvictionReason)> = self
            .entries
            .iter()
            .filter_map(|e| match (e.key(), e.value()) {
                (RegistryKey::Plugin(_), RegistryEntry::Instance(i)) => self
                    .eviction_reason(i)
                    .map(|reason| (Arc::clone(i), reason)),
                _ => None,
            })
            .collect();

        let count = candidates.len();
        for (instance, reason) in candidates {
            self.evict(&instance, reason);
        }
        count
    }

    /// Spawn the background sweeper. The handle is detached on drop; abort
    /// it for a clean shutdown.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = registry.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep_once();
                if evicted > 0 {
                    tracing::debug!(evicted, "sweep pass complete");
                }
            }
        })
    }

    /// Evict everything. Used on host shutdown.
    pub fn shutdown_all(&self) {
        let all: Vec<Arc<RunningInstance>> = self
            .entries
            .iter()
            .filter_map(|e| match (e.key(), e.value()) {
                (RegistryKey::Plugin(_), RegistryEntry::Instance(i)) => Some(Arc::clone(i)),
                _ => None,
            })
            .collect();
        for instance in all {
            self.evict(&instance, EvictionReason::Shutdown);
        }
    }

    /// Rows for the status endpoint.
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let mut rows: Vec<InstanceSnapshot> = self
            .entries
            .iter()
            .filter_map(|e| match (e.key(), e.value()) {
                (RegistryKey::Plugin(_), RegistryEntry::Instance(i)) => Some(InstanceSnapshot {
                    plugin_id: i.plugin_id,
                    port: i.port,
                    pid: i.pid,
                    started_at_ms: i.started_at_ms,
                    idle_secs: i.idle_for().as_secs(),
                    age_secs: i.age().as_secs(),
                    access_count: i.access_count.load(Ordering::Relaxed),
                    ready: i.installed.load(Ordering::Acquire),
                }),
                _ => None,
            })
            .collect();
        rows.sort_by_key(|r| r.port);
        rows
    }
}
