//! Connection registry
//!
//! Tracks every accepted rsync connection from accept until its
//! worker exits, for the `/status` and `/telegraf` endpoints. The
//! registry never influences routing; it is introspection state only.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Introspection record for one accepted connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub index: u32,
    #[serde(rename = "local")]
    pub local_addr: String,
    #[serde(rename = "remote")]
    pub remote_addr: String,
    #[serde(rename = "connected", serialize_with = "rfc3339_seconds")]
    pub connected_at: DateTime<Utc>,
    /// Empty until the client names a module.
    pub module: String,
}

fn rfc3339_seconds<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Shared registry of live connections plus the accept-side counters.
pub struct ConnectionRegistry {
    connections: DashMap<u32, ConnInfo>,
    active: AtomicI64,
    // Wrapping 32-bit counter; collisions would need >4G concurrent
    // connections.
    next_index: AtomicU32,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            active: AtomicI64::new(0),
            next_index: AtomicU32::new(0),
        }
    }

    /// Assign the next connection index.
    pub fn next_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Bump the active count for one worker; the guard drops it back
    /// on any exit path.
    pub fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            registry: Arc::clone(self),
        }
    }

    /// Record an accepted connection; the guard removes it when the
    /// worker exits.
    pub fn register(self: &Arc<Self>, info: ConnInfo) -> RegistrationGuard {
        let index = info.index;
        self.connections.insert(index, info);
        RegistrationGuard {
            registry: Arc::clone(self),
            index,
        }
    }

    /// Fill in the module name once the client has sent its request.
    pub fn set_module(&self, index: u32, module: &str) {
        if let Some(mut entry) = self.connections.get_mut(&index) {
            entry.module = module.to_string();
        }
    }

    pub fn active_count(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    /// All live connections, sorted by ascending index.
    pub fn list(&self) -> Vec<ConnInfo> {
        let mut result: Vec<ConnInfo> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        result.sort_by_key(|info| info.index);
        result
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active count when dropped.
pub struct ActiveGuard {
    registry: Arc<ConnectionRegistry>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Removes the connection record when dropped.
pub struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    index: u32,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.connections.remove(&self.index);
    }
}
