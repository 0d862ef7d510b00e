//! Module routing table
//!
//! Maps rsync module names to upstream endpoints. The table is an
//! immutable snapshot behind an atomic pointer: lookups are lock-free
//! `load`s, and a reload builds a complete new snapshot off to the
//! side and swaps it in with a single `store`. Workers that already
//! passed the lookup step keep the `Arc` they loaded and are
//! unaffected by the swap.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Result of a successful module lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTarget {
    /// Upstream address in host:port form.
    pub address: String,
    /// Whether to prepend a PROXY v1 header when dialing the address.
    pub use_proxy_protocol: bool,
}

/// Immutable routing state published as one unit.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    /// Banner sent to clients after their request line; may be empty.
    pub motd: String,
    /// Module name -> upstream address.
    modules: HashMap<String, String>,
    /// Upstream address -> PROXY protocol flag.
    proxy_protocol: HashMap<String, bool>,
    /// Precomputed lexicographically sorted module names for listing.
    sorted_modules: Vec<String>,
}

impl RouteSnapshot {
    pub fn new(
        motd: String,
        modules: HashMap<String, String>,
        proxy_protocol: HashMap<String, bool>,
    ) -> Self {
        let mut sorted_modules: Vec<String> = modules.keys().cloned().collect();
        sorted_modules.sort();
        Self {
            motd,
            modules,
            proxy_protocol,
            sorted_modules,
        }
    }

    /// Case-sensitive, byte-exact module lookup.
    pub fn lookup(&self, module: &str) -> Option<ModuleTarget> {
        let address = self.modules.get(module)?;
        Some(ModuleTarget {
            address: address.clone(),
            use_proxy_protocol: self.proxy_protocol.get(address).copied().unwrap_or(false),
        })
    }

    /// Sorted module names for the listing reply.
    pub fn module_names(&self) -> &[String] {
        &self.sorted_modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Atomically swappable routing table.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a table with an empty snapshot; every lookup misses
    /// until the first config install.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Current snapshot. Cheap; callers hold the `Arc` for at most
    /// one handshake.
    pub fn load(&self) -> Arc<RouteSnapshot> {
        self.snapshot.load_full()
    }

    /// Publish a new snapshot. In-flight workers keep whatever
    /// snapshot they already loaded.
    pub fn install(&self, snapshot: RouteSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
