//! The clock tree itself
use crate::{
    lock::{Locks, StoreGuard},
    node::NodeStore,
    provider::ProviderEntry,
    Capabilities, ClkError, ClkFlags, ClkHw, ClkId, ClkOps, ClkResult, Duty,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use spin::Mutex;

/// Boot-time knobs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockTreeConfig {
    /// Leave clocks nobody claimed running instead of gating them
    pub ignore_unused: bool,
}

impl ClockTreeConfig {
    /// Parse knobs out of a kernel command line
    ///
    /// # Example
    /// ```
    /// use clk_tree::ClockTreeConfig;
    ///
    /// let config = ClockTreeConfig::from_cmdline("console=ttyS0 clk_ignore_unused");
    /// assert!(config.ignore_unused);
    /// ```
    pub fn from_cmdline(cmdline: &str) -> Self {
        Self {
            ignore_unused: cmdline
                .split_whitespace()
                .any(|arg| arg == "clk_ignore_unused"),
        }
    }
}

/// A snapshot of one clock's bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClkSummary {
    pub name: String,
    pub parent: Option<ClkId>,
    pub rate: u64,
    pub req_rate: u64,
    pub accuracy: u64,
    pub phase: i32,
    pub duty: Duty,
    pub flags: ClkFlags,
    pub orphan: bool,
    pub prepare_count: u32,
    pub enable_count: u32,
    pub protect_count: u32,
    pub notifier_count: u32,
    pub consumer_count: usize,
}

/// A forest of clocks plus the providers that resolve references to them
///
/// Most users want the process-wide instance in [crate::global]. Separate trees are handy for
/// testing.
pub struct ClockTree {
    config: ClockTreeConfig,
    pub(crate) locks: Locks,
    store: Mutex<NodeStore>,
    pub(crate) providers: Mutex<Vec<ProviderEntry>>,
}

impl ClockTree {
    /// Create an empty tree
    ///
    /// `actor` must return a distinct, stable value for each thread of execution that may call
    /// into the tree (for example the hart id), and never `usize::MAX`.
    pub fn new(config: ClockTreeConfig, actor: fn() -> usize) -> Arc<Self> {
        Arc::new(Self {
            config,
            locks: Locks::new(actor),
            store: Mutex::new(NodeStore::default()),
            providers: Mutex::new(Vec::new()),
        })
    }

    /// Knobs this tree was created with
    pub fn config(&self) -> &ClockTreeConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> StoreGuard<'_> {
        StoreGuard::lock(&self.store)
    }

    pub(crate) fn hw(&self, id: ClkId) -> ClkHw<'_> {
        ClkHw::new(self, id)
    }

    pub(crate) fn name_of(&self, id: ClkId) -> String {
        self.store()
            .get(id)
            .map(|core| core.name.clone())
            .unwrap_or_default()
    }

    pub(crate) fn ops_of(&self, id: ClkId) -> (Arc<dyn ClkOps>, Capabilities) {
        let store = self.store();
        (store[id].ops.clone(), store[id].caps)
    }

    pub(crate) fn flags_of(&self, id: ClkId) -> ClkFlags {
        self.store()[id].flags
    }

    pub(crate) fn parent_of(&self, id: ClkId) -> Option<ClkId> {
        self.store()[id].parent
    }

    pub(crate) fn children_of(&self, id: ClkId) -> Vec<ClkId> {
        self.store()[id].children.clone()
    }

    pub(crate) fn check_live(&self, id: ClkId) -> ClkResult {
        if self.store().get(id).is_some() {
            Ok(())
        } else {
            Err(ClkError::NotFound)
        }
    }

    /// Find a registered clock by name
    pub fn lookup(&self, name: &str) -> Option<ClkId> {
        let _guard = self.locks.prepare();
        self.store().lookup(name)
    }

    /// Name of a clock
    pub fn name(&self, id: ClkId) -> ClkResult<String> {
        let store = self.store();
        Ok(store.get(id).ok_or(ClkError::NotFound)?.name.clone())
    }

    /// Cached rate of a clock, without taking the prepare lock
    pub fn rate(&self, id: ClkId) -> ClkResult<u64> {
        let store = self.store();
        store.get(id).ok_or(ClkError::NotFound)?;
        Ok(store.rate_nolock(id))
    }

    /// Current parent of a clock
    pub fn parent(&self, id: ClkId) -> ClkResult<Option<ClkId>> {
        let store = self.store();
        Ok(store.get(id).ok_or(ClkError::NotFound)?.parent)
    }

    /// Children of a clock, in no particular order
    pub fn children(&self, id: ClkId) -> ClkResult<Vec<ClkId>> {
        let store = self.store();
        Ok(store.get(id).ok_or(ClkError::NotFound)?.children.clone())
    }

    /// Clocks without parents
    pub fn roots(&self) -> Vec<ClkId> {
        self.store().roots.clone()
    }

    /// Tops of subtrees whose parent couldn't be resolved yet
    pub fn orphans(&self) -> Vec<ClkId> {
        self.store().orphans.clone()
    }

    /// Snapshot a clock's bookkeeping
    pub fn summary(&self, id: ClkId) -> ClkResult<ClkSummary> {
        let store = self.store();
        let core = store.get(id).ok_or(ClkError::NotFound)?;
        Ok(ClkSummary {
            name: core.name.clone(),
            parent: core.parent,
            rate: store.rate_nolock(id),
            req_rate: core.req_rate,
            accuracy: core.accuracy,
            phase: core.phase,
            duty: core.duty,
            flags: core.flags,
            orphan: core.orphan,
            prepare_count: core.prepare_count,
            enable_count: core.enable_count,
            protect_count: core.protect_count,
            notifier_count: core.notifier_count,
            consumer_count: core.consumers.len(),
        })
    }
}
