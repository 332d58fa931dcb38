//! Clock providers and hardware-description lookups
//!
//! A provider maps a reference found in a hardware description (a node plus specifier cells)
//! to one of the clocks it registered. Consumers and parent slots that name clocks by
//! description go through here.
use crate::{Clk, ClkError, ClkId, ClkResult, ClockTree};
use alloc::{sync::Arc, vec::Vec};
use derive_more::{Display, From, Into};

/// Reference to a node in the hardware description (a phandle)
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[display("node@{_0:#x}")]
pub struct NodeRef(u32);

/// One entry of a `clocks` property: the provider node plus its specifier cells
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClockSpec {
    pub provider: NodeRef,
    pub args: Vec<u32>,
}

/// A consumer's node in the hardware description
pub trait DescriptionNode: Send + Sync {
    /// The node itself, if it can be referred to
    fn node_ref(&self) -> Option<NodeRef>;

    /// Position of `name` in the node's clock names
    fn clock_index(&self, name: &str) -> Option<usize>;

    /// Clock reference at `index`
    fn clock_spec(&self, index: usize) -> Option<ClockSpec>;
}

/// Resolves specifiers pointing at one provider node
pub trait ClkProvider: Send + Sync {
    fn get(&self, spec: &ClockSpec) -> ClkResult<ClkId>;
}

impl<F> ClkProvider for F
where
    F: Fn(&ClockSpec) -> ClkResult<ClkId> + Send + Sync,
{
    fn get(&self, spec: &ClockSpec) -> ClkResult<ClkId> {
        self(spec)
    }
}

/// Provider of exactly one clock, ignoring specifier cells
#[derive(Copy, Clone, Debug)]
pub struct SimpleProvider(ClkId);

impl SimpleProvider {
    pub const fn new(clk: ClkId) -> Self {
        Self(clk)
    }
}

impl ClkProvider for SimpleProvider {
    fn get(&self, _spec: &ClockSpec) -> ClkResult<ClkId> {
        Ok(self.0)
    }
}

/// Provider of several clocks, indexed by the first specifier cell
#[derive(Clone, Debug, Default)]
pub struct OnecellProvider {
    clks: Vec<Option<ClkId>>,
}

impl OnecellProvider {
    /// `clks[i]` answers specifier `<i>`; holes answer [ClkError::NotFound]
    pub fn new(clks: Vec<Option<ClkId>>) -> Self {
        Self { clks }
    }
}

impl ClkProvider for OnecellProvider {
    fn get(&self, spec: &ClockSpec) -> ClkResult<ClkId> {
        let index = *spec.args.first().ok_or(ClkError::InvalidArguments)?;
        let index = usize::try_from(index).expect("Expect usize to hold u32");
        match self.clks.get(index) {
            Some(clk) => clk.ok_or(ClkError::NotFound),
            None => {
                log::error!("clk: onecell index {index} out of range");
                Err(ClkError::InvalidArguments)
            }
        }
    }
}

pub(crate) struct ProviderEntry {
    node: NodeRef,
    provider: Arc<dyn ClkProvider>,
}

impl ClockTree {
    /// Register a provider for `node`, then retry resolution for orphans
    pub fn add_provider(&self, node: NodeRef, provider: impl ClkProvider + 'static) -> ClkResult {
        {
            let mut providers = self.providers.lock();
            if providers.iter().any(|entry| entry.node == node) {
                return Err(ClkError::AlreadyExists);
            }
            providers.push(ProviderEntry {
                node,
                provider: Arc::new(provider),
            });
        }
        log::debug!("clk: added provider for {node}");

        let _guard = self.locks.prepare();
        self.adopt_orphans();
        Ok(())
    }

    /// Forget the provider of `node`
    pub fn del_provider(&self, node: NodeRef) {
        self.providers.lock().retain(|entry| entry.node != node);
    }

    /// Resolve `spec` through the provider registered for its node
    ///
    /// Returns [ClkError::Deferred] if nobody provides that node yet.
    pub fn clk_from_spec(&self, spec: &ClockSpec) -> ClkResult<ClkId> {
        let provider = self
            .providers
            .lock()
            .iter()
            .find(|entry| entry.node == spec.provider)
            .map(|entry| entry.provider.clone());
        provider.ok_or(ClkError::Deferred)?.get(spec)
    }

    /// Resolve the clock `description` names `name`, or lists at `index` if `name` is `None`
    pub(crate) fn clk_from_description(
        &self,
        description: &dyn DescriptionNode,
        name: Option<&str>,
        index: usize,
    ) -> ClkResult<ClkId> {
        let index = match name {
            Some(name) => description.clock_index(name).ok_or(ClkError::NotFound)?,
            None => index,
        };
        let spec = description.clock_spec(index).ok_or(ClkError::NotFound)?;
        self.clk_from_spec(&spec)
    }

    /// Get a handle on the clock `description` calls `name`
    ///
    /// With `None`, the first clock of the description is used.
    pub fn obtain(
        self: &Arc<Self>,
        description: &dyn DescriptionNode,
        name: Option<&str>,
    ) -> ClkResult<Clk> {
        let id = self.clk_from_description(description, name, 0)?;
        self.get_clk(id, name)
    }

    /// Get a handle on the clock at `index` in `description`
    pub fn obtain_index(
        self: &Arc<Self>,
        description: &dyn DescriptionNode,
        index: usize,
    ) -> ClkResult<Clk> {
        let id = self.clk_from_description(description, None, index)?;
        self.get_clk(id, None)
    }
}
