//! Clock nodes and the arena that owns them
use crate::{
    notifier::Subscriber, ops::RuntimePm, parent_map::ParentSlot, provider::DescriptionNode,
    Capabilities, ClkFlags, ClkOps, Duty,
};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::ops::{Index, IndexMut};
use derive_more::{From, Into};

/// Stable identifier of a registered clock
///
/// Identifiers are never reused: a slot freed by unregistration gets a new generation.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ClkId {
    index: u32,
    generation: u32,
}

/// Identifier of a consumer handle
#[derive(Copy, From, Into, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct ConsumerId(u64);

/// A registered clock
pub(crate) struct ClkCore {
    pub name: String,
    pub ops: Arc<dyn ClkOps>,
    pub caps: Capabilities,
    pub description: Option<Arc<dyn DescriptionNode>>,
    pub runtime_pm: Option<Arc<dyn RuntimePm>>,
    pub parent: Option<ClkId>,
    pub parents: Vec<ParentSlot>,
    pub children: Vec<ClkId>,
    pub rate: u64,
    /// Last request, clamped into the rate window
    pub req_rate: u64,
    /// Last request as a consumer made it
    pub target_rate: u64,
    pub min_rate: u64,
    pub max_rate: u64,
    pub accuracy: u64,
    pub phase: i32,
    pub duty: Duty,
    pub flags: ClkFlags,
    pub orphan: bool,
    pub registered: bool,
    pub prepare_count: u32,
    pub enable_count: u32,
    pub protect_count: u32,
    pub notifier_count: u32,
    pub consumers: Vec<ConsumerId>,
    /// One for the registration, one per consumer handle
    pub refs: u32,
}

impl ClkCore {
    /// A detached, unregistered core holding only the registration's reference
    pub(crate) fn new(name: String, ops: Arc<dyn ClkOps>) -> Self {
        let caps = ops.capabilities();
        Self {
            name,
            ops,
            caps,
            description: None,
            runtime_pm: None,
            parent: None,
            parents: Vec::new(),
            children: Vec::new(),
            rate: 0,
            req_rate: 0,
            target_rate: 0,
            min_rate: 0,
            max_rate: u64::MAX,
            accuracy: 0,
            phase: 0,
            duty: Duty::default(),
            flags: ClkFlags::empty(),
            orphan: false,
            registered: false,
            prepare_count: 0,
            enable_count: 0,
            protect_count: 0,
            notifier_count: 0,
            consumers: Vec::new(),
            refs: 1,
        }
    }
}

/// Per-consumer state behind a [crate::Clk]
#[derive(Clone, Debug)]
pub(crate) struct Consumer {
    pub core: ClkId,
    pub dev_id: Option<String>,
    pub con_id: Option<String>,
    pub min_rate: u64,
    pub max_rate: u64,
    pub exclusive_count: u32,
}

struct Slot {
    generation: u32,
    core: Option<ClkCore>,
}

/// Everything the prepare lock protects, behind one short-lived mutex
///
/// The mutex is only held while reading or writing fields. It is never held while calling an
/// op, a provider or a notifier.
#[derive(Default)]
pub(crate) struct NodeStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pub roots: Vec<ClkId>,
    pub orphans: Vec<ClkId>,
    pub consumers: BTreeMap<ConsumerId, Consumer>,
    next_consumer: u64,
    pub subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

impl NodeStore {
    pub(crate) fn insert(&mut self, core: ClkCore) -> ClkId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.core = Some(core);
            ClkId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("Expect fewer than 2^32 clocks");
            self.slots.push(Slot {
                generation: 0,
                core: Some(core),
            });
            ClkId {
                index,
                generation: 0,
            }
        }
    }

    /// Free a slot, invalidating its id
    pub(crate) fn remove(&mut self, id: ClkId) -> Option<ClkCore> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let core = slot.core.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(core)
    }

    pub(crate) fn get(&self, id: ClkId) -> Option<&ClkCore> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.core.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ClkId) -> Option<&mut ClkCore> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.core.as_mut())
    }

    /// Check that `id` refers to a clock that is still registered
    pub(crate) fn is_live(&self, id: ClkId) -> bool {
        self.get(id).is_some_and(|core| core.registered)
    }

    /// Ids of every occupied slot, placed or not
    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<ClkId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.core.is_some())
            .map(|(index, slot)| ClkId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Every clock, roots' subtrees first, then orphans', each in preorder
    pub(crate) fn forest(&self) -> Vec<ClkId> {
        let mut ids = Vec::new();
        for &top in self.roots.iter().chain(self.orphans.iter()) {
            self.collect_subtree(top, &mut ids);
        }
        ids
    }

    /// `id` and all its descendants, in preorder
    pub(crate) fn subtree(&self, id: ClkId) -> Vec<ClkId> {
        let mut ids = Vec::new();
        self.collect_subtree(id, &mut ids);
        ids
    }

    fn collect_subtree(&self, id: ClkId, ids: &mut Vec<ClkId>) {
        let mut stack = alloc::vec![id];
        while let Some(id) = stack.pop() {
            ids.push(id);
            stack.extend(self[id].children.iter().rev());
        }
    }

    /// Find a registered clock by name, searching roots before orphans
    pub(crate) fn lookup(&self, name: &str) -> Option<ClkId> {
        self.forest().into_iter().find(|&id| self[id].name == name)
    }

    /// Rate as consumers see it: zero while orphaned
    pub(crate) fn rate_nolock(&self, id: ClkId) -> u64 {
        let core = &self[id];
        if core.parents.is_empty() || core.parent.is_some() {
            core.rate
        } else {
            0
        }
    }

    pub(crate) fn is_protected(&self, id: ClkId) -> bool {
        self[id].protect_count > 0
    }

    /// Effective rate window: the core's own range intersected with every consumer's
    pub(crate) fn boundaries(&self, id: ClkId) -> (u64, u64) {
        let core = &self[id];
        core.consumers
            .iter()
            .filter_map(|consumer| self.consumers.get(consumer))
            .fold((core.min_rate, core.max_rate), |(min, max), consumer| {
                (min.max(consumer.min_rate), max.min(consumer.max_rate))
            })
    }

    pub(crate) fn add_consumer(&mut self, consumer: Consumer) -> ConsumerId {
        let id = ConsumerId(self.next_consumer);
        self.next_consumer += 1;
        let core = &mut self[consumer.core];
        core.consumers.push(id);
        core.refs += 1;
        self.consumers.insert(id, consumer);
        id
    }

    pub(crate) fn next_subscriber_id(&mut self) -> u64 {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        id
    }
}

impl Index<ClkId> for NodeStore {
    type Output = ClkCore;

    fn index(&self, id: ClkId) -> &ClkCore {
        self.get(id).expect("Stale clock id")
    }
}

impl IndexMut<ClkId> for NodeStore {
    fn index_mut(&mut self, id: ClkId) -> &mut ClkCore {
        self.get_mut(id).expect("Stale clock id")
    }
}
