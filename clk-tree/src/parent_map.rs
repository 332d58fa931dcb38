//! Resolving declared parents to registered clocks
use crate::{ClkError, ClkId, ClkResult, ClockTree};
use alloc::string::{String, ToString};

/// How a clock refers to one of its possible parents
///
/// At least one field should be set. See [ClockTree::register] for the lookup order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentData {
    /// A clock that is (or will be) registered with this tree
    pub hw: Option<ClkId>,
    /// Name of the input in the clock's hardware description
    pub fw_name: Option<String>,
    /// Global name, used when the description doesn't resolve
    pub name: Option<String>,
    /// Index of the input in the clock's hardware description
    pub index: Option<usize>,
}

impl ParentData {
    /// A parent known only by its global name
    pub fn name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// A parent given directly
    pub fn hw(hw: ClkId) -> Self {
        Self {
            hw: Some(hw),
            ..Default::default()
        }
    }

    /// A parent named in the clock's hardware description
    pub fn fw_name(fw_name: &str) -> Self {
        Self {
            fw_name: Some(fw_name.to_string()),
            ..Default::default()
        }
    }

    /// A parent at `index` in the clock's hardware description
    pub fn index(index: usize) -> Self {
        Self {
            index: Some(index),
            ..Default::default()
        }
    }

    /// Fall back to the global `name` if the description doesn't resolve
    pub fn or_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// A declared parent plus its cached resolution
#[derive(Clone, Debug)]
pub(crate) struct ParentSlot {
    pub data: ParentData,
    pub core: Option<ClkId>,
}

impl From<ParentData> for ParentSlot {
    fn from(data: ParentData) -> Self {
        Self { data, core: None }
    }
}

impl ClockTree {
    /// Resolve parent slot `index` of `id`, caching a success
    pub(crate) fn resolve_parent_slot(&self, id: ClkId, index: usize) -> ClkResult<ClkId> {
        let (data, description) = {
            let store = self.store();
            let core = &store[id];
            let slot = core.parents.get(index).ok_or(ClkError::InvalidArguments)?;
            if let Some(cached) = slot.core.filter(|&cached| store.is_live(cached)) {
                return Ok(cached);
            }
            (slot.data.clone(), core.description.clone())
        };

        let found = if let Some(hw) = data.hw {
            if self.store().is_live(hw) {
                Ok(hw)
            } else {
                Err(ClkError::Deferred)
            }
        } else {
            let from_description = match description {
                Some(description) if data.fw_name.is_some() || data.index.is_some() => self
                    .clk_from_description(
                        description.as_ref(),
                        data.fw_name.as_deref(),
                        data.index.unwrap_or(0),
                    ),
                _ => Err(ClkError::NotFound),
            };
            match (from_description, data.name.as_deref()) {
                (Err(ClkError::NotFound), Some(name)) => {
                    self.store().lookup(name).ok_or(ClkError::NotFound)
                }
                (result, _) => result,
            }
        };

        match found {
            Ok(parent) => {
                self.store()[id].parents[index].core = Some(parent);
            }
            Err(ClkError::Deferred) => {
                log::debug!("clk: parent {index} of {} deferred", self.name_of(id));
            }
            Err(_) => {}
        }
        found
    }

    /// Parent declared at `index`, if it can be resolved now
    pub(crate) fn parent_by_index(&self, id: ClkId, index: usize) -> Option<ClkId> {
        self.resolve_parent_slot(id, index).ok()
    }

    /// Find which slot of `id` refers to `parent`
    pub(crate) fn fetch_parent_index(&self, id: ClkId, parent: ClkId) -> ClkResult<usize> {
        let (slots, parent_name) = {
            let store = self.store();
            let slots = store[id].parents.clone();
            (slots, store[parent].name.clone())
        };

        if let Some(index) = slots.iter().position(|slot| slot.core == Some(parent)) {
            return Ok(index);
        }

        for (index, slot) in slots.iter().enumerate() {
            let matched = if let Some(hw) = slot.data.hw {
                hw == parent
            } else {
                self.resolve_parent_slot(id, index).ok() == Some(parent)
                    || slot.data.name.as_deref() == Some(parent_name.as_str())
            };
            if matched {
                self.store()[id].parents[index].core = Some(parent);
                return Ok(index);
            }
        }

        Err(ClkError::InvalidArguments)
    }

    /// Parent selected by hardware, if it can be resolved
    pub(crate) fn init_parent(&self, id: ClkId) -> Option<ClkId> {
        let (ops, caps, num_parents) = {
            let store = self.store();
            let core = &store[id];
            (core.ops.clone(), core.caps, core.parents.len())
        };
        if num_parents == 0 {
            return None;
        }

        let index = if num_parents > 1 && caps.contains(crate::Capabilities::GET_PARENT) {
            usize::from(ops.get_parent(&self.hw(id)))
        } else {
            0
        };
        self.parent_by_index(id, index)
    }

    /// Forget every cached resolution pointing at `target`
    pub(crate) fn evict_parent_cache(&self, target: ClkId) {
        let mut store = self.store();
        for id in store.forest() {
            for slot in store[id].parents.iter_mut() {
                if slot.core == Some(target) {
                    slot.core = None;
                }
            }
        }
    }
}
