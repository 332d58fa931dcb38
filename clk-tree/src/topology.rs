//! Parent/child links, the root and orphan forests, and rate recalculation
use crate::{
    node::NodeStore, notifier::RateEvent, Capabilities, ClkId, ClkResult, ClockTree,
};

impl NodeStore {
    /// Unlink `id` from whichever list holds it
    pub(crate) fn detach(&mut self, id: ClkId) {
        match self[id].parent {
            Some(parent) => self[parent].children.retain(|&child| child != id),
            None => {
                self.roots.retain(|&root| root != id);
                self.orphans.retain(|&orphan| orphan != id);
            }
        }
    }

    /// Place a newly registered clock
    pub(crate) fn attach(&mut self, id: ClkId, parent: Option<ClkId>) {
        self[id].parent = parent;
        self[id].orphan = match parent {
            Some(parent) => {
                self[parent].children.push(id);
                self[parent].orphan
            }
            None if self[id].parents.is_empty() => {
                self.roots.push(id);
                false
            }
            None => {
                self.orphans.push(id);
                true
            }
        };
    }

    /// Move `id` under `new_parent`, or into the orphan forest
    pub(crate) fn reparent(&mut self, id: ClkId, new_parent: Option<ClkId>) {
        self.detach(id);
        let becomes_orphan = match new_parent {
            Some(parent) => {
                self[parent].children.push(id);
                self[parent].orphan
            }
            None => {
                self.orphans.push(id);
                true
            }
        };
        if becomes_orphan != self[id].orphan {
            self.propagate_orphan(id, becomes_orphan);
        }
        self[id].parent = new_parent;
    }

    /// Set the orphan bit on a whole subtree
    pub(crate) fn propagate_orphan(&mut self, id: ClkId, orphan: bool) {
        for id in self.subtree(id) {
            self[id].orphan = orphan;
        }
    }
}

impl ClockTree {
    /// Run the recalc op against `parent_rate`
    pub(crate) fn recalc(&self, id: ClkId, parent_rate: u64) -> u64 {
        let (ops, caps) = self.ops_of(id);
        if !caps.contains(Capabilities::RECALC_RATE) || self.pm_get(id).is_err() {
            return parent_rate;
        }
        let rate = ops.recalc_rate(&self.hw(id), parent_rate);
        self.pm_put(id);
        rate
    }

    /// Refresh cached rates of a subtree, optionally announcing each to subscribers
    pub(crate) fn recalc_rates(&self, id: ClkId, event: Option<RateEvent>) {
        let (old_rate, parent_rate) = {
            let store = self.store();
            let parent_rate = store[id].parent.map_or(0, |parent| store[parent].rate);
            (store[id].rate, parent_rate)
        };
        let rate = self.recalc(id, parent_rate);
        let notify = {
            let mut store = self.store();
            store[id].rate = rate;
            store[id].notifier_count > 0
        };

        if let (Some(event), true) = (event, notify) {
            self.notify(id, event, old_rate, rate);
        }

        for child in self.children_of(id) {
            self.recalc_rates(child, event);
        }
    }

    /// Refresh cached accuracies of a subtree
    pub(crate) fn recalc_accuracies(&self, id: ClkId) {
        let parent_accuracy = {
            let store = self.store();
            store[id].parent.map_or(0, |parent| store[parent].accuracy)
        };
        let (ops, caps) = self.ops_of(id);
        let accuracy = if caps.contains(Capabilities::RECALC_ACCURACY) {
            ops.recalc_accuracy(&self.hw(id), parent_accuracy)
        } else {
            parent_accuracy
        };
        self.store()[id].accuracy = accuracy;

        for child in self.children_of(id) {
            self.recalc_accuracies(child);
        }
    }

    /// Retry resolution for every orphan and adopt those whose parent showed up
    pub(crate) fn adopt_orphans(&self) {
        let orphans = self.store().orphans.clone();
        for orphan in orphans {
            let Some(parent) = self.init_parent(orphan) else {
                continue;
            };
            log::debug!(
                "clk: adopting orphan {} under {}",
                self.name_of(orphan),
                self.name_of(parent)
            );
            self.set_parent_before(orphan, Some(parent));
            self.set_parent_after(orphan, Some(parent), None);
            self.recalc_accuracies(orphan);
            self.recalc_rates(orphan, Some(RateEvent::PostChange));
        }
    }

    /// Tell the core hardware has switched `id` to `new_parent` on its own
    ///
    /// References held through the old parent move to the new one, but the clock's own
    /// `set_parent` op is never called.
    pub fn set_parent_hint(&self, id: ClkId, new_parent: Option<ClkId>) -> ClkResult {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        if let Some(parent) = new_parent {
            self.check_live(parent)?;
        }
        let old_parent = self.set_parent_before(id, new_parent);
        self.set_parent_after(id, new_parent, old_parent);
        self.recalc_accuracies(id);
        self.recalc_rates(id, Some(RateEvent::PostChange));
        Ok(())
    }
}
