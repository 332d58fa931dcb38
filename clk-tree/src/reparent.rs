//! Switching a clock to another parent
//!
//! While a clock is prepared, its prepare and enable references move with it: the new parent
//! is prepared and enabled before the switch and the old one is released afterwards, so the
//! signal never glitches through a gated parent. A rate claim moves the same way.
use crate::{
    notifier::RateEvent, trace::tracepoint, Capabilities, ClkError, ClkFlags, ClkId, ClkResult,
    ClockTree, NotifyResult,
};

impl ClockTree {
    /// Take references on `parent` and move `id` under it, returning the parent it left
    pub(crate) fn set_parent_before(&self, id: ClkId, parent: Option<ClkId>) -> Option<ClkId> {
        let (old_parent, flags, prepared, protected) = {
            let store = self.store();
            let core = &store[id];
            (core.parent, core.flags, core.prepare_count > 0, core.protect_count > 0)
        };

        // Both parents must run while the mux switches
        if flags.contains(ClkFlags::OPS_PARENT_ENABLE) {
            if let Err(err) = self.core_prepare_enable(old_parent) {
                log::warn!("clk: {}: failed to enable old parent: {err}", self.name_of(id));
            }
            if let Err(err) = self.core_prepare_enable(parent) {
                log::warn!("clk: {}: failed to enable new parent: {err}", self.name_of(id));
            }
        }

        if prepared {
            if let Err(err) = self.core_prepare_enable(parent) {
                log::warn!("clk: {}: failed to enable new parent: {err}", self.name_of(id));
            }
            if let Err(err) = self.core_enable_lock(Some(id)) {
                log::warn!("clk: {}: failed to hold enabled: {err}", self.name_of(id));
            }
        }

        if protected {
            self.rate_protect(parent);
        }

        self.locks.enable(|| self.store().reparent(id, parent));
        old_parent
    }

    /// Drop the references [ClockTree::set_parent_before] took
    pub(crate) fn set_parent_after(
        &self,
        id: ClkId,
        parent: Option<ClkId>,
        old_parent: Option<ClkId>,
    ) {
        let (flags, prepared, protected) = {
            let store = self.store();
            let core = &store[id];
            (core.flags, core.prepare_count > 0, core.protect_count > 0)
        };

        if protected {
            self.rate_unprotect(old_parent);
        }

        if prepared {
            self.core_disable_lock(Some(id));
            self.core_disable_unprepare(old_parent);
        }

        if flags.contains(ClkFlags::OPS_PARENT_ENABLE) {
            self.core_disable_unprepare(parent);
            self.core_disable_unprepare(old_parent);
        }
    }

    /// Switch topology and hardware, undoing the topology change if hardware refuses
    fn switch_parent(&self, id: ClkId, parent: Option<ClkId>, index: u8) -> ClkResult {
        let old_parent = self.set_parent_before(id, parent);

        tracepoint!(self, "clk_set_parent", id, "-> {index}");
        let (ops, caps) = self.ops_of(id);
        let result = match parent {
            Some(_) if caps.contains(Capabilities::SET_PARENT) => {
                ops.set_parent(&self.hw(id), index)
            }
            _ => Ok(()),
        };
        tracepoint!(self, "clk_set_parent_complete", id, "-> {index}");

        if let Err(err) = result {
            self.locks.enable(|| self.store().reparent(id, old_parent));
            self.set_parent_after(id, old_parent, parent);
            return Err(err);
        }

        self.set_parent_after(id, parent, old_parent);
        Ok(())
    }

    /// Announce what a subtree's rates would become if `id`'s parent ran at `parent_rate`
    fn speculate_rates(&self, id: ClkId, parent_rate: u64) -> NotifyResult {
        let (old_rate, notifier_count) = {
            let store = self.store();
            (store[id].rate, store[id].notifier_count)
        };
        let new_rate = self.recalc(id, parent_rate);

        let mut result = NotifyResult::DONE;
        if notifier_count > 0 {
            result = self.notify(id, RateEvent::PreChange, old_rate, new_rate);
            if result.contains(NotifyResult::STOP) {
                return result;
            }
        }

        for child in self.children_of(id) {
            result = self.speculate_rates(child, new_rate);
            if result.contains(NotifyResult::STOP) {
                break;
            }
        }
        result
    }

    /// Move `id` under `parent`, or detach it to the orphan forest with `None`
    ///
    /// Caller holds the prepare lock.
    pub(crate) fn set_parent_nolock(&self, id: ClkId, parent: Option<ClkId>) -> ClkResult {
        let (old_parent, num_parents, caps, flags, prepared, protected) = {
            let store = self.store();
            let core = &store[id];
            (
                core.parent,
                core.parents.len(),
                core.caps,
                core.flags,
                core.prepare_count > 0,
                store.is_protected(id),
            )
        };

        if old_parent == parent {
            return Ok(());
        }
        if num_parents > 1 && !caps.contains(Capabilities::SET_PARENT) {
            return Err(ClkError::Permission);
        }
        if flags.contains(ClkFlags::SET_PARENT_GATE) && prepared {
            return Err(ClkError::Busy);
        }
        if protected {
            return Err(ClkError::Busy);
        }

        let (index, parent_rate) = match parent {
            Some(parent) => {
                let index = self.fetch_parent_index(id, parent).map_err(|err| {
                    log::debug!(
                        "clk: {} can't be a parent of {}",
                        self.name_of(parent),
                        self.name_of(id)
                    );
                    err
                })?;
                let index = u8::try_from(index).map_err(|_| ClkError::InvalidArguments)?;
                (index, self.store()[parent].rate)
            }
            None => (0, 0),
        };

        self.pm_get(id)?;

        let result = if self
            .speculate_rates(id, parent_rate)
            .contains(NotifyResult::STOP)
        {
            log::debug!("clk: reparenting {} vetoed", self.name_of(id));
            self.recalc_rates(id, Some(RateEvent::AbortChange));
            Err(ClkError::Busy)
        } else if let Err(err) = self.switch_parent(id, parent, index) {
            self.recalc_rates(id, Some(RateEvent::AbortChange));
            Err(err)
        } else {
            self.recalc_rates(id, Some(RateEvent::PostChange));
            self.recalc_accuracies(id);
            Ok(())
        };

        self.pm_put(id);
        result
    }

    /// Switch a clock to another of its declared parents, as its provider
    pub fn set_parent(&self, id: ClkId, parent: Option<ClkId>) -> ClkResult {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        if let Some(parent) = parent {
            self.check_live(parent)?;
        }
        self.set_parent_nolock(id, parent)
    }
}
