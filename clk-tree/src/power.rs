//! Runtime power management, context save/restore and the unused-clock sweep
use crate::{trace::tracepoint, Capabilities, ClkFlags, ClkId, ClkResult, ClockTree};

impl ClockTree {
    /// Wake the device behind `id` before touching its hardware
    pub(crate) fn pm_get(&self, id: ClkId) -> ClkResult {
        let pm = self.store()[id].runtime_pm.clone();
        match pm {
            Some(pm) => pm.resume(),
            None => Ok(()),
        }
    }

    /// Balance a successful [ClockTree::pm_get]
    pub(crate) fn pm_put(&self, id: ClkId) {
        let pm = self.store()[id].runtime_pm.clone();
        if let Some(pm) = pm {
            pm.suspend();
        }
    }

    /// Save hardware context of every clock, children before parents
    ///
    /// Stops at the first failure.
    pub fn save_context(&self) -> ClkResult {
        let tops = {
            let store = self.store();
            let mut tops = store.roots.clone();
            tops.extend_from_slice(&store.orphans);
            tops
        };
        for top in tops {
            self.save_subtree(top)?;
        }
        Ok(())
    }

    fn save_subtree(&self, id: ClkId) -> ClkResult {
        for child in self.children_of(id) {
            self.save_subtree(child)?;
        }
        let (ops, caps) = self.ops_of(id);
        if !caps.contains(Capabilities::SAVE_CONTEXT) {
            return Ok(());
        }
        self.pm_get(id)?;
        let result = ops.save_context(&self.hw(id));
        self.pm_put(id);
        result
    }

    /// Restore hardware context of every clock, parents before children
    pub fn restore_context(&self) {
        let ids = self.store().forest();
        for id in ids {
            let (ops, caps) = self.ops_of(id);
            if caps.contains(Capabilities::RESTORE_CONTEXT) && self.pm_get(id).is_ok() {
                ops.restore_context(&self.hw(id));
                self.pm_put(id);
            }
        }
    }

    /// Gate and unprepare every clock nobody has claimed
    ///
    /// Meant to run once, after all providers have registered and consumers had their chance
    /// to prepare what they need. Does nothing if [crate::ClockTreeConfig::ignore_unused] is
    /// set.
    pub fn disable_unused(&self) {
        if self.config().ignore_unused {
            log::warn!("clk: not disabling unused clocks");
            return;
        }
        log::info!("clk: disabling unused clocks");

        let _guard = self.locks.prepare();
        let tops = {
            let store = self.store();
            let mut tops = store.roots.clone();
            tops.extend_from_slice(&store.orphans);
            tops
        };
        for &top in &tops {
            self.disable_unused_subtree(top);
        }
        for &top in &tops {
            self.unprepare_unused_subtree(top);
        }
    }

    fn disable_unused_subtree(&self, id: ClkId) {
        for child in self.children_of(id) {
            self.disable_unused_subtree(child);
        }

        let (flags, parent) = {
            let store = self.store();
            (store[id].flags, store[id].parent)
        };
        let parent_enable = flags.contains(ClkFlags::OPS_PARENT_ENABLE);
        if parent_enable && self.core_prepare_enable(parent).is_err() {
            return;
        }

        if self.pm_get(id).is_ok() {
            self.locks.enable(|| {
                let count = self.store()[id].enable_count;
                if count > 0 || flags.contains(ClkFlags::IGNORE_UNUSED) {
                    return;
                }
                if !self.core_is_enabled(id) {
                    return;
                }
                let (ops, caps) = self.ops_of(id);
                tracepoint!(self, "clk_disable", id);
                if caps.contains(Capabilities::DISABLE_UNUSED) {
                    ops.disable_unused(&self.hw(id));
                } else if caps.contains(Capabilities::DISABLE) {
                    ops.disable(&self.hw(id));
                }
                tracepoint!(self, "clk_disable_complete", id);
            });
            self.pm_put(id);
        }

        if parent_enable {
            self.core_disable_unprepare(parent);
        }
    }

    fn unprepare_unused_subtree(&self, id: ClkId) {
        for child in self.children_of(id) {
            self.unprepare_unused_subtree(child);
        }

        let (count, flags) = {
            let store = self.store();
            (store[id].prepare_count, store[id].flags)
        };
        if count > 0 || flags.contains(ClkFlags::IGNORE_UNUSED) {
            return;
        }
        if self.pm_get(id).is_err() {
            return;
        }
        if self.core_is_prepared(id) {
            let (ops, caps) = self.ops_of(id);
            tracepoint!(self, "clk_unprepare", id);
            if caps.contains(Capabilities::UNPREPARE_UNUSED) {
                ops.unprepare_unused(&self.hw(id));
            } else if caps.contains(Capabilities::UNPREPARE) {
                ops.unprepare(&self.hw(id));
            }
            tracepoint!(self, "clk_unprepare_complete", id);
        }
        self.pm_put(id);
    }
}
