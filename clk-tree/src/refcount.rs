//! Prepare and enable reference counts
//!
//! Both counts propagate up the parent chain: the first prepare of a clock prepares its parent
//! first, and the last unprepare releases the parent afterwards. Enable works the same way under
//! the enable lock.
use crate::{trace::tracepoint, Capabilities, ClkError, ClkFlags, ClkId, ClkResult, ClockTree};

impl ClockTree {
    /// Prepare `id` and, on its first prepare, every ancestor
    ///
    /// Caller holds the prepare lock.
    pub(crate) fn core_prepare(&self, id: Option<ClkId>) -> ClkResult {
        let Some(id) = id else {
            return Ok(());
        };

        let (count, parent) = {
            let store = self.store();
            (store[id].prepare_count, store[id].parent)
        };
        if count == 0 {
            self.pm_get(id)?;
            if let Err(err) = self.core_prepare(parent) {
                self.pm_put(id);
                return Err(err);
            }

            let (ops, caps) = self.ops_of(id);
            tracepoint!(self, "clk_prepare", id);
            let result = if caps.contains(Capabilities::PREPARE) {
                ops.prepare(&self.hw(id))
            } else {
                Ok(())
            };
            tracepoint!(self, "clk_prepare_complete", id);

            if let Err(err) = result {
                self.core_unprepare(parent);
                self.pm_put(id);
                return Err(err);
            }
        }

        let gated = {
            let mut store = self.store();
            store[id].prepare_count += 1;
            store[id].flags.contains(ClkFlags::SET_RATE_GATE)
        };
        if gated {
            self.rate_protect(Some(id));
        }
        Ok(())
    }

    /// Drop a prepare reference, unpreparing ancestors when it was the last
    pub(crate) fn core_unprepare(&self, id: Option<ClkId>) {
        let Some(id) = id else {
            return;
        };

        let (count, enable_count, flags, parent) = {
            let store = self.store();
            let core = &store[id];
            (core.prepare_count, core.enable_count, core.flags, core.parent)
        };
        if count == 0 {
            log::warn!("clk: {} already unprepared", self.name_of(id));
            return;
        }
        if count == 1 && flags.contains(ClkFlags::IS_CRITICAL) {
            log::warn!("clk: refusing to unprepare critical {}", self.name_of(id));
            return;
        }
        if flags.contains(ClkFlags::SET_RATE_GATE) {
            self.rate_unprotect(Some(id));
        }

        let count = {
            let mut store = self.store();
            store[id].prepare_count -= 1;
            store[id].prepare_count
        };
        if count > 0 {
            return;
        }
        if enable_count > 0 {
            log::warn!("clk: unpreparing enabled {}", self.name_of(id));
        }

        let (ops, caps) = self.ops_of(id);
        tracepoint!(self, "clk_unprepare", id);
        if caps.contains(Capabilities::UNPREPARE) {
            ops.unprepare(&self.hw(id));
        }
        tracepoint!(self, "clk_unprepare_complete", id);

        self.pm_put(id);
        self.core_unprepare(parent);
    }

    /// Enable `id` and, on its first enable, every ancestor
    ///
    /// Caller holds the enable lock.
    pub(crate) fn core_enable(&self, id: Option<ClkId>) -> ClkResult {
        let Some(id) = id else {
            return Ok(());
        };

        let (prepare_count, enable_count, parent) = {
            let store = self.store();
            let core = &store[id];
            (core.prepare_count, core.enable_count, core.parent)
        };
        if prepare_count == 0 {
            log::warn!("clk: enabling unprepared {}", self.name_of(id));
            return Err(ClkError::Shutdown);
        }

        if enable_count == 0 {
            self.core_enable(parent)?;

            let (ops, caps) = self.ops_of(id);
            tracepoint!(self, "clk_enable", id);
            let result = if caps.contains(Capabilities::ENABLE) {
                ops.enable(&self.hw(id))
            } else {
                Ok(())
            };
            tracepoint!(self, "clk_enable_complete", id);

            if let Err(err) = result {
                self.core_disable(parent);
                return Err(err);
            }
        }

        self.store()[id].enable_count += 1;
        Ok(())
    }

    /// Drop an enable reference, disabling ancestors when it was the last
    pub(crate) fn core_disable(&self, id: Option<ClkId>) {
        let Some(id) = id else {
            return;
        };

        let (count, flags, parent) = {
            let store = self.store();
            let core = &store[id];
            (core.enable_count, core.flags, core.parent)
        };
        if count == 0 {
            log::warn!("clk: {} already disabled", self.name_of(id));
            return;
        }
        if count == 1 && flags.contains(ClkFlags::IS_CRITICAL) {
            log::warn!("clk: refusing to disable critical {}", self.name_of(id));
            return;
        }

        self.store()[id].enable_count -= 1;
        if count > 1 {
            return;
        }

        let (ops, caps) = self.ops_of(id);
        tracepoint!(self, "clk_disable", id);
        if caps.contains(Capabilities::DISABLE) {
            ops.disable(&self.hw(id));
        }
        tracepoint!(self, "clk_disable_complete", id);

        self.core_disable(parent);
    }

    pub(crate) fn core_enable_lock(&self, id: Option<ClkId>) -> ClkResult {
        self.locks.enable(|| self.core_enable(id))
    }

    pub(crate) fn core_disable_lock(&self, id: Option<ClkId>) {
        self.locks.enable(|| self.core_disable(id))
    }

    pub(crate) fn core_prepare_enable(&self, id: Option<ClkId>) -> ClkResult {
        self.core_prepare(id)?;
        if let Err(err) = self.core_enable_lock(id) {
            self.core_unprepare(id);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn core_disable_unprepare(&self, id: Option<ClkId>) {
        self.core_disable_lock(id);
        self.core_unprepare(id);
    }

    /// Whether hardware (or failing that, the core) says `id` is prepared
    pub(crate) fn core_is_prepared(&self, id: ClkId) -> bool {
        let (ops, caps) = self.ops_of(id);
        if !caps.contains(Capabilities::IS_PREPARED) {
            return self.store()[id].prepare_count > 0;
        }
        if self.pm_get(id).is_err() {
            return false;
        }
        let prepared = ops.is_prepared(&self.hw(id));
        self.pm_put(id);
        prepared
    }

    /// Whether hardware (or failing that, the core) says `id` is enabled
    pub(crate) fn core_is_enabled(&self, id: ClkId) -> bool {
        let (ops, caps) = self.ops_of(id);
        if !caps.contains(Capabilities::IS_ENABLED) {
            return self.store()[id].enable_count > 0;
        }
        // A suspended device can't be running its clock, and must not be woken up to ask
        let pm = self.store()[id].runtime_pm.clone();
        if pm.as_ref().is_some_and(|pm| !pm.is_active()) {
            return false;
        }
        ops.is_enabled(&self.hw(id))
    }

    /// Prepare a clock directly, as its provider
    pub fn prepare(&self, id: ClkId) -> ClkResult {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        self.core_prepare(Some(id))
    }

    /// Undo [ClockTree::prepare]
    pub fn unprepare(&self, id: ClkId) {
        let _guard = self.locks.prepare();
        if self.check_live(id).is_ok() {
            self.core_unprepare(Some(id));
        }
    }

    /// Enable a clock directly, as its provider
    pub fn enable(&self, id: ClkId) -> ClkResult {
        self.locks.enable(|| {
            self.check_live(id)?;
            self.core_enable(Some(id))
        })
    }

    /// Undo [ClockTree::enable]
    pub fn disable(&self, id: ClkId) {
        self.locks.enable(|| {
            if self.check_live(id).is_ok() {
                self.core_disable(Some(id));
            }
        })
    }

    /// Whether a clock is prepared, asking hardware when possible
    pub fn is_prepared(&self, id: ClkId) -> ClkResult<bool> {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        Ok(self.core_is_prepared(id))
    }

    /// Whether a clock is enabled, asking hardware when possible
    pub fn is_enabled(&self, id: ClkId) -> ClkResult<bool> {
        self.locks.enable(|| {
            self.check_live(id)?;
            Ok(self.core_is_enabled(id))
        })
    }
}
