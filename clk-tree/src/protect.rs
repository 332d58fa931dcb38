//! Rate protection
//!
//! A protected clock keeps its rate and parent. Protection propagates to every ancestor, so
//! nothing upstream can be retuned underneath it either.
use crate::{ClkId, ClockTree};

impl ClockTree {
    pub(crate) fn rate_protect(&self, id: Option<ClkId>) {
        let Some(id) = id else {
            return;
        };
        let (count, parent) = {
            let store = self.store();
            (store[id].protect_count, store[id].parent)
        };
        if count == 0 {
            self.rate_protect(parent);
        }
        self.store()[id].protect_count += 1;
    }

    pub(crate) fn rate_unprotect(&self, id: Option<ClkId>) {
        let Some(id) = id else {
            return;
        };
        let (count, parent) = {
            let mut store = self.store();
            let core = &mut store[id];
            if core.protect_count > 0 {
                core.protect_count -= 1;
                (core.protect_count, core.parent)
            } else {
                drop(store);
                log::warn!("clk: {} already unprotected", self.name_of(id));
                return;
            }
        };
        if count == 0 {
            self.rate_unprotect(parent);
        }
    }

    /// Drop all protection on `id` so a rate can be simulated, returning what was dropped
    pub(crate) fn rate_nuke_protect(&self, id: ClkId) -> u32 {
        let count = self.store()[id].protect_count;
        if count == 0 {
            return 0;
        }
        self.store()[id].protect_count = 1;
        self.rate_unprotect(Some(id));
        count
    }

    /// Undo [ClockTree::rate_nuke_protect]
    pub(crate) fn rate_restore_protect(&self, id: ClkId, count: u32) {
        if count == 0 {
            return;
        }
        self.rate_protect(Some(id));
        self.store()[id].protect_count = count;
    }
}

#[cfg(test)]
mod test {
    use crate::testing::{divider, fixed, test_tree, well_formed};
    use crate::{ClkError, ClkResult};

    #[test]
    fn exclusive_blocks_other_consumers() -> ClkResult<()> {
        let tree = test_tree();
        let osc = tree.register(fixed("osc", 24_000_000))?;
        let div = tree.register(divider("div", "osc", 2))?;
        let owner = tree.get_clk(div, Some("owner"))?;
        let other = tree.get_clk(div, Some("other"))?;

        owner.exclusive_get()?;
        assert_eq!(tree.summary(osc)?.protect_count, 1);
        assert_eq!(other.set_rate(6_000_000), Err(ClkError::Busy));
        assert_eq!(tree.rate(div)?, 12_000_000);

        // The owner may still retune
        owner.set_rate(8_000_000)?;
        assert_eq!(tree.rate(div)?, 8_000_000);
        assert_eq!(tree.summary(div)?.protect_count, 1);

        owner.exclusive_put();
        assert_eq!(tree.summary(osc)?.protect_count, 0);
        other.set_rate(6_000_000)?;
        assert_eq!(tree.rate(div)?, 6_000_000);
        well_formed(&tree);
        Ok(())
    }

    #[test]
    fn nuke_and_restore() -> ClkResult<()> {
        let tree = test_tree();
        let osc = tree.register(fixed("osc", 1))?;
        let div = tree.register(divider("div", "osc", 1))?;
        tree.rate_protect(Some(div));
        tree.rate_protect(Some(div));
        let _guard = tree.locks.prepare();
        let count = tree.rate_nuke_protect(div);
        assert_eq!(count, 2);
        assert_eq!(tree.summary(osc)?.protect_count, 0);
        assert_eq!(tree.summary(div)?.protect_count, 0);
        tree.rate_restore_protect(div, count);
        assert_eq!(tree.summary(osc)?.protect_count, 1);
        assert_eq!(tree.summary(div)?.protect_count, 2);
        Ok(())
    }

    #[test]
    fn gate_flag_protects_while_prepared() -> ClkResult<()> {
        let tree = test_tree();
        tree.register(fixed("osc", 24_000_000))?;
        let div = tree.register(
            divider("div", "osc", 2).flags(crate::ClkFlags::SET_RATE_GATE),
        )?;
        let a = tree.get_clk(div, None)?;
        let b = tree.get_clk(div, None)?;
        a.prepare()?;
        assert_eq!(b.set_rate(6_000_000), Err(ClkError::Busy));
        a.unprepare();
        b.set_rate(6_000_000)?;
        Ok(())
    }
}
