//! Rate planning and the two-phase rate change
//!
//! A rate change first plans new rates (and possibly new parents) for the affected subtree
//! without touching hardware. Subscribers then get a chance to veto. Only then is the plan
//! committed, top-down, so a parent is always reprogrammed before its children.
use crate::{
    notifier::RateEvent, trace::tracepoint, Capabilities, ClkError, ClkFlags, ClkHw, ClkId,
    ClkResult, ClockTree, NotifyResult, RateRequest,
};
use alloc::collections::BTreeMap;

/// Planned outcome for one clock
#[derive(Copy, Clone, Debug, Default)]
struct Planned {
    new_rate: u64,
    new_parent: Option<ClkId>,
    new_parent_index: u8,
    /// A clock switching over to us, not yet in our child list
    new_child: Option<ClkId>,
}

/// Scratch state of one rate-change transaction
#[derive(Default)]
pub(crate) struct RatePlan {
    entries: BTreeMap<ClkId, Planned>,
}

impl RatePlan {
    fn get(&self, id: ClkId) -> Planned {
        self.entries.get(&id).copied().unwrap_or_default()
    }

    fn entry(&mut self, id: ClkId) -> &mut Planned {
        self.entries.entry(id).or_default()
    }
}

/// Clamp `rate` into a window, favoring the upper bound if the window is empty
pub(crate) fn clamp_rate(rate: u64, (min, max): (u64, u64)) -> u64 {
    rate.max(min).min(max)
}

fn mux_is_better_rate(rate: u64, now: u64, best: u64, flags: ClkFlags) -> bool {
    if flags.contains(ClkFlags::MUX_ROUND_CLOSEST) {
        return now.abs_diff(rate) < best.abs_diff(rate);
    }
    now <= rate && now > best
}

/// Pick the parent of a mux that best serves `req`
///
/// By default this is the fastest parent not above the requested rate. With
/// [ClkFlags::MUX_ROUND_CLOSEST] it's the closest one in either direction. With
/// [ClkFlags::SET_RATE_PARENT] each candidate is asked what it could do rather than what it
/// runs at now. With [ClkFlags::SET_RATE_NO_REPARENT] the current parent is kept.
///
/// Meant to be called from [crate::ClkOps::determine_rate].
pub fn determine_mux_rate(hw: &ClkHw<'_>, req: &mut RateRequest) -> ClkResult {
    let tree = hw.tree();
    let flags = hw.flags();
    let mut best_parent = None;
    let mut best = 0;

    if flags.contains(ClkFlags::SET_RATE_NO_REPARENT) {
        let parent = hw.parent();
        if flags.contains(ClkFlags::SET_RATE_PARENT) {
            let mut parent_req = *req;
            tree.round_rate_nolock(parent, &mut parent_req)?;
            best = parent_req.rate;
        } else if let Some(parent) = parent {
            best = hw.rate_of(parent);
        } else {
            best = hw.rate();
        }
    } else {
        for index in 0..hw.num_parents() {
            let Some(parent) = hw.parent_by_index(index) else {
                continue;
            };

            let mut parent_req = *req;
            if flags.contains(ClkFlags::SET_RATE_PARENT) {
                if tree.round_rate_nolock(Some(parent), &mut parent_req).is_err() {
                    continue;
                }
            } else {
                parent_req.rate = hw.rate_of(parent);
            }

            if mux_is_better_rate(req.rate, parent_req.rate, best, flags) {
                best_parent = Some(parent);
                best = parent_req.rate;
            }
        }

        if best_parent.is_none() {
            return Err(ClkError::InvalidArguments);
        }
    }

    if best_parent.is_some() {
        req.best_parent = best_parent;
    }
    req.best_parent_rate = best;
    req.rate = best;
    Ok(())
}

impl ClockTree {
    fn init_rate_req(&self, id: ClkId, req: &mut RateRequest) {
        let store = self.store();
        req.best_parent = store[id].parent;
        req.best_parent_rate = store[id].parent.map_or(0, |parent| store[parent].rate);
    }

    fn determine_round_nolock(&self, id: ClkId, req: &mut RateRequest) -> ClkResult {
        let protected_rate = {
            let store = self.store();
            store.is_protected(id).then(|| store[id].rate)
        };
        if let Some(rate) = protected_rate {
            req.rate = rate;
            return Ok(());
        }

        let (ops, caps) = self.ops_of(id);
        if caps.contains(Capabilities::DETERMINE_RATE) {
            ops.determine_rate(&self.hw(id), req)
        } else if caps.contains(Capabilities::ROUND_RATE) {
            let mut parent_rate = req.best_parent_rate;
            req.rate = ops.round_rate(&self.hw(id), req.rate, &mut parent_rate)?;
            req.best_parent_rate = parent_rate;
            Ok(())
        } else {
            Err(ClkError::InvalidArguments)
        }
    }

    /// Ask `id` (or the first ancestor able to answer) what it can do for `req`
    pub(crate) fn round_rate_nolock(&self, id: Option<ClkId>, req: &mut RateRequest) -> ClkResult {
        let Some(id) = id else {
            req.rate = 0;
            return Ok(());
        };

        self.init_rate_req(id, req);
        let (caps, flags, parent, rate) = {
            let store = self.store();
            let core = &store[id];
            (core.caps, core.flags, core.parent, core.rate)
        };
        if caps.can_round() {
            self.determine_round_nolock(id, req)
        } else if flags.contains(ClkFlags::SET_RATE_PARENT) {
            self.round_rate_nolock(parent, req)
        } else {
            req.rate = rate;
            Ok(())
        }
    }

    /// The rate `id` would settle on if nothing protected it, or zero if it can't tell
    fn req_round_rate_nolock(&self, id: ClkId, req_rate: u64) -> u64 {
        let count = self.rate_nuke_protect(id);
        let (min_rate, max_rate) = self.store().boundaries(id);
        let mut req = RateRequest {
            rate: req_rate,
            min_rate,
            max_rate,
            ..Default::default()
        };
        let result = self.round_rate_nolock(Some(id), &mut req);
        self.rate_restore_protect(id, count);
        result.map_or(0, |()| req.rate)
    }

    /// Plan `rate` for `id`, returning the topmost clock that has to change
    fn calc_new_rates(&self, plan: &mut RatePlan, id: ClkId, rate: u64) -> ClkResult<ClkId> {
        let (old_parent, flags, caps, prepare_count, num_parents, own_rate, window) = {
            let store = self.store();
            let core = &store[id];
            (
                core.parent,
                core.flags,
                core.caps,
                core.prepare_count,
                core.parents.len(),
                core.rate,
                store.boundaries(id),
            )
        };
        let mut top = id;
        let mut parent = old_parent;
        let mut p_index = 0;

        if !caps.can_round() {
            return match parent {
                Some(parent) if flags.contains(ClkFlags::SET_RATE_PARENT) => {
                    // Pass-through clock with adjustable parent
                    let top = self.calc_new_rates(plan, parent, rate)?;
                    let new_rate = plan.get(parent).new_rate;
                    self.calc_subtree(plan, id, new_rate, Some(parent), 0);
                    Ok(top)
                }
                _ => {
                    plan.entry(id).new_rate = own_rate;
                    Err(ClkError::InvalidArguments)
                }
            };
        }

        let mut req = RateRequest {
            rate,
            min_rate: window.0,
            max_rate: window.1,
            ..Default::default()
        };
        self.init_rate_req(id, &mut req);
        self.determine_round_nolock(id, &mut req)?;
        let best_parent_rate = req.best_parent_rate;
        let new_rate = req.rate;
        parent = req.best_parent;
        if new_rate < window.0 || new_rate > window.1 {
            log::debug!(
                "clk: {} can't reach {rate} within [{}, {}]",
                self.name_of(id),
                window.0,
                window.1
            );
            return Err(ClkError::NotFound);
        }

        if parent != old_parent && flags.contains(ClkFlags::SET_PARENT_GATE) && prepare_count > 0 {
            log::debug!("clk: {} not gated but wants to reparent", self.name_of(id));
            return Err(ClkError::Busy);
        }

        if let Some(parent) = parent.filter(|_| num_parents > 1) {
            let index = self.fetch_parent_index(id, parent)?;
            p_index = u8::try_from(index).map_err(|_| ClkError::InvalidArguments)?;
        }

        if let Some(parent) = parent.filter(|_| flags.contains(ClkFlags::SET_RATE_PARENT)) {
            if best_parent_rate != self.store()[parent].rate {
                top = self.calc_new_rates(plan, parent, best_parent_rate)?;
            }
        }

        self.calc_subtree(plan, id, new_rate, parent, p_index);
        Ok(top)
    }

    /// Record the plan for `id` and derive its descendants' rates from it
    fn calc_subtree(
        &self,
        plan: &mut RatePlan,
        id: ClkId,
        new_rate: u64,
        new_parent: Option<ClkId>,
        p_index: u8,
    ) {
        let old_parent = self.parent_of(id);
        *plan.entry(id) = Planned {
            new_rate,
            new_parent,
            new_parent_index: p_index,
            new_child: None,
        };
        if let Some(new_parent) = new_parent.filter(|&parent| Some(parent) != old_parent) {
            plan.entry(new_parent).new_child = Some(id);
        }

        for child in self.children_of(id) {
            let child_rate = self.recalc(child, new_rate);
            self.calc_subtree(plan, child, child_rate, None, 0);
        }
    }

    /// Deliver `event` down the planned subtree, returning the last clock that vetoed
    fn propagate_rate_change(
        &self,
        plan: &RatePlan,
        id: ClkId,
        event: RateEvent,
    ) -> Option<ClkId> {
        let planned = plan.get(id);
        let (rate, notifier_count) = {
            let store = self.store();
            (store[id].rate, store[id].notifier_count)
        };
        if rate == planned.new_rate {
            return None;
        }

        let mut failed = None;
        if notifier_count > 0
            && self
                .notify(id, event, rate, planned.new_rate)
                .contains(NotifyResult::STOP)
        {
            failed = Some(id);
        }

        for child in self.children_of(id) {
            // Skip children who will be reparented to another clock
            if plan.get(child).new_parent.is_some_and(|parent| parent != id) {
                continue;
            }
            if let Some(child_failed) = self.propagate_rate_change(plan, child, event) {
                failed = Some(child_failed);
            }
        }

        if let Some(new_child) = planned.new_child {
            if let Some(child_failed) = self.propagate_rate_change(plan, new_child, event) {
                failed = Some(child_failed);
            }
        }

        failed
    }

    /// Commit the plan for `id`, then for its subtree
    fn change_rate(&self, plan: &mut RatePlan, id: ClkId) {
        let planned = plan.get(id);
        let (old_rate, old_parent, flags) = {
            let store = self.store();
            (store[id].rate, store[id].parent, store[id].flags)
        };
        let parent = planned.new_parent.or(old_parent);
        let best_parent_rate = parent.map_or(0, |parent| self.store()[parent].rate);
        let (ops, caps) = self.ops_of(id);
        let hw = self.hw(id);

        if self.pm_get(id).is_err() {
            return;
        }

        let ungate = flags.contains(ClkFlags::SET_RATE_UNGATE);
        if ungate {
            if let Err(err) = self.core_prepare(Some(id)) {
                log::warn!("clk: {}: failed to prepare for rate change: {err}", self.name_of(id));
            }
            if let Err(err) = self.core_enable_lock(Some(id)) {
                log::warn!("clk: {}: failed to enable for rate change: {err}", self.name_of(id));
            }
        }

        let mut skip_set_rate = false;
        if let Some(new_parent) = planned.new_parent.filter(|&parent| Some(parent) != old_parent) {
            let previous = self.set_parent_before(id, Some(new_parent));
            if plan.get(new_parent).new_child == Some(id) {
                plan.entry(new_parent).new_child = None;
            }

            tracepoint!(self, "clk_set_parent", id, "-> {}", self.name_of(new_parent));
            let result = if caps.contains(Capabilities::SET_RATE_AND_PARENT) {
                skip_set_rate = true;
                ops.set_rate_and_parent(
                    &hw,
                    planned.new_rate,
                    best_parent_rate,
                    planned.new_parent_index,
                )
            } else if caps.contains(Capabilities::SET_PARENT) {
                ops.set_parent(&hw, planned.new_parent_index)
            } else {
                Ok(())
            };
            tracepoint!(self, "clk_set_parent_complete", id, "-> {}", self.name_of(new_parent));
            if let Err(err) = result {
                log::warn!("clk: {}: failed to switch parent: {err}", self.name_of(id));
            }

            self.set_parent_after(id, Some(new_parent), previous);
        }

        let parent_enable = flags.contains(ClkFlags::OPS_PARENT_ENABLE);
        if parent_enable {
            if let Err(err) = self.core_prepare_enable(parent) {
                log::warn!("clk: {}: failed to enable parent: {err}", self.name_of(id));
            }
        }

        tracepoint!(self, "clk_set_rate", id, "{}", planned.new_rate);
        if !skip_set_rate && caps.contains(Capabilities::SET_RATE) {
            if let Err(err) = ops.set_rate(&hw, planned.new_rate, best_parent_rate) {
                log::warn!("clk: {}: failed to set rate: {err}", self.name_of(id));
            }
        }
        tracepoint!(self, "clk_set_rate_complete", id, "{}", planned.new_rate);

        let rate = self.recalc(id, best_parent_rate);
        let notify = {
            let mut store = self.store();
            store[id].rate = rate;
            store[id].notifier_count > 0
        };

        if ungate {
            self.core_disable_lock(Some(id));
            self.core_unprepare(Some(id));
        }
        if parent_enable {
            self.core_disable_unprepare(parent);
        }

        if notify && old_rate != rate {
            self.notify(id, RateEvent::PostChange, old_rate, rate);
        }

        if flags.contains(ClkFlags::RECALC_NEW_RATES) {
            // Only refreshes the plan for the children below
            let _ = self.calc_new_rates(plan, id, planned.new_rate);
        }

        for child in self.children_of(id) {
            // Skip children who will be reparented to another clock
            if plan.get(child).new_parent.is_some_and(|parent| parent != id) {
                continue;
            }
            self.change_rate(plan, child);
        }

        // The new child might not be in our child list yet
        if let Some(new_child) = plan.get(id).new_child {
            self.change_rate(plan, new_child);
        }

        self.pm_put(id);
    }

    /// Change the rate of `id` and everything it drags along
    ///
    /// Caller holds the prepare lock.
    pub(crate) fn set_rate_nolock(&self, id: ClkId, req_rate: u64) -> ClkResult {
        let (window, current) = {
            let store = self.store();
            (store.boundaries(id), store.rate_nolock(id))
        };
        if window.0 > window.1 {
            log::error!(
                "clk: {}: no rate within {}..={} satisfies every consumer",
                self.name_of(id),
                window.0,
                window.1
            );
            return Err(ClkError::InvalidArguments);
        }
        let target_rate = req_rate;
        let req_rate = clamp_rate(req_rate, window);

        let rate = self.req_round_rate_nolock(id, req_rate);
        if rate == current {
            let mut store = self.store();
            store[id].req_rate = req_rate;
            store[id].target_rate = target_rate;
            return Ok(());
        }
        if self.store().is_protected(id) {
            return Err(ClkError::Busy);
        }

        let mut plan = RatePlan::default();
        let top = self.calc_new_rates(&mut plan, id, req_rate)?;

        self.pm_get(id)?;

        if let Some(failed) = self.propagate_rate_change(&plan, top, RateEvent::PreChange) {
            log::debug!(
                "clk: rate change of {} vetoed by a subscriber of {}",
                self.name_of(id),
                self.name_of(failed)
            );
            self.propagate_rate_change(&plan, top, RateEvent::AbortChange);
            self.pm_put(id);
            return Err(ClkError::Busy);
        }

        self.change_rate(&mut plan, top);
        {
            let mut store = self.store();
            store[id].req_rate = req_rate;
            store[id].target_rate = target_rate;
        }
        self.pm_put(id);
        Ok(())
    }

    /// Rate `id` would settle on for `rate`, without changing anything
    pub fn round_rate(&self, id: ClkId, rate: u64) -> ClkResult<u64> {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        let (min_rate, max_rate) = self.store().boundaries(id);
        let mut req = RateRequest {
            rate,
            min_rate,
            max_rate,
            ..Default::default()
        };
        self.round_rate_nolock(Some(id), &mut req)?;
        Ok(req.rate)
    }

    /// Set the range a clock itself can run at, independent of consumers
    pub fn set_rate_range(&self, id: ClkId, min_rate: u64, max_rate: u64) -> ClkResult {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        let mut store = self.store();
        store[id].min_rate = min_rate;
        store[id].max_rate = max_rate;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{divider, fixed, mux, test_tree, well_formed, Kind, TestClk};
    use crate::{ClkInitData, RateChange};
    use alloc::{format, string::String, sync::Arc, vec::Vec};
    use rand::Rng;
    use spin::Mutex;

    fn watch(clk: &crate::Clk, log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> ClkResult<()> {
        let log = log.clone();
        clk.notifier_register(Arc::new(move |event: RateEvent, change: &RateChange| {
            log.lock()
                .push(format!("{name}:{event:?}:{}->{}", change.old_rate, change.new_rate));
            NotifyResult::OK
        }))?;
        Ok(())
    }

    #[test]
    fn linear_chain() -> ClkResult<()> {
        let tree = test_tree();
        let log = TestClk::shared_log();
        let a = tree.register(fixed("A", 24_000_000))?;
        let b = tree.register(
            ClkInitData::new("B", TestClk::with_log(Kind::divider(2), log.clone()))
                .parent_names(&["A"]),
        )?;
        let c = tree.register(
            ClkInitData::new("C", TestClk::with_log(Kind::divider(3), log.clone()))
                .parent_names(&["B"])
                .flags(ClkFlags::SET_RATE_PARENT),
        )?;
        let (ha, hb, hc) = (tree.get_clk(a, None)?, tree.get_clk(b, None)?, tree.get_clk(c, None)?);
        for (handle, name) in [(&ha, "A"), (&hb, "B"), (&hc, "C")] {
            watch(handle, &log, name)?;
        }

        hc.set_rate(2_000_000)?;
        assert_eq!(tree.rate(a)?, 24_000_000);
        assert_eq!(tree.rate(b)?, 6_000_000);
        assert_eq!(tree.rate(c)?, 2_000_000);
        assert_eq!(
            *log.lock(),
            [
                "B:PreChange:12000000->6000000",
                "C:PreChange:4000000->2000000",
                "B:set_rate(6000000)",
                "B:PostChange:12000000->6000000",
                "C:set_rate(2000000)",
                "C:PostChange:4000000->2000000",
            ]
        );
        well_formed(&tree);
        Ok(())
    }

    #[test]
    fn mux_reparent() -> ClkResult<()> {
        let tree = test_tree();
        let log = TestClk::shared_log();
        let p0 = tree.register(fixed("P0", 100_000_000))?;
        let p1 = tree.register(fixed("P1", 50_000_000))?;
        let m = tree.register(
            ClkInitData::new("M", TestClk::with_log(Kind::mux(0), log.clone()))
                .parent_names(&["P0", "P1"])
                .flags(ClkFlags::MUX_ROUND_CLOSEST),
        )?;
        let handle = tree.get_clk(m, None)?;
        watch(&handle, &log, "M")?;
        assert_eq!(tree.parent(m)?, Some(p0));

        handle.set_rate(40_000_000)?;
        assert_eq!(tree.parent(m)?, Some(p1));
        assert_eq!(tree.rate(m)?, 50_000_000);
        assert!(tree.children(p0)?.is_empty());
        assert_eq!(
            *log.lock(),
            [
                "M:PreChange:100000000->50000000",
                "M:set_parent(1)",
                "M:PostChange:100000000->50000000",
            ]
        );
        well_formed(&tree);
        Ok(())
    }

    #[test]
    fn mux_default_policy_stays_below() -> ClkResult<()> {
        let tree = test_tree();
        tree.register(fixed("P0", 100_000_000))?;
        let p1 = tree.register(fixed("P1", 50_000_000))?;
        let m = tree.register(mux("M", &["P0", "P1"], 0))?;
        assert_eq!(tree.round_rate(m, 80_000_000)?, 50_000_000);
        let handle = tree.get_clk(m, None)?;
        handle.set_rate(80_000_000)?;
        assert_eq!(tree.parent(m)?, Some(p1));
        // Nothing fits below 10M
        assert_eq!(handle.set_rate(10_000_000), Err(ClkError::InvalidArguments));
        Ok(())
    }

    #[test]
    fn mux_migrates_enable_state() -> ClkResult<()> {
        let tree = test_tree();
        let log = TestClk::shared_log();
        let p0 = TestClk::with_log(Kind::Fixed(100), log.clone());
        let p0 = tree.register(ClkInitData::new("P0", p0))?;
        let p1 = TestClk::with_log(Kind::Fixed(50), log.clone());
        let p1 = tree.register(ClkInitData::new("P1", p1))?;
        let m = tree.register(
            ClkInitData::new("M", TestClk::with_log(Kind::mux(0), log.clone()))
                .parent_names(&["P0", "P1"]),
        )?;
        let handle = tree.get_clk(m, None)?;
        handle.prepare_enable()?;
        handle.set_rate(50)?;
        assert_eq!(tree.summary(p0)?.prepare_count, 0);
        assert_eq!(tree.summary(p0)?.enable_count, 0);
        assert_eq!(tree.summary(p1)?.prepare_count, 1);
        assert_eq!(tree.summary(p1)?.enable_count, 1);
        well_formed(&tree);
        Ok(())
    }

    #[test]
    fn parent_gate_refuses_while_prepared() -> ClkResult<()> {
        let tree = test_tree();
        tree.register(fixed("P0", 100))?;
        tree.register(fixed("P1", 50))?;
        let m = tree.register(
            mux("M", &["P0", "P1"], 0).flags(ClkFlags::SET_PARENT_GATE),
        )?;
        let handle = tree.get_clk(m, None)?;
        handle.prepare()?;
        assert_eq!(handle.set_rate(50), Err(ClkError::Busy));
        assert_eq!(tree.rate(m)?, 100);
        handle.unprepare();
        handle.set_rate(50)?;
        assert_eq!(tree.rate(m)?, 50);
        Ok(())
    }

    #[test]
    fn abort_rolls_back() -> ClkResult<()> {
        let tree = test_tree();
        let log = TestClk::shared_log();
        let a = tree.register(fixed("A", 24_000_000))?;
        let b_ops = TestClk::with_log(Kind::divider(2), log.clone());
        let b = tree.register(ClkInitData::new("B", b_ops).parent_names(&["A"]))?;
        let c_ops = TestClk::with_log(Kind::divider(3), log.clone());
        let c = tree.register(
            ClkInitData::new("C", c_ops)
                .parent_names(&["B"])
                .flags(ClkFlags::SET_RATE_PARENT),
        )?;
        let hb = tree.get_clk(b, None)?;
        let hc = tree.get_clk(c, None)?;
        watch(&hb, &log, "B")?;
        let events = log.clone();
        hc.notifier_register(Arc::new(move |event: RateEvent, _: &RateChange| {
            events.lock().push(format!("C:{event:?}"));
            if event == RateEvent::PreChange {
                NotifyResult::BAD
            } else {
                NotifyResult::OK
            }
        }))?;

        assert_eq!(hc.set_rate(2_000_000), Err(ClkError::Busy));
        assert_eq!(tree.rate(a)?, 24_000_000);
        assert_eq!(tree.rate(b)?, 12_000_000);
        assert_eq!(tree.rate(c)?, 4_000_000);
        assert_eq!(
            *log.lock(),
            [
                "B:PreChange:12000000->6000000",
                "C:PreChange",
                "B:AbortChange:12000000->6000000",
                "C:AbortChange",
            ]
        );
        Ok(())
    }

    #[test]
    fn out_of_window() -> ClkResult<()> {
        let tree = test_tree();
        tree.register(fixed("osc", 24_000_000))?;
        let div = tree.register(divider("div", "osc", 1))?;
        let handle = tree.get_clk(div, None)?;
        assert_eq!(
            handle.set_rate_range(13_000_000, 20_000_000),
            Err(ClkError::NotFound)
        );
        assert_eq!(tree.rate(div)?, 24_000_000);
        // The failed range was rolled back
        handle.set_rate(8_000_000)?;
        assert_eq!(tree.rate(div)?, 8_000_000);
        Ok(())
    }

    #[test]
    fn disjoint_windows_are_refused() -> ClkResult<()> {
        let tree = test_tree();
        tree.register(fixed("osc", 24_000_000))?;
        let div = tree.register(divider("div", "osc", 2))?;
        let a = tree.get_clk(div, None)?;
        let b = tree.get_clk(div, None)?;
        a.set_max_rate(12_000_000)?;
        assert_eq!(b.set_min_rate(20_000_000), Err(ClkError::InvalidArguments));
        assert_eq!(tree.store().boundaries(div), (0, 12_000_000));
        assert_eq!(tree.rate(div)?, 12_000_000);

        // Overlapping is fine again
        b.set_min_rate(6_000_000)?;
        assert_eq!(tree.store().boundaries(div), (6_000_000, 12_000_000));
        Ok(())
    }

    #[test]
    fn pass_through_forwards_to_parent() -> ClkResult<()> {
        let tree = test_tree();
        let log = TestClk::shared_log();
        tree.register(fixed("osc", 24_000_000))?;
        let d = tree.register(
            ClkInitData::new("d", TestClk::with_log(Kind::divider(1), log.clone()))
                .parent_names(&["osc"]),
        )?;
        let g = tree.register(
            ClkInitData::new("g", TestClk::with_log(Kind::gate(), log.clone()))
                .parent_names(&["d"])
                .flags(ClkFlags::SET_RATE_PARENT),
        )?;
        let handle = tree.get_clk(g, None)?;
        assert_eq!(handle.round_rate(8_000_000)?, 8_000_000);
        handle.set_rate(8_000_000)?;
        assert_eq!(tree.rate(d)?, 8_000_000);
        assert_eq!(tree.rate(g)?, 8_000_000);
        assert_eq!(*log.lock(), ["d:set_rate(8000000)"]);
        Ok(())
    }

    #[test]
    fn parent_switch_kept_when_rate_fails() -> ClkResult<()> {
        let tree = test_tree();
        tree.register(fixed("P0", 100))?;
        let p1 = tree.register(fixed("P1", 60))?;
        let ops = TestClk::new(Kind::divmux(0, 1));
        ops.fail("set_rate");
        let m = tree.register(ClkInitData::new("M", ops.clone()).parent_names(&["P0", "P1"]))?;
        let handle = tree.get_clk(m, None)?;
        handle.set_rate(30)?;
        assert_eq!(tree.parent(m)?, Some(p1));
        // Divider stayed at 1, so the rate is whatever the new parent gives
        assert_eq!(tree.rate(m)?, 60);
        assert_eq!(ops.ops(), ["M:set_parent(1)"]);
        Ok(())
    }

    #[test]
    fn set_rate_is_idempotent() -> ClkResult<()> {
        let mut rng = rand::thread_rng();
        let tree = test_tree();
        tree.register(fixed("osc", 48_000_000))?;
        let ops = TestClk::new(Kind::divider(1));
        let div = tree.register(ClkInitData::new("div", ops.clone()).parent_names(&["osc"]))?;
        let handle = tree.get_clk(div, None)?;
        for _ in 0..500 {
            let rate = rng.gen_range(1..=48_000_000);
            let rounded = handle.round_rate(rate)?;
            ops.clear_ops();
            handle.set_rate(rate)?;
            handle.set_rate(rate)?;
            assert_eq!(tree.rate(div)?, rounded);
            assert!(ops.ops().len() <= 1);
        }
        Ok(())
    }

    #[test]
    fn window_holds_after_set_rate() -> ClkResult<()> {
        let mut rng = rand::thread_rng();
        let tree = test_tree();
        tree.register(fixed("osc", 48_000_000))?;
        let div = tree.register(divider("div", "osc", 1))?;
        let a = tree.get_clk(div, None)?;
        let b = tree.get_clk(div, None)?;
        for _ in 0..500 {
            let min = rng.gen_range(1..=24_000_000);
            let max = rng.gen_range(min..=48_000_000);
            b.set_rate_range(0, u64::MAX)?;
            if b.set_rate_range(min, max).is_err() {
                continue;
            }
            if a.set_rate(rng.gen_range(1..=96_000_000)).is_ok() {
                let req_rate = tree.summary(div)?.req_rate;
                assert!(min <= req_rate && req_rate <= max);
            }
        }
        Ok(())
    }

    #[test]
    fn random_chain_coherence() -> ClkResult<()> {
        // Whatever gets planned through SET_RATE_PARENT chains matches the round
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let tree = test_tree();
            tree.register(ClkInitData::new("pll", TestClk::new(Kind::pll(100_000_000))))?;
            let mut parent = String::from("pll");
            let mut leaf = None;
            for i in 0..rng.gen_range(1..4) {
                let name = format!("d{i}");
                let mut init = divider(&name, &parent, rng.gen_range(1..5));
                if rng.gen::<bool>() {
                    init = init.flags(ClkFlags::SET_RATE_PARENT);
                }
                leaf = Some(tree.register(init)?);
                parent = name;
            }
            let leaf = tree.get_clk(leaf.ok_or(ClkError::NotFound)?, None)?;
            for _ in 0..20 {
                let rate = rng.gen_range(1_000_000..=200_000_000);
                let rounded = leaf.round_rate(rate)?;
                if leaf.set_rate(rate).is_ok() {
                    assert_eq!(leaf.get_rate(), rounded);
                }
                well_formed(&tree);
            }
        }
        Ok(())
    }
}
