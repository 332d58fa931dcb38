//! Consumer handles
//!
//! A [Clk] is one user's view of a clock: it carries that user's rate window and exclusive
//! claim. Dropping it releases both.
use crate::{
    node::Consumer, notifier::ClkNotifier, rate::clamp_rate, trace::tracepoint, ClkError, ClkId,
    ClkResult, ClockTree, ConsumerId, Duty, NotifierId, RateRequest,
};
use alloc::{string::String, sync::Arc};
use core::fmt;

/// A consumer's handle on a clock
pub struct Clk {
    tree: Arc<ClockTree>,
    consumer: ConsumerId,
    core: ClkId,
}

impl ClockTree {
    /// Create a handle on `id`
    ///
    /// Providers use this for clocks they registered themselves; everyone else goes through
    /// [ClockTree::obtain].
    pub fn get_clk(self: &Arc<Self>, id: ClkId, con_id: Option<&str>) -> ClkResult<Clk> {
        let _guard = self.locks.prepare();
        let mut store = self.store();
        if !store.is_live(id) {
            return Err(ClkError::NotFound);
        }
        let consumer = store.add_consumer(Consumer {
            core: id,
            dev_id: None,
            con_id: con_id.map(String::from),
            min_rate: 0,
            max_rate: u64::MAX,
            exclusive_count: 0,
        });
        Ok(Clk {
            tree: self.clone(),
            consumer,
            core: id,
        })
    }

    /// Drop one reference to a core, freeing it if it's unregistered and unreferenced
    pub(crate) fn put_core(&self, id: ClkId) {
        let mut store = self.store();
        let Some(core) = store.get_mut(id) else {
            return;
        };
        core.refs = core.refs.saturating_sub(1);
        if core.refs == 0 && !core.registered {
            drop(store);
            // Lock-free lookups check liveness under the enable lock
            self.locks.enable(|| self.store().remove(id));
        }
    }

    fn release(&self, consumer: ConsumerId) {
        let _guard = self.locks.prepare();
        let Some(state) = self.store().consumers.get(&consumer).cloned() else {
            return;
        };
        let id = state.core;

        if state.exclusive_count > 0 {
            log::warn!(
                "clk: {} released with {} exclusive claims",
                self.name_of(id),
                state.exclusive_count
            );
            {
                let mut store = self.store();
                let count = &mut store[id].protect_count;
                *count = count.saturating_sub(state.exclusive_count - 1);
            }
            self.rate_unprotect(Some(id));
        }

        let (registered, target_rate) = {
            let mut store = self.store();
            store.consumers.remove(&consumer);
            store[id].consumers.retain(|&other| other != consumer);
            (store[id].registered, store[id].target_rate)
        };
        self.remove_subscribers(consumer, |_| true);

        // Our window may have been what kept the clock away from its requested rate
        if registered && (state.min_rate > target_rate || state.max_rate < target_rate) {
            if let Err(err) = self.set_rate_nolock(id, target_rate) {
                log::debug!("clk: {}: failed to restore rate: {err}", self.name_of(id));
            }
        }

        self.put_core(id);
    }
}

impl Clk {
    /// The clock this handle refers to
    pub fn id(&self) -> ClkId {
        self.core
    }

    /// This handle's identity
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// The tree the clock lives in
    pub fn tree(&self) -> &Arc<ClockTree> {
        &self.tree
    }

    /// Check if two handles refer to the same clock
    pub fn is_match(&self, other: &Clk) -> bool {
        self.core == other.core
    }

    fn state(&self) -> Consumer {
        self.tree.store().consumers[&self.consumer].clone()
    }

    /// Run `f` with this handle's exclusive claim lifted
    ///
    /// Caller holds the prepare lock.
    fn unprotected<R>(&self, f: impl FnOnce() -> R) -> R {
        let exclusive = self.state().exclusive_count > 0;
        if exclusive {
            self.tree.rate_unprotect(Some(self.core));
        }
        let result = f();
        if exclusive {
            self.tree.rate_protect(Some(self.core));
        }
        result
    }

    pub fn prepare(&self) -> ClkResult {
        let _guard = self.tree.locks.prepare();
        self.tree.core_prepare(Some(self.core))
    }

    pub fn unprepare(&self) {
        let _guard = self.tree.locks.prepare();
        self.tree.core_unprepare(Some(self.core));
    }

    pub fn enable(&self) -> ClkResult {
        self.tree.core_enable_lock(Some(self.core))
    }

    pub fn disable(&self) {
        self.tree.core_disable_lock(Some(self.core));
    }

    pub fn prepare_enable(&self) -> ClkResult {
        self.prepare()?;
        if let Err(err) = self.enable() {
            self.unprepare();
            return Err(err);
        }
        Ok(())
    }

    pub fn disable_unprepare(&self) {
        self.disable();
        self.unprepare();
    }

    /// Whether the clock runs, asking hardware when it can
    pub fn is_enabled(&self) -> bool {
        self.tree.core_is_enabled(self.core)
    }

    pub fn get_rate(&self) -> u64 {
        let _guard = self.tree.locks.prepare();
        self.tree.rate_recalc_nolock(self.core)
    }

    /// The rate [Clk::set_rate] would achieve, without changing anything
    pub fn round_rate(&self, rate: u64) -> ClkResult<u64> {
        let _guard = self.tree.locks.prepare();
        self.unprotected(|| {
            let (min_rate, max_rate) = self.tree.store().boundaries(self.core);
            let mut req = RateRequest {
                rate: clamp_rate(rate, (min_rate, max_rate)),
                min_rate,
                max_rate,
                ..Default::default()
            };
            self.tree.round_rate_nolock(Some(self.core), &mut req)?;
            Ok(req.rate)
        })
    }

    /// Change the clock's rate, dragging along parents and children as needed
    pub fn set_rate(&self, rate: u64) -> ClkResult {
        let _guard = self.tree.locks.prepare();
        self.unprotected(|| self.tree.set_rate_nolock(self.core, rate))
    }

    /// Change the rate and claim it exclusively
    pub fn set_rate_exclusive(&self, rate: u64) -> ClkResult {
        let _guard = self.tree.locks.prepare();
        self.tree.set_rate_nolock(self.core, rate)?;
        self.tree.rate_protect(Some(self.core));
        self.tree
            .store()
            .consumers
            .entry(self.consumer)
            .and_modify(|state| state.exclusive_count += 1);
        Ok(())
    }

    /// Constrain the rate to `min..=max`, retuning if the requested rate falls outside
    pub fn set_rate_range(&self, min: u64, max: u64) -> ClkResult {
        if min > max {
            log::error!(
                "clk: {}: min rate {min} above max rate {max}",
                self.tree.name_of(self.core)
            );
            return Err(ClkError::InvalidArguments);
        }

        let _guard = self.tree.locks.prepare();
        tracepoint!(self.tree, "clk_set_rate_range", self.core, "{min}..={max}");
        self.unprotected(|| {
            let old = self.state();
            self.set_window(min, max);
            let target_rate = self.tree.store()[self.core].target_rate;
            let result = self.tree.set_rate_nolock(self.core, target_rate);
            if result.is_err() {
                self.set_window(old.min_rate, old.max_rate);
            }
            result
        })
    }

    fn set_window(&self, min: u64, max: u64) {
        self.tree
            .store()
            .consumers
            .entry(self.consumer)
            .and_modify(|state| {
                state.min_rate = min;
                state.max_rate = max;
            });
    }

    pub fn set_min_rate(&self, min: u64) -> ClkResult {
        self.set_rate_range(min, self.state().max_rate)
    }

    pub fn set_max_rate(&self, max: u64) -> ClkResult {
        self.set_rate_range(self.state().min_rate, max)
    }

    /// Switch to `parent`, which must be one of the clock's declared parents
    pub fn set_parent(&self, parent: Option<&Clk>) -> ClkResult {
        let _guard = self.tree.locks.prepare();
        self.unprotected(|| {
            self.tree
                .set_parent_nolock(self.core, parent.map(|parent| parent.core))
        })
    }

    pub fn get_parent(&self) -> Option<ClkId> {
        let _guard = self.tree.locks.prepare();
        self.tree.parent_of(self.core)
    }

    /// Whether `parent` is, or could become, this clock's parent
    pub fn has_parent(&self, parent: &Clk) -> bool {
        let _guard = self.tree.locks.prepare();
        self.tree.parent_of(self.core) == Some(parent.core)
            || self.tree.fetch_parent_index(self.core, parent.core).is_ok()
    }

    /// Accuracy in ppb
    pub fn get_accuracy(&self) -> u64 {
        let _guard = self.tree.locks.prepare();
        self.tree.accuracy_nolock(self.core)
    }

    /// Phase shift in degrees
    pub fn get_phase(&self) -> ClkResult<i32> {
        let _guard = self.tree.locks.prepare();
        self.tree.get_phase_nolock(self.core)
    }

    /// Shift the phase; any angle is accepted and wrapped into `0..360`
    pub fn set_phase(&self, degrees: i32) -> ClkResult {
        let _guard = self.tree.locks.prepare();
        self.unprotected(|| self.tree.set_phase_nolock(self.core, degrees))
    }

    pub fn get_duty_cycle(&self) -> ClkResult<Duty> {
        let _guard = self.tree.locks.prepare();
        self.tree.update_duty_cycle_nolock(self.core)?;
        Ok(self.tree.store()[self.core].duty)
    }

    /// Duty cycle as `scale * num / den`, e.g. a percentage with a scale of 100
    pub fn get_scaled_duty_cycle(&self, scale: u32) -> ClkResult<u32> {
        let _guard = self.tree.locks.prepare();
        self.tree.scaled_duty_cycle_nolock(self.core, scale)
    }

    /// Program a duty cycle of `num / den`
    pub fn set_duty_cycle(&self, num: u32, den: u32) -> ClkResult {
        let duty = Duty { num, den };
        if !duty.is_valid() {
            return Err(ClkError::InvalidArguments);
        }
        let _guard = self.tree.locks.prepare();
        self.unprotected(|| self.tree.set_duty_cycle_nolock(self.core, &duty))
    }

    /// Claim the clock's rate: nobody else may change it until [Clk::exclusive_put]
    pub fn exclusive_get(&self) -> ClkResult {
        let _guard = self.tree.locks.prepare();
        self.tree.rate_protect(Some(self.core));
        self.tree
            .store()
            .consumers
            .entry(self.consumer)
            .and_modify(|state| state.exclusive_count += 1);
        Ok(())
    }

    /// Drop a claim taken by [Clk::exclusive_get] or [Clk::set_rate_exclusive]
    pub fn exclusive_put(&self) {
        let _guard = self.tree.locks.prepare();
        if self.state().exclusive_count == 0 {
            log::warn!("clk: {}: unbalanced exclusive put", self.tree.name_of(self.core));
            return;
        }
        self.tree.rate_unprotect(Some(self.core));
        self.tree
            .store()
            .consumers
            .entry(self.consumer)
            .and_modify(|state| state.exclusive_count -= 1);
    }

    /// Subscribe to rate changes of this clock
    pub fn notifier_register(&self, notifier: Arc<dyn ClkNotifier>) -> ClkResult<NotifierId> {
        let _guard = self.tree.locks.prepare();
        Ok(self.tree.add_subscriber(self.consumer, self.core, notifier))
    }

    pub fn notifier_unregister(&self, id: NotifierId) -> ClkResult {
        let _guard = self.tree.locks.prepare();
        match self.tree.remove_subscribers(self.consumer, |other| other == id) {
            0 => Err(ClkError::InvalidArguments),
            _ => Ok(()),
        }
    }
}

impl Drop for Clk {
    fn drop(&mut self) {
        self.tree.release(self.consumer);
    }
}

impl fmt::Debug for Clk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clk")
            .field("core", &self.core)
            .field("consumer", &self.consumer)
            .finish()
    }
}
