//! Registering and unregistering clocks
use crate::{
    node::ClkCore, parent_map::ParentSlot, provider::DescriptionNode, Capabilities, ClkError,
    ClkFlags, ClkHw, ClkId, ClkOps, ClkResult, ClockTree, ParentData, RuntimePm,
};
use alloc::{string::String, sync::Arc, vec::Vec};

/// Everything needed to register a clock
pub struct ClkInitData {
    name: String,
    ops: Arc<dyn ClkOps>,
    parents: Vec<ParentData>,
    flags: ClkFlags,
    description: Option<Arc<dyn DescriptionNode>>,
    runtime_pm: Option<Arc<dyn RuntimePm>>,
}

impl ClkInitData {
    /// A parentless clock called `name`
    pub fn new(name: &str, ops: Arc<dyn ClkOps>) -> Self {
        Self {
            name: String::from(name),
            ops,
            parents: Vec::new(),
            flags: ClkFlags::empty(),
            description: None,
            runtime_pm: None,
        }
    }

    /// Declare parents by global name
    pub fn parent_names(mut self, names: &[&str]) -> Self {
        self.parents = names.iter().map(|name| ParentData::name(name)).collect();
        self
    }

    /// Declare parents by id
    pub fn parent_hws(mut self, hws: &[ClkId]) -> Self {
        self.parents = hws.iter().map(|&hw| ParentData::hw(hw)).collect();
        self
    }

    /// Declare parents in full
    pub fn parent_data(mut self, parents: impl IntoIterator<Item = ParentData>) -> Self {
        self.parents = parents.into_iter().collect();
        self
    }

    /// Add flags
    pub fn flags(mut self, flags: ClkFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// The clock's node in the hardware description, for resolving parents by description
    pub fn description(mut self, description: Arc<dyn DescriptionNode>) -> Self {
        self.description = Some(description);
        self
    }

    /// Power management for the device behind the clock
    pub fn runtime_pm(mut self, runtime_pm: Arc<dyn RuntimePm>) -> Self {
        self.runtime_pm = Some(runtime_pm);
        self
    }
}

/// What a clock does once its driver is gone
struct NoDriverOps;

impl ClkOps for NoDriverOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::PREPARE
            | Capabilities::UNPREPARE
            | Capabilities::ENABLE
            | Capabilities::DISABLE
            | Capabilities::DETERMINE_RATE
            | Capabilities::SET_RATE
            | Capabilities::SET_PARENT
            | Capabilities::GET_PARENT
    }

    fn prepare(&self, _hw: &ClkHw<'_>) -> ClkResult {
        Err(ClkError::NoDevice)
    }

    fn unprepare(&self, hw: &ClkHw<'_>) {
        log::warn!("clk: unprepare called on unregistered clock {}", hw.name());
    }

    fn enable(&self, _hw: &ClkHw<'_>) -> ClkResult {
        Err(ClkError::NoDevice)
    }

    fn disable(&self, hw: &ClkHw<'_>) {
        log::warn!("clk: disable called on unregistered clock {}", hw.name());
    }

    fn determine_rate(&self, _hw: &ClkHw<'_>, _req: &mut crate::RateRequest) -> ClkResult {
        Err(ClkError::NoDevice)
    }

    fn set_rate(&self, _hw: &ClkHw<'_>, _rate: u64, _parent_rate: u64) -> ClkResult {
        Err(ClkError::NoDevice)
    }

    fn set_parent(&self, _hw: &ClkHw<'_>, _index: u8) -> ClkResult {
        Err(ClkError::NoDevice)
    }
}

impl ClockTree {
    /// Register a clock and place it in the tree
    ///
    /// Each declared parent is resolved, in order of preference, by the id given directly, by
    /// the clock's hardware description, and finally by global name. Clocks whose selected
    /// parent can't be resolved yet are kept as orphans and adopted once it shows up.
    pub fn register(&self, init: ClkInitData) -> ClkResult<ClkId> {
        let _guard = self.locks.prepare();
        if self.store().lookup(&init.name).is_some() {
            log::error!("clk: {} already registered", init.name);
            return Err(ClkError::AlreadyExists);
        }

        let ClkInitData {
            name,
            ops,
            parents,
            flags,
            description,
            runtime_pm,
        } = init;
        let mut core = ClkCore::new(name, ops);
        core.caps.validate(parents.len()).map_err(|err| {
            log::error!("clk: {}: inconsistent ops", core.name);
            err
        })?;
        core.parents = parents.into_iter().map(ParentSlot::from).collect();
        core.flags = flags;
        core.description = description;
        core.runtime_pm = runtime_pm;
        core.registered = true;
        let id = self.store().insert(core);

        let result = self.pm_get(id).and_then(|()| {
            let result = self.init_core(id);
            self.pm_put(id);
            result
        });
        match result {
            Ok(()) => {
                let (ops, caps) = self.ops_of(id);
                if caps.contains(Capabilities::DEBUG_INIT) {
                    ops.debug_init(&self.hw(id));
                }
                log::debug!("clk: registered {}", self.name_of(id));
                Ok(id)
            }
            Err(err) => {
                let mut store = self.store();
                store.detach(id);
                store.remove(id);
                Err(err)
            }
        }
    }

    /// Run the driver's init hook, then place and characterize the clock
    fn init_core(&self, id: ClkId) -> ClkResult {
        let (ops, caps) = self.ops_of(id);
        if caps.contains(Capabilities::INIT) {
            ops.init(&self.hw(id))?;
        }

        let result = self.place_core(id);
        if result.is_err() && caps.contains(Capabilities::TERMINATE) {
            ops.terminate(&self.hw(id));
        }
        result
    }

    fn place_core(&self, id: ClkId) -> ClkResult {
        let (ops, caps) = self.ops_of(id);
        let parent = self.init_parent(id);
        self.locks.enable(|| self.store().attach(id, parent));

        let parent_accuracy = parent.map_or(0, |parent| self.store()[parent].accuracy);
        let accuracy = if caps.contains(Capabilities::RECALC_ACCURACY) {
            ops.recalc_accuracy(&self.hw(id), parent_accuracy)
        } else {
            parent_accuracy
        };
        self.store()[id].accuracy = accuracy;

        self.get_phase_nolock(id).map_err(|err| {
            log::warn!("clk: {}: failed to get phase", self.name_of(id));
            err
        })?;
        // Falls back to 1/2 on failure
        let _ = self.update_duty_cycle_nolock(id);

        let parent_rate = parent.map_or(0, |parent| self.store().rate_nolock(parent));
        let rate = if caps.contains(Capabilities::RECALC_RATE) {
            self.recalc(id, parent_rate)
        } else {
            parent.map_or(0, |parent| self.store()[parent].rate)
        };
        {
            let mut store = self.store();
            store[id].rate = rate;
            store[id].req_rate = rate;
            store[id].target_rate = rate;
        }

        if self.flags_of(id).contains(ClkFlags::IS_CRITICAL) {
            self.core_prepare(Some(id))?;
            if let Err(err) = self.core_enable_lock(Some(id)) {
                // Not critical after all, or the prepare reference would stick
                self.store()[id].flags.remove(ClkFlags::IS_CRITICAL);
                self.core_unprepare(Some(id));
                return Err(err);
            }
        }

        self.adopt_orphans();
        Ok(())
    }

    /// Take a clock out of the tree
    ///
    /// Its children become orphans. Outstanding handles keep working, but everything they do
    /// fails with [ClkError::NoDevice].
    pub fn unregister(&self, id: ClkId) -> ClkResult {
        let _guard = self.locks.prepare();
        if !self.store().is_live(id) {
            log::warn!("clk: unregistering a clock that isn't registered");
            return Err(ClkError::InvalidArguments);
        }

        let (ops, caps) = self.ops_of(id);
        self.locks.enable(|| {
            let mut store = self.store();
            store[id].ops = Arc::new(NoDriverOps);
            store[id].caps = NoDriverOps.capabilities();
        });

        if caps.contains(Capabilities::TERMINATE) {
            ops.terminate(&self.hw(id));
        }

        for child in self.children_of(id) {
            if let Err(err) = self.set_parent_nolock(child, None) {
                log::warn!("clk: {}: forcibly orphaned: {err}", self.name_of(child));
                let old_parent = self.set_parent_before(child, None);
                self.set_parent_after(child, None, old_parent);
                self.recalc_rates(child, None);
            }
        }

        self.evict_parent_cache(id);

        let name = {
            let mut store = self.store();
            store.detach(id);
            store[id].parent = None;
            store[id].registered = false;
            if store[id].prepare_count > 0 {
                log::warn!("clk: unregistering prepared clock {}", store[id].name);
            }
            if store[id].protect_count > 0 {
                log::warn!("clk: unregistering protected clock {}", store[id].name);
            }
            store[id].name.clone()
        };
        log::debug!("clk: unregistered {name}");

        self.put_core(id);
        Ok(())
    }
}
