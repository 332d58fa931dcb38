//! The operation table a clock driver hands to the core
use crate::{errors::ClkError, ClkFlags, ClkId, ClkResult, ClockTree};
use bitflags::bitflags;

bitflags! {
    /// Which [ClkOps] methods a clock actually implements
    ///
    /// The core never calls a method whose bit is clear, and checks at registration that the
    /// combination makes sense.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const PREPARE = 1 << 0;
        const UNPREPARE = 1 << 1;
        const IS_PREPARED = 1 << 2;
        const UNPREPARE_UNUSED = 1 << 3;
        const ENABLE = 1 << 4;
        const DISABLE = 1 << 5;
        const IS_ENABLED = 1 << 6;
        const DISABLE_UNUSED = 1 << 7;
        const SAVE_CONTEXT = 1 << 8;
        const RESTORE_CONTEXT = 1 << 9;
        const RECALC_RATE = 1 << 10;
        const ROUND_RATE = 1 << 11;
        const DETERMINE_RATE = 1 << 12;
        const SET_PARENT = 1 << 13;
        const GET_PARENT = 1 << 14;
        const SET_RATE = 1 << 15;
        const SET_RATE_AND_PARENT = 1 << 16;
        const RECALC_ACCURACY = 1 << 17;
        const GET_PHASE = 1 << 18;
        const SET_PHASE = 1 << 19;
        const GET_DUTY_CYCLE = 1 << 20;
        const SET_DUTY_CYCLE = 1 << 21;
        const INIT = 1 << 22;
        const TERMINATE = 1 << 23;
        const DEBUG_INIT = 1 << 24;

        /// Anything that can gate
        const GATE = Self::ENABLE.bits() | Self::DISABLE.bits() | Self::IS_ENABLED.bits();
        /// Anything that can select between parents
        const MUX = Self::SET_PARENT.bits() | Self::GET_PARENT.bits();
    }
}

impl Capabilities {
    /// Can this clock plan a rate itself
    pub fn can_round(self) -> bool {
        self.intersects(Self::ROUND_RATE | Self::DETERMINE_RATE)
    }

    /// Check that the combination is coherent for a clock with `num_parents` parents
    pub(crate) fn validate(self, num_parents: usize) -> ClkResult {
        if self.contains(Self::SET_RATE) && !(self.can_round() && self.contains(Self::RECALC_RATE))
        {
            log::error!("clk: set_rate requires round_rate or determine_rate, and recalc_rate");
            return Err(ClkError::InvalidArguments);
        }
        if self.contains(Self::SET_PARENT) && !self.contains(Self::GET_PARENT) {
            log::error!("clk: set_parent requires get_parent");
            return Err(ClkError::InvalidArguments);
        }
        if num_parents > 1 && !self.contains(Self::GET_PARENT) {
            log::error!("clk: a clock with multiple parents must implement get_parent");
            return Err(ClkError::InvalidArguments);
        }
        if self.contains(Self::SET_RATE_AND_PARENT)
            && !self.contains(Self::SET_PARENT | Self::SET_RATE)
        {
            log::error!("clk: set_rate_and_parent requires set_parent and set_rate");
            return Err(ClkError::InvalidArguments);
        }
        if self.contains(Self::SET_DUTY_CYCLE) && !self.contains(Self::GET_DUTY_CYCLE) {
            log::error!("clk: set_duty_cycle requires get_duty_cycle");
            return Err(ClkError::InvalidArguments);
        }
        Ok(())
    }
}

/// A request to plan a rate, filled in by `round_rate`/`determine_rate`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RateRequest {
    /// Requested rate on input, achievable rate on output
    pub rate: u64,
    /// Lowest rate any consumer allows
    pub min_rate: u64,
    /// Highest rate any consumer allows
    pub max_rate: u64,
    /// Parent the rate is planned against
    pub best_parent: Option<ClkId>,
    /// Rate that parent needs to run at
    pub best_parent_rate: u64,
}

impl RateRequest {
    /// A request for `rate` with no window
    pub const fn new(rate: u64) -> Self {
        Self {
            rate,
            min_rate: 0,
            max_rate: u64::MAX,
            best_parent: None,
            best_parent_rate: 0,
        }
    }
}

/// Duty cycle as a fraction of the period
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Duty {
    /// Numerator
    pub num: u32,
    /// Denominator
    pub den: u32,
}

impl Default for Duty {
    fn default() -> Self {
        Self { num: 1, den: 2 }
    }
}

impl Duty {
    pub(crate) fn is_valid(&self) -> bool {
        self.den != 0 && self.num <= self.den
    }
}

/// Hardware operations for one clock
///
/// Every method has a harmless default; [ClkOps::capabilities] says which ones are real.
/// Methods may call back into the tree through `hw`. The core holds no internal lock that
/// would make that deadlock.
pub trait ClkOps: Send + Sync {
    /// The methods this implementation provides
    fn capabilities(&self) -> Capabilities;

    /// Prepare the clock. May sleep
    fn prepare(&self, _hw: &ClkHw<'_>) -> ClkResult {
        Ok(())
    }

    /// Undo [ClkOps::prepare]
    fn unprepare(&self, _hw: &ClkHw<'_>) {}

    /// Query hardware for the prepared state
    fn is_prepared(&self, _hw: &ClkHw<'_>) -> bool {
        false
    }

    /// Unprepare a clock left on by the bootloader
    fn unprepare_unused(&self, _hw: &ClkHw<'_>) {}

    /// Ungate the clock. Must not sleep
    fn enable(&self, _hw: &ClkHw<'_>) -> ClkResult {
        Ok(())
    }

    /// Gate the clock. Must not sleep
    fn disable(&self, _hw: &ClkHw<'_>) {}

    /// Query hardware for the enabled state
    fn is_enabled(&self, _hw: &ClkHw<'_>) -> bool {
        false
    }

    /// Gate a clock left on by the bootloader
    fn disable_unused(&self, _hw: &ClkHw<'_>) {}

    /// Save register state before a power transition
    fn save_context(&self, _hw: &ClkHw<'_>) -> ClkResult {
        Ok(())
    }

    /// Restore what [ClkOps::save_context] saved
    fn restore_context(&self, _hw: &ClkHw<'_>) {}

    /// Compute this clock's rate from its parent's
    fn recalc_rate(&self, _hw: &ClkHw<'_>, parent_rate: u64) -> u64 {
        parent_rate
    }

    /// Closest achievable rate to `rate`, possibly adjusting `parent_rate`
    fn round_rate(&self, _hw: &ClkHw<'_>, rate: u64, _parent_rate: &mut u64) -> ClkResult<u64> {
        Ok(rate)
    }

    /// Plan a rate, possibly picking another parent
    fn determine_rate(&self, _hw: &ClkHw<'_>, _req: &mut RateRequest) -> ClkResult {
        Err(ClkError::InvalidArguments)
    }

    /// Select input `index`
    fn set_parent(&self, _hw: &ClkHw<'_>, _index: u8) -> ClkResult {
        Err(ClkError::Permission)
    }

    /// Index of the selected input
    fn get_parent(&self, _hw: &ClkHw<'_>) -> u8 {
        0
    }

    /// Program `rate`, given the parent runs at `parent_rate`
    fn set_rate(&self, _hw: &ClkHw<'_>, _rate: u64, _parent_rate: u64) -> ClkResult {
        Err(ClkError::Permission)
    }

    /// Program rate and input in one go
    fn set_rate_and_parent(
        &self,
        _hw: &ClkHw<'_>,
        _rate: u64,
        _parent_rate: u64,
        _index: u8,
    ) -> ClkResult {
        Err(ClkError::Permission)
    }

    /// Accuracy in ppb given the parent's
    fn recalc_accuracy(&self, _hw: &ClkHw<'_>, parent_accuracy: u64) -> u64 {
        parent_accuracy
    }

    /// Phase shift in degrees, or negative if unknown
    fn get_phase(&self, _hw: &ClkHw<'_>) -> i32 {
        0
    }

    /// Shift the phase by `degrees`, in `0..360`
    fn set_phase(&self, _hw: &ClkHw<'_>, _degrees: i32) -> ClkResult {
        Err(ClkError::InvalidArguments)
    }

    /// Read the duty cycle into `duty`
    fn get_duty_cycle(&self, _hw: &ClkHw<'_>, _duty: &mut Duty) -> ClkResult {
        Err(ClkError::InvalidArguments)
    }

    /// Program the duty cycle
    fn set_duty_cycle(&self, _hw: &ClkHw<'_>, _duty: &Duty) -> ClkResult {
        Err(ClkError::InvalidArguments)
    }

    /// Called at registration before anything else
    fn init(&self, _hw: &ClkHw<'_>) -> ClkResult {
        Ok(())
    }

    /// Called at unregistration, or when registration fails after init
    fn terminate(&self, _hw: &ClkHw<'_>) {}

    /// Called once the clock is fully registered
    fn debug_init(&self, _hw: &ClkHw<'_>) {}
}

/// Runtime power management for the device behind a clock
pub trait RuntimePm: Send + Sync {
    /// Power the device up; called before touching hardware
    fn resume(&self) -> ClkResult;

    /// Drop the reference taken by [RuntimePm::resume]
    fn suspend(&self);

    /// Check whether the device is powered without waking it
    fn is_active(&self) -> bool {
        true
    }
}

/// A clock's view of the tree, handed to every op
#[derive(Copy, Clone)]
pub struct ClkHw<'a> {
    tree: &'a ClockTree,
    id: ClkId,
}

impl<'a> ClkHw<'a> {
    pub(crate) fn new(tree: &'a ClockTree, id: ClkId) -> Self {
        Self { tree, id }
    }

    /// The clock these ops belong to
    pub fn id(&self) -> ClkId {
        self.id
    }

    /// The tree the clock lives in
    pub fn tree(&self) -> &'a ClockTree {
        self.tree
    }

    /// The clock's name
    pub fn name(&self) -> alloc::string::String {
        self.tree.name_of(self.id)
    }

    /// The clock's flags
    pub fn flags(&self) -> ClkFlags {
        self.tree.store()[self.id].flags
    }

    /// Cached rate; zero while orphaned
    pub fn rate(&self) -> u64 {
        self.tree.store().rate_nolock(self.id)
    }

    /// Number of declared parents
    pub fn num_parents(&self) -> usize {
        self.tree.store()[self.id].parents.len()
    }

    /// Current parent
    pub fn parent(&self) -> Option<ClkId> {
        self.tree.store()[self.id].parent
    }

    /// Resolve the parent declared at `index`
    pub fn parent_by_index(&self, index: usize) -> Option<ClkId> {
        self.tree.parent_by_index(self.id, index)
    }

    /// Cached rate of some other clock; zero while orphaned
    pub fn rate_of(&self, clk: ClkId) -> u64 {
        self.tree.store().rate_nolock(clk)
    }

    /// Plan `req` against `clk`, the way a consumer's round would
    ///
    /// With `None`, the request resolves to rate zero.
    pub fn determine_rate_of(&self, clk: Option<ClkId>, req: &mut RateRequest) -> ClkResult {
        self.tree.round_rate_nolock(clk, req)
    }

    /// Whether the clock is prepared, as far as the core knows
    pub fn is_prepared(&self) -> bool {
        self.tree.store()[self.id].prepare_count > 0
    }

    /// Whether the clock is enabled, as far as the core knows
    pub fn is_enabled(&self) -> bool {
        self.tree.store()[self.id].enable_count > 0
    }

    /// The clock's own allowed rate window
    pub fn rate_range(&self) -> (u64, u64) {
        let store = self.tree.store();
        (store[self.id].min_rate, store[self.id].max_rate)
    }
}
