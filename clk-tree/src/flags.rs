//! Per-clock behavior flags
use bitflags::bitflags;

bitflags! {
    /// Flags that change how the core treats a clock
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ClkFlags: u32 {
        /// Must be gated across rate change; protects the rate while prepared
        const SET_RATE_GATE = 1 << 0;
        /// Must be gated across reparent
        const SET_PARENT_GATE = 1 << 1;
        /// Propagate rate change up one level
        const SET_RATE_PARENT = 1 << 2;
        /// Don't gate even if unused
        const IGNORE_UNUSED = 1 << 3;
        /// Don't use the cached rate
        const GET_RATE_NOCACHE = 1 << 6;
        /// Don't re-parent on rate change
        const SET_RATE_NO_REPARENT = 1 << 7;
        /// Don't use the cached accuracy
        const GET_ACCURACY_NOCACHE = 1 << 8;
        /// Recalc rates after notifications
        const RECALC_NEW_RATES = 1 << 9;
        /// Clock needs to run to set rate
        const SET_RATE_UNGATE = 1 << 10;
        /// Do not gate, ever
        const IS_CRITICAL = 1 << 11;
        /// Parents need enable during gate/ungate, set rate and re-parent
        const OPS_PARENT_ENABLE = 1 << 12;
        /// Duty cycle call may be forwarded to the parent clock
        const DUTY_CYCLE_PARENT = 1 << 13;
        /// Mux selection prefers the closest rate over the highest one not above it
        const MUX_ROUND_CLOSEST = 1 << 14;
    }
}
