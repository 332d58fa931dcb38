//! Phase, duty cycle, accuracy, and uncached rate reads
use crate::{
    trace::tracepoint, Capabilities, ClkError, ClkFlags, ClkId, ClkResult, ClockTree, Duty,
};

impl ClockTree {
    /// Read the phase from hardware if possible, caching it
    pub(crate) fn get_phase_nolock(&self, id: ClkId) -> ClkResult<i32> {
        let (ops, caps) = self.ops_of(id);
        if !caps.contains(Capabilities::GET_PHASE) {
            return Ok(0);
        }
        let phase = ops.get_phase(&self.hw(id));
        if phase < 0 {
            return Err(ClkError::NotFound);
        }
        self.store()[id].phase = phase;
        Ok(phase)
    }

    pub(crate) fn set_phase_nolock(&self, id: ClkId, degrees: i32) -> ClkResult {
        let degrees = degrees.rem_euclid(360);
        if self.store().is_protected(id) {
            return Err(ClkError::Busy);
        }

        let (ops, caps) = self.ops_of(id);
        tracepoint!(self, "clk_set_phase", id, "{degrees}");
        let result = if caps.contains(Capabilities::SET_PHASE) {
            self.pm_get(id)?;
            let result = ops.set_phase(&self.hw(id), degrees);
            self.pm_put(id);
            result
        } else {
            Err(ClkError::InvalidArguments)
        };
        tracepoint!(self, "clk_set_phase_complete", id, "{degrees}");

        if result.is_ok() {
            self.store()[id].phase = degrees;
        }
        result
    }

    /// Refresh the cached duty cycle, falling back to 1/2 when hardware talks nonsense
    pub(crate) fn update_duty_cycle_nolock(&self, id: ClkId) -> ClkResult {
        let (ops, caps) = self.ops_of(id);
        if !caps.contains(Capabilities::GET_DUTY_CYCLE) {
            return self.update_duty_cycle_parent_nolock(id);
        }

        let mut duty = self.store()[id].duty;
        let result = ops.get_duty_cycle(&self.hw(id), &mut duty).and_then(|()| {
            if duty.is_valid() {
                Ok(())
            } else {
                Err(ClkError::InvalidArguments)
            }
        });
        self.store()[id].duty = if result.is_ok() { duty } else { Duty::default() };
        result
    }

    fn update_duty_cycle_parent_nolock(&self, id: ClkId) -> ClkResult {
        let (parent, flags) = {
            let store = self.store();
            (store[id].parent, store[id].flags)
        };
        match parent {
            Some(parent) if flags.contains(ClkFlags::DUTY_CYCLE_PARENT) => {
                let result = self.update_duty_cycle_nolock(parent);
                let mut store = self.store();
                store[id].duty = store[parent].duty;
                result
            }
            _ => {
                self.store()[id].duty = Duty::default();
                Ok(())
            }
        }
    }

    pub(crate) fn set_duty_cycle_nolock(&self, id: ClkId, duty: &Duty) -> ClkResult {
        if self.store().is_protected(id) {
            return Err(ClkError::Busy);
        }

        let (ops, caps) = self.ops_of(id);
        if !caps.contains(Capabilities::SET_DUTY_CYCLE) {
            return self.set_duty_cycle_parent_nolock(id, duty);
        }

        tracepoint!(self, "clk_set_duty_cycle", id, "{}/{}", duty.num, duty.den);
        let result = ops.set_duty_cycle(&self.hw(id), duty);
        if result.is_ok() {
            self.store()[id].duty = *duty;
        }
        tracepoint!(self, "clk_set_duty_cycle_complete", id, "{}/{}", duty.num, duty.den);
        result
    }

    fn set_duty_cycle_parent_nolock(&self, id: ClkId, duty: &Duty) -> ClkResult {
        let (parent, flags) = {
            let store = self.store();
            (store[id].parent, store[id].flags)
        };
        let Some(parent) = parent
            .filter(|_| flags.intersects(ClkFlags::DUTY_CYCLE_PARENT | ClkFlags::SET_RATE_PARENT))
        else {
            return Ok(());
        };

        let result = self.set_duty_cycle_nolock(parent, duty);
        let mut store = self.store();
        store[id].duty = store[parent].duty;
        result
    }

    /// Duty cycle scaled to `scale`, i.e. `scale * num / den`
    pub(crate) fn scaled_duty_cycle_nolock(&self, id: ClkId, scale: u32) -> ClkResult<u32> {
        self.update_duty_cycle_nolock(id)?;
        let duty = self.store()[id].duty;
        let scaled = u64::from(scale) * u64::from(duty.num) / u64::from(duty.den);
        Ok(u32::try_from(scaled).expect("Expect num <= den to keep the result within scale"))
    }

    /// Accuracy in ppb, recomputed first for [ClkFlags::GET_ACCURACY_NOCACHE] clocks
    pub(crate) fn accuracy_nolock(&self, id: ClkId) -> u64 {
        if self.flags_of(id).contains(ClkFlags::GET_ACCURACY_NOCACHE) {
            self.recalc_accuracies(id);
        }
        self.store()[id].accuracy
    }

    /// Rate, recomputed first for [ClkFlags::GET_RATE_NOCACHE] clocks
    pub(crate) fn rate_recalc_nolock(&self, id: ClkId) -> u64 {
        if self.flags_of(id).contains(ClkFlags::GET_RATE_NOCACHE) {
            self.recalc_rates(id, None);
        }
        self.store().rate_nolock(id)
    }

    /// Current rate of a clock, asking hardware if its rate can't be cached
    pub fn get_rate(&self, id: ClkId) -> ClkResult<u64> {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        Ok(self.rate_recalc_nolock(id))
    }

    /// Accuracy of a clock in ppb
    pub fn get_accuracy(&self, id: ClkId) -> ClkResult<u64> {
        let _guard = self.locks.prepare();
        self.check_live(id)?;
        Ok(self.accuracy_nolock(id))
    }
}
