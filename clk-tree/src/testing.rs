//! Fixtures shared by the unit tests
use crate::{
    determine_mux_rate, node::ClkCore, Capabilities, ClkError, ClkFlags, ClkHw, ClkId,
    ClkInitData, ClkOps, ClkResult, ClockSpec, ClockTree, ClockTreeConfig, DescriptionNode, Duty,
    NodeRef, RateRequest, RuntimePm,
};
use alloc::{collections::BTreeSet, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

const MAX_DIV: u64 = 255;

/// Distinct per test thread
pub(crate) fn thread_actor() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static ACTOR: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ACTOR.with(|actor| *actor)
}

pub(crate) fn test_tree() -> Arc<ClockTree> {
    test_tree_with(ClockTreeConfig::default())
}

pub(crate) fn test_tree_with(config: ClockTreeConfig) -> Arc<ClockTree> {
    ClockTree::new(config, thread_actor)
}

pub(crate) fn bare_core(name: &str) -> ClkCore {
    ClkCore::new(String::from(name), TestClk::new(Kind::PassThrough))
}

/// Assert the structural invariants of the whole tree
pub(crate) fn well_formed(tree: &ClockTree) {
    let store = tree.store();
    let mut seen = BTreeSet::new();
    let mut stack: Vec<ClkId> = store.roots.iter().chain(&store.orphans).copied().collect();
    while let Some(id) = stack.pop() {
        assert!(seen.insert(id), "{} reachable twice", store[id].name);
        stack.extend(&store[id].children);
    }
    for id in store.ids() {
        assert_eq!(
            seen.contains(&id),
            store[id].registered,
            "{} placement doesn't match registration",
            store[id].name
        );
    }

    for &root in &store.roots {
        assert!(store[root].parent.is_none() && store[root].parents.is_empty());
        assert!(!store[root].orphan);
    }
    for &orphan in &store.orphans {
        assert!(store[orphan].parent.is_none());
        assert!(store[orphan].orphan);
    }

    for &id in &seen {
        let core = &store[id];
        for &child in &core.children {
            assert_eq!(store[child].parent, Some(id));
        }
        let Some(parent) = core.parent else {
            continue;
        };
        let parent = &store[parent];
        assert!(parent.children.contains(&id), "{} not linked", core.name);
        assert_eq!(core.orphan, parent.orphan, "{} orphan bit", core.name);
        assert!(core.prepare_count == 0 || parent.prepare_count > 0, "{} prepare", core.name);
        assert!(core.enable_count == 0 || parent.enable_count > 0, "{} enable", core.name);
        assert!(core.protect_count == 0 || parent.protect_count > 0, "{} protect", core.name);
    }
}

/// What a [TestClk] pretends to be
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Root oscillator at a fixed rate
    Fixed(u64),
    /// No ops at all
    PassThrough,
    /// Integer divider, rounding down
    Divider(u32),
    /// Mux starting at the given input
    Mux(u8),
    /// Mux followed by a divider
    DivMux(u8, u32),
    Gate,
    /// Root that can run at any rate
    Pll(u64),
    /// Phase and duty cycle control
    Phased(i32),
    /// Sets rates without being able to round them
    Broken,
    /// Gate with init, terminate and debug hooks
    Hooked,
}

impl Kind {
    pub(crate) fn divider(div: u32) -> Self {
        Self::Divider(div)
    }

    pub(crate) fn mux(index: u8) -> Self {
        Self::Mux(index)
    }

    pub(crate) fn divmux(index: u8, div: u32) -> Self {
        Self::DivMux(index, div)
    }

    pub(crate) fn gate() -> Self {
        Self::Gate
    }

    pub(crate) fn pll(rate: u64) -> Self {
        Self::Pll(rate)
    }

    pub(crate) fn phased(phase: i32) -> Self {
        Self::Phased(phase)
    }

    pub(crate) fn broken() -> Self {
        Self::Broken
    }

    pub(crate) fn hooked() -> Self {
        Self::Hooked
    }
}

struct HwState {
    rate: u64,
    div: u32,
    index: u8,
    prepared: bool,
    enabled: bool,
    phase: i32,
    duty: Duty,
    accuracy: u64,
}

/// Smallest divider taking `parent_rate` to at most `rate`
fn pick_div(parent_rate: u64, rate: u64) -> u32 {
    let div = (parent_rate / rate.saturating_add(1) + 1).min(MAX_DIV);
    u32::try_from(div).unwrap()
}

/// Recording clock: logs every state-changing op as `"name:op"` and can be told to fail
pub(crate) struct TestClk {
    kind: Kind,
    hw: Mutex<HwState>,
    failing: Mutex<Vec<String>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl TestClk {
    pub(crate) fn new(kind: Kind) -> Arc<Self> {
        Self::with_log(kind, Self::shared_log())
    }

    pub(crate) fn with_log(kind: Kind, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        let (rate, div, index, phase) = match kind {
            Kind::Fixed(rate) | Kind::Pll(rate) => (rate, 1, 0, 0),
            Kind::Divider(div) => (0, div, 0, 0),
            Kind::Mux(index) => (0, 1, index, 0),
            Kind::DivMux(index, div) => (0, div, index, 0),
            Kind::Phased(phase) => (0, 1, 0, phase),
            _ => (0, 1, 0, 0),
        };
        Arc::new(Self {
            kind,
            hw: Mutex::new(HwState {
                rate,
                div,
                index,
                prepared: false,
                enabled: false,
                phase,
                duty: Duty::default(),
                accuracy: 0,
            }),
            failing: Mutex::new(Vec::new()),
            log,
        })
    }

    pub(crate) fn shared_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub(crate) fn ops(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn clear_ops(&self) {
        self.log.lock().clear();
    }

    /// Make `op` fail with `Generic("injected")` until [TestClk::heal]
    pub(crate) fn fail(&self, op: &str) {
        self.failing.lock().push(String::from(op));
    }

    pub(crate) fn heal(&self) {
        self.failing.lock().clear();
    }

    pub(crate) fn set_hw_enabled(&self, enabled: bool) {
        self.hw.lock().enabled = enabled;
    }

    pub(crate) fn set_hw_prepared(&self, prepared: bool) {
        self.hw.lock().prepared = prepared;
    }

    pub(crate) fn set_hw_rate(&self, rate: u64) {
        self.hw.lock().rate = rate;
    }

    pub(crate) fn set_hw_accuracy(&self, accuracy: u64) {
        self.hw.lock().accuracy = accuracy;
    }

    pub(crate) fn hw_enabled(&self) -> bool {
        self.hw.lock().enabled
    }

    pub(crate) fn hw_prepared(&self) -> bool {
        self.hw.lock().prepared
    }

    fn check(&self, op: &str) -> ClkResult {
        if self.failing.lock().iter().any(|failing| failing == op) {
            Err(ClkError::Generic("injected"))
        } else {
            Ok(())
        }
    }

    fn record(&self, hw: &ClkHw<'_>, entry: &str) {
        self.log.lock().push(alloc::format!("{}:{entry}", hw.name()));
    }

    /// Check for injected failure, then record
    fn act(&self, hw: &ClkHw<'_>, op: &str, entry: &str) -> ClkResult {
        self.check(op)?;
        self.record(hw, entry);
        Ok(())
    }
}

impl ClkOps for TestClk {
    fn capabilities(&self) -> Capabilities {
        let context = Capabilities::SAVE_CONTEXT | Capabilities::RESTORE_CONTEXT;
        let gate = Capabilities::GATE
            | Capabilities::PREPARE
            | Capabilities::UNPREPARE
            | Capabilities::IS_PREPARED;
        context
            | match self.kind {
                Kind::Fixed(_) => Capabilities::RECALC_RATE,
                Kind::PassThrough => Capabilities::empty(),
                Kind::Divider(_) => {
                    Capabilities::RECALC_RATE | Capabilities::ROUND_RATE | Capabilities::SET_RATE
                }
                Kind::Mux(_) => Capabilities::MUX | Capabilities::DETERMINE_RATE,
                Kind::DivMux(..) => {
                    Capabilities::MUX
                        | Capabilities::DETERMINE_RATE
                        | Capabilities::RECALC_RATE
                        | Capabilities::SET_RATE
                }
                Kind::Gate => gate,
                Kind::Pll(_) => {
                    Capabilities::RECALC_RATE
                        | Capabilities::ROUND_RATE
                        | Capabilities::SET_RATE
                        | Capabilities::RECALC_ACCURACY
                }
                Kind::Phased(_) => {
                    Capabilities::GET_PHASE
                        | Capabilities::SET_PHASE
                        | Capabilities::GET_DUTY_CYCLE
                        | Capabilities::SET_DUTY_CYCLE
                }
                Kind::Broken => Capabilities::SET_RATE,
                Kind::Hooked => {
                    gate | Capabilities::INIT | Capabilities::TERMINATE | Capabilities::DEBUG_INIT
                }
            }
    }

    fn prepare(&self, hw: &ClkHw<'_>) -> ClkResult {
        self.act(hw, "prepare", "prepare")?;
        self.hw.lock().prepared = true;
        Ok(())
    }

    fn unprepare(&self, hw: &ClkHw<'_>) {
        self.record(hw, "unprepare");
        self.hw.lock().prepared = false;
    }

    fn is_prepared(&self, _hw: &ClkHw<'_>) -> bool {
        self.hw.lock().prepared
    }

    fn enable(&self, hw: &ClkHw<'_>) -> ClkResult {
        self.act(hw, "enable", "enable")?;
        self.hw.lock().enabled = true;
        Ok(())
    }

    fn disable(&self, hw: &ClkHw<'_>) {
        self.record(hw, "disable");
        self.hw.lock().enabled = false;
    }

    fn is_enabled(&self, _hw: &ClkHw<'_>) -> bool {
        self.hw.lock().enabled
    }

    fn save_context(&self, hw: &ClkHw<'_>) -> ClkResult {
        self.act(hw, "save_context", "save_context")
    }

    fn restore_context(&self, hw: &ClkHw<'_>) {
        self.record(hw, "restore_context");
    }

    fn recalc_rate(&self, _hw: &ClkHw<'_>, parent_rate: u64) -> u64 {
        let hw = self.hw.lock();
        match self.kind {
            Kind::Fixed(_) | Kind::Pll(_) => hw.rate,
            _ => parent_rate / u64::from(hw.div),
        }
    }

    fn round_rate(&self, hw: &ClkHw<'_>, rate: u64, parent_rate: &mut u64) -> ClkResult<u64> {
        if let Kind::Pll(_) = self.kind {
            return Ok(rate.max(1));
        }

        if hw.flags().contains(ClkFlags::SET_RATE_PARENT) {
            let div = u64::from(self.hw.lock().div);
            let mut req = RateRequest::new(rate.saturating_mul(div));
            hw.determine_rate_of(hw.parent(), &mut req)?;
            *parent_rate = req.rate;
            return Ok(req.rate / div);
        }

        Ok(*parent_rate / u64::from(pick_div(*parent_rate, rate)))
    }

    fn determine_rate(&self, hw: &ClkHw<'_>, req: &mut RateRequest) -> ClkResult {
        if let Kind::Mux(_) = self.kind {
            return determine_mux_rate(hw, req);
        }

        let mut best: Option<(ClkId, u64, u64)> = None;
        for index in 0..hw.num_parents() {
            let Some(parent) = hw.parent_by_index(index) else {
                continue;
            };
            let parent_rate = hw.rate_of(parent);
            let rate = parent_rate / u64::from(pick_div(parent_rate, req.rate));
            if rate <= req.rate && best.map_or(true, |(_, _, best)| rate > best) {
                best = Some((parent, parent_rate, rate));
            }
        }
        let (parent, parent_rate, rate) = best.ok_or(ClkError::InvalidArguments)?;
        req.best_parent = Some(parent);
        req.best_parent_rate = parent_rate;
        req.rate = rate;
        Ok(())
    }

    fn set_parent(&self, hw: &ClkHw<'_>, index: u8) -> ClkResult {
        self.act(hw, "set_parent", &alloc::format!("set_parent({index})"))?;
        self.hw.lock().index = index;
        Ok(())
    }

    fn get_parent(&self, _hw: &ClkHw<'_>) -> u8 {
        self.hw.lock().index
    }

    fn set_rate(&self, hw: &ClkHw<'_>, rate: u64, parent_rate: u64) -> ClkResult {
        self.act(hw, "set_rate", &alloc::format!("set_rate({rate})"))?;
        let mut state = self.hw.lock();
        match self.kind {
            Kind::Pll(_) => state.rate = rate,
            _ => state.div = pick_div(parent_rate, rate),
        }
        Ok(())
    }

    fn recalc_accuracy(&self, _hw: &ClkHw<'_>, _parent_accuracy: u64) -> u64 {
        self.hw.lock().accuracy
    }

    fn get_phase(&self, _hw: &ClkHw<'_>) -> i32 {
        self.hw.lock().phase
    }

    fn set_phase(&self, hw: &ClkHw<'_>, degrees: i32) -> ClkResult {
        self.act(hw, "set_phase", &alloc::format!("set_phase({degrees})"))?;
        self.hw.lock().phase = degrees;
        Ok(())
    }

    fn get_duty_cycle(&self, _hw: &ClkHw<'_>, duty: &mut Duty) -> ClkResult {
        self.check("get_duty_cycle")?;
        *duty = self.hw.lock().duty;
        Ok(())
    }

    fn set_duty_cycle(&self, hw: &ClkHw<'_>, duty: &Duty) -> ClkResult {
        self.act(
            hw,
            "set_duty_cycle",
            &alloc::format!("set_duty_cycle({}/{})", duty.num, duty.den),
        )?;
        self.hw.lock().duty = *duty;
        Ok(())
    }

    fn init(&self, hw: &ClkHw<'_>) -> ClkResult {
        self.act(hw, "init", "init")
    }

    fn terminate(&self, hw: &ClkHw<'_>) {
        self.record(hw, "terminate");
    }

    fn debug_init(&self, hw: &ClkHw<'_>) {
        self.record(hw, "debug_init");
    }
}

pub(crate) fn fixed(name: &str, rate: u64) -> ClkInitData {
    ClkInitData::new(name, TestClk::new(Kind::Fixed(rate)))
}

pub(crate) fn passthrough(name: &str, parents: &[&str]) -> ClkInitData {
    ClkInitData::new(name, TestClk::new(Kind::PassThrough)).parent_names(parents)
}

pub(crate) fn divider(name: &str, parent: &str, div: u32) -> ClkInitData {
    ClkInitData::new(name, TestClk::new(Kind::Divider(div))).parent_names(&[parent])
}

pub(crate) fn mux(name: &str, parents: &[&str], index: u8) -> ClkInitData {
    ClkInitData::new(name, TestClk::new(Kind::Mux(index))).parent_names(parents)
}

pub(crate) fn gate(name: &str, parent: &str) -> ClkInitData {
    ClkInitData::new(name, TestClk::new(Kind::Gate)).parent_names(&[parent])
}

/// A description node with a fixed list of named clock references
#[derive(Clone, Debug, Default)]
pub(crate) struct TestDescription {
    node: Option<NodeRef>,
    clocks: Vec<(String, ClockSpec)>,
}

impl TestDescription {
    pub(crate) fn new(node: Option<NodeRef>) -> Self {
        Self {
            node,
            clocks: Vec::new(),
        }
    }

    pub(crate) fn with_clock(mut self, name: &str, provider: NodeRef, args: &[u32]) -> Self {
        self.clocks.push((
            String::from(name),
            ClockSpec {
                provider,
                args: args.to_vec(),
            },
        ));
        self
    }
}

impl DescriptionNode for TestDescription {
    fn node_ref(&self) -> Option<NodeRef> {
        self.node
    }

    fn clock_index(&self, name: &str) -> Option<usize> {
        self.clocks.iter().position(|(other, _)| other == name)
    }

    fn clock_spec(&self, index: usize) -> Option<ClockSpec> {
        self.clocks.get(index).map(|(_, spec)| spec.clone())
    }
}

/// Runtime PM that counts active references and can be told to refuse
#[derive(Debug, Default)]
pub(crate) struct TestPm {
    active: AtomicUsize,
    refuse: AtomicBool,
}

impl TestPm {
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }
}

impl RuntimePm for TestPm {
    fn resume(&self) -> ClkResult {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(ClkError::Busy);
        }
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn suspend(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn is_active(&self) -> bool {
        self.active() > 0
    }
}
