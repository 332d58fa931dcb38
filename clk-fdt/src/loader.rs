//! Bring up clock providers described in the device tree
use crate::{parent_name, FdtClkError, FdtClkResult, FdtClockNode};
use alloc::{sync::Arc, vec::Vec};
use clk_tree::{
    Capabilities, ClkError, ClkFlags, ClkHw, ClkInitData, ClkOps, ClkResult, ClockTree,
    DescriptionNode, ParentData, RateRequest, SimpleProvider,
};
use fdt::{node::FdtNode, Fdt};

/// What a loader gets to work with
pub struct LoadContext<'a, 'b> {
    pub tree: &'a ClockTree,
    pub fdt: &'a Fdt<'b>,
    pub node: FdtNode<'a, 'b>,
    pub description: Arc<FdtClockNode>,
}

/// Loads clock providers for nodes matching `compatible`
pub struct ClkDriverLoader {
    pub compatible: &'static str,
    pub load: fn(&LoadContext) -> FdtClkResult,
}

/// Loaders for the generic bindings
pub static BUILTIN_LOADERS: [&ClkDriverLoader; 2] = [&FIXED_CLOCK, &FIXED_FACTOR_CLOCK];

/// Every `clocks` entry either resolves or fails for good
fn parents_ready(tree: &ClockTree, description: &FdtClockNode) -> bool {
    (0..description.num_clocks()).all(|index| {
        let Some(spec) = description.clock_spec(index) else {
            return true;
        };
        !matches!(tree.clk_from_spec(&spec), Err(ClkError::Deferred))
    })
}

/// Run `loaders` over every clock provider node in `fdt`, parents first
///
/// Nodes are initialized once all of their input clocks can be resolved. When a pass makes no
/// progress, the remaining nodes are forced in order, and end up as orphans until their
/// parents appear. Returns how many nodes loaded successfully.
pub fn init_from_fdt(tree: &ClockTree, fdt: &Fdt<'_>, loaders: &[&ClkDriverLoader]) -> usize {
    let mut pending: Vec<(usize, &ClkDriverLoader)> = fdt
        .all_nodes()
        .enumerate()
        .filter_map(|(position, node)| {
            node.property("#clock-cells")?;
            let compatible = node.compatible()?;
            let loader = loaders
                .iter()
                .find(|loader| compatible.all().any(|c| c == loader.compatible))?;
            Some((position, *loader))
        })
        .collect();

    let mut loaded = 0;
    let mut force = false;
    while !pending.is_empty() {
        let mut progress = false;
        let mut index = 0;
        while index < pending.len() {
            let (position, loader) = pending[index];
            let Some(node) = fdt.all_nodes().nth(position) else {
                pending.remove(index);
                continue;
            };
            let description = match FdtClockNode::from_node(fdt, &node) {
                Ok(description) => Arc::new(description),
                Err(err) => {
                    log::error!("clk: can't parse {}: {err}", node.name);
                    pending.remove(index);
                    continue;
                }
            };
            if !force && !parents_ready(tree, &description) {
                index += 1;
                continue;
            }

            pending.remove(index);
            progress = true;
            let name = node.name;
            let context = LoadContext {
                tree,
                fdt,
                node,
                description,
            };
            match (loader.load)(&context) {
                Ok(()) => loaded += 1,
                Err(err) => log::error!("clk: failed to load {name}: {err}"),
            }
        }

        if !progress {
            log::debug!("clk: forcing {} clock providers", pending.len());
            force = true;
        }
    }
    loaded
}

fn usize_property(node: &FdtNode<'_, '_>, property: &'static str) -> FdtClkResult<usize> {
    node.property(property)
        .ok_or(FdtClkError::MissingProperty(property))?
        .as_usize()
        .ok_or(FdtClkError::MalformedProperty(property))
}

/// Register output 0 of `context`'s node and publish it as the node's only clock
fn register_single(context: &LoadContext, init: ClkInitData) -> FdtClkResult {
    let id = context.tree.register(
        init.description(context.description.clone())
            .flags(context.description.output_flags(0)),
    )?;
    if let Some(node) = context.description.phandle() {
        context.tree.add_provider(node, SimpleProvider::new(id))?;
    }
    Ok(())
}

fn output_name<'a>(context: &'a LoadContext) -> &'a str {
    context
        .description
        .output_name(0)
        .unwrap_or(context.description.name())
}

struct FixedRate {
    rate: u64,
    accuracy: u64,
}

impl ClkOps for FixedRate {
    fn capabilities(&self) -> Capabilities {
        Capabilities::RECALC_RATE | Capabilities::RECALC_ACCURACY
    }

    fn recalc_rate(&self, _hw: &ClkHw<'_>, _parent_rate: u64) -> u64 {
        self.rate
    }

    fn recalc_accuracy(&self, _hw: &ClkHw<'_>, _parent_accuracy: u64) -> u64 {
        self.accuracy
    }
}

fn load_fixed(context: &LoadContext) -> FdtClkResult {
    let rate = usize_property(&context.node, "clock-frequency")?;
    let accuracy = match context.node.property("clock-accuracy") {
        Some(_) => usize_property(&context.node, "clock-accuracy")?,
        None => 0,
    };
    let ops = Arc::new(FixedRate {
        rate: u64::try_from(rate).expect("Expect u64 to hold usize"),
        accuracy: u64::try_from(accuracy).expect("Expect u64 to hold usize"),
    });
    register_single(context, ClkInitData::new(output_name(context), ops))
}

/// `fixed-clock`: a root at `clock-frequency`
pub static FIXED_CLOCK: ClkDriverLoader = ClkDriverLoader {
    compatible: "fixed-clock",
    load: load_fixed,
};

struct FixedFactor {
    mult: u64,
    div: u64,
}

impl FixedFactor {
    fn scale(&self, parent_rate: u64) -> u64 {
        let rate = u128::from(parent_rate) * u128::from(self.mult) / u128::from(self.div);
        u64::try_from(rate).unwrap_or(u64::MAX)
    }
}

impl ClkOps for FixedFactor {
    fn capabilities(&self) -> Capabilities {
        Capabilities::RECALC_RATE | Capabilities::ROUND_RATE | Capabilities::SET_RATE
    }

    fn recalc_rate(&self, _hw: &ClkHw<'_>, parent_rate: u64) -> u64 {
        self.scale(parent_rate)
    }

    fn round_rate(&self, hw: &ClkHw<'_>, rate: u64, parent_rate: &mut u64) -> ClkResult<u64> {
        if hw.flags().contains(ClkFlags::SET_RATE_PARENT) {
            let mut req = RateRequest::new((rate / self.mult).saturating_mul(self.div));
            hw.determine_rate_of(hw.parent(), &mut req)?;
            *parent_rate = req.rate;
        }
        Ok(self.scale(*parent_rate))
    }

    // The ratio is fixed, so any rate round_rate offered is already what the hardware does
    fn set_rate(&self, _hw: &ClkHw<'_>, _rate: u64, _parent_rate: u64) -> ClkResult {
        Ok(())
    }
}

fn load_fixed_factor(context: &LoadContext) -> FdtClkResult {
    let div = usize_property(&context.node, "clock-div")?;
    let mult = usize_property(&context.node, "clock-mult")?;
    if div == 0 {
        return Err(FdtClkError::MalformedProperty("clock-div"));
    }
    if mult == 0 {
        return Err(FdtClkError::MalformedProperty("clock-mult"));
    }

    let mut parent = ParentData::index(0);
    if let Some(name) = parent_name(context.tree, context.fdt, &context.description, 0) {
        parent = parent.or_name(&name);
    }
    let ops = Arc::new(FixedFactor {
        mult: u64::try_from(mult).expect("Expect u64 to hold usize"),
        div: u64::try_from(div).expect("Expect u64 to hold usize"),
    });
    register_single(
        context,
        ClkInitData::new(output_name(context), ops).parent_data([parent]),
    )
}

/// `fixed-factor-clock`: its parent times `clock-mult` over `clock-div`
pub static FIXED_FACTOR_CLOCK: ClkDriverLoader = ClkDriverLoader {
    compatible: "fixed-factor-clock",
    load: load_fixed_factor,
};
