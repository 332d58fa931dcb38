//! Clock bindings of a single device-tree node
use crate::{FdtClkError, FdtClkResult};
use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use clk_tree::{ClkFlags, ClockSpec, ClockTree, ClockTreeConfig, DescriptionNode, NodeRef};
use fdt::{node::FdtNode, Fdt};

/// Big-endian cells of a property
fn cells(value: &[u8]) -> impl Iterator<Item = u32> + '_ {
    value
        .chunks_exact(4)
        .map(|cell| u32::from_be_bytes([cell[0], cell[1], cell[2], cell[3]]))
}

/// NUL-separated string list of a property
fn strings(value: &[u8], property: &'static str) -> FdtClkResult<Vec<String>> {
    value
        .split(|&byte| byte == 0)
        .filter(|s| !s.is_empty())
        .map(|s| {
            core::str::from_utf8(s)
                .map(ToString::to_string)
                .map_err(|_| FdtClkError::MalformedProperty(property))
        })
        .collect()
}

fn u32_property(node: &FdtNode<'_, '_>, property: &'static str) -> FdtClkResult<Option<u32>> {
    let Some(prop) = node.property(property) else {
        return Ok(None);
    };
    let value = prop
        .as_usize()
        .ok_or(FdtClkError::MalformedProperty(property))?;
    u32::try_from(value)
        .map(Some)
        .map_err(|_| FdtClkError::MalformedProperty(property))
}

/// Parse `clocks`, using each provider's `#clock-cells` to split the list
fn parse_clocks(fdt: &Fdt<'_>, node: &FdtNode<'_, '_>) -> FdtClkResult<Vec<ClockSpec>> {
    let Some(prop) = node.property("clocks") else {
        return Ok(Vec::new());
    };
    let cells: Vec<u32> = cells(prop.value).collect();

    let mut specs = Vec::new();
    let mut rest = cells.as_slice();
    while let Some((&phandle, tail)) = rest.split_first() {
        let provider = fdt
            .find_phandle(phandle)
            .ok_or(FdtClkError::MalformedProperty("clocks"))?;
        let count = u32_property(&provider, "#clock-cells")?
            .ok_or(FdtClkError::MissingProperty("#clock-cells"))?;
        let count = usize::try_from(count).expect("Expect usize to hold u32");
        if tail.len() < count {
            return Err(FdtClkError::MalformedProperty("clocks"));
        }
        let (args, tail) = tail.split_at(count);
        specs.push(ClockSpec {
            provider: NodeRef::from(phandle),
            args: args.to_vec(),
        });
        rest = tail;
    }
    Ok(specs)
}

/// The clock-related properties of one node, detached from the blob
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FdtClockNode {
    name: String,
    phandle: Option<NodeRef>,
    clock_cells: Option<u32>,
    clocks: Vec<ClockSpec>,
    clock_names: Vec<String>,
    output_names: Vec<String>,
    indices: Vec<u32>,
    critical: Vec<u32>,
}

impl FdtClockNode {
    /// Parse `node`'s clock bindings
    pub fn from_node(fdt: &Fdt<'_>, node: &FdtNode<'_, '_>) -> FdtClkResult<Self> {
        let list = |property: &'static str| -> FdtClkResult<Vec<String>> {
            node.property(property)
                .map_or(Ok(Vec::new()), |prop| strings(prop.value, property))
        };
        let numbers = |property: &'static str| -> Vec<u32> {
            node.property(property)
                .map(|prop| cells(prop.value).collect())
                .unwrap_or_default()
        };

        Ok(Self {
            name: node.name.to_string(),
            phandle: u32_property(node, "phandle")?.map(NodeRef::from),
            clock_cells: u32_property(node, "#clock-cells")?,
            clocks: parse_clocks(fdt, node)?,
            clock_names: list("clock-names")?,
            output_names: list("clock-output-names")?,
            indices: numbers("clock-indices"),
            critical: numbers("clock-critical"),
        })
    }

    /// Node name, without the unit address
    pub fn name(&self) -> &str {
        self.name.split('@').next().unwrap_or_default()
    }

    /// The node's phandle, if anyone can refer to it
    pub fn phandle(&self) -> Option<NodeRef> {
        self.phandle
    }

    /// Specifier cells per output, if the node provides clocks
    pub fn clock_cells(&self) -> Option<u32> {
        self.clock_cells
    }

    /// Number of entries in `clocks`
    pub fn num_clocks(&self) -> usize {
        self.clocks.len()
    }

    /// Name of output `index`, following `clock-indices` if present
    pub fn output_name(&self, index: u32) -> Option<&str> {
        let position = if self.indices.is_empty() {
            usize::try_from(index).ok()?
        } else {
            self.indices.iter().position(|&other| other == index)?
        };
        self.output_names.get(position).map(String::as_str)
    }

    /// Is output `index` listed in `clock-critical`
    pub fn is_critical(&self, index: u32) -> bool {
        self.critical.contains(&index)
    }

    /// Flags to register output `index` with
    pub fn output_flags(&self, index: u32) -> ClkFlags {
        if self.is_critical(index) {
            ClkFlags::IS_CRITICAL
        } else {
            ClkFlags::empty()
        }
    }
}

impl DescriptionNode for FdtClockNode {
    fn node_ref(&self) -> Option<NodeRef> {
        self.phandle
    }

    fn clock_index(&self, name: &str) -> Option<usize> {
        self.clock_names.iter().position(|other| other == name)
    }

    fn clock_spec(&self, index: usize) -> Option<ClockSpec> {
        self.clocks.get(index).cloned()
    }
}

/// Name of the clock `description` lists at `index` in its `clocks`
///
/// Prefers the provider's `clock-output-names`, then the name the clock was registered under,
/// then the provider's node name if it has no specifier cells.
pub fn parent_name(
    tree: &ClockTree,
    fdt: &Fdt<'_>,
    description: &FdtClockNode,
    index: usize,
) -> Option<String> {
    let spec = description.clock_spec(index)?;
    let provider = fdt.find_phandle(spec.provider.into())?;
    let provider = match FdtClockNode::from_node(fdt, &provider) {
        Ok(provider) => provider,
        Err(err) => {
            log::warn!("clk: can't parse {}: {err}", provider.name);
            return None;
        }
    };

    let output = spec.args.first().copied().unwrap_or(0);
    if !provider.indices.is_empty() && !provider.indices.contains(&output) {
        return None;
    }
    if let Some(name) = provider.output_name(output) {
        return Some(name.to_string());
    }

    match tree.clk_from_spec(&spec) {
        Ok(id) => tree.name(id).ok(),
        Err(_) if spec.args.is_empty() => Some(provider.name().to_string()),
        Err(_) => None,
    }
}

/// Tree configuration from the kernel command line in `/chosen/bootargs`
pub fn config_from_chosen(fdt: &Fdt<'_>) -> ClockTreeConfig {
    fdt.find_node("/chosen")
        .and_then(|chosen| chosen.property("bootargs"))
        .and_then(|bootargs| bootargs.as_str())
        .map(ClockTreeConfig::from_cmdline)
        .unwrap_or_default()
}
