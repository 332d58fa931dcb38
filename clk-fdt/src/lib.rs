//! Device-tree glue for [clk_tree]
//!
//! Parses the clock bindings of a flattened device tree (`clocks`, `clock-names`,
//! `#clock-cells`, `clock-output-names`, `clock-indices`, `clock-critical`) into descriptions
//! the clock tree understands, and brings up clock providers in dependency order.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

mod errors;
mod loader;
mod node;
#[cfg(test)]
mod testing;

pub use crate::{
    errors::{FdtClkError, FdtClkResult},
    loader::{init_from_fdt, ClkDriverLoader, LoadContext, BUILTIN_LOADERS},
    node::{config_from_chosen, parent_name, FdtClockNode},
};
