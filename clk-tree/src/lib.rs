//! A tree of hardware clocks: who feeds whom, who runs, and at what rate
//!
//! Clock drivers [register](ClockTree::register) clocks with an operation table ([ClkOps]) and
//! a list of possible parents. Consumers get [Clk] handles, either directly or by
//! [hardware description](ClockTree::obtain), and use them to prepare, enable and retune
//! clocks. The tree keeps reference counts consistent along parent chains, plans rate changes
//! across the whole affected subtree, and lets subscribers veto a change before anything is
//! programmed.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod consumer;
mod errors;
mod flags;
pub mod global;
mod lock;
mod node;
mod notifier;
mod ops;
mod parent_map;
mod phase;
mod power;
mod protect;
mod provider;
mod rate;
mod refcount;
mod register;
mod reparent;
#[cfg(test)]
mod testing;
mod topology;
mod trace;
mod tree;

pub use crate::{
    consumer::Clk,
    errors::{ClkError, ClkResult},
    flags::ClkFlags,
    node::{ClkId, ConsumerId},
    notifier::{ClkNotifier, NotifierId, NotifyResult, RateChange, RateEvent},
    ops::{Capabilities, ClkHw, ClkOps, Duty, RateRequest, RuntimePm},
    parent_map::ParentData,
    provider::{ClkProvider, ClockSpec, DescriptionNode, NodeRef, OnecellProvider, SimpleProvider},
    rate::determine_mux_rate,
    register::ClkInitData,
    tree::{ClkSummary, ClockTree, ClockTreeConfig},
};
