//! The process-wide clock tree, initialized once and only once
use crate::{ClockTree, ClockTreeConfig};
use alloc::sync::Arc;
use spin::Once;

static TREE: Once<Arc<ClockTree>> = Once::new();

/// Initialize the global tree
///
/// `actor` must identify the current thread of execution; see [ClockTree::new].
///
/// # Panics
/// If the global tree was already initialized
pub fn initialize(config: ClockTreeConfig, actor: fn() -> usize) -> &'static Arc<ClockTree> {
    let mut fresh = false;
    let tree = TREE.call_once(|| {
        fresh = true;
        ClockTree::new(config, actor)
    });
    if !fresh {
        panic!("Already initialized the global clock tree");
    }
    tree
}

/// Get the global tree
///
/// # Panics
/// If [initialize] hasn't been called
pub fn get() -> &'static Arc<ClockTree> {
    try_get().expect("Global clock tree not initialized")
}

/// Get the global tree, if initialized
pub fn try_get() -> Option<&'static Arc<ClockTree>> {
    TREE.get()
}
