//! Trace points around hardware ops
//!
//! Each op is bracketed by an event named after it and a `_complete` event, logged at trace
//! level under the `clk` target.

/// Log a trace event for clock `$id` of tree `$tree`
macro_rules! tracepoint {
    ($tree:expr, $event:literal, $id:expr) => {
        if log::log_enabled!(target: "clk", log::Level::Trace) {
            log::trace!(target: "clk", "{}: {}", $event, $tree.name_of($id));
        }
    };
    ($tree:expr, $event:literal, $id:expr, $($arg:tt)+) => {
        if log::log_enabled!(target: "clk", log::Level::Trace) {
            log::trace!(
                target: "clk",
                "{}: {} {}",
                $event,
                $tree.name_of($id),
                format_args!($($arg)+)
            );
        }
    };
}

pub(crate) use tracepoint;
