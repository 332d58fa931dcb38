//! Error and Result type for use in this crate
use core::result::Result;
use derive_more::Display;

/// Error type for clock operations
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum ClkError {
    /// Argument is invalid, or the clock's ops can't do what was asked
    #[display("invalid arguments")]
    InvalidArguments,
    /// No such clock, or the rate falls outside the allowed window
    #[display("not found")]
    NotFound,
    /// A provider this clock depends on hasn't registered yet
    #[display("deferred, try again later")]
    Deferred,
    /// The clock is protected, critical, or must be gated first
    #[display("busy")]
    Busy,
    /// Out of memory
    #[display("out of memory")]
    NoMemory,
    /// Attempted to enable a clock that isn't prepared
    #[display("clock is shut down")]
    Shutdown,
    /// The clock lacks the capability for this operation
    #[display("operation not permitted")]
    Permission,
    /// The clock's driver has gone away
    #[display("no such device")]
    NoDevice,
    /// A clock with this name is already registered
    #[display("already exists")]
    AlreadyExists,
    /// Driver-specific failure
    #[display("{_0}")]
    Generic(&'static str),
}

/// Result type for use in this crate
pub type ClkResult<T = ()> = Result<T, ClkError>;
