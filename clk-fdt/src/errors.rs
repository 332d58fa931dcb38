//! Error and Result type for use in this crate
use clk_tree::ClkError;
use core::result::Result;
use derive_more::{Display, From};

/// Error type for device-tree driven clock setup
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, From)]
pub enum FdtClkError {
    /// Converted from [ClkError]
    #[display("{_0}")]
    Clk(ClkError),
    /// A required property is absent
    #[from(ignore)]
    #[display("missing property `{_0}`")]
    MissingProperty(&'static str),
    /// A property is present but can't be parsed
    #[from(ignore)]
    #[display("malformed property `{_0}`")]
    MalformedProperty(&'static str),
}

/// Result type for use in this crate
pub type FdtClkResult<T = ()> = Result<T, FdtClkError>;
