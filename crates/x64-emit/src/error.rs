//! Error types and declaration source locations for diagnostics.

use alloc::string::String;
use core::fmt;

/// Source location of the declaration being emitted.
///
/// Every diagnostic the emitter produces is attached to the declaration's
/// position in the original source, so the caller can surface it without
/// further bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SrcLoc {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl SrcLoc {
    /// Create a new source location.
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Emission error.
///
/// Both variants are terminal for the current declaration; neither is
/// retried. The caller surfaces `EmitFail` messages as user-visible
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EmitError {
    /// Growing the output code buffer failed.
    OutOfMemory,

    /// Lowering failed: unknown MIR tag, unimplemented encoding variant,
    /// missing relocation target, displacement overflow, or an unsupported
    /// linker backend.
    EmitFail {
        /// The formatted diagnostic message.
        msg: String,
        /// Source location of the declaration being emitted.
        loc: SrcLoc,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::OutOfMemory => write!(f, "out of memory growing code buffer"),
            EmitError::EmitFail { msg, loc } => write!(f, "{}: {}", loc, msg),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EmitError {}
