//! Interfaces to the linker backend and the debug-info writer.
//!
//! The emitter resolves intra-function branches itself; everything that
//! crosses the function boundary — calls to external symbols and
//! RIP-relative GOT loads — is recorded here as a relocation request for
//! the object-file writer. Debug-line markers are forwarded through
//! [`DebugSink`]; the content of the debug format is owned by the sink.

use alloc::vec::Vec;
use core::fmt;

/// Object-file format of the downstream linker backend.
///
/// Only Mach-O accepts relocation requests today; emitting an external
/// reference under any other format is an "unimplemented" diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObjectFormat {
    /// Mach-O (`X86_64_RELOC_BRANCH` / `X86_64_RELOC_GOT`).
    MachO,
    /// ELF.
    Elf,
    /// COFF/PE.
    Coff,
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectFormat::MachO => write!(f, "Mach-O"),
            ObjectFormat::Elf => write!(f, "ELF"),
            ObjectFormat::Coff => write!(f, "COFF"),
        }
    }
}

/// What an external relocation points at. The alternative also fixes the
/// relocation type the object writer will use (branch vs GOT load).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelocTarget {
    /// Branch to a global symbol, by symbol-table index.
    Extern {
        /// Global symbol index.
        symbol: u32,
    },
    /// RIP-relative load of a GOT entry, by local GOT index.
    Got {
        /// GOT entry index.
        entry: u32,
    },
}

/// A relocation request handed to the object-file writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExternalReloc {
    /// Byte offset of the field to patch, from the start of the code buffer.
    pub offset: u64,
    /// Symbol or GOT entry the field refers to.
    pub target: RelocTarget,
    /// Constant added to the resolved address.
    pub addend: i64,
    /// Whether the field is PC-relative.
    pub pcrel: bool,
    /// log2 of the field size in bytes (2 → 4 bytes).
    pub length: u8,
}

/// Collecting sink for external relocation requests.
///
/// The emitter appends serially; the object writer drains `relocs` after
/// the declaration is emitted.
#[derive(Debug)]
pub struct LinkSink {
    /// Backend format; gates whether relocations are accepted at all.
    pub format: ObjectFormat,
    /// Requests recorded so far, in emission order.
    pub relocs: Vec<ExternalReloc>,
}

impl LinkSink {
    /// A fresh sink for the given backend.
    #[must_use]
    pub fn new(format: ObjectFormat) -> LinkSink {
        LinkSink {
            format,
            relocs: Vec::new(),
        }
    }
}

/// Snapshot passed with every debug marker: the current byte offset and
/// line/column alongside the previously recorded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugAdvance {
    /// Byte offset at the marker.
    pub pc: u64,
    /// Byte offset at the previous marker (or 0 at declaration start).
    pub prev_pc: u64,
    /// Source line at the marker.
    pub line: u32,
    /// Source column at the marker.
    pub column: u32,
    /// Previously recorded source line.
    pub prev_line: u32,
    /// Previously recorded source column.
    pub prev_column: u32,
}

/// Receiver for the three debug-info markers. Implemented by the
/// debug-line writer; a `None` sink drops the markers.
pub trait DebugSink {
    /// A new source position begins at `adv.pc`.
    fn line(&mut self, adv: DebugAdvance);
    /// The function prologue is complete at `adv.pc`; line/column repeat
    /// the last recorded position.
    fn prologue_end(&mut self, adv: DebugAdvance);
    /// The function epilogue begins at `adv.pc`.
    fn epilogue_begin(&mut self, adv: DebugAdvance);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn format_display() {
        assert_eq!(format!("{}", ObjectFormat::MachO), "Mach-O");
        assert_eq!(format!("{}", ObjectFormat::Elf), "ELF");
    }

    #[test]
    fn sink_starts_empty() {
        let sink = LinkSink::new(ObjectFormat::MachO);
        assert!(sink.relocs.is_empty());
    }
}
