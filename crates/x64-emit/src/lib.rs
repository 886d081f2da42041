//! # x64-emit — x86-64 machine-code emission core
//!
//! `x64-emit` lowers a compact Machine Intermediate Representation (MIR)
//! into a stream of x86-64 instruction bytes, resolving intra-function
//! branch displacements and recording relocation requests for external
//! symbols and GOT entries.
//!
//! ## Quick Start
//!
//! ```rust
//! use x64_emit::{
//!     emit_mir, Data, Inst, LinkSink, Mir, ObjectFormat, Ops, Register, SrcLoc, Tag,
//! };
//!
//! // mov rax, 1 ; ret
//! let mut mir = Mir::new();
//! mir.push(Inst::new(
//!     Tag::Mov,
//!     Ops::encode(Register::Rax, Register::None, 0b00),
//!     Data::imm(1),
//! ));
//! mir.push(Inst::new(
//!     Tag::Ret,
//!     Ops::encode(Register::None, Register::None, 0b11),
//!     Data::imm(0),
//! ));
//!
//! let mut code = Vec::new();
//! let mut sink = LinkSink::new(ObjectFormat::MachO);
//! emit_mir(&mir, &mut code, &mut sink, None, SrcLoc::default()).unwrap();
//! assert_eq!(code, [0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, 0xC3]);
//! ```
//!
//! ## Features
//!
//! - **Compact MIR** — 8-byte instruction records with a flag-dispatched
//!   operand header shared across the arithmetic family.
//! - **Bit-exact encoding** — REX, ModR/M, SIB, RIP-relative addressing,
//!   and range-minimal displacement/immediate widths.
//! - **Single-pass emission** — forward branches resolve through an
//!   offset map and a post-pass fixup; no MIR rewriting.
//! - **`no_std` + `alloc`** — embeddable; `std` is only needed for
//!   `std::error::Error`.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Lint policy ──────────────────────────────────────────────
// An instruction encoder performs many deliberate narrowing casts between
// integer widths (i32→i8, u64→u32) and is written against dense hex
// opcode literals (0x8D, 0x0F). The allowances below are expected and
// acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

extern crate alloc;

/// Single-pass MIR lowering, branch relocations, and fixup.
pub mod emit;
/// Low-level x86-64 byte primitives (REX, ModR/M, SIB, immediates).
pub mod encoder;
/// Error types and declaration source locations.
pub mod error;
/// Linker relocation sink and debug-info sink interfaces.
pub mod link;
/// The MIR data model: registers, instruction records, extra payloads.
pub mod mir;
/// Opcode tables shared across tag families.
pub(crate) mod opcode;

pub use emit::{emit_mir, Emitter};
pub use encoder::{Encoder, Rex};
pub use error::{EmitError, SrcLoc};
pub use link::{
    DebugAdvance, DebugSink, ExternalReloc, LinkSink, ObjectFormat, RelocTarget,
};
pub use mir::{
    Data, DbgLineColumn, DecodedOps, Imm64, ImmPair, Inst, InstIndex, Mir, Ops, Register, Tag,
};
