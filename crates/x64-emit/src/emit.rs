//! Single-pass MIR lowering to x86-64 machine code.
//!
//! The driver walks the instruction array once. Before lowering each
//! instruction it records the instruction's start offset in the
//! code-offset mapping; branches to not-yet-emitted targets append a
//! relocation carrying the target's MIR index. After the pass, every
//! relocation is resolved against the mapping and its 32-bit displacement
//! is patched in place. Branches are fixed at 32-bit displacements.
//!
//! One `Emitter` serves one declaration and is dropped afterwards; no
//! state outlives it except the bytes in the caller's buffer and the
//! relocation requests in the caller's [`LinkSink`].

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, trace};

use crate::encoder::{Encoder, Rex};
use crate::error::{EmitError, SrcLoc};
use crate::link::{DebugAdvance, DebugSink, ExternalReloc, LinkSink, ObjectFormat, RelocTarget};
use crate::mir::{InstIndex, Mir, Register, Tag};
use crate::opcode::{arith_opcode, ArithOp, Condition, Form};

/// Intra-function branch relocation, resolved by the end-of-pass fixup.
#[derive(Debug, Clone, Copy)]
struct Reloc {
    /// Byte offset where the branch instruction starts.
    source: u64,
    /// MIR index of the branch target.
    target: InstIndex,
    /// Byte offset of the disp32 field to patch.
    offset: u64,
    /// Total instruction length in bytes.
    length: u8,
}

/// Emits one declaration's MIR into the caller's code buffer.
pub struct Emitter<'a> {
    mir: &'a Mir,
    code: &'a mut Vec<u8>,
    sink: &'a mut LinkSink,
    debug_sink: Option<&'a mut dyn DebugSink>,
    loc: SrcLoc,
    /// MIR index → start byte offset; written once per instruction, read
    /// by the fixup pass.
    code_offset_mapping: BTreeMap<InstIndex, u64>,
    relocs: Vec<Reloc>,
    prev_di_line: u32,
    prev_di_column: u32,
    prev_di_pc: u64,
}

/// Lower a declaration's MIR into `code`.
///
/// Convenience wrapper around [`Emitter::new`] + [`Emitter::emit`].
///
/// # Errors
///
/// See [`EmitError`]; any error is terminal for this declaration.
pub fn emit_mir<'a>(
    mir: &'a Mir,
    code: &'a mut Vec<u8>,
    sink: &'a mut LinkSink,
    debug_sink: Option<&'a mut dyn DebugSink>,
    loc: SrcLoc,
) -> Result<(), EmitError> {
    Emitter::new(mir, code, sink, debug_sink, loc).emit()
}

impl<'a> Emitter<'a> {
    /// Set up an emitter for one declaration. `loc` is the declaration's
    /// source position; it seeds the debug-line state and is attached to
    /// every diagnostic.
    pub fn new(
        mir: &'a Mir,
        code: &'a mut Vec<u8>,
        sink: &'a mut LinkSink,
        debug_sink: Option<&'a mut dyn DebugSink>,
        loc: SrcLoc,
    ) -> Emitter<'a> {
        Emitter {
            mir,
            code,
            sink,
            debug_sink,
            loc,
            code_offset_mapping: BTreeMap::new(),
            relocs: Vec::new(),
            prev_di_line: loc.line,
            prev_di_column: loc.column,
            prev_di_pc: 0,
        }
    }

    /// Run the emission pass and resolve branch relocations.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::OutOfMemory`] if the code buffer cannot grow,
    /// or [`EmitError::EmitFail`] for unimplemented encoding variants,
    /// missing relocation targets, displacement overflow, and unsupported
    /// linker backends.
    pub fn emit(mut self) -> Result<(), EmitError> {
        self.emit_body()?;
        self.apply_fixups()?;
        debug!(
            "emitted {} MIR instructions into {} bytes ({} branch fixups)",
            self.mir.len(),
            self.code.len(),
            self.relocs.len()
        );
        Ok(())
    }

    fn emit_body(&mut self) -> Result<(), EmitError> {
        for index in 0..self.mir.len() {
            let offset = self.code.len() as u64;
            let clobbered = self.code_offset_mapping.insert(index, offset);
            debug_assert!(clobbered.is_none(), "MIR index emitted twice");
            self.emit_inst(index)?;
        }
        Ok(())
    }

    fn emit_inst(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let tag = self.mir.get(index).tag;
        use Tag::*;
        match tag {
            Adc | Add | Sub | Xor | And | Or | Sbb | Cmp | Mov => {
                self.mir_arith(arith_op(tag), index)
            }
            AdcScaleSrc | AddScaleSrc | SubScaleSrc | XorScaleSrc | AndScaleSrc | OrScaleSrc
            | SbbScaleSrc | CmpScaleSrc | MovScaleSrc => {
                self.mir_arith_scale_src(arith_op(tag), index)
            }
            AdcScaleDst | AddScaleDst | SubScaleDst | XorScaleDst | AndScaleDst | OrScaleDst
            | SbbScaleDst | CmpScaleDst | MovScaleDst => {
                self.mir_arith_scale_dst(arith_op(tag), index)
            }
            AdcScaleImm | AddScaleImm | SubScaleImm | XorScaleImm | AndScaleImm | OrScaleImm
            | SbbScaleImm | CmpScaleImm | MovScaleImm => {
                self.mir_arith_scale_imm(arith_op(tag), index)
            }
            Movabs => self.mir_movabs(index),
            Lea => self.mir_lea(index),
            LeaRip => self.mir_lea_rip(index),
            ImulComplex => self.mir_imul_complex(index),
            Push | Pop => self.mir_push_pop(index),
            Jmp | Call => self.mir_jmp_call(index),
            Ret => self.mir_ret(index),
            Syscall => self.mir_syscall(),
            Test => self.mir_test(index),
            Brk => self.mir_brk(),
            CallExtern => self.mir_call_extern(index),
            CondJmpGreaterLess | CondJmpAboveBelow | CondJmpEqNe => self.mir_cond_jmp(index),
            CondSetByteGreaterLess | CondSetByteAboveBelow | CondSetByteEqNe => {
                self.mir_cond_set_byte(index)
            }
            DbgLine => {
                let payload = self.mir.get(index).data.as_payload();
                let lc = self.mir.line_column(payload);
                self.dbg_line(lc.line, lc.column);
                Ok(())
            }
            DbgPrologueEnd => {
                self.dbg_prologue_end();
                Ok(())
            }
            DbgEpilogueBegin => {
                self.dbg_epilogue_begin();
                Ok(())
            }
        }
    }

    fn fail(&self, msg: String) -> EmitError {
        EmitError::EmitFail { msg, loc: self.loc }
    }

    // ─── Arithmetic family ───────────────────────────────────

    fn mir_arith(&mut self, op: ArithOp, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        match ops.flags {
            0b00 => {
                if ops.reg2 == Register::None {
                    self.arith_mi_reg(op, ops.reg1, inst.data.as_imm())
                } else {
                    self.arith_mr_reg(op, ops.reg1, ops.reg2)
                }
            }
            0b01 => {
                if ops.reg2 == Register::None {
                    self.arith_rm_abs(op, ops.reg1, inst.data.as_imm())
                } else {
                    self.arith_rm_mem(op, ops.reg1, ops.reg2, inst.data.as_imm())
                }
            }
            0b10 => {
                if ops.reg2 == Register::None {
                    self.arith_mi_mem(op, ops.reg1, 0, inst.data.as_imm())
                } else {
                    self.arith_mr_mem(op, ops.reg1, ops.reg2, inst.data.as_imm())
                }
            }
            0b11 => {
                let pair = self.mir.imm_pair(inst.data.as_payload());
                self.arith_mi_mem(op, ops.reg1, pair.dest_off, pair.operand)
            }
            _ => unreachable!("flags field is two bits"),
        }
    }

    /// `op reg1, reg2` (MR form, register direct).
    fn arith_mr_reg(&mut self, op: ArithOp, dst: Register, src: Register) -> Result<(), EmitError> {
        let size = dst.size();
        let (opc, _) = arith_opcode(op, Form::Mr);
        let opc = if size == 8 { opc - 1 } else { opc };
        let mut enc = Encoder::new(self.code, 4)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            r: src.is_extended(),
            x: false,
            b: dst.is_extended(),
        });
        enc.opcode_1byte(opc);
        enc.modrm_direct(src.low_id(), dst.low_id());
        Ok(())
    }

    /// `op reg1, imm` (MI form, register direct).
    fn arith_mi_reg(&mut self, op: ArithOp, dst: Register, imm: i32) -> Result<(), EmitError> {
        let size = dst.size();
        let (opc, digit) = arith_opcode(op, Form::Mi);
        let opc = if size == 8 { opc - 1 } else { opc };
        let mut enc = Encoder::new(self.code, 8)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            b: dst.is_extended(),
            ..Rex::clear()
        });
        enc.opcode_1byte(opc);
        enc.modrm_direct(digit, dst.low_id());
        match size {
            8 => enc.imm8(imm as i8),
            16 => enc.imm16(imm as i16),
            _ => enc.imm32(imm),
        }
        Ok(())
    }

    /// `op reg1, [reg2 + disp]` (RM form).
    fn arith_rm_mem(
        &mut self,
        op: ArithOp,
        dst: Register,
        base: Register,
        disp: i32,
    ) -> Result<(), EmitError> {
        let size = dst.size();
        let (opc, _) = arith_opcode(op, Form::Rm);
        let opc = if size == 8 { opc - 1 } else { opc };
        let base = base.to64();
        let mut enc = Encoder::new(self.code, 9)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            r: dst.is_extended(),
            x: false,
            b: base.is_extended(),
        });
        enc.opcode_1byte(opc);
        enc.mem_base_disp(dst.low_id(), base.low_id(), disp);
        Ok(())
    }

    /// `op reg1, [disp32]` (RM form, absolute address).
    fn arith_rm_abs(&mut self, op: ArithOp, dst: Register, disp: i32) -> Result<(), EmitError> {
        let size = dst.size();
        let (opc, _) = arith_opcode(op, Form::Rm);
        let opc = if size == 8 { opc - 1 } else { opc };
        let mut enc = Encoder::new(self.code, 9)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            r: dst.is_extended(),
            ..Rex::clear()
        });
        enc.opcode_1byte(opc);
        enc.mem_abs32(dst.low_id(), disp);
        Ok(())
    }

    /// `op [reg1 + disp], reg2` (MR form).
    fn arith_mr_mem(
        &mut self,
        op: ArithOp,
        base: Register,
        src: Register,
        disp: i32,
    ) -> Result<(), EmitError> {
        let size = src.size();
        let (opc, _) = arith_opcode(op, Form::Mr);
        let opc = if size == 8 { opc - 1 } else { opc };
        let base = base.to64();
        let mut enc = Encoder::new(self.code, 9)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            r: src.is_extended(),
            x: false,
            b: base.is_extended(),
        });
        enc.opcode_1byte(opc);
        enc.mem_base_disp(src.low_id(), base.low_id(), disp);
        Ok(())
    }

    /// `op [reg1 + disp], imm` (MI form with a memory destination).
    ///
    /// The operand width rides on `reg1`'s width class; the base register
    /// is its 64-bit projection.
    fn arith_mi_mem(
        &mut self,
        op: ArithOp,
        reg1: Register,
        disp: i32,
        imm: i32,
    ) -> Result<(), EmitError> {
        let size = reg1.size();
        let (opc, digit) = arith_opcode(op, Form::Mi);
        let opc = if size == 8 { opc - 1 } else { opc };
        let base = reg1.to64();
        let mut enc = Encoder::new(self.code, 13)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            b: base.is_extended(),
            ..Rex::clear()
        });
        enc.opcode_1byte(opc);
        enc.mem_base_disp(digit, base.low_id(), disp);
        match size {
            8 => enc.imm8(imm as i8),
            16 => enc.imm16(imm as i16),
            _ => enc.imm32(imm),
        }
        Ok(())
    }

    /// `op reg1, [reg2 + scale*rcx + disp]`; flags carry the scale exponent.
    fn mir_arith_scale_src(&mut self, op: ArithOp, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let scale = ops.flags;
        let size = ops.reg1.size();
        let (opc, _) = arith_opcode(op, Form::Rm);
        let opc = if size == 8 { opc - 1 } else { opc };
        let base = ops.reg2.to64();
        let mut enc = Encoder::new(self.code, 9)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            r: ops.reg1.is_extended(),
            x: false,
            b: base.is_extended(),
        });
        enc.opcode_1byte(opc);
        enc.mem_sib_scale_disp(
            ops.reg1.low_id(),
            scale,
            Register::Rcx.low_id(),
            base.low_id(),
            inst.data.as_imm(),
        );
        Ok(())
    }

    /// `op [reg1 + scale*rax + disp], reg2`, or with an immediate source
    /// (narrowed to its smallest signed width) when reg2 is none.
    fn mir_arith_scale_dst(&mut self, op: ArithOp, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let scale = ops.flags;
        let base = ops.reg1.to64();
        let imm = inst.data.as_imm();

        if ops.reg2 != Register::None {
            let size = ops.reg2.size();
            let (opc, _) = arith_opcode(op, Form::Mr);
            let opc = if size == 8 { opc - 1 } else { opc };
            let mut enc = Encoder::new(self.code, 9)?;
            if size == 16 {
                enc.prefix_16bit();
            }
            enc.rex(Rex {
                w: size == 64,
                r: ops.reg2.is_extended(),
                x: false,
                b: base.is_extended(),
            });
            enc.opcode_1byte(opc);
            enc.mem_sib_scale_disp(
                ops.reg2.low_id(),
                scale,
                Register::Rax.low_id(),
                base.low_id(),
                imm,
            );
            return Ok(());
        }

        // Immediate source: operand size tracks the narrowed immediate.
        let (opc, digit) = arith_opcode(op, Form::Mi);
        let mut enc = Encoder::new(self.code, 13)?;
        let rex = Rex {
            b: base.is_extended(),
            ..Rex::clear()
        };
        if i8::try_from(imm).is_ok() {
            enc.rex(rex);
            enc.opcode_1byte(opc - 1);
            enc.mem_sib_scale_disp(digit, scale, Register::Rax.low_id(), base.low_id(), 0);
            enc.imm8(imm as i8);
        } else if i16::try_from(imm).is_ok() {
            enc.prefix_16bit();
            enc.rex(rex);
            enc.opcode_1byte(opc);
            enc.mem_sib_scale_disp(digit, scale, Register::Rax.low_id(), base.low_id(), 0);
            enc.imm16(imm as i16);
        } else {
            enc.rex(rex);
            enc.opcode_1byte(opc);
            enc.mem_sib_scale_disp(digit, scale, Register::Rax.low_id(), base.low_id(), 0);
            enc.imm32(imm);
        }
        Ok(())
    }

    /// `op [reg1 + scale*rax + dest_off], operand` from an `ImmPair`.
    fn mir_arith_scale_imm(&mut self, op: ArithOp, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let scale = ops.flags;
        let base = ops.reg1.to64();
        let pair = self.mir.imm_pair(inst.data.as_payload());
        let (opc, digit) = arith_opcode(op, Form::Mi);
        let mut enc = Encoder::new(self.code, 13)?;
        enc.rex(Rex {
            b: base.is_extended(),
            ..Rex::clear()
        });
        enc.opcode_1byte(opc);
        enc.mem_sib_scale_disp(
            digit,
            scale,
            Register::Rax.low_id(),
            base.low_id(),
            pair.dest_off,
        );
        enc.imm32(pair.operand);
        Ok(())
    }

    // ─── Moves ───────────────────────────────────────────────

    fn mir_movabs(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();

        if ops.flags == 0b00 {
            // movabs reg1, imm — opcode with embedded register.
            let reg = ops.reg1;
            let size = reg.size();
            let mut enc = Encoder::new(self.code, 11)?;
            match size {
                64 => {
                    let imm = self.mir.imm64(inst.data.as_payload());
                    enc.rex(Rex {
                        w: true,
                        b: reg.is_extended(),
                        ..Rex::clear()
                    });
                    enc.opcode_with_reg(0xB8, reg.low_id());
                    enc.imm64(imm);
                }
                8 => {
                    enc.rex(Rex {
                        b: reg.is_extended(),
                        ..Rex::clear()
                    });
                    enc.opcode_with_reg(0xB0, reg.low_id());
                    enc.imm8(inst.data.as_imm() as i8);
                }
                16 => {
                    enc.prefix_16bit();
                    enc.rex(Rex {
                        b: reg.is_extended(),
                        ..Rex::clear()
                    });
                    enc.opcode_with_reg(0xB8, reg.low_id());
                    enc.imm16(inst.data.as_imm() as i16);
                }
                _ => {
                    enc.rex(Rex {
                        b: reg.is_extended(),
                        ..Rex::clear()
                    });
                    enc.opcode_with_reg(0xB8, reg.low_id());
                    enc.imm32(inst.data.as_imm());
                }
            }
            return Ok(());
        }

        let addr = self.mir.imm64(inst.data.as_payload());
        if ops.reg1 == Register::None {
            // movabs moffs, rax-family (accumulator store).
            self.movabs_moffs(ops.reg2, 0xA2, 0xA3, addr)
        } else {
            // movabs rax-family, moffs (accumulator load).
            self.movabs_moffs(ops.reg1, 0xA0, 0xA1, addr)
        }
    }

    /// The accumulator/moffs encodings (`A0`..`A3`): no ModR/M, the
    /// address follows the opcode directly.
    fn movabs_moffs(
        &mut self,
        reg: Register,
        opc8: u8,
        opc_wide: u8,
        addr: u64,
    ) -> Result<(), EmitError> {
        debug_assert!(reg.id() == 0, "moffs forms address the accumulator");
        let size = reg.size();
        let mut enc = Encoder::new(self.code, 11)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            ..Rex::clear()
        });
        enc.opcode_1byte(if size == 8 { opc8 } else { opc_wide });
        if size == 64 {
            enc.imm64(addr);
        } else {
            enc.imm32(addr as i32);
        }
        Ok(())
    }

    fn mir_lea(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        if ops.flags != 0b01 {
            return Err(self.fail(format!(
                "TODO implement lea with flags 0b{:02b}",
                ops.flags
            )));
        }
        let size = ops.reg1.size();
        let base = ops.reg2.to64();
        let mut enc = Encoder::new(self.code, 9)?;
        if size == 16 {
            enc.prefix_16bit();
        }
        enc.rex(Rex {
            w: size == 64,
            r: ops.reg1.is_extended(),
            x: false,
            b: base.is_extended(),
        });
        enc.opcode_1byte(0x8D);
        enc.mem_base_disp(ops.reg1.low_id(), base.low_id(), inst.data.as_imm());
        Ok(())
    }

    fn mir_lea_rip(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let start_offset = self.code.len() as u64;
        let disp_offset;
        {
            let mut enc = Encoder::new(self.code, 7)?;
            enc.rex(Rex {
                w: ops.reg1.size() == 64,
                r: ops.reg1.is_extended(),
                ..Rex::clear()
            });
            enc.opcode_1byte(0x8D);
            enc.modrm_rip_disp32(ops.reg1.low_id());
            let end_offset = enc.offset() as u64;
            disp_offset = end_offset;
            if ops.flags & 0b1 == 0 {
                // Locally resolved: the target is imm bytes past the
                // instruction start; RIP points past the disp32.
                let imm = inst.data.as_imm();
                enc.disp32(imm - ((end_offset - start_offset) as i32 + 4));
                return Ok(());
            }
            enc.disp32(0);
        }
        match self.sink.format {
            ObjectFormat::MachO => {
                self.sink.relocs.push(ExternalReloc {
                    offset: disp_offset,
                    target: RelocTarget::Got {
                        entry: inst.data.as_got_entry(),
                    },
                    addend: 0,
                    pcrel: true,
                    length: 2,
                });
                Ok(())
            }
            other => Err(self.fail(format!("TODO implement GOT relocations for {}", other))),
        }
    }

    // ─── Multiplies ──────────────────────────────────────────

    fn mir_imul_complex(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let size = ops.reg1.size();
        match ops.flags {
            0b00 => {
                // imul reg1, reg2 — 0F AF /r.
                let mut enc = Encoder::new(self.code, 5)?;
                enc.rex(Rex {
                    w: size == 64,
                    r: ops.reg1.is_extended(),
                    x: false,
                    b: ops.reg2.is_extended(),
                });
                enc.opcode_2byte(0x0F, 0xAF);
                enc.modrm_direct(ops.reg1.low_id(), ops.reg2.low_id());
                Ok(())
            }
            0b10 => {
                // imul reg1, reg2, imm — 6B ib when the immediate fits.
                let imm = inst.data.as_imm();
                let mut enc = Encoder::new(self.code, 8)?;
                enc.rex(Rex {
                    w: size == 64,
                    r: ops.reg1.is_extended(),
                    x: false,
                    b: ops.reg2.is_extended(),
                });
                if let Ok(small) = i8::try_from(imm) {
                    enc.opcode_1byte(0x6B);
                    enc.modrm_direct(ops.reg1.low_id(), ops.reg2.low_id());
                    enc.imm8(small);
                } else {
                    enc.opcode_1byte(0x69);
                    enc.modrm_direct(ops.reg1.low_id(), ops.reg2.low_id());
                    enc.imm32(imm);
                }
                Ok(())
            }
            flags => Err(self.fail(format!("TODO implement imul with flags 0b{:02b}", flags))),
        }
    }

    // ─── Stack ───────────────────────────────────────────────

    fn mir_push_pop(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let is_push = inst.tag == Tag::Push;
        match ops.flags {
            0b00 => {
                // push/pop reg — opcode with embedded register.
                let mut enc = Encoder::new(self.code, 2)?;
                enc.rex(Rex {
                    b: ops.reg1.is_extended(),
                    ..Rex::clear()
                });
                enc.opcode_with_reg(if is_push { 0x50 } else { 0x58 }, ops.reg1.low_id());
                Ok(())
            }
            0b01 => {
                // push/pop [reg1 + disp] — FF /6, 8F /0.
                let base = ops.reg1.to64();
                let mut enc = Encoder::new(self.code, 8)?;
                enc.rex(Rex {
                    b: base.is_extended(),
                    ..Rex::clear()
                });
                if is_push {
                    enc.opcode_1byte(0xFF);
                    enc.mem_base_disp8_or_32(6, base.low_id(), inst.data.as_imm());
                } else {
                    enc.opcode_1byte(0x8F);
                    enc.mem_base_disp8_or_32(0, base.low_id(), inst.data.as_imm());
                }
                Ok(())
            }
            0b10 if is_push => {
                // push imm — 6A ib, or 68 with the narrowest wider form.
                let imm = inst.data.as_imm();
                let mut enc = Encoder::new(self.code, 5)?;
                if let Ok(small) = i8::try_from(imm) {
                    enc.opcode_1byte(0x6A);
                    enc.imm8(small);
                } else if let Ok(word) = i16::try_from(imm) {
                    enc.prefix_16bit();
                    enc.opcode_1byte(0x68);
                    enc.imm16(word);
                } else {
                    enc.opcode_1byte(0x68);
                    enc.imm32(imm);
                }
                Ok(())
            }
            flags => Err(self.fail(format!(
                "TODO implement {} with flags 0b{:02b}",
                if is_push { "push" } else { "pop" },
                flags
            ))),
        }
    }

    // ─── Control flow ────────────────────────────────────────

    fn mir_jmp_call(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let is_call = inst.tag == Tag::Call;
        if ops.flags & 0b1 == 0 {
            // Relative to another MIR instruction: 5-byte rel32 with a
            // zero placeholder, patched by the fixup pass.
            let source = self.code.len() as u64;
            {
                let mut enc = Encoder::new(self.code, 5)?;
                enc.opcode_1byte(if is_call { 0xE8 } else { 0xE9 });
                enc.disp32(0);
            }
            self.relocs.push(Reloc {
                source,
                target: inst.data.as_inst(),
                offset: source + 1,
                length: 5,
            });
            Ok(())
        } else if ops.reg1 != Register::None {
            // Register indirect: FF /4 (jmp), FF /2 (call).
            let mut enc = Encoder::new(self.code, 3)?;
            enc.rex(Rex {
                b: ops.reg1.is_extended(),
                ..Rex::clear()
            });
            enc.opcode_1byte(0xFF);
            enc.modrm_direct(if is_call { 2 } else { 4 }, ops.reg1.low_id());
            Ok(())
        } else {
            // Memory indirect through an absolute address.
            let mut enc = Encoder::new(self.code, 7)?;
            enc.opcode_1byte(0xFF);
            enc.mem_abs32(if is_call { 2 } else { 4 }, inst.data.as_imm());
            Ok(())
        }
    }

    fn mir_cond_jmp(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let cond = self.condition(inst.tag, ops.flags)?;
        let source = self.code.len() as u64;
        {
            let mut enc = Encoder::new(self.code, 6)?;
            enc.opcode_2byte(0x0F, cond.jcc_opcode());
            enc.disp32(0);
        }
        self.relocs.push(Reloc {
            source,
            target: inst.data.as_inst(),
            offset: source + 2,
            length: 6,
        });
        Ok(())
    }

    fn mir_cond_set_byte(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        let cond = self.condition(inst.tag, ops.flags)?;
        let mut enc = Encoder::new(self.code, 4)?;
        enc.rex(Rex {
            w: true,
            b: ops.reg1.is_extended(),
            ..Rex::clear()
        });
        enc.opcode_2byte(0x0F, cond.setcc_opcode());
        enc.modrm_direct(0, ops.reg1.low_id());
        Ok(())
    }

    /// Map a condition-family tag plus its flag subrange to a condition.
    fn condition(&self, tag: Tag, flags: u8) -> Result<Condition, EmitError> {
        Ok(match tag {
            Tag::CondJmpGreaterLess | Tag::CondSetByteGreaterLess => match flags {
                0b00 => Condition::Gte,
                0b01 => Condition::Gt,
                0b10 => Condition::Lt,
                0b11 => Condition::Lte,
                _ => unreachable!("flags field is two bits"),
            },
            Tag::CondJmpAboveBelow | Tag::CondSetByteAboveBelow => match flags {
                0b00 => Condition::Ae,
                0b01 => Condition::A,
                0b10 => Condition::B,
                0b11 => Condition::Be,
                _ => unreachable!("flags field is two bits"),
            },
            Tag::CondJmpEqNe | Tag::CondSetByteEqNe => match flags {
                0b00 => Condition::Eq,
                0b01 => Condition::Ne,
                flags => {
                    return Err(self.fail(format!(
                        "TODO implement eq/ne condition with flags 0b{:02b}",
                        flags
                    )))
                }
            },
            _ => unreachable!("not a condition-family tag"),
        })
    }

    fn mir_ret(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let flags = inst.ops.decode().flags;
        let mut enc = Encoder::new(self.code, 3)?;
        match flags {
            0b00 => {
                enc.opcode_1byte(0xCA);
                enc.imm16(inst.data.as_imm() as i16);
            }
            0b01 => enc.opcode_1byte(0xCB),
            0b10 => {
                enc.opcode_1byte(0xC2);
                enc.imm16(inst.data.as_imm() as i16);
            }
            0b11 => enc.opcode_1byte(0xC3),
            _ => unreachable!("flags field is two bits"),
        }
        Ok(())
    }

    fn mir_call_extern(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let source = self.code.len() as u64;
        {
            let mut enc = Encoder::new(self.code, 5)?;
            enc.opcode_1byte(0xE8);
            enc.disp32(0);
        }
        match self.sink.format {
            ObjectFormat::MachO => {
                self.sink.relocs.push(ExternalReloc {
                    offset: source + 1,
                    target: RelocTarget::Extern {
                        symbol: inst.data.as_extern_fn(),
                    },
                    addend: 0,
                    pcrel: true,
                    length: 2,
                });
                Ok(())
            }
            other => Err(self.fail(format!("TODO implement call_extern for {}", other))),
        }
    }

    // ─── Flags and system ────────────────────────────────────

    fn mir_test(&mut self, index: InstIndex) -> Result<(), EmitError> {
        let inst = self.mir.get(index);
        let ops = inst.ops.decode();
        if ops.flags != 0b00 {
            return Err(self.fail(format!(
                "TODO implement test with flags 0b{:02b}",
                ops.flags
            )));
        }
        if ops.reg2 != Register::None {
            return Err(self.fail(String::from("TODO implement test with register source")));
        }
        let size = ops.reg1.size();
        if size != 32 && size != 64 {
            return Err(self.fail(format!("TODO implement test with {}-bit operand", size)));
        }
        let imm = inst.data.as_imm();
        if ops.reg1.to64() == Register::Rax {
            let mut enc = Encoder::new(self.code, 6)?;
            enc.rex(Rex {
                w: size == 64,
                ..Rex::clear()
            });
            enc.opcode_1byte(0xA9);
            enc.imm32(imm);
        } else {
            let mut enc = Encoder::new(self.code, 7)?;
            enc.rex(Rex {
                w: size == 64,
                b: ops.reg1.is_extended(),
                ..Rex::clear()
            });
            enc.opcode_1byte(0xF7);
            enc.modrm_direct(0, ops.reg1.low_id());
            enc.imm32(imm);
        }
        Ok(())
    }

    fn mir_syscall(&mut self) -> Result<(), EmitError> {
        let mut enc = Encoder::new(self.code, 2)?;
        enc.opcode_2byte(0x0F, 0x05);
        Ok(())
    }

    fn mir_brk(&mut self) -> Result<(), EmitError> {
        let mut enc = Encoder::new(self.code, 1)?;
        enc.opcode_1byte(0xCC);
        Ok(())
    }

    // ─── Debug-info markers ──────────────────────────────────

    fn debug_advance(&self, line: u32, column: u32) -> DebugAdvance {
        DebugAdvance {
            pc: self.code.len() as u64,
            prev_pc: self.prev_di_pc,
            line,
            column,
            prev_line: self.prev_di_line,
            prev_column: self.prev_di_column,
        }
    }

    fn dbg_line(&mut self, line: u32, column: u32) {
        let adv = self.debug_advance(line, column);
        if let Some(sink) = self.debug_sink.as_mut() {
            sink.line(adv);
        }
        self.prev_di_line = line;
        self.prev_di_column = column;
        self.prev_di_pc = adv.pc;
    }

    fn dbg_prologue_end(&mut self) {
        let adv = self.debug_advance(self.prev_di_line, self.prev_di_column);
        if let Some(sink) = self.debug_sink.as_mut() {
            sink.prologue_end(adv);
        }
        self.prev_di_pc = adv.pc;
    }

    fn dbg_epilogue_begin(&mut self) {
        let adv = self.debug_advance(self.prev_di_line, self.prev_di_column);
        if let Some(sink) = self.debug_sink.as_mut() {
            sink.epilogue_begin(adv);
        }
        self.prev_di_pc = adv.pc;
    }

    // ─── Fixups ──────────────────────────────────────────────

    fn apply_fixups(&mut self) -> Result<(), EmitError> {
        for reloc in &self.relocs {
            let target_offset = match self.code_offset_mapping.get(&reloc.target) {
                Some(&offset) => offset,
                None => {
                    return Err(self.fail(format!(
                        "relocation target {} not found in the code offset mapping",
                        reloc.target
                    )))
                }
            };
            let disp = target_offset as i64 - (reloc.source as i64 + i64::from(reloc.length));
            let disp = i32::try_from(disp).map_err(|_| {
                self.fail(format!("branch displacement {} does not fit in 32 bits", disp))
            })?;
            trace!(
                "fixup: branch at {:#x} → MIR {} at {:#x}, disp {}",
                reloc.source,
                reloc.target,
                target_offset,
                disp
            );
            let at = reloc.offset as usize;
            self.code[at..at + 4].copy_from_slice(&disp.to_le_bytes());
        }
        Ok(())
    }
}

/// Family member for an arithmetic-group tag; callers only pass tags from
/// the matched family arms.
fn arith_op(tag: Tag) -> ArithOp {
    match ArithOp::from_tag(tag) {
        Some(op) => op,
        None => unreachable!("tag outside the arithmetic family"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{Data, Inst, Ops};
    use alloc::vec;

    fn loc() -> SrcLoc {
        SrcLoc::new(1, 1)
    }

    fn emit_all(mir: &Mir) -> Vec<u8> {
        let mut code = Vec::new();
        let mut sink = LinkSink::new(ObjectFormat::MachO);
        emit_mir(mir, &mut code, &mut sink, None, loc()).unwrap();
        code
    }

    #[test]
    fn offset_map_matches_instruction_starts() {
        let mut mir = Mir::new();
        // push rbp (1 byte), mov rax, 1 (7 bytes), ret (1 byte)
        mir.push(Inst::new(
            Tag::Push,
            Ops::encode(Register::Rbp, Register::None, 0b00),
            Data::imm(0),
        ));
        mir.push(Inst::new(
            Tag::Mov,
            Ops::encode(Register::Rax, Register::None, 0b00),
            Data::imm(1),
        ));
        mir.push(Inst::new(
            Tag::Ret,
            Ops::encode(Register::None, Register::None, 0b11),
            Data::imm(0),
        ));

        let mut code = Vec::new();
        let mut sink = LinkSink::new(ObjectFormat::MachO);
        let mut emitter = Emitter::new(&mir, &mut code, &mut sink, None, loc());
        emitter.emit_body().unwrap();
        assert_eq!(emitter.code_offset_mapping.len(), 3);
        assert_eq!(emitter.code_offset_mapping[&0], 0);
        assert_eq!(emitter.code_offset_mapping[&1], 1);
        assert_eq!(emitter.code_offset_mapping[&2], 8);
    }

    #[test]
    fn missing_relocation_target_fails() {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::Jmp,
            Ops::encode(Register::None, Register::None, 0b00),
            Data::inst(7),
        ));
        let mut code = Vec::new();
        let mut sink = LinkSink::new(ObjectFormat::MachO);
        let err = emit_mir(&mir, &mut code, &mut sink, None, loc()).unwrap_err();
        assert!(matches!(err, EmitError::EmitFail { .. }));
    }

    #[test]
    fn backward_branch_displacement() {
        let mut mir = Mir::new();
        // target: brk; jmp target → CC E9 FA FF FF FF
        mir.push(Inst::new(
            Tag::Brk,
            Ops::encode(Register::None, Register::None, 0b00),
            Data::imm(0),
        ));
        mir.push(Inst::new(
            Tag::Jmp,
            Ops::encode(Register::None, Register::None, 0b00),
            Data::inst(0),
        ));
        let code = emit_all(&mir);
        // disp = 0 - (1 + 5) = -6
        assert_eq!(code, vec![0xCC, 0xE9, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn unimplemented_test_form_is_fail_closed() {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::Test,
            Ops::encode(Register::Rcx, Register::Rdx, 0b00),
            Data::imm(0),
        ));
        let mut code = Vec::new();
        let mut sink = LinkSink::new(ObjectFormat::MachO);
        let err = emit_mir(&mir, &mut code, &mut sink, None, loc()).unwrap_err();
        match err {
            EmitError::EmitFail { msg, .. } => assert!(msg.contains("TODO")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn call_extern_requires_macho() {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::CallExtern,
            Ops::encode(Register::None, Register::None, 0b00),
            Data::extern_fn(3),
        ));
        let mut code = Vec::new();
        let mut sink = LinkSink::new(ObjectFormat::Elf);
        let err = emit_mir(&mir, &mut code, &mut sink, None, loc()).unwrap_err();
        match err {
            EmitError::EmitFail { msg, .. } => assert!(msg.contains("ELF")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
