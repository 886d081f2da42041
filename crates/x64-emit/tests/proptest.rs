//! Property-based tests using proptest.
//!
//! These verify the emitter's laws across randomly generated inputs: the
//! operand-header round-trip, minimal immediate widths, REX omission, and
//! the branch displacement law.

use proptest::prelude::*;
use x64_emit::{
    emit_mir, Data, Inst, LinkSink, Mir, ObjectFormat, Ops, Register, SrcLoc, Tag,
};

const ALL_REGISTERS: [Register; 65] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rbx,
    Register::Rsp,
    Register::Rbp,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::Eax,
    Register::Ecx,
    Register::Edx,
    Register::Ebx,
    Register::Esp,
    Register::Ebp,
    Register::Esi,
    Register::Edi,
    Register::R8d,
    Register::R9d,
    Register::R10d,
    Register::R11d,
    Register::R12d,
    Register::R13d,
    Register::R14d,
    Register::R15d,
    Register::Ax,
    Register::Cx,
    Register::Dx,
    Register::Bx,
    Register::Sp,
    Register::Bp,
    Register::Si,
    Register::Di,
    Register::R8w,
    Register::R9w,
    Register::R10w,
    Register::R11w,
    Register::R12w,
    Register::R13w,
    Register::R14w,
    Register::R15w,
    Register::Al,
    Register::Cl,
    Register::Dl,
    Register::Bl,
    Register::Ah,
    Register::Ch,
    Register::Dh,
    Register::Bh,
    Register::R8b,
    Register::R9b,
    Register::R10b,
    Register::R11b,
    Register::R12b,
    Register::R13b,
    Register::R14b,
    Register::R15b,
    Register::None,
];

/// The 64-bit general-purpose row.
const GP64: [Register; 16] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rbx,
    Register::Rsp,
    Register::Rbp,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

fn any_register() -> impl Strategy<Value = Register> {
    prop::sample::select(ALL_REGISTERS.to_vec())
}

fn any_gp64() -> impl Strategy<Value = Register> {
    prop::sample::select(GP64.to_vec())
}

fn emit(mir: &Mir) -> Vec<u8> {
    let mut code = Vec::new();
    let mut sink = LinkSink::new(ObjectFormat::MachO);
    emit_mir(mir, &mut code, &mut sink, None, SrcLoc::new(1, 1)).unwrap();
    code
}

proptest! {
    /// decode(encode({reg1, reg2, flags})) == {reg1, reg2, flags} for the
    /// whole register space, sentinel included.
    #[test]
    fn ops_round_trip(reg1 in any_register(), reg2 in any_register(), flags in 0u8..4) {
        let decoded = Ops::encode(reg1, reg2, flags).decode();
        prop_assert_eq!(decoded.reg1, reg1);
        prop_assert_eq!(decoded.reg2, reg2);
        prop_assert_eq!(decoded.flags, flags);
    }

    /// PUSH immediates pick the smallest signed width that holds the value.
    #[test]
    fn push_imm_minimal_width(imm in any::<i32>()) {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::Push,
            Ops::encode(Register::None, Register::None, 0b10),
            Data::imm(imm),
        ));
        let code = emit(&mir);
        if i8::try_from(imm).is_ok() {
            prop_assert_eq!(code.len(), 2);
            prop_assert_eq!(code[0], 0x6A);
        } else if i16::try_from(imm).is_ok() {
            prop_assert_eq!(code.len(), 4);
            prop_assert_eq!(code[0], 0x66);
            prop_assert_eq!(code[1], 0x68);
        } else {
            prop_assert_eq!(code.len(), 5);
            prop_assert_eq!(code[0], 0x68);
        }
    }

    /// Memory displacements narrow to disp8 exactly when the value fits i8
    /// (checked via total instruction length of a load off a plain base).
    #[test]
    fn load_disp_minimal_width(disp in any::<i32>()) {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::Mov,
            Ops::encode(Register::Rax, Register::Rbx, 0b01),
            Data::imm(disp),
        ));
        let code = emit(&mir);
        // REX + 8B + ModR/M (+ disp)
        let expected = if disp == 0 {
            3
        } else if i8::try_from(disp).is_ok() {
            4
        } else {
            7
        };
        prop_assert_eq!(code.len(), expected);
    }

    /// No REX byte appears when W/R/X/B are all zero: 32-bit operations on
    /// the unextended register rows never emit a 0x4X prefix.
    #[test]
    fn rex_omitted_for_plain_32bit_pairs(a in 0usize..8, b in 0usize..8) {
        let reg1 = ALL_REGISTERS[16 + a]; // eax..edi
        let reg2 = ALL_REGISTERS[16 + b];
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::Add,
            Ops::encode(reg1, reg2, 0b00),
            Data::imm(0),
        ));
        let code = emit(&mir);
        prop_assert_eq!(code.len(), 2);
        prop_assert!(!(0x40..=0x4F).contains(&code[0]));
    }

    /// Register-to-register moves across the 64-bit row are always three
    /// bytes: a REX with W set, the opcode, and ModR/M.
    #[test]
    fn gp64_mov_shape(dst in any_gp64(), src in any_gp64()) {
        let mut mir = Mir::new();
        mir.push(Inst::new(Tag::Mov, Ops::encode(dst, src, 0b00), Data::imm(0)));
        let code = emit(&mir);
        prop_assert_eq!(code.len(), 3);
        prop_assert_eq!(code[0] & 0xF8, 0x48);
        prop_assert_eq!(code[1], 0x89);
        prop_assert_eq!(code[2] >> 6, 0b11);
    }

    /// The branch displacement law: after fixup, the 32-bit word at the
    /// relocation offset equals target_offset - (source + length), for an
    /// arbitrary placement of the jump within a sled of int3 bytes.
    #[test]
    fn branch_displacement_law(pre in 0u32..12, post in 0u32..12, target_sel in 0u32..25) {
        let total = pre + 1 + post;
        let target = target_sel % total;

        let mut mir = Mir::new();
        for _ in 0..pre {
            mir.push(Inst::new(
                Tag::Brk,
                Ops::encode(Register::None, Register::None, 0b00),
                Data::imm(0),
            ));
        }
        mir.push(Inst::new(
            Tag::Jmp,
            Ops::encode(Register::None, Register::None, 0b00),
            Data::inst(target),
        ));
        for _ in 0..post {
            mir.push(Inst::new(
                Tag::Brk,
                Ops::encode(Register::None, Register::None, 0b00),
                Data::imm(0),
            ));
        }

        let code = emit(&mir);
        prop_assert_eq!(code.len() as u32, pre + 5 + post);

        // Each brk is one byte; the jmp occupies [pre, pre+5).
        let target_offset = if target <= pre {
            target
        } else {
            pre + 5 + (target - pre - 1)
        };
        let expected = target_offset as i64 - (i64::from(pre) + 5);
        let at = (pre + 1) as usize;
        let disp = i32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]);
        prop_assert_eq!(i64::from(disp), expected);
    }

    /// Scale-dst immediate stores narrow the immediate operand (and the
    /// operand size) to the smallest signed width.
    #[test]
    fn scale_dst_imm_minimal_width(imm in any::<i32>()) {
        let mut mir = Mir::new();
        mir.push(Inst::new(
            Tag::MovScaleDst,
            Ops::encode(Register::Rbx, Register::None, 0b00),
            Data::imm(imm),
        ));
        let code = emit(&mir);
        // opcode + ModR/M + SIB + disp8 + immediate (+ 0x66 for 16-bit)
        let expected = if i8::try_from(imm).is_ok() {
            5
        } else if i16::try_from(imm).is_ok() {
            7
        } else {
            8
        };
        prop_assert_eq!(code.len(), expected);
    }
}
