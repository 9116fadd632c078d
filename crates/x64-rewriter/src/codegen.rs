// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The generator: re-encodes the optimized trace into a fresh byte
//! sequence and lands it in a `CodeStorage` reservation.
//!
//! Every captured `Jcc`/`Jmp`/`Call` is re-emitted in its long (rel32)
//! form unconditionally, trading code size for a single-pass generator:
//! no instruction ever needs to grow after its neighbors are laid out,
//! so layout and emission are the same walk over the trace. A branch's
//! target is recovered from the fields the decoder already preserved on
//! `Instr` (`address + length + rel`), which is an absolute address in
//! the *original* function and entirely independent of where this
//! instruction lands in the new buffer.
//!
//! Every other instruction is a pass-through: the opcode bytes the
//! decoder captured (`raw_opcode`) are replayed verbatim, and only
//! ModR/M, SIB, displacement, and immediate are resynthesized from the
//! instruction's current operands. A captured instruction's operand
//! shapes never change after decode except for `LEA`'s folded
//! displacement, so this is exact, not approximate.

use crate::instruction::{Instr, InstrList, Mnemonic, OperandEncodingKind};
use crate::operand::{Operand, Segment, ValueType};
use crate::register::Register;
use crate::storage::CodeStorage;

use crate::error::Result;

fn sign_extend_rel(value: u64, width: ValueType) -> i64 {
    match width {
        ValueType::W8 => (value as u8) as i8 as i64,
        ValueType::W32 | ValueType::W64 => (value as u32) as i32 as i64,
        _ => value as i64,
    }
}

fn fits_i8(v: i64) -> bool {
    (i8::MIN as i64..=i8::MAX as i64).contains(&v)
}

/// The ModR/M(+SIB+disp) shape for one operand acting as `r/m`, mirroring
/// `decode_modrm` in reverse (including the RIP-relative tie-break).
struct RmParts {
    mod_bits: u8,
    rm_bits: u8,
    sib: Option<u8>,
    disp_len: u8,
    is_rip: bool,
    disp: i64,
    rex_x: bool,
    rex_b: bool,
}

fn rm_parts(op: &Operand) -> RmParts {
    match op {
        Operand::Register { reg, .. } => RmParts {
            mod_bits: 3,
            rm_bits: reg.low3(),
            sib: None,
            disp_len: 0,
            is_rip: false,
            disp: 0,
            rex_x: false,
            rex_b: reg.is_extended(),
        },
        Operand::Indirect { base, displacement, .. } if *base == Register::Ip => RmParts {
            mod_bits: 0,
            rm_bits: 5,
            sib: None,
            disp_len: 4,
            is_rip: true,
            disp: *displacement,
            rex_x: false,
            rex_b: false,
        },
        Operand::Indirect { base, index, scale, displacement, .. } => {
            let needs_sib = *index != Register::None || *base == Register::None || base.low3() == 4;
            if !needs_sib {
                let base_field = base.low3();
                let forced_disp8 = base_field == 5 && *displacement == 0;
                let (mod_bits, disp_len) = if forced_disp8 {
                    (1, 1)
                } else if *displacement == 0 {
                    (0, 0)
                } else if fits_i8(*displacement) {
                    (1, 1)
                } else {
                    (2, 4)
                };
                return RmParts {
                    mod_bits,
                    rm_bits: base_field,
                    sib: None,
                    disp_len,
                    is_rip: false,
                    disp: *displacement,
                    rex_x: false,
                    rex_b: base.is_extended(),
                };
            }
            let scale_bits = match scale {
                2 => 1,
                4 => 2,
                8 => 3,
                _ => 0,
            };
            let index_field = if *index == Register::None { 4 } else { index.low3() };
            if *base == Register::None {
                let sib = (scale_bits << 6) | (index_field << 3) | 5;
                return RmParts {
                    mod_bits: 0,
                    rm_bits: 4,
                    sib: Some(sib),
                    disp_len: 4,
                    is_rip: false,
                    disp: *displacement,
                    rex_x: index.is_extended(),
                    rex_b: false,
                };
            }
            let base_field = base.low3();
            let forced_disp8 = base_field == 5 && *displacement == 0;
            let (mod_bits, disp_len) = if forced_disp8 {
                (1, 1)
            } else if *displacement == 0 {
                (0, 0)
            } else if fits_i8(*displacement) {
                (1, 1)
            } else {
                (2, 4)
            };
            let sib = (scale_bits << 6) | (index_field << 3) | base_field;
            RmParts {
                mod_bits,
                rm_bits: 4,
                sib: Some(sib),
                disp_len,
                is_rip: false,
                disp: *displacement,
                rex_x: index.is_extended(),
                rex_b: base.is_extended(),
            }
        }
        Operand::Immediate { .. } => unreachable!("r/m operand cannot be an immediate"),
    }
}

fn rex_byte(w: bool, r: bool, x: bool, b: bool) -> Option<u8> {
    if w || r || x || b {
        Some(0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8)
    } else {
        None
    }
}

fn segment_of(instr: &Instr) -> Segment {
    for op in [instr.dst.as_ref(), instr.src1.as_ref(), instr.src2.as_ref()].into_iter().flatten() {
        if let Operand::Indirect { segment, .. } = op {
            if *segment != Segment::None {
                return *segment;
            }
        }
    }
    Segment::None
}

fn legacy_prefix_bytes(instr: &Instr) -> Vec<u8> {
    use crate::instruction::PrefixSet;
    let mut bytes = Vec::new();
    match segment_of(instr) {
        Segment::Fs => bytes.push(0x64),
        Segment::Gs => bytes.push(0x65),
        Segment::None => {}
    }
    if instr.prefixes.contains(PrefixSet::PS_66) {
        bytes.push(0x66);
    }
    if instr.prefixes.contains(PrefixSet::PS_F2) {
        bytes.push(0xF2);
    }
    if instr.prefixes.contains(PrefixSet::PS_F3) {
        bytes.push(0xF3);
    }
    bytes
}

/// Unary Mr-encoded instructions carry no real register in ModR/M.reg;
/// the field is a fixed opcode-extension selector (the classic
/// Group3/4/5 `/digit` forms).
fn unary_group_selector(mnemonic: Mnemonic) -> u8 {
    match mnemonic {
        Mnemonic::Inc => 0,
        Mnemonic::Dec => 1,
        Mnemonic::Not => 2,
        Mnemonic::Neg => 3,
        Mnemonic::Set(_) => 0,
        _ => 0,
    }
}

/// Rmi-encoded instructions (Group1 immediate arithmetic, Group2 shifts,
/// Group3 TEST-imm, and the MOV r/m,imm forms) select their operation
/// through the same fixed ModR/M.reg field.
fn rmi_group_selector(mnemonic: Mnemonic) -> u8 {
    match mnemonic {
        Mnemonic::Mov => 0,
        Mnemonic::Add => 0,
        Mnemonic::Or => 1,
        Mnemonic::And => 4,
        Mnemonic::Sub => 5,
        Mnemonic::Xor => 6,
        Mnemonic::Cmp => 7,
        Mnemonic::Test => 0,
        Mnemonic::Shl => 4,
        Mnemonic::Shr => 5,
        Mnemonic::Sar => 7,
        _ => 0,
    }
}

fn immediate_byte_len(raw_opcode_byte: u8, width: ValueType) -> usize {
    match raw_opcode_byte {
        0x80 | 0x83 | 0xC6 | 0xC0 | 0xC1 | 0xF6 => 1,
        _ => match width {
            ValueType::W8 => 1,
            ValueType::W16 => 2,
            _ => 4,
        },
    }
}

fn push_imm(bytes: &mut Vec<u8>, len: usize, value: u64) {
    match len {
        1 => bytes.push(value as u8),
        2 => bytes.extend_from_slice(&(value as u16).to_le_bytes()),
        4 => bytes.extend_from_slice(&(value as u32).to_le_bytes()),
        8 => bytes.extend_from_slice(&value.to_le_bytes()),
        _ => unreachable!("unsupported immediate width"),
    }
}

/// The absolute target address a captured relative branch/call refers
/// to in the *original* function.
fn original_target(instr: &Instr) -> u64 {
    let Some(Operand::Immediate { value, width }) = instr.src1 else {
        panic!("direct branch/call must carry an immediate rel operand");
    };
    instr
        .address
        .wrapping_add(instr.length as u64)
        .wrapping_add(sign_extend_rel(value, width) as u64)
}

/// Encodes one instruction at `instr_addr` in the new buffer. Returns the
/// emitted bytes; their count is `instr_addr`-independent (every variable-
/// target form uses a fixed-width rel32/disp32 encoding), so this same
/// function serves both the layout pass (call with a placeholder address
/// to get `.len()`) and the emit pass.
fn encode_one(instr: &Instr, instr_addr: u64) -> Vec<u8> {
    match instr.mnemonic {
        Mnemonic::HintCall | Mnemonic::HintRet | Mnemonic::Nop => Vec::new(),
        Mnemonic::Ret => vec![0xC3],
        Mnemonic::Push | Mnemonic::Pop => {
            let reg = instr
                .src1
                .as_ref()
                .or(instr.dst.as_ref())
                .and_then(Operand::as_register)
                .expect("PUSH/POP carries a GPR operand");
            let mut bytes = Vec::with_capacity(2);
            if let Some(rex) = rex_byte(false, false, false, reg.is_extended()) {
                bytes.push(rex);
            }
            bytes.push(instr.raw_opcode.as_slice()[0]);
            bytes
        }
        Mnemonic::Jcc(cond) => {
            let target = original_target(instr);
            let len = 6u64;
            let rel = target.wrapping_sub(instr_addr.wrapping_add(len)) as i32;
            let mut bytes = vec![0x0F, 0x80 | cond.bits()];
            bytes.extend_from_slice(&rel.to_le_bytes());
            bytes
        }
        Mnemonic::Jmp if matches!(instr.src1, Some(Operand::Immediate { .. })) => {
            let target = original_target(instr);
            let len = 5u64;
            let rel = target.wrapping_sub(instr_addr.wrapping_add(len)) as i32;
            let mut bytes = vec![0xE9];
            bytes.extend_from_slice(&rel.to_le_bytes());
            bytes
        }
        Mnemonic::Call if matches!(instr.src1, Some(Operand::Immediate { .. })) => {
            let target = original_target(instr);
            let len = 5u64;
            let rel = target.wrapping_sub(instr_addr.wrapping_add(len)) as i32;
            let mut bytes = vec![0xE8];
            bytes.extend_from_slice(&rel.to_le_bytes());
            bytes
        }
        Mnemonic::Jmp | Mnemonic::Call => {
            // Indirect form: FF /4 (JMP) or FF /2 (CALL).
            let rm = instr.src1.as_ref().expect("indirect branch carries its target operand");
            let reg_field = if instr.mnemonic == Mnemonic::Jmp { 4 } else { 2 };
            emit_modrm_instr(instr, instr_addr, &legacy_prefix_bytes(instr), (reg_field, false), rm, None)
        }
        _ => match instr.encoding {
            OperandEncodingKind::Mr => {
                let prefixes = legacy_prefix_bytes(instr);
                let rm = instr.dst.as_ref().expect("Mr-encoded instruction has a dst r/m operand");
                let reg_field = match &instr.src1 {
                    Some(Operand::Register { reg, .. }) => (reg.low3(), reg.is_extended()),
                    _ => (unary_group_selector(instr.mnemonic), false),
                };
                emit_modrm_instr(instr, instr_addr, &prefixes, reg_field, rm, None)
            }
            OperandEncodingKind::Rm => {
                let prefixes = legacy_prefix_bytes(instr);
                let dst = instr.dst.as_ref().and_then(Operand::as_register).expect("Rm-encoded instruction writes a register");
                let rm = instr.src1.as_ref().expect("Rm-encoded instruction reads an r/m operand");
                emit_modrm_instr(instr, instr_addr, &prefixes, (dst.low3(), dst.is_extended()), rm, None)
            }
            OperandEncodingKind::Rmi => {
                let prefixes = legacy_prefix_bytes(instr);
                let rm = instr.dst.as_ref().expect("Rmi-encoded instruction has a dst r/m operand");
                let reg_field = (rmi_group_selector(instr.mnemonic), false);
                let opcode_byte = instr.raw_opcode.as_slice()[0];
                let imm = match instr.src1 {
                    Some(Operand::Immediate { value, width }) if opcode_byte != 0xD0 && opcode_byte != 0xD1 => {
                        Some((value, immediate_byte_len(opcode_byte, width)))
                    }
                    _ => None,
                };
                emit_modrm_instr(instr, instr_addr, &prefixes, reg_field, rm, imm)
            }
            OperandEncodingKind::None => emit_none_encoded(instr),
        },
    }
}

/// Assembles one ModR/M(+SIB+disp[+imm]) instruction: legacy prefixes,
/// REX, the captured opcode bytes, the addressing form, and an optional
/// trailing immediate.
fn emit_modrm_instr(
    instr: &Instr,
    instr_addr: u64,
    prefixes: &[u8],
    reg_field: (u8, bool),
    rm: &Operand,
    imm: Option<(u64, usize)>,
) -> Vec<u8> {
    let parts = rm_parts(rm);
    let width = rm.width();
    let opcode = instr.raw_opcode.as_slice();
    let rex = rex_byte(width == ValueType::W64, reg_field.1, parts.rex_x, parts.rex_b);

    let mut len = prefixes.len() + rex.is_some() as usize + opcode.len() + 1;
    len += parts.sib.is_some() as usize;
    len += parts.disp_len as usize;
    let imm_len = imm.map(|(_, n)| n).unwrap_or(0);
    len += imm_len;

    let mut bytes = Vec::with_capacity(len);
    bytes.extend_from_slice(prefixes);
    if let Some(r) = rex {
        bytes.push(r);
    }
    bytes.extend_from_slice(opcode);
    let modrm = (parts.mod_bits << 6) | ((reg_field.0 & 7) << 3) | parts.rm_bits;
    bytes.push(modrm);
    if let Some(sib) = parts.sib {
        bytes.push(sib);
    }
    match parts.disp_len {
        0 => {}
        1 => bytes.push(parts.disp as i8 as u8),
        4 if parts.is_rip => {
            let next_addr = instr_addr + len as u64;
            let original_next = instr.address.wrapping_add(instr.length as u64);
            let original_target = original_next.wrapping_add(parts.disp as u64);
            let new_disp = original_target.wrapping_sub(next_addr) as i32;
            bytes.extend_from_slice(&new_disp.to_le_bytes());
        }
        4 => bytes.extend_from_slice(&(parts.disp as i32).to_le_bytes()),
        _ => unreachable!("displacement is either 0, 1, or 4 bytes"),
    }
    if let Some((value, n)) = imm {
        push_imm(&mut bytes, n, value);
    }
    bytes
}

/// Opcode-embedded-register and accumulator-immediate forms that carry
/// no ModR/M at all: `MOV r, imm` (`B8+rd`) and the `op AL/eAX, imm`
/// accumulator shorthands.
fn emit_none_encoded(instr: &Instr) -> Vec<u8> {
    let dst_reg = instr.dst.as_ref().and_then(Operand::as_register);
    if instr.mnemonic == Mnemonic::Mov && matches!(instr.src1, Some(Operand::Immediate { .. })) {
        let reg = dst_reg.expect("MOV r, imm has a register destination");
        let width = instr.dst.as_ref().unwrap().width();
        let Some(Operand::Immediate { value, .. }) = instr.src1 else { unreachable!() };
        let opcode_byte = if instr.raw_opcode.len == 0 {
            0xB8 | reg.low3()
        } else {
            instr.raw_opcode.as_slice()[0]
        };
        let mut bytes = Vec::with_capacity(10);
        if instr.raw_opcode.len == 0 {
            // Materialized preparatory MOV: always a fresh 64-bit immediate load.
            if let Some(rex) = rex_byte(true, false, false, reg.is_extended()) {
                bytes.push(rex);
            }
            bytes.push(opcode_byte);
            push_imm(&mut bytes, 8, value);
        } else {
            if let Some(rex) = rex_byte(width == ValueType::W64, false, false, reg.is_extended()) {
                bytes.push(rex);
            }
            bytes.push(opcode_byte);
            let len = match width {
                ValueType::W8 => 1,
                ValueType::W16 => 2,
                _ => 4,
            };
            push_imm(&mut bytes, len, value);
        }
        return bytes;
    }

    // Arithmetic accumulator forms: `op AL, imm8` / `op eAX/rAX, imm32`.
    let Some(Operand::Immediate { value, width }) = instr.src1 else {
        panic!("unsupported None-encoded instruction {:?}", instr.mnemonic);
    };
    let mut bytes = Vec::with_capacity(6);
    if let Some(rex) = rex_byte(width == ValueType::W64, false, false, false) {
        bytes.push(rex);
    }
    bytes.extend_from_slice(instr.raw_opcode.as_slice());
    let len = match width {
        ValueType::W8 => 1,
        ValueType::W16 => 2,
        _ => 4,
    };
    push_imm(&mut bytes, len, value);
    bytes
}

/// Lays out and emits the optimized trace into `storage`, returning the
/// specialized function's absolute entry address.
pub fn generate(trace: &InstrList, storage: &mut CodeStorage) -> Result<u64> {
    let lengths: Vec<usize> = trace.iter().map(|instr| encode_one(instr, 0).len()).collect();
    let total: usize = lengths.iter().sum();

    let start_offset = storage.reserve(total)?;
    let base_addr = storage.base_addr();

    let mut out = Vec::with_capacity(total);
    let mut addr = base_addr + start_offset as u64;
    for instr in trace.iter() {
        let bytes = encode_one(instr, addr);
        addr += bytes.len() as u64;
        out.extend_from_slice(&bytes);
    }
    debug_assert_eq!(out.len(), total, "layout and emit passes disagree on length");

    storage.reserved_slice_mut()[..out.len()].copy_from_slice(&out);
    storage.commit(out.len())?;
    storage.finalize_executable()?;
    Ok(base_addr + start_offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Condition, OperandForm};
    use crate::register::{RAX, RBX, RCX, RDI, RSP};

    fn base(mnemonic: Mnemonic, form: OperandForm) -> Instr {
        let mut i = Instr::invalid(0x4000);
        i.mnemonic = mnemonic;
        i.form = form;
        i
    }

    #[test]
    fn ret_is_a_single_byte() {
        let i = base(Mnemonic::Ret, OperandForm::Zero);
        assert_eq!(encode_one(&i, 0x1000), vec![0xC3]);
    }

    #[test]
    fn hint_pseudo_ops_emit_nothing() {
        let call = base(Mnemonic::HintCall, OperandForm::Zero);
        let ret = base(Mnemonic::HintRet, OperandForm::Zero);
        assert!(encode_one(&call, 0x1000).is_empty());
        assert!(encode_one(&ret, 0x1000).is_empty());
    }

    #[test]
    fn push_pop_replay_embedded_register_opcode() {
        let mut push = base(Mnemonic::Push, OperandForm::Unary);
        push.src1 = Some(Operand::reg(ValueType::W64, Register::gpr(RDI)));
        push.raw_opcode = crate::instruction::RawOpcode::new(&[0x57]);
        assert_eq!(encode_one(&push, 0x1000), vec![0x57]);

        let mut pop_r9 = base(Mnemonic::Pop, OperandForm::Unary);
        pop_r9.dst = Some(Operand::reg(ValueType::W64, Register::gpr(9)));
        pop_r9.raw_opcode = crate::instruction::RawOpcode::new(&[0x59]);
        let bytes = encode_one(&pop_r9, 0x1000);
        assert_eq!(bytes, vec![0x41, 0x59]);
    }

    #[test]
    fn jcc_always_emits_long_form_and_preserves_original_target() {
        // A rel8 Jcc captured at 0x1000 (length 2) targeting 0x1010.
        let mut jcc = base(Mnemonic::Jcc(Condition::E), OperandForm::Unary);
        jcc.address = 0x1000;
        jcc.length = 2;
        jcc.src1 = Some(Operand::imm(ValueType::W8, 0x0C));
        let bytes = encode_one(&jcc, 0x9000);
        assert_eq!(&bytes[..2], &[0x0F, 0x84]);
        assert_eq!(bytes.len(), 6);
        let rel = i32::from_le_bytes(bytes[2..6].try_into().unwrap());
        let new_target = 0x9000i64 + 6 + rel as i64;
        assert_eq!(new_target, 0x1010);
    }

    #[test]
    fn jmp_direct_recomputes_relative_displacement_at_new_address() {
        let mut jmp = base(Mnemonic::Jmp, OperandForm::Unary);
        jmp.length = 5;
        jmp.src1 = Some(Operand::imm(ValueType::W32, 0x20));
        let bytes = encode_one(&jmp, 0x2000);
        assert_eq!(bytes[0], 0xE9);
        let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let new_target = 0x2000i64 + 5 + rel as i64;
        assert_eq!(new_target as u64, original_target(&jmp));
    }

    #[test]
    fn mov_reg_reg_encodes_rex_and_modrm() {
        // mov rax, rbx, captured as MR: dst=rax (rm), src1=rbx (reg).
        let mut mov = base(Mnemonic::Mov, OperandForm::Binary);
        mov.dst = Some(Operand::reg(ValueType::W64, Register::gpr(RAX)));
        mov.src1 = Some(Operand::reg(ValueType::W64, Register::gpr(RBX)));
        mov.raw_opcode = crate::instruction::RawOpcode::new(&[0x89]);
        mov.encoding = OperandEncodingKind::Mr;
        let bytes = encode_one(&mov, 0x1000);
        assert_eq!(bytes, vec![0x48, 0x89, 0xD8]);
    }

    #[test]
    fn mov_from_memory_disp8() {
        // mov rax, [rdi+0x10]
        let mut mov = base(Mnemonic::Mov, OperandForm::Binary);
        mov.dst = Some(Operand::reg(ValueType::W64, Register::gpr(RAX)));
        mov.src1 = Some(Operand::indirect(
            ValueType::W64,
            Register::gpr(RDI),
            Register::None,
            0,
            0x10,
            Segment::None,
        ));
        mov.raw_opcode = crate::instruction::RawOpcode::new(&[0x8B]);
        mov.encoding = OperandEncodingKind::Rm;
        let bytes = encode_one(&mov, 0x1000);
        assert_eq!(bytes, vec![0x48, 0x8B, 0x47, 0x10]);
    }

    #[test]
    fn lea_sib_no_base_roundtrips_through_encoder() {
        let mut lea = base(Mnemonic::Lea, OperandForm::Binary);
        lea.dst = Some(Operand::reg(ValueType::W64, Register::gpr(RAX)));
        lea.src1 = Some(Operand::indirect(
            ValueType::W64,
            Register::None,
            Register::gpr(RCX),
            8,
            0,
            Segment::None,
        ));
        lea.raw_opcode = crate::instruction::RawOpcode::new(&[0x8D]);
        lea.encoding = OperandEncodingKind::Rm;
        let bytes = encode_one(&lea, 0x1000);
        assert_eq!(bytes[..3], [0x48, 0x8D, 0x04]);
        assert_eq!(bytes[3], (3 << 6) | (1 << 3) | 5); // scale=8 => 11, index=rcx, base=none
    }

    #[test]
    fn mov_rbp_zero_disp_forces_disp8() {
        // mov rax, [rbp] must encode as disp8 0, never mod=00 (that means RIP-relative).
        let mut mov = base(Mnemonic::Mov, OperandForm::Binary);
        mov.dst = Some(Operand::reg(ValueType::W64, Register::gpr(RAX)));
        mov.src1 = Some(Operand::indirect(
            ValueType::W64,
            Register::gpr(5), // rbp
            Register::None,
            0,
            0,
            Segment::None,
        ));
        mov.raw_opcode = crate::instruction::RawOpcode::new(&[0x8B]);
        mov.encoding = OperandEncodingKind::Rm;
        let bytes = encode_one(&mov, 0x1000);
        assert_eq!(bytes, vec![0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn add_reg_imm8_group1_sign_extended() {
        let mut add = base(Mnemonic::Add, OperandForm::Binary);
        add.dst = Some(Operand::reg(ValueType::W64, Register::gpr(RBX)));
        add.src1 = Some(Operand::imm(ValueType::W64, (-1i64) as u64));
        add.raw_opcode = crate::instruction::RawOpcode::new(&[0x83]);
        add.encoding = OperandEncodingKind::Rmi;
        let bytes = encode_one(&add, 0x1000);
        assert_eq!(bytes, vec![0x48, 0x83, 0xC3, 0xFF]);
    }

    #[test]
    fn materialized_mov_uses_fresh_imm64_opcode() {
        let mut mov = base(Mnemonic::Mov, OperandForm::Binary);
        mov.dst = Some(Operand::reg(ValueType::W64, Register::gpr(RCX)));
        mov.src1 = Some(Operand::imm(ValueType::W64, 0xDEAD_BEEF));
        // raw_opcode left at default (len 0): this is the materialize_dst shape.
        let bytes = encode_one(&mov, 0x1000);
        assert_eq!(bytes[0], 0x48);
        assert_eq!(bytes[1], 0xB9);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn generate_writes_and_finalizes_identity_trace() {
        let mut ret = base(Mnemonic::Ret, OperandForm::Zero);
        ret.address = 0x5000;
        let trace: InstrList = vec![ret].into_iter().collect();
        let mut storage = CodeStorage::allocate(64).unwrap();
        let entry = generate(&trace, &mut storage).unwrap();
        let f: extern "C" fn() = unsafe { std::mem::transmute(entry as *const ()) };
        f();
    }

    #[test]
    fn rsp_based_operand_never_needs_sib_escape_confusion() {
        // mov [rsp+8], rax must use SIB (rm low3 == 4 always means SIB).
        let mut mov = base(Mnemonic::Mov, OperandForm::Binary);
        mov.dst = Some(Operand::indirect(
            ValueType::W64,
            Register::gpr(RSP),
            Register::None,
            0,
            8,
            Segment::None,
        ));
        mov.src1 = Some(Operand::reg(ValueType::W64, Register::gpr(RAX)));
        mov.raw_opcode = crate::instruction::RawOpcode::new(&[0x89]);
        mov.encoding = OperandEncodingKind::Mr;
        let bytes = encode_one(&mov, 0x1000);
        // REX.W, opcode, modrm(mod=01,reg=rax,rm=100), sib(scale=0,index=100,base=100), disp8
        assert_eq!(bytes, vec![0x48, 0x89, 0x44, 0x24, 0x08]);
    }
}
