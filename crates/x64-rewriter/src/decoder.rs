// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The byte-accurate x86-64 decoder: prefix scanning, opcode dispatch,
//! and ModR/M+SIB addressing-mode parsing.
//!
//! The decoder never fails outright. An opcode it does not recognize
//! becomes a single-byte `Invalid` instruction and the cursor advances
//! by one (unless `stop_at_ret` has already seen a `RET`), so the rest
//! of the pipeline can still pass the bytes through untouched.

use crate::instruction::{
    Condition, Instr, InstrList, Mnemonic, OperandEncodingKind, OperandForm, PrefixSet, RawOpcode,
    RexBits,
};
use crate::operand::{Operand, Segment, ValueType};
use crate::register::Register;

/// Default instruction-list capacity; functions longer than this are
/// vanishingly rare for the straight-line bodies this pipeline targets.
const DEFAULT_CAPACITY: usize = 256;

struct Cursor<'a> {
    code: &'a [u8],
    base_addr: u64,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte_at(&self, offset: usize) -> Option<u8> {
        self.code.get(self.pos + offset).copied()
    }

    fn addr(&self) -> u64 {
        self.base_addr + self.pos as u64
    }
}

fn sign_extend_i8(b: u8) -> i64 {
    (b as i8) as i64
}

fn read_i32_le(bytes: &[u8]) -> Option<i32> {
    if bytes.len() < 4 {
        return None;
    }
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u32_le(bytes: &[u8]) -> Option<u32> {
    read_i32_le(bytes).map(|v| v as u32)
}

fn read_u16_le(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u64_le(bytes: &[u8]) -> Option<u64> {
    if bytes.len() < 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    Some(u64::from_le_bytes(buf))
}

/// Operand-size resolution: REX.W selects 64-bit, else 0x66 selects
/// 16-bit, else the mnemonic's default.
fn operand_width(rex_w: bool, has_66: bool, default_is_64: bool) -> ValueType {
    if rex_w {
        ValueType::W64
    } else if has_66 {
        ValueType::W16
    } else if default_is_64 {
        ValueType::W64
    } else {
        ValueType::W32
    }
}

/// Result of decoding one ModR/M(+SIB) addressing form, including the
/// RIP-relative vs. SIB-no-base tie-break (disp32, no base register,
/// `rm == 5` at `mod == 0` means RIP-relative; the same disp32-no-base
/// shape reached via a SIB byte instead means no base register at all).
struct ModRm {
    reg_extended: u8,
    rm_operand: Operand,
    consumed: usize,
}

fn decode_modrm(bytes: &[u8], rex: RexBits, width: ValueType, segment: Segment) -> Option<ModRm> {
    let byte0 = *bytes.first()?;
    let md = (byte0 >> 6) & 3;
    let reg = (byte0 >> 3) & 7;
    let rm = byte0 & 7;
    let reg_extended = reg | if rex.r { 8 } else { 0 };

    if md == 3 {
        let rm_extended = rm | if rex.b { 8 } else { 0 };
        return Some(ModRm {
            reg_extended,
            rm_operand: Operand::reg(width, Register::gpr(rm_extended)),
            consumed: 1,
        });
    }

    let mut scale: u8 = 0;
    let mut index_reg = Register::None;
    let mut base_reg;
    let mut sib_consumed = 0usize;
    let mut base_raw_is_five = false;

    if rm == 4 {
        let sib = *bytes.get(1)?;
        scale = 1u8 << ((sib >> 6) & 3);
        let idx_raw = (sib >> 3) & 7;
        let base_raw = sib & 7;
        if idx_raw != 4 {
            index_reg = Register::gpr(idx_raw | if rex.x { 8 } else { 0 });
        } else {
            scale = 0;
        }
        base_reg = Register::gpr(base_raw | if rex.b { 8 } else { 0 });
        base_raw_is_five = base_raw == 5;
        sib_consumed = 1;
    } else {
        base_reg = Register::gpr(rm | if rex.b { 8 } else { 0 });
    }

    let mut disp: i64 = 0;
    let mut disp_consumed = 0usize;
    let tail = &bytes[1 + sib_consumed..];

    if md == 1 {
        disp = sign_extend_i8(*tail.first()?);
        disp_consumed = 1;
    } else if md == 2 {
        disp = read_i32_le(tail)? as i64;
        disp_consumed = 4;
    } else if md == 0 && (rm == 5 || (rm == 4 && base_raw_is_five)) {
        disp = read_i32_le(tail)? as i64;
        disp_consumed = 4;
        base_reg = if rm == 5 { Register::Ip } else { Register::None };
    }

    Some(ModRm {
        reg_extended,
        rm_operand: Operand::indirect(width, base_reg, index_reg, scale, disp, segment),
        consumed: 1 + sib_consumed + disp_consumed,
    })
}

/// Decodes from `code[0..]`, treating `code[0]` as residing at
/// `base_addr`, for at most `code.len()` bytes, stopping after the
/// first `RET` if `stop_at_ret` is set. Never returns an error: opcodes
/// it cannot classify become single-byte `Invalid` instructions.
pub fn decode(code: &[u8], base_addr: u64, stop_at_ret: bool) -> InstrList {
    let mut list = InstrList::with_capacity(DEFAULT_CAPACITY.min(code.len().max(1)));
    let mut cur = Cursor {
        code,
        base_addr,
        pos: 0,
    };

    while cur.pos < cur.code.len() {
        let instr = decode_one(&cur);
        let is_ret = instr.mnemonic == Mnemonic::Ret;
        let length = (instr.length as usize).max(1);
        list.push(instr);
        cur.pos += length;
        if stop_at_ret && is_ret {
            break;
        }
    }

    list
}

/// Decodes a single instruction starting at `code[offset]`, treating
/// that byte as residing at `base_addr + offset`. Used by the emulator
/// to step through control flow rather than a flat pre-decoded list,
/// since a direct branch or inlined call can jump anywhere in the
/// function's byte range.
pub fn decode_single(code: &[u8], offset: usize, base_addr: u64) -> Instr {
    let cur = Cursor {
        code,
        base_addr,
        pos: offset,
    };
    decode_one(&cur)
}

fn decode_one(cur: &Cursor) -> Instr {
    let addr = cur.addr();

    let mut prefixes = PrefixSet::empty();
    let mut segment = Segment::None;
    let mut rex = RexBits::default();
    let mut off = 0usize;

    loop {
        match cur.byte_at(off) {
            Some(0x66) => {
                prefixes |= PrefixSet::PS_66;
                off += 1;
            }
            Some(0xF2) => {
                prefixes |= PrefixSet::PS_F2;
                off += 1;
            }
            Some(0xF3) => {
                prefixes |= PrefixSet::PS_F3;
                off += 1;
            }
            Some(0x2E) => {
                prefixes |= PrefixSet::PS_SEG;
                off += 1;
            }
            Some(0x64) => {
                segment = Segment::Fs;
                off += 1;
            }
            Some(0x65) => {
                segment = Segment::Gs;
                off += 1;
            }
            Some(b) if (0x40..=0x4F).contains(&b) => {
                rex = RexBits {
                    w: b & 0x8 != 0,
                    r: b & 0x4 != 0,
                    x: b & 0x2 != 0,
                    b: b & 0x1 != 0,
                };
                off += 1;
                break; // REX must immediately precede the opcode.
            }
            _ => break,
        }
    }

    let rest = &cur.code[cur.pos + off..];
    let Some(&opcode) = rest.first() else {
        return invalid_at(addr);
    };

    let body = &rest[1..];
    let has_66 = prefixes.contains(PrefixSet::PS_66);

    let built = if opcode == 0x0F {
        decode_0f(body, rex, has_66, segment)
    } else {
        decode_one_byte(opcode, body, rex, has_66, segment)
    };

    match built {
        Some(b) => finish(addr, off + 1, prefixes, b),
        None => invalid_at(addr),
    }
}

fn invalid_at(addr: u64) -> Instr {
    Instr::invalid(addr)
}

/// Shared bookkeeping for building a finished `Instr` from a decode rule.
struct Built {
    mnemonic: Mnemonic,
    form: OperandForm,
    dst: Option<Operand>,
    src1: Option<Operand>,
    src2: Option<Operand>,
    consumed_after_opcode: usize,
    raw_opcode: RawOpcode,
    encoding: OperandEncodingKind,
}

fn finish(addr: u64, prefix_len: usize, prefixes: PrefixSet, b: Built) -> Instr {
    Instr {
        address: addr,
        length: (prefix_len + b.consumed_after_opcode) as u8,
        mnemonic: b.mnemonic,
        form: b.form,
        dst: b.dst,
        src1: b.src1,
        src2: b.src2,
        prefixes,
        raw_opcode: b.raw_opcode,
        encoding: b.encoding,
        dst_becomes_dynamic: false,
    }
}

/// Arithmetic group selector for the `00-3D` style opcode blocks and the
/// ModR/M.reg-selected immediate groups (`80`/`81`/`83`).
/// `None` for ADC/SBB (group 2/3): `Mnemonic` has no carry-consuming
/// variant, and folding them onto ADD/SUB would silently drop CF.
fn arith_mnemonic(group: u8) -> Option<Mnemonic> {
    match group & 7 {
        0 => Some(Mnemonic::Add),
        1 => Some(Mnemonic::Or),
        2 => None,
        3 => None,
        4 => Some(Mnemonic::And),
        5 => Some(Mnemonic::Sub),
        6 => Some(Mnemonic::Xor),
        _ => Some(Mnemonic::Cmp),
    }
}

fn decode_one_byte(
    opcode: u8,
    body: &[u8],
    rex: RexBits,
    has_66: bool,
    segment: Segment,
) -> Option<Built> {
    let w = operand_width(rex.w, has_66, false);

    // PUSH r64 (0x50+rd) / POP r64 (0x58+rd): default size is always 64 bits.
    if (0x50..=0x57).contains(&opcode) {
        let r = (opcode - 0x50) | if rex.b { 8 } else { 0 };
        return Some(Built {
            mnemonic: Mnemonic::Push,
            form: OperandForm::Unary,
            dst: None,
            src1: Some(Operand::reg(ValueType::W64, Register::gpr(r))),
            src2: None,
            consumed_after_opcode: 0,
            raw_opcode: RawOpcode::new(&[opcode]),
            encoding: OperandEncodingKind::None,
        });
    }
    if (0x58..=0x5F).contains(&opcode) {
        let r = (opcode - 0x58) | if rex.b { 8 } else { 0 };
        return Some(Built {
            mnemonic: Mnemonic::Pop,
            form: OperandForm::Unary,
            dst: Some(Operand::reg(ValueType::W64, Register::gpr(r))),
            src1: None,
            src2: None,
            consumed_after_opcode: 0,
            raw_opcode: RawOpcode::new(&[opcode]),
            encoding: OperandEncodingKind::None,
        });
    }

    // Arithmetic group, register/memory forms: 00-3D in blocks of 6,
    // following the standard `op r/m8,r8` (0), `op r/m32,r32` (1),
    // `op r8,r/m8` (2), `op r32,r/m32` (3), `op AL,imm8` (4),
    // `op eAX,imm32` (5) sub-pattern, repeated per group at +0x08 per op.
    if opcode < 0x40 && (opcode & 0x7) <= 5 {
        let group = opcode >> 3;
        let sub = opcode & 0x7;
        let mnemonic = arith_mnemonic(group)?;
        return match sub {
            0 | 1 | 2 | 3 => {
                let width = if sub == 0 || sub == 2 { ValueType::W8 } else { w };
                let m = decode_modrm(body, rex, width, segment)?;
                let reg_op = Operand::reg(width, Register::gpr(m.reg_extended));
                let (dst, src1, encoding) = if sub == 0 || sub == 1 {
                    (m.rm_operand, reg_op, OperandEncodingKind::Mr)
                } else {
                    (reg_op, m.rm_operand, OperandEncodingKind::Rm)
                };
                Some(Built {
                    mnemonic,
                    form: OperandForm::Binary,
                    dst: Some(dst),
                    src1: Some(src1),
                    src2: None,
                    consumed_after_opcode: m.consumed,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding,
                })
            }
            4 => {
                let imm = *body.first()?;
                Some(Built {
                    mnemonic,
                    form: OperandForm::Binary,
                    dst: Some(Operand::reg(ValueType::W8, Register::gpr(0))),
                    src1: Some(Operand::imm(ValueType::W8, imm as u64)),
                    src2: None,
                    consumed_after_opcode: 1,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::None,
                })
            }
            5 => {
                let (imm, n) = read_imm_for_width(body, w)?;
                Some(Built {
                    mnemonic,
                    form: OperandForm::Binary,
                    dst: Some(Operand::reg(w, Register::gpr(0))),
                    src1: Some(Operand::imm(w, imm)),
                    src2: None,
                    consumed_after_opcode: n,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::None,
                })
            }
            _ => None,
        };
    }

    match opcode {
        0x90 => Some(Built {
            mnemonic: Mnemonic::Nop,
            form: OperandForm::Zero,
            dst: None,
            src1: None,
            src2: None,
            consumed_after_opcode: 0,
            raw_opcode: RawOpcode::new(&[opcode]),
            encoding: OperandEncodingKind::None,
        }),
        0xC3 => Some(Built {
            mnemonic: Mnemonic::Ret,
            form: OperandForm::Zero,
            dst: None,
            src1: None,
            src2: None,
            consumed_after_opcode: 0,
            raw_opcode: RawOpcode::new(&[opcode]),
            encoding: OperandEncodingKind::None,
        }),
        // MOV r/m, r (0x89) / MOV r, r/m (0x8B), byte forms 0x88/0x8A.
        0x88 | 0x8A => {
            let width = ValueType::W8;
            let m = decode_modrm(body, rex, width, segment)?;
            let reg_op = Operand::reg(width, Register::gpr(m.reg_extended));
            let (dst, src1, encoding) = if opcode == 0x88 {
                (m.rm_operand, reg_op, OperandEncodingKind::Mr)
            } else {
                (reg_op, m.rm_operand, OperandEncodingKind::Rm)
            };
            Some(Built {
                mnemonic: Mnemonic::Mov,
                form: OperandForm::Binary,
                dst: Some(dst),
                src1: Some(src1),
                src2: None,
                consumed_after_opcode: m.consumed,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding,
            })
        }
        0x89 | 0x8B => {
            let m = decode_modrm(body, rex, w, segment)?;
            let reg_op = Operand::reg(w, Register::gpr(m.reg_extended));
            let (dst, src1, encoding) = if opcode == 0x89 {
                (m.rm_operand, reg_op, OperandEncodingKind::Mr)
            } else {
                (reg_op, m.rm_operand, OperandEncodingKind::Rm)
            };
            Some(Built {
                mnemonic: Mnemonic::Mov,
                form: OperandForm::Binary,
                dst: Some(dst),
                src1: Some(src1),
                src2: None,
                consumed_after_opcode: m.consumed,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding,
            })
        }
        // LEA r, m (0x8D): rm operand must be Indirect; value is the address, not a load.
        0x8D => {
            let m = decode_modrm(body, rex, w, segment)?;
            Some(Built {
                mnemonic: Mnemonic::Lea,
                form: OperandForm::Binary,
                dst: Some(Operand::reg(w, Register::gpr(m.reg_extended))),
                src1: Some(m.rm_operand),
                src2: None,
                consumed_after_opcode: m.consumed,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::Rm,
            })
        }
        // MOV r/m, imm32 (0xC7 /0) and MOV r/m8, imm8 (0xC6 /0).
        0xC6 | 0xC7 => {
            let width = if opcode == 0xC6 { ValueType::W8 } else { w };
            let m = decode_modrm(body, rex, width, segment)?;
            let imm_bytes = &body[m.consumed..];
            let (imm, n) = read_imm_for_width(imm_bytes, if opcode == 0xC6 { ValueType::W8 } else { ValueType::W32 })?;
            Some(Built {
                mnemonic: Mnemonic::Mov,
                form: OperandForm::Binary,
                dst: Some(m.rm_operand),
                src1: Some(Operand::imm(width, imm)),
                src2: None,
                consumed_after_opcode: m.consumed + n,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::Rmi,
            })
        }
        // MOV r, imm (B8+rd): imm64 only with REX.W, else imm32 zero-extended.
        _ if (0xB8..=0xBF).contains(&opcode) => {
            let r = (opcode - 0xB8) | if rex.b { 8 } else { 0 };
            if rex.w {
                let imm = read_u64_le(body)?;
                Some(Built {
                    mnemonic: Mnemonic::Mov,
                    form: OperandForm::Binary,
                    dst: Some(Operand::reg(ValueType::W64, Register::gpr(r))),
                    src1: Some(Operand::imm(ValueType::W64, imm)),
                    src2: None,
                    consumed_after_opcode: 8,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::None,
                })
            } else {
                let width = if has_66 { ValueType::W16 } else { ValueType::W32 };
                let (imm, n) = read_imm_for_width(body, width)?;
                Some(Built {
                    mnemonic: Mnemonic::Mov,
                    form: OperandForm::Binary,
                    dst: Some(Operand::reg(width, Register::gpr(r))),
                    src1: Some(Operand::imm(width, imm)),
                    src2: None,
                    consumed_after_opcode: n,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::None,
                })
            }
        }
        // Group1 imm arithmetic: 0x80 (r/m8, imm8), 0x81 (r/m, imm32), 0x83 (r/m, imm8 sign-extended).
        0x80 | 0x81 | 0x83 => {
            let width = if opcode == 0x80 { ValueType::W8 } else { w };
            let m = decode_modrm(body, rex, width, segment)?;
            let mnemonic = arith_mnemonic(m.reg_extended & 7)?;
            let imm_bytes = &body[m.consumed..];
            let (imm, n) = if opcode == 0x81 {
                read_imm_for_width(imm_bytes, width)?
            } else {
                let b = *imm_bytes.first()?;
                let v = sign_extend_i8(b) as u64;
                (v & width.mask64().max(0xFF), 1)
            };
            Some(Built {
                mnemonic,
                form: OperandForm::Binary,
                dst: Some(m.rm_operand),
                src1: Some(Operand::imm(width, imm)),
                src2: None,
                consumed_after_opcode: m.consumed + n,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::Rmi,
            })
        }
        // TEST r/m, r (0x84 byte, 0x85 full width).
        0x84 | 0x85 => {
            let width = if opcode == 0x84 { ValueType::W8 } else { w };
            let m = decode_modrm(body, rex, width, segment)?;
            Some(Built {
                mnemonic: Mnemonic::Test,
                form: OperandForm::Binary,
                dst: Some(m.rm_operand),
                src1: Some(Operand::reg(width, Register::gpr(m.reg_extended))),
                src2: None,
                consumed_after_opcode: m.consumed,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::Mr,
            })
        }
        // Group3: TEST r/m,imm (/0,/1), NOT (/2), NEG (/3) — 0xF6 byte, 0xF7 full width.
        0xF6 | 0xF7 => {
            let width = if opcode == 0xF6 { ValueType::W8 } else { w };
            let m = decode_modrm(body, rex, width, segment)?;
            let sel = m.reg_extended & 7;
            match sel {
                0 | 1 => {
                    let imm_bytes = &body[m.consumed..];
                    let imm_width = if opcode == 0xF6 { ValueType::W8 } else { width };
                    let (imm, n) = read_imm_for_width(imm_bytes, imm_width)?;
                    Some(Built {
                        mnemonic: Mnemonic::Test,
                        form: OperandForm::Binary,
                        dst: Some(m.rm_operand),
                        src1: Some(Operand::imm(imm_width, imm)),
                        src2: None,
                        consumed_after_opcode: m.consumed + n,
                        raw_opcode: RawOpcode::new(&[opcode]),
                        encoding: OperandEncodingKind::Rmi,
                    })
                }
                2 | 3 => Some(Built {
                    mnemonic: if sel == 2 { Mnemonic::Not } else { Mnemonic::Neg },
                    form: OperandForm::Unary,
                    dst: Some(m.rm_operand),
                    src1: None,
                    src2: None,
                    consumed_after_opcode: m.consumed,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::Mr,
                }),
                _ => None,
            }
        }
        // Group4/5 INC/DEC: 0xFE byte (/0 /1 only), 0xFF full width (/0 /1 INC/DEC, /2 CALL ind, /4 JMP ind).
        0xFE | 0xFF => {
            let width = if opcode == 0xFE { ValueType::W8 } else { w };
            let m = decode_modrm(body, rex, width, segment)?;
            let sel = m.reg_extended & 7;
            match sel {
                0 => Some(Built {
                    mnemonic: Mnemonic::Inc,
                    form: OperandForm::Unary,
                    dst: Some(m.rm_operand),
                    src1: None,
                    src2: None,
                    consumed_after_opcode: m.consumed,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::Mr,
                }),
                1 => Some(Built {
                    mnemonic: Mnemonic::Dec,
                    form: OperandForm::Unary,
                    dst: Some(m.rm_operand),
                    src1: None,
                    src2: None,
                    consumed_after_opcode: m.consumed,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::Mr,
                }),
                2 if opcode == 0xFF => Some(Built {
                    mnemonic: Mnemonic::Call,
                    form: OperandForm::Unary,
                    dst: None,
                    src1: Some(m.rm_operand),
                    src2: None,
                    consumed_after_opcode: m.consumed,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::None,
                }),
                4 if opcode == 0xFF => Some(Built {
                    mnemonic: Mnemonic::Jmp,
                    form: OperandForm::Unary,
                    dst: None,
                    src1: Some(m.rm_operand),
                    src2: None,
                    consumed_after_opcode: m.consumed,
                    raw_opcode: RawOpcode::new(&[opcode]),
                    encoding: OperandEncodingKind::None,
                }),
                _ => None,
            }
        }
        // Shift group2: C0/D0/D2 byte width, C1/D1/D3 full width.
        0xC0 | 0xC1 | 0xD0 | 0xD1 | 0xD2 | 0xD3 => {
            let width = if matches!(opcode, 0xC0 | 0xD0 | 0xD2) { ValueType::W8 } else { w };
            let m = decode_modrm(body, rex, width, segment)?;
            let mnemonic = match m.reg_extended & 7 {
                4 => Mnemonic::Shl,
                5 => Mnemonic::Shr,
                7 => Mnemonic::Sar,
                _ => return None,
            };
            let (src, n) = match opcode {
                0xC0 | 0xC1 => {
                    let b = *body.get(m.consumed)?;
                    (Some(Operand::imm(ValueType::W8, b as u64)), 1)
                }
                0xD0 | 0xD1 => (Some(Operand::imm(ValueType::W8, 1)), 0),
                _ => (Some(Operand::reg(ValueType::W8, Register::gpr(1))), 0), // CL
            };
            Some(Built {
                mnemonic,
                form: OperandForm::Binary,
                dst: Some(m.rm_operand),
                src1: src,
                src2: None,
                consumed_after_opcode: m.consumed + n,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::Rmi,
            })
        }
        // CALL rel32 / JMP rel32 / JMP rel8.
        0xE8 | 0xE9 => {
            let rel = read_i32_le(body)?;
            Some(Built {
                mnemonic: if opcode == 0xE8 { Mnemonic::Call } else { Mnemonic::Jmp },
                form: OperandForm::Unary,
                dst: None,
                src1: Some(Operand::imm(ValueType::W32, rel as u32 as u64)),
                src2: None,
                consumed_after_opcode: 4,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::None,
            })
        }
        0xEB => {
            let rel = sign_extend_i8(*body.first()?);
            Some(Built {
                mnemonic: Mnemonic::Jmp,
                form: OperandForm::Unary,
                dst: None,
                src1: Some(Operand::imm(ValueType::W8, rel as u64)),
                src2: None,
                consumed_after_opcode: 1,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::None,
            })
        }
        // Jcc rel8: 0x70..0x7F.
        _ if (0x70..=0x7F).contains(&opcode) => {
            let rel = sign_extend_i8(*body.first()?);
            Some(Built {
                mnemonic: Mnemonic::Jcc(Condition::from_bits(opcode - 0x70)),
                form: OperandForm::Unary,
                dst: None,
                src1: Some(Operand::imm(ValueType::W8, rel as u64)),
                src2: None,
                consumed_after_opcode: 1,
                raw_opcode: RawOpcode::new(&[opcode]),
                encoding: OperandEncodingKind::None,
            })
        }
        _ => None,
    }
}

fn decode_0f(body: &[u8], rex: RexBits, has_66: bool, segment: Segment) -> Option<Built> {
    let opcode = *body.first()?;
    let rest = &body[1..];
    let w = operand_width(rex.w, has_66, false);

    match opcode {
        // Jcc rel32: 0F 80..8F.
        0x80..=0x8F => {
            let rel = read_i32_le(rest)?;
            Some(Built {
                mnemonic: Mnemonic::Jcc(Condition::from_bits(opcode - 0x80)),
                form: OperandForm::Unary,
                dst: None,
                src1: Some(Operand::imm(ValueType::W32, rel as u32 as u64)),
                src2: None,
                consumed_after_opcode: 5,
                raw_opcode: RawOpcode::new(&[0x0F, opcode]),
                encoding: OperandEncodingKind::None,
            })
        }
        // CMOVcc r, r/m: 0F 40..4F.
        0x40..=0x4F => {
            let m = decode_modrm(rest, rex, w, segment)?;
            Some(Built {
                mnemonic: Mnemonic::CMov(Condition::from_bits(opcode - 0x40)),
                form: OperandForm::Binary,
                dst: Some(Operand::reg(w, Register::gpr(m.reg_extended))),
                src1: Some(m.rm_operand),
                src2: None,
                consumed_after_opcode: 1 + m.consumed,
                raw_opcode: RawOpcode::new(&[0x0F, opcode]),
                encoding: OperandEncodingKind::Rm,
            })
        }
        // SETcc r/m8: 0F 90..9F.
        0x90..=0x9F => {
            let m = decode_modrm(rest, rex, ValueType::W8, segment)?;
            Some(Built {
                mnemonic: Mnemonic::Set(Condition::from_bits(opcode - 0x90)),
                form: OperandForm::Unary,
                dst: Some(m.rm_operand),
                src1: None,
                src2: None,
                consumed_after_opcode: 1 + m.consumed,
                raw_opcode: RawOpcode::new(&[0x0F, opcode]),
                encoding: OperandEncodingKind::Mr,
            })
        }
        // MOVZX r, r/m8|16: 0F B6/B7.
        0xB6 | 0xB7 => {
            let src_width = if opcode == 0xB6 { ValueType::W8 } else { ValueType::W16 };
            let m = decode_modrm(rest, rex, src_width, segment)?;
            Some(Built {
                mnemonic: Mnemonic::MovZx,
                form: OperandForm::Binary,
                dst: Some(Operand::reg(w, Register::gpr(m.reg_extended))),
                src1: Some(m.rm_operand),
                src2: None,
                consumed_after_opcode: 1 + m.consumed,
                raw_opcode: RawOpcode::new(&[0x0F, opcode]),
                encoding: OperandEncodingKind::Rm,
            })
        }
        // MOVSX r, r/m8|16: 0F BE/BF.
        0xBE | 0xBF => {
            let src_width = if opcode == 0xBE { ValueType::W8 } else { ValueType::W16 };
            let m = decode_modrm(rest, rex, src_width, segment)?;
            Some(Built {
                mnemonic: Mnemonic::MovSx,
                form: OperandForm::Binary,
                dst: Some(Operand::reg(w, Register::gpr(m.reg_extended))),
                src1: Some(m.rm_operand),
                src2: None,
                consumed_after_opcode: 1 + m.consumed,
                raw_opcode: RawOpcode::new(&[0x0F, opcode]),
                encoding: OperandEncodingKind::Rm,
            })
        }
        // NOP r/m (multi-byte NOP): 0F 1F.
        0x1F => {
            let m = decode_modrm(rest, rex, w, segment)?;
            Some(Built {
                mnemonic: Mnemonic::Nop,
                form: OperandForm::Zero,
                dst: None,
                src1: None,
                src2: None,
                consumed_after_opcode: 1 + m.consumed,
                raw_opcode: RawOpcode::new(&[0x0F, opcode]),
                encoding: OperandEncodingKind::None,
            })
        }
        // A representative slice of SSE2 moves, captured as opaque
        // pass-through: the emulator never folds them, only re-emits them
        // verbatim, so a function body that uses xmm registers for a
        // non-specialized argument doesn't abort the whole capture.
        0x10 | 0x11 | 0x28 | 0x29 | 0x6E | 0x7E | 0xD6 => {
            let m = decode_modrm(rest, rex, ValueType::W128, segment)?;
            let reg_op = Operand::reg(ValueType::W128, Register::vector(m.reg_extended));
            let is_store = matches!(opcode, 0x11 | 0x29 | 0x7E | 0xD6);
            let (dst, src1, encoding) = if is_store {
                (m.rm_operand, reg_op, OperandEncodingKind::Mr)
            } else {
                (reg_op, m.rm_operand, OperandEncodingKind::Rm)
            };
            Some(Built {
                mnemonic: Mnemonic::Sse,
                form: OperandForm::Binary,
                dst: Some(dst),
                src1: Some(src1),
                src2: None,
                consumed_after_opcode: 1 + m.consumed,
                raw_opcode: RawOpcode::new(&[0x0F, opcode]),
                encoding,
            })
        }
        _ => None,
    }
}

fn read_imm_for_width(bytes: &[u8], width: ValueType) -> Option<(u64, usize)> {
    match width {
        ValueType::W8 => Some((*bytes.first()? as u64, 1)),
        ValueType::W16 => Some((read_u16_le(bytes)? as u64, 2)),
        ValueType::W32 | ValueType::W64 => Some((read_u32_le(bytes)? as u64, 4)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RAX, RBP, RBX, RCX, RDI, RSI, RSP};

    #[test]
    fn ret_identity() {
        let list = decode(&[0xC3], 0x1000, true);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].mnemonic, Mnemonic::Ret);
        assert_eq!(list[0].length, 1);
    }

    #[test]
    fn prologue_push_mov_pop_ret() {
        let bytes = [0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3];
        let list = decode(&bytes, 0x1000, true);
        let mnemonics: Vec<_> = list.iter().map(|i| i.mnemonic).collect();
        assert_eq!(
            mnemonics,
            vec![Mnemonic::Push, Mnemonic::Mov, Mnemonic::Pop, Mnemonic::Ret]
        );
        assert_eq!(list[1].length, 3);
    }

    #[test]
    fn modrm_disp8_mov() {
        let bytes = [0x48, 0x8B, 0x47, 0x10];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 1);
        let instr = &list[0];
        assert_eq!(instr.mnemonic, Mnemonic::Mov);
        assert_eq!(instr.length, 4);
        assert_eq!(instr.dst, Some(Operand::reg(ValueType::W64, Register::gpr(RAX))));
        assert_eq!(
            instr.src1,
            Some(Operand::indirect(
                ValueType::W64,
                Register::gpr(RDI),
                Register::None,
                0,
                0x10,
                Segment::None
            ))
        );
    }

    #[test]
    fn sib_no_base_mov() {
        let bytes = [0x48, 0x8B, 0x04, 0xCD, 0x00, 0x00, 0x00, 0x00];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 1);
        let instr = &list[0];
        assert_eq!(instr.length, 8);
        assert_eq!(
            instr.src1,
            Some(Operand::indirect(
                ValueType::W64,
                Register::None,
                Register::gpr(RCX),
                8,
                0,
                Segment::None
            ))
        );
    }

    #[test]
    fn static_fold_lea_plus_ret() {
        let bytes = [0x48, 0x8D, 0x04, 0x37, 0xC3];
        let list = decode(&bytes, 0x1000, true);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].mnemonic, Mnemonic::Lea);
        assert_eq!(
            list[0].src1,
            Some(Operand::indirect(
                ValueType::W64,
                Register::gpr(RDI),
                Register::gpr(RSI),
                1,
                0,
                Segment::None
            ))
        );
        assert_eq!(list[1].mnemonic, Mnemonic::Ret);
    }

    #[test]
    fn test_byte_memory() {
        let bytes = [0xF6, 0x00, 0x10];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 1);
        let instr = &list[0];
        assert_eq!(instr.mnemonic, Mnemonic::Test);
        assert_eq!(instr.length, 3);
        assert_eq!(
            instr.dst,
            Some(Operand::indirect(
                ValueType::W8,
                Register::gpr(RAX),
                Register::None,
                0,
                0,
                Segment::None
            ))
        );
        assert_eq!(instr.src1, Some(Operand::imm(ValueType::W8, 0x10)));
    }

    #[test]
    fn unknown_opcode_is_single_byte_invalid_and_does_not_stall_decoding() {
        let bytes = [0x0F, 0xFF, 0xC3]; // 0F FF is unassigned
        let list = decode(&bytes, 0x1000, true);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].mnemonic, Mnemonic::Invalid);
        assert_eq!(list[0].length, 1);
        assert_eq!(list[1].mnemonic, Mnemonic::Ret);
    }

    #[test]
    fn arith_mr_direction_keeps_rm_as_destination() {
        // add eax, esi -- MR form (0x01): ModRM.rm (eax) is the
        // destination, ModRM.reg (esi) is the source.
        let bytes = [0x01, 0xF0];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].mnemonic, Mnemonic::Add);
        assert_eq!(list[0].dst, Some(Operand::reg(ValueType::W32, Register::gpr(RAX))));
        assert_eq!(list[0].src1, Some(Operand::reg(ValueType::W32, Register::gpr(RSI))));
    }

    #[test]
    fn arith_rm_direction_keeps_reg_as_destination() {
        // add esi, eax -- RM form (0x03): ModRM.reg (esi) is the
        // destination, ModRM.rm (eax) is the source. Same bytes as
        // above with the mnemonic's direction bit flipped, so only the
        // dst/src assignment differs.
        let bytes = [0x03, 0xF0];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].mnemonic, Mnemonic::Add);
        assert_eq!(list[0].dst, Some(Operand::reg(ValueType::W32, Register::gpr(RSI))));
        assert_eq!(list[0].src1, Some(Operand::reg(ValueType::W32, Register::gpr(RAX))));
    }

    #[test]
    fn arith_byte_width_mr_forces_w8() {
        // add al, bl -- MR byte form (0x00): both operands must decode
        // at W8 even though no REX.W or 0x66 prefix is present.
        let bytes = [0x00, 0xD8];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].dst, Some(Operand::reg(ValueType::W8, Register::gpr(RAX))));
        assert_eq!(list[0].src1, Some(Operand::reg(ValueType::W8, Register::gpr(RBX))));
    }

    #[test]
    fn adc_sbb_decode_as_invalid_rather_than_silently_aliased() {
        // adc eax, 1 (Group1 /2 immediate form) -- ADC has no
        // carry-consuming representation in the closed `Mnemonic` set,
        // so this must surface as `Invalid`, never as a mis-signed ADD.
        let bytes = [0x83, 0xD0, 0x01];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].mnemonic, Mnemonic::Invalid);
    }

    #[test]
    fn rex_register_extension_is_scoped_to_one_instruction() {
        // mov rbp, r8 ; mov rbp, rsp  (REX.R set only for the first MOV)
        let bytes = [0x4C, 0x89, 0xC5, 0x48, 0x89, 0xE5];
        let list = decode(&bytes, 0x1000, false);
        assert_eq!(list.len(), 2);
        assert_eq!(
            list[0].dst,
            Some(Operand::reg(ValueType::W64, Register::gpr(RBP)))
        );
        assert_eq!(
            list[1].dst,
            Some(Operand::reg(ValueType::W64, Register::gpr(RBP)))
        );
        assert_eq!(
            list[1].src1,
            Some(Operand::reg(ValueType::W64, Register::gpr(RSP)))
        );
    }
}
