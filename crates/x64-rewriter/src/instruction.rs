// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The decoded-instruction model: a closed mnemonic enum, the `Instr`
//! struct that every pipeline stage passes around, and the growable
//! `InstrList` container.

use bitflags::bitflags;

use crate::operand::Operand;

bitflags! {
    /// Legacy prefix bytes recognized during decoding. REX bits are
    /// tracked separately on `Instr` since they only ever apply to the
    /// instruction immediately following them.
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
    pub struct PrefixSet: u8 {
        /// 0x66 operand-size override.
        const PS_66 = 0b0000_0001;
        /// 0xF2 repeat/string prefix (also SSE `SD`/`DQ` selector).
        const PS_F2 = 0b0000_0010;
        /// 0xF3 repeat/string prefix (also SSE `SS`/`SI` selector).
        const PS_F3 = 0b0000_0100;
        /// 0x2E segment-override hint carried through to an Indirect operand.
        const PS_SEG = 0b0000_1000;
    }
}

/// REX prefix bits, valid only for the instruction they precede.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Default)]
pub struct RexBits {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

/// Condition code for `Jcc`/`CMOV`/`SET`, in the native 4-bit encoding
/// order (0 = Overflow .. 15 = Greater).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[rustfmt::skip]
pub enum Condition {
    O, NO, B, AE, E, NE, BE, A,
    S, NS, P, NP, L, GE, LE, G,
}

impl Condition {
    pub fn from_bits(bits: u8) -> Self {
        use Condition::*;
        match bits & 0xF {
            0x0 => O, 0x1 => NO, 0x2 => B, 0x3 => AE,
            0x4 => E, 0x5 => NE, 0x6 => BE, 0x7 => A,
            0x8 => S, 0x9 => NS, 0xA => P, 0xB => NP,
            0xC => L, 0xD => GE, 0xE => LE, _ => G,
        }
    }

    pub fn bits(self) -> u8 {
        use Condition::*;
        match self {
            O => 0x0, NO => 0x1, B => 0x2, AE => 0x3,
            E => 0x4, NE => 0x5, BE => 0x6, A => 0x7,
            S => 0x8, NS => 0x9, P => 0xA, NP => 0xB,
            L => 0xC, GE => 0xD, LE => 0xE, G => 0xF,
        }
    }
}

/// Closed mnemonic set. `Invalid` stands for an unrecognized opcode;
/// `HintCall`/`HintRet` are capture-only pseudo-ops the emulator uses to
/// mark an inlined call frame's entry/exit.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Mnemonic {
    Mov,
    MovZx,
    MovSx,
    Lea,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Neg,
    Not,
    Inc,
    Dec,
    Cmp,
    Test,
    Shl,
    Shr,
    Sar,
    Push,
    Pop,
    Call,
    Ret,
    Jmp,
    Jcc(Condition),
    CMov(Condition),
    Set(Condition),
    /// A generic SSE2 move/arithmetic op, tracked only well enough to be
    /// folded as dynamic pass-through; the emulator never computes over it.
    Sse,
    Nop,
    Invalid,
    HintCall,
    HintRet,
}

/// How many of `dst`/`src1`/`src2` an instruction form uses.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum OperandForm {
    Zero,
    Unary,
    Binary,
    Ternary,
}

/// The decoder's record of how it found dst/src, so a pass-through
/// instruction (one the decoder didn't fully understand) can still be
/// re-emitted by the generator.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum OperandEncodingKind {
    /// No pass-through payload; the generator knows how to encode this
    /// mnemonic/operand-shape pair directly.
    None,
    /// ModR/M.rm is the destination, ModR/M.reg is read (`MOV r/m, r`).
    Mr,
    /// ModR/M.reg is the destination, ModR/M.rm is read (`MOV r, r/m`).
    Rm,
    /// ModR/M.rm is the destination, an immediate follows (`MOV r/m, imm`).
    Rmi,
}

/// Raw opcode bytes captured for a pass-through instruction (1-4 bytes:
/// optional `0F`/`0F 38`/`0F 3A` escape plus the primary opcode byte).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Default)]
pub struct RawOpcode {
    pub bytes: [u8; 4],
    pub len: u8,
}

impl RawOpcode {
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= 4, "opcode byte sequence too long");
        let mut buf = [0u8; 4];
        buf[..bytes.len()].copy_from_slice(bytes);
        RawOpcode {
            bytes: buf,
            len: bytes.len() as u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// A decoded (or, for `Invalid`, unrecognized) instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Instr {
    pub address: u64,
    pub length: u8,
    pub mnemonic: Mnemonic,
    pub form: OperandForm,
    pub dst: Option<Operand>,
    pub src1: Option<Operand>,
    pub src2: Option<Operand>,
    pub prefixes: PrefixSet,
    pub raw_opcode: RawOpcode,
    pub encoding: OperandEncodingKind,
    /// Set by the emulator when capturing this instruction into the
    /// trace marks its destination register/stack slot Dynamic.
    pub dst_becomes_dynamic: bool,
}

impl Instr {
    pub fn invalid(address: u64) -> Self {
        Instr {
            address,
            length: 1,
            mnemonic: Mnemonic::Invalid,
            form: OperandForm::Zero,
            dst: None,
            src1: None,
            src2: None,
            prefixes: PrefixSet::empty(),
            raw_opcode: RawOpcode::default(),
            encoding: OperandEncodingKind::None,
            dst_becomes_dynamic: false,
        }
    }

    pub fn is_control_flow(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::Call
                | Mnemonic::Ret
                | Mnemonic::Jmp
                | Mnemonic::Jcc(_)
                | Mnemonic::HintCall
                | Mnemonic::HintRet
        )
    }
}

/// An ordered, growable sequence of instructions with a capacity bound
/// chosen at allocation.
#[derive(Debug, Default, Clone)]
pub struct InstrList {
    items: Vec<Instr>,
    capacity: usize,
}

impl InstrList {
    pub fn with_capacity(capacity: usize) -> Self {
        InstrList {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, instr: Instr) {
        self.items.push(instr);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instr> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Instr] {
        &self.items
    }

    pub fn last(&self) -> Option<&Instr> {
        self.items.last()
    }
}

impl std::ops::Index<usize> for InstrList {
    type Output = Instr;
    fn index(&self, idx: usize) -> &Instr {
        &self.items[idx]
    }
}

impl<'a> IntoIterator for &'a InstrList {
    type Item = &'a Instr;
    type IntoIter = std::slice::Iter<'a, Instr>;
    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl FromIterator<Instr> for InstrList {
    fn from_iter<T: IntoIterator<Item = Instr>>(iter: T) -> Self {
        let items: Vec<Instr> = iter.into_iter().collect();
        let capacity = items.capacity();
        InstrList { items, capacity }
    }
}
