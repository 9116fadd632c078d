// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The capturing emulator: a single-stepping interpreter over
//! `AbstractState` that folds static-only operations and captures
//! (re-emits into a trace) anything that consumes a dynamic value.

use crate::decoder::decode_single;
use crate::error::{CaptureFailure, RewriterError, Result};
use crate::instruction::{Instr, InstrList, Mnemonic};
use crate::operand::{Operand, Segment, ValueType};
use crate::register::Register;
use crate::state::{AbstractState, Cell};

/// Bounds how many instructions a single specialization may step
/// through before capture is declared fatally exhausted — this is what
/// makes termination unconditional rather than depending on the target
/// function's actual control flow.
const DEFAULT_INSTRUCTION_BUDGET: usize = 100_000;

/// One entry of the inlining call stack: the address execution resumes
/// at once the matching `RET` is seen.
struct Frame {
    return_addr: u64,
}

pub struct Emulator<'a> {
    code: &'a [u8],
    base_addr: u64,
    state: AbstractState,
    trace: InstrList,
    budget: usize,
    call_stack: Vec<Frame>,
}

impl<'a> Emulator<'a> {
    pub fn new(code: &'a [u8], base_addr: u64, bindings: impl IntoIterator<Item = (Register, u64)>) -> Self {
        Emulator {
            code,
            base_addr,
            state: AbstractState::new(bindings),
            trace: InstrList::with_capacity(code.len().max(1)),
            budget: DEFAULT_INSTRUCTION_BUDGET,
            call_stack: Vec::new(),
        }
    }

    /// Overrides the default instruction budget. Exposed so the public
    /// facade can thread the user's configured budget through without
    /// this module knowing anything about `Rewriter`.
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    fn end_addr(&self) -> u64 {
        self.base_addr + self.code.len() as u64
    }

    fn in_range(&self, addr: u64) -> bool {
        addr >= self.base_addr && addr < self.end_addr()
    }

    fn fetch(&self, addr: u64) -> Instr {
        decode_single(self.code, (addr - self.base_addr) as usize, self.base_addr)
    }

    /// Runs the capture loop starting at `base_addr` and returns the
    /// resulting trace.
    pub fn run(mut self) -> Result<InstrList> {
        let mut pc = self.base_addr;
        loop {
            if self.budget == 0 {
                return Err(RewriterError::CaptureFatal {
                    address: pc,
                    reason: CaptureFailure::InstructionBudgetExhausted,
                });
            }
            self.budget -= 1;

            let instr = self.fetch(pc);
            if instr.mnemonic == Mnemonic::Invalid {
                return Err(RewriterError::CaptureFatal {
                    address: pc,
                    reason: CaptureFailure::InvalidOpcode,
                });
            }
            let next_sequential = pc + instr.length as u64;

            match self.step(&instr, next_sequential)? {
                Step::Continue => pc = next_sequential,
                Step::Jump(target) => pc = target,
                Step::Done => break,
            }
        }
        Ok(self.trace)
    }

    /// Executes one instruction, returning where control goes next.
    fn step(&mut self, instr: &Instr, next_sequential: u64) -> Result<Step> {
        use Mnemonic::*;
        match instr.mnemonic {
            Nop => Ok(Step::Continue),
            Mov => self.step_mov(instr),
            MovZx | MovSx => self.step_move_extend(instr),
            Lea => self.step_lea(instr),
            Add | Sub | And | Or | Xor => self.step_binary_alu(instr),
            Neg | Not | Inc | Dec => self.step_unary_alu(instr),
            Cmp | Test => self.step_compare(instr),
            Shl | Shr | Sar => self.step_shift(instr),
            Push => self.step_push(instr),
            Pop => self.step_pop(instr),
            Call => self.step_call(instr, next_sequential),
            Ret => self.step_ret(instr),
            Jmp => self.step_jmp(instr, next_sequential),
            Jcc(cond) => self.step_jcc(instr, cond, next_sequential),
            CMov(_) | Set(_) | Sse => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
            Invalid | HintCall | HintRet => Ok(Step::Continue),
        }
    }

    // ---- operand evaluation -------------------------------------------------

    fn read(&self, op: &Operand) -> Cell {
        match op {
            Operand::Immediate { value, .. } => Cell::Static(*value),
            Operand::Register { reg, width, .. } => match self.state.get_gpr(*reg) {
                Cell::Static(v) => Cell::Static(v & width.mask64()),
                Cell::Dynamic => Cell::Dynamic,
            },
            Operand::Indirect { base, index, scale, displacement, .. } => {
                match self.stack_offset_for(*base, *index, *scale, *displacement) {
                    Some(offset) => self.state.read_stack(offset),
                    None => Cell::Dynamic,
                }
            }
        }
    }

    /// If an Indirect operand resolves to a statically-known offset
    /// from the tracked stack pointer, returns that offset. Any other
    /// shape (dynamic base, non-stack base, or an untracked stack
    /// pointer) yields `None`, meaning "unknown address".
    fn stack_offset_for(&self, base: Register, index: Register, scale: u8, displacement: i64) -> Option<i64> {
        if index != Register::None || scale != 0 {
            return None;
        }
        if !base.is_stack_pointer() {
            return None;
        }
        let sp_offset = self.state.stack_pointer_offset()?;
        Some(sp_offset + displacement)
    }

    fn write(&mut self, op: &Operand, cell: Cell) {
        match op {
            Operand::Register { reg, width, .. } => {
                self.state.set_gpr(*reg, cell, *width);
            }
            Operand::Indirect { base, index, scale, displacement, .. } => {
                if let Some(offset) = self.stack_offset_for(*base, *index, *scale, *displacement) {
                    self.state.write_stack(offset, cell);
                }
                // Stores to unknown addresses are captured verbatim and
                // assumed to preserve all tagged state — nothing to
                // update here.
            }
            Operand::Immediate { .. } => unreachable!("immediate is never a write target"),
        }
    }

    /// Materializes any currently-Static register referenced by `dst`
    /// with a preparatory `MOV reg, imm`, then marks it Dynamic, so a
    /// later capture can build on a real runtime value instead of a
    /// constant that was never actually written.
    fn materialize_dst(&mut self, dst: &Operand) {
        if let Some(reg) = dst.as_register() {
            if let Cell::Static(value) = self.state.get_gpr(reg) {
                let mov = Instr {
                    address: 0,
                    length: 0,
                    mnemonic: Mnemonic::Mov,
                    form: crate::instruction::OperandForm::Binary,
                    dst: Some(Operand::reg(ValueType::W64, reg)),
                    src1: Some(Operand::imm(ValueType::W64, value)),
                    src2: None,
                    prefixes: crate::instruction::PrefixSet::empty(),
                    raw_opcode: crate::instruction::RawOpcode::default(),
                    encoding: crate::instruction::OperandEncodingKind::None,
                    dst_becomes_dynamic: true,
                };
                self.trace.push(mov);
                self.state.set_gpr(reg, Cell::Dynamic, ValueType::W64);
            }
        }
    }

    /// Emits `instr` into the trace as-is (source addresses preserved
    /// for debuggability) and marks its destination Dynamic.
    fn capture_dynamic(&mut self, instr: &Instr) {
        if let Some(dst) = &instr.dst {
            self.materialize_dst(dst);
        }
        let mut captured = instr.clone();
        captured.dst_becomes_dynamic = true;
        self.trace.push(captured);
        if let Some(dst) = &instr.dst {
            self.write(dst, Cell::Dynamic);
        }
        self.state.flags = crate::state::Flags::all_dynamic();
    }

    // ---- per-mnemonic handlers ----------------------------------------------

    fn step_mov(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("MOV has a destination");
        let src = instr.src1.as_ref().expect("MOV has a source");
        match self.read(src) {
            Cell::Static(v) => {
                let width = dst.width();
                self.write(dst, Cell::Static(v & width.mask64()));
                Ok(Step::Continue)
            }
            Cell::Dynamic => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
        }
    }

    fn step_move_extend(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("MOVZX/MOVSX has a destination");
        let src = instr.src1.as_ref().expect("MOVZX/MOVSX has a source");
        match self.read(src) {
            Cell::Static(v) => {
                let src_width = src.width();
                let masked = v & src_width.mask64();
                let extended = if instr.mnemonic == Mnemonic::MovSx {
                    sign_extend(masked, src_width)
                } else {
                    masked
                };
                self.write(dst, Cell::Static(extended & dst.width().mask64()));
                Ok(Step::Continue)
            }
            Cell::Dynamic => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
        }
    }

    /// LEA computes an address, never dereferences memory: a static
    /// base/index folds directly into the displacement instead of
    /// forcing the whole instruction dynamic.
    fn step_lea(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("LEA has a destination");
        let src = instr.src1.as_ref().expect("LEA has a source");
        let Operand::Indirect { width, base, index, scale, displacement, segment } = *src else {
            unreachable!("LEA's source is always Indirect");
        };

        let base_cell = if base == Register::None { Cell::Static(0) } else { self.state.get_gpr(base) };
        let index_cell = if index == Register::None { Cell::Static(0) } else { self.state.get_gpr(index) };

        if let (Cell::Static(b), Cell::Static(i)) = (base_cell, index_cell) {
            let addr = b.wrapping_add(i.wrapping_mul(scale.max(1) as u64)).wrapping_add(displacement as u64);
            self.write(dst, Cell::Static(addr));
            return Ok(Step::Continue);
        }

        let mut folded_disp = displacement;
        let mut folded_base = base;
        let mut folded_index = index;
        let mut folded_scale = scale;
        if let Cell::Static(b) = base_cell {
            folded_disp = folded_disp.wrapping_add(b as i64);
            folded_base = Register::None;
        }
        if let Cell::Static(i) = index_cell {
            folded_disp = folded_disp.wrapping_add((i.wrapping_mul(scale.max(1) as u64)) as i64);
            folded_index = Register::None;
            folded_scale = 0;
        }

        let folded_src = Operand::indirect(width, folded_base, folded_index, folded_scale, folded_disp, segment);
        let mut folded_instr = instr.clone();
        folded_instr.src1 = Some(folded_src);
        self.capture_dynamic(&folded_instr);
        Ok(Step::Continue)
    }

    fn step_binary_alu(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("binary ALU op has a destination");
        let src = instr.src1.as_ref().expect("binary ALU op has a source");
        let a = self.read(dst);
        let b = self.read(src);
        match (a, b) {
            (Cell::Static(av), Cell::Static(bv)) => {
                let width = dst.width();
                let (result, flags) = alu_binary(instr.mnemonic, width, av, bv);
                self.write(dst, Cell::Static(result));
                self.state.flags = flags;
                Ok(Step::Continue)
            }
            _ => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
        }
    }

    fn step_unary_alu(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("unary ALU op has a destination");
        match self.read(dst) {
            Cell::Static(v) => {
                let width = dst.width();
                let (result, flags) = alu_unary(instr.mnemonic, width, v);
                self.write(dst, Cell::Static(result));
                self.state.flags = flags;
                Ok(Step::Continue)
            }
            Cell::Dynamic => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
        }
    }

    fn step_compare(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("CMP/TEST has a left operand");
        let src = instr.src1.as_ref().expect("CMP/TEST has a right operand");
        let a = self.read(dst);
        let b = self.read(src);
        match (a, b) {
            (Cell::Static(av), Cell::Static(bv)) => {
                let width = dst.width();
                let mnemonic = if instr.mnemonic == Mnemonic::Test { Mnemonic::And } else { Mnemonic::Sub };
                let (_, flags) = alu_binary(mnemonic, width, av, bv);
                self.state.flags = flags;
                Ok(Step::Continue)
            }
            _ => {
                // CMP/TEST write no destination; capture verbatim and
                // mark the flags (not a register) dynamic.
                self.trace.push(instr.clone());
                self.state.flags = crate::state::Flags::all_dynamic();
                Ok(Step::Continue)
            }
        }
    }

    fn step_shift(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("shift has a destination");
        let src = instr.src1.as_ref().expect("shift has a count operand");
        let a = self.read(dst);
        let b = self.read(src);
        match (a, b) {
            (Cell::Static(av), Cell::Static(count)) => {
                let width = dst.width();
                let mask = if width == ValueType::W64 { 0x3F } else { 0x1F };
                let count = (count & mask) as u32;
                let masked = av & width.mask64();
                let result = match instr.mnemonic {
                    Mnemonic::Shl => masked.wrapping_shl(count),
                    Mnemonic::Shr => masked.wrapping_shr(count),
                    Mnemonic::Sar => {
                        let signed = sign_extend(masked, width) as i64;
                        (signed.wrapping_shr(count)) as u64
                    }
                    _ => unreachable!(),
                } & width.mask64();
                self.write(dst, Cell::Static(result));
                self.state.flags = if count == 0 {
                    self.state.flags
                } else {
                    crate::state::Flags::all_dynamic()
                };
                Ok(Step::Continue)
            }
            _ => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
        }
    }

    /// A Static push/pop against the tracked stack region folds for free:
    /// the value can always be rematerialized later from its known
    /// constant, so the shadow-stack slot is pure bookkeeping. A Dynamic
    /// value carries no identity our own bookkeeping preserves across an
    /// abstract store and reload, so folding it away regardless of
    /// whether the destination register matches the source would move an
    /// opaque runtime value into the wrong place (or lose it entirely) —
    /// the pair is instead captured so the real copy actually happens,
    /// the same fold-if-static/capture-if-dynamic split every other
    /// handler in this file uses.
    fn step_push(&mut self, instr: &Instr) -> Result<Step> {
        let src = instr.src1.as_ref().expect("PUSH has a source");
        let value = self.read(src);
        match self.state.stack_pointer_offset() {
            Some(_) => {
                if value.is_dynamic() {
                    self.trace.push(instr.clone());
                }
                self.state.adjust_stack_pointer(-8);
                let offset = self.state.stack_pointer_offset().unwrap();
                self.state.write_stack(offset, value);
                Ok(Step::Continue)
            }
            None => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
        }
    }

    fn step_pop(&mut self, instr: &Instr) -> Result<Step> {
        let dst = instr.dst.as_ref().expect("POP has a destination");
        match self.state.stack_pointer_offset() {
            Some(offset) => {
                let value = self.state.read_stack(offset);
                if value.is_dynamic() {
                    self.materialize_dst(dst);
                    self.trace.push(instr.clone());
                }
                self.state.adjust_stack_pointer(8);
                self.write(dst, value);
                Ok(Step::Continue)
            }
            None => {
                self.capture_dynamic(instr);
                Ok(Step::Continue)
            }
        }
    }

    fn step_call(&mut self, instr: &Instr, next_sequential: u64) -> Result<Step> {
        let Some(src) = &instr.src1 else {
            return Err(RewriterError::CaptureFatal {
                address: instr.address,
                reason: CaptureFailure::IndirectControlTransferWithDynamicTarget,
            });
        };

        let target = match src {
            Operand::Immediate { value, width } => Some(next_sequential.wrapping_add(sign_extend_rel(*value, *width))),
            _ => None,
        };

        let Some(target) = target else {
            return Err(RewriterError::CaptureFatal {
                address: instr.address,
                reason: CaptureFailure::IndirectControlTransferWithDynamicTarget,
            });
        };

        if !self.in_range(target) || self.state.stack_pointer_offset().is_none() {
            return Err(RewriterError::CaptureFatal {
                address: instr.address,
                reason: CaptureFailure::IndirectControlTransferWithDynamicTarget,
            });
        }

        self.state.adjust_stack_pointer(-8);
        let offset = self.state.stack_pointer_offset().unwrap();
        self.state.write_stack(offset, Cell::Static(next_sequential));
        self.call_stack.push(Frame { return_addr: next_sequential });
        self.trace.push(hint(instr.address, Mnemonic::HintCall));
        Ok(Step::Jump(target))
    }

    fn step_ret(&mut self, instr: &Instr) -> Result<Step> {
        if let (Some(offset), Some(frame)) = (self.state.stack_pointer_offset(), self.call_stack.last()) {
            if self.state.read_stack(offset) == Cell::Static(frame.return_addr) {
                let return_addr = self.call_stack.pop().unwrap().return_addr;
                self.state.adjust_stack_pointer(8);
                self.trace.push(hint(instr.address, Mnemonic::HintRet));
                return Ok(Step::Jump(return_addr));
            }
        }
        self.trace.push(instr.clone());
        Ok(Step::Done)
    }

    fn step_jmp(&mut self, instr: &Instr, next_sequential: u64) -> Result<Step> {
        let Some(Operand::Immediate { value, width }) = instr.src1 else {
            self.capture_dynamic(instr);
            return Ok(Step::Done);
        };
        let target = next_sequential.wrapping_add(sign_extend_rel(value, width));
        if self.in_range(target) {
            Ok(Step::Jump(target))
        } else {
            self.trace.push(instr.clone());
            Ok(Step::Done)
        }
    }

    /// Follows the taken edge without emitting anything when the
    /// condition is fully static; otherwise the emulator cannot take
    /// both paths, so it terminates with the branch captured verbatim —
    /// merging abstract state across both arms of a dynamic branch is
    /// not attempted.
    fn step_jcc(&mut self, instr: &Instr, cond: crate::instruction::Condition, next_sequential: u64) -> Result<Step> {
        match self.evaluate_condition(cond) {
            Some(taken) => {
                let Some(Operand::Immediate { value, width }) = instr.src1 else {
                    unreachable!("Jcc always carries a relative-offset immediate");
                };
                if taken {
                    let target = next_sequential.wrapping_add(sign_extend_rel(value, width));
                    if self.in_range(target) {
                        Ok(Step::Jump(target))
                    } else {
                        self.trace.push(instr.clone());
                        Ok(Step::Done)
                    }
                } else {
                    Ok(Step::Continue)
                }
            }
            None => {
                self.trace.push(instr.clone());
                Ok(Step::Done)
            }
        }
    }

    fn evaluate_condition(&self, cond: crate::instruction::Condition) -> Option<bool> {
        use crate::instruction::Condition::*;
        let bit = |c: Option<Cell>| c.and_then(|c| c.static_value()).map(|v| v != 0);
        let cf = bit(self.state.flags.cf);
        let zf = bit(self.state.flags.zf);
        let sf = bit(self.state.flags.sf);
        let of = bit(self.state.flags.of);
        let pf = bit(self.state.flags.pf);
        match cond {
            O => of,
            NO => of.map(|v| !v),
            B => cf,
            AE => cf.map(|v| !v),
            E => zf,
            NE => zf.map(|v| !v),
            BE => Some(cf? || zf?),
            A => Some(!cf? && !zf?),
            S => sf,
            NS => sf.map(|v| !v),
            P => pf,
            NP => pf.map(|v| !v),
            L => Some(sf? != of?),
            GE => Some(sf? == of?),
            LE => Some(zf? || (sf? != of?)),
            G => Some(!zf? && (sf? == of?)),
        }
    }
}

fn hint(address: u64, mnemonic: Mnemonic) -> Instr {
    Instr {
        address,
        length: 0,
        mnemonic,
        form: crate::instruction::OperandForm::Zero,
        dst: None,
        src1: None,
        src2: None,
        prefixes: crate::instruction::PrefixSet::empty(),
        raw_opcode: crate::instruction::RawOpcode::default(),
        encoding: crate::instruction::OperandEncodingKind::None,
        dst_becomes_dynamic: false,
    }
}

fn sign_extend_rel(value: u64, width: ValueType) -> u64 {
    match width {
        ValueType::W8 => (value as u8 as i8) as i64 as u64,
        _ => (value as u32 as i32) as i64 as u64,
    }
}

fn sign_extend(value: u64, from: ValueType) -> u64 {
    match from {
        ValueType::W8 => (value as u8 as i8) as i64 as u64,
        ValueType::W16 => (value as u16 as i16) as i64 as u64,
        ValueType::W32 => (value as u32 as i32) as i64 as u64,
        _ => value,
    }
}

enum Step {
    Continue,
    Jump(u64),
    Done,
}

fn parity_even(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn sign_bit(width: ValueType) -> u64 {
    1u64 << (width.bits() - 1)
}

/// Computes `mnemonic(a, b)` at `width`, bit-exact, returning the
/// masked result and the resulting flags.
fn alu_binary(mnemonic: Mnemonic, width: ValueType, a: u64, b: u64) -> (u64, crate::state::Flags) {
    let mask = width.mask64();
    let a = a & mask;
    let b = b & mask;
    let sign = sign_bit(width);

    let (raw, cf, of) = match mnemonic {
        Mnemonic::Add => {
            let sum = a.wrapping_add(b);
            let cf = (sum & mask) < a;
            let of = ((a ^ (sum & mask)) & (b ^ (sum & mask)) & sign) != 0;
            (sum & mask, cf, of)
        }
        Mnemonic::Sub => {
            let diff = a.wrapping_sub(b);
            let cf = a < b;
            let of = ((a ^ b) & (a ^ (diff & mask)) & sign) != 0;
            (diff & mask, cf, of)
        }
        Mnemonic::And => (a & b, false, false),
        Mnemonic::Or => (a | b, false, false),
        Mnemonic::Xor => (a ^ b, false, false),
        _ => unreachable!("alu_binary only handles ADD/SUB/AND/OR/XOR"),
    };

    let result = raw & mask;
    let flags = crate::state::Flags {
        cf: Some(Cell::Static(cf as u64)),
        zf: Some(Cell::Static((result == 0) as u64)),
        sf: Some(Cell::Static(((result & sign) != 0) as u64)),
        of: Some(Cell::Static(of as u64)),
        pf: Some(Cell::Static(parity_even(result as u8) as u64)),
        af: Some(Cell::Dynamic),
    };
    (result, flags)
}

fn alu_unary(mnemonic: Mnemonic, width: ValueType, a: u64) -> (u64, crate::state::Flags) {
    let mask = width.mask64();
    let a = a & mask;
    let sign = sign_bit(width);

    match mnemonic {
        Mnemonic::Not => {
            let result = (!a) & mask;
            // NOT does not affect flags; the caller's prior flags stand.
            (result, crate::state::Flags::all_dynamic())
        }
        Mnemonic::Neg => {
            let result = a.wrapping_neg() & mask;
            let cf = a != 0;
            let of = a == sign;
            let flags = crate::state::Flags {
                cf: Some(Cell::Static(cf as u64)),
                zf: Some(Cell::Static((result == 0) as u64)),
                sf: Some(Cell::Static(((result & sign) != 0) as u64)),
                of: Some(Cell::Static(of as u64)),
                pf: Some(Cell::Static(parity_even(result as u8) as u64)),
                af: Some(Cell::Dynamic),
            };
            (result, flags)
        }
        Mnemonic::Inc => {
            let result = a.wrapping_add(1) & mask;
            let of = a == (sign.wrapping_sub(1));
            let flags = crate::state::Flags {
                cf: None, // INC/DEC leave CF unaffected.
                zf: Some(Cell::Static((result == 0) as u64)),
                sf: Some(Cell::Static(((result & sign) != 0) as u64)),
                of: Some(Cell::Static(of as u64)),
                pf: Some(Cell::Static(parity_even(result as u8) as u64)),
                af: Some(Cell::Dynamic),
            };
            (result, flags)
        }
        Mnemonic::Dec => {
            let result = a.wrapping_sub(1) & mask;
            let of = a == sign;
            let flags = crate::state::Flags {
                cf: None,
                zf: Some(Cell::Static((result == 0) as u64)),
                sf: Some(Cell::Static(((result & sign) != 0) as u64)),
                of: Some(Cell::Static(of as u64)),
                pf: Some(Cell::Static(parity_even(result as u8) as u64)),
                af: Some(Cell::Dynamic),
            };
            (result, flags)
        }
        _ => unreachable!("alu_unary only handles NOT/NEG/INC/DEC"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RAX, RDI, RSI};

    #[test]
    fn ret_identity_produces_single_ret() {
        let code = [0xC3u8];
        let emulator = Emulator::new(&code, 0x1000, []);
        let trace = emulator.run().unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].mnemonic, Mnemonic::Ret);
    }

    #[test]
    fn prologue_captures_rbp_round_trip_the_optimizer_later_removes() {
        // push rbp; mov rbp, rsp; pop rbp; ret -- rbp is read back into
        // itself and never used again, but the emulator has no
        // lookahead to know that; it captures the real sequence and
        // leaves removing the now-dead round trip to the optimizer.
        let code = [0x55u8, 0x48, 0x89, 0xE5, 0x5D, 0xC3];
        let emulator = Emulator::new(&code, 0x1000, []);
        let trace = emulator.run().unwrap();
        let mnemonics: Vec<_> = trace.iter().map(|i| i.mnemonic).collect();
        assert_eq!(mnemonics, vec![Mnemonic::Push, Mnemonic::Mov, Mnemonic::Pop, Mnemonic::Ret]);
    }

    #[test]
    fn push_pop_across_different_registers_preserves_the_value() {
        // push rsi; pop rax; ret -- rsi is unbound (dynamic) and must
        // land in rax at runtime; folding this pair away abstractly
        // would return whatever the caller happened to leave in rax.
        let code = [0x56u8, 0x58, 0xC3];
        let emulator = Emulator::new(&code, 0x1000, []);
        let trace = emulator.run().unwrap();
        assert_eq!(
            trace.iter().map(|i| i.mnemonic).collect::<Vec<_>>(),
            vec![Mnemonic::Push, Mnemonic::Pop, Mnemonic::Ret]
        );
        assert_eq!(trace[0].src1, Some(Operand::reg(ValueType::W64, Register::gpr(RSI))));
        assert_eq!(trace[1].dst, Some(Operand::reg(ValueType::W64, Register::gpr(RAX))));
    }

    #[test]
    fn static_fold_lea_specializes_one_bound_argument() {
        // LEA rax, [rdi+rsi]; RET  with rdi=Static(3), rsi=Dynamic.
        let code = [0x48u8, 0x8D, 0x04, 0x37, 0xC3];
        let emulator = Emulator::new(&code, 0x1000, [(Register::gpr(RDI), 3u64)]);
        let trace = emulator.run().unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].mnemonic, Mnemonic::Lea);
        match &trace[0].src1 {
            Some(Operand::Indirect { base, index, displacement, .. }) => {
                assert_eq!(*base, Register::None);
                assert_eq!(*index, Register::gpr(RSI));
                assert_eq!(*displacement, 3);
            }
            other => panic!("expected folded Indirect operand, got {other:?}"),
        }
        assert_eq!(trace[1].mnemonic, Mnemonic::Ret);
    }

    #[test]
    fn fully_static_add_folds_away() {
        // mov eax, 2 ; add eax, 3 ; ret -- all static, whole body folds.
        let code = [0xB8u8, 0x02, 0x00, 0x00, 0x00, 0x83, 0xC0, 0x03, 0xC3];
        let emulator = Emulator::new(&code, 0x1000, []);
        let trace = emulator.run().unwrap();
        assert_eq!(trace.iter().map(|i| i.mnemonic).collect::<Vec<_>>(), vec![Mnemonic::Ret]);
    }

    #[test]
    fn dynamic_add_is_captured() {
        // add eax, esi ; ret -- eax unbound (dynamic), esi dynamic. The
        // MR encoding (0x01) keeps eax as the destination and esi as
        // the source; swapping them would silently reverse the operands.
        let code = [0x01u8, 0xF0, 0xC3];
        let emulator = Emulator::new(&code, 0x1000, []);
        let trace = emulator.run().unwrap();
        assert_eq!(trace.iter().map(|i| i.mnemonic).collect::<Vec<_>>(), vec![Mnemonic::Add, Mnemonic::Ret]);
        assert_eq!(trace[0].dst, Some(Operand::reg(ValueType::W32, Register::gpr(RAX))));
        assert_eq!(trace[0].src1, Some(Operand::reg(ValueType::W32, Register::gpr(RSI))));
    }

    #[test]
    fn invalid_opcode_is_capture_fatal() {
        let code = [0x0Fu8, 0xFF, 0xC3];
        let emulator = Emulator::new(&code, 0x1000, []);
        let err = emulator.run().unwrap_err();
        assert!(matches!(err, RewriterError::CaptureFatal { reason: CaptureFailure::InvalidOpcode, .. }));
    }
}
