// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! Peephole optimizer: a single forward pass per basic block over the
//! captured trace. Source addresses are preserved on every surviving
//! instruction; only the output sequence is new.

use std::collections::HashMap;

use crate::instruction::{Instr, InstrList, Mnemonic};
use crate::operand::Operand;
use crate::register::Register;

/// Runs the optimizer over a captured trace, returning the rewritten
/// `InstrList`. Basic blocks are delimited by any control-flow
/// instruction, which is always itself kept.
pub fn optimize(trace: &InstrList) -> InstrList {
    let mut out = InstrList::with_capacity(trace.capacity());
    let mut block_start = 0;
    let items = trace.as_slice();
    for (i, instr) in items.iter().enumerate() {
        if instr.is_control_flow() {
            for kept in optimize_block(&items[block_start..=i]) {
                out.push(kept);
            }
            block_start = i + 1;
        }
    }
    if block_start < items.len() {
        for kept in optimize_block(&items[block_start..]) {
            out.push(kept);
        }
    }
    out
}

fn is_flag_consumer(mnemonic: Mnemonic) -> bool {
    matches!(mnemonic, Mnemonic::Jcc(_) | Mnemonic::CMov(_) | Mnemonic::Set(_))
}

fn is_flag_producer(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Neg
            | Mnemonic::Inc
            | Mnemonic::Dec
            | Mnemonic::Cmp
            | Mnemonic::Test
            | Mnemonic::Shl
            | Mnemonic::Shr
            | Mnemonic::Sar
    )
}

fn operand_address_regs(op: &Operand, out: &mut Vec<Register>) {
    if let Operand::Indirect { base, index, .. } = op {
        if *base != Register::None {
            out.push(*base);
        }
        if *index != Register::None {
            out.push(*index);
        }
    }
}

/// Registers whose current value this instruction reads, including
/// address components of any Indirect operand and, for read-modify-write
/// mnemonics, the destination register itself.
fn registers_read(instr: &Instr) -> Vec<Register> {
    let mut regs = Vec::new();
    for op in [instr.src1.as_ref(), instr.src2.as_ref()].into_iter().flatten() {
        match op {
            Operand::Register { reg, .. } => regs.push(*reg),
            Operand::Indirect { .. } => operand_address_regs(op, &mut regs),
            Operand::Immediate { .. } => {}
        }
    }
    if let Some(dst) = &instr.dst {
        operand_address_regs(dst, &mut regs);
        // CMP/TEST's "destination" is really just their left operand;
        // everything else that carries a dst either reads-modifies-writes
        // it (ADD, SHL, ...) or writes it outright (MOV, LEA, POP, SET).
        let dst_is_write_only = matches!(
            instr.mnemonic,
            Mnemonic::Mov | Mnemonic::MovZx | Mnemonic::MovSx | Mnemonic::Lea | Mnemonic::Pop | Mnemonic::Set(_)
        );
        if !dst_is_write_only {
            if let Operand::Register { reg, .. } = dst {
                regs.push(*reg);
            }
        }
    }
    regs
}

fn is_reg_reg_same(instr: &Instr) -> bool {
    matches!(
        (&instr.dst, &instr.src1),
        (Some(Operand::Register { reg: d, .. }), Some(Operand::Register { reg: s, .. })) if d == s
    )
}

fn is_binary_with_immediate(instr: &Instr, value: u64) -> bool {
    instr.dst.as_ref().and_then(Operand::as_register).is_some()
        && matches!(&instr.src1, Some(Operand::Immediate { value: v, .. }) if *v == value)
}

fn is_and_with_all_ones(instr: &Instr) -> bool {
    match (&instr.dst, &instr.src1) {
        (Some(dst), Some(Operand::Immediate { value, .. })) if dst.as_register().is_some() => {
            *value & dst.width().mask64() == dst.width().mask64()
        }
        _ => false,
    }
}

/// Peephole identity folds: an ALU op whose effect on its destination is
/// provably a no-op. `XOR r, r` is intentionally excluded — it is the
/// idiomatic zeroing idiom, not dead code.
fn is_identity_fold(instr: &Instr) -> bool {
    match instr.mnemonic {
        Mnemonic::Add | Mnemonic::Sub | Mnemonic::Or => is_binary_with_immediate(instr, 0),
        Mnemonic::And => is_and_with_all_ones(instr),
        Mnemonic::Mov => is_reg_reg_same(instr),
        _ => false,
    }
}

fn optimize_block(block: &[Instr]) -> Vec<Instr> {
    let mut kept: Vec<Instr> = Vec::with_capacity(block.len());
    let mut dead: Vec<bool> = Vec::with_capacity(block.len());
    let mut pending_prep: HashMap<Register, usize> = HashMap::new();
    let mut pending_flags: Option<usize> = None;

    for instr in block {
        if is_identity_fold(instr) {
            continue;
        }

        for reg in registers_read(instr) {
            pending_prep.remove(&reg);
        }
        if is_flag_consumer(instr.mnemonic) {
            pending_flags = None;
        }

        if let Some(dst_reg) = instr.dst.as_ref().and_then(Operand::as_register) {
            if let Some(&idx) = pending_prep.get(&dst_reg) {
                dead[idx] = true;
            }
            pending_prep.remove(&dst_reg);
        }

        if is_flag_producer(instr.mnemonic) {
            if let Some(idx) = pending_flags {
                dead[idx] = true;
            }
            pending_flags = matches!(instr.mnemonic, Mnemonic::Cmp | Mnemonic::Test).then_some(kept.len());
        }

        let is_preparatory_mov =
            instr.mnemonic == Mnemonic::Mov && matches!(instr.src1, Some(Operand::Immediate { .. }));
        if is_preparatory_mov {
            if let Some(dst_reg) = instr.dst.as_ref().and_then(Operand::as_register) {
                pending_prep.insert(dst_reg, kept.len());
            }
        }

        kept.push(instr.clone());
        dead.push(false);
    }

    kept.into_iter().zip(dead).filter(|(_, d)| !d).map(|(i, _)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::ValueType;
    use crate::register::{RAX, RBX, RCX};

    fn mov_reg_reg(dst: u8, src: u8) -> Instr {
        let mut i = Instr::invalid(0x1000);
        i.mnemonic = Mnemonic::Mov;
        i.form = crate::instruction::OperandForm::Binary;
        i.dst = Some(Operand::reg(ValueType::W64, Register::gpr(dst)));
        i.src1 = Some(Operand::reg(ValueType::W64, Register::gpr(src)));
        i
    }

    fn mov_reg_imm(dst: u8, value: u64) -> Instr {
        let mut i = Instr::invalid(0x1000);
        i.mnemonic = Mnemonic::Mov;
        i.form = crate::instruction::OperandForm::Binary;
        i.dst = Some(Operand::reg(ValueType::W64, Register::gpr(dst)));
        i.src1 = Some(Operand::imm(ValueType::W64, value));
        i
    }

    fn add_reg_imm(dst: u8, value: u64) -> Instr {
        let mut i = mov_reg_imm(dst, value);
        i.mnemonic = Mnemonic::Add;
        i
    }

    fn cmp(a: u8, b: u8) -> Instr {
        let mut i = mov_reg_reg(a, b);
        i.mnemonic = Mnemonic::Cmp;
        i
    }

    fn ret() -> Instr {
        let mut i = Instr::invalid(0x1000);
        i.mnemonic = Mnemonic::Ret;
        i.form = crate::instruction::OperandForm::Zero;
        i
    }

    fn trace(instrs: Vec<Instr>) -> InstrList {
        instrs.into_iter().collect()
    }

    #[test]
    fn drops_redundant_self_move() {
        let t = trace(vec![mov_reg_reg(RAX, RAX), ret()]);
        let out = optimize(&t);
        assert_eq!(out.iter().map(|i| i.mnemonic).collect::<Vec<_>>(), vec![Mnemonic::Ret]);
    }

    #[test]
    fn drops_dead_preparatory_mov() {
        // mov rax, 1 ; mov rax, 2 ; ret -- the first write is never read.
        let t = trace(vec![mov_reg_imm(RAX, 1), mov_reg_imm(RAX, 2), ret()]);
        let out = optimize(&t);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mnemonic, Mnemonic::Mov);
        assert_eq!(out[0].src1, Some(Operand::imm(ValueType::W64, 2)));
    }

    #[test]
    fn keeps_preparatory_mov_when_read() {
        // mov rax, 1 ; add rbx, rax ; ret -- rax is read, so it survives.
        let mut add_rbx_rax = mov_reg_reg(RBX, RAX);
        add_rbx_rax.mnemonic = Mnemonic::Add;
        let t = trace(vec![mov_reg_imm(RAX, 1), add_rbx_rax, ret()]);
        let out = optimize(&t);
        assert_eq!(out.iter().map(|i| i.mnemonic).collect::<Vec<_>>(), vec![Mnemonic::Mov, Mnemonic::Add, Mnemonic::Ret]);
    }

    #[test]
    fn drops_unconsumed_cmp() {
        // cmp rax, rbx ; cmp rcx, rbx ; ret -- first CMP's flags are clobbered unused.
        let t = trace(vec![cmp(RAX, RBX), cmp(RCX, RBX), ret()]);
        let out = optimize(&t);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dst, Some(Operand::reg(ValueType::W64, Register::gpr(RCX))));
    }

    #[test]
    fn keeps_cmp_consumed_by_jcc() {
        let mut jcc = Instr::invalid(0x1000);
        jcc.mnemonic = Mnemonic::Jcc(crate::instruction::Condition::E);
        jcc.form = crate::instruction::OperandForm::Unary;
        jcc.src1 = Some(Operand::imm(ValueType::W32, 0));
        let t = trace(vec![cmp(RAX, RBX), jcc]);
        let out = optimize(&t);
        assert_eq!(out.iter().map(|i| i.mnemonic).collect::<Vec<_>>().len(), 2);
    }

    #[test]
    fn drops_add_zero_but_keeps_xor_self() {
        let mut xor_self = mov_reg_reg(RAX, RAX);
        xor_self.mnemonic = Mnemonic::Xor;
        let t = trace(vec![add_reg_imm(RAX, 0), xor_self.clone(), ret()]);
        let out = optimize(&t);
        assert_eq!(out.iter().map(|i| i.mnemonic).collect::<Vec<_>>(), vec![Mnemonic::Xor, Mnemonic::Ret]);
    }
}
