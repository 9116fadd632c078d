// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! A dynamic binary rewriter for x86-64: given a pointer to a compiled
//! function and a partial binding of its System V integer arguments,
//! produces a new, specialized function with the bound arguments
//! folded away wherever possible.
//!
//! The pipeline is Decoder → Emulator → Optimizer → Generator:
//! [`decoder`] turns raw bytes into [`instruction::Instr`]s, [`emulator`]
//! walks them abstractly and captures anything it cannot fold,
//! [`optimizer`] removes redundancy the capture pass leaves behind, and
//! [`codegen`] re-emits native code into a fresh [`storage::CodeStorage`]
//! region. [`rewriter::Rewriter`] is the facade that wires all four
//! stages together.

mod codegen;
mod decoder;
mod emulator;
mod error;
mod instruction;
mod operand;
mod optimizer;
mod register;
mod rewriter;
mod state;
mod storage;

pub use error::{CaptureFailure, RewriterError, Result};
pub use instruction::{Condition, Instr, InstrList, Mnemonic, OperandEncodingKind, OperandForm, PrefixSet};
pub use operand::{Operand, Segment, ValueType};
pub use register::Register;
pub use rewriter::{Binding, Rewriter, RewriterConfig};
pub use storage::CodeStorage;
