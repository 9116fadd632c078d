// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! Error kinds for the rewriter pipeline. The rewriter never retries:
//! every variant here aborts the current `specialize` call and leaves
//! no partial function behind.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RewriterError {
    /// The emulator walked into an `Invalid` instruction, an indirect
    /// control transfer with a dynamic target, or exhausted the
    /// configured instruction budget.
    #[error("capture aborted at address {address:#x}: {reason}")]
    CaptureFatal { address: u64, reason: CaptureFailure },

    /// The generator needed more bytes than the layout pass reserved.
    #[error("generator exhausted its {reserved}-byte reservation (needed {needed})")]
    StorageExhausted { reserved: usize, needed: usize },

    /// An argument index was out of the System V integer-register range
    /// (>=6), or the same index was bound twice. Rejected before any
    /// decoding happens.
    #[error("invalid rewriter configuration: {0}")]
    Misconfiguration(String),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CaptureFailure {
    InvalidOpcode,
    IndirectControlTransferWithDynamicTarget,
    InstructionBudgetExhausted,
}

impl std::fmt::Display for CaptureFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            CaptureFailure::InvalidOpcode => "encountered an unrecognized opcode",
            CaptureFailure::IndirectControlTransferWithDynamicTarget => {
                "indirect branch target is dynamic"
            }
            CaptureFailure::InstructionBudgetExhausted => "instruction budget exhausted",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = std::result::Result<T, RewriterError>;
