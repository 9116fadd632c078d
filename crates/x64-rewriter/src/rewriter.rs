// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The public facade: `Rewriter` wires the decoder, the capturing
//! emulator, the optimizer, and the generator into the single operation
//! a host cares about — turn a function pointer and a set of argument
//! bindings into a specialized function pointer.

use std::collections::BTreeMap;

use crate::codegen;
use crate::emulator::Emulator;
use crate::error::{RewriterError, Result};
use crate::optimizer;
use crate::register::{Register, RCX, RDI, RDX, R8, R9, RSI};
use crate::storage::CodeStorage;

/// How one System V integer argument is bound for a specialization.
/// `Dynamic` is the default for any index never passed to `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Static(u64),
    Dynamic,
}

/// Maps a System V integer argument index to its carrying register.
/// Only the first six integer arguments pass in registers; anything
/// beyond that spills to the stack, which this rewriter does not model.
fn arg_register(index: usize) -> Option<Register> {
    const ORDER: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];
    ORDER.get(index).map(|&idx| Register::gpr(idx))
}

/// A generously large upper bound on how many bytes of machine code a
/// single specialization may read starting at `fn_ptr`, used only to
/// build the byte slice the decoder walks. The emulator's own
/// instruction budget (not this bound) is what actually terminates
/// capture; this just needs to be larger than any function this
/// rewriter will plausibly be pointed at.
const DEFAULT_MAX_SCAN_BYTES: usize = 1 << 16;

const DEFAULT_INSTRUCTION_BUDGET: usize = 100_000;

/// The knobs a caller may tune — the instruction budget and the byte
/// bound the decoder is allowed to scan — given an idiomatic Rust shape
/// instead of free-floating constants.
#[derive(Debug, Clone, Copy)]
pub struct RewriterConfig {
    /// Upper bound on instructions stepped per `specialize` call before
    /// capture fails with `CaptureFailure::InstructionBudgetExhausted`.
    pub instruction_budget: usize,
    /// Upper bound on bytes read from `fn_ptr`'s address.
    pub max_scan_bytes: usize,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        RewriterConfig {
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
            max_scan_bytes: DEFAULT_MAX_SCAN_BYTES,
        }
    }
}

/// Owns one `CodeStorage` region per successful `specialize` call plus
/// the pending argument bindings for the next call. Argument bindings
/// are one-shot: `specialize` consumes them, leaving every index
/// `Dynamic` again for the next configuration round.
pub struct Rewriter {
    bindings: BTreeMap<usize, Binding>,
    storages: Vec<CodeStorage>,
    config: RewriterConfig,
}

impl Rewriter {
    pub fn new() -> Self {
        Self::with_config(RewriterConfig::default())
    }

    pub fn with_config(config: RewriterConfig) -> Self {
        Rewriter { bindings: BTreeMap::new(), storages: Vec::new(), config }
    }

    /// Binds argument `arg_index` (0-based, System V integer order) for
    /// the next `specialize` call. Rejects an out-of-range index (>=6,
    /// no register to carry it) or a repeated binding of the same index
    /// as `Misconfiguration`, both at configuration time rather than
    /// deferring the failure to `specialize`.
    pub fn configure(&mut self, arg_index: usize, binding: Binding) -> Result<()> {
        if arg_register(arg_index).is_none() {
            return Err(RewriterError::Misconfiguration(format!(
                "argument index {arg_index} is outside the System V integer register range (0..6)"
            )));
        }
        if self.bindings.contains_key(&arg_index) {
            return Err(RewriterError::Misconfiguration(format!(
                "argument index {arg_index} is already bound"
            )));
        }
        self.bindings.insert(arg_index, binding);
        Ok(())
    }

    /// Runs decode → capture → optimize → generate over `original` and
    /// returns a function pointer with the same ABI, specialized to the
    /// bindings configured since the last call. `F` is constrained to
    /// `Copy` because it must be a bare function pointer (this is not
    /// checked beyond a size assertion — passing anything else is
    /// undefined behavior on the caller's part, same as any FFI
    /// function-pointer cast).
    ///
    /// # Safety
    ///
    /// `original` must be a valid, callable function pointer whose code
    /// the rewriter is permitted to read for at least
    /// `self.config.max_scan_bytes` bytes (the scan stops earlier at the
    /// first `RET` or decode failure; this bound only needs to cover
    /// that, not the function's true end). The returned pointer is
    /// valid to call with the same signature as `original`, with any
    /// un-bound argument taking the place the caller would have passed
    /// to `original`, until this `Rewriter` is dropped.
    #[tracing::instrument(skip(self, original), fields(bindings = self.bindings.len()))]
    pub unsafe fn specialize<F: Copy>(&mut self, original: F) -> Result<F> {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<usize>(),
            "specialize expects a bare function pointer"
        );
        let base_addr: u64 = std::mem::transmute_copy::<F, usize>(&original) as u64;
        let code = std::slice::from_raw_parts(base_addr as *const u8, self.config.max_scan_bytes);

        let gpr_bindings = static_bindings(&self.bindings);

        tracing::debug!(address = base_addr, "capturing");
        let trace = Emulator::new(code, base_addr, gpr_bindings).with_budget(self.config.instruction_budget).run()?;
        tracing::debug!(instructions = trace.len(), "captured trace");

        let optimized = optimizer::optimize(&trace);
        tracing::debug!(instructions = optimized.len(), "optimized trace");

        let estimate = optimized.len() * 16 + 16;
        let mut storage = CodeStorage::allocate(estimate)?;
        let entry = codegen::generate(&optimized, &mut storage)?;
        tracing::debug!(entry, "generated specialization");

        self.bindings.clear();
        self.storages.push(storage);
        Ok(std::mem::transmute_copy::<u64, F>(&entry))
    }
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases every `CodeStorage` region this instance ever allocated.
/// Invalidates every function pointer this `Rewriter` has ever returned
/// from `specialize` — the host must not call into them afterward; this
/// type keeps no internal reference count.
impl Drop for Rewriter {
    fn drop(&mut self) {
        self.storages.clear();
    }
}

fn static_bindings(bindings: &BTreeMap<usize, Binding>) -> Vec<(Register, u64)> {
    bindings
        .iter()
        .filter_map(|(&index, binding)| match binding {
            Binding::Static(value) => arg_register(index).map(|reg| (reg, *value)),
            Binding::Dynamic => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_rejects_out_of_range_index() {
        let mut r = Rewriter::new();
        let err = r.configure(6, Binding::Dynamic).unwrap_err();
        assert!(matches!(err, RewriterError::Misconfiguration(_)));
    }

    #[test]
    fn configure_rejects_repeated_binding() {
        let mut r = Rewriter::new();
        r.configure(0, Binding::Static(3)).unwrap();
        let err = r.configure(0, Binding::Dynamic).unwrap_err();
        assert!(matches!(err, RewriterError::Misconfiguration(_)));
    }

    #[test]
    fn configure_accepts_all_six_integer_slots() {
        let mut r = Rewriter::new();
        for i in 0..6 {
            r.configure(i, Binding::Dynamic).unwrap();
        }
    }

    /// Writes raw machine code into its own executable region so tests
    /// can hand `specialize` a real, callable function pointer without
    /// depending on whatever a host compiler happens to emit for a Rust
    /// source function. The returned `CodeStorage` must outlive every
    /// call through the returned address.
    fn callable_from_bytes(bytes: &[u8]) -> (CodeStorage, u64) {
        // Allocated at the default `max_scan_bytes` so the region
        // genuinely satisfies `specialize`'s safety precondition, even
        // though the capturing emulator only ever reads up to the
        // trailing `ret`.
        let mut storage = CodeStorage::allocate(RewriterConfig::default().max_scan_bytes).unwrap();
        storage.reserve(bytes.len()).unwrap();
        storage.reserved_slice_mut().copy_from_slice(bytes);
        storage.commit(bytes.len()).unwrap();
        let base = storage.finalize_executable().unwrap();
        (storage, base)
    }

    #[test]
    fn specialize_identity_ret() {
        // A bare RET specializes to itself.
        let (_original, base) = callable_from_bytes(&[0xC3]);
        let original: extern "C" fn() = unsafe { std::mem::transmute(base as *const ()) };
        let mut r = Rewriter::new();
        let specialized: extern "C" fn() = unsafe { r.specialize(original) }.unwrap();
        specialized();
    }

    #[test]
    fn specialize_round_trips_a_frame_pointer_prologue() {
        // push rbp; mov rbp, rsp; pop rbp; ret has no argument-dependent
        // behavior, but rbp starts Dynamic (it is never an argument
        // register), so the emulator captures the prologue verbatim
        // rather than folding it; the generated function still behaves
        // identically regardless of bindings.
        let (_original, base) = callable_from_bytes(&[0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3]);
        let original: extern "C" fn() = unsafe { std::mem::transmute(base as *const ()) };
        let mut r = Rewriter::new();
        let specialized: extern "C" fn() = unsafe { r.specialize(original) }.unwrap();
        specialized();
    }

    #[test]
    fn specialize_adds_bound_static_argument() {
        // f(x, y) = x + y, bytes `lea rax, [rdi+rsi]; ret`, with x
        // (rdi, arg 0) bound to 3 specializes to a function of y alone
        // that returns y + 3.
        let (_original, base) = callable_from_bytes(&[0x48, 0x8D, 0x04, 0x37, 0xC3]);
        let original: extern "C" fn(u64, u64) -> u64 = unsafe { std::mem::transmute(base as *const ()) };
        let mut r = Rewriter::new();
        r.configure(0, Binding::Static(3)).unwrap();
        let specialized: extern "C" fn(u64, u64) -> u64 = unsafe { r.specialize(original) }.unwrap();
        // The specialized pointer keeps the original ABI: the bound
        // first argument still occupies its System V slot in every
        // call, the generated body just never reads it.
        assert_eq!(specialized(999, 4), 7);
        assert_eq!(specialized(999, 100), 103);
    }

    #[test]
    fn drop_frees_every_storage_region_the_instance_allocated() {
        let (_original, base) = callable_from_bytes(&[0xC3]);
        let original: extern "C" fn() = unsafe { std::mem::transmute(base as *const ()) };
        let mut r = Rewriter::new();
        unsafe {
            r.specialize(original).unwrap();
            r.specialize(original).unwrap();
        }
        assert_eq!(r.storages.len(), 2);
        drop(r);
    }
}
