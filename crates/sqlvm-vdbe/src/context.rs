//! Per-run interpreter state and the handler return protocol.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use sqlvm_error::SqlvmError;

/// Cross-thread interrupt flag shared by a connection and its programs.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every running program on the connection to stop at its next
    /// loop back-edge.
    pub fn interrupt(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Why the interpreter gives control back to the caller.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// A result row is ready; resume at the next instruction.
    Row,
    /// The program halted normally.
    Done,
    /// A lock is held elsewhere; resume at the same instruction.
    Busy,
    /// The halt routine itself failed the program (commit-time checks).
    Failed(SqlvmError),
}

/// What a handler asks the trampoline to do next.
#[derive(Debug)]
pub(crate) enum ControlTransfer {
    Continue,
    JumpTo(usize),
    Suspend(Outcome),
}

/// Counters and scratch state of one program run.
#[derive(Debug)]
pub(crate) struct ExecContext {
    pub n_vm_step: u64,
    pub last_rowid: i64,
    /// Result of the last `Compare`.
    pub i_compare: Ordering,
    /// Step count at which the progress handler is next consulted.
    pub progress_limit: u64,
    /// Column order for the next `Compare` carrying `P5_PERMUTE`.
    pub permutation: Option<Arc<[u32]>>,
    pub interrupt: InterruptHandle,
    /// Row-cache counter; a cursor cache is valid only while it matches.
    pub cache_ctr: u32,
    /// Decode generation stamped on ephemeral buffers.
    pub row_generation: u64,
}

impl ExecContext {
    pub fn new(interrupt: InterruptHandle) -> Self {
        Self {
            n_vm_step: 0,
            last_rowid: 0,
            i_compare: Ordering::Equal,
            progress_limit: u64::MAX,
            permutation: None,
            interrupt,
            cache_ctr: 1,
            row_generation: 0,
        }
    }

    /// Arm the progress check for `n_ops`-instruction intervals.
    pub fn arm_progress(&mut self, n_ops: u64) {
        self.progress_limit = if n_ops == 0 {
            u64::MAX
        } else {
            self.n_vm_step + n_ops - (self.n_vm_step % n_ops)
        };
    }

    /// Invalidate every cursor's row cache.
    pub fn bump_cache(&mut self) {
        self.cache_ctr = self.cache_ctr.wrapping_add(1).max(1);
    }

    pub fn next_generation(&mut self) -> u64 {
        self.row_generation += 1;
        self.row_generation
    }
}
