// Heap frame stack for sub-program execution.
//
// `Program` never recurses on the Rust call stack: the caller's register
// file, cursors and pc move into a `VdbeFrame` pushed onto a `Vec`, and the
// sub-program runs in fresh state. Depth is bounded by `max_frame_depth`;
// a memory budget caps the bytes held by all saved register files together.

use std::sync::Arc;

use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::{Mem, VdbeProgram};

use crate::cursor::VdbeCursor;

/// Caller state saved while a sub-program runs.
#[derive(Debug)]
pub struct VdbeFrame {
    /// The caller's program.
    pub program: Arc<VdbeProgram>,
    /// Address of the `Program` instruction in the caller.
    pub saved_pc: usize,
    /// The caller's register file.
    pub registers: Vec<Mem>,
    /// The caller's cursor table.
    pub cursors: Vec<Option<VdbeCursor>>,
    pub once_flags: Vec<bool>,
    /// Change counter and last rowid the caller resumes with.
    pub n_change: i64,
    pub last_rowid: i64,
    /// First caller register visible to `Param`.
    pub param_base: usize,
    /// Where the caller resumes after a `Halt` with IGNORE.
    pub ignore_target: usize,
}

impl VdbeFrame {
    /// Estimated bytes held by this frame.
    pub fn estimated_memory(&self) -> usize {
        std::mem::size_of::<Self>() + register_file_bytes(&self.registers)
    }
}

/// Bytes a register file occupies, counting string and blob contents.
pub fn register_file_bytes(registers: &[Mem]) -> usize {
    registers
        .iter()
        .map(|m| std::mem::size_of::<Mem>() + m.byte_len())
        .sum()
}

/// Stack of suspended callers, innermost last.
///
/// Enforces two independent limits:
/// 1. `max_depth`: maximum nesting depth.
/// 2. `memory_budget`: total estimated bytes across all saved frames.
#[derive(Debug)]
pub struct FrameStack {
    frames: Vec<(VdbeFrame, usize)>,
    max_depth: usize,
    memory_budget: usize,
    current_memory: usize,
}

impl FrameStack {
    pub fn new(max_depth: usize, memory_budget: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
            memory_budget,
            current_memory: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current_memory(&self) -> usize {
        self.current_memory
    }

    /// Check that one more frame of `cost` bytes fits, without pushing.
    pub fn check_capacity(&self, cost: usize) -> Result<()> {
        if self.frames.len() >= self.max_depth {
            return Err(SqlvmError::Generic(format!(
                "too many levels of trigger recursion (max {})",
                self.max_depth
            )));
        }
        if self.current_memory.saturating_add(cost) > self.memory_budget {
            return Err(SqlvmError::OutOfMemory);
        }
        Ok(())
    }

    pub fn push_frame(&mut self, frame: VdbeFrame) -> Result<()> {
        let cost = frame.estimated_memory();
        self.check_capacity(cost)?;
        self.current_memory += cost;
        self.frames.push((frame, cost));
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Option<VdbeFrame> {
        let (frame, cost) = self.frames.pop()?;
        self.current_memory = self.current_memory.saturating_sub(cost);
        Some(frame)
    }

    pub fn top(&self) -> Option<&VdbeFrame> {
        self.frames.last().map(|(f, _)| f)
    }

    /// The outermost frame, which holds the top-level program's state.
    pub fn root(&self) -> Option<&VdbeFrame> {
        self.frames.first().map(|(f, _)| f)
    }

    pub fn root_mut(&mut self) -> Option<&mut VdbeFrame> {
        self.frames.first_mut().map(|(f, _)| f)
    }

    /// Drop every frame and hand back the outermost one (cleanup on error).
    pub fn unwind_all(&mut self) -> Option<VdbeFrame> {
        let mut outermost = None;
        while let Some(frame) = self.pop_frame() {
            outermost = Some(frame);
        }
        outermost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlvm_types::ProgramBuilder;

    fn frame(saved_pc: usize, registers: usize) -> VdbeFrame {
        let program = ProgramBuilder::new().finish().unwrap();
        VdbeFrame {
            program: Arc::new(program),
            saved_pc,
            registers: (0..registers).map(|_| Mem::Null).collect(),
            cursors: Vec::new(),
            once_flags: Vec::new(),
            n_change: 0,
            last_rowid: 0,
            param_base: 0,
            ignore_target: 0,
        }
    }

    // ── depth limit ─────────────────────────────────────────────────────
    #[test]
    fn test_depth_limit() {
        let mut stack = FrameStack::new(3, usize::MAX);
        for pc in 0..3 {
            stack.push_frame(frame(pc, 4)).unwrap();
        }
        let err = stack.push_frame(frame(3, 4)).unwrap_err();
        assert!(err.to_string().contains("too many levels"), "{err}");
        assert_eq!(stack.depth(), 3);
    }

    // ── memory budget ───────────────────────────────────────────────────
    #[test]
    fn test_memory_budget() {
        let probe = frame(0, 100).estimated_memory();
        let mut stack = FrameStack::new(10, probe * 2);
        stack.push_frame(frame(0, 100)).unwrap();
        stack.push_frame(frame(1, 100)).unwrap();
        assert!(matches!(
            stack.push_frame(frame(2, 100)),
            Err(SqlvmError::OutOfMemory)
        ));
        assert_eq!(stack.current_memory(), probe * 2);
    }

    // ── unwind ──────────────────────────────────────────────────────────
    #[test]
    fn test_unwind_returns_outermost() {
        let mut stack = FrameStack::new(10, usize::MAX);
        stack.push_frame(frame(7, 1)).unwrap();
        stack.push_frame(frame(9, 1)).unwrap();
        assert_eq!(stack.top().unwrap().saved_pc, 9);
        assert_eq!(stack.root().unwrap().saved_pc, 7);
        let outer = stack.unwind_all().unwrap();
        assert_eq!(outer.saved_pc, 7);
        assert!(stack.is_empty());
        assert_eq!(stack.current_memory(), 0);
    }
}
