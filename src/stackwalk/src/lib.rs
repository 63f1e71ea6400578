//! Post-mortem call-stack reconstruction.
//!
//! Given a CPU register snapshot and a read-only memory image captured from
//! a crashed process, rebuild the chain of call frames that led to the
//! fault, for later symbolization. There is no live process and no debugger
//! behind any of this; the inputs may be incomplete or actively corrupt, so
//! every recovery step can fail and the walk must make forward progress (or
//! stop) regardless.
//!
//! Two recovery methods, in strict preference order:
//!
//! * call-frame information ([`CfiRuleSet`]): data-driven and precise, when
//!   the symbol tooling produced rules for the address;
//! * stack scanning: a bounded search of raw stack memory for something
//!   that looks like a return address, when it didn't.
//!
//! Each reconstructed frame carries a [`FrameTrust`] saying which method
//! produced it. The engine is architecture-generic: everything per-CPU is
//! data in an [`ArchDescriptor`] (`ARM`, `AARCH64`, `X86_64` are provided).
//!
//! Snapshot parsing, module/symbol lookup and report assembly all live
//! outside this crate, behind the [`MemoryRegion`], [`CfiRuleSource`] and
//! [`CodeRegions`] traits.

mod arch;
mod call_stack;
mod cfi;
mod context;
mod memory;
mod scan;
mod walker;

pub use arch::{ArchDescriptor, RegisterId, WordSize, AARCH64, ARM, X86_64};
pub use call_stack::{CallStack, CallStackInfo, FrameTrust, StackFrame};
pub use cfi::{
    CallerRegisters, CfiExpr, CfiOp, CfiParseError, CfiRuleSet, CfiRuleSource, CfiRuleTable,
    CfiTarget,
};
pub use context::{RegisterContext, RegisterValidity};
pub use memory::{CapturedMemory, MemoryRegion};
pub use scan::{CodeRegions, DEFAULT_SCAN_WINDOW_WORDS};
pub use walker::{walk_stack, WalkLimits, STACK_DEPTH_LIMIT};
