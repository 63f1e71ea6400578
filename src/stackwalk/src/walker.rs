//! The walk driver: builds frame 0 from the snapshot context, then keeps
//! asking "who called this?" until no recovery method has a usable answer.
//!
//! CFI is always tried before scanning; a scanned frame is a guess, a CFI
//! frame is (modulo bad debug info) a fact. Whatever comes back is validated
//! before it is appended: a zero program counter or a stack pointer that
//! moved backwards ends the walk. Corrupt data and the genuine root of the
//! stack are indistinguishable here, and truncating is always preferred to
//! fabricating frames.

use tracing::{debug, trace};

use crate::call_stack::{CallStack, CallStackInfo, FrameTrust, StackFrame};
use crate::cfi::{CfiRuleSet, CfiRuleSource};
use crate::context::RegisterContext;
use crate::memory::MemoryRegion;
use crate::scan::{scan_for_return_address, CodeRegions, DEFAULT_SCAN_WINDOW_WORDS};

/// Default cap on frames per walk. The validity checks bound every honest
/// stack; this bounds the dishonest ones (an attacker-controlled image can
/// present an endless strictly-increasing chain of plausible frames).
pub const STACK_DEPTH_LIMIT: usize = 128;

/// Caller-tunable walk bounds.
#[derive(Debug, Clone, Copy)]
pub struct WalkLimits {
    /// Maximum frames in the output, context frame included.
    pub max_frames: usize,
    /// Scan window, in machine words above the callee's stack pointer.
    pub scan_window_words: u64,
}

impl Default for WalkLimits {
    fn default() -> WalkLimits {
        WalkLimits {
            max_frames: STACK_DEPTH_LIMIT,
            scan_window_words: DEFAULT_SCAN_WINDOW_WORDS,
        }
    }
}

/// The one place that decides whether a recovered candidate extends the
/// stack or ends the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateDisposition {
    Append,
    EndOfStack,
}

/// Reconstruct one thread's call stack from its snapshot state.
///
/// A snapshot can be missing the thread's CPU context or its stack memory;
/// either way the walk fails for this thread only, yielding an empty stack
/// tagged with the reason. Everything else (unreadable memory, absent CFI,
/// implausible candidates) just truncates.
pub fn walk_stack<M, R, C>(
    context: Option<&RegisterContext>,
    memory: Option<&M>,
    cfi: &R,
    code: &C,
    limits: WalkLimits,
) -> CallStack
where
    M: MemoryRegion + ?Sized,
    R: CfiRuleSource + ?Sized,
    C: CodeRegions + ?Sized,
{
    let Some(context) = context else {
        debug!("cannot walk: snapshot has no cpu context for this thread");
        return CallStack::with_info(CallStackInfo::MissingContext);
    };
    let Some(memory) = memory else {
        debug!("cannot walk: snapshot has no stack memory for this thread");
        return CallStack::with_info(CallStackInfo::MissingMemory);
    };

    let mut stack = CallStack::new();
    let mut current = StackFrame::from_context(context.clone(), FrameTrust::Context);
    loop {
        let next = if stack.len() + 1 < limits.max_frames {
            get_caller_frame(&current, memory, cfi, code, &limits)
        } else {
            trace!(max_frames = limits.max_frames, "frame limit reached");
            None
        };
        stack.push(current);
        match next {
            Some(frame) => current = frame,
            None => break,
        }
    }
    stack
}

fn get_caller_frame<M, R, C>(
    last: &StackFrame,
    memory: &M,
    cfi: &R,
    code: &C,
    limits: &WalkLimits,
) -> Option<StackFrame>
where
    M: MemoryRegion + ?Sized,
    R: CfiRuleSource + ?Sized,
    C: CodeRegions + ?Sized,
{
    let candidate = cfi
        .rules_for(last.instruction)
        .and_then(|rules| get_caller_by_cfi(last, rules, memory))
        .map(|ctx| (ctx, FrameTrust::Cfi))
        .or_else(|| {
            get_caller_by_scan(last, memory, code, limits).map(|ctx| (ctx, FrameTrust::Scan))
        });
    let Some((context, trust)) = candidate else {
        trace!(
            instruction = last.instruction,
            "no method recovered a caller; end of stack"
        );
        return None;
    };

    match validate_candidate(last, &context) {
        CandidateDisposition::EndOfStack => None,
        CandidateDisposition::Append => {
            // the raw pc is a return address; back up into the call for lookup
            let pc = context.pc()?;
            Some(StackFrame {
                instruction: pc - 1,
                context,
                trust,
            })
        }
    }
}

fn validate_candidate(last: &StackFrame, candidate: &RegisterContext) -> CandidateDisposition {
    let (Some(pc), Some(sp)) = (candidate.pc(), candidate.sp()) else {
        return CandidateDisposition::EndOfStack;
    };
    if pc == 0 {
        // conventional root-of-stack marker
        trace!("candidate pc is zero; end of stack");
        return CandidateDisposition::EndOfStack;
    }
    if let Some(last_sp) = last.context.sp() {
        if sp < last_sp {
            // stacks do not grow down across a return
            trace!(sp, last_sp, "candidate sp moved backwards; end of stack");
            return CandidateDisposition::EndOfStack;
        }
    }
    CandidateDisposition::Append
}

fn get_caller_by_cfi<M>(
    last: &StackFrame,
    rules: &CfiRuleSet,
    memory: &M,
) -> Option<RegisterContext>
where
    M: MemoryRegion + ?Sized,
{
    let arch = last.context.arch();
    trace!(range = ?rules.range(), "evaluating cfi for caller of {:#x}", last.instruction);
    let recovered = rules.recover_caller_registers(&last.context, memory)?;

    let mut caller = RegisterContext::empty(arch);
    for reg in arch.register_ids() {
        if let Some(value) = recovered.get(reg) {
            caller.set(reg, value);
        } else if arch.is_callee_saved(reg) {
            // unmentioned callee-saved register: assume the callee has not
            // touched it yet and carry the value through
            if let Some(value) = last.context.get(reg) {
                caller.set(reg, value);
            }
        }
    }
    if !caller.is_valid(arch.pc) {
        caller.set_pc(recovered.ra);
    }
    if !caller.is_valid(arch.sp) {
        caller.set_sp(recovered.cfa);
    }

    // without both essentials the frame is useless
    caller.has_pc_and_sp().then_some(caller)
}

fn get_caller_by_scan<M, C>(
    last: &StackFrame,
    memory: &M,
    code: &C,
    limits: &WalkLimits,
) -> Option<RegisterContext>
where
    M: MemoryRegion + ?Sized,
    C: CodeRegions + ?Sized,
{
    let arch = last.context.arch();
    let sp = last.context.sp()?;
    let (addr, value) =
        scan_for_return_address(memory, code, sp, arch.word_size, limits.scan_window_words)?;

    // the caller's sp sits just above its saved return address; nothing else
    // about the caller can be learned by scanning
    let mut caller = RegisterContext::empty(arch);
    caller.set_pc(value);
    caller.set_sp(addr.checked_add(arch.word_size.bytes())?);
    Some(caller)
}
