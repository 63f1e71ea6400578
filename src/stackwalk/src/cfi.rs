//! Call-frame information: data-driven recovery of a caller's registers.
//!
//! A rule set covers one address range of code and maps each recoverable
//! register of the *caller* to a small postfix program evaluated against the
//! *callee's* known registers and stack memory. Two pseudo-registers exist
//! only as rule targets: the canonical frame address (the caller's stack
//! pointer from before the call) and the return address. Both must have
//! rules; everything else is optional.
//!
//! Rules are fully typed: targets and operands name registers through the
//! architecture descriptor's closed id space, so evaluation never looks at
//! a string. The text form accepted by [`CfiRuleSet::parse`] exists for the
//! symbol tooling that produces rules, and is resolved against a descriptor
//! at parse time.

use std::ops::Range;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::arch::{ArchDescriptor, RegisterId};
use crate::context::RegisterContext;
use crate::memory::MemoryRegion;

/// What a rule recovers: an architectural register of the caller, or one of
/// the two synthetic targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfiTarget {
    Register(RegisterId),
    /// Canonical frame address; becomes the caller's stack pointer when no
    /// rule sets it directly.
    Cfa,
    /// Return address; becomes the caller's program counter when no rule
    /// sets it directly.
    Ra,
}

/// One token of a postfix recovery program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiOp {
    /// Push a constant (sign-extended, then truncated to the word size).
    Const(i64),
    /// Push the callee's value for this register; fails if unknown.
    Callee(RegisterId),
    /// Push the already-computed CFA; fails while computing the CFA itself.
    Cfa,
    /// The value is explicitly unrecoverable.
    Undef,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    /// Truncate lhs down to a multiple of rhs (rhs must be a power of two).
    Align,
    /// Pop an address, push the machine word stored there.
    Deref,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CfiParseError {
    #[error("unknown register {0:?}")]
    UnknownRegister(String),
    #[error("unrecognized token {0:?}")]
    UnrecognizedToken(String),
    #[error("rule for {0:?} has an empty expression")]
    MissingExpression(String),
    #[error("expression tokens before the first rule target")]
    MissingTarget,
}

/// A postfix recovery program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfiExpr {
    ops: SmallVec<[CfiOp; 8]>,
}

impl CfiExpr {
    pub fn new(ops: impl IntoIterator<Item = CfiOp>) -> CfiExpr {
        CfiExpr {
            ops: ops.into_iter().collect(),
        }
    }

    /// Parse one expression from breakpad-style postfix text, e.g.
    /// `"$rsp 8 +"` or `".cfa 8 - ^"`. Register operands may be written
    /// `$name` or bare `name`; either way they must exist in `arch`'s table.
    pub fn parse(arch: &ArchDescriptor, text: &str) -> Result<CfiExpr, CfiParseError> {
        let mut ops = SmallVec::new();
        for token in text.split_ascii_whitespace() {
            ops.push(parse_op(arch, token)?);
        }
        Ok(CfiExpr { ops })
    }

    /// Evaluate against the callee's state. `None` means this expression
    /// produced no value: an operand was unknown, a memory read failed, or
    /// the program was malformed. The caller decides whether that is fatal.
    fn eval<M>(
        &self,
        callee: &RegisterContext,
        cfa: Option<u64>,
        memory: &M,
    ) -> Option<u64>
    where
        M: MemoryRegion + ?Sized,
    {
        let word = callee.arch().word_size;
        let mut stack: SmallVec<[u64; 8]> = SmallVec::new();
        for &op in &self.ops {
            match op {
                CfiOp::Const(v) => stack.push(word.truncate(v as u64)),
                CfiOp::Callee(reg) => stack.push(callee.get(reg)?),
                CfiOp::Cfa => stack.push(cfa?),
                CfiOp::Undef => return None,
                CfiOp::Deref => {
                    let addr = stack.pop()?;
                    stack.push(memory.read_word(addr, word)?);
                }
                CfiOp::Add | CfiOp::Sub | CfiOp::Mul | CfiOp::Div | CfiOp::Rem | CfiOp::Align => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    let value = match op {
                        CfiOp::Add => lhs.wrapping_add(rhs),
                        CfiOp::Sub => lhs.wrapping_sub(rhs),
                        CfiOp::Mul => lhs.wrapping_mul(rhs),
                        CfiOp::Div => {
                            if rhs == 0 {
                                return None;
                            }
                            lhs / rhs
                        }
                        CfiOp::Rem => {
                            if rhs == 0 {
                                return None;
                            }
                            lhs % rhs
                        }
                        CfiOp::Align => {
                            if !rhs.is_power_of_two() {
                                return None;
                            }
                            lhs & !(rhs - 1)
                        }
                        _ => unreachable!(),
                    };
                    stack.push(word.truncate(value));
                }
            }
        }
        // a valid program leaves exactly its result
        if stack.len() == 1 {
            stack.pop()
        } else {
            None
        }
    }
}

fn parse_op(arch: &ArchDescriptor, token: &str) -> Result<CfiOp, CfiParseError> {
    Ok(match token {
        "+" => CfiOp::Add,
        "-" => CfiOp::Sub,
        "*" => CfiOp::Mul,
        "/" => CfiOp::Div,
        "%" => CfiOp::Rem,
        "@" => CfiOp::Align,
        "^" => CfiOp::Deref,
        ".cfa" => CfiOp::Cfa,
        ".undef" => CfiOp::Undef,
        _ => {
            if let Some(name) = token.strip_prefix('$') {
                let reg = arch
                    .register_by_name(name)
                    .ok_or_else(|| CfiParseError::UnknownRegister(name.to_owned()))?;
                CfiOp::Callee(reg)
            } else if let Ok(value) = token.parse::<i64>() {
                CfiOp::Const(value)
            } else if let Some(reg) = arch.register_by_name(token) {
                // arm-style bare register name
                CfiOp::Callee(reg)
            } else {
                return Err(CfiParseError::UnrecognizedToken(token.to_owned()));
            }
        }
    })
}

/// The caller register values one rule-set evaluation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerRegisters {
    pub cfa: u64,
    pub ra: u64,
    regs: FxHashMap<RegisterId, u64>,
}

impl CallerRegisters {
    pub fn get(&self, reg: RegisterId) -> Option<u64> {
        self.regs.get(&reg).copied()
    }
}

/// The unwind rules covering one address range.
#[derive(Debug, Clone, PartialEq)]
pub struct CfiRuleSet {
    range: Range<u64>,
    rules: FxHashMap<CfiTarget, CfiExpr>,
}

impl CfiRuleSet {
    pub fn new(range: Range<u64>) -> CfiRuleSet {
        CfiRuleSet {
            range,
            rules: FxHashMap::default(),
        }
    }

    /// Add or replace the rule for `target`. Rule records are incremental
    /// updates, so for a duplicate target the later rule wins.
    pub fn insert(&mut self, target: CfiTarget, expr: CfiExpr) {
        self.rules.insert(target, expr);
    }

    /// Parse a whole record of `TARGET: EXPR` pairs, e.g.
    /// `".cfa: $rsp 8 + .ra: .cfa -8 + ^"`.
    pub fn parse(
        arch: &ArchDescriptor,
        range: Range<u64>,
        text: &str,
    ) -> Result<CfiRuleSet, CfiParseError> {
        let mut set = CfiRuleSet::new(range);
        let mut target: Option<(CfiTarget, String)> = None;
        let mut ops: SmallVec<[CfiOp; 8]> = SmallVec::new();
        for token in text.split_ascii_whitespace() {
            if let Some(key) = token.strip_suffix(':') {
                // a new target ends the previous expression
                if let Some((prev, name)) = target.take() {
                    if ops.is_empty() {
                        return Err(CfiParseError::MissingExpression(name));
                    }
                    set.insert(prev, CfiExpr::new(std::mem::take(&mut ops)));
                }
                target = Some((parse_target(arch, key)?, key.to_owned()));
            } else {
                if target.is_none() {
                    return Err(CfiParseError::MissingTarget);
                }
                ops.push(parse_op(arch, token)?);
            }
        }
        if let Some((prev, name)) = target {
            if ops.is_empty() {
                return Err(CfiParseError::MissingExpression(name));
            }
            set.insert(prev, CfiExpr::new(ops));
        }
        Ok(set)
    }

    pub fn range(&self) -> &Range<u64> {
        &self.range
    }

    pub fn covers(&self, addr: u64) -> bool {
        self.range.contains(&addr)
    }

    /// Evaluate every rule against the callee's state.
    ///
    /// The CFA rule runs first (it cannot reference itself), then the return
    /// address and the per-register rules with the CFA in scope. A failing
    /// per-register rule only loses that register; a missing or failing CFA
    /// or RA rule means this method has nothing usable to say.
    pub fn recover_caller_registers<M>(
        &self,
        callee: &RegisterContext,
        memory: &M,
    ) -> Option<CallerRegisters>
    where
        M: MemoryRegion + ?Sized,
    {
        let Some(cfa_expr) = self.rules.get(&CfiTarget::Cfa) else {
            trace!("cfi record has no cfa rule");
            return None;
        };
        let Some(ra_expr) = self.rules.get(&CfiTarget::Ra) else {
            trace!("cfi record has no ra rule");
            return None;
        };

        let cfa = cfa_expr.eval(callee, None, memory)?;
        let ra = ra_expr.eval(callee, Some(cfa), memory)?;

        let mut regs = FxHashMap::default();
        for (target, expr) in &self.rules {
            if let CfiTarget::Register(reg) = *target {
                match expr.eval(callee, Some(cfa), memory) {
                    Some(value) => {
                        regs.insert(reg, value);
                    }
                    None => {
                        // lose this one register, keep the rest
                        trace!(
                            reg = callee.arch().register_name(reg),
                            "cfi register rule produced no value"
                        );
                    }
                }
            }
        }
        Some(CallerRegisters { cfa, ra, regs })
    }
}

fn parse_target(arch: &ArchDescriptor, key: &str) -> Result<CfiTarget, CfiParseError> {
    Ok(match key {
        ".cfa" => CfiTarget::Cfa,
        ".ra" => CfiTarget::Ra,
        _ => {
            let name = key.strip_prefix('$').unwrap_or(key);
            let reg = arch
                .register_by_name(name)
                .ok_or_else(|| CfiParseError::UnknownRegister(name.to_owned()))?;
            CfiTarget::Register(reg)
        }
    })
}

/// Where the walker gets rules from: keyed by lookup address, backed by
/// debug/symbol data maintained outside this crate.
pub trait CfiRuleSource {
    fn rules_for(&self, addr: u64) -> Option<&CfiRuleSet>;
}

/// Rule sets sorted by range start, resolved by binary search. Ranges must
/// not overlap.
#[derive(Debug, Clone, Default)]
pub struct CfiRuleTable {
    sets: Vec<CfiRuleSet>,
}

impl CfiRuleTable {
    pub fn new() -> CfiRuleTable {
        CfiRuleTable::default()
    }

    pub fn insert(&mut self, set: CfiRuleSet) {
        let at = self
            .sets
            .partition_point(|s| s.range.start < set.range.start);
        self.sets.insert(at, set);
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl CfiRuleSource for CfiRuleTable {
    fn rules_for(&self, addr: u64) -> Option<&CfiRuleSet> {
        let at = self.sets.partition_point(|s| s.range.start <= addr);
        let set = self.sets[..at].last()?;
        set.covers(addr).then_some(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ARM, X86_64};
    use crate::context::RegisterContext;
    use crate::memory::CapturedMemory;

    fn x86_callee(rsp: u64, extra: &[(&str, u64)]) -> RegisterContext {
        let mut ctx = RegisterContext::empty(&X86_64);
        ctx.set_sp(rsp);
        for &(name, value) in extra {
            ctx.set(X86_64.register_by_name(name).unwrap(), value);
        }
        ctx
    }

    fn empty_memory() -> CapturedMemory {
        CapturedMemory::new(0, vec![])
    }

    #[test]
    fn doc_example_recovers_ra_and_saved_register() {
        // cfa = callee rsp + 8; ra at [cfa - 8]; caller rbx at [cfa - 16]
        let rules = CfiRuleSet::parse(
            &X86_64,
            0x1000..0x1100,
            ".cfa: $rsp 8 + .ra: .cfa -8 + ^ $rbx: .cfa -16 + ^",
        )
        .unwrap();

        const RA: u64 = 0x4100_0000_0000_2233;
        const RBX: u64 = 0xfeed_0000_0000_5566;
        let mut stack = vec![0u8; 0x20];
        stack[0x18..0x20].copy_from_slice(&RA.to_le_bytes());
        stack[0x10..0x18].copy_from_slice(&RBX.to_le_bytes());
        let memory = CapturedMemory::new(0x7000, stack);

        let callee = x86_callee(0x7018, &[]);
        let caller = rules.recover_caller_registers(&callee, &memory).unwrap();
        assert_eq!(caller.cfa, 0x7020);
        assert_eq!(caller.ra, RA);
        assert_eq!(
            caller.get(X86_64.register_by_name("rbx").unwrap()),
            Some(RBX)
        );
    }

    #[test]
    fn operators() {
        let callee = x86_callee(32, &[]);
        let memory = empty_memory();
        let eval = |rules: &str| {
            CfiRuleSet::parse(&X86_64, 0..1, rules)
                .unwrap()
                .recover_caller_registers(&callee, &memory)
        };

        let caller = eval(".cfa: 1 2 + .ra: 5 3 -").unwrap();
        assert_eq!(caller.cfa, 3);
        assert_eq!(caller.ra, 2);

        let caller = eval(".cfa: 5 3 * .ra: 7 2 /").unwrap();
        assert_eq!(caller.cfa, 15);
        assert_eq!(caller.ra, 3);

        let caller = eval(".cfa: 7 3 % .ra: 161 8 @").unwrap();
        assert_eq!(caller.cfa, 1);
        assert_eq!(caller.ra, 160);

        let caller = eval(".cfa: $rsp 8 + .ra: .cfa 4 -").unwrap();
        assert_eq!(caller.cfa, 40);
        assert_eq!(caller.ra, 36);
    }

    #[test]
    fn arithmetic_wraps_at_word_size() {
        let memory = empty_memory();

        // 32-bit: -4 is 0xfffffffc and addition wraps
        let mut callee = RegisterContext::empty(&ARM);
        callee.set_sp(8);
        let rules = CfiRuleSet::parse(&ARM, 0..1, ".cfa: -4 0 + .ra: -4 8 +").unwrap();
        let caller = rules.recover_caller_registers(&callee, &memory).unwrap();
        assert_eq!(caller.cfa, 0xffff_fffc);
        assert_eq!(caller.ra, 4);

        // 64-bit keeps the full width
        let callee = x86_callee(8, &[]);
        let rules = CfiRuleSet::parse(&X86_64, 0..1, ".cfa: -4 0 + .ra: 1").unwrap();
        let caller = rules.recover_caller_registers(&callee, &memory).unwrap();
        assert_eq!(caller.cfa, (-4i64) as u64);
    }

    #[test]
    fn malformed_expressions_produce_no_result() {
        let callee = x86_callee(32, &[]);
        let memory = empty_memory();
        let eval = |rules: &str| {
            CfiRuleSet::parse(&X86_64, 0..1, rules)
                .unwrap()
                .recover_caller_registers(&callee, &memory)
        };

        // operand underflow
        assert_eq!(eval(".cfa: 1 + .ra: 8"), None);
        // division by zero
        assert_eq!(eval(".cfa: 1 0 / .ra: 8"), None);
        assert_eq!(eval(".cfa: 1 0 % .ra: 8"), None);
        // align by zero / non-power-of-two
        assert_eq!(eval(".cfa: 1 0 @ .ra: 8"), None);
        assert_eq!(eval(".cfa: 1 3 @ .ra: 8"), None);
        // leftover junk on the value stack
        assert_eq!(eval(".cfa: 8 12 .ra: 8"), None);
        // deref outside the captured image
        assert_eq!(eval(".cfa: 2000 ^ .ra: 8"), None);
        // explicit undef
        assert_eq!(eval(".cfa: .undef .ra: 8"), None);
        assert_eq!(eval(".cfa: 8 .ra: .undef"), None);
        // callee register not captured
        assert_eq!(eval(".cfa: $rax 8 + .ra: 8"), None);
    }

    #[test]
    fn cfa_cannot_reference_itself() {
        let callee = x86_callee(32, &[]);
        let rules = CfiRuleSet::parse(&X86_64, 0..1, ".cfa: .cfa 8 + .ra: 8").unwrap();
        assert_eq!(rules.recover_caller_registers(&callee, &empty_memory()), None);
    }

    #[test]
    fn cfa_and_ra_rules_are_mandatory() {
        let callee = x86_callee(32, &[]);
        let memory = empty_memory();

        let no_ra = CfiRuleSet::parse(&X86_64, 0..1, ".cfa: $rsp 8 +").unwrap();
        assert_eq!(no_ra.recover_caller_registers(&callee, &memory), None);

        let no_cfa = CfiRuleSet::parse(&X86_64, 0..1, ".ra: 8").unwrap();
        assert_eq!(no_cfa.recover_caller_registers(&callee, &memory), None);
    }

    #[test]
    fn failing_register_rule_is_dropped_alone() {
        let callee = x86_callee(32, &[]);
        let rules =
            CfiRuleSet::parse(&X86_64, 0..1, ".cfa: 8 .ra: 12 $rbx: 1 0 / $r12: 7").unwrap();
        let caller = rules
            .recover_caller_registers(&callee, &empty_memory())
            .unwrap();
        assert_eq!(caller.get(X86_64.register_by_name("rbx").unwrap()), None);
        assert_eq!(caller.get(X86_64.register_by_name("r12").unwrap()), Some(7));
    }

    #[test]
    fn duplicate_rules_keep_the_later_one() {
        let callee = x86_callee(32, &[]);
        let rules =
            CfiRuleSet::parse(&X86_64, 0..1, ".cfa: 1 .cfa: 2 .ra: 3 .ra: 4 $rbx: 5 $rbx: 6")
                .unwrap();
        let caller = rules
            .recover_caller_registers(&callee, &empty_memory())
            .unwrap();
        assert_eq!(caller.cfa, 2);
        assert_eq!(caller.ra, 4);
        assert_eq!(caller.get(X86_64.register_by_name("rbx").unwrap()), Some(6));
    }

    #[test]
    fn arm_style_bare_register_names() {
        let mut callee = RegisterContext::empty(&ARM);
        callee.set_sp(0x100);
        callee.set(ARM.register_by_name("r4").unwrap(), 0x55);
        let rules = CfiRuleSet::parse(&ARM, 0..1, ".cfa: sp 16 + .ra: r4 8 + r5: r4").unwrap();
        let caller = rules
            .recover_caller_registers(&callee, &empty_memory())
            .unwrap();
        assert_eq!(caller.cfa, 0x110);
        assert_eq!(caller.ra, 0x5d);
        assert_eq!(caller.get(ARM.register_by_name("r5").unwrap()), Some(0x55));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            CfiRuleSet::parse(&X86_64, 0..1, ".cfa: $nope 8 + .ra: 8"),
            Err(CfiParseError::UnknownRegister("nope".to_owned()))
        );
        assert_eq!(
            CfiRuleSet::parse(&X86_64, 0..1, "$kitties: 16 .cfa: 8 .ra: 8"),
            Err(CfiParseError::UnknownRegister("kitties".to_owned()))
        );
        assert_eq!(
            CfiRuleSet::parse(&X86_64, 0..1, ".cfa: 8 16 ! .ra: 8"),
            Err(CfiParseError::UnrecognizedToken("!".to_owned()))
        );
        assert_eq!(
            CfiRuleSet::parse(&X86_64, 0..1, "8 16 + .cfa: 8 .ra: 8"),
            Err(CfiParseError::MissingTarget)
        );
        assert_eq!(
            CfiRuleSet::parse(&X86_64, 0..1, ".cfa: 8 .ra: 8 $rax:"),
            Err(CfiParseError::MissingExpression("$rax".to_owned()))
        );
        assert_eq!(
            CfiRuleSet::parse(&X86_64, 0..1, ".cfa: .ra: 8"),
            Err(CfiParseError::MissingExpression(".cfa".to_owned()))
        );
    }

    #[test]
    fn table_lookup_by_address() {
        let mut table = CfiRuleTable::new();
        table.insert(CfiRuleSet::parse(&X86_64, 0x2000..0x2040, ".cfa: 2 .ra: 2").unwrap());
        table.insert(CfiRuleSet::parse(&X86_64, 0x1000..0x1040, ".cfa: 1 .ra: 1").unwrap());

        assert!(table.rules_for(0xfff).is_none());
        assert_eq!(table.rules_for(0x1000).unwrap().range(), &(0x1000..0x1040));
        assert_eq!(table.rules_for(0x103f).unwrap().range(), &(0x1000..0x1040));
        // range end is exclusive, and the gap between ranges has no rules
        assert!(table.rules_for(0x1040).is_none());
        assert!(table.rules_for(0x1fff).is_none());
        assert_eq!(table.rules_for(0x2020).unwrap().range(), &(0x2000..0x2040));
        assert!(table.rules_for(0x2040).is_none());
    }
}
