//! Architecture descriptors.
//!
//! One walker drives every CPU architecture; everything per-arch lives in a
//! descriptor value: the register name table, which registers are the program
//! counter and stack pointer, which ones the calling convention makes
//! callee-saved, and the machine word size.

/// Index into an [`ArchDescriptor`]'s register table.
///
/// Only meaningful together with the descriptor that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSize {
    W32,
    W64,
}

impl WordSize {
    pub const fn bytes(self) -> u64 {
        match self {
            WordSize::W32 => 4,
            WordSize::W64 => 8,
        }
    }

    /// Truncate a value to this word size. Register values are carried as
    /// `u64` regardless of architecture; arithmetic on 32-bit targets must
    /// wrap at 32 bits.
    pub const fn truncate(self, value: u64) -> u64 {
        match self {
            WordSize::W32 => value & 0xffff_ffff,
            WordSize::W64 => value,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ArchDescriptor {
    pub name: &'static str,
    /// Register names, indexed by [`RegisterId`]. At most 64 entries so a
    /// frame's validity mask fits in one word.
    pub registers: &'static [&'static str],
    pub pc: RegisterId,
    pub sp: RegisterId,
    /// Registers the calling convention requires a callee to preserve.
    pub callee_saved: &'static [RegisterId],
    pub word_size: WordSize,
}

impl ArchDescriptor {
    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    pub fn register_ids(&self) -> impl Iterator<Item = RegisterId> {
        (0..self.registers.len() as u8).map(RegisterId)
    }

    pub fn register_name(&self, reg: RegisterId) -> &'static str {
        self.registers[reg.0 as usize]
    }

    pub fn register_by_name(&self, name: &str) -> Option<RegisterId> {
        self.registers
            .iter()
            .position(|&r| r == name)
            .map(|i| RegisterId(i as u8))
    }

    pub fn is_callee_saved(&self, reg: RegisterId) -> bool {
        self.callee_saved.contains(&reg)
    }
}

/// 32-bit ARM. r4-r11 are callee-saved per the AAPCS.
pub static ARM: ArchDescriptor = ArchDescriptor {
    name: "arm",
    registers: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp",
        "lr", "pc",
    ],
    pc: RegisterId(15),
    sp: RegisterId(13),
    callee_saved: &[
        RegisterId(4),
        RegisterId(5),
        RegisterId(6),
        RegisterId(7),
        RegisterId(8),
        RegisterId(9),
        RegisterId(10),
        RegisterId(11),
    ],
    word_size: WordSize::W32,
};

/// AArch64. x19-x28 and the frame pointer are callee-saved per the AAPCS64.
pub static AARCH64: ArchDescriptor = ArchDescriptor {
    name: "aarch64",
    registers: &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "pc",
    ],
    pc: RegisterId(32),
    sp: RegisterId(31),
    callee_saved: &[
        RegisterId(19),
        RegisterId(20),
        RegisterId(21),
        RegisterId(22),
        RegisterId(23),
        RegisterId(24),
        RegisterId(25),
        RegisterId(26),
        RegisterId(27),
        RegisterId(28),
        RegisterId(29),
    ],
    word_size: WordSize::W64,
};

/// x86-64. rbx, rbp and r12-r15 are callee-saved per the SysV psABI.
pub static X86_64: ArchDescriptor = ArchDescriptor {
    name: "x86_64",
    registers: &[
        "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip",
    ],
    pc: RegisterId(16),
    sp: RegisterId(7),
    callee_saved: &[
        RegisterId(3),
        RegisterId(6),
        RegisterId(12),
        RegisterId(13),
        RegisterId(14),
        RegisterId(15),
    ],
    word_size: WordSize::W64,
};
