//! Stack scanning: the last-resort caller recovery.
//!
//! With no CFI covering an address, the only thing left is to look at raw
//! stack memory and hope a saved return address is sitting near the top.
//! Scanning can say nothing about any register other than where the
//! candidate was found (the stack pointer) and what it was (the program
//! counter).

use tracing::trace;

use crate::arch::WordSize;
use crate::memory::MemoryRegion;

/// Decides whether a scanned-up value plausibly points at code. Backed by
/// the module map of the crashed process, which lives outside this crate.
pub trait CodeRegions {
    fn contains_code(&self, addr: u64) -> bool;
}

impl<F> CodeRegions for F
where
    F: Fn(u64) -> bool,
{
    fn contains_code(&self, addr: u64) -> bool {
        self(addr)
    }
}

/// How many words above the callee's stack pointer to inspect before giving
/// up. Deep scans find garbage more often than callers.
pub const DEFAULT_SCAN_WINDOW_WORDS: u64 = 30;

/// Search `[sp, sp + window_words * word)` for a plausible return address.
/// Returns the address the word was found at and its value. A failed read
/// means the captured stack ended; there is nothing beyond it to inspect.
pub(crate) fn scan_for_return_address<M, C>(
    memory: &M,
    code: &C,
    sp: u64,
    word: WordSize,
    window_words: u64,
) -> Option<(u64, u64)>
where
    M: MemoryRegion + ?Sized,
    C: CodeRegions + ?Sized,
{
    for i in 0..window_words {
        let addr = sp.checked_add(i * word.bytes())?;
        let Some(value) = memory.read_word(addr, word) else {
            trace!(addr, "scan stopped at end of captured stack");
            return None;
        };
        if code.contains_code(value) {
            trace!(addr, value, "scan found plausible return address");
            return Some((addr, value));
        }
    }
    trace!(sp, window_words, "scan window exhausted");
    None
}
