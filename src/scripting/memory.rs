/// `scripting/memory.rs` - byte accounting for memory-limited engines
///
/// `LimitedAllocator` is the `lua_Alloc`-shaped accounting state machine: the
/// free path releases bytes with saturating subtraction, the alloc/realloc
/// path checks for arithmetic overflow and the configured cap before any byte
/// is committed. The engine's own allocator enforces the cap at allocation
/// time; this state carries the running totals and the sticky failure flags
/// the host inspects after a run.

use std::fmt;
use std::sync::{Arc, Mutex};

pub const MEM_1MB: usize = 1024 * 1024;
pub const DEFAULT_MEMORY_LIMIT: usize = MEM_1MB;

/// Shared handle: the host and its sandboxes observe one allocator state.
pub type SharedAllocator = Arc<Mutex<LimitedAllocator>>;

// ── AllocError ────────────────────────────────────────────────────────────────

/// Why an allocation request was refused. Both outcomes leave `used`
/// unchanged and set the matching sticky flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// `used_base + new_size` does not fit in `usize`.
    Overflow,
    /// The request would push usage past the configured limit.
    LimitReached,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Overflow => write!(f, "arithmetic overflow while computing memory usage"),
            AllocError::LimitReached => write!(f, "memory limit reached"),
        }
    }
}

impl std::error::Error for AllocError {}

// ── LimitedAllocator ──────────────────────────────────────────────────────────

/// Memory accounting state for one engine.
///
/// `limit == 0` disables the cap. The failure flags are sticky until
/// [`reset_error_flags`](LimitedAllocator::reset_error_flags).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitedAllocator {
    used: usize,
    limit: usize,
    limit_reached: bool,
    overflow: bool,
}

impl Default for LimitedAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

impl LimitedAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            used: 0,
            limit,
            limit_reached: false,
            overflow: false,
        }
    }

    /// No cap; accounting only.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn shared(limit: usize) -> SharedAllocator {
        Arc::new(Mutex::new(Self::new(limit)))
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_reached
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn is_limit_enabled(&self) -> bool {
        self.limit > 0
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn disable_limit(&mut self) {
        self.limit = 0;
    }

    pub fn reset_error_flags(&mut self) {
        self.limit_reached = false;
        self.overflow = false;
    }

    /// Free path: release `curr_size` bytes. The engine occasionally reports
    /// a size it never charged, so the subtraction saturates at zero instead
    /// of corrupting the counter.
    pub fn release(&mut self, curr_size: usize) {
        self.used -= self.used.min(curr_size);
    }

    /// Alloc/realloc path: replace an allocation of `curr_size` bytes with
    /// one of `new_size` bytes. Fresh allocations pass `curr_size == 0`
    /// (an engine `ptr == NULL` call). `new_size == 0` is the free path.
    ///
    /// On success returns the new `used` total. On failure `used` is
    /// unchanged and the matching sticky flag is set.
    pub fn reallocate(&mut self, curr_size: usize, new_size: usize) -> Result<usize, AllocError> {
        if new_size == 0 {
            self.release(curr_size);
            return Ok(self.used);
        }

        let used_base = self.used - self.used.min(curr_size);

        let Some(new_used) = used_base.checked_add(new_size) else {
            log::error!(
                "[lua sandbox] allocator: arithmetic overflow while computing memory usage \
                 [used: {}, requested more for: {}]",
                used_base,
                new_size,
            );
            self.overflow = true;
            return Err(AllocError::Overflow);
        };
        if self.is_limit_enabled() && new_used > self.limit {
            log::error!(
                "[lua sandbox] allocator: memory limit reached \
                 [limit: {}, used: {}, requested total: {}]",
                self.limit,
                self.used,
                new_used,
            );
            self.limit_reached = true;
            return Err(AllocError::LimitReached);
        }

        self.used = new_used;
        Ok(self.used)
    }

    /// Mirror the engine's own usage figure into the accounting state.
    pub(crate) fn sync_used(&mut self, used: usize) {
        self.used = used;
    }

    /// Record an engine-side out-of-memory failure as a sticky flag.
    pub(crate) fn note_limit_reached(&mut self) {
        self.limit_reached = true;
    }
}

/// True when `error` is (or wraps) an engine out-of-memory failure.
pub(crate) fn is_memory_error(error: &mlua::Error) -> bool {
    match error {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        mlua::Error::WithContext { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_updates_used() {
        let obj_size = 64;
        let mut alloc = LimitedAllocator::new(MEM_1MB);

        // Fresh allocation: the engine passes ptr == NULL, so any currSize is
        // ignored by the caller convention; here that means curr_size == 0.
        assert_eq!(alloc.reallocate(0, obj_size), Ok(obj_size));
        assert_eq!(alloc.used(), obj_size);

        alloc.release(obj_size);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn realloc_grow_increases_used() {
        let obj_size = 64;
        let mut alloc = LimitedAllocator::new(MEM_1MB);

        assert!(alloc.reallocate(0, obj_size).is_ok());
        assert_eq!(alloc.used(), obj_size);

        assert!(alloc.reallocate(obj_size, obj_size * 2).is_ok());
        assert_eq!(alloc.used(), obj_size * 2);

        alloc.release(obj_size * 2);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn realloc_shrink_decreases_used() {
        let mut alloc = LimitedAllocator::new(MEM_1MB);

        assert!(alloc.reallocate(0, 256).is_ok());
        assert_eq!(alloc.used(), 256);

        assert!(alloc.reallocate(256, 64).is_ok());
        assert_eq!(alloc.used(), 64);

        alloc.release(64);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn free_clamps_underflow_when_curr_size_exceeds_used() {
        let mut alloc = LimitedAllocator::new(MEM_1MB);
        assert!(alloc.reallocate(0, 8).is_ok());

        // curr_size > used must clamp to 0 without wrap-around.
        alloc.release(64);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn used_base_clamps_when_curr_size_exceeds_used() {
        let mut alloc = LimitedAllocator::new(MEM_1MB);
        assert!(alloc.reallocate(0, 8).is_ok());

        // curr_size > used: used_base becomes 0, so used == new_size after.
        assert!(alloc.reallocate(64, 32).is_ok());
        assert_eq!(alloc.used(), 32);

        alloc.release(32);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn fresh_allocation_adds_on_top_of_existing_usage() {
        let init_used = 500;
        let obj_size = 16;
        let mut alloc = LimitedAllocator::new(MEM_1MB);
        assert!(alloc.reallocate(0, init_used).is_ok());

        assert!(alloc.reallocate(0, obj_size).is_ok());
        assert_eq!(alloc.used(), init_used + obj_size);

        alloc.release(obj_size);
        assert_eq!(alloc.used(), init_used);
    }

    #[test]
    fn limit_reached_is_sticky_and_leaves_used_unchanged() {
        let limit = 64;
        let mut alloc = LimitedAllocator::new(limit);

        assert_eq!(alloc.reallocate(0, limit), Ok(limit));
        assert_eq!(alloc.used(), limit);

        assert_eq!(alloc.reallocate(limit, limit + 1), Err(AllocError::LimitReached));
        assert_eq!(alloc.used(), limit, "failed request must not change used");
        assert!(alloc.limit_reached());
        assert!(!alloc.overflow());

        alloc.release(limit);
        assert_eq!(alloc.used(), 0);
        assert!(alloc.limit_reached(), "flag stays set until explicitly cleared");

        alloc.reset_error_flags();
        assert!(!alloc.limit_reached());
    }

    #[test]
    fn overflow_is_set_when_accounting_would_wrap() {
        let mut alloc = LimitedAllocator::unlimited();
        assert!(alloc.reallocate(0, usize::MAX - 1).is_ok());

        assert_eq!(alloc.reallocate(0, 16), Err(AllocError::Overflow));
        assert!(alloc.overflow());
        assert_eq!(alloc.used(), usize::MAX - 1);
    }

    #[test]
    fn zero_limit_disables_the_cap() {
        let mut alloc = LimitedAllocator::unlimited();
        assert!(!alloc.is_limit_enabled());
        assert!(alloc.reallocate(0, DEFAULT_MEMORY_LIMIT * 4).is_ok());
        assert!(!alloc.limit_reached());

        alloc.set_limit(16);
        assert!(alloc.is_limit_enabled());
        assert_eq!(alloc.reallocate(0, 1), Err(AllocError::LimitReached));

        alloc.disable_limit();
        assert!(alloc.reallocate(0, 1).is_ok());
    }

    #[test]
    fn used_tracks_the_sum_of_live_allocations() {
        let mut alloc = LimitedAllocator::new(MEM_1MB);
        let sizes = [24usize, 120, 8, 512, 64, 96, 4, 300];

        let mut live: Vec<usize> = Vec::new();
        for size in sizes {
            assert!(alloc.reallocate(0, size).is_ok());
            live.push(size);
        }
        assert_eq!(alloc.used(), live.iter().sum::<usize>());

        // Shrink one, grow another, free every other one.
        assert!(alloc.reallocate(live[3], 100).is_ok());
        live[3] = 100;
        assert!(alloc.reallocate(live[1], 240).is_ok());
        live[1] = 240;
        for index in (0..live.len()).step_by(2) {
            alloc.release(live[index]);
            live[index] = 0;
        }
        assert_eq!(alloc.used(), live.iter().sum::<usize>());

        for size in live {
            alloc.release(size);
        }
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn realloc_to_zero_is_the_free_path() {
        let mut alloc = LimitedAllocator::new(MEM_1MB);
        assert!(alloc.reallocate(0, 128).is_ok());
        assert_eq!(alloc.reallocate(128, 0), Ok(0));
        assert_eq!(alloc.used(), 0);
    }
}
