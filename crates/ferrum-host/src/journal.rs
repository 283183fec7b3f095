//! Journal buffer — race-free plugin writes to the image tables.
//!
//! Plugins never write image cells directly. Every write is appended here
//! with a sequence number and applied, in sequence order, at the start of
//! the next scan cycle (`apply_and_clear`, called with the image lock
//! held). Reads stay direct: plugins read the tables under the image lock.
//!
//! Lock ordering, never violated: image lock first, journal lock second.
//! Writers take only the journal lock. The one exception path is the
//! emergency flush — when a write finds the journal full it releases the
//! journal lock, takes the image lock, re-takes the journal lock, applies
//! everything, and continues with the caller's insertion.

use std::sync::Mutex;

use ferrum::{BufferType, LockFn, BIT_INDEX_NONE};

use crate::image::TablePtrs;

/// Journal capacity. Reaching it triggers an emergency flush, so no write
/// is ever dropped for lack of space.
pub const JOURNAL_MAX_ENTRIES: usize = 1024;

/// One journalled write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Assigned at insertion under the journal lock; determines apply
    /// order. Resets to 0 on every apply-and-clear, so it encodes
    /// position-within-cycle, not a global clock.
    pub sequence: u32,
    /// Buffer-type code, 0..13.
    pub buffer_type: u8,
    /// 0..7 for bool families, `BIT_INDEX_NONE` otherwise.
    pub bit_index: u8,
    pub index: u16,
    /// Value, masked to the family's element width at apply time.
    pub value: u64,
}

/// Apply targets: image-table base pointers plus the image-lock pair used
/// by the emergency flush.
#[derive(Clone, Copy)]
pub struct BufferPtrs {
    pub tables: TablePtrs,
    pub buffer_size: u16,
    pub image_lock: LockFn,
    pub image_unlock: LockFn,
}

// Safety: `tables` is Send+Sync by the image-lock discipline; the lock fns
// are process-global.
unsafe impl Send for BufferPtrs {}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal not initialised")]
    NotInitialised,
    #[error("buffer type {0} is not valid for this writer")]
    BadBufferType(u8),
    #[error("bit index {0} out of range 0..8")]
    BadBitIndex(u8),
}

struct State {
    entries: Vec<Entry>,
    next_sequence: u32,
    bufs: Option<BufferPtrs>,
}

/// A sequenced write log. The process-wide instance is [`journal()`];
/// tests construct their own against fixture tables.
pub struct Journal {
    state: Mutex<State>,
}

impl Journal {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: Vec::new(),
                next_sequence: 0,
                bufs: None,
            }),
        }
    }

    /// Point the journal at its apply targets and mark it ready. Resets
    /// any leftover entries and the sequence counter.
    pub fn init(&self, bufs: BufferPtrs) {
        let mut st = self.lock_state();
        st.entries.clear();
        st.entries.reserve(JOURNAL_MAX_ENTRIES);
        st.next_sequence = 0;
        st.bufs = Some(bufs);
    }

    /// Mark uninitialised and drop all pending entries. Writers fail with
    /// `NotInitialised` afterwards.
    pub fn cleanup(&self) {
        let mut st = self.lock_state();
        st.entries.clear();
        st.entries.shrink_to_fit();
        st.next_sequence = 0;
        st.bufs = None;
    }

    pub fn is_initialised(&self) -> bool {
        self.lock_state().bufs.is_some()
    }

    /// Number of entries waiting to be applied.
    pub fn pending(&self) -> usize {
        self.lock_state().entries.len()
    }

    /// Next sequence number to be assigned (diagnostics).
    pub fn sequence(&self) -> u32 {
        self.lock_state().next_sequence
    }

    // =========================================================================
    // Writers — callable from any thread
    // =========================================================================

    pub fn write_bool(&self, ty: u8, index: u16, bit: u8, value: bool) -> Result<(), JournalError> {
        if !matches!(BufferType::from_code(ty), Some(t) if t.is_bool()) {
            return Err(JournalError::BadBufferType(ty));
        }
        if bit > 7 {
            return Err(JournalError::BadBitIndex(bit));
        }
        self.push(ty, index, bit, value as u64)
    }

    pub fn write_byte(&self, ty: u8, index: u16, value: u8) -> Result<(), JournalError> {
        if !matches!(BufferType::from_code(ty), Some(t) if t.is_byte()) {
            return Err(JournalError::BadBufferType(ty));
        }
        self.push(ty, index, BIT_INDEX_NONE, value as u64)
    }

    pub fn write_int(&self, ty: u8, index: u16, value: u16) -> Result<(), JournalError> {
        if !matches!(BufferType::from_code(ty), Some(t) if t.is_int()) {
            return Err(JournalError::BadBufferType(ty));
        }
        self.push(ty, index, BIT_INDEX_NONE, value as u64)
    }

    pub fn write_dint(&self, ty: u8, index: u16, value: u32) -> Result<(), JournalError> {
        if !matches!(BufferType::from_code(ty), Some(t) if t.is_dint()) {
            return Err(JournalError::BadBufferType(ty));
        }
        self.push(ty, index, BIT_INDEX_NONE, value as u64)
    }

    pub fn write_lint(&self, ty: u8, index: u16, value: u64) -> Result<(), JournalError> {
        if !matches!(BufferType::from_code(ty), Some(t) if t.is_lint()) {
            return Err(JournalError::BadBufferType(ty));
        }
        self.push(ty, index, BIT_INDEX_NONE, value)
    }

    /// Append one entry, emergency-flushing first if the journal is full.
    ///
    /// Index bounds are deliberately not checked here: out-of-range
    /// indices are dropped silently at apply time, keeping writers O(1)
    /// and panic-free.
    fn push(&self, ty: u8, index: u16, bit: u8, value: u64) -> Result<(), JournalError> {
        let mut st = self.lock_state();
        let Some(bufs) = st.bufs else {
            return Err(JournalError::NotInitialised);
        };

        if st.entries.len() >= JOURNAL_MAX_ENTRIES {
            // Emergency flush. Lock ordering requires image-then-journal,
            // so release our lock, take the image lock, re-take ours.
            drop(st);
            unsafe { (bufs.image_lock)() };
            st = self.lock_state();
            if let Some(bufs) = st.bufs {
                Self::apply_locked(&mut st, &bufs);
            }
            unsafe { (bufs.image_unlock)() };
            if st.bufs.is_none() {
                // Torn down while we were juggling locks.
                return Err(JournalError::NotInitialised);
            }
        }

        let sequence = st.next_sequence;
        st.next_sequence += 1;
        st.entries.push(Entry {
            sequence,
            buffer_type: ty,
            bit_index: bit,
            index,
            value,
        });
        Ok(())
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Apply all pending entries in sequence order, then reset count and
    /// sequence. Always fully clears, even if every entry targeted an
    /// unbound slot.
    ///
    /// The caller must hold the image lock; this function takes only the
    /// journal lock internally.
    pub fn apply_and_clear(&self) {
        let mut st = self.lock_state();
        if let Some(bufs) = st.bufs {
            Self::apply_locked(&mut st, &bufs);
        }
    }

    fn apply_locked(st: &mut State, bufs: &BufferPtrs) {
        for entry in &st.entries {
            // Safety: image lock is held by contract; the base pointers in
            // `bufs` address `buffer_size` slots each.
            unsafe { apply_entry(entry, bufs) };
        }
        st.entries.clear();
        st.next_sequence = 0;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // Poisoning means a panic inside the journal itself; that is an
        // invariant violation, not a recoverable condition.
        self.state.lock().expect("journal lock poisoned")
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one entry into its destination slot, masking to element width.
/// Unbound slots and out-of-range indices are skipped.
unsafe fn apply_entry(entry: &Entry, bufs: &BufferPtrs) {
    let idx = entry.index as usize;
    if idx >= bufs.buffer_size as usize {
        return;
    }

    let t = &bufs.tables;
    let Some(ty) = BufferType::from_code(entry.buffer_type) else {
        return;
    };

    unsafe {
        match ty {
            BufferType::BoolInput | BufferType::BoolOutput | BufferType::BoolMemory => {
                let base = match ty {
                    BufferType::BoolInput => t.bool_input,
                    BufferType::BoolOutput => t.bool_output,
                    _ => t.bool_memory,
                };
                let row = &*base.add(idx);
                let cell = row[entry.bit_index as usize];
                if !cell.is_null() {
                    *cell = (entry.value & 1) as u8;
                }
            }
            BufferType::ByteInput | BufferType::ByteOutput => {
                let base = match ty {
                    BufferType::ByteInput => t.byte_input,
                    _ => t.byte_output,
                };
                let cell = *base.add(idx);
                if !cell.is_null() {
                    *cell = (entry.value & 0xFF) as u8;
                }
            }
            BufferType::IntInput | BufferType::IntOutput | BufferType::IntMemory => {
                let base = match ty {
                    BufferType::IntInput => t.int_input,
                    BufferType::IntOutput => t.int_output,
                    _ => t.int_memory,
                };
                let cell = *base.add(idx);
                if !cell.is_null() {
                    *cell = (entry.value & 0xFFFF) as u16;
                }
            }
            BufferType::DintInput | BufferType::DintOutput | BufferType::DintMemory => {
                let base = match ty {
                    BufferType::DintInput => t.dint_input,
                    BufferType::DintOutput => t.dint_output,
                    _ => t.dint_memory,
                };
                let cell = *base.add(idx);
                if !cell.is_null() {
                    *cell = (entry.value & 0xFFFF_FFFF) as u32;
                }
            }
            BufferType::LintInput | BufferType::LintOutput | BufferType::LintMemory => {
                let base = match ty {
                    BufferType::LintInput => t.lint_input,
                    BufferType::LintOutput => t.lint_output,
                    _ => t.lint_memory,
                };
                let cell = *base.add(idx);
                if !cell.is_null() {
                    *cell = entry.value;
                }
            }
        }
    }
}

// =============================================================================
// Process-wide instance + C callbacks for RuntimeArgs
// =============================================================================

static JOURNAL: Journal = Journal::new();

/// The process-wide journal. Initialised once the control program has
/// published its bindings, torn down after all workers have joined.
pub fn journal() -> &'static Journal {
    &JOURNAL
}

fn status(result: Result<(), JournalError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

pub extern "C" fn journal_write_bool_cb(ty: u8, index: u16, bit: u8, value: u8) -> i32 {
    status(JOURNAL.write_bool(ty, index, bit, value != 0))
}

pub extern "C" fn journal_write_byte_cb(ty: u8, index: u16, value: u8) -> i32 {
    status(JOURNAL.write_byte(ty, index, value))
}

pub extern "C" fn journal_write_int_cb(ty: u8, index: u16, value: u16) -> i32 {
    status(JOURNAL.write_int(ty, index, value))
}

pub extern "C" fn journal_write_dint_cb(ty: u8, index: u16, value: u32) -> i32 {
    status(JOURNAL.write_dint(ty, index, value))
}

pub extern "C" fn journal_write_lint_cb(ty: u8, index: u16, value: u64) -> i32 {
    status(JOURNAL.write_lint(ty, index, value))
}
