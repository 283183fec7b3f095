//! Image tables — the shared I/O surface.
//!
//! Fourteen typed families of `BUFFER_SIZE` slots each. A slot holds an
//! optional pointer into the control program's variable storage: the
//! program publishes bindings during init (`glue_vars`) and they stay
//! constant for the process lifetime. The core never frees that storage.
//!
//! All mutation and observation of cells is serialised by the single
//! process-wide image lock. When both the image lock and the journal lock
//! are needed, the image lock comes first — everywhere.

use std::cell::UnsafeCell;
use std::ptr::{addr_of_mut, null_mut};

use parking_lot::lock_api::RawMutex as _;

use ferrum::{BoolRow, BUFFER_SIZE};

// =============================================================================
// Table storage
// =============================================================================

struct Tables {
    bool_input: [BoolRow; BUFFER_SIZE],
    bool_output: [BoolRow; BUFFER_SIZE],
    bool_memory: [BoolRow; BUFFER_SIZE],
    byte_input: [*mut u8; BUFFER_SIZE],
    byte_output: [*mut u8; BUFFER_SIZE],
    int_input: [*mut u16; BUFFER_SIZE],
    int_output: [*mut u16; BUFFER_SIZE],
    int_memory: [*mut u16; BUFFER_SIZE],
    dint_input: [*mut u32; BUFFER_SIZE],
    dint_output: [*mut u32; BUFFER_SIZE],
    dint_memory: [*mut u32; BUFFER_SIZE],
    lint_input: [*mut u64; BUFFER_SIZE],
    lint_output: [*mut u64; BUFFER_SIZE],
    lint_memory: [*mut u64; BUFFER_SIZE],
}

struct TableCell(UnsafeCell<Tables>);

// Safety: every access to the cell contents goes through the image lock;
// the pointers themselves are only written during control-program init.
unsafe impl Sync for TableCell {}

static TABLES: TableCell = TableCell(UnsafeCell::new(Tables {
    bool_input: [[null_mut(); 8]; BUFFER_SIZE],
    bool_output: [[null_mut(); 8]; BUFFER_SIZE],
    bool_memory: [[null_mut(); 8]; BUFFER_SIZE],
    byte_input: [null_mut(); BUFFER_SIZE],
    byte_output: [null_mut(); BUFFER_SIZE],
    int_input: [null_mut(); BUFFER_SIZE],
    int_output: [null_mut(); BUFFER_SIZE],
    int_memory: [null_mut(); BUFFER_SIZE],
    dint_input: [null_mut(); BUFFER_SIZE],
    dint_output: [null_mut(); BUFFER_SIZE],
    dint_memory: [null_mut(); BUFFER_SIZE],
    lint_input: [null_mut(); BUFFER_SIZE],
    lint_output: [null_mut(); BUFFER_SIZE],
    lint_memory: [null_mut(); BUFFER_SIZE],
}));

/// The fourteen base pointers, one per family. Handed to the control
/// program (`set_buffer_pointers`), to plugins (inside `RuntimeArgs`) and
/// to the journal (apply targets).
#[derive(Clone, Copy)]
pub struct TablePtrs {
    pub bool_input: *mut BoolRow,
    pub bool_output: *mut BoolRow,
    pub bool_memory: *mut BoolRow,
    pub byte_input: *mut *mut u8,
    pub byte_output: *mut *mut u8,
    pub int_input: *mut *mut u16,
    pub int_output: *mut *mut u16,
    pub int_memory: *mut *mut u16,
    pub dint_input: *mut *mut u32,
    pub dint_output: *mut *mut u32,
    pub dint_memory: *mut *mut u32,
    pub lint_input: *mut *mut u64,
    pub lint_output: *mut *mut u64,
    pub lint_memory: *mut *mut u64,
}

// Safety: base pointers address static (or otherwise pinned) slot arrays;
// cell dereferences are serialised by the image lock.
unsafe impl Send for TablePtrs {}
unsafe impl Sync for TablePtrs {}

/// Base pointers of the process-wide tables.
pub fn table_ptrs() -> TablePtrs {
    let t = TABLES.0.get();
    unsafe {
        TablePtrs {
            bool_input: addr_of_mut!((*t).bool_input).cast(),
            bool_output: addr_of_mut!((*t).bool_output).cast(),
            bool_memory: addr_of_mut!((*t).bool_memory).cast(),
            byte_input: addr_of_mut!((*t).byte_input).cast(),
            byte_output: addr_of_mut!((*t).byte_output).cast(),
            int_input: addr_of_mut!((*t).int_input).cast(),
            int_output: addr_of_mut!((*t).int_output).cast(),
            int_memory: addr_of_mut!((*t).int_memory).cast(),
            dint_input: addr_of_mut!((*t).dint_input).cast(),
            dint_output: addr_of_mut!((*t).dint_output).cast(),
            dint_memory: addr_of_mut!((*t).dint_memory).cast(),
            lint_input: addr_of_mut!((*t).lint_input).cast(),
            lint_output: addr_of_mut!((*t).lint_output).cast(),
            lint_memory: addr_of_mut!((*t).lint_memory).cast(),
        }
    }
}

// =============================================================================
// Image lock
// =============================================================================

static IMAGE_LOCK: parking_lot::RawMutex = parking_lot::RawMutex::INIT;

/// Acquire the image lock. This is the `extern "C"` half handed to plugins
/// through `RuntimeArgs`; host code prefers the RAII [`lock`].
pub extern "C" fn image_lock() {
    IMAGE_LOCK.lock();
}

/// Release the image lock.
///
/// # Safety
///
/// The calling thread must currently hold the image lock.
pub unsafe extern "C" fn image_unlock() {
    unsafe { IMAGE_LOCK.unlock() };
}

/// RAII guard for host-internal use. The scan engine holds one of these
/// across steps 1–7 of the tick.
pub struct ImageLockGuard(());

pub fn lock() -> ImageLockGuard {
    IMAGE_LOCK.lock();
    ImageLockGuard(())
}

impl Drop for ImageLockGuard {
    fn drop(&mut self) {
        // Safety: constructing the guard acquired the lock.
        unsafe { IMAGE_LOCK.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ptrs_are_stable() {
        let a = table_ptrs();
        let b = table_ptrs();
        assert_eq!(a.bool_input, b.bool_input);
        assert_eq!(a.lint_memory, b.lint_memory);
    }

    #[test]
    fn lock_guard_releases() {
        {
            let _g = lock();
        }
        // Re-acquire proves the guard released.
        let _g = lock();
    }
}
