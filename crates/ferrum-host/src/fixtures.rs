//! Test stand-ins for a control program.
//!
//! A real deployment gets its image-table bindings from the control
//! program: `glue_vars` points every slot it uses at storage inside the
//! program dylib. Tests don't want a dylib, so [`FixtureTables`] owns the
//! storage itself and binds every slot of every family.
//!
//! The module is public (not `#[cfg(test)]`) so integration tests and the
//! plugin crates' test suites can use it too.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use ferrum::{BoolRow, BufferType, BITS_PER_BUFFER, BUFFER_SIZE};

use crate::image::{self, TablePtrs};
use crate::program::ControlProgram;

// =============================================================================
// One fully-bound set of image tables
// =============================================================================

struct Family<T> {
    store: Box<[UnsafeCell<T>; BUFFER_SIZE]>,
    ptrs: Box<[*mut T; BUFFER_SIZE]>,
}

impl<T: Default> Family<T> {
    fn new() -> Self {
        let store: Box<[UnsafeCell<T>; BUFFER_SIZE]> =
            Box::new(std::array::from_fn(|_| UnsafeCell::new(T::default())));
        let mut ptrs: Box<[*mut T; BUFFER_SIZE]> = Box::new([null_mut(); BUFFER_SIZE]);
        for i in 0..BUFFER_SIZE {
            ptrs[i] = store[i].get();
        }
        Self { store, ptrs }
    }

    fn base(&self) -> *mut *mut T {
        self.ptrs.as_ptr() as *mut *mut T
    }

    fn get(&self, index: usize) -> T
    where
        T: Copy,
    {
        unsafe { *self.store[index].get() }
    }

    fn set(&self, index: usize, value: T) {
        unsafe { *self.store[index].get() = value };
    }
}

struct BoolFamily {
    store: Box<[[UnsafeCell<u8>; BITS_PER_BUFFER]; BUFFER_SIZE]>,
    rows: Box<[BoolRow; BUFFER_SIZE]>,
}

impl BoolFamily {
    fn new() -> Self {
        let store: Box<[[UnsafeCell<u8>; BITS_PER_BUFFER]; BUFFER_SIZE]> =
            Box::new(std::array::from_fn(|_| {
                std::array::from_fn(|_| UnsafeCell::new(0u8))
            }));
        let mut rows: Box<[BoolRow; BUFFER_SIZE]> =
            Box::new([[null_mut(); BITS_PER_BUFFER]; BUFFER_SIZE]);
        for i in 0..BUFFER_SIZE {
            for b in 0..BITS_PER_BUFFER {
                rows[i][b] = store[i][b].get();
            }
        }
        Self { store, rows }
    }

    fn base(&self) -> *mut BoolRow {
        self.rows.as_ptr() as *mut BoolRow
    }

    fn get(&self, index: usize, bit: usize) -> bool {
        unsafe { *self.store[index][bit].get() != 0 }
    }

    fn set(&self, index: usize, bit: usize, value: bool) {
        unsafe { *self.store[index][bit].get() = value as u8 };
    }
}

/// Owned storage for all fourteen families, every slot bound.
pub struct FixtureTables {
    bool_input: BoolFamily,
    bool_output: BoolFamily,
    bool_memory: BoolFamily,
    byte_input: Family<u8>,
    byte_output: Family<u8>,
    int_input: Family<u16>,
    int_output: Family<u16>,
    int_memory: Family<u16>,
    dint_input: Family<u32>,
    dint_output: Family<u32>,
    dint_memory: Family<u32>,
    lint_input: Family<u64>,
    lint_output: Family<u64>,
    lint_memory: Family<u64>,
}

// Safety: concurrent access in tests follows the same image-lock discipline
// as production tables; the storage itself lives in stable heap boxes.
unsafe impl Send for FixtureTables {}
unsafe impl Sync for FixtureTables {}

impl FixtureTables {
    pub fn new() -> Self {
        Self {
            bool_input: BoolFamily::new(),
            bool_output: BoolFamily::new(),
            bool_memory: BoolFamily::new(),
            byte_input: Family::new(),
            byte_output: Family::new(),
            int_input: Family::new(),
            int_output: Family::new(),
            int_memory: Family::new(),
            dint_input: Family::new(),
            dint_output: Family::new(),
            dint_memory: Family::new(),
            lint_input: Family::new(),
            lint_output: Family::new(),
            lint_memory: Family::new(),
        }
    }

    /// Base pointers for this fixture's own tables (not the process-wide
    /// ones). Feed these to a local `Journal` or a `RuntimeArgs`.
    pub fn table_ptrs(&self) -> TablePtrs {
        TablePtrs {
            bool_input: self.bool_input.base(),
            bool_output: self.bool_output.base(),
            bool_memory: self.bool_memory.base(),
            byte_input: self.byte_input.base(),
            byte_output: self.byte_output.base(),
            int_input: self.int_input.base(),
            int_output: self.int_output.base(),
            int_memory: self.int_memory.base(),
            dint_input: self.dint_input.base(),
            dint_output: self.dint_output.base(),
            dint_memory: self.dint_memory.base(),
            lint_input: self.lint_input.base(),
            lint_output: self.lint_output.base(),
            lint_memory: self.lint_memory.base(),
        }
    }

    // =========================================================================
    // Direct pokes — bypass the journal, as a control program would
    // =========================================================================

    pub fn poke(&self, ty: BufferType, index: usize, value: u64) {
        match ty {
            BufferType::ByteInput => self.byte_input.set(index, value as u8),
            BufferType::ByteOutput => self.byte_output.set(index, value as u8),
            BufferType::IntInput => self.int_input.set(index, value as u16),
            BufferType::IntOutput => self.int_output.set(index, value as u16),
            BufferType::IntMemory => self.int_memory.set(index, value as u16),
            BufferType::DintInput => self.dint_input.set(index, value as u32),
            BufferType::DintOutput => self.dint_output.set(index, value as u32),
            BufferType::DintMemory => self.dint_memory.set(index, value as u32),
            BufferType::LintInput => self.lint_input.set(index, value),
            BufferType::LintOutput => self.lint_output.set(index, value),
            BufferType::LintMemory => self.lint_memory.set(index, value),
            _ => panic!("poke: use poke_bit for bool families"),
        }
    }

    pub fn peek(&self, ty: BufferType, index: usize) -> u64 {
        match ty {
            BufferType::ByteInput => self.byte_input.get(index) as u64,
            BufferType::ByteOutput => self.byte_output.get(index) as u64,
            BufferType::IntInput => self.int_input.get(index) as u64,
            BufferType::IntOutput => self.int_output.get(index) as u64,
            BufferType::IntMemory => self.int_memory.get(index) as u64,
            BufferType::DintInput => self.dint_input.get(index) as u64,
            BufferType::DintOutput => self.dint_output.get(index) as u64,
            BufferType::DintMemory => self.dint_memory.get(index) as u64,
            BufferType::LintInput => self.lint_input.get(index),
            BufferType::LintOutput => self.lint_output.get(index),
            BufferType::LintMemory => self.lint_memory.get(index),
            _ => panic!("peek: use peek_bit for bool families"),
        }
    }

    pub fn poke_bit(&self, ty: BufferType, index: usize, bit: usize, value: bool) {
        match ty {
            BufferType::BoolInput => self.bool_input.set(index, bit, value),
            BufferType::BoolOutput => self.bool_output.set(index, bit, value),
            BufferType::BoolMemory => self.bool_memory.set(index, bit, value),
            _ => panic!("poke_bit: not a bool family"),
        }
    }

    pub fn peek_bit(&self, ty: BufferType, index: usize, bit: usize) -> bool {
        match ty {
            BufferType::BoolInput => self.bool_input.get(index, bit),
            BufferType::BoolOutput => self.bool_output.get(index, bit),
            BufferType::BoolMemory => self.bool_memory.get(index, bit),
            _ => panic!("peek_bit: not a bool family"),
        }
    }

    // Named shorthands for the common assertions.

    pub fn bool_output(&self, index: usize, bit: usize) -> bool {
        self.bool_output.get(index, bit)
    }

    pub fn byte_output(&self, index: usize) -> u8 {
        self.byte_output.get(index)
    }

    pub fn int_output(&self, index: usize) -> u16 {
        self.int_output.get(index)
    }

    pub fn int_memory(&self, index: usize) -> u16 {
        self.int_memory.get(index)
    }

    pub fn dint_output(&self, index: usize) -> u32 {
        self.dint_output.get(index)
    }

    pub fn lint_output(&self, index: usize) -> u64 {
        self.lint_output.get(index)
    }
}

impl Default for FixtureTables {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Binding the process-wide tables
// =============================================================================

/// Bind every slot of the process-wide image tables to a leaked fixture.
///
/// Tests that exercise the global journal or the scan engine need the real
/// tables populated. The fixture is created once and leaked into a static,
/// so the global tables never dangle; repeated calls rebind to the same
/// storage.
pub fn bind_global_tables() -> &'static FixtureTables {
    static FIX: OnceLock<FixtureTables> = OnceLock::new();
    let fix = FIX.get_or_init(FixtureTables::new);

    let src = fix.table_ptrs();
    let dst = image::table_ptrs();
    let _guard = image::lock();
    unsafe {
        for i in 0..BUFFER_SIZE {
            *dst.bool_input.add(i) = *src.bool_input.add(i);
            *dst.bool_output.add(i) = *src.bool_output.add(i);
            *dst.bool_memory.add(i) = *src.bool_memory.add(i);
            *dst.byte_input.add(i) = *src.byte_input.add(i);
            *dst.byte_output.add(i) = *src.byte_output.add(i);
            *dst.int_input.add(i) = *src.int_input.add(i);
            *dst.int_output.add(i) = *src.int_output.add(i);
            *dst.int_memory.add(i) = *src.int_memory.add(i);
            *dst.dint_input.add(i) = *src.dint_input.add(i);
            *dst.dint_output.add(i) = *src.dint_output.add(i);
            *dst.dint_memory.add(i) = *src.dint_memory.add(i);
            *dst.lint_input.add(i) = *src.lint_input.add(i);
            *dst.lint_output.add(i) = *src.lint_output.add(i);
            *dst.lint_memory.add(i) = *src.lint_memory.add(i);
        }
    }
    fix
}

// =============================================================================
// Stub control program
// =============================================================================

static STUB_TICKS: AtomicU64 = AtomicU64::new(0);
static STUB_RUN_DELAY_NS: AtomicU64 = AtomicU64::new(0);

extern "C" fn stub_config_init() {}

extern "C" fn stub_config_run(tick: u64) {
    STUB_TICKS.store(tick.wrapping_add(1), Ordering::Relaxed);
    let delay = STUB_RUN_DELAY_NS.load(Ordering::Relaxed);
    if delay > 0 {
        std::thread::sleep(Duration::from_nanos(delay));
    }
}

extern "C" fn stub_update_time() {}

extern "C" fn stub_glue_vars() {}

/// Number of `config_run` invocations observed by the stub.
pub fn stub_run_count() -> u64 {
    STUB_TICKS.load(Ordering::Relaxed)
}

pub fn reset_stub_run_count() {
    STUB_TICKS.store(0, Ordering::Relaxed);
}

/// Make every stub `config_run` sleep, to provoke scan overruns.
pub fn set_stub_run_delay(delay: Duration) {
    STUB_RUN_DELAY_NS.store(delay.as_nanos() as u64, Ordering::Relaxed);
}

/// A loaded-program stand-in whose tick period is `tick_ns` nanoseconds.
/// Pair with [`bind_global_tables`] for table bindings.
pub fn stub_program(tick_ns: u64) -> ControlProgram {
    let period: &'static u64 = Box::leak(Box::new(tick_ns));
    ControlProgram::from_parts(
        stub_config_init,
        stub_config_run,
        stub_update_time,
        stub_glue_vars,
        None,
        period as *const u64,
    )
}
