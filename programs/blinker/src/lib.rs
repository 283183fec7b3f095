//! Demo control program.
//!
//! Stands in for a compiled PLC program: owns its variable storage,
//! receives the image-table base pointers through `set_buffer_pointers`,
//! publishes bindings in `glue_vars`, and blinks an output once a second.
//!
//! The host treats this module as opaque — it only resolves the six
//! exported symbols. No ferrum crates are linked on purpose; the ABI is
//! the whole contract.
//!
//! Bound slots:
//!
//! | Slot | Variable |
//! |---|---|
//! | `bool_output[0][0]` | run LED (toggles every 10 ticks) |
//! | `bool_input[0][0..8]` | push buttons |
//! | `byte_input[0]` | raw button byte |
//! | `int_input[0]` | tick counter, low 16 bits |
//! | `int_input[1]` | constant 0x1234 (wire-format checks) |
//! | `int_output[0..4]` | setpoints, writable from remote |
//! | `int_memory[0..4]` | scratch registers |
//! | `dint_memory[0]` | uptime in ticks |
//! | `lint_memory[0]` | free-running 64-bit counter |

use std::cell::UnsafeCell;

const BUFFER_SIZE: usize = 1024;

type BoolRow = [*mut u8; 8];

/// Tick period exported to the host: 100 ms.
#[no_mangle]
pub static common_ticktime: u64 = 100_000_000;

// =============================================================================
// Variable storage (owned by this module for the process lifetime)
// =============================================================================

struct Vars {
    run_led: u8,
    buttons: [u8; 8],
    button_byte: u8,
    tick_lo: u16,
    wire_probe: u16,
    setpoints: [u16; 4],
    scratch: [u16; 4],
    uptime: u32,
    free_counter: u64,
}

struct Bases {
    bool_input: *mut BoolRow,
    bool_output: *mut BoolRow,
    int_input: *mut *mut u16,
    int_output: *mut *mut u16,
    int_memory: *mut *mut u16,
    byte_input: *mut *mut u8,
    dint_memory: *mut *mut u32,
    lint_memory: *mut *mut u64,
}

struct ProgCell<T>(UnsafeCell<T>);

// Safety: the host calls every entry point from the scan thread only, and
// always under the image lock once ticking starts.
unsafe impl<T> Sync for ProgCell<T> {}

static VARS: ProgCell<Vars> = ProgCell(UnsafeCell::new(Vars {
    run_led: 0,
    buttons: [0; 8],
    button_byte: 0,
    tick_lo: 0,
    wire_probe: 0x1234,
    setpoints: [0; 4],
    scratch: [0; 4],
    uptime: 0,
    free_counter: 0,
}));

static BASES: ProgCell<Option<Bases>> = ProgCell(UnsafeCell::new(None));

// =============================================================================
// Exported entry points
// =============================================================================

/// Receive the fourteen image-table base pointers. Families this program
/// does not bind are accepted and ignored.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn set_buffer_pointers(
    bool_input: *mut BoolRow,
    bool_output: *mut BoolRow,
    _bool_memory: *mut BoolRow,
    byte_input: *mut *mut u8,
    _byte_output: *mut *mut u8,
    int_input: *mut *mut u16,
    int_output: *mut *mut u16,
    int_memory: *mut *mut u16,
    _dint_input: *mut *mut u32,
    _dint_output: *mut *mut u32,
    dint_memory: *mut *mut u32,
    _lint_input: *mut *mut u64,
    _lint_output: *mut *mut u64,
    lint_memory: *mut *mut u64,
) {
    unsafe {
        *BASES.0.get() = Some(Bases {
            bool_input,
            bool_output,
            int_input,
            int_output,
            int_memory,
            byte_input,
            dint_memory,
            lint_memory,
        });
    }
}

#[no_mangle]
pub extern "C" fn config_init() {
    let vars = unsafe { &mut *VARS.0.get() };
    *vars = Vars {
        run_led: 0,
        buttons: [0; 8],
        button_byte: 0,
        tick_lo: 0,
        wire_probe: 0x1234,
        setpoints: [0; 4],
        scratch: [0; 4],
        uptime: 0,
        free_counter: 0,
    };
}

/// Publish the bindings. Slots stay constant afterwards.
#[no_mangle]
pub extern "C" fn glue_vars() {
    unsafe {
        let Some(bases) = (*BASES.0.get()).as_ref() else {
            return;
        };
        let vars = &mut *VARS.0.get();

        debug_assert!(BUFFER_SIZE >= 8);

        (*bases.bool_output.add(0))[0] = &mut vars.run_led;
        for (bit, cell) in vars.buttons.iter_mut().enumerate() {
            (*bases.bool_input.add(0))[bit] = cell;
        }
        *bases.byte_input.add(0) = &mut vars.button_byte;
        *bases.int_input.add(0) = &mut vars.tick_lo;
        *bases.int_input.add(1) = &mut vars.wire_probe;
        for (i, cell) in vars.setpoints.iter_mut().enumerate() {
            *bases.int_output.add(i) = cell;
        }
        for (i, cell) in vars.scratch.iter_mut().enumerate() {
            *bases.int_memory.add(i) = cell;
        }
        *bases.dint_memory.add(0) = &mut vars.uptime;
        *bases.lint_memory.add(0) = &mut vars.free_counter;
    }
}

/// One control iteration. Called with the image lock held.
#[no_mangle]
pub extern "C" fn config_run(tick: u64) {
    let vars = unsafe { &mut *VARS.0.get() };

    if tick % 10 == 0 {
        vars.run_led ^= 1;
    }
    vars.tick_lo = tick as u16;
    vars.uptime = vars.uptime.wrapping_add(1);
    vars.free_counter = vars.free_counter.wrapping_add(1);

    // Mirror the button bits into the raw byte, as a wired input card
    // would.
    let mut byte = 0u8;
    for (bit, cell) in vars.buttons.iter().enumerate() {
        if *cell != 0 {
            byte |= 1 << bit;
        }
    }
    vars.button_byte = byte;
}

#[no_mangle]
pub extern "C" fn update_time() {
    // The demo program keeps no internal clock.
}
