//! FFI-safe types shared between the host and plugins.

use std::os::raw::c_char;

/// Number of slots in every image-table family.
pub const BUFFER_SIZE: usize = 1024;

/// Bits per slot in the bool families.
pub const BITS_PER_BUFFER: usize = 8;

/// Fixed size of the NUL-padded config-path field in [`RuntimeArgs`].
pub const CONFIG_PATH_MAX: usize = 256;

/// `bit_index` value for entries targeting non-bool families.
pub const BIT_INDEX_NONE: u8 = 0xFF;

/// One row of a bool family: eight optional pointers to 1-bit cells.
pub type BoolRow = [*mut u8; BITS_PER_BUFFER];

/// The fourteen image-table families, numbered 0..13.
///
/// The numeric code is the sole cross-boundary identifier: journal write
/// callbacks and plugin configuration both speak these codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    BoolInput = 0,
    BoolOutput = 1,
    BoolMemory = 2,
    ByteInput = 3,
    ByteOutput = 4,
    IntInput = 5,
    IntOutput = 6,
    IntMemory = 7,
    DintInput = 8,
    DintOutput = 9,
    DintMemory = 10,
    LintInput = 11,
    LintOutput = 12,
    LintMemory = 13,
}

impl BufferType {
    pub const COUNT: usize = 14;

    pub fn from_code(code: u8) -> Option<Self> {
        use BufferType::*;
        Some(match code {
            0 => BoolInput,
            1 => BoolOutput,
            2 => BoolMemory,
            3 => ByteInput,
            4 => ByteOutput,
            5 => IntInput,
            6 => IntOutput,
            7 => IntMemory,
            8 => DintInput,
            9 => DintOutput,
            10 => DintMemory,
            11 => LintInput,
            12 => LintOutput,
            13 => LintMemory,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Width of one element on the wire, in bytes. Bool rows pack to one
    /// byte per slot.
    pub fn element_size(self) -> usize {
        use BufferType::*;
        match self {
            BoolInput | BoolOutput | BoolMemory => 1,
            ByteInput | ByteOutput => 1,
            IntInput | IntOutput | IntMemory => 2,
            DintInput | DintOutput | DintMemory => 4,
            LintInput | LintOutput | LintMemory => 8,
        }
    }

    pub fn is_bool(self) -> bool {
        matches!(
            self,
            BufferType::BoolInput | BufferType::BoolOutput | BufferType::BoolMemory
        )
    }

    pub fn is_byte(self) -> bool {
        matches!(self, BufferType::ByteInput | BufferType::ByteOutput)
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            BufferType::IntInput | BufferType::IntOutput | BufferType::IntMemory
        )
    }

    pub fn is_dint(self) -> bool {
        matches!(
            self,
            BufferType::DintInput | BufferType::DintOutput | BufferType::DintMemory
        )
    }

    pub fn is_lint(self) -> bool {
        matches!(
            self,
            BufferType::LintInput | BufferType::LintOutput | BufferType::LintMemory
        )
    }

    /// Input families are fed by the field side; protocol servers drop
    /// remote writes targeting them.
    pub fn is_input(self) -> bool {
        matches!(
            self,
            BufferType::BoolInput | BufferType::ByteInput | BufferType::IntInput
                | BufferType::DintInput
                | BufferType::LintInput
        )
    }

    pub fn name(self) -> &'static str {
        use BufferType::*;
        match self {
            BoolInput => "bool_input",
            BoolOutput => "bool_output",
            BoolMemory => "bool_memory",
            ByteInput => "byte_input",
            ByteOutput => "byte_output",
            IntInput => "int_input",
            IntOutput => "int_output",
            IntMemory => "int_memory",
            DintInput => "dint_input",
            DintOutput => "dint_output",
            DintMemory => "dint_memory",
            LintInput => "lint_input",
            LintOutput => "lint_output",
            LintMemory => "lint_memory",
        }
    }
}

// =============================================================================
// Host callback signatures
// =============================================================================

/// Image-lock acquire/release. The pair is global: there is exactly one
/// image lock in the process.
pub type LockFn = unsafe extern "C" fn();

/// Logging callback: `(component, message)`, both NUL-terminated UTF-8.
pub type LogFn = unsafe extern "C" fn(component: *const c_char, message: *const c_char);

/// Journal writers. All return 0 on success, nonzero when the type code is
/// outside the family's range, `bit > 7`, or the journal is uninitialised.
pub type JournalWriteBoolFn =
    unsafe extern "C" fn(buffer_type: u8, index: u16, bit: u8, value: u8) -> i32;
pub type JournalWriteByteFn = unsafe extern "C" fn(buffer_type: u8, index: u16, value: u8) -> i32;
pub type JournalWriteIntFn = unsafe extern "C" fn(buffer_type: u8, index: u16, value: u16) -> i32;
pub type JournalWriteDintFn = unsafe extern "C" fn(buffer_type: u8, index: u16, value: u32) -> i32;
pub type JournalWriteLintFn = unsafe extern "C" fn(buffer_type: u8, index: u16, value: u64) -> i32;

// =============================================================================
// Plugin entry point signatures (resolved by dlsym)
// =============================================================================

pub type PluginInitFn = unsafe extern "C-unwind" fn(args: *const RuntimeArgs) -> i32;
pub type PluginStartFn = unsafe extern "C-unwind" fn();
pub type PluginStopFn = unsafe extern "C-unwind" fn();
pub type PluginCleanupFn = unsafe extern "C-unwind" fn();
pub type PluginCycleFn = unsafe extern "C-unwind" fn();

// =============================================================================
// RuntimeArgs
// =============================================================================

/// The single argument handed to `plugin_init`.
///
/// Field order is ABI: the host and every plugin must agree on this layout.
/// The base pointers address `BUFFER_SIZE` slots each; every slot is either
/// bound (non-null, pointing at control-program storage) or unbound (null).
///
/// The struct is `Copy` on purpose: plugins copy it out of the transport
/// pointer before `plugin_init` returns, because the host may free that
/// copy afterwards.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RuntimeArgs {
    /* Image-table base pointers */
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

    /* Image lock */
    pub image_lock: LockFn,
    pub image_unlock: LockFn,

    /* Per-plugin configuration */
    pub config_path: [u8; CONFIG_PATH_MAX],

    /* Buffer dimensions */
    pub buffer_size: u32,
    pub bits_per_buffer: u32,

    /* Logging callbacks */
    pub log_info: LogFn,
    pub log_debug: LogFn,
    pub log_warn: LogFn,
    pub log_error: LogFn,

    /* Journal write callbacks */
    pub journal_write_bool: JournalWriteBoolFn,
    pub journal_write_byte: JournalWriteByteFn,
    pub journal_write_int: JournalWriteIntFn,
    pub journal_write_dint: JournalWriteDintFn,
    pub journal_write_lint: JournalWriteLintFn,
}

// Safety: the base pointers address process-wide image tables whose cells
// are only dereferenced under the image lock; the function pointers are
// host code valid for the plugin's lifetime.
unsafe impl Send for RuntimeArgs {}
unsafe impl Sync for RuntimeArgs {}

impl RuntimeArgs {
    /// Pack a path into the fixed NUL-padded field. Paths longer than
    /// `CONFIG_PATH_MAX - 1` are truncated.
    pub fn pack_config_path(path: &str) -> [u8; CONFIG_PATH_MAX] {
        let mut out = [0u8; CONFIG_PATH_MAX];
        let bytes = path.as_bytes();
        let n = bytes.len().min(CONFIG_PATH_MAX - 1);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_type_codes_round_trip() {
        for code in 0u8..14 {
            let ty = BufferType::from_code(code).unwrap();
            assert_eq!(ty.code(), code);
        }
        assert!(BufferType::from_code(14).is_none());
        assert!(BufferType::from_code(0xFF).is_none());
    }

    #[test]
    fn element_sizes() {
        assert_eq!(BufferType::BoolOutput.element_size(), 1);
        assert_eq!(BufferType::ByteInput.element_size(), 1);
        assert_eq!(BufferType::IntMemory.element_size(), 2);
        assert_eq!(BufferType::DintOutput.element_size(), 4);
        assert_eq!(BufferType::LintMemory.element_size(), 8);
    }

    #[test]
    fn pack_config_path_truncates_and_pads() {
        let packed = RuntimeArgs::pack_config_path("/etc/ferrum/s7.json");
        assert_eq!(&packed[..19], b"/etc/ferrum/s7.json");
        assert_eq!(packed[19], 0);

        let long = "x".repeat(CONFIG_PATH_MAX * 2);
        let packed = RuntimeArgs::pack_config_path(&long);
        assert_eq!(packed[CONFIG_PATH_MAX - 1], 0);
    }
}
