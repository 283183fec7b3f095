//! Safe plugin-side wrapper around [`RuntimeArgs`].
//!
//! [`Runtime::from_raw`] copies the transport struct out of the pointer the
//! host passes to `plugin_init` (the host may free that copy afterwards).
//! From then on, image reads go through an RAII [`ImageGuard`] and image
//! writes go through the journal callbacks.

use std::ffi::CString;
use std::path::PathBuf;

use crate::types::{BufferType, RuntimeArgs, CONFIG_PATH_MAX};

/// Returned by the journal write methods when the host rejects the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteError(pub i32);

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "journal write rejected (status {})", self.0)
    }
}

impl std::error::Error for WriteError {}

/// A plugin's copy of the host interface.
#[derive(Clone, Copy)]
pub struct Runtime {
    args: RuntimeArgs,
}

impl Runtime {
    /// Copy the runtime args out of the host's transport pointer.
    ///
    /// Returns `None` for a null pointer or implausible dimensions.
    ///
    /// # Safety
    ///
    /// `args` must either be null or point at a live `RuntimeArgs` built by
    /// the host for this plugin instance.
    pub unsafe fn from_raw(args: *const RuntimeArgs) -> Option<Self> {
        if args.is_null() {
            return None;
        }
        let args = unsafe { *args };
        if args.buffer_size == 0 || args.bits_per_buffer == 0 {
            return None;
        }
        Some(Self { args })
    }

    /// Build a runtime from an owned args struct. Used by in-process tests;
    /// dlopen'd plugins go through [`Runtime::from_raw`].
    pub fn from_args(args: RuntimeArgs) -> Self {
        Self { args }
    }

    pub fn buffer_size(&self) -> usize {
        self.args.buffer_size as usize
    }

    pub fn bits_per_buffer(&self) -> usize {
        self.args.bits_per_buffer as usize
    }

    /// Per-plugin config file path from the descriptor, if one was set.
    pub fn config_path(&self) -> Option<PathBuf> {
        let bytes = &self.args.config_path;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(CONFIG_PATH_MAX);
        if len == 0 {
            return None;
        }
        let s = std::str::from_utf8(&bytes[..len]).ok()?;
        Some(PathBuf::from(s))
    }

    /// Acquire the image lock. Reads happen through the guard; the lock is
    /// released when the guard drops. Do not call from a cycle hook — the
    /// scan thread already holds the lock there.
    pub fn lock(&self) -> ImageGuard<'_> {
        unsafe { (self.args.image_lock)() };
        ImageGuard { rt: self }
    }

    pub fn logger(&self, component: &str) -> PluginLog {
        PluginLog {
            rt: *self,
            component: CString::new(component).unwrap_or_default(),
        }
    }

    // =========================================================================
    // Journal writes — callable from any thread, no lock required
    // =========================================================================

    pub fn write_bool(&self, ty: BufferType, index: u16, bit: u8, value: bool) -> Result<(), WriteError> {
        status(unsafe {
            (self.args.journal_write_bool)(ty.code(), index, bit, value as u8)
        })
    }

    pub fn write_byte(&self, ty: BufferType, index: u16, value: u8) -> Result<(), WriteError> {
        status(unsafe { (self.args.journal_write_byte)(ty.code(), index, value) })
    }

    pub fn write_int(&self, ty: BufferType, index: u16, value: u16) -> Result<(), WriteError> {
        status(unsafe { (self.args.journal_write_int)(ty.code(), index, value) })
    }

    pub fn write_dint(&self, ty: BufferType, index: u16, value: u32) -> Result<(), WriteError> {
        status(unsafe { (self.args.journal_write_dint)(ty.code(), index, value) })
    }

    pub fn write_lint(&self, ty: BufferType, index: u16, value: u64) -> Result<(), WriteError> {
        status(unsafe { (self.args.journal_write_lint)(ty.code(), index, value) })
    }
}

fn status(code: i32) -> Result<(), WriteError> {
    if code == 0 {
        Ok(())
    } else {
        Err(WriteError(code))
    }
}

// =============================================================================
// ImageGuard — scoped read access
// =============================================================================

/// Proof that the image lock is held. All reads return `None` for unbound
/// slots or out-of-range addresses.
pub struct ImageGuard<'rt> {
    rt: &'rt Runtime,
}

impl ImageGuard<'_> {
    pub fn read_bool(&self, ty: BufferType, index: usize, bit: usize) -> Option<bool> {
        let args = &self.rt.args;
        if index >= self.rt.buffer_size() || bit >= self.rt.bits_per_buffer() {
            return None;
        }
        let base = match ty {
            BufferType::BoolInput => args.bool_input,
            BufferType::BoolOutput => args.bool_output,
            BufferType::BoolMemory => args.bool_memory,
            _ => return None,
        };
        unsafe {
            let row = &*base.add(index);
            let cell = row[bit];
            if cell.is_null() {
                None
            } else {
                Some(*cell != 0)
            }
        }
    }

    pub fn read_byte(&self, ty: BufferType, index: usize) -> Option<u8> {
        let base = match ty {
            BufferType::ByteInput => self.rt.args.byte_input,
            BufferType::ByteOutput => self.rt.args.byte_output,
            _ => return None,
        };
        unsafe { self.read_cell(base, index) }
    }

    pub fn read_int(&self, ty: BufferType, index: usize) -> Option<u16> {
        let base = match ty {
            BufferType::IntInput => self.rt.args.int_input,
            BufferType::IntOutput => self.rt.args.int_output,
            BufferType::IntMemory => self.rt.args.int_memory,
            _ => return None,
        };
        unsafe { self.read_cell(base, index) }
    }

    pub fn read_dint(&self, ty: BufferType, index: usize) -> Option<u32> {
        let base = match ty {
            BufferType::DintInput => self.rt.args.dint_input,
            BufferType::DintOutput => self.rt.args.dint_output,
            BufferType::DintMemory => self.rt.args.dint_memory,
            _ => return None,
        };
        unsafe { self.read_cell(base, index) }
    }

    pub fn read_lint(&self, ty: BufferType, index: usize) -> Option<u64> {
        let base = match ty {
            BufferType::LintInput => self.rt.args.lint_input,
            BufferType::LintOutput => self.rt.args.lint_output,
            BufferType::LintMemory => self.rt.args.lint_memory,
            _ => return None,
        };
        unsafe { self.read_cell(base, index) }
    }

    /// Dereference slot `index` of a pointer-of-pointers family.
    ///
    /// Safety: `base` must address `buffer_size` slots; holding the guard
    /// keeps bound cells stable.
    unsafe fn read_cell<T: Copy>(&self, base: *mut *mut T, index: usize) -> Option<T> {
        if index >= self.rt.buffer_size() {
            return None;
        }
        let cell = unsafe { *base.add(index) };
        if cell.is_null() {
            None
        } else {
            Some(unsafe { *cell })
        }
    }
}

impl Drop for ImageGuard<'_> {
    fn drop(&mut self) {
        unsafe { (self.rt.args.image_unlock)() };
    }
}

// =============================================================================
// PluginLog — component-tagged logging through the host
// =============================================================================

/// Routes plugin log lines through the host's central logging, tagged with
/// the plugin's component name.
#[derive(Clone)]
pub struct PluginLog {
    rt: Runtime,
    component: CString,
}

impl PluginLog {
    pub fn info(&self, msg: &str) {
        self.emit(self.rt.args.log_info, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.emit(self.rt.args.log_debug, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.emit(self.rt.args.log_warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.emit(self.rt.args.log_error, msg);
    }

    fn emit(&self, f: crate::types::LogFn, msg: &str) {
        // Interior NULs would truncate; replace rather than drop the line.
        let msg = match CString::new(msg) {
            Ok(c) => c,
            Err(_) => CString::new(msg.replace('\0', "?")).unwrap_or_default(),
        };
        unsafe { f(self.component.as_ptr(), msg.as_ptr()) };
    }
}
