//! Control-program loader.
//!
//! The control program is an opaque dylib built elsewhere. The host
//! resolves six symbols by name, pushes the image-table base pointers into
//! the module, and from then on only the scan-cycle thread calls into it.

use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::path::Path;

use ferrum::BoolRow;

use crate::image::TablePtrs;

/// Fallback when the program exports a zero tick time.
pub const DEFAULT_TICK_NS: u64 = 20_000_000;

/// `set_buffer_pointers`: the inverse binding — the core pushes all
/// fourteen family base pointers into the module, in family declaration
/// order: bool in/out/mem, byte in/out, int in/out/mem, dint in/out/mem,
/// lint in/out/mem.
#[allow(clippy::type_complexity)]
pub type SetBufferPointersFn = unsafe extern "C" fn(
    *mut BoolRow,
    *mut BoolRow,
    *mut BoolRow,
    *mut *mut u8,
    *mut *mut u8,
    *mut *mut u16,
    *mut *mut u16,
    *mut *mut u16,
    *mut *mut u32,
    *mut *mut u32,
    *mut *mut u32,
    *mut *mut u64,
    *mut *mut u64,
    *mut *mut u64,
);

pub type ProgramVoidFn = unsafe extern "C" fn();
pub type ProgramRunFn = unsafe extern "C" fn(tick: u64);

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("dlopen {path} failed: {detail}")]
    OpenFailed { path: String, detail: String },
    #[error("symbol `{symbol}` missing from control program: {detail}")]
    SymbolMissing { symbol: String, detail: String },
}

/// A loaded control program: the dylib handle plus an explicit, typed
/// function-pointer set. Optional entry points do not exist here — all six
/// symbols are required; a missing one fails the whole load.
#[derive(Debug)]
pub struct ControlProgram {
    handle: *mut c_void,
    config_init: ProgramVoidFn,
    config_run: ProgramRunFn,
    update_time: ProgramVoidFn,
    glue_vars: ProgramVoidFn,
    set_buffer_pointers: Option<SetBufferPointersFn>,
    common_ticktime: *const u64,
}

// Safety: only the scan-cycle thread calls the entry points; the handle is
// merely carried across threads, and `common_ticktime` is written once by
// the program at init.
unsafe impl Send for ControlProgram {}

impl ControlProgram {
    /// Load the dylib at `path` and resolve all entry points.
    pub fn load(path: &Path) -> Result<Self, ProgramError> {
        let path_str = path.to_string_lossy().into_owned();
        let c_path = CString::new(path_str.clone()).map_err(|_| ProgramError::OpenFailed {
            path: path_str.clone(),
            detail: "path contains NUL".into(),
        })?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(ProgramError::OpenFailed {
                path: path_str,
                detail: dl_error(),
            });
        }

        let program = unsafe {
            let config_init: ProgramVoidFn = std::mem::transmute(sym(handle, "config_init")?);
            let config_run: ProgramRunFn = std::mem::transmute(sym(handle, "config_run")?);
            let update_time: ProgramVoidFn = std::mem::transmute(sym(handle, "update_time")?);
            let glue_vars: ProgramVoidFn = std::mem::transmute(sym(handle, "glue_vars")?);
            let set_buffer_pointers: SetBufferPointersFn =
                std::mem::transmute(sym(handle, "set_buffer_pointers")?);
            let common_ticktime = sym(handle, "common_ticktime")? as *const u64;

            Self {
                handle,
                config_init,
                config_run,
                update_time,
                glue_vars,
                set_buffer_pointers: Some(set_buffer_pointers),
                common_ticktime,
            }
        };

        tracing::info!(target: "host", "loaded control program {}", path.display());
        Ok(program)
    }

    /// Assemble a program from resolved parts. Used by test fixtures; real
    /// programs come through [`ControlProgram::load`].
    pub fn from_parts(
        config_init: ProgramVoidFn,
        config_run: ProgramRunFn,
        update_time: ProgramVoidFn,
        glue_vars: ProgramVoidFn,
        set_buffer_pointers: Option<SetBufferPointersFn>,
        common_ticktime: *const u64,
    ) -> Self {
        Self {
            handle: std::ptr::null_mut(),
            config_init,
            config_run,
            update_time,
            glue_vars,
            set_buffer_pointers,
            common_ticktime,
        }
    }

    /// Push the image-table base pointers into the module.
    pub fn bind_tables(&self, t: TablePtrs) {
        if let Some(f) = self.set_buffer_pointers {
            unsafe {
                f(
                    t.bool_input,
                    t.bool_output,
                    t.bool_memory,
                    t.byte_input,
                    t.byte_output,
                    t.int_input,
                    t.int_output,
                    t.int_memory,
                    t.dint_input,
                    t.dint_output,
                    t.dint_memory,
                    t.lint_input,
                    t.lint_output,
                    t.lint_memory,
                )
            }
        }
    }

    /// One-shot init: establish variable storage, then wire it into the
    /// tables. Call with the image lock held.
    pub fn init(&self) {
        unsafe {
            (self.config_init)();
            (self.glue_vars)();
        }
    }

    /// Advance control logic by one tick. Scan thread only, lock held.
    pub fn run(&self, tick: u64) {
        unsafe { (self.config_run)(tick) };
    }

    /// Advance the program's internal clock. Scan thread only, lock held.
    pub fn update_time(&self) {
        unsafe { (self.update_time)() };
    }

    /// The program's exported tick period in nanoseconds. A zero export is
    /// replaced by [`DEFAULT_TICK_NS`].
    pub fn tick_period_ns(&self) -> u64 {
        let ns = if self.common_ticktime.is_null() {
            0
        } else {
            unsafe { *self.common_ticktime }
        };
        if ns == 0 {
            tracing::warn!(
                target: "host",
                "control program exports no tick time, using {} ms",
                DEFAULT_TICK_NS / 1_000_000
            );
            DEFAULT_TICK_NS
        } else {
            ns
        }
    }
}

impl Drop for ControlProgram {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // Safety: no entry point can be in flight — the scan engine
            // drops the program only from its own thread, outside a tick.
            unsafe { libc::dlclose(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }
}

fn dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dl error".into()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

/// Resolve one symbol, distinguishing "resolved to NULL" from "missing".
unsafe fn sym(handle: *mut c_void, name: &str) -> Result<*mut c_void, ProgramError> {
    let c_name = CString::new(name).expect("static symbol name");
    unsafe {
        libc::dlerror(); // clear any stale error
        let ptr = libc::dlsym(handle, c_name.as_ptr());
        let err = libc::dlerror();
        if !err.is_null() {
            return Err(ProgramError::SymbolMissing {
                symbol: name.into(),
                detail: CStr::from_ptr(err).to_string_lossy().into_owned(),
            });
        }
        if ptr.is_null() {
            return Err(ProgramError::SymbolMissing {
                symbol: name.into(),
                detail: "symbol resolved to NULL".into(),
            });
        }
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_rejects_missing_file() {
        let err = ControlProgram::load(Path::new("/nonexistent/libplc.so")).unwrap_err();
        assert!(matches!(err, ProgramError::OpenFailed { .. }));
    }

    #[test]
    fn stub_program_tick_period() {
        let p = crate::fixtures::stub_program(10_000_000);
        assert_eq!(p.tick_period_ns(), 10_000_000);

        let p = crate::fixtures::stub_program(0);
        assert_eq!(p.tick_period_ns(), DEFAULT_TICK_NS);
    }
}
