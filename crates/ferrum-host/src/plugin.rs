//! Plugin host — discovery, loading, lifecycle, cycle hooks.
//!
//! The roster file lists one plugin per non-comment line:
//!
//! ```text
//! # name, path, enabled, kind, config_path, env_path
//! s7comm, /usr/lib/ferrum/libs7comm_server.so, 1, native, /etc/ferrum/s7comm.json,
//! ```
//!
//! Native plugins are dylibs; the required entry points (`plugin_init`,
//! `plugin_start`, `plugin_stop`, `plugin_cleanup`) are resolved by name,
//! the cycle hooks (`plugin_cycle_start`, `plugin_cycle_end`) are optional
//! — a plugin opts into per-cycle work by exporting them.
//!
//! Every call into plugin code runs inside a failure fence: a panic
//! unwinding out of a hook is caught, logged, and marks the instance
//! unhealthy, which suppresses further calls — except `plugin_stop` /
//! `plugin_cleanup`, which still run at shutdown. A failed plugin never
//! stops the plant.

use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ferrum::{
    PluginCleanupFn, PluginCycleFn, PluginInitFn, PluginStartFn, PluginStopFn, RuntimeArgs,
    BITS_PER_BUFFER, BUFFER_SIZE,
};

use crate::image;
use crate::journal;
use crate::logging;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("cannot read plugin roster {path}: {source}")]
    RosterUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("dlopen {path} failed: {detail}")]
    OpenFailed { path: String, detail: String },
    #[error("required entry point `{symbol}` missing: {detail}")]
    EntryPointMissing { symbol: String, detail: String },
    #[error("plugin init returned status {0}")]
    InitFailed(i32),
}

// =============================================================================
// Descriptors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Native,
    Scripted,
}

#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub enabled: bool,
    pub kind: PluginKind,
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

/// Parse the roster text. Malformed lines are logged and skipped; the
/// survivors load.
pub fn parse_roster(text: &str) -> Vec<PluginDescriptor> {
    let mut out = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 6 {
            tracing::warn!(
                target: "plugin",
                "roster line {}: expected 6 fields, got {} — skipped",
                lineno + 1,
                fields.len()
            );
            continue;
        }
        let kind = match fields[3].to_ascii_lowercase().as_str() {
            "native" => PluginKind::Native,
            "scripted" => PluginKind::Scripted,
            other => {
                tracing::warn!(
                    target: "plugin",
                    "roster line {}: unknown kind `{}` — skipped",
                    lineno + 1,
                    other
                );
                continue;
            }
        };
        let enabled = matches!(
            fields[2].to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
        let opt_path = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(PathBuf::from(s))
            }
        };
        out.push(PluginDescriptor {
            name: fields[0].to_string(),
            path: PathBuf::from(fields[1]),
            enabled,
            kind,
            config_path: opt_path(fields[4]),
            env_path: opt_path(fields[5]),
        });
    }
    out
}

// =============================================================================
// Instances
// =============================================================================

struct EntryPoints {
    init: PluginInitFn,
    start: PluginStartFn,
    stop: PluginStopFn,
    cleanup: PluginCleanupFn,
    cycle_start: Option<PluginCycleFn>,
    cycle_end: Option<PluginCycleFn>,
}

pub struct PluginInstance {
    descriptor: PluginDescriptor,
    handle: *mut c_void,
    entry: EntryPoints,
    /// The host's canonical RuntimeArgs for this instance. Boxed so the
    /// address stays valid for the plugin's whole lifetime — plugins are
    /// told to copy, but the host keeps its side alive regardless.
    _args: Box<RuntimeArgs>,
    healthy: AtomicBool,
    started: AtomicBool,
}

// Safety: the dylib handle is only used from lifecycle methods; the entry
// points are plain code pointers into the loaded module.
unsafe impl Send for PluginInstance {}
unsafe impl Sync for PluginInstance {}

impl PluginInstance {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn has_cycle_hooks(&self) -> bool {
        self.entry.cycle_start.is_some() || self.entry.cycle_end.is_some()
    }

    /// Run one entry point inside the failure fence. `force` runs the call
    /// even on an unhealthy instance (stop/cleanup).
    fn invoke(&self, what: &str, force: bool, f: impl FnOnce()) {
        if !force && !self.is_healthy() {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            let detail = panic_message(&payload);
            tracing::error!(
                target: "plugin",
                "plugin `{}` panicked in {}: {} — instance marked unhealthy",
                self.descriptor.name,
                what,
                detail
            );
            self.healthy.store(false, Ordering::Relaxed);
        }
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // Safety: stop/cleanup have run; no plugin thread should be
            // alive past plugin_stop, so no code pointers remain in use.
            unsafe { libc::dlclose(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

// =============================================================================
// Runtime-args construction
// =============================================================================

/// Assemble the init bundle for one plugin: image-table base pointers, the
/// image-lock pair, the descriptor's config path, buffer dimensions, the
/// logging callbacks and the journal write callbacks.
pub fn build_runtime_args(config_path: Option<&Path>) -> RuntimeArgs {
    let t = image::table_ptrs();
    let config = config_path
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    RuntimeArgs {
        bool_input: t.bool_input,
        bool_output: t.bool_output,
        bool_memory: t.bool_memory,
        byte_input: t.byte_input,
        byte_output: t.byte_output,
        int_input: t.int_input,
        int_output: t.int_output,
        int_memory: t.int_memory,
        dint_input: t.dint_input,
        dint_output: t.dint_output,
        dint_memory: t.dint_memory,
        lint_input: t.lint_input,
        lint_output: t.lint_output,
        lint_memory: t.lint_memory,
        image_lock: image::image_lock,
        image_unlock: image::image_unlock,
        config_path: RuntimeArgs::pack_config_path(&config),
        buffer_size: BUFFER_SIZE as u32,
        bits_per_buffer: BITS_PER_BUFFER as u32,
        log_info: logging::plugin_log_info,
        log_debug: logging::plugin_log_debug,
        log_warn: logging::plugin_log_warn,
        log_error: logging::plugin_log_error,
        journal_write_bool: journal::journal_write_bool_cb,
        journal_write_byte: journal::journal_write_byte_cb,
        journal_write_int: journal::journal_write_int_cb,
        journal_write_dint: journal::journal_write_dint_cb,
        journal_write_lint: journal::journal_write_lint_cb,
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Owns all loaded instances. Built once at startup; the instance list is
/// read-only afterwards (per-instance health flags are atomics).
pub struct PluginDriver {
    plugins: Vec<PluginInstance>,
}

impl PluginDriver {
    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Read the roster file and load every enabled native descriptor.
    /// Individual failures are logged and skipped; the driver proceeds
    /// with the survivors.
    pub fn load_roster(path: &Path) -> Result<Self, PluginError> {
        let text =
            std::fs::read_to_string(path).map_err(|source| PluginError::RosterUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_descriptors(parse_roster(&text)))
    }

    pub fn from_descriptors(descriptors: Vec<PluginDescriptor>) -> Self {
        let mut plugins = Vec::new();
        for desc in descriptors {
            if !desc.enabled {
                tracing::debug!(target: "plugin", "plugin `{}` disabled, skipped", desc.name);
                continue;
            }
            match desc.kind {
                PluginKind::Scripted => {
                    // The interpreter bridge lives outside this runtime
                    // build; the descriptor format still reserves the kind.
                    tracing::warn!(
                        target: "plugin",
                        "plugin `{}` is scripted — no interpreter in this build, skipped",
                        desc.name
                    );
                }
                PluginKind::Native => match Self::load_native(&desc) {
                    Ok(instance) => {
                        tracing::info!(target: "plugin", "plugin `{}` initialised", desc.name);
                        plugins.push(instance);
                    }
                    Err(e) => {
                        tracing::error!(
                            target: "plugin",
                            "plugin `{}` rejected: {}",
                            desc.name,
                            e
                        );
                    }
                },
            }
        }
        Self { plugins }
    }

    fn load_native(desc: &PluginDescriptor) -> Result<PluginInstance, PluginError> {
        let path_str = desc.path.to_string_lossy().into_owned();
        let c_path = CString::new(path_str.clone()).map_err(|_| PluginError::OpenFailed {
            path: path_str.clone(),
            detail: "path contains NUL".into(),
        })?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(PluginError::OpenFailed {
                path: path_str,
                detail: dl_error(),
            });
        }

        let entry = match unsafe { resolve_entry_points(handle) } {
            Ok(entry) => entry,
            Err(e) => {
                unsafe { libc::dlclose(handle) };
                return Err(e);
            }
        };

        let args = Box::new(build_runtime_args(desc.config_path.as_deref()));

        // Init inside the fence: a panicking init is a failed init.
        let args_ptr: *const RuntimeArgs = &*args;
        let status = catch_unwind(AssertUnwindSafe(|| unsafe { (entry.init)(args_ptr) }))
            .unwrap_or_else(|payload| {
                tracing::error!(
                    target: "plugin",
                    "plugin `{}` panicked in init: {}",
                    desc.name,
                    panic_message(&payload)
                );
                -1
            });
        if status != 0 {
            unsafe { libc::dlclose(handle) };
            return Err(PluginError::InitFailed(status));
        }

        Ok(PluginInstance {
            descriptor: desc.clone(),
            handle,
            entry,
            _args: args,
            healthy: AtomicBool::new(true),
            started: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn instances(&self) -> impl Iterator<Item = &PluginInstance> {
        self.plugins.iter()
    }

    /// Start every healthy, not-yet-started instance. Invoked when the
    /// scan engine enters RUNNING.
    pub fn start_all(&self) {
        for p in &self.plugins {
            if p.started.swap(true, Ordering::Relaxed) {
                continue;
            }
            p.invoke("start", false, || unsafe { (p.entry.start)() });
        }
    }

    /// Stop every started instance, in reverse registration order. Runs
    /// even for unhealthy instances.
    pub fn stop_all(&self) {
        for p in self.plugins.iter().rev() {
            if !p.started.swap(false, Ordering::Relaxed) {
                continue;
            }
            p.invoke("stop", true, || unsafe { (p.entry.stop)() });
        }
    }

    /// Cleanup every instance, reverse order. Unloading happens when the
    /// driver drops.
    pub fn cleanup_all(&self) {
        for p in self.plugins.iter().rev() {
            p.invoke("cleanup", true, || unsafe { (p.entry.cleanup)() });
        }
    }

    /// Invoke `plugin_cycle_start` on every instance that exports it.
    /// Called by the scan thread with the image lock held.
    pub fn cycle_start_all(&self) {
        for p in &self.plugins {
            if let Some(hook) = p.entry.cycle_start {
                p.invoke("cycle_start", false, || unsafe { hook() });
            }
        }
    }

    /// Invoke `plugin_cycle_end` on every instance that exports it.
    pub fn cycle_end_all(&self) {
        for p in &self.plugins {
            if let Some(hook) = p.entry.cycle_end {
                p.invoke("cycle_end", false, || unsafe { hook() });
            }
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

/// Resolve the four required entry points and probe for the two optional
/// cycle hooks.
unsafe fn resolve_entry_points(handle: *mut c_void) -> Result<EntryPoints, PluginError> {
    unsafe fn required(handle: *mut c_void, name: &str) -> Result<*mut c_void, PluginError> {
        let c_name = CString::new(name).expect("static symbol name");
        unsafe {
            libc::dlerror();
            let ptr = libc::dlsym(handle, c_name.as_ptr());
            let err = libc::dlerror();
            if ptr.is_null() || !err.is_null() {
                return Err(PluginError::EntryPointMissing {
                    symbol: name.into(),
                    detail: if err.is_null() {
                        "symbol resolved to NULL".into()
                    } else {
                        CStr::from_ptr(err).to_string_lossy().into_owned()
                    },
                });
            }
            Ok(ptr)
        }
    }

    unsafe fn optional(handle: *mut c_void, name: &str) -> Option<*mut c_void> {
        let c_name = CString::new(name).expect("static symbol name");
        unsafe {
            libc::dlerror();
            let ptr = libc::dlsym(handle, c_name.as_ptr());
            let err = libc::dlerror();
            if ptr.is_null() || !err.is_null() {
                None
            } else {
                Some(ptr)
            }
        }
    }

    unsafe {
        Ok(EntryPoints {
            init: std::mem::transmute::<*mut c_void, PluginInitFn>(required(
                handle,
                "plugin_init",
            )?),
            start: std::mem::transmute::<*mut c_void, PluginStartFn>(required(
                handle,
                "plugin_start",
            )?),
            stop: std::mem::transmute::<*mut c_void, PluginStopFn>(required(
                handle,
                "plugin_stop",
            )?),
            cleanup: std::mem::transmute::<*mut c_void, PluginCleanupFn>(required(
                handle,
                "plugin_cleanup",
            )?),
            cycle_start: optional(handle, "plugin_cycle_start")
                .map(|p| std::mem::transmute::<*mut c_void, PluginCycleFn>(p)),
            cycle_end: optional(handle, "plugin_cycle_end")
                .map(|p| std::mem::transmute::<*mut c_void, PluginCycleFn>(p)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_parses_fields_and_skips_noise() {
        let text = "\
# comment line
s7comm, /usr/lib/libs7.so, 1, native, /etc/s7.json,
disabled-one, /usr/lib/libx.so, 0, native,,
py-bridge, /opt/plug.py, true, scripted,, /opt/venv
badline, only, three
mystery, /x.so, 1, fortran,,
";
        let descs = parse_roster(text);
        assert_eq!(descs.len(), 3);

        assert_eq!(descs[0].name, "s7comm");
        assert!(descs[0].enabled);
        assert_eq!(descs[0].kind, PluginKind::Native);
        assert_eq!(
            descs[0].config_path.as_deref(),
            Some(Path::new("/etc/s7.json"))
        );
        assert_eq!(descs[0].env_path, None);

        assert!(!descs[1].enabled);

        assert_eq!(descs[2].kind, PluginKind::Scripted);
        assert_eq!(descs[2].env_path.as_deref(), Some(Path::new("/opt/venv")));
    }

    #[test]
    fn disabled_and_scripted_descriptors_load_nothing() {
        let descs = parse_roster(
            "a, /nonexistent.so, 0, native,,\nb, /bridge.py, 1, scripted,,\n",
        );
        let driver = PluginDriver::from_descriptors(descs);
        assert!(driver.is_empty());
    }

    #[test]
    fn missing_dylib_is_rejected_not_fatal() {
        let descs = parse_roster("ghost, /nonexistent/plugin.so, 1, native,,\n");
        let driver = PluginDriver::from_descriptors(descs);
        assert!(driver.is_empty());
    }

    #[test]
    fn runtime_args_carry_dimensions_and_path() {
        let args = build_runtime_args(Some(Path::new("/etc/ferrum/s7.json")));
        assert_eq!(args.buffer_size, BUFFER_SIZE as u32);
        assert_eq!(args.bits_per_buffer, BITS_PER_BUFFER as u32);
        let rt = ferrum::Runtime::from_args(args);
        assert_eq!(
            rt.config_path().as_deref(),
            Some(Path::new("/etc/ferrum/s7.json"))
        );
    }
}
