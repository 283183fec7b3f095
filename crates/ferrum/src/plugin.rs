//! Plugin definition macro.
//!
//! Generates the `#[no_mangle] extern "C-unwind"` entry points so plugin
//! authors just write normal Rust functions. The entry points use the
//! unwinding C ABI: a panic inside a hook unwinds into the host's fence,
//! which marks the instance unhealthy instead of aborting the runtime.

/// Define a ferrum plugin.
///
/// Generates `plugin_init`, `plugin_start`, `plugin_stop`, `plugin_cleanup`
/// and, in the six-function form, the optional `plugin_cycle_start` /
/// `plugin_cycle_end` hooks. The host skips the hooks when the symbols are
/// absent, so the four-function form opts out of per-cycle work entirely.
///
/// # Example
///
/// ```ignore
/// static STATE: std::sync::Mutex<Option<MyPlugin>> = std::sync::Mutex::new(None);
///
/// ferrum::define_plugin! {
///     fn init(rt: ferrum::Runtime) -> i32 {
///         *STATE.lock().unwrap() = Some(MyPlugin::new(rt));
///         0
///     }
///
///     fn start() {
///         if let Some(p) = STATE.lock().unwrap().as_mut() { p.start(); }
///     }
///
///     fn stop() {
///         if let Some(p) = STATE.lock().unwrap().as_mut() { p.stop(); }
///     }
///
///     fn cleanup() {
///         STATE.lock().unwrap().take();
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_plugin {
    (
        fn init($rt:ident : $rt_ty:ty) -> i32 $init_body:block

        fn start() $start_body:block

        fn stop() $stop_body:block

        fn cleanup() $cleanup_body:block

        fn cycle_start() $cycle_start_body:block

        fn cycle_end() $cycle_end_body:block
    ) => {
        $crate::define_plugin! {
            fn init($rt: $rt_ty) -> i32 $init_body
            fn start() $start_body
            fn stop() $stop_body
            fn cleanup() $cleanup_body
        }

        #[no_mangle]
        pub extern "C-unwind" fn plugin_cycle_start() {
            (|| $cycle_start_body)();
        }

        #[no_mangle]
        pub extern "C-unwind" fn plugin_cycle_end() {
            (|| $cycle_end_body)();
        }
    };

    (
        fn init($rt:ident : $rt_ty:ty) -> i32 $init_body:block

        fn start() $start_body:block

        fn stop() $stop_body:block

        fn cleanup() $cleanup_body:block
    ) => {
        /// # Safety
        ///
        /// `args` must be null or point at a live `RuntimeArgs`; the struct
        /// is copied out before this function returns.
        #[no_mangle]
        pub unsafe extern "C-unwind" fn plugin_init(
            args: *const $crate::RuntimeArgs,
        ) -> i32 {
            let $rt: $rt_ty = match unsafe { $crate::Runtime::from_raw(args) } {
                Some(rt) => rt,
                None => return -1,
            };
            (|| -> i32 { $init_body })()
        }

        #[no_mangle]
        pub extern "C-unwind" fn plugin_start() {
            (|| $start_body)();
        }

        #[no_mangle]
        pub extern "C-unwind" fn plugin_stop() {
            (|| $stop_body)();
        }

        #[no_mangle]
        pub extern "C-unwind" fn plugin_cleanup() {
            (|| $cleanup_body)();
        }
    };
}
