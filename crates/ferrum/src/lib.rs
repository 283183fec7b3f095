//! Ferrum Interface — Plugin API
//!
//! This crate defines the ABI between the ferrum host and its field-bus
//! plugins. A plugin is a `cdylib` exporting six entry points (resolved by
//! symbol name at load time):
//!
//! | Symbol | Required | Called on |
//! |---|---|---|
//! | `plugin_init(*const RuntimeArgs) -> i32` | yes | host startup |
//! | `plugin_start()` | yes | scan engine entering RUNNING |
//! | `plugin_stop()` | yes | host shutdown |
//! | `plugin_cleanup()` | yes | host shutdown, after stop |
//! | `plugin_cycle_start()` | no | every tick, image lock held |
//! | `plugin_cycle_end()` | no | every tick, image lock held |
//!
//! The [`define_plugin!`] macro generates the `#[no_mangle]` boilerplate so
//! plugin authors just write normal Rust functions.
//!
//! # Ownership of `RuntimeArgs`
//!
//! The pointer handed to `plugin_init` is only guaranteed valid for the
//! duration of that call. Plugins must copy the struct out before returning
//! — [`Runtime::from_raw`] does exactly that. All function pointers inside
//! the struct point into the host binary and stay valid until
//! `plugin_cleanup` returns.
//!
//! # Image access rules
//!
//! - **Reads** go through the image lock: take it with [`Runtime::lock`],
//!   read cells through the returned guard, drop the guard promptly.
//! - **Writes** never touch the image tables directly. They go through the
//!   journal write callbacks ([`Runtime::write_bool`] and friends), which
//!   are safe to call from any thread at any time. The host applies all
//!   journaled writes, in submission order, at the start of the next scan
//!   cycle.
//! - Cycle hooks run with the image lock already held. They must not take
//!   it again and must return quickly — a slow hook lengthens every tick
//!   for every plugin.

pub mod runtime;
pub mod types;
mod plugin;

pub use runtime::{ImageGuard, PluginLog, Runtime, WriteError};
pub use types::*;
