//! Ferrum host — a soft-real-time PLC runtime.
//!
//! The host repeatedly executes a compiled control program against shared
//! image tables while exposing those tables to field-bus plugins. The
//! pieces, leaves first:
//!
//! - [`image`] — the fourteen typed pointer tables and the single image
//!   lock that serialises all access to them.
//! - [`journal`] — the sequenced write log absorbing plugin writes between
//!   ticks, applied atomically at tick start (last writer wins).
//! - [`program`] — loader for the control-program dylib.
//! - [`scan`] — the scan-cycle engine: apply journal, run hooks, run one
//!   control iteration, sleep until the next tick.
//! - [`plugin`] — the plugin driver: roster parsing, dlopen, lifecycle,
//!   cycle hooks, panic fencing.
//! - [`control`], [`logging`], [`state`], [`watchdog`] — management
//!   socket, log sink, persisted-state layout, heartbeat.
//!
//! Locking discipline, global and never violated: when both locks are
//! needed, the **image lock** comes before the **journal lock**. The tick
//! takes the image lock and `apply_and_clear` takes the journal lock
//! inside it; plugin write callbacks take only the journal lock; the
//! journal's emergency flush releases its own lock before taking the
//! image lock, then re-takes its own.

pub mod control;
pub mod fixtures;
pub mod image;
pub mod journal;
pub mod logging;
pub mod plugin;
pub mod program;
pub mod scan;
pub mod state;
pub mod watchdog;
