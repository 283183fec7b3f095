//! Scan-cycle engine.
//!
//! One dedicated thread drives the control program at the period the
//! program exports. Each tick, under the image lock: apply the journal,
//! run plugin `cycle_start` hooks, advance the control program, run
//! `cycle_end` hooks. Then record timing, publish the watchdog heartbeat
//! and sleep until the next tick on a monotonic clock.
//!
//! Overruns are fail-sloppy: a tick that runs longer than the period bumps
//! the overrun counter and the next tick starts immediately. Missed ticks
//! are never caught up, so a transient spike does not stop a plant.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::image;
use crate::journal::{journal, BufferPtrs};
use crate::plugin::PluginDriver;
use crate::program::{ControlProgram, ProgramError};
use crate::watchdog;

// =============================================================================
// Process-wide cancellation
// =============================================================================

static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

pub fn keep_running() -> bool {
    KEEP_RUNNING.load(Ordering::Relaxed)
}

/// Flip the cancellation flag. The scan loop polls it once per tick and
/// exits cleanly after the current tick.
pub fn request_shutdown() {
    KEEP_RUNNING.store(false, Ordering::Relaxed);
}

extern "C" fn on_signal(_sig: libc::c_int) {
    KEEP_RUNNING.store(false, Ordering::Relaxed);
}

/// Route SIGINT/SIGTERM into [`request_shutdown`].
pub fn install_signal_handlers() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}

// =============================================================================
// Engine state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No control program loaded.
    Empty,
    /// Loaded, bindings established, not ticking.
    Init,
    Running,
    /// Quiescent but loaded.
    Stopped,
    /// Terminal until an external reset (reload).
    Error,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Empty => "empty",
            EngineState::Init => "init",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
            EngineState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no control program loaded")]
    NoProgram,
    #[error("operation not valid while {0}")]
    InvalidState(EngineState),
    #[error(transparent)]
    Load(#[from] ProgramError),
}

// =============================================================================
// Timing statistics
// =============================================================================

/// Rolling timing figures, all in microseconds. `scan_time` covers the
/// locked portion of the tick (steps 1–7); `cycle_time` is start-to-start;
/// `latency` is actual start minus scheduled start.
#[derive(Debug, Clone, Copy)]
pub struct TimingStats {
    pub scan_time_min: i64,
    pub scan_time_max: i64,
    pub scan_time_avg: i64,
    pub cycle_time_min: i64,
    pub cycle_time_max: i64,
    pub cycle_time_avg: i64,
    pub latency_min: i64,
    pub latency_max: i64,
    pub latency_avg: i64,
    pub scan_count: i64,
    pub overruns: i64,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self {
            scan_time_min: i64::MAX,
            scan_time_max: 0,
            scan_time_avg: 0,
            cycle_time_min: i64::MAX,
            cycle_time_max: 0,
            cycle_time_avg: 0,
            latency_min: i64::MAX,
            latency_max: 0,
            latency_avg: 0,
            scan_count: 0,
            overruns: 0,
        }
    }
}

/// Internal ledger: stats plus the reference instants the deltas hang off.
struct TimingLedger {
    stats: TimingStats,
    /// Monotonic origin all instants are measured against.
    origin: Instant,
    /// Scheduled start of the current cycle, µs after origin.
    expected_start: i64,
    /// Actual start of the current cycle, µs after origin.
    last_start: i64,
}

impl TimingLedger {
    fn new() -> Self {
        Self {
            stats: TimingStats::default(),
            origin: Instant::now(),
            expected_start: 0,
            last_start: 0,
        }
    }

    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn reset(&mut self, period_us: i64) {
        let now = self.now_us();
        self.stats = TimingStats::default();
        self.expected_start = now + period_us;
        self.last_start = now;
        self.stats.scan_count = 1;
    }

    /// Record the start of a cycle. The first cycle only seeds the ledger.
    fn cycle_start(&mut self, period_us: i64) {
        if self.stats.scan_count == 0 {
            self.reset(period_us);
            return;
        }
        let now = self.now_us();

        let cycle_time = now - self.last_start;
        self.stats.cycle_time_min = self.stats.cycle_time_min.min(cycle_time);
        self.stats.cycle_time_max = self.stats.cycle_time_max.max(cycle_time);
        self.stats.cycle_time_avg +=
            (cycle_time - self.stats.cycle_time_avg) / self.stats.scan_count;

        let latency = now - self.expected_start;
        self.stats.latency_min = self.stats.latency_min.min(latency);
        self.stats.latency_max = self.stats.latency_max.max(latency);
        self.stats.latency_avg += (latency - self.stats.latency_avg) / self.stats.scan_count;

        self.last_start = now;
        self.expected_start += period_us;
        self.stats.scan_count += 1;
    }

    /// Record the end of the locked portion; detects overruns.
    fn scan_end(&mut self) {
        let now = self.now_us();
        let scan_time = now - self.last_start;
        self.stats.scan_time_min = self.stats.scan_time_min.min(scan_time);
        self.stats.scan_time_max = self.stats.scan_time_max.max(scan_time);
        self.stats.scan_time_avg +=
            (scan_time - self.stats.scan_time_avg) / self.stats.scan_count.max(1);

        if now > self.expected_start {
            self.stats.overruns += 1;
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

struct Control {
    state: EngineState,
    program: Option<ControlProgram>,
    program_path: Option<PathBuf>,
    period: Duration,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    ledger: Mutex<TimingLedger>,
    tick_counter: AtomicU64,
    driver: OnceLock<Arc<PluginDriver>>,
}

/// Read-only status snapshot for diagnostics and the command socket.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub state: EngineState,
    pub tick_counter: u64,
    pub stats: TimingStats,
}

#[derive(Clone)]
pub struct ScanEngine {
    shared: Arc<Shared>,
}

impl ScanEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: EngineState::Empty,
                    program: None,
                    program_path: None,
                    period: Duration::from_nanos(crate::program::DEFAULT_TICK_NS),
                }),
                wake: Condvar::new(),
                ledger: Mutex::new(TimingLedger::new()),
                tick_counter: AtomicU64::new(0),
                driver: OnceLock::new(),
            }),
        }
    }

    /// Attach the plugin driver whose cycle hooks the tick invokes. Called
    /// once at startup, before the engine starts ticking.
    pub fn attach_driver(&self, driver: Arc<PluginDriver>) {
        let _ = self.shared.driver.set(driver);
    }

    /// EMPTY → INIT: load the dylib, bind tables, run program init, wire
    /// the journal at the image tables.
    pub fn load_program(&self, path: &Path) -> Result<(), EngineError> {
        let program = ControlProgram::load(path)?;
        self.install_program_inner(program, Some(path.to_path_buf()))
    }

    /// Same transition with an already-assembled program (test fixtures).
    pub fn install_program(&self, program: ControlProgram) -> Result<(), EngineError> {
        self.install_program_inner(program, None)
    }

    fn install_program_inner(
        &self,
        program: ControlProgram,
        path: Option<PathBuf>,
    ) -> Result<(), EngineError> {
        let mut ctl = self.lock_control();
        if ctl.state == EngineState::Running {
            return Err(EngineError::InvalidState(ctl.state));
        }

        {
            let _img = image::lock();
            program.bind_tables(image::table_ptrs());
            program.init();
        }
        journal().init(BufferPtrs {
            tables: image::table_ptrs(),
            buffer_size: ferrum::BUFFER_SIZE as u16,
            image_lock: image::image_lock,
            image_unlock: image::image_unlock,
        });

        ctl.period = Duration::from_nanos(program.tick_period_ns());
        ctl.program = Some(program);
        if path.is_some() {
            ctl.program_path = path;
        }
        ctl.state = EngineState::Init;
        self.shared.tick_counter.store(0, Ordering::Relaxed);

        let period_us = ctl.period.as_micros() as i64;
        self.lock_ledger().reset(period_us);

        tracing::info!(
            target: "scan",
            "control program installed, tick period {} us",
            period_us
        );
        Ok(())
    }

    /// INIT|STOPPED → RUNNING. Starts surviving plugin instances.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut ctl = self.lock_control();
        match ctl.state {
            EngineState::Init | EngineState::Stopped => {
                ctl.state = EngineState::Running;
                drop(ctl);
                self.shared.wake.notify_all();
                if let Some(driver) = self.shared.driver.get() {
                    driver.start_all();
                }
                tracing::info!(target: "scan", "scan cycle running");
                Ok(())
            }
            EngineState::Running => Ok(()),
            other => Err(EngineError::InvalidState(other)),
        }
    }

    /// RUNNING → STOPPED.
    pub fn stop(&self) -> Result<(), EngineError> {
        let mut ctl = self.lock_control();
        match ctl.state {
            EngineState::Running | EngineState::Init => {
                ctl.state = EngineState::Stopped;
                tracing::info!(target: "scan", "scan cycle stopped");
                Ok(())
            }
            EngineState::Stopped => Ok(()),
            other => Err(EngineError::InvalidState(other)),
        }
    }

    /// Drop the loaded program and load it again from its recorded path.
    /// Restores the running state afterwards. A failed load is terminal
    /// (`ERROR`) until the next successful reload.
    pub fn reload(&self) -> Result<(), EngineError> {
        let (path, was_running) = {
            let mut ctl = self.lock_control();
            let Some(path) = ctl.program_path.clone() else {
                return Err(EngineError::NoProgram);
            };
            let was_running = ctl.state == EngineState::Running;
            ctl.state = EngineState::Stopped;
            ctl.program = None;
            (path, was_running)
        };

        journal().cleanup();
        match self.load_program(&path) {
            Ok(()) => {
                if was_running {
                    self.start()?;
                }
                Ok(())
            }
            Err(e) => {
                self.lock_control().state = EngineState::Error;
                Err(e)
            }
        }
    }

    pub fn state(&self) -> EngineState {
        self.lock_control().state
    }

    pub fn tick_counter(&self) -> u64 {
        self.shared.tick_counter.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TimingStats {
        self.lock_ledger().stats
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            tick_counter: self.tick_counter(),
            stats: self.stats(),
        }
    }

    /// Spawn the scan thread. The loop exits when [`request_shutdown`]
    /// fires (polled once per tick, between heartbeat and sleep).
    pub fn spawn_loop(&self) -> std::thread::JoinHandle<()> {
        let engine = self.clone();
        std::thread::Builder::new()
            .name("plc-scan".into())
            .spawn(move || engine.run_loop())
            .expect("spawn scan thread")
    }

    pub fn run_loop(&self) {
        while keep_running() {
            let ctl = self.lock_control();
            if ctl.state != EngineState::Running {
                // Parked: wake on state change, or time out to re-check
                // the cancellation flag.
                let (ctl, _timeout) = self
                    .shared
                    .wake
                    .wait_timeout(ctl, Duration::from_millis(100))
                    .expect("engine control lock poisoned");
                drop(ctl);
                continue;
            }

            let period = ctl.period;
            let tick_start = Instant::now();
            self.tick(ctl, period);

            if !keep_running() {
                break;
            }

            let deadline = tick_start + period;
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            }
            // Overrun: no sleep, next tick starts immediately.
        }
        tracing::info!(target: "scan", "scan loop exited");
    }

    /// One tick. `ctl` is held across the body so management commands
    /// serialise against tick boundaries.
    fn tick(&self, ctl: std::sync::MutexGuard<'_, Control>, period: Duration) {
        let period_us = period.as_micros() as i64;
        self.lock_ledger().cycle_start(period_us);

        let Some(program) = ctl.program.as_ref() else {
            drop(ctl);
            return;
        };

        {
            let _img = image::lock();
            journal().apply_and_clear();

            let driver = self.shared.driver.get();
            if let Some(d) = driver {
                d.cycle_start_all();
            }

            let tick = self.shared.tick_counter.fetch_add(1, Ordering::Relaxed);
            program.run(tick);
            program.update_time();

            if let Some(d) = driver {
                d.cycle_end_all();
            }
        }

        drop(ctl);
        self.lock_ledger().scan_end();
        watchdog::beat();
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.shared
            .control
            .lock()
            .expect("engine control lock poisoned")
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, TimingLedger> {
        self.shared.ledger.lock().expect("timing ledger poisoned")
    }
}

impl Default for ScanEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_first_cycle_seeds_only() {
        let mut ledger = TimingLedger::new();
        ledger.cycle_start(10_000);
        assert_eq!(ledger.stats.scan_count, 1);
        assert_eq!(ledger.stats.cycle_time_max, 0);
    }

    #[test]
    fn ledger_counts_overrun_when_past_schedule() {
        let mut ledger = TimingLedger::new();
        // Seed with a 0 µs period: the very next scan_end is already late.
        ledger.cycle_start(0);
        std::thread::sleep(Duration::from_millis(2));
        ledger.scan_end();
        assert_eq!(ledger.stats.overruns, 1);
        assert!(ledger.stats.scan_time_max >= 1_000);
    }

    #[test]
    fn state_machine_transitions() {
        let engine = ScanEngine::new();
        assert_eq!(engine.state(), EngineState::Empty);

        // start without a program is invalid
        assert!(engine.start().is_err());

        crate::fixtures::bind_global_tables();
        engine
            .install_program(crate::fixtures::stub_program(10_000_000))
            .unwrap();
        assert_eq!(engine.state(), EngineState::Init);

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        // idempotent start
        engine.start().unwrap();

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.start().unwrap();
        engine.stop().unwrap();
    }

    #[test]
    fn reload_without_path_fails() {
        let engine = ScanEngine::new();
        assert!(matches!(engine.reload(), Err(EngineError::NoProgram)));
    }
}
