//! Runtime entry point.
//!
//! Configuration comes from the environment, with `.env` in the state
//! directory as the fallback layer:
//!
//! | Key | Meaning | Default |
//! |---|---|---|
//! | `FERRUM_STATE_DIR` | persisted-state directory | `/var/lib/ferrum` |
//! | `FERRUM_PROGRAM` | control-program dylib | required |
//! | `FERRUM_PLUGINS` | plugin roster file | none (no plugins) |
//! | `FERRUM_LOG_LEVEL` | trace/debug/info/warn/error | `info` |

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ferrum_host::plugin::PluginDriver;
use ferrum_host::scan::{self, ScanEngine};
use ferrum_host::state::{StateDir, DEFAULT_STATE_DIR};
use ferrum_host::{control, journal, logging, watchdog};

fn lookup(env_file: &HashMap<String, String>, key: &str) -> Option<String> {
    std::env::var(key).ok().or_else(|| env_file.get(key).cloned())
}

fn main() -> ExitCode {
    let state_root =
        std::env::var("FERRUM_STATE_DIR").unwrap_or_else(|_| DEFAULT_STATE_DIR.to_string());
    let state = match StateDir::open(&state_root) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot open state directory {}: {}", state_root, e);
            return ExitCode::FAILURE;
        }
    };
    let env_file = state.load_env();

    let level = lookup(&env_file, "FERRUM_LOG_LEVEL")
        .and_then(|s| s.parse().ok())
        .unwrap_or(tracing::Level::INFO);
    let log_socket = state.log_socket();
    if let Err(e) = logging::init(level, Some(log_socket.as_path())) {
        eprintln!("cannot set up logging: {}", e);
        return ExitCode::FAILURE;
    }

    scan::install_signal_handlers();
    tracing::info!(target: "host", "ferrum runtime starting, state dir {}", state.root().display());

    // Control program: fatal if missing — there is nothing to run without
    // it when starting from EMPTY.
    let Some(program_path) = lookup(&env_file, "FERRUM_PROGRAM").map(PathBuf::from) else {
        tracing::error!(target: "host", "FERRUM_PROGRAM not set; nothing to run");
        return ExitCode::FAILURE;
    };

    let engine = ScanEngine::new();
    if let Err(e) = engine.load_program(&program_path) {
        tracing::error!(target: "host", "control program load failed: {}", e);
        return ExitCode::FAILURE;
    }

    // Plugins: individually fallible, never fatal.
    let driver = match lookup(&env_file, "FERRUM_PLUGINS").map(PathBuf::from) {
        Some(roster) => match PluginDriver::load_roster(&roster) {
            Ok(driver) => {
                tracing::info!(target: "plugin", "{} plugin(s) initialised", driver.len());
                Arc::new(driver)
            }
            Err(e) => {
                tracing::error!(target: "plugin", "plugin roster unusable: {} — continuing without plugins", e);
                Arc::new(PluginDriver::empty())
            }
        },
        None => Arc::new(PluginDriver::empty()),
    };
    engine.attach_driver(driver.clone());

    let control_handle = match control::spawn(&state.command_socket(), engine.clone()) {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::error!(target: "control", "command socket unavailable: {} — continuing headless", e);
            None
        }
    };
    let watchdog_handle = watchdog::spawn_monitor(engine.clone(), Duration::from_secs(5));

    if let Err(e) = engine.start() {
        tracing::error!(target: "host", "engine start failed: {}", e);
        return ExitCode::FAILURE;
    }

    // The scan loop owns the process lifetime: it returns when a signal or
    // a management command flips the cancellation flag.
    let scan_handle = engine.spawn_loop();
    let _ = scan_handle.join();

    tracing::info!(target: "host", "shutting down");
    driver.stop_all();
    driver.cleanup_all();
    journal::journal().cleanup();

    let _ = watchdog_handle.join();
    if let Some(h) = control_handle {
        let _ = h.join();
    }
    let _ = std::fs::remove_file(state.command_socket());
    let _ = std::fs::remove_file(state.log_socket());

    tracing::info!(target: "host", "bye");
    ExitCode::SUCCESS
}
