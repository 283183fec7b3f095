//! Watchdog heartbeat.
//!
//! The scan thread publishes a timestamp once per tick; a monitor thread
//! logs when the heartbeat goes stale. Killing a wedged runtime is the
//! external watchdog's job — this side only produces the evidence.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

static HEARTBEAT: AtomicI64 = AtomicI64::new(0);

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Publish the current timestamp. Called by the scan thread each tick.
pub fn beat() {
    HEARTBEAT.store(unix_now(), Ordering::Relaxed);
}

/// Seconds-resolution timestamp of the last beat; 0 before the first.
pub fn last_beat() -> i64 {
    HEARTBEAT.load(Ordering::Relaxed)
}

/// Watch the heartbeat and log when it stalls while the engine claims to
/// be running.
pub fn spawn_monitor(
    engine: crate::scan::ScanEngine,
    stale_after: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("plc-watchdog".into())
        .spawn(move || {
            let stale_secs = stale_after.as_secs().max(1) as i64;
            let mut warned = false;
            while crate::scan::keep_running() {
                std::thread::sleep(Duration::from_secs(1));
                if engine.state() != crate::scan::EngineState::Running {
                    warned = false;
                    continue;
                }
                let last = last_beat();
                let age = unix_now() - last;
                if last != 0 && age > stale_secs {
                    if !warned {
                        tracing::warn!(
                            target: "watchdog",
                            "heartbeat stale for {}s (threshold {}s)",
                            age,
                            stale_secs
                        );
                    }
                    warned = true;
                } else {
                    warned = false;
                }
            }
        })
        .expect("spawn watchdog thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_publishes_recent_timestamp() {
        beat();
        let now = unix_now();
        assert!((now - last_beat()).abs() <= 1);
    }
}
