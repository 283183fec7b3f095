//! End-to-end scan-cycle scenarios against the process-wide tables and
//! journal.
//!
//! These tests share global state (image tables, journal, engines), so
//! they serialise on one lock and each test uses its own slots.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ferrum::BufferType;
use ferrum_host::fixtures::{self, FixtureTables};
use ferrum_host::journal::journal;
use ferrum_host::scan::{EngineState, ScanEngine};
use ferrum_host::{image, journal as journal_mod};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> (MutexGuard<'static, ()>, &'static FixtureTables) {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fix = fixtures::bind_global_tables();
    fixtures::set_stub_run_delay(Duration::from_millis(0));
    (guard, fix)
}

fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}

#[test]
fn single_tick_applies_single_write() {
    let (_guard, fix) = setup();

    let engine = ScanEngine::new();
    engine
        .install_program(fixtures::stub_program(10_000_000))
        .unwrap();
    engine.start().unwrap();
    let _loop_thread = engine.spawn_loop();

    // A plugin writes between ticks: int_output[7] = 0x1234.
    assert_eq!(journal_mod::journal_write_int_cb(6, 7, 0x1234), 0);

    assert!(
        wait_until(Duration::from_secs(2), || fix.int_output(7) == 0x1234),
        "write not applied by the tick"
    );
    assert!(
        wait_until(Duration::from_secs(1), || journal().pending() == 0),
        "journal not drained after apply"
    );

    engine.stop().unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[test]
fn last_writer_wins_between_ticks() {
    let (_guard, fix) = setup();

    let engine = ScanEngine::new();
    engine
        .install_program(fixtures::stub_program(5_000_000))
        .unwrap();

    // Two writers hit the same bit before any tick runs: A=true, B=false.
    assert_eq!(journal_mod::journal_write_bool_cb(1, 3, 0, 1), 0);
    assert_eq!(journal_mod::journal_write_bool_cb(1, 3, 0, 0), 0);

    engine.start().unwrap();
    let _loop_thread = engine.spawn_loop();

    assert!(
        wait_until(Duration::from_secs(1), || journal().pending() == 0),
        "journal not applied"
    );
    assert!(!fix.bool_output(3, 0), "later write must win");

    engine.stop().unwrap();
}

#[test]
fn tick_counter_advances_and_overruns_count() {
    let (_guard, _fix) = setup();

    let engine = ScanEngine::new();
    engine
        .install_program(fixtures::stub_program(1_000_000)) // 1 ms period
        .unwrap();
    fixtures::set_stub_run_delay(Duration::from_millis(3)); // 3 ms per step

    fixtures::reset_stub_run_count();
    engine.start().unwrap();
    let _loop_thread = engine.spawn_loop();

    std::thread::sleep(Duration::from_millis(120));
    engine.stop().unwrap();
    fixtures::set_stub_run_delay(Duration::from_millis(0));
    std::thread::sleep(Duration::from_millis(20)); // let the last tick finish

    let stats = engine.stats();
    let ticks = engine.tick_counter();

    // Each ~3 ms step against a 1 ms period is an overrun, and ticks keep
    // advancing one per iteration instead of being skipped.
    assert!(ticks >= 10, "expected steady ticking, got {} ticks", ticks);
    assert!(
        stats.overruns >= (ticks as i64) - 2,
        "expected one overrun per tick: ticks={} overruns={}",
        ticks,
        stats.overruns
    );
    assert_eq!(fixtures::stub_run_count(), ticks);
}

#[test]
fn concurrent_writers_are_never_dropped() {
    let (_guard, fix) = setup();

    // No engine here: writers race each other (and the emergency flush),
    // then one apply under the image lock settles everything.
    journal().init(journal_mod::BufferPtrs {
        tables: image::table_ptrs(),
        buffer_size: ferrum::BUFFER_SIZE as u16,
        image_lock: image::image_lock,
        image_unlock: image::image_unlock,
    });

    const WRITERS: usize = 8;
    const WRITES_PER_SLOT: u16 = 300; // 8 * 300 > journal capacity

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        handles.push(std::thread::spawn(move || {
            let slot = 100 + w as u16;
            for i in 1..=WRITES_PER_SLOT {
                assert_eq!(journal_mod::journal_write_int_cb(7, slot, i), 0);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    {
        let _img = image::lock();
        journal().apply_and_clear();
    }
    assert_eq!(journal().pending(), 0);

    // Per-slot writes are ordered by their writer, so every slot must hold
    // that writer's final value — emergency flushes accounted for all of
    // the excess.
    for w in 0..WRITERS {
        assert_eq!(
            fix.peek(BufferType::IntMemory, 100 + w),
            WRITES_PER_SLOT as u64,
            "slot {} lost its last write",
            100 + w
        );
    }
}

#[test]
fn stopped_engine_leaves_journal_pending() {
    let (_guard, _fix) = setup();

    let engine = ScanEngine::new();
    engine
        .install_program(fixtures::stub_program(5_000_000))
        .unwrap();
    // Engine never started: writes must sit in the journal untouched.
    assert_eq!(journal_mod::journal_write_int_cb(7, 200, 42), 0);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(journal().pending(), 1);

    // Drain for the next test.
    {
        let _img = image::lock();
        journal().apply_and_clear();
    }
}
