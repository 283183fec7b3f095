//! Transcoding between image-table cells and wire bytes, exercised
//! directly against the runtime's tables (no TCP in the way).

use std::sync::{Mutex, MutexGuard};

use ferrum::{BufferType, Runtime, BUFFER_SIZE};
use ferrum_host::fixtures::{self, FixtureTables};
use ferrum_host::journal::{journal, BufferPtrs};
use ferrum_host::{image, plugin};

use s7comm_server::areas::{self, AreaTable};
use s7comm_server::config::S7Config;
use s7comm_server::s7;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup(config: &str) -> (MutexGuard<'static, ()>, &'static FixtureTables, Runtime, AreaTable) {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fix = fixtures::bind_global_tables();
    journal().init(BufferPtrs {
        tables: image::table_ptrs(),
        buffer_size: BUFFER_SIZE as u16,
        image_lock: image::image_lock,
        image_unlock: image::image_unlock,
    });
    let cfg = S7Config::parse_str(config).unwrap();
    let table = AreaTable::from_config(&cfg, None);
    let rt = Runtime::from_args(plugin::build_runtime_args(None));
    (guard, fix, rt, table)
}

fn apply_journal() {
    let _img = image::lock();
    journal().apply_and_clear();
}

#[test]
fn dint_reads_are_big_endian() {
    let (_g, fix, rt, table) = setup(
        r#"{ "data_blocks": [
            { "db_number": 1, "size_bytes": 8,
              "mapping": { "type": "dint_output", "start_buffer": 4 } } ] }"#,
    );
    fix.poke(BufferType::DintOutput, 4, 0xDEAD_BEEF);
    fix.poke(BufferType::DintOutput, 5, 0x0102_0304);

    let area = table.find(s7::AREA_DB, 1).unwrap();
    let mut out = [0u8; 8];
    areas::read_area(&rt, area, 0, &mut out);
    assert_eq!(
        out,
        [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04]
    );

    // Offset arithmetic: byte offset 4 is element 1 of the area, which is
    // start_buffer + 1.
    let mut out = [0u8; 4];
    areas::read_area(&rt, area, 4, &mut out);
    assert_eq!(out, [0x01, 0x02, 0x03, 0x04]);
}

#[test]
fn bool_reads_pack_bits_lsb_first() {
    let (_g, fix, rt, table) = setup(
        r#"{ "system_areas": { "pa": { "enabled": true, "size_bytes": 2,
            "mapping": { "type": "bool_output", "start_buffer": 10 } } } }"#,
    );
    fix.poke_bit(BufferType::BoolOutput, 10, 0, true);
    fix.poke_bit(BufferType::BoolOutput, 10, 3, true);
    fix.poke_bit(BufferType::BoolOutput, 11, 7, true);

    let area = table.find(s7::AREA_PA, 0).unwrap();
    let mut out = [0u8; 2];
    areas::read_area(&rt, area, 0, &mut out);
    assert_eq!(out, [0b0000_1001, 0b1000_0000]);
}

#[test]
fn writes_journal_per_cell_in_frame_order() {
    let (_g, fix, rt, table) = setup(
        r#"{ "data_blocks": [
            { "db_number": 2, "size_bytes": 8,
              "mapping": { "type": "int_memory", "start_buffer": 50 } } ] }"#,
    );

    let area = table.find(s7::AREA_DB, 2).unwrap();
    areas::write_area(&rt, area, 0, &[0x11, 0x22, 0x33, 0x44]);
    assert_eq!(journal().pending(), 2);

    apply_journal();
    assert_eq!(fix.peek(BufferType::IntMemory, 50), 0x1122);
    assert_eq!(fix.peek(BufferType::IntMemory, 51), 0x3344);
}

#[test]
fn bool_writes_fan_out_to_bits() {
    let (_g, fix, rt, table) = setup(
        r#"{ "system_areas": { "mk": { "enabled": true, "size_bytes": 1,
            "mapping": { "type": "bool_memory", "start_buffer": 20 } } } }"#,
    );

    let area = table.find(s7::AREA_MK, 0).unwrap();
    areas::write_area(&rt, area, 0, &[0b1010_0001]);
    // one journal entry per bit of the byte
    assert_eq!(journal().pending(), 8);

    apply_journal();
    assert!(fix.peek_bit(BufferType::BoolMemory, 20, 0));
    assert!(!fix.peek_bit(BufferType::BoolMemory, 20, 1));
    assert!(fix.peek_bit(BufferType::BoolMemory, 20, 5));
    assert!(fix.peek_bit(BufferType::BoolMemory, 20, 7));
}

#[test]
fn reads_clamp_at_table_end() {
    let (_g, fix, rt, table) = setup(&format!(
        r#"{{ "data_blocks": [
            {{ "db_number": 3, "size_bytes": 8,
              "mapping": {{ "type": "int_input", "start_buffer": {} }} }} ] }}"#,
        BUFFER_SIZE - 2
    ));
    fix.poke(BufferType::IntInput, BUFFER_SIZE - 2, 0xAB01);
    fix.poke(BufferType::IntInput, BUFFER_SIZE - 1, 0xAB02);

    let area = table.find(s7::AREA_DB, 3).unwrap();
    let mut out = [0u8; 8];
    areas::read_area(&rt, area, 0, &mut out);
    // Two elements exist before the table bound; the rest stays zero.
    assert_eq!(&out[..4], &[0xAB, 0x01, 0xAB, 0x02]);
    assert_eq!(&out[4..], &[0, 0, 0, 0]);
}

#[test]
fn writes_clamp_at_table_end() {
    let (_g, fix, rt, table) = setup(&format!(
        r#"{{ "data_blocks": [
            {{ "db_number": 4, "size_bytes": 8,
              "mapping": {{ "type": "int_output", "start_buffer": {} }} }} ] }}"#,
        BUFFER_SIZE - 1
    ));

    let area = table.find(s7::AREA_DB, 4).unwrap();
    areas::write_area(&rt, area, 0, &[0x0A, 0x0B, 0x0C, 0x0D]);
    // Only the one in-range element was journalled.
    assert_eq!(journal().pending(), 1);

    apply_journal();
    assert_eq!(fix.peek(BufferType::IntOutput, BUFFER_SIZE - 1), 0x0A0B);
}
