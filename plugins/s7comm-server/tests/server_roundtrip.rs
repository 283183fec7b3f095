//! Full-stack round trips: a TCP client speaking ISO-on-TCP/S7 against a
//! server wired to the runtime's image tables and journal.

use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ferrum::{BufferType, Runtime};
use ferrum_host::fixtures::{self, FixtureTables};
use ferrum_host::journal::{journal, BufferPtrs};
use ferrum_host::{image, plugin};

use s7comm_server::areas::AreaTable;
use s7comm_server::config::S7Config;
use s7comm_server::server::S7Server;
use s7comm_server::{identity_of, iso, make_rw_callback, s7, server_params};

static TEST_LOCK: Mutex<()> = Mutex::new(());

const TEST_CONFIG: &str = r#"{
    "server": { "bind_address": "127.0.0.1", "port": 10102, "max_clients": 4,
                "recv_timeout_ms": 200, "ping_timeout_ms": 2000 },
    "identity": { "name": "ROUNDTRIP PLC" },
    "data_blocks": [
        { "db_number": 10, "size_bytes": 4,
          "mapping": { "type": "int_input", "start_buffer": 0 } },
        { "db_number": 20, "size_bytes": 16,
          "mapping": { "type": "int_output", "start_buffer": 0 } },
        { "db_number": 30, "size_bytes": 8,
          "mapping": { "type": "lint_memory", "start_buffer": 0 } }
    ],
    "system_areas": {
        "mk": { "enabled": true, "size_bytes": 4,
                "mapping": { "type": "bool_memory", "start_buffer": 0, "bit_addressing": true } }
    },
    "logging": { "log_connections": false, "log_errors": false }
}"#;

struct TestStack {
    _guard: MutexGuard<'static, ()>,
    fix: &'static FixtureTables,
    server: S7Server,
    stream: TcpStream,
}

fn setup() -> TestStack {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let fix = fixtures::bind_global_tables();
    journal().init(BufferPtrs {
        tables: image::table_ptrs(),
        buffer_size: ferrum::BUFFER_SIZE as u16,
        image_lock: image::image_lock,
        image_unlock: image::image_unlock,
    });

    let mut cfg = S7Config::parse_str(TEST_CONFIG).unwrap();
    cfg.server.port = 0; // ephemeral for the test listener

    let rt = Runtime::from_args(plugin::build_runtime_args(None));
    let areas = Arc::new(AreaTable::from_config(&cfg, None));
    let server = S7Server::new(
        server_params(&cfg),
        identity_of(&cfg),
        cfg.logging.clone(),
        None,
    );
    areas.register_all(&server, None);
    server.set_rw_callback(make_rw_callback(rt, areas, rt.logger("s7comm-test")));

    let addr = server.start().expect("bind test listener");
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut stack = TestStack {
        _guard: guard,
        fix,
        server,
        stream,
    };
    handshake(&mut stack.stream);
    stack
}

// =============================================================================
// Minimal test client
// =============================================================================

fn send_pdu(stream: &mut TcpStream, pdu: &[u8]) -> Vec<u8> {
    iso::write_frame(stream, &iso::build_data(pdu)).expect("send");
    let frame = iso::read_frame(stream).expect("receive");
    match iso::parse_tpdu(&frame).expect("cotp") {
        iso::CotpTpdu::Data { payload } => payload,
        other => panic!("unexpected TPDU {:?}", other),
    }
}

fn handshake(stream: &mut TcpStream) {
    // COTP connection request, then S7 communication setup.
    let cr = [
        0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1, 0x02, 0x01, 0x00, 0xC2,
        0x02, 0x01, 0x02,
    ];
    iso::write_frame(stream, &cr).expect("send CR");
    let frame = iso::read_frame(stream).expect("read CC");
    assert_eq!(frame[1], 0xD0, "expected connection confirm");

    let setup = job(
        1,
        &[s7::FUNC_SETUP, 0x00, 0x00, 0x01, 0x00, 0x01, 0x03, 0xC0],
        &[],
    );
    let resp = send_pdu(stream, &setup);
    assert_eq!(resp[1], s7::ROSCTR_ACK_DATA);
    // negotiated PDU is the last two bytes of the parameter block
    let pdu = u16::from_be_bytes([resp[18], resp[19]]);
    assert_eq!(pdu, 480);
}

fn job(pdu_ref: u16, param: &[u8], data: &[u8]) -> Vec<u8> {
    let mut pdu = vec![s7::PROTOCOL_ID, s7::ROSCTR_JOB, 0, 0];
    pdu.extend_from_slice(&pdu_ref.to_be_bytes());
    pdu.extend_from_slice(&(param.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
    pdu.extend_from_slice(param);
    pdu.extend_from_slice(data);
    pdu
}

fn read_item_param(transport: u8, count: u16, db: u16, area: u8, address: u32) -> Vec<u8> {
    let mut p = vec![s7::FUNC_READ_VAR, 0x01, 0x12, 0x0A, 0x10, transport];
    p.extend_from_slice(&count.to_be_bytes());
    p.extend_from_slice(&db.to_be_bytes());
    p.push(area);
    p.extend_from_slice(&address.to_be_bytes()[1..]);
    p
}

fn write_item_param(transport: u8, count: u16, db: u16, area: u8, address: u32) -> Vec<u8> {
    let mut p = vec![s7::FUNC_WRITE_VAR, 0x01, 0x12, 0x0A, 0x10, transport];
    p.extend_from_slice(&count.to_be_bytes());
    p.extend_from_slice(&db.to_be_bytes());
    p.push(area);
    p.extend_from_slice(&address.to_be_bytes()[1..]);
    p
}

fn apply_journal() {
    let _img = image::lock();
    journal().apply_and_clear();
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn read_returns_big_endian_snapshot() {
    let mut stack = setup();

    // DB10 maps int_input[0..1]; image holds 0x1234, 0x5678.
    stack.fix.poke(BufferType::IntInput, 0, 0x1234);
    stack.fix.poke(BufferType::IntInput, 1, 0x5678);

    let param = read_item_param(s7::TS_WORD, 2, 10, s7::AREA_DB, 0);
    let resp = send_pdu(&mut stack.stream, &job(2, &param, &[]));

    assert_eq!(resp[12], s7::FUNC_READ_VAR);
    assert_eq!(resp[14], s7::RET_OK);
    // Expected wire bytes: 12 34 56 78.
    assert_eq!(&resp[18..22], &[0x12, 0x34, 0x56, 0x78]);

    stack.server.stop();
}

#[test]
fn write_lands_after_journal_apply() {
    let mut stack = setup();

    // Write bytes 00 FF at DB20 offset 2; DB20 maps int_output[0..].
    let param = write_item_param(s7::TS_BYTE, 2, 20, s7::AREA_DB, 2 * 8);
    let data = [0x00, s7::DTS_BYTE_WORD, 0x00, 0x10, 0x00, 0xFF];
    let resp = send_pdu(&mut stack.stream, &job(3, &param, &data));
    assert_eq!(resp[12], s7::FUNC_WRITE_VAR);
    assert_eq!(resp[14], s7::RET_OK);

    // Not yet: the write sits in the journal until the next tick.
    assert!(journal().pending() > 0);
    assert_ne!(stack.fix.int_output(1), 0x00FF);

    apply_journal();
    assert_eq!(stack.fix.int_output(1), 0x00FF);
    assert_eq!(journal().pending(), 0);

    stack.server.stop();
}

#[test]
fn write_then_read_round_trip() {
    let mut stack = setup();

    // 64-bit family: DB30 maps lint_memory[0..].
    let value: u64 = 0x0102_0304_0506_0708;
    let param = write_item_param(s7::TS_BYTE, 8, 30, s7::AREA_DB, 0);
    let mut data = vec![0x00, s7::DTS_BYTE_WORD, 0x00, 0x40];
    data.extend_from_slice(&value.to_be_bytes());
    let resp = send_pdu(&mut stack.stream, &job(4, &param, &data));
    assert_eq!(resp[14], s7::RET_OK);

    apply_journal();
    assert_eq!(stack.fix.peek(BufferType::LintMemory, 0), value);

    let param = read_item_param(s7::TS_BYTE, 8, 30, s7::AREA_DB, 0);
    let resp = send_pdu(&mut stack.stream, &job(5, &param, &[]));
    assert_eq!(resp[14], s7::RET_OK);
    assert_eq!(&resp[18..26], &value.to_be_bytes());

    stack.server.stop();
}

#[test]
fn bool_area_bit_write_and_read() {
    let mut stack = setup();

    // MK maps bool_memory; set M1.5 over the wire.
    let param = write_item_param(s7::TS_BIT, 1, 0, s7::AREA_MK, 1 * 8 + 5);
    let data = [0x00, s7::DTS_BIT, 0x00, 0x01, 0x01];
    let resp = send_pdu(&mut stack.stream, &job(6, &param, &data));
    assert_eq!(resp[14], s7::RET_OK);

    apply_journal();
    assert!(stack.fix.peek_bit(BufferType::BoolMemory, 1, 5));

    let param = read_item_param(s7::TS_BIT, 1, 0, s7::AREA_MK, 1 * 8 + 5);
    let resp = send_pdu(&mut stack.stream, &job(7, &param, &[]));
    assert_eq!(resp[14], s7::RET_OK);
    assert_eq!(resp[15], s7::DTS_BIT);
    assert_eq!(resp[18], 1);

    stack.server.stop();
}

#[test]
fn input_area_writes_are_suppressed() {
    let mut stack = setup();

    stack.fix.poke(BufferType::IntInput, 0, 0xAAAA);

    // Remote write into the input-mapped DB10: accepted on the wire,
    // dropped on the floor.
    let param = write_item_param(s7::TS_BYTE, 2, 10, s7::AREA_DB, 0);
    let data = [0x00, s7::DTS_BYTE_WORD, 0x00, 0x10, 0x12, 0x34];
    let resp = send_pdu(&mut stack.stream, &job(8, &param, &data));
    assert_eq!(resp[14], s7::RET_OK, "client sees success by design");

    apply_journal();
    assert_eq!(stack.fix.peek(BufferType::IntInput, 0), 0xAAAA);

    stack.server.stop();
}

#[test]
fn unknown_db_errors_per_item() {
    let mut stack = setup();

    let param = read_item_param(s7::TS_BYTE, 1, 99, s7::AREA_DB, 0);
    let resp = send_pdu(&mut stack.stream, &job(9, &param, &[]));
    assert_eq!(resp[14], s7::RET_OBJECT_NOT_EXIST);

    stack.server.stop();
}

#[test]
fn identity_query_returns_configured_name() {
    let mut stack = setup();

    let mut pdu = vec![s7::PROTOCOL_ID, s7::ROSCTR_USERDATA, 0, 0, 0x00, 0x0B];
    let param = [0x00, 0x01, 0x12, 0x04, 0x11, 0x44, 0x01, 0x00];
    let data = [s7::RET_OK, s7::DTS_OCTET, 0x00, 0x04, 0x00, 0x1C, 0x00, 0x00];
    pdu.extend_from_slice(&(param.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&param);
    pdu.extend_from_slice(&data);

    let resp = send_pdu(&mut stack.stream, &pdu);
    let text = String::from_utf8_lossy(&resp);
    assert!(
        text.contains("ROUNDTRIP PLC"),
        "identity name missing from SZL response"
    );

    stack.server.stop();
}

#[test]
fn second_client_sees_same_tables() {
    let mut stack = setup();
    stack.fix.poke(BufferType::IntInput, 1, 0xBEEF);

    let addr = stack.stream.peer_addr().unwrap();
    let mut second = TcpStream::connect(addr).unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    handshake(&mut second);

    let param = read_item_param(s7::TS_WORD, 1, 10, s7::AREA_DB, 2 * 8);
    let resp = send_pdu(&mut second, &job(10, &param, &[]));
    assert_eq!(&resp[18..20], &0xBEEFu16.to_be_bytes());

    drop(second);
    stack.server.stop();
}
