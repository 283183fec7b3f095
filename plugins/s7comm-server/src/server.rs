//! Threaded S7 server.
//!
//! This module plays the role the protocol library plays in a classic
//! deployment: it owns the TCP listener, the per-client sessions and the
//! registered data areas, and serves frames against them. The plugin
//! registers one staging buffer per area and supplies a single read/write
//! callback; the callback sees `(operation, area code, area number, byte
//! offset, byte length, buffer)` and can
//!
//! - return [`CB_HANDLED`]: the buffer holds the data (read) or the data
//!   was consumed (write);
//! - return [`CB_FALLBACK`]: the library falls back to the registered
//!   staging buffer;
//! - return a negative status: the item fails with a protocol error code.
//!
//! Writes are additionally mirrored into the staging buffer so the
//! fallback path stays coherent.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferrum::PluginLog;

use crate::config::LoggingSection;
use crate::iso::{self, CotpTpdu};
use crate::s7::{self, ReadResult, Request, RequestItem, SzlIdentity, WriteData};

pub const CB_HANDLED: i32 = 0;
pub const CB_FALLBACK: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwOp {
    Read,
    Write,
}

/// `(op, area, number, offset, length, buffer)` → status.
pub type RwCallback = dyn Fn(RwOp, u8, u16, usize, usize, &mut [u8]) -> i32 + Send + Sync;

/// Listener/session parameters, already validated by the configuration
/// layer.
#[derive(Debug, Clone)]
pub struct ServerParams {
    pub bind_address: String,
    pub port: u16,
    pub max_clients: usize,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub ping_timeout: Duration,
    pub pdu_size: u16,
}

type Staging = Arc<Mutex<Vec<u8>>>;

struct Shared {
    params: ServerParams,
    areas: Mutex<HashMap<(u8, u16), Staging>>,
    callback: Mutex<Option<Arc<RwCallback>>>,
    identity: SzlIdentity,
    log: Option<PluginLog>,
    log_cfg: LoggingSection,
    running: AtomicBool,
    clients: AtomicUsize,
}

impl Shared {
    fn info(&self, msg: &str) {
        if let Some(log) = &self.log {
            log.info(msg);
        }
    }

    fn debug(&self, msg: &str) {
        if let Some(log) = &self.log {
            log.debug(msg);
        }
    }

    fn warn(&self, msg: &str) {
        if let Some(log) = &self.log {
            log.warn(msg);
        }
    }

    fn error(&self, msg: &str) {
        if let Some(log) = &self.log {
            log.error(msg);
        }
    }
}

pub struct S7Server {
    shared: Arc<Shared>,
    listener: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl S7Server {
    pub fn new(
        params: ServerParams,
        identity: SzlIdentity,
        log_cfg: LoggingSection,
        log: Option<PluginLog>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                params,
                areas: Mutex::new(HashMap::new()),
                callback: Mutex::new(None),
                identity,
                log,
                log_cfg,
                running: AtomicBool::new(false),
                clients: AtomicUsize::new(0),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Register `buf` as the backing storage for `(area, number)`.
    pub fn register_area(&self, area: u8, number: u16, buf: Staging) {
        self.shared
            .areas
            .lock()
            .expect("area registry poisoned")
            .insert((area, number), buf);
    }

    pub fn set_rw_callback(&self, cb: Arc<RwCallback>) {
        *self.shared.callback.lock().expect("callback slot poisoned") = Some(cb);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Bind and start accepting. Returns the bound address (useful when
    /// the caller asked for an ephemeral port).
    pub fn start(&self) -> io::Result<SocketAddr> {
        let addr = format!(
            "{}:{}",
            self.shared.params.bind_address, self.shared.params.port
        );
        let listener = TcpListener::bind(&addr)?;
        let local = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        self.shared.running.store(true, Ordering::Relaxed);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("s7-listener".into())
            .spawn(move || accept_loop(listener, shared))
            .expect("spawn s7 listener");
        *self.listener.lock().expect("listener slot poisoned") = Some(handle);
        Ok(local)
    }

    /// Close the listener and let sessions drain. Sessions notice the flag
    /// at their next receive timeout.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.listener.lock().expect("listener slot poisoned").take() {
            let _ = handle.join();
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.load(Ordering::Relaxed)
    }
}

impl Drop for S7Server {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Accept loop and sessions
// =============================================================================

struct ClientGuard(Arc<Shared>);

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.clients.fetch_sub(1, Ordering::Relaxed);
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let count = shared.clients.fetch_add(1, Ordering::Relaxed) + 1;
                if count > shared.params.max_clients {
                    shared.clients.fetch_sub(1, Ordering::Relaxed);
                    shared.warn(&format!("client {} rejected: connection cap reached", peer));
                    continue;
                }
                if shared.log_cfg.log_connections {
                    shared.info(&format!("client connected: {}", peer));
                }
                let shared = Arc::clone(&shared);
                let _ = std::thread::Builder::new()
                    .name("s7-client".into())
                    .spawn(move || {
                        let guard = ClientGuard(Arc::clone(&shared));
                        if let Err(e) = client_session(&shared, stream) {
                            if shared.log_cfg.log_errors {
                                shared.debug(&format!("client {} ended: {}", peer, e));
                            }
                        }
                        if shared.log_cfg.log_connections {
                            shared.info(&format!("client disconnected: {}", peer));
                        }
                        drop(guard);
                    });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                shared.error(&format!("accept failed: {}", e));
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn client_session(shared: &Shared, mut stream: TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.params.recv_timeout))?;
    stream.set_write_timeout(Some(shared.params.send_timeout))?;

    // COTP handshake first.
    let frame = iso::read_frame(&mut stream)?;
    match iso::parse_tpdu(&frame) {
        Ok(CotpTpdu::ConnectionRequest { src_ref, options }) => {
            let cc = iso::build_connection_confirm(src_ref, &options);
            iso::write_frame(&mut stream, &cc)?;
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected COTP connection request",
            ));
        }
    }

    let mut negotiated_pdu = shared.params.pdu_size;
    let mut last_activity = Instant::now();

    loop {
        if !shared.running.load(Ordering::Relaxed) {
            return Ok(());
        }
        let frame = match iso::read_frame(&mut stream) {
            Ok(f) => f,
            Err(e) if is_timeout(&e) => {
                if last_activity.elapsed() > shared.params.ping_timeout {
                    shared.debug("client idle past ping timeout, dropping");
                    return Ok(());
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        last_activity = Instant::now();

        let payload = match iso::parse_tpdu(&frame) {
            Ok(CotpTpdu::Data { payload }) => payload,
            Ok(_) => continue,
            Err(e) => {
                if shared.log_cfg.log_errors {
                    shared.warn(&format!("transport error: {}", e));
                }
                return Ok(());
            }
        };

        let response = handle_pdu(shared, &mut negotiated_pdu, &payload);
        iso::write_frame(&mut stream, &iso::build_data(&response))?;
    }
}

// =============================================================================
// PDU dispatch
// =============================================================================

fn handle_pdu(shared: &Shared, negotiated_pdu: &mut u16, payload: &[u8]) -> Vec<u8> {
    match s7::parse_request(payload) {
        Ok(Request::Setup {
            pdu_ref,
            max_amq_caller,
            max_amq_callee,
            pdu_length,
        }) => {
            let pdu = pdu_length.min(shared.params.pdu_size).max(crate::config::PDU_MIN);
            *negotiated_pdu = pdu;
            shared.debug(&format!("communication setup, negotiated PDU {}", pdu));
            s7::build_setup_response(pdu_ref, max_amq_caller, max_amq_callee, pdu)
        }
        Ok(Request::ReadVar { pdu_ref, items }) => {
            let results: Vec<ReadResult> = items
                .iter()
                .map(|item| read_item(shared, *negotiated_pdu, item))
                .collect();
            s7::build_read_response(pdu_ref, &results)
        }
        Ok(Request::WriteVar { pdu_ref, items }) => {
            let codes: Vec<u8> = items
                .iter()
                .map(|(item, data)| write_item(shared, item, data))
                .collect();
            s7::build_write_response(pdu_ref, &codes)
        }
        Ok(Request::ReadSzl {
            pdu_ref,
            szl_id,
            szl_index,
            sequence,
        }) => s7::build_szl_response(pdu_ref, sequence, szl_id, szl_index, &shared.identity),
        Err(e) => {
            if shared.log_cfg.log_errors {
                shared.warn(&format!("bad request: {}", e));
            }
            // 0x81/0x04: error in the application relationship / function
            // not implemented.
            s7::build_error_response(0, 0x81, 0x04)
        }
    }
}

fn area_number(item: &RequestItem) -> u16 {
    if item.area == s7::AREA_DB {
        item.db_number
    } else {
        0
    }
}

fn lookup_area(shared: &Shared, item: &RequestItem) -> Option<Staging> {
    shared
        .areas
        .lock()
        .expect("area registry poisoned")
        .get(&(item.area, area_number(item)))
        .cloned()
}

/// Read `len` bytes at `off` of one area: callback first, staging buffer
/// as fallback.
fn read_bytes(
    shared: &Shared,
    item: &RequestItem,
    staging: &Staging,
    off: usize,
    len: usize,
) -> Result<Vec<u8>, u8> {
    let mut buf = vec![0u8; len];
    let cb = shared
        .callback
        .lock()
        .expect("callback slot poisoned")
        .clone();
    if let Some(cb) = cb {
        match cb(RwOp::Read, item.area, area_number(item), off, len, &mut buf) {
            CB_HANDLED => return Ok(buf),
            CB_FALLBACK => {}
            _ => return Err(s7::RET_OUT_OF_RANGE),
        }
    }
    let s = staging.lock().expect("staging buffer poisoned");
    buf.copy_from_slice(&s[off..off + len]);
    Ok(buf)
}

/// Write `data` at `off` of one area: callback (journal path) plus a
/// mirror into the staging buffer.
fn write_bytes(
    shared: &Shared,
    item: &RequestItem,
    staging: &Staging,
    off: usize,
    data: &[u8],
) -> Result<(), u8> {
    let cb = shared
        .callback
        .lock()
        .expect("callback slot poisoned")
        .clone();
    if let Some(cb) = cb {
        let mut tmp = data.to_vec();
        let status = cb(
            RwOp::Write,
            item.area,
            area_number(item),
            off,
            data.len(),
            &mut tmp,
        );
        if status != CB_HANDLED && status != CB_FALLBACK {
            return Err(s7::RET_OUT_OF_RANGE);
        }
    }
    let mut s = staging.lock().expect("staging buffer poisoned");
    s[off..off + data.len()].copy_from_slice(data);
    Ok(())
}

fn read_item(shared: &Shared, negotiated_pdu: u16, item: &RequestItem) -> ReadResult {
    let Some(staging) = lookup_area(shared, item) else {
        return ReadResult::Err(s7::RET_OBJECT_NOT_EXIST);
    };
    let area_size = staging.lock().expect("staging buffer poisoned").len();

    if item.is_bit() {
        if item.count != 1 {
            return ReadResult::Err(s7::RET_TYPE_UNSUPPORTED);
        }
        let off = item.byte_offset();
        if off >= area_size {
            return ReadResult::Err(s7::RET_OUT_OF_RANGE);
        }
        return match read_bytes(shared, item, &staging, off, 1) {
            Ok(byte) => {
                let bit = (byte[0] >> item.bit_offset()) & 1;
                if shared.log_cfg.log_data_access {
                    shared.debug(&format!(
                        "read bit area 0x{:02X} #{} {}.{} -> {}",
                        item.area,
                        area_number(item),
                        off,
                        item.bit_offset(),
                        bit
                    ));
                }
                ReadResult::Ok {
                    bit: true,
                    data: vec![bit],
                }
            }
            Err(code) => ReadResult::Err(code),
        };
    }

    let Some(len) = item.byte_len() else {
        return ReadResult::Err(s7::RET_TYPE_UNSUPPORTED);
    };
    let off = item.byte_offset();
    if len == 0 || off + len > area_size {
        return ReadResult::Err(s7::RET_OUT_OF_RANGE);
    }
    // Response must fit in the negotiated PDU (header + item overhead).
    if len + 18 > negotiated_pdu as usize {
        return ReadResult::Err(s7::RET_OUT_OF_RANGE);
    }

    match read_bytes(shared, item, &staging, off, len) {
        Ok(data) => {
            if shared.log_cfg.log_data_access {
                shared.debug(&format!(
                    "read area 0x{:02X} #{} off {} len {}",
                    item.area,
                    area_number(item),
                    off,
                    len
                ));
            }
            ReadResult::Ok { bit: false, data }
        }
        Err(code) => ReadResult::Err(code),
    }
}

fn write_item(shared: &Shared, item: &RequestItem, data: &WriteData) -> u8 {
    let Some(staging) = lookup_area(shared, item) else {
        return s7::RET_OBJECT_NOT_EXIST;
    };
    let area_size = staging.lock().expect("staging buffer poisoned").len();

    if item.is_bit() {
        if item.count != 1 || data.bytes.is_empty() {
            return s7::RET_TYPE_UNSUPPORTED;
        }
        let off = item.byte_offset();
        if off >= area_size {
            return s7::RET_OUT_OF_RANGE;
        }
        // Read-modify-write the containing byte so neighbouring bits keep
        // their current (snapshot) values.
        let current = match read_bytes(shared, item, &staging, off, 1) {
            Ok(b) => b[0],
            Err(code) => return code,
        };
        let mask = 1u8 << item.bit_offset();
        let next = if data.bytes[0] & 1 != 0 {
            current | mask
        } else {
            current & !mask
        };
        return match write_bytes(shared, item, &staging, off, &[next]) {
            Ok(()) => {
                if shared.log_cfg.log_data_access {
                    shared.debug(&format!(
                        "write bit area 0x{:02X} #{} {}.{}",
                        item.area,
                        area_number(item),
                        off,
                        item.bit_offset()
                    ));
                }
                s7::RET_OK
            }
            Err(code) => code,
        };
    }

    let Some(expected) = item.byte_len() else {
        return s7::RET_TYPE_UNSUPPORTED;
    };
    let len = expected.min(data.bytes.len());
    let off = item.byte_offset();
    if len == 0 || off + len > area_size {
        return s7::RET_OUT_OF_RANGE;
    }

    match write_bytes(shared, item, &staging, off, &data.bytes[..len]) {
        Ok(()) => {
            if shared.log_cfg.log_data_access {
                shared.debug(&format!(
                    "write area 0x{:02X} #{} off {} len {}",
                    item.area,
                    area_number(item),
                    off,
                    len
                ));
            }
            s7::RET_OK
        }
        Err(code) => code,
    }
}
