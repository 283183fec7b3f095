//! S7 communication server plugin.
//!
//! Exposes the runtime's image tables to S7-speaking HMIs and SCADA
//! systems. Data flows on demand through the server's RW callback:
//!
//! - remote READ: take the image lock, transcode the mapped slice into
//!   the caller's buffer (big-endian / bit-packed), release the lock —
//!   an immediate, consistent snapshot;
//! - remote WRITE: no lock; split the slice into per-cell journal writes,
//!   applied atomically at the next scan cycle.
//!
//! The cycle hooks are exported but deliberately empty: with on-demand
//! synchronisation there is no per-tick work to do.

pub mod areas;
pub mod config;
pub mod iso;
pub mod s7;
pub mod server;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrum::{PluginLog, Runtime};

use areas::AreaTable;
use config::S7Config;
use server::{RwOp, S7Server, ServerParams, CB_FALLBACK, CB_HANDLED};

const COMPONENT: &str = "s7comm";

/// Plugin lifecycle, driven by the host's entry-point calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Initialised,
    Running,
    Stopped,
    Cleaned,
}

pub struct S7Plugin {
    log: PluginLog,
    config: S7Config,
    areas: Option<Arc<AreaTable>>,
    server: Option<S7Server>,
    state: PluginState,
}

impl S7Plugin {
    /// Build the area table and the (not yet listening) server from the
    /// per-plugin configuration. A broken config degrades to defaults; a
    /// disabled server initialises successfully and never binds.
    pub fn init(rt: Runtime) -> S7Plugin {
        let log = rt.logger(COMPONENT);
        log.info("initialising S7 server plugin");

        let config = match rt.config_path() {
            Some(path) => match S7Config::parse_file(&path) {
                Ok(cfg) => {
                    log.info(&format!("configuration loaded from {}", path.display()));
                    cfg
                }
                Err(e) => {
                    log.error(&format!("configuration rejected: {}", e));
                    log.warn("falling back to default configuration");
                    S7Config::default()
                }
            },
            None => {
                log.warn("no config file in descriptor, using defaults");
                S7Config::default()
            }
        };

        if !config.server.enabled {
            log.info("server disabled in configuration");
            return S7Plugin {
                log,
                config,
                areas: None,
                server: None,
                state: PluginState::Initialised,
            };
        }

        let areas = Arc::new(AreaTable::from_config(&config, Some(&log)));
        log.info(&format!(
            "{} data area(s) declared, port {}, max {} client(s), PDU {}",
            areas.area_count(),
            config.server.port,
            config.server.max_clients,
            config.server.pdu_size
        ));

        let server = S7Server::new(
            server_params(&config),
            identity_of(&config),
            config.logging.clone(),
            Some(log.clone()),
        );
        areas.register_all(&server, Some(&log));
        server.set_rw_callback(make_rw_callback(rt, Arc::clone(&areas), log.clone()));

        S7Plugin {
            log,
            config,
            areas: Some(areas),
            server: Some(server),
            state: PluginState::Initialised,
        }
    }

    /// Bind the listener and begin accepting connections.
    pub fn start(&mut self) {
        let Some(server) = &self.server else {
            self.log.info("server disabled, nothing to start");
            return;
        };
        if self.state == PluginState::Running {
            self.log.warn("server already running");
            return;
        }
        match server.start() {
            Ok(addr) => {
                self.state = PluginState::Running;
                self.log.info(&format!("S7 server listening on {}", addr));
            }
            Err(e) => {
                self.log.error(&format!("failed to bind listener: {}", e));
                if self.config.server.port < 1024 {
                    self.log.error(&format!(
                        "note: port {} requires elevated privileges",
                        self.config.server.port
                    ));
                }
                // Stays INITIALISED: a later start may succeed.
            }
        }
    }

    /// Close the listener and drain clients.
    pub fn stop(&mut self) {
        if self.state != PluginState::Running {
            return;
        }
        if let Some(server) = &self.server {
            server.stop();
        }
        self.state = PluginState::Stopped;
        self.log.info("S7 server stopped");
    }

    /// Free staging buffers.
    pub fn cleanup(&mut self) {
        if self.state == PluginState::Running {
            self.stop();
        }
        self.server = None;
        self.areas = None;
        self.state = PluginState::Cleaned;
        self.log.info("cleanup complete");
    }

    pub fn state(&self) -> PluginState {
        self.state
    }
}

pub fn server_params(cfg: &S7Config) -> ServerParams {
    ServerParams {
        bind_address: cfg.server.bind_address.clone(),
        port: cfg.server.port,
        max_clients: cfg.server.max_clients as usize,
        send_timeout: Duration::from_millis(cfg.server.send_timeout_ms),
        recv_timeout: Duration::from_millis(cfg.server.recv_timeout_ms),
        ping_timeout: Duration::from_millis(cfg.server.ping_timeout_ms),
        pdu_size: cfg.server.pdu_size,
    }
}

pub fn identity_of(cfg: &S7Config) -> s7::SzlIdentity {
    s7::SzlIdentity {
        name: cfg.identity.name.clone(),
        module_name: cfg.identity.module_name.clone(),
        plant_id: String::new(),
        copyright: cfg.identity.copyright.clone(),
        serial_number: cfg.identity.serial_number.clone(),
        module_type: cfg.identity.module_type.clone(),
    }
}

/// The single data-path callback handed to the server.
pub fn make_rw_callback(
    rt: Runtime,
    areas: Arc<AreaTable>,
    log: PluginLog,
) -> Arc<server::RwCallback> {
    Arc::new(move |op, area, number, offset, len, buf: &mut [u8]| -> i32 {
        let Some(rt_area) = areas.find(area, number) else {
            // Not one of ours: let the library serve its registered buffer.
            return CB_FALLBACK;
        };
        if offset + len > rt_area.size_bytes {
            log.warn(&format!(
                "area 0x{:02X} #{}: offset {} + len {} exceeds {} bytes",
                area, number, offset, len, rt_area.size_bytes
            ));
            return -1;
        }
        match op {
            RwOp::Read => areas::read_area(&rt, rt_area, offset, &mut buf[..len]),
            RwOp::Write => areas::write_area(&rt, rt_area, offset, &buf[..len]),
        }
        CB_HANDLED
    })
}

// =============================================================================
// Entry points
// =============================================================================

static PLUGIN: Mutex<Option<S7Plugin>> = Mutex::new(None);

ferrum::define_plugin! {
    fn init(rt: ferrum::Runtime) -> i32 {
        *PLUGIN.lock().expect("plugin state poisoned") = Some(S7Plugin::init(rt));
        0
    }

    fn start() {
        if let Some(p) = PLUGIN.lock().expect("plugin state poisoned").as_mut() {
            p.start();
        }
    }

    fn stop() {
        if let Some(p) = PLUGIN.lock().expect("plugin state poisoned").as_mut() {
            p.stop();
        }
    }

    fn cleanup() {
        if let Some(p) = PLUGIN.lock().expect("plugin state poisoned").as_mut() {
            p.cleanup();
        }
    }

    fn cycle_start() {
        // Data sync happens on demand in the RW callback.
    }

    fn cycle_end() {
        // Data sync happens on demand in the RW callback.
    }
}
