//! Plugin configuration.
//!
//! Parsed from the per-plugin JSON file named in the roster. Unknown keys
//! are ignored, missing keys take defaults, and a file that fails parsing
//! or validation falls back to the full default configuration with a
//! warning — the plugin still starts.

use std::path::Path;

use ferrum::BufferType;
use serde::Deserialize;

pub const PDU_MIN: u16 = 240;
pub const PDU_MAX: u16 = 960;
pub const MAX_DB_SIZE: usize = 65536;

pub const DEFAULT_PORT: u16 = 102;
pub const DEFAULT_MAX_CLIENTS: u32 = 32;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 10000;
pub const DEFAULT_PDU_SIZE: u16 = 480;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S7Config {
    pub server: ServerSection,
    pub identity: IdentitySection,
    pub data_blocks: Vec<DataBlockCfg>,
    pub system_areas: SystemAreas,
    pub logging: LoggingSection,
}

impl Default for S7Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            identity: IdentitySection::default(),
            data_blocks: Vec::new(),
            system_areas: SystemAreas::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub max_clients: u32,
    pub send_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub pdu_size: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            pdu_size: DEFAULT_PDU_SIZE,
        }
    }
}

/// Strings returned in protocol identity queries (SZL component
/// identification).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub name: String,
    pub module_type: String,
    pub serial_number: String,
    pub copyright: String,
    pub module_name: String,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            name: "FERRUM PLC".into(),
            module_type: "CPU 315-2 PN/DP".into(),
            serial_number: "S C-F0000001".into(),
            copyright: "Original Siemens Equipment".into(),
            module_name: "FERRUM".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingCfg {
    #[serde(rename = "type")]
    pub buffer_type: String,
    pub start_buffer: i64,
    pub bit_addressing: bool,
}

impl Default for MappingCfg {
    fn default() -> Self {
        Self {
            buffer_type: String::new(),
            start_buffer: 0,
            bit_addressing: false,
        }
    }
}

impl MappingCfg {
    /// Resolve the mapping's family name to a buffer-type code.
    pub fn resolve(&self) -> Option<BufferType> {
        buffer_type_by_name(&self.buffer_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataBlockCfg {
    pub db_number: i64,
    pub description: String,
    pub size_bytes: i64,
    pub mapping: MappingCfg,
}

impl Default for DataBlockCfg {
    fn default() -> Self {
        Self {
            db_number: 0,
            description: String::new(),
            size_bytes: 0,
            mapping: MappingCfg::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemAreas {
    pub pe: AreaCfg,
    pub pa: AreaCfg,
    pub mk: AreaCfg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AreaCfg {
    pub enabled: bool,
    pub size_bytes: i64,
    pub mapping: MappingCfg,
}

impl Default for AreaCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            size_bytes: 0,
            mapping: MappingCfg::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub log_connections: bool,
    pub log_data_access: bool,
    pub log_errors: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            log_connections: true,
            log_data_access: false,
            log_errors: true,
        }
    }
}

pub fn buffer_type_by_name(name: &str) -> Option<BufferType> {
    Some(match name {
        "bool_input" => BufferType::BoolInput,
        "bool_output" => BufferType::BoolOutput,
        "bool_memory" => BufferType::BoolMemory,
        "byte_input" => BufferType::ByteInput,
        "byte_output" => BufferType::ByteOutput,
        "int_input" => BufferType::IntInput,
        "int_output" => BufferType::IntOutput,
        "int_memory" => BufferType::IntMemory,
        "dint_input" => BufferType::DintInput,
        "dint_output" => BufferType::DintOutput,
        "dint_memory" => BufferType::DintMemory,
        "lint_input" => BufferType::LintInput,
        "lint_output" => BufferType::LintOutput,
        "lint_memory" => BufferType::LintMemory,
        _ => None?,
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Unreadable(String),
    Parse(String),
    PortZero,
    PduOutOfRange(u16),
    MaxClientsOutOfRange(u32),
    DuplicateDb(i64),
    UnknownMappingType(String),
    NegativeStartBuffer(i64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Unreadable(e) => write!(f, "config unreadable: {}", e),
            ConfigError::Parse(e) => write!(f, "config invalid JSON: {}", e),
            ConfigError::PortZero => write!(f, "server.port must not be 0"),
            ConfigError::PduOutOfRange(v) => {
                write!(f, "server.pdu_size {} outside {}..={}", v, PDU_MIN, PDU_MAX)
            }
            ConfigError::MaxClientsOutOfRange(v) => {
                write!(f, "server.max_clients {} outside 1..=1024", v)
            }
            ConfigError::DuplicateDb(n) => write!(f, "duplicate db_number {}", n),
            ConfigError::UnknownMappingType(t) => write!(f, "unknown mapping.type `{}`", t),
            ConfigError::NegativeStartBuffer(v) => {
                write!(f, "negative start_buffer {}", v)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl S7Config {
    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: S7Config =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(e.to_string()))?;
        Self::parse_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if s.port == 0 {
            return Err(ConfigError::PortZero);
        }
        if !(PDU_MIN..=PDU_MAX).contains(&s.pdu_size) {
            return Err(ConfigError::PduOutOfRange(s.pdu_size));
        }
        if !(1..=1024).contains(&s.max_clients) {
            return Err(ConfigError::MaxClientsOutOfRange(s.max_clients));
        }

        let mut seen = std::collections::HashSet::new();
        for db in &self.data_blocks {
            if !seen.insert(db.db_number) {
                return Err(ConfigError::DuplicateDb(db.db_number));
            }
            if db.mapping.resolve().is_none() {
                return Err(ConfigError::UnknownMappingType(
                    db.mapping.buffer_type.clone(),
                ));
            }
            if db.mapping.start_buffer < 0 {
                return Err(ConfigError::NegativeStartBuffer(db.mapping.start_buffer));
            }
        }

        for area in [
            &self.system_areas.pe,
            &self.system_areas.pa,
            &self.system_areas.mk,
        ] {
            if !area.enabled {
                continue;
            }
            if area.mapping.resolve().is_none() {
                return Err(ConfigError::UnknownMappingType(
                    area.mapping.buffer_type.clone(),
                ));
            }
            if area.mapping.start_buffer < 0 {
                return Err(ConfigError::NegativeStartBuffer(area.mapping.start_buffer));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        S7Config::default().validate().unwrap();
    }

    #[test]
    fn empty_object_takes_defaults() {
        let cfg = S7Config::parse_str("{}").unwrap();
        assert!(cfg.server.enabled);
        assert_eq!(cfg.server.port, DEFAULT_PORT);
        assert_eq!(cfg.server.pdu_size, DEFAULT_PDU_SIZE);
        assert!(cfg.data_blocks.is_empty());
        assert!(!cfg.system_areas.pe.enabled);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = S7Config::parse_str(r#"{"server": {"port": 1102, "future_flag": true}, "banana": 1}"#)
            .unwrap();
        assert_eq!(cfg.server.port, 1102);
    }

    #[test]
    fn full_config_parses() {
        let cfg = S7Config::parse_str(
            r#"{
            "server": {
                "enabled": true,
                "bind_address": "127.0.0.1",
                "port": 10102,
                "max_clients": 4,
                "pdu_size": 480
            },
            "identity": { "name": "LINE-3 PLC" },
            "data_blocks": [
                { "db_number": 10, "size_bytes": 4,
                  "mapping": { "type": "int_input", "start_buffer": 0 } },
                { "db_number": 20, "size_bytes": 16,
                  "mapping": { "type": "int_output", "start_buffer": 0 } }
            ],
            "system_areas": {
                "pe": { "enabled": true, "size_bytes": 8,
                        "mapping": { "type": "bool_input", "start_buffer": 0, "bit_addressing": true } }
            },
            "logging": { "log_data_access": true }
        }"#,
        )
        .unwrap();
        assert_eq!(cfg.identity.name, "LINE-3 PLC");
        assert_eq!(cfg.data_blocks.len(), 2);
        assert_eq!(cfg.data_blocks[0].mapping.resolve(), Some(BufferType::IntInput));
        assert!(cfg.system_areas.pe.enabled);
        assert!(cfg.system_areas.pe.mapping.bit_addressing);
        assert!(cfg.logging.log_data_access);
    }

    #[test]
    fn validation_rejects_spec_cases() {
        let base = S7Config::default();

        let mut c = base.clone();
        c.server.port = 0;
        assert_eq!(c.validate(), Err(ConfigError::PortZero));

        let mut c = base.clone();
        c.server.pdu_size = 200;
        assert_eq!(c.validate(), Err(ConfigError::PduOutOfRange(200)));
        c.server.pdu_size = 1000;
        assert_eq!(c.validate(), Err(ConfigError::PduOutOfRange(1000)));

        let mut c = base.clone();
        c.server.max_clients = 0;
        assert_eq!(c.validate(), Err(ConfigError::MaxClientsOutOfRange(0)));
        c.server.max_clients = 2000;
        assert_eq!(c.validate(), Err(ConfigError::MaxClientsOutOfRange(2000)));

        let mut c = base.clone();
        let mut db = DataBlockCfg {
            db_number: 5,
            size_bytes: 4,
            ..Default::default()
        };
        db.mapping.buffer_type = "int_output".into();
        c.data_blocks.push(db.clone());
        c.data_blocks.push(db);
        assert_eq!(c.validate(), Err(ConfigError::DuplicateDb(5)));

        let mut c = base.clone();
        let mut db = DataBlockCfg {
            db_number: 6,
            size_bytes: 4,
            ..Default::default()
        };
        db.mapping.buffer_type = "float_output".into();
        c.data_blocks.push(db);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::UnknownMappingType(_))
        ));

        let mut c = base;
        let mut db = DataBlockCfg {
            db_number: 7,
            size_bytes: 4,
            ..Default::default()
        };
        db.mapping.buffer_type = "int_output".into();
        db.mapping.start_buffer = -3;
        c.data_blocks.push(db);
        assert_eq!(c.validate(), Err(ConfigError::NegativeStartBuffer(-3)));
    }
}
