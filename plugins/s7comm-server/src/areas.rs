//! Data areas: configuration → runtime table, and the transcoding between
//! image-table cells and wire bytes.
//!
//! Each declared area is a contiguous byte range backed by one staging
//! buffer, with a binding `(buffer family, start index)` into the image
//! tables. Remote reads transcode the image slice under the image lock
//! (big-endian for 16/32/64-bit families, bit-packed for bool families);
//! remote writes are split into per-cell journal writes and take no lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ferrum::{BufferType, PluginLog, Runtime};

use crate::config::{S7Config, MAX_DB_SIZE};
use crate::s7;
use crate::server::S7Server;

#[derive(Debug, Clone, Copy)]
pub struct AreaMapping {
    pub ty: BufferType,
    pub start_buffer: usize,
    pub bit_addressing: bool,
}

pub struct AreaRuntime {
    pub size_bytes: usize,
    pub mapping: AreaMapping,
    /// Registered with the server as the area's backing storage.
    pub staging: Arc<Mutex<Vec<u8>>>,
}

impl AreaRuntime {
    fn new(size_bytes: usize, mapping: AreaMapping) -> Self {
        Self {
            size_bytes,
            mapping,
            staging: Arc::new(Mutex::new(vec![0u8; size_bytes])),
        }
    }
}

/// All declared areas, addressable the way the protocol addresses them.
pub struct AreaTable {
    pub pe: Option<AreaRuntime>,
    pub pa: Option<AreaRuntime>,
    pub mk: Option<AreaRuntime>,
    pub dbs: BTreeMap<u16, AreaRuntime>,
}

impl AreaTable {
    /// Build the runtime table from a validated configuration. Individual
    /// areas with unusable sizes are skipped with a warning, like the
    /// original server does.
    pub fn from_config(cfg: &S7Config, log: Option<&PluginLog>) -> Self {
        let warn = |msg: String| {
            if let Some(log) = log {
                log.warn(&msg);
            }
        };

        let build_area = |area: &crate::config::AreaCfg, name: &str| -> Option<AreaRuntime> {
            if !area.enabled || area.size_bytes <= 0 {
                return None;
            }
            let ty = area.mapping.resolve()?;
            if area.size_bytes as usize > MAX_DB_SIZE {
                warn(format!("{} area: invalid size {}, skipped", name, area.size_bytes));
                return None;
            }
            Some(AreaRuntime::new(
                area.size_bytes as usize,
                AreaMapping {
                    ty,
                    start_buffer: area.mapping.start_buffer as usize,
                    bit_addressing: area.mapping.bit_addressing,
                },
            ))
        };

        let mut dbs = BTreeMap::new();
        for db in &cfg.data_blocks {
            if db.size_bytes <= 0 || db.size_bytes as usize > MAX_DB_SIZE {
                warn(format!(
                    "DB{}: invalid size {}, skipped",
                    db.db_number, db.size_bytes
                ));
                continue;
            }
            let Some(ty) = db.mapping.resolve() else {
                continue;
            };
            dbs.insert(
                db.db_number as u16,
                AreaRuntime::new(
                    db.size_bytes as usize,
                    AreaMapping {
                        ty,
                        start_buffer: db.mapping.start_buffer as usize,
                        bit_addressing: db.mapping.bit_addressing,
                    },
                ),
            );
        }

        Self {
            pe: build_area(&cfg.system_areas.pe, "PE"),
            pa: build_area(&cfg.system_areas.pa, "PA"),
            mk: build_area(&cfg.system_areas.mk, "MK"),
            dbs,
        }
    }

    pub fn find(&self, area: u8, number: u16) -> Option<&AreaRuntime> {
        match area {
            s7::AREA_PE => self.pe.as_ref(),
            s7::AREA_PA => self.pa.as_ref(),
            s7::AREA_MK => self.mk.as_ref(),
            s7::AREA_DB => self.dbs.get(&number),
            _ => None,
        }
    }

    /// Hand every staging buffer to the server as area backing storage.
    pub fn register_all(&self, server: &S7Server, log: Option<&PluginLog>) {
        let announce = |area: u8, number: u16, rt: &AreaRuntime, name: &str| {
            server.register_area(area, number, Arc::clone(&rt.staging));
            if let Some(log) = log {
                log.info(&format!(
                    "{}: {} bytes -> {}[{}]",
                    name,
                    rt.size_bytes,
                    rt.mapping.ty.name(),
                    rt.mapping.start_buffer
                ));
            }
        };

        if let Some(rt) = &self.pe {
            announce(s7::AREA_PE, 0, rt, "PE area");
        }
        if let Some(rt) = &self.pa {
            announce(s7::AREA_PA, 0, rt, "PA area");
        }
        if let Some(rt) = &self.mk {
            announce(s7::AREA_MK, 0, rt, "MK area");
        }
        for (number, rt) in &self.dbs {
            announce(s7::AREA_DB, *number, rt, &format!("DB{}", number));
        }
    }

    pub fn area_count(&self) -> usize {
        self.dbs.len()
            + self.pe.is_some() as usize
            + self.pa.is_some() as usize
            + self.mk.is_some() as usize
    }
}

// =============================================================================
// Read path: image tables -> wire bytes (big-endian), image lock held
// =============================================================================

/// Fill `out` with a fresh snapshot of the area slice starting at byte
/// `offset`. Unbound cells leave their bytes zeroed. The image lock is
/// taken for exactly the duration of the copy.
pub fn read_area(rt: &Runtime, area: &AreaRuntime, offset: usize, out: &mut [u8]) {
    let ty = area.mapping.ty;
    let elem = ty.element_size();
    let start = area.mapping.start_buffer + offset / elem;
    let count = (out.len() / elem).min(rt.buffer_size().saturating_sub(start));

    let guard = rt.lock();
    match elem {
        1 if ty.is_bool() => {
            for (i, byte) in out.iter_mut().take(count).enumerate() {
                let mut packed = 0u8;
                for bit in 0..8 {
                    if guard.read_bool(ty, start + i, bit).unwrap_or(false) {
                        packed |= 1 << bit;
                    }
                }
                *byte = packed;
            }
        }
        1 => {
            for (i, byte) in out.iter_mut().take(count).enumerate() {
                if let Some(v) = guard.read_byte(ty, start + i) {
                    *byte = v;
                }
            }
        }
        2 => {
            for i in 0..count {
                if let Some(v) = guard.read_int(ty, start + i) {
                    out[i * 2..i * 2 + 2].copy_from_slice(&v.to_be_bytes());
                }
            }
        }
        4 => {
            for i in 0..count {
                if let Some(v) = guard.read_dint(ty, start + i) {
                    out[i * 4..i * 4 + 4].copy_from_slice(&v.to_be_bytes());
                }
            }
        }
        _ => {
            for i in 0..count {
                if let Some(v) = guard.read_lint(ty, start + i) {
                    out[i * 8..i * 8 + 8].copy_from_slice(&v.to_be_bytes());
                }
            }
        }
    }
}

// =============================================================================
// Write path: wire bytes -> journal, no lock
// =============================================================================

/// Split `data` into per-cell writes and feed them through the journal
/// callbacks. Sequence numbers assigned at insertion preserve the order
/// within the frame. Writes to cells past the table bound are clamped off,
/// matching the read path.
pub fn write_area(rt: &Runtime, area: &AreaRuntime, offset: usize, data: &[u8]) {
    let ty = area.mapping.ty;
    // Input families belong to the field side: remote writes to them are
    // dropped without an error to the client.
    if ty.is_input() {
        return;
    }
    let elem = ty.element_size();
    let start = area.mapping.start_buffer + offset / elem;
    let count = (data.len() / elem).min(rt.buffer_size().saturating_sub(start));

    match elem {
        1 if ty.is_bool() => {
            for (i, byte) in data.iter().take(count).enumerate() {
                let index = (start + i) as u16;
                for bit in 0..8u8 {
                    let value = (byte >> bit) & 1 != 0;
                    let _ = rt.write_bool(ty, index, bit, value);
                }
            }
        }
        1 => {
            for (i, byte) in data.iter().take(count).enumerate() {
                let _ = rt.write_byte(ty, (start + i) as u16, *byte);
            }
        }
        2 => {
            for i in 0..count {
                let v = u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
                let _ = rt.write_int(ty, (start + i) as u16, v);
            }
        }
        4 => {
            for i in 0..count {
                let v = u32::from_be_bytes([
                    data[i * 4],
                    data[i * 4 + 1],
                    data[i * 4 + 2],
                    data[i * 4 + 3],
                ]);
                let _ = rt.write_dint(ty, (start + i) as u16, v);
            }
        }
        _ => {
            for i in 0..count {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[i * 8..i * 8 + 8]);
                let _ = rt.write_lint(ty, (start + i) as u16, u64::from_be_bytes(bytes));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S7Config;

    fn table(json: &str) -> AreaTable {
        let cfg = S7Config::parse_str(json).unwrap();
        AreaTable::from_config(&cfg, None)
    }

    #[test]
    fn builds_dbs_and_system_areas() {
        let t = table(
            r#"{
            "data_blocks": [
                { "db_number": 10, "size_bytes": 4,
                  "mapping": { "type": "int_input", "start_buffer": 0 } }
            ],
            "system_areas": {
                "mk": { "enabled": true, "size_bytes": 8,
                        "mapping": { "type": "bool_memory", "start_buffer": 0 } }
            }
        }"#,
        );
        assert_eq!(t.area_count(), 2);
        assert!(t.find(s7::AREA_DB, 10).is_some());
        assert!(t.find(s7::AREA_DB, 11).is_none());
        assert!(t.find(s7::AREA_MK, 0).is_some());
        assert!(t.find(s7::AREA_PE, 0).is_none());
        assert_eq!(t.find(s7::AREA_DB, 10).unwrap().staging.lock().unwrap().len(), 4);
    }

    #[test]
    fn oversized_db_is_skipped() {
        let t = table(
            r#"{
            "data_blocks": [
                { "db_number": 1, "size_bytes": 100000,
                  "mapping": { "type": "int_output", "start_buffer": 0 } },
                { "db_number": 2, "size_bytes": 0,
                  "mapping": { "type": "int_output", "start_buffer": 0 } }
            ]
        }"#,
        );
        assert_eq!(t.area_count(), 0);
    }

    #[test]
    fn disabled_system_area_is_absent() {
        let t = table(
            r#"{
            "system_areas": {
                "pe": { "enabled": false, "size_bytes": 8,
                        "mapping": { "type": "bool_input", "start_buffer": 0 } }
            }
        }"#,
        );
        assert_eq!(t.area_count(), 0);
    }
}
