//! Persisted-state layout.
//!
//! One well-known directory holds everything the runtime persists or
//! serves over the filesystem: the `.env` runtime configuration, the
//! metadata database (owned by the management UI, opaque here) and the
//! two UNIX sockets. The core creates the directory group-writable so the
//! management UI's user can reach the sockets.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_DIR: &str = "/var/lib/ferrum";

pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Create (if needed) and open the state directory, group-writable.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut perms = std::fs::metadata(&root)?.permissions();
        perms.set_mode(0o2775);
        std::fs::set_permissions(&root, perms)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    /// The metadata database. The core never opens it; the path exists so
    /// diagnostics can report it.
    pub fn database(&self) -> PathBuf {
        self.root.join("ferrum.db")
    }

    pub fn command_socket(&self) -> PathBuf {
        self.root.join("control.sock")
    }

    pub fn log_socket(&self) -> PathBuf {
        self.root.join("log.sock")
    }

    /// Read `.env` if present. Missing file is an empty config, not an
    /// error; the core does not own the file's schema.
    pub fn load_env(&self) -> HashMap<String, String> {
        match std::fs::read_to_string(self.env_file()) {
            Ok(text) => parse_env(&text),
            Err(_) => HashMap::new(),
        }
    }
}

/// `KEY=VALUE` lines; `#` comments and blank lines skipped; values may be
/// quoted. Later keys win.
pub fn parse_env(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        out.insert(key.to_string(), value.to_string());
    }
    out
}
