//! Ferrum development tasks.
//!
//! Usage:
//!   cargo xtask dist [--release]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Artifacts that ship as dylibs: the reference plugin and the demo
/// control program.
const CDYLIBS: &[&str] = &["s7comm-server", "blinker"];

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(|s| s.as_str()) {
        Some("dist") => {
            let release = args.iter().any(|a| a == "--release");
            dist(release);
        }
        _ => {
            eprintln!("Usage:");
            eprintln!("  cargo xtask dist [--release]   Build plugin/program dylibs into dist/");
            std::process::exit(1);
        }
    }
}

fn workspace_root() -> PathBuf {
    // xtask lives in <root>/xtask
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest.parent().expect("xtask has a parent").to_path_buf()
}

fn dylib_name(package: &str) -> String {
    let base = package.replace('-', "_");
    #[cfg(target_os = "macos")]
    return format!("lib{}.dylib", base);
    #[cfg(not(target_os = "macos"))]
    format!("lib{}.so", base)
}

fn dist(release: bool) {
    let root = workspace_root();

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).arg("build");
    for package in CDYLIBS {
        cmd.args(["-p", package]);
    }
    if release {
        cmd.arg("--release");
    }
    let status = cmd.status().expect("run cargo build");
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }

    let profile = if release { "release" } else { "debug" };
    let target_dir = root.join("target").join(profile);
    let dist_dir = root.join("dist");
    fs::create_dir_all(&dist_dir).expect("create dist/");

    for package in CDYLIBS {
        let name = dylib_name(package);
        let from = target_dir.join(&name);
        let to = dist_dir.join(&name);
        copy(&from, &to);
        println!("dist: {}", to.display());
    }
}

fn copy(from: &Path, to: &Path) {
    if let Err(e) = fs::copy(from, to) {
        eprintln!("cannot copy {} -> {}: {}", from.display(), to.display(), e);
        std::process::exit(1);
    }
}
