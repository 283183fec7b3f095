//! Command socket.
//!
//! A line-oriented protocol on a UNIX domain socket, used by the external
//! management UI: `start`, `stop`, `status`, `reload`. One command per
//! line; the reply is a single line starting with an exit code — `0` on
//! success (optionally followed by detail), nonzero with a short
//! diagnostic on failure.
//!
//! Commands may arrive at any time; each one is serialised onto the scan
//! engine's state machine (the engine's own control lock does the
//! serialising, so a command never observes a half-finished tick).

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use crate::scan::{self, ScanEngine};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("cannot bind command socket: {0}")]
    Bind(#[from] io::Error),
}

/// Dispatch one command line against the engine. Returns the reply line
/// (without the trailing newline).
pub fn dispatch(engine: &ScanEngine, line: &str) -> String {
    match line.trim() {
        "start" => match engine.start() {
            Ok(()) => "0".into(),
            Err(e) => format!("1 {}", e),
        },
        "stop" => match engine.stop() {
            Ok(()) => "0".into(),
            Err(e) => format!("1 {}", e),
        },
        "reload" => match engine.reload() {
            Ok(()) => "0".into(),
            Err(e) => format!("1 {}", e),
        },
        "status" => {
            let s = engine.status();
            format!(
                "0 state={} tick={} overruns={} scan_max_us={}",
                s.state,
                s.tick_counter,
                s.stats.overruns,
                if s.stats.scan_count > 0 {
                    s.stats.scan_time_max
                } else {
                    0
                }
            )
        }
        "" => "2 empty command".into(),
        other => format!("2 unknown command `{}`", other),
    }
}

fn serve_client(engine: &ScanEngine, stream: UnixStream) -> io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(()); // peer closed
        }
        let reply = dispatch(engine, &line);
        tracing::debug!(target: "control", "command `{}` -> `{}`", line.trim(), reply);
        stream.write_all(reply.as_bytes())?;
        stream.write_all(b"\n")?;
    }
}

fn listener_loop(listener: UnixListener, engine: ScanEngine) {
    listener
        .set_nonblocking(true)
        .expect("command socket nonblocking");
    while scan::keep_running() {
        match listener.accept() {
            Ok((stream, _)) => {
                // Client connections are short-lived and serial; commands
                // from a second client queue behind the first.
                if stream.set_nonblocking(false).is_ok() {
                    if let Err(e) = serve_client(&engine, stream) {
                        if e.kind() != io::ErrorKind::WouldBlock
                            && e.kind() != io::ErrorKind::TimedOut
                        {
                            tracing::warn!(target: "control", "client error: {}", e);
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                tracing::warn!(target: "control", "accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Bind the command socket and serve it on a dedicated thread.
pub fn spawn(path: &Path, engine: ScanEngine) -> Result<std::thread::JoinHandle<()>, ControlError> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    tracing::info!(target: "control", "command socket at {}", path.display());
    let handle = std::thread::Builder::new()
        .name("plc-control".into())
        .spawn(move || listener_loop(listener, engine))
        .expect("spawn control thread");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_empty_commands() {
        let engine = ScanEngine::new();
        assert_eq!(dispatch(&engine, "bogus"), "2 unknown command `bogus`");
        assert_eq!(dispatch(&engine, "   "), "2 empty command");
    }

    #[test]
    fn start_without_program_reports_failure() {
        let engine = ScanEngine::new();
        let reply = dispatch(&engine, "start");
        assert!(reply.starts_with('1'), "got: {reply}");
    }

    #[test]
    fn status_reports_state() {
        let engine = ScanEngine::new();
        let reply = dispatch(&engine, "status");
        assert!(reply.starts_with("0 state=empty"), "got: {reply}");
    }
}
