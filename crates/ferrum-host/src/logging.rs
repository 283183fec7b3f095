//! Central logging.
//!
//! Every record renders as one UTF-8 line:
//!
//! ```text
//! 2026-08-02T09:15:02.417Z INFO [SCAN] scan cycle running
//! ```
//!
//! RFC-3339 timestamp, level name in uppercase, bracketed component tag,
//! message. Lines are duplicated to standard output and to every client
//! connected to the log-sink UNIX socket (the management UI tails that
//! socket).
//!
//! The component tag is the `tracing` target for host code; plugin log
//! callbacks carry their own component string (e.g. `S7COMM`) through the
//! `component` field.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::os::raw::c_char;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer as FmtWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

// =============================================================================
// Line format
// =============================================================================

struct LineFormat;

#[derive(Default)]
struct LineVisitor {
    message: String,
    component: Option<String>,
    extra: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "component" => self.component = Some(value.to_string()),
            name => {
                let _ = write!(self.extra, " {}={}", name, value);
            }
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            "component" => self.component = Some(format!("{:?}", value)),
            name => {
                let _ = write!(self.extra, " {}={:?}", name, value);
            }
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let component = visitor
            .component
            .unwrap_or_else(|| meta.target().to_string());
        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        writeln!(
            writer,
            "{} {} [{}] {}{}",
            ts,
            meta.level(),
            component.to_uppercase(),
            visitor.message,
            visitor.extra
        )
    }
}

// =============================================================================
// Duplicating sink
// =============================================================================

static SINK_CLIENTS: Mutex<Vec<UnixStream>> = Mutex::new(Vec::new());

struct SinkWriter;

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(buf);
        let _ = stdout.flush();

        if let Ok(mut clients) = SINK_CLIENTS.lock() {
            // A client that stops reading gets dropped, not retried.
            clients.retain_mut(|c| c.write_all(buf).is_ok());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct SinkMakeWriter;

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SinkMakeWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter
    }
}

/// Accept log-sink clients. Nonblocking accept so the thread can notice
/// shutdown.
fn sink_listener_loop(listener: UnixListener) {
    listener
        .set_nonblocking(true)
        .expect("log sink nonblocking");
    while crate::scan::keep_running() {
        match listener.accept() {
            Ok((stream, _)) => {
                tracing::debug!(target: "log", "log sink client connected");
                if let Ok(mut clients) = SINK_CLIENTS.lock() {
                    clients.push(stream);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                tracing::warn!(target: "log", "log sink accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

/// Install the subscriber and (optionally) serve the log-sink socket.
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init(level: Level, sink_socket: Option<&Path>) -> io::Result<()> {
    if let Some(path) = sink_socket {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        std::thread::Builder::new()
            .name("log-sink".into())
            .spawn(move || sink_listener_loop(listener))
            .expect("spawn log sink thread");
    }

    let _ = tracing_subscriber::fmt()
        .event_format(LineFormat)
        .with_writer(SinkMakeWriter)
        .with_max_level(level)
        .try_init();
    Ok(())
}

// =============================================================================
// Plugin log callbacks (handed out through RuntimeArgs)
// =============================================================================

unsafe fn cstr_or<'a>(ptr: *const c_char, fallback: &'a str) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return fallback.into();
    }
    unsafe { std::ffi::CStr::from_ptr(ptr) }.to_string_lossy()
}

macro_rules! plugin_log_fn {
    ($name:ident, $macro:ident) => {
        /// # Safety
        ///
        /// Both pointers must be null or NUL-terminated strings.
        pub unsafe extern "C" fn $name(component: *const c_char, message: *const c_char) {
            let component = unsafe { cstr_or(component, "plugin") };
            let message = unsafe { cstr_or(message, "") };
            tracing::$macro!(target: "plugin", component = %component, "{}", message);
        }
    };
}

plugin_log_fn!(plugin_log_info, info);
plugin_log_fn!(plugin_log_debug, debug);
plugin_log_fn!(plugin_log_warn, warn);
plugin_log_fn!(plugin_log_error, error);
