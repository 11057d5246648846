//! Logging and tracing initialization

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!("mooring={}", level)
}

/// In-memory copy of everything logged during a debug run
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far
    pub fn contents(&self) -> String {
        let buf = match self.0.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl io::Write for CaptureBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::other("debug capture poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Plain-text layer writing into `capture`
fn capture_layer<S>(capture: &CaptureBuffer) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let capture = capture.clone();
    fmt::layer()
        .with_writer(move || capture.clone())
        .with_target(false)
        .with_ansi(false)
}

/// Initialize logging: compact text on stderr, JSON lines in `log_file`
///
/// `RUST_LOG` takes precedence over `verbose`. A log file that cannot be
/// opened is reported and skipped. With `capture`, every event is also
/// kept in memory for the debug summary email.
pub fn init(verbose: bool, log_file: Option<&Path>, capture: Option<&CaptureBuffer>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Warning: cannot open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    let file_layer = file.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_target(true)
            .with_ansi(false)
            .json()
    });

    let capture_layer = capture.map(capture_layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(capture_layer)
        .try_init()
        .ok();
}
