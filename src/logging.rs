use anyhow::Result;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Overrides the configured log level when set.
pub const LOG_ENV: &str = "SWITCHYARD_LOG";

/// Copies every log line to stdout and, for the daemon, to a log file.
#[derive(Clone)]
pub(crate) struct TeeMakeWriter {
    file: Option<Arc<Mutex<File>>>,
    suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct TeeWriter {
    file: Option<Arc<Mutex<File>>>,
    suppress_stdout: bool,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &self.file {
            file.lock().write_all(buf)?;
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &self.file {
            file.lock().flush()?;
        }
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

pub(crate) fn parse_level(raw: &str) -> Level {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. `SWITCHYARD_LOG` wins over `level`.
pub fn init(level: &str, log_file: Option<&Path>, suppress_stdout: bool) -> Result<()> {
    let level = std::env::var(LOG_ENV)
        .map(|raw| parse_level(&raw))
        .unwrap_or_else(|_| parse_level(level));
    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(Arc::new(Mutex::new(file)))
        }
        None => None,
    };
    let make_writer = TeeMakeWriter {
        file,
        suppress_stdout,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(make_writer)
        .with_ansi(log_file.is_none())
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Already set in tests
    Ok(())
}
