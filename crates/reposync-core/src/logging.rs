//! Logging init: file under the XDG state dir, or stderr when that fails.

use anyhow::Result;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reposync=debug"))
}

/// Log file writer; any handle that cannot be cloned degrades to stderr so a
/// sync never dies over logging.
struct LogFile(fs::File);

enum LogWriter {
    File(fs::File),
    Stderr,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogWriter::File(f) => f.write(buf),
            LogWriter::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogWriter::File(f) => f.flush(),
            LogWriter::Stderr => io::stderr().lock().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.0
            .try_clone()
            .map(LogWriter::File)
            .unwrap_or(LogWriter::Stderr)
    }
}

fn state_log_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("reposync")?;
    let dir = xdg_dirs.get_state_home();
    fs::create_dir_all(&dir)?;
    Ok(dir.join("reposync.log"))
}

/// Initialize logging to `~/.local/state/reposync/reposync.log`.
/// Returns Err when the state dir is unusable so the caller can fall back.
pub fn init_logging() -> Result<()> {
    let path = state_log_path()?;
    let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(LogFile(file))
        .with_ansi(false)
        .init();

    tracing::info!("reposync logging initialized at {}", path.display());
    Ok(())
}

/// Stderr-only logging, for when `init_logging` fails or for test harnesses.
pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}
