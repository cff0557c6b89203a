//! Tracing setup and the reopenable log file used for rotation.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

struct LogFileInner {
    path: PathBuf,
    file: spin::Mutex<File>,
}

/// An append-mode log file whose handle can be swapped after rotation.
///
/// Every write takes the lock, so a `reopen` never loses a buffered line:
/// lines written before the swap land in the rotated file, lines after in
/// the fresh one.
#[derive(Clone)]
pub struct LogFile {
    inner: Arc<LogFileInner>,
}

impl LogFile {
    pub fn open(dir: &Path, name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = append_handle(&path)?;
        Ok(Self { inner: Arc::new(LogFileInner { path, file: spin::Mutex::new(file) }) })
    }

    /// Swap in a fresh handle at the same path (the rotated file has been
    /// renamed away by the operator's logrotate).
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = append_handle(&self.inner.path)?;
        *self.inner.file.lock() = fresh;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

fn append_handle(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.file.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Verbosity selected on the command line; `RUST_LOG` overrides when set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Silent,
    Normal,
    Verbose,
}

impl Verbosity {
    fn default_filter(self) -> &'static str {
        match self {
            Self::Silent => "error",
            Self::Normal => "info",
            Self::Verbose => "trace",
        }
    }
}

fn env_filter(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_filter()))
}

/// Log to stderr; the interactive/foreground mode.
pub fn init_stderr(verbosity: Verbosity) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity))
        .with_writer(io::stderr)
        .init();
}

/// Log to a reopenable file under `dir`; returns the handle the runtime uses
/// to service `reopen_logs`.
pub fn init_file(dir: &Path, name: &str, verbosity: Verbosity) -> io::Result<LogFile> {
    let file = LogFile::open(dir, name)?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity))
        .with_writer(file.clone())
        .with_ansi(false)
        .init();
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_keeps_writing_at_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFile::open(dir.path(), "server.log").unwrap();

        writeln!(log, "before rotation").unwrap();

        // Rotate the file away, then reopen.
        let rotated = dir.path().join("server.log.1");
        std::fs::rename(log.path(), &rotated).unwrap();
        log.reopen().unwrap();
        writeln!(log, "after rotation").unwrap();

        assert_eq!(std::fs::read_to_string(rotated).unwrap(), "before rotation\n");
        assert_eq!(std::fs::read_to_string(log.path()).unwrap(), "after rotation\n");
    }
}
