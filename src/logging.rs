use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::progress::OutputMode;

/// Rotate `vmfleet.log` once it grows past this.
const MAX_LOG_BYTES: u64 = 8 * 1024 * 1024;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards writes until `handle.set_file(path)` is
/// called. The subscriber is installed before the root directory is known.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Handle returned by `DeferredFileWriter::new()`; call `set_file` to activate.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Open `path` in append mode, rotating it first if it grew too large.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        rotate_if_large(path, MAX_LOG_BYTES)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

/// Writer handed out per event: the file once activated, otherwise a sink.
pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── rotation ─────────────────────────────────────────────

/// Move `path` to `path.1` when it is larger than `max_bytes`, replacing
/// any previous `.1`.
pub fn rotate_if_large(path: &Path, max_bytes: u64) -> std::io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > max_bytes => {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            fs::rename(path, rotated)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// ── subscriber ───────────────────────────────────────────

/// Install the global subscriber: a stderr layer and a deferred file layer.
///
/// While spinners own the terminal, stderr only carries warnings so the
/// progress lines are not torn apart.
pub fn init(verbose: bool, mode: OutputMode) -> DeferredFileHandle {
    let level = if verbose { "debug" } else { "info" };
    let terminal_filter = match mode {
        OutputMode::Normal if !verbose => EnvFilter::new("vmfleet=warn"),
        OutputMode::Quiet => EnvFilter::new("off"),
        _ => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("vmfleet={level}"))),
    };
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter);

    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vmfleet=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();
    file_handle
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn writes_are_dropped_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/vmfleet.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"lost\n").unwrap();
        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[test]
    fn large_log_is_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmfleet.log");
        fs::write(&path, "0123456789").unwrap();

        rotate_if_large(&path, 100).unwrap();
        assert!(path.exists());

        rotate_if_large(&path, 4).unwrap();
        assert!(!path.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("vmfleet.log.1")).unwrap(),
            "0123456789"
        );
        rotate_if_large(&dir.path().join("missing.log"), 4).unwrap();
    }
}
