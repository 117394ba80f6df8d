//! Size-based rotation for append-only files (log output and the
//! `dump_data` JSON-lines sink, AMBIENT STACK §A / spec §9).
//!
//! `tracing-appender`'s rolling writer only rotates on a time boundary;
//! `logging.max_bytes`/`logging.backup_count` and `dump_data_max_bytes`
//! need a byte-size trigger, so this is a small writer of our own rather
//! than a second logging crate.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct Inner {
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
    backup_count: u32,
}

impl Inner {
    fn open(path: PathBuf, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            size,
            max_bytes,
            backup_count,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        if self.backup_count == 0 {
            self.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
            self.size = 0;
            return Ok(());
        }

        let oldest = backup_path(&self.path, self.backup_count);
        let _ = fs::remove_file(&oldest);

        let mut n = self.backup_count;
        while n > 1 {
            let from = backup_path(&self.path, n - 1);
            let to = backup_path(&self.path, n);
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
            n -= 1;
        }
        let _ = fs::rename(&self.path, backup_path(&self.path, 1));

        self.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

/// A cloneable, thread-safe, size-rotating file writer. Each clone shares
/// the same underlying file handle and rotation state.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<Inner>>,
}

impl RotatingWriter {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner::open(path.into(), max_bytes, backup_count)?)),
        })
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.max_bytes > 0 && inner.size + buf.len() as u64 > inner.max_bytes {
            inner.rotate()?;
        }
        let n = inner.file.write(buf)?;
        inner.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
