//! Per-worker output destinations.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Append-only destination for successful results, owned by exactly one worker
pub trait Sink: Send {
    /// Append one result
    fn write_result(&mut self, result: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Writes one result per line to any `Write`
pub struct WriterSink<W: Write + Send> {
    writer: BufWriter<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink {
            writer: BufWriter::new(writer),
        }
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn write_result(&mut self, result: &str) -> io::Result<()> {
        self.writer.write_all(result.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub type FileSink = WriterSink<File>;

impl FileSink {
    /// Create (or truncate) the file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(WriterSink::new(file))
    }

    /// Create `dir` and one sink per worker at `dir/<worker_id>`
    pub fn for_workers<P: AsRef<Path>>(dir: P, count: usize) -> io::Result<Vec<(PathBuf, FileSink)>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        (0..count)
            .map(|id| {
                let path = dir.join(id.to_string());
                let sink = FileSink::create(&path)?;
                Ok((path, sink))
            })
            .collect()
    }
}

/// Collects results in memory; clones share the same buffer
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock()
    }
}

impl Sink for MemorySink {
    fn write_result(&mut self, result: &str) -> io::Result<()> {
        self.lines.lock().push(result.to_string());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        *self.flushes.lock() += 1;
        Ok(())
    }
}
