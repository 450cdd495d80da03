//! # Audit Journal
//!
//! **Group-flushed JSON lines on a background thread**
//!
//! ```text
//!   open_pack ──┐
//!   ban engine ─┼──> [bounded queue] ──> [writer thread] ──> audit.jsonl
//!   submit ─────┘      (never blocks)      (one flush per batch)
//! ```
//!
//! Appends never wait for disk. When the queue is full the line is dropped
//! and counted; audit loss must never stall or fail a pack open.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::AuditRecord;
use crate::error::SecurityResult;

/// Writer tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditJournalConfig {
    /// Lines written before a forced flush.
    pub max_batch_size: usize,
    /// Longest a line waits before a flush (ms).
    pub max_batch_delay_ms: u64,
    /// Queue capacity; appends beyond it are dropped.
    pub queue_capacity: usize,
}

impl Default for AuditJournalConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            max_batch_delay_ms: 20,
            queue_capacity: 16_384,
        }
    }
}

/// Writer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Lines written.
    pub lines_written: u64,
    /// Flushes performed.
    pub batches: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Lines dropped because the queue was full.
    pub dropped: u64,
    /// Lines that failed to serialize or write.
    pub write_errors: u64,
}

struct Barrier {
    done: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl Barrier {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        }
    }

    fn release(&self) {
        let _guard = self.mutex.lock();
        self.done.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.mutex.lock();
        if !self.done.load(Ordering::Acquire) {
            self.condvar.wait_for(&mut guard, timeout);
        }
        self.done.load(Ordering::Acquire)
    }
}

enum Entry {
    Line(String),
    Flush(Arc<Barrier>),
}

struct Queue {
    entries: Mutex<VecDeque<Entry>>,
    not_empty: Condvar,
    capacity: usize,
}

impl Queue {
    fn push(&self, entry: Entry) -> Result<(), Entry> {
        let mut entries = self.entries.lock();
        // Barriers bypass the cap so flush() always completes.
        if matches!(entry, Entry::Line(_)) && entries.len() >= self.capacity {
            return Err(entry);
        }
        entries.push_back(entry);
        self.not_empty.notify_one();
        Ok(())
    }

    fn drain(&self, max_count: usize, timeout: Duration) -> Vec<Entry> {
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            self.not_empty.wait_for(&mut entries, timeout);
        }
        let count = entries.len().min(max_count.max(1));
        entries.drain(..count).collect()
    }
}

/// Buffered JSON-lines audit writer.
pub struct AuditJournal {
    path: PathBuf,
    queue: Arc<Queue>,
    stats: Arc<Mutex<JournalStats>>,
    shutdown: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
}

impl AuditJournal {
    /// Timeout for [`AuditJournal::flush`].
    const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

    /// Opens `path` for appending and starts the writer thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, config: AuditJournalConfig) -> SecurityResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let queue = Arc::new(Queue {
            entries: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity: config.queue_capacity,
        });
        let stats = Arc::new(Mutex::new(JournalStats::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let writer_queue = Arc::clone(&queue);
        let writer_stats = Arc::clone(&stats);
        let writer_shutdown = Arc::clone(&shutdown);
        let writer = thread::Builder::new()
            .name("daddeck-audit".into())
            .spawn(move || Self::writer_loop(file, &writer_queue, &writer_stats, &writer_shutdown, config))?;

        Ok(Self {
            path,
            queue,
            stats,
            shutdown,
            writer: Some(writer),
        })
    }

    /// Journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a record. Never blocks on IO.
    pub fn append(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Audit record {} not serializable: {}", record.seq, e);
                self.stats.lock().write_errors += 1;
                return;
            }
        };

        if self.queue.push(Entry::Line(line)).is_err() {
            let dropped = {
                let mut stats = self.stats.lock();
                stats.dropped += 1;
                stats.dropped
            };
            tracing::warn!("Audit queue full, dropped record {} ({} total)", record.seq, dropped);
        }
    }

    /// Waits (bounded) until everything queued so far is written.
    /// Returns false on timeout.
    pub fn flush(&self) -> bool {
        let barrier = Arc::new(Barrier::new());
        if self.queue.push(Entry::Flush(Arc::clone(&barrier))).is_err() {
            return false;
        }
        barrier.wait_timeout(Self::FLUSH_TIMEOUT)
    }

    /// Writer counters.
    #[must_use]
    pub fn stats(&self) -> JournalStats {
        *self.stats.lock()
    }

    /// Reads a journal back. A missing file is empty; an unparsable line
    /// (usually a torn final write) ends the read.
    ///
    /// # Errors
    ///
    /// Returns an IO error for anything but a missing file.
    pub fn read_records(path: impl AsRef<Path>) -> SecurityResult<Vec<AuditRecord>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        "Audit journal {} line {} unreadable, stopping: {}",
                        path.display(),
                        line_no + 1,
                        e
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    fn writer_loop(
        file: File,
        queue: &Queue,
        stats: &Mutex<JournalStats>,
        shutdown: &AtomicBool,
        config: AuditJournalConfig,
    ) {
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        let timeout = Duration::from_millis(config.max_batch_delay_ms);

        loop {
            let batch = queue.drain(config.max_batch_size, timeout);
            if batch.is_empty() {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }

            let mut written = 0u64;
            let mut bytes = 0u64;
            let mut errors = 0u64;
            let mut barriers = Vec::new();

            for entry in batch {
                match entry {
                    Entry::Line(line) => {
                        let result = writer
                            .write_all(line.as_bytes())
                            .and_then(|()| writer.write_all(b"\n"));
                        match result {
                            Ok(()) => {
                                written += 1;
                                bytes += line.len() as u64 + 1;
                            }
                            Err(e) => {
                                errors += 1;
                                tracing::error!("Audit journal write failed: {}", e);
                            }
                        }
                    }
                    Entry::Flush(barrier) => barriers.push(barrier),
                }
            }

            if let Err(e) = writer.flush() {
                tracing::error!("Audit journal flush failed: {}", e);
            }

            {
                let mut s = stats.lock();
                s.lines_written += written;
                s.bytes_written += bytes;
                s.write_errors += errors;
                s.batches += 1;
            }

            for barrier in barriers {
                barrier.release();
            }
        }

        if let Err(e) = writer.flush() {
            tracing::error!("Audit journal final flush failed: {}", e);
        }
    }
}

impl fmt::Debug for AuditJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditJournal")
            .field("path", &self.path)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for AuditJournal {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _entries = self.queue.entries.lock();
            self.queue.not_empty.notify_all();
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}
