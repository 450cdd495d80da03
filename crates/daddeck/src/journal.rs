//! # State Journal
//!
//! **Crash-safe pity counters, ban statuses, violations and delivered packs.**
//!
//! Every state change is appended here before it is applied in memory. On
//! startup the journal is replayed; the last record for a key wins.
//!
//! ## Guarantees
//!
//! 1. **Ordering**: records replay in the order they were appended
//! 2. **Integrity**: every record carries a CRC32; replay stops at the first
//!    bad record and the unreadable tail is cut off before new appends
//! 3. **No torn appends**: a failed append is cut back off the file before
//!    the next one; if that fails too, the journal refuses further appends
//! 4. **Compaction**: `compact()` rewrites the file with one record per key.
//!    The delivery ledger keeps one record per pack ever issued.
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "DDSJ"]
//! [4 bytes: version]
//! [8 bytes: base LSN]
//!
//! Entry format:
//! [8 bytes: LSN]
//! [1 byte: record type (PITY/BAN/VIOLATION/DELIVERY)]
//! [4 bytes: payload length]
//! [N bytes: payload]
//! [4 bytes: CRC32 of above]
//! ```
//!
//! All integers are little-endian. Strings are a `u32` length plus UTF-8.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use daddeck_economy::{PackEntropy, PackHeader, PackType, PityCounter};
use daddeck_security::{BanStatus, SecurityViolation, Severity, ViolationKind};
use daddeck_shared::{Fingerprint, Timestamp};

use crate::error::{PackError, PackResult};

/// Magic bytes identifying a state journal.
const JOURNAL_MAGIC: &[u8; 4] = b"DDSJ";

/// Current format version.
const JOURNAL_VERSION: u32 = 1;

/// Header size in bytes.
const HEADER_LEN: u64 = 16;

/// LSN + type + length.
const FRAME_PREFIX_LEN: usize = 8 + 1 + 4;

/// Anything larger is corruption.
const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Journal record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Pity = 1,
    Ban = 2,
    Violation = 3,
    Delivery = 4,
}

impl RecordType {
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pity),
            2 => Some(Self::Ban),
            3 => Some(Self::Violation),
            4 => Some(Self::Delivery),
            _ => None,
        }
    }
}

/// A pack handed out: enough to hand it out again, or to check a submission
/// card for card.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// Identity the pack was opened for.
    pub owner: Fingerprint,
    /// Id, type, open time and committed entropy.
    pub header: PackHeader,
    /// Pity counter the cards were rolled against.
    pub counter_before: PityCounter,
    /// When the pack went into the collection, if it has.
    pub submitted_at: Option<Timestamp>,
}

impl Delivery {
    /// A pack just opened and not yet submitted.
    #[must_use]
    pub const fn new(owner: Fingerprint, header: PackHeader, counter_before: PityCounter) -> Self {
        Self {
            owner,
            header,
            counter_before,
            submitted_at: None,
        }
    }
}

/// One durable state change.
#[derive(Clone, Debug, PartialEq)]
pub enum StateRecord {
    /// Full pity counter after an open.
    Pity {
        /// Owner.
        fingerprint: Fingerprint,
        /// Counter value.
        counter: PityCounter,
    },
    /// Full ban status after a violation.
    Ban {
        /// Owner.
        fingerprint: Fingerprint,
        /// Status value.
        status: BanStatus,
    },
    /// A recorded violation.
    Violation(SecurityViolation),
    /// A delivered pack, or its updated submission state.
    Delivery(Delivery),
}

impl StateRecord {
    const fn record_type(&self) -> RecordType {
        match self {
            Self::Pity { .. } => RecordType::Pity,
            Self::Ban { .. } => RecordType::Ban,
            Self::Violation(_) => RecordType::Violation,
            Self::Delivery(_) => RecordType::Delivery,
        }
    }

    fn encode(&self) -> PackResult<Vec<u8>> {
        let mut enc = Encoder::default();
        match self {
            Self::Pity {
                fingerprint,
                counter,
            } => {
                enc.str(fingerprint.as_str());
                enc.counter(counter);
            }
            Self::Ban {
                fingerprint,
                status,
            } => {
                enc.str(fingerprint.as_str());
                enc.u8(u8::from(status.is_banned));
                match &status.reason {
                    Some(reason) => {
                        enc.u8(1);
                        enc.str(reason);
                    }
                    None => enc.u8(0),
                }
                match status.banned_at {
                    Some(at) => {
                        enc.u8(1);
                        enc.u64(at.as_millis());
                    }
                    None => enc.u8(0),
                }
                enc.count(status.violation_ids.len());
                for id in &status.violation_ids {
                    enc.uuid(id);
                }
            }
            Self::Violation(v) => {
                enc.uuid(&v.id);
                enc.u8(v.kind as u8);
                enc.u8(v.severity as u8);
                enc.u64(v.timestamp.as_millis());
                enc.str(v.fingerprint.as_str());
                enc.str(&v.details);
            }
            Self::Delivery(d) => {
                enc.str(d.owner.as_str());
                enc.uuid(&d.header.id);
                enc.u8(pack_type_tag(d.header.pack_type));
                enc.u64(d.header.opened_at.as_millis());
                enc.bytes(&d.header.entropy.client_seed);
                enc.bytes(&d.header.entropy.server_nonce);
                enc.bytes(&d.header.entropy.server_seed);
                enc.bytes(&d.header.entropy.combined_hash);
                enc.counter(&d.counter_before);
                match d.submitted_at {
                    Some(at) => {
                        enc.u8(1);
                        enc.u64(at.as_millis());
                    }
                    None => enc.u8(0),
                }
            }
        }
        enc.finish()
    }

    fn decode(record_type: RecordType, payload: &[u8]) -> Option<Self> {
        let mut dec = Decoder { buf: payload };
        let record = match record_type {
            RecordType::Pity => Self::Pity {
                fingerprint: Fingerprint::new(dec.string()?),
                counter: dec.counter()?,
            },
            RecordType::Ban => {
                let fingerprint = Fingerprint::new(dec.string()?);
                let is_banned = dec.flag()?;
                let reason = if dec.flag()? { Some(dec.string()?) } else { None };
                let banned_at = if dec.flag()? {
                    Some(Timestamp::from_millis(dec.u64()?))
                } else {
                    None
                };
                let count = dec.u32()? as usize;
                let mut violation_ids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    violation_ids.push(dec.uuid()?);
                }
                Self::Ban {
                    fingerprint,
                    status: BanStatus {
                        is_banned,
                        reason,
                        violation_ids,
                        banned_at,
                    },
                }
            }
            RecordType::Violation => Self::Violation(SecurityViolation {
                id: dec.uuid()?,
                kind: ViolationKind::from_u8(dec.u8()?)?,
                severity: Severity::from_u8(dec.u8()?)?,
                timestamp: Timestamp::from_millis(dec.u64()?),
                fingerprint: Fingerprint::new(dec.string()?),
                details: dec.string()?,
            }),
            RecordType::Delivery => Self::Delivery(Delivery {
                owner: Fingerprint::new(dec.string()?),
                header: PackHeader {
                    id: dec.uuid()?,
                    pack_type: pack_type_from_tag(dec.u8()?)?,
                    opened_at: Timestamp::from_millis(dec.u64()?),
                    entropy: PackEntropy {
                        client_seed: dec.array()?,
                        server_nonce: dec.array()?,
                        server_seed: dec.array()?,
                        combined_hash: dec.array()?,
                    },
                },
                counter_before: dec.counter()?,
                submitted_at: if dec.flag()? {
                    Some(Timestamp::from_millis(dec.u64()?))
                } else {
                    None
                },
            }),
        };
        dec.buf.is_empty().then_some(record)
    }
}

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
    overflow: bool,
}

impl Encoder {
    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn count(&mut self, len: usize) {
        match u32::try_from(len) {
            Ok(len) => self.u32(len),
            Err(_) => self.overflow = true,
        }
    }

    fn str(&mut self, value: &str) {
        self.count(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn uuid(&mut self, id: &Uuid) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    fn counter(&mut self, counter: &PityCounter) {
        self.u32(counter.packs_since_rare);
        self.u32(counter.packs_since_epic);
        self.u32(counter.packs_since_legendary);
        self.u32(counter.packs_since_mythic);
        self.u64(counter.last_updated.as_millis());
    }

    fn finish(self) -> PackResult<Vec<u8>> {
        if self.overflow || self.buf.len() > MAX_PAYLOAD_LEN {
            return Err(PackError::StorageUnavailable(
                "state record too large for the journal".to_string(),
            ));
        }
        Ok(self.buf)
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn flag(&mut self) -> Option<bool> {
        match self.u8()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)?.try_into().ok().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)?.try_into().ok().map(u64::from_le_bytes)
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }

    fn uuid(&mut self) -> Option<Uuid> {
        Uuid::from_slice(self.take(16)?).ok()
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn counter(&mut self) -> Option<PityCounter> {
        Some(PityCounter {
            packs_since_rare: self.u32()?,
            packs_since_epic: self.u32()?,
            packs_since_legendary: self.u32()?,
            packs_since_mythic: self.u32()?,
            last_updated: Timestamp::from_millis(self.u64()?),
        })
    }
}

const fn pack_type_tag(pack_type: PackType) -> u8 {
    match pack_type {
        PackType::Standard => 0,
        PackType::Premium => 1,
    }
}

const fn pack_type_from_tag(tag: u8) -> Option<PackType> {
    match tag {
        0 => Some(PackType::Standard),
        1 => Some(PackType::Premium),
        _ => None,
    }
}

/// State rebuilt from a journal.
#[derive(Clone, Debug, Default)]
pub struct RecoveredState {
    /// Latest counter per identity.
    pub pity: HashMap<Fingerprint, PityCounter>,
    /// Latest ban status per identity.
    pub bans: HashMap<Fingerprint, BanStatus>,
    /// Every violation, in journal order.
    pub violations: Vec<SecurityViolation>,
    /// Latest delivery record per pack id.
    pub deliveries: HashMap<Uuid, Delivery>,
    /// Records read.
    pub records: u64,
    /// Bytes cut off after the last good record.
    pub discarded_bytes: u64,
    seen_violations: HashSet<Uuid>,
}

impl RecoveredState {
    /// Folds one record in. Later records for the same key replace earlier ones.
    pub fn apply(&mut self, record: StateRecord) {
        self.records += 1;
        match record {
            StateRecord::Pity {
                fingerprint,
                counter,
            } => {
                self.pity.insert(fingerprint, counter);
            }
            StateRecord::Ban {
                fingerprint,
                status,
            } => {
                self.bans.insert(fingerprint, status);
            }
            StateRecord::Violation(v) => {
                if self.seen_violations.insert(v.id) {
                    self.violations.push(v);
                }
            }
            StateRecord::Delivery(d) => {
                self.deliveries.insert(d.header.id, d);
            }
        }
    }

    /// True when nothing was recovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pity.is_empty()
            && self.bans.is_empty()
            && self.violations.is_empty()
            && self.deliveries.is_empty()
    }

    /// One record per key: pity and bans by fingerprint, deliveries by open
    /// time. Input for compaction.
    #[must_use]
    pub fn into_records(self) -> Vec<StateRecord> {
        let mut pity: Vec<_> = self.pity.into_iter().collect();
        pity.sort_by(|a, b| a.0.cmp(&b.0));
        let mut bans: Vec<_> = self.bans.into_iter().collect();
        bans.sort_by(|a, b| a.0.cmp(&b.0));
        let mut deliveries: Vec<_> = self.deliveries.into_values().collect();
        deliveries.sort_by_key(|d| (d.header.opened_at, d.header.id));

        pity.into_iter()
            .map(|(fingerprint, counter)| StateRecord::Pity {
                fingerprint,
                counter,
            })
            .chain(deliveries.into_iter().map(StateRecord::Delivery))
            .chain(
                self.violations.into_iter().map(StateRecord::Violation),
            )
            .chain(bans.into_iter().map(|(fingerprint, status)| StateRecord::Ban {
                fingerprint,
                status,
            }))
            .collect()
    }
}

/// Append-only journal of state changes.
pub struct StateJournal {
    /// Path to the journal file.
    path: PathBuf,
    /// Next Log Sequence Number.
    next_lsn: AtomicU64,
    /// Write end of the file. `None` once an append could not be rolled back.
    tail: Mutex<Option<Tail>>,
}

/// Buffered writer plus the offset where the last complete append ended.
struct Tail {
    out: BufWriter<JournalFile>,
    committed: u64,
}

impl StateJournal {
    /// Opens or creates a journal and replays it.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::StorageUnavailable`] if the file cannot be opened
    /// or is not a state journal.
    pub fn open(path: impl AsRef<Path>) -> PackResult<(Self, RecoveredState)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            write_header(&mut file, 0)?;
            file.sync_data()?;
        }

        let replay = Self::recover(&mut file, &path)?;

        let file_len = file.metadata()?.len();
        if replay.valid_end < file_len {
            tracing::warn!(
                "State journal {}: dropping {} unreadable bytes after offset {}",
                path.display(),
                file_len - replay.valid_end,
                replay.valid_end
            );
            file.set_len(replay.valid_end)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(replay.valid_end))?;

        let mut state = replay.state;
        state.discarded_bytes = file_len - replay.valid_end;
        if state.records > 0 {
            tracing::info!(
                "State journal {}: replayed {} records ({} identities, {} deliveries, {} violations)",
                path.display(),
                state.records,
                state.pity.len(),
                state.deliveries.len(),
                state.violations.len()
            );
        }

        let journal = Self {
            path,
            next_lsn: AtomicU64::new(replay.next_lsn),
            tail: Mutex::new(Some(Tail {
                out: BufWriter::new(JournalFile::new(file)),
                committed: replay.valid_end,
            })),
        };
        Ok((journal, state))
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// LSN the next record will get.
    #[must_use]
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst)
    }

    /// Whether appends are still accepted.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.tail.lock().is_some()
    }

    /// Appends one record and flushes it to the OS. Returns its LSN.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::StorageUnavailable`] on IO failure.
    pub fn append(&self, record: &StateRecord) -> PackResult<u64> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Appends several records under one lock and one flush. Returns the
    /// LSN of the last one.
    ///
    /// Either every record reaches the OS or none does: on a write or flush
    /// error the file is cut back to where the previous append ended. If
    /// that fails too, the journal stops accepting appends.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::StorageUnavailable`] on IO failure or once the
    /// journal has stopped accepting appends. Nothing is written if any
    /// record fails to encode.
    pub fn append_all(&self, records: &[StateRecord]) -> PackResult<u64> {
        let encoded = records
            .iter()
            .map(|r| Ok((r.record_type(), r.encode()?)))
            .collect::<PackResult<Vec<_>>>()?;

        let mut guard = self.tail.lock();
        let Some(tail) = guard.as_mut() else {
            return Err(PackError::StorageUnavailable(format!(
                "state journal {} is not writable",
                self.path.display()
            )));
        };

        let first = self.next_lsn.load(Ordering::SeqCst);
        match write_batch(&mut tail.out, first, &encoded) {
            Ok(written) => {
                tail.committed += written;
                let count = encoded.len() as u64;
                self.next_lsn.store(first + count, Ordering::SeqCst);
                Ok(first + count.saturating_sub(1))
            }
            Err(err) => {
                tracing::error!(
                    "State journal {}: append failed, cutting back to offset {}: {}",
                    self.path.display(),
                    tail.committed,
                    err
                );
                if let Some(tail) = guard.take() {
                    match rollback(tail) {
                        Ok(tail) => *guard = Some(tail),
                        Err(rollback_err) => tracing::error!(
                            "State journal {}: rollback failed, refusing further appends: {}",
                            self.path.display(),
                            rollback_err
                        ),
                    }
                }
                Err(err)
            }
        }
    }

    /// Flushes and fsyncs.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::StorageUnavailable`] on IO failure or once the
    /// journal has stopped accepting appends.
    pub fn sync(&self) -> PackResult<()> {
        let mut guard = self.tail.lock();
        let Some(tail) = guard.as_mut() else {
            return Err(PackError::StorageUnavailable(format!(
                "state journal {} is not writable",
                self.path.display()
            )));
        };
        tail.out.flush()?;
        tail.out.get_ref().file.sync_data()?;
        Ok(())
    }

    /// Rewrites the journal with one record per key. Returns how many were
    /// written.
    ///
    /// Holds the append lock for the whole replay and rewrite. The new file
    /// is written beside the old one and renamed over it.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::StorageUnavailable`] on IO failure or once the
    /// journal has stopped accepting appends.
    pub fn compact(&self) -> PackResult<usize> {
        let mut guard = self.tail.lock();
        let Some(tail) = guard.as_mut() else {
            return Err(PackError::StorageUnavailable(format!(
                "state journal {} is not writable",
                self.path.display()
            )));
        };
        tail.out.flush()?;

        let mut current = File::open(&self.path)?;
        let records = Self::recover(&mut current, &self.path)?.state.into_records();
        let encoded = records
            .iter()
            .map(|r| Ok((r.record_type(), r.encode()?)))
            .collect::<PackResult<Vec<_>>>()?;

        let tmp_path = self.path.with_extension("compact");
        let base_lsn = self.next_lsn.load(Ordering::SeqCst);
        let written = {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            write_header(&mut out, base_lsn)?;
            let written = write_batch(&mut out, base_lsn, &encoded)?;
            out.get_ref().sync_all()?;
            written
        };
        std::fs::rename(&tmp_path, &self.path)?;

        let mut reopened = OpenOptions::new().write(true).open(&self.path)?;
        let committed = HEADER_LEN + written;
        reopened.seek(SeekFrom::Start(committed))?;
        let budget = tail.out.get_ref().budget;
        *tail = Tail {
            out: BufWriter::new(JournalFile {
                file: reopened,
                budget,
            }),
            committed,
        };
        self.next_lsn
            .store(base_lsn + encoded.len() as u64, Ordering::SeqCst);

        tracing::info!(
            "Compacted state journal {} to {} records",
            self.path.display(),
            encoded.len()
        );
        Ok(encoded.len())
    }

    /// Caps how many more bytes reach the file before writes fail.
    #[cfg(test)]
    pub(crate) fn set_write_budget(&self, budget: Option<u64>) {
        if let Some(tail) = self.tail.lock().as_mut() {
            // Buffered bytes belong to the previous budget.
            let _ = tail.out.flush();
            tail.out.get_mut().budget = budget;
        }
    }

    fn recover(file: &mut File, path: &Path) -> PackResult<Replay> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(PackError::StorageUnavailable(format!(
                "{} is not a state journal",
                path.display()
            )));
        }

        let mut version_bytes = [0u8; 4];
        reader.read_exact(&mut version_bytes)?;
        let version = u32::from_le_bytes(version_bytes);
        if version != JOURNAL_VERSION {
            return Err(PackError::StorageUnavailable(format!(
                "unsupported state journal version {version}"
            )));
        }

        let mut lsn_bytes = [0u8; 8];
        reader.read_exact(&mut lsn_bytes)?;
        let base_lsn = u64::from_le_bytes(lsn_bytes);

        let mut replay = Replay {
            state: RecoveredState::default(),
            next_lsn: base_lsn,
            valid_end: HEADER_LEN,
        };

        // End of file or corruption.
        while let Some((lsn, record, frame_len)) = read_frame(&mut reader) {
            replay.state.apply(record);
            replay.next_lsn = replay.next_lsn.max(lsn + 1);
            replay.valid_end += frame_len;
        }

        Ok(replay)
    }
}

impl std::fmt::Debug for StateJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateJournal")
            .field("path", &self.path)
            .field("next_lsn", &self.next_lsn())
            .finish_non_exhaustive()
    }
}

struct Replay {
    state: RecoveredState,
    next_lsn: u64,
    valid_end: u64,
}

/// The journal file as the append path sees it.
struct JournalFile {
    file: File,
    /// Bytes still accepted before writes fail. `None` is unlimited.
    budget: Option<u64>,
}

impl JournalFile {
    const fn new(file: File) -> Self {
        Self { file, budget: None }
    }
}

impl Write for JournalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(budget) = self.budget else {
            return self.file.write(buf);
        };
        if budget == 0 {
            return Err(io::Error::other("no space left on device"));
        }
        let allowed = buf.len().min(usize::try_from(budget).unwrap_or(usize::MAX));
        let written = self.file.write(&buf[..allowed])?;
        self.budget = Some(budget - written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Writes and flushes consecutive frames. Returns the bytes written.
fn write_batch<W: Write>(
    out: &mut W,
    first_lsn: u64,
    encoded: &[(RecordType, Vec<u8>)],
) -> PackResult<u64> {
    let mut written = 0;
    for (lsn, (record_type, payload)) in (first_lsn..).zip(encoded) {
        written += write_frame(out, lsn, *record_type, payload)?;
    }
    out.flush()?;
    Ok(written)
}

/// Drops unflushed bytes and cuts the file back to the last complete append.
fn rollback(tail: Tail) -> io::Result<Tail> {
    let (mut inner, _unflushed) = tail.out.into_parts();
    inner.file.set_len(tail.committed)?;
    inner.file.seek(SeekFrom::Start(tail.committed))?;
    inner.file.sync_data()?;
    Ok(Tail {
        out: BufWriter::new(inner),
        committed: tail.committed,
    })
}

fn write_header<W: Write>(out: &mut W, base_lsn: u64) -> std::io::Result<()> {
    out.write_all(JOURNAL_MAGIC)?;
    out.write_all(&JOURNAL_VERSION.to_le_bytes())?;
    out.write_all(&base_lsn.to_le_bytes())
}

fn write_frame<W: Write>(
    out: &mut W,
    lsn: u64,
    record_type: RecordType,
    payload: &[u8],
) -> PackResult<u64> {
    let len = u32::try_from(payload.len())
        .map_err(|_| PackError::StorageUnavailable("state record too large".to_string()))?;

    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len() + 4);
    frame.extend_from_slice(&lsn.to_le_bytes());
    frame.push(record_type as u8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    out.write_all(&frame)?;
    Ok(frame.len() as u64)
}

/// Reads one frame. `None` at end of file or on any corruption.
fn read_frame<R: Read>(reader: &mut R) -> Option<(u64, StateRecord, u64)> {
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    reader.read_exact(&mut prefix).ok()?;

    let lsn = u64::from_le_bytes(prefix[0..8].try_into().ok()?);
    let record_type = RecordType::from_u8(prefix[8])?;
    let payload_len = u32::from_le_bytes(prefix[9..13].try_into().ok()?) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return None;
    }

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).ok()?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes).ok()?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&prefix);
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
        return None;
    }

    let record = StateRecord::decode(record_type, &payload)?;
    let frame_len = (FRAME_PREFIX_LEN + payload_len + 4) as u64;
    Some((lsn, record, frame_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_journal_path() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_state_{id}.journal"))
    }

    fn pity(fp: &str, rare: u32) -> StateRecord {
        StateRecord::Pity {
            fingerprint: Fingerprint::new(fp),
            counter: PityCounter {
                packs_since_rare: rare,
                packs_since_epic: rare + 1,
                packs_since_legendary: rare + 2,
                packs_since_mythic: rare + 3,
                last_updated: Timestamp::from_millis(1_700_000_000_123),
            },
        }
    }

    fn violation(fp: &str) -> SecurityViolation {
        SecurityViolation::new(
            ViolationKind::PackManipulation,
            Severity::High,
            Fingerprint::new(fp),
            Timestamp::from_secs(42),
            "cards not derivable",
        )
    }

    #[test]
    fn test_create_writes_header_only() {
        let path = temp_journal_path();
        {
            let (journal, state) = StateJournal::open(&path).unwrap();
            assert!(state.is_empty());
            assert_eq!(journal.next_lsn(), 0);
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_LEN);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_last_record_per_key_wins() {
        let path = temp_journal_path();
        let v = violation("alice");
        let status = BanStatus {
            is_banned: true,
            reason: Some("immediate: duplicate pack".into()),
            violation_ids: vec![v.id],
            banned_at: Some(Timestamp::from_secs(43)),
        };
        {
            let (journal, _) = StateJournal::open(&path).unwrap();
            journal.append(&pity("alice", 3)).unwrap();
            journal.append(&pity("bob", 1)).unwrap();
            journal.append(&pity("alice", 7)).unwrap();
            journal.append(&StateRecord::Violation(v.clone())).unwrap();
            journal.append(&StateRecord::Violation(v.clone())).unwrap();
            journal
                .append(&StateRecord::Ban {
                    fingerprint: Fingerprint::new("alice"),
                    status: status.clone(),
                })
                .unwrap();
        }

        let (journal, state) = StateJournal::open(&path).unwrap();
        assert_eq!(state.records, 6);
        assert_eq!(journal.next_lsn(), 6);
        assert_eq!(state.pity[&Fingerprint::new("alice")].packs_since_rare, 7);
        assert_eq!(state.pity[&Fingerprint::new("bob")].packs_since_mythic, 4);
        assert_eq!(
            state.pity[&Fingerprint::new("alice")].last_updated,
            Timestamp::from_millis(1_700_000_000_123)
        );
        assert_eq!(state.violations, vec![v]);
        assert_eq!(state.bans[&Fingerprint::new("alice")], status);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_corrupt_record_ends_replay_and_is_cut() {
        let path = temp_journal_path();
        {
            let (journal, _) = StateJournal::open(&path).unwrap();
            journal.append(&pity("alice", 1)).unwrap();
            journal.append(&pity("alice", 2)).unwrap();
            journal.append(&pity("alice", 3)).unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        {
            let (journal, state) = StateJournal::open(&path).unwrap();
            assert_eq!(state.records, 2);
            assert!(state.discarded_bytes > 0);
            assert_eq!(state.pity[&Fingerprint::new("alice")].packs_since_rare, 2);
            journal.append(&pity("alice", 9)).unwrap();
        }

        let (_, state) = StateJournal::open(&path).unwrap();
        assert_eq!(state.records, 3);
        assert_eq!(state.discarded_bytes, 0);
        assert_eq!(state.pity[&Fingerprint::new("alice")].packs_since_rare, 9);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_compact_keeps_one_record_per_key() {
        let path = temp_journal_path();
        {
            let (journal, _) = StateJournal::open(&path).unwrap();
            for i in 0..50 {
                journal.append(&pity("alice", i)).unwrap();
                journal.append(&pity("bob", i * 2)).unwrap();
            }
            journal
                .append(&StateRecord::Violation(violation("bob")))
                .unwrap();
        }

        let size_before = fs::metadata(&path).unwrap().len();
        {
            let (journal, _) = StateJournal::open(&path).unwrap();
            assert_eq!(journal.compact().unwrap(), 3);
            assert_eq!(journal.next_lsn(), 104);
            journal.append(&pity("carol", 5)).unwrap();
        }
        assert!(fs::metadata(&path).unwrap().len() < size_before);

        let (journal, state) = StateJournal::open(&path).unwrap();
        assert_eq!(state.records, 4);
        assert_eq!(journal.next_lsn(), 105);
        assert_eq!(state.pity[&Fingerprint::new("alice")].packs_since_rare, 49);
        assert_eq!(state.pity[&Fingerprint::new("bob")].packs_since_rare, 98);
        assert_eq!(state.pity[&Fingerprint::new("carol")].packs_since_rare, 5);
        assert_eq!(state.violations.len(), 1);
        fs::remove_file(&path).ok();
    }

    fn delivery(fp: &str, seed: u8, opened_secs: u64) -> Delivery {
        Delivery::new(
            Fingerprint::new(fp),
            PackHeader {
                id: Uuid::new_v4(),
                pack_type: PackType::Premium,
                opened_at: Timestamp::from_secs(opened_secs),
                entropy: PackEntropy {
                    client_seed: [seed; 32],
                    server_nonce: [seed.wrapping_add(1); 16],
                    server_seed: [seed.wrapping_add(2); 32],
                    combined_hash: [seed.wrapping_add(3); 32],
                },
            },
            PityCounter {
                packs_since_mythic: u32::from(seed),
                last_updated: Timestamp::from_secs(opened_secs - 1),
                ..PityCounter::default()
            },
        )
    }

    #[test]
    fn test_deliveries_replay_with_latest_submission_state() {
        let path = temp_journal_path();
        let first = delivery("alice", 1, 100);
        let second = delivery("bob", 2, 50);
        let submitted = Delivery {
            submitted_at: Some(Timestamp::from_secs(120)),
            ..first.clone()
        };
        {
            let (journal, _) = StateJournal::open(&path).unwrap();
            journal
                .append_all(&[
                    StateRecord::Delivery(first.clone()),
                    StateRecord::Delivery(second.clone()),
                ])
                .unwrap();
            journal
                .append(&StateRecord::Delivery(submitted.clone()))
                .unwrap();
        }

        let (journal, state) = StateJournal::open(&path).unwrap();
        assert_eq!(state.records, 3);
        assert!(!state.is_empty());
        assert_eq!(state.deliveries.len(), 2);
        assert_eq!(state.deliveries[&first.header.id], submitted);
        assert_eq!(state.deliveries[&second.header.id], second);

        assert_eq!(journal.compact().unwrap(), 2);
        drop(journal);
        let (_, state) = StateJournal::open(&path).unwrap();
        assert_eq!(state.records, 2);
        assert_eq!(state.deliveries[&first.header.id], submitted);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let path = temp_journal_path();
        {
            let (journal, _) = StateJournal::open(&path).unwrap();
            journal.append(&pity("alice", 1)).unwrap();

            journal.set_write_budget(Some(10));
            assert!(matches!(
                journal.append_all(&[pity("alice", 2), pity("bob", 2)]),
                Err(PackError::StorageUnavailable(_))
            ));
            assert_eq!(journal.next_lsn(), 1);
            assert!(journal.is_writable());

            journal.set_write_budget(None);
            assert_eq!(journal.append(&pity("alice", 3)).unwrap(), 1);
        }

        let (journal, state) = StateJournal::open(&path).unwrap();
        assert_eq!(state.records, 2);
        assert_eq!(state.discarded_bytes, 0);
        assert_eq!(journal.next_lsn(), 2);
        assert_eq!(state.pity[&Fingerprint::new("alice")].packs_since_rare, 3);
        assert!(!state.pity.contains_key(&Fingerprint::new("bob")));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_foreign_file_rejected() {
        let path = temp_journal_path();
        fs::write(&path, b"OWAL\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        assert!(matches!(
            StateJournal::open(&path),
            Err(PackError::StorageUnavailable(_))
        ));
        fs::remove_file(&path).ok();
    }
}
