//! Storage manager: bounded-capacity flat file store over a `Filesystem`.
//!
//! Writes stream into `<name>.part` and become visible only on commit, so a
//! failed transfer never leaves a partial file behind. Capacity is enforced on
//! every append; reclamation deletes committed files until enough space is free.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::integrity::{self, ContentHash, ContentHasher};

/// Suffix of in-flight writes.
pub const PART_SUFFIX: &str = ".part";

/// Prefix for names derived from content hashes.
pub const DEFAULT_NAME_PREFIX: &str = "f_";

const HASH_FRAGMENT_LEN: usize = 8;
const MAX_EXTENSION_LEN: usize = 8;
const SCAN_CHUNK: usize = 4096;

/// One directory entry as enumerated by the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    /// Modification time, unix seconds.
    pub modified: u64,
}

/// Flat file namespace the store runs on. Enumeration order is whatever the
/// backend yields and is preserved by the store.
pub trait Filesystem {
    fn entries(&self) -> io::Result<Vec<Entry>>;
    /// Create or truncate.
    fn create(&mut self, name: &str) -> io::Result<()>;
    fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()>;
    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    /// Replaces `to` if it exists.
    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;
    fn remove(&mut self, name: &str) -> io::Result<()>;
}

/// In-memory filesystem. Enumerates in creation order.
#[derive(Debug, Default, Clone)]
pub struct MemFs {
    files: Vec<(String, Vec<u8>, u64)>,
    clock: u64,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file directly with an explicit modification time (test and preload helper).
    pub fn insert(&mut self, name: &str, data: Vec<u8>, modified: u64) {
        self.files.retain(|(n, _, _)| n != name);
        self.files.push((name.to_string(), data, modified));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.iter().any(|(n, _, _)| n == name)
    }

    fn find(&self, name: &str) -> io::Result<usize> {
        self.files
            .iter()
            .position(|(n, _, _)| n == name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl Filesystem for MemFs {
    fn entries(&self) -> io::Result<Vec<Entry>> {
        Ok(self
            .files
            .iter()
            .map(|(name, data, modified)| Entry {
                name: name.clone(),
                size: data.len() as u64,
                modified: *modified,
            })
            .collect())
    }

    fn create(&mut self, name: &str) -> io::Result<()> {
        let t = self.tick();
        self.insert(name, Vec::new(), t);
        Ok(())
    }

    fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        let i = self.find(name)?;
        self.files[i].1.extend_from_slice(data);
        Ok(())
    }

    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = &self.files[self.find(name)?].1;
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        let i = self.find(from)?;
        let (_, data, modified) = self.files.remove(i);
        self.insert(to, data, modified);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        let i = self.find(name)?;
        self.files.remove(i);
        Ok(())
    }
}

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    /// Lowercase hex MD5.
    pub md5: String,
    /// Unix seconds.
    pub created_at: u64,
}

/// Order in which reclamation deletes files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimOrder {
    /// Ascending `created_at`; ties keep enumeration order.
    #[default]
    OldestFirst,
    /// Raw directory enumeration order.
    Enumeration,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("insufficient storage: need {needed} bytes, {free} free")]
    InsufficientSpace { needed: u64, free: u64 },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("another write is in progress ({0})")]
    WriteInProgress(String),
    #[error("no write in progress")]
    NoPendingWrite,
    #[error("storage i/o: {0}")]
    Io(#[from] io::Error),
}

struct Pending {
    name: String,
    written: u64,
}

/// Bounded-capacity file store. Authoritative owner of the File Record set.
pub struct StorageManager<F: Filesystem> {
    fs: F,
    capacity: u64,
    order: ReclaimOrder,
    records: Vec<FileRecord>,
    pending: Option<Pending>,
}

impl<F: Filesystem> StorageManager<F> {
    /// Open the store: drop leftover partial writes, then hash every file to rebuild its records.
    pub fn open(mut fs: F, capacity: u64, order: ReclaimOrder) -> Result<Self, StorageError> {
        let mut records = Vec::new();
        for entry in fs.entries()? {
            if entry.name.ends_with(PART_SUFFIX) {
                warn!(file = %entry.name, "removing interrupted write");
                fs.remove(&entry.name)?;
                continue;
            }
            let md5 = hash_file(&fs, &entry.name)?;
            records.push(FileRecord {
                name: entry.name,
                size: entry.size,
                md5: md5.to_hex(),
                created_at: entry.modified,
            });
        }
        info!(files = records.len(), capacity, "storage opened");
        Ok(Self {
            fs,
            capacity,
            order,
            records,
            pending: None,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by committed files plus the in-flight write.
    pub fn used(&self) -> u64 {
        let committed: u64 = self.records.iter().map(|r| r.size).sum();
        committed + self.pending.as_ref().map_or(0, |p| p.written)
    }

    pub fn free_space(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    /// Snapshot of all File Records in enumeration order.
    pub fn list(&self) -> Vec<FileRecord> {
        self.records.clone()
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Make sure `needed` bytes are free, reclaiming once if they are not.
    pub fn ensure_free(&mut self, needed: u64) -> Result<(), StorageError> {
        if self.free_space() >= needed {
            return Ok(());
        }
        if needed > self.capacity {
            return Err(StorageError::InsufficientSpace {
                needed,
                free: self.free_space(),
            });
        }
        self.reclaim_until(needed)?;
        let free = self.free_space();
        if free < needed {
            return Err(StorageError::InsufficientSpace { needed, free });
        }
        Ok(())
    }

    /// Delete committed files (per the reclaim order) until `min_free` bytes are free
    /// or no files remain. Returns the deleted names.
    pub fn reclaim_until(&mut self, min_free: u64) -> Result<Vec<String>, StorageError> {
        let mut victims: Vec<(usize, u64, String)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, r.created_at, r.name.clone()))
            .collect();
        if self.order == ReclaimOrder::OldestFirst {
            victims.sort_by_key(|(i, created, _)| (*created, *i));
        }
        let mut removed = Vec::new();
        for (_, _, name) in victims {
            if self.free_space() >= min_free {
                break;
            }
            self.remove(&name)?;
            info!(file = %name, free = self.free_space(), "reclaimed");
            removed.push(name);
        }
        Ok(removed)
    }

    /// Start a streamed write staged under `staging`. Only one write may be in flight.
    pub fn begin_write(&mut self, staging: &str) -> Result<(), StorageError> {
        validate_name(staging)?;
        if let Some(p) = &self.pending {
            return Err(StorageError::WriteInProgress(p.name.clone()));
        }
        self.fs.create(&part_name(staging))?;
        self.pending = Some(Pending {
            name: staging.to_string(),
            written: 0,
        });
        debug!(file = %staging, "write started");
        Ok(())
    }

    /// Bytes appended to the in-flight write so far.
    pub fn pending_len(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.written)
    }

    /// Append to the in-flight write. Fails without writing if capacity would be exceeded.
    pub fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let staging = match &self.pending {
            Some(p) => part_name(&p.name),
            None => return Err(StorageError::NoPendingWrite),
        };
        let free = self.free_space();
        if data.len() as u64 > free {
            return Err(StorageError::InsufficientSpace {
                needed: data.len() as u64,
                free,
            });
        }
        self.fs.append(&staging, data)?;
        if let Some(p) = self.pending.as_mut() {
            p.written += data.len() as u64;
        }
        Ok(())
    }

    /// Publish the in-flight write as `name` and register its record.
    /// Replaces any existing file with the same name.
    pub fn commit(&mut self, name: &str, hash: &ContentHash) -> Result<FileRecord, StorageError> {
        validate_name(name)?;
        let pending = self.pending.take().ok_or(StorageError::NoPendingWrite)?;
        if let Err(e) = self.fs.rename(&part_name(&pending.name), name) {
            self.pending = Some(pending);
            return Err(e.into());
        }
        self.records.retain(|r| r.name != name);
        let record = FileRecord {
            name: name.to_string(),
            size: pending.written,
            md5: hash.to_hex(),
            created_at: unix_now(),
        };
        self.records.push(record.clone());
        debug!(file = %name, size = pending.written, "write committed");
        Ok(record)
    }

    /// Abandon the in-flight write and delete its partial file.
    pub fn discard(&mut self) -> Result<(), StorageError> {
        let pending = self.pending.take().ok_or(StorageError::NoPendingWrite)?;
        self.fs.remove(&part_name(&pending.name))?;
        debug!(file = %pending.name, "write discarded");
        Ok(())
    }

    /// Store a complete buffer, reclaiming space first if needed.
    pub fn write_new(&mut self, name: &str, bytes: &[u8]) -> Result<FileRecord, StorageError> {
        validate_name(name)?;
        self.ensure_free(bytes.len() as u64)?;
        self.begin_write(name)?;
        if let Err(e) = self.append(bytes) {
            let _ = self.discard();
            return Err(e);
        }
        self.commit(name, &integrity::hash_bytes(bytes))
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let size = self
            .get(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?
            .size;
        let mut out = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < out.len() {
            let n = self.fs.read_at(name, filled as u64, &mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    pub fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if self.get(name).is_none() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(self.fs.read_at(name, offset, buf)?)
    }

    pub fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        if self.get(name).is_none() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        self.fs.remove(name)?;
        self.records.retain(|r| r.name != name);
        Ok(())
    }
}

fn part_name(name: &str) -> String {
    format!("{name}{PART_SUFFIX}")
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
        || name.ends_with(PART_SUFFIX)
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn hash_file<F: Filesystem>(fs: &F, name: &str) -> io::Result<ContentHash> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; SCAN_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = fs.read_at(name, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok(hasher.finalize())
}

/// Derive the stored name: prefix + first 8 hex chars of the content hash + original extension.
/// Falls back to hashing the original name when `hash_hex` carries no hex digits.
pub fn derive_name(prefix: &str, hash_hex: &str, original: &str) -> String {
    let mut fragment: String = hash_hex
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(HASH_FRAGMENT_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if fragment.is_empty() {
        fragment = integrity::hash_bytes(original.as_bytes()).to_hex()[..HASH_FRAGMENT_LEN]
            .to_string();
    }
    let ext: String = original
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_EXTENSION_LEN)
        .collect();
    if ext.is_empty() {
        format!("{prefix}{fragment}")
    } else {
        format!("{prefix}{fragment}.{}", ext.to_ascii_lowercase())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Read-only mirror of the File Record set, shared with the network context.
/// Refreshed explicitly after a transfer changes storage.
#[derive(Debug, Clone, Default)]
pub struct FileListMirror {
    inner: std::sync::Arc<std::sync::RwLock<Vec<FileRecord>>>,
}

impl FileListMirror {
    pub fn new(records: Vec<FileRecord>) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::RwLock::new(records)),
        }
    }

    pub fn replace(&self, records: Vec<FileRecord>) {
        match self.inner.write() {
            Ok(mut g) => *g = records,
            Err(poisoned) => *poisoned.into_inner() = records,
        }
    }

    pub fn snapshot(&self) -> Vec<FileRecord> {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }
}
