//! Transfer engine bookkeeping: size ceiling, capacity reservation, incremental
//! hash, overrun guard and progress throttling. The byte movement itself is
//! done by the host; these sessions only see chunks.

use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::integrity::ContentHasher;
use crate::progress::{ProgressSample, ProgressThrottle};
use crate::protocol::{codes, Outbound, Progress};
use crate::storage::{self, FileRecord, Filesystem, StorageError, StorageManager};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// What to do when a downloaded file does not match its announced hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityPolicy {
    /// Fail the job and drop the data.
    #[default]
    Reject,
    /// Log and keep the file.
    Warn,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub integrity: IntegrityPolicy,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            integrity: IntegrityPolicy::default(),
        }
    }
}

impl TransferLimits {
    /// Reject sizes outside `(0, max_file_size]`.
    pub fn validate_size(&self, size: u64) -> Result<(), TransferError> {
        if size == 0 {
            return Err(TransferError::Empty);
        }
        if size > self.max_file_size {
            return Err(TransferError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }
}

/// One file transfer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub id: Uuid,
    pub direction: Direction,
    pub remote_locator: String,
    /// Requested name for downloads, stored name for uploads.
    pub local_name: String,
    pub declared_size: u64,
    /// Downloads only.
    pub expected_hash: Option<String>,
}

impl TransferJob {
    pub fn download(url: &str, filename: &str, size: u64, md5: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: Direction::Download,
            remote_locator: url.to_string(),
            local_name: filename.to_string(),
            declared_size: size,
            expected_hash: Some(md5.to_string()),
        }
    }

    /// Declared size is filled in from the stored record when the upload begins.
    pub fn upload(url: &str, filename: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: Direction::Upload,
            remote_locator: url.to_string(),
            local_name: filename.to_string(),
            declared_size: 0,
            expected_hash: None,
        }
    }

    pub fn progress_message(&self, sample: &ProgressSample) -> Outbound {
        let data = Progress {
            filename: self.local_name.clone(),
            percent: sample.percent,
            transferred: sample.bytes_so_far,
            total_size: sample.total_bytes,
        };
        match self.direction {
            Direction::Download => Outbound::DownloadProgress { data },
            Direction::Upload => Outbound::UploadProgress { data },
        }
    }

    fn staging_name(&self) -> String {
        format!("job-{}", self.id.simple())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file size {size} exceeds limit {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("empty transfer")]
    Empty,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("network: {0}")]
    Network(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("body exceeds {limit} bytes")]
    Overrun { limit: u64 },
    #[error("body truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("transfer aborted")]
    Aborted,
}

impl TransferError {
    /// Error code reported to the server.
    pub fn code(&self, direction: Direction) -> u16 {
        match self {
            TransferError::Storage(StorageError::InsufficientSpace { .. }) => {
                codes::INSUFFICIENT_STORAGE
            }
            TransferError::ChecksumMismatch { .. } => codes::CHECKSUM_MISMATCH,
            _ => match direction {
                Direction::Download => codes::DOWNLOAD_FAILED,
                Direction::Upload => codes::UPLOAD_FAILED,
            },
        }
    }
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReport {
    Downloaded(FileRecord),
    Uploaded { name: String, size: u64, md5: String },
}

/// In-flight download. Writes go to a staging file; nothing is visible in
/// storage until `finish` commits it under the derived name.
pub struct Download {
    job: TransferJob,
    limits: TransferLimits,
    hasher: ContentHasher,
    throttle: ProgressThrottle,
    bound: u64,
    written: u64,
    name_prefix: String,
}

impl Download {
    /// Pre-flight: size ceiling and capacity (reclaiming if needed), then open the staging file.
    /// Runs before any network request.
    pub fn begin<F: Filesystem>(
        storage: &mut StorageManager<F>,
        job: TransferJob,
        limits: TransferLimits,
    ) -> Result<Self, TransferError> {
        limits.validate_size(job.declared_size)?;
        storage.ensure_free(job.declared_size)?;
        storage.begin_write(&job.staging_name())?;
        debug!(job = %job.id, file = %job.local_name, size = job.declared_size, "download prepared");
        Ok(Self {
            throttle: ProgressThrottle::new(job.id),
            bound: job.declared_size,
            job,
            limits,
            hasher: ContentHasher::new(),
            written: 0,
            name_prefix: storage::DEFAULT_NAME_PREFIX.to_string(),
        })
    }

    pub fn job(&self) -> &TransferJob {
        &self.job
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Fix the hard write bound once response headers are in. A missing length keeps the declared size.
    pub fn set_content_length<F: Filesystem>(
        &mut self,
        storage: &mut StorageManager<F>,
        content_length: Option<u64>,
    ) -> Result<(), TransferError> {
        let Some(len) = content_length else {
            return Ok(());
        };
        self.limits.validate_size(len)?;
        if len != self.job.declared_size {
            warn!(job = %self.job.id, declared = self.job.declared_size, content_length = len, "size differs from announcement");
        }
        if len > self.bound {
            storage.ensure_free(len - self.written)?;
        }
        self.bound = len;
        Ok(())
    }

    /// Store one body chunk. Never writes past the bound.
    pub fn write<F: Filesystem>(
        &mut self,
        storage: &mut StorageManager<F>,
        chunk: &[u8],
        now: Instant,
    ) -> Result<Option<ProgressSample>, TransferError> {
        if self.written + chunk.len() as u64 > self.bound {
            return Err(TransferError::Overrun { limit: self.bound });
        }
        for piece in chunk.chunks(self.limits.chunk_size.max(1)) {
            storage.append(piece)?;
            self.hasher.update(piece);
            self.written += piece.len() as u64;
        }
        Ok(self.throttle.observe(self.written, self.bound, now))
    }

    /// Verify and commit. Returns the new record and, if the last sample was throttled away, a final 100% sample.
    pub fn finish<F: Filesystem>(
        mut self,
        storage: &mut StorageManager<F>,
        now: Instant,
    ) -> Result<(FileRecord, Option<ProgressSample>), TransferError> {
        if self.written < self.bound {
            let err = TransferError::Truncated {
                expected: self.bound,
                got: self.written,
            };
            self.discard(storage);
            return Err(err);
        }
        let last = self.throttle.finish(self.written, self.bound, now);
        let hash = self.hasher.clone().finalize();
        if let Some(expected) = self.job.expected_hash.as_deref() {
            if !hash.matches_hex(expected) {
                match self.limits.integrity {
                    IntegrityPolicy::Reject => {
                        self.discard(storage);
                        return Err(TransferError::ChecksumMismatch {
                            expected: expected.to_string(),
                            actual: hash.to_hex(),
                        });
                    }
                    IntegrityPolicy::Warn => {
                        warn!(job = %self.job.id, expected, actual = %hash, "checksum mismatch, keeping file");
                    }
                }
            }
        }
        let name = storage::derive_name(&self.name_prefix, &hash.to_hex(), &self.job.local_name);
        let record = match storage.commit(&name, &hash) {
            Ok(r) => r,
            Err(e) => {
                self.discard(storage);
                return Err(e.into());
            }
        };
        info!(job = %self.job.id, file = %record.name, size = record.size, md5 = %record.md5, "download stored");
        Ok((record, last))
    }

    /// Drop the staging file.
    pub fn abort<F: Filesystem>(self, storage: &mut StorageManager<F>) {
        self.discard(storage);
    }

    fn discard<F: Filesystem>(&self, storage: &mut StorageManager<F>) {
        if let Err(e) = storage.discard() {
            warn!(job = %self.job.id, error = %e, "failed to drop partial download");
        }
    }
}

/// In-flight upload: reads the stored file in fixed chunks, never past its recorded size.
pub struct Upload {
    job: TransferJob,
    limits: TransferLimits,
    hasher: ContentHasher,
    throttle: ProgressThrottle,
    size: u64,
    offset: u64,
}

impl Upload {
    pub fn begin<F: Filesystem>(
        storage: &StorageManager<F>,
        mut job: TransferJob,
        limits: TransferLimits,
    ) -> Result<Self, TransferError> {
        let size = storage
            .get(&job.local_name)
            .ok_or_else(|| StorageError::NotFound(job.local_name.clone()))?
            .size;
        limits.validate_size(size)?;
        job.declared_size = size;
        debug!(job = %job.id, file = %job.local_name, size, "upload prepared");
        Ok(Self {
            throttle: ProgressThrottle::new(job.id),
            job,
            limits,
            hasher: ContentHasher::new(),
            size,
            offset: 0,
        })
    }

    pub fn job(&self) -> &TransferJob {
        &self.job
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Next chunk with its progress sample, or `None` once the recorded size is reached.
    pub fn next_chunk<F: Filesystem>(
        &mut self,
        storage: &StorageManager<F>,
        now: Instant,
    ) -> Result<Option<(Vec<u8>, Option<ProgressSample>)>, TransferError> {
        let remaining = self.size - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        let want = (self.limits.chunk_size.max(1) as u64).min(remaining) as usize;
        let mut buf = vec![0u8; want];
        let n = storage.read_at(&self.job.local_name, self.offset, &mut buf)?;
        if n == 0 {
            return Err(TransferError::Truncated {
                expected: self.size,
                got: self.offset,
            });
        }
        buf.truncate(n);
        self.hasher.update(&buf);
        self.offset += n as u64;
        let sample = self.throttle.observe(self.offset, self.size, now);
        Ok(Some((buf, sample)))
    }

    pub fn finish(mut self, now: Instant) -> (TransferReport, Option<ProgressSample>) {
        let last = self.throttle.finish(self.offset, self.size, now);
        let md5 = self.hasher.finalize().to_hex();
        info!(job = %self.job.id, file = %self.job.local_name, size = self.offset, md5 = %md5, "upload sent");
        (
            TransferReport::Uploaded {
                name: self.job.local_name,
                size: self.offset,
                md5,
            },
            last,
        )
    }
}
