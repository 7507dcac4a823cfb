//! Tether wire protocol: JSON envelopes `{"type": ..., "data": {...}}` exchanged over the control link.

use serde::{Deserialize, Serialize};

use crate::storage::FileRecord;

/// Firmware version announced in `online`.
pub const DEVICE_VERSION: &str = "1.0.0";

/// Error codes carried by outbound `error` messages.
pub mod codes {
    pub const DOWNLOAD_FAILED: u16 = 1001;
    pub const UPLOAD_FAILED: u16 = 1002;
    pub const INSUFFICIENT_STORAGE: u16 = 1003;
    pub const CHECKSUM_MISMATCH: u16 = 1004;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Messages the device sends. Field order is fixed by declaration order, so
/// encoding the same value twice yields identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Online {
        data: OnlineData,
    },
    FileList {
        data: FileListData,
    },
    /// Timestamp sits beside `type`, not under `data`.
    Heartbeat {
        timestamp: u64,
    },
    DownloadAck {
        status: Status,
        message: String,
        data: FileRef,
    },
    DownloadComplete {
        status: Status,
        data: Completion,
    },
    DownloadProgress {
        data: Progress,
    },
    UploadAck {
        status: Status,
        message: String,
        data: FileRef,
    },
    UploadComplete {
        status: Status,
        data: Completion,
    },
    UploadProgress {
        data: Progress,
    },
    Error {
        status: Status,
        code: u16,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineData {
    pub version: String,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListData {
    pub files: Vec<FileEntry>,
}

/// One File Record as announced in `file_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub md5: String,
    pub timestamp: u64,
}

impl From<&FileRecord> for FileEntry {
    fn from(r: &FileRecord) -> Self {
        Self {
            filename: r.name.clone(),
            size: r.size,
            md5: r.md5.clone(),
            timestamp: r.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub filename: String,
    pub md5: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub filename: String,
    pub percent: u8,
    pub transferred: u64,
    pub total_size: u64,
}

impl Outbound {
    pub fn online(version: &str, mac: &str) -> Self {
        Outbound::Online {
            data: OnlineData {
                version: version.to_string(),
                mac: mac.to_string(),
            },
        }
    }

    pub fn file_list(records: &[FileRecord]) -> Self {
        Outbound::FileList {
            data: FileListData {
                files: records.iter().map(FileEntry::from).collect(),
            },
        }
    }

    pub fn heartbeat(timestamp: u64) -> Self {
        Outbound::Heartbeat { timestamp }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Outbound::Error {
            status: Status::Error,
            code,
            message: message.into(),
        }
    }

    /// Wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Online { .. } => "online",
            Outbound::FileList { .. } => "file_list",
            Outbound::Heartbeat { .. } => "heartbeat",
            Outbound::DownloadAck { .. } => "download_ack",
            Outbound::DownloadComplete { .. } => "download_complete",
            Outbound::DownloadProgress { .. } => "download_progress",
            Outbound::UploadAck { .. } => "upload_ack",
            Outbound::UploadComplete { .. } => "upload_complete",
            Outbound::UploadProgress { .. } => "upload_progress",
            Outbound::Error { .. } => "error",
        }
    }
}

/// Acknowledgement kinds: no payload is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Online,
    FileList,
    Heartbeat,
    DownloadComplete,
    UploadComplete,
}

impl AckKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        Some(match kind {
            "online_ack" => AckKind::Online,
            "file_list_ack" => AckKind::FileList,
            "heartbeat_ack" => AckKind::Heartbeat,
            "download_complete_ack" => AckKind::DownloadComplete,
            "upload_complete_ack" => AckKind::UploadComplete,
            _ => return None,
        })
    }

    /// Kinds handled inline in the network context without full parsing.
    pub fn is_trivial(self) -> bool {
        matches!(self, AckKind::Online | AckKind::FileList | AckKind::Heartbeat)
    }
}

/// `download_notify` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownloadNotify {
    pub filename: String,
    pub url: String,
    pub md5: String,
    pub size: u64,
}

/// `upload_request` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub url: String,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Ack(AckKind),
    DownloadNotify(DownloadNotify),
    UploadRequest(UploadRequest),
    ServerError { code: Option<i64>, message: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_kinds() {
        assert_eq!(AckKind::from_type("online_ack"), Some(AckKind::Online));
        assert_eq!(
            AckKind::from_type("upload_complete_ack"),
            Some(AckKind::UploadComplete)
        );
        assert_eq!(AckKind::from_type("download_notify"), None);
        assert!(AckKind::Heartbeat.is_trivial());
        assert!(!AckKind::DownloadComplete.is_trivial());
    }

    #[test]
    fn file_entry_from_record() {
        let rec = FileRecord {
            name: "f_0a1b2c3d.bin".into(),
            size: 12,
            md5: "0a1b2c3d0a1b2c3d0a1b2c3d0a1b2c3d".into(),
            created_at: 1_700_000_000,
        };
        let e = FileEntry::from(&rec);
        assert_eq!(e.filename, rec.name);
        assert_eq!(e.timestamp, rec.created_at);
    }
}
