//! Host-driven protocol controller: the host passes decoded frames and transfer
//! outcomes in, and gets back the messages to send and jobs to run.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::SessionIdentity;
use crate::protocol::{
    codes, AckKind, Completion, DownloadNotify, FileRef, Inbound, Outbound, Status,
    UploadRequest,
};
use crate::storage::{FileListMirror, Filesystem, StorageManager};
use crate::transfer::{Direction, TransferError, TransferJob, TransferLimits, TransferReport};
use crate::wire;

/// How an outbound message may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Drop if the outbound buffer is full (heartbeat, progress).
    BestEffort,
    /// Wait up to the bounded send timeout (acks, completion notices, lists).
    Bounded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Outbound, Delivery),
    /// Run this job now; report back through `on_transfer_finished`.
    Transfer(TransferJob),
}

/// Owns the storage manager and the active job slot. Single writer: only the
/// dispatcher worker calls into it.
pub struct SessionCore<F: Filesystem> {
    identity: SessionIdentity,
    storage: StorageManager<F>,
    mirror: FileListMirror,
    limits: TransferLimits,
    active: Option<Uuid>,
}

impl<F: Filesystem> SessionCore<F> {
    pub fn new(identity: SessionIdentity, storage: StorageManager<F>, limits: TransferLimits) -> Self {
        let mirror = FileListMirror::new(storage.list());
        Self {
            identity,
            storage,
            mirror,
            limits,
            active: None,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Shared read-only view of the file list for the network context.
    pub fn mirror(&self) -> FileListMirror {
        self.mirror.clone()
    }

    pub fn storage(&self) -> &StorageManager<F> {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut StorageManager<F> {
        &mut self.storage
    }

    pub fn limits(&self) -> TransferLimits {
        self.limits
    }

    pub fn active_job(&self) -> Option<Uuid> {
        self.active
    }

    pub fn file_list_message(&self) -> Outbound {
        Outbound::file_list(&self.storage.list())
    }

    /// Full decode and route. Malformed frames are logged and dropped.
    pub fn on_frame(&mut self, frame: &[u8]) -> Vec<Action> {
        match wire::decode(frame) {
            Ok(msg) => self.on_message(msg),
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping inbound frame");
                Vec::new()
            }
        }
    }

    pub fn on_message(&mut self, msg: Inbound) -> Vec<Action> {
        match msg {
            Inbound::Ack(AckKind::Online) => {
                vec![Action::Send(self.file_list_message(), Delivery::Bounded)]
            }
            Inbound::Ack(kind) => {
                debug!(?kind, "ack");
                Vec::new()
            }
            Inbound::DownloadNotify(n) => self.on_download_notify(n),
            Inbound::UploadRequest(r) => self.on_upload_request(r),
            Inbound::ServerError { code, message } => {
                warn!(?code, message = message.as_deref().unwrap_or(""), "server reported error");
                Vec::new()
            }
        }
    }

    fn on_download_notify(&mut self, n: DownloadNotify) -> Vec<Action> {
        if n.filename.is_empty() || n.url.is_empty() || n.md5.is_empty() || n.size == 0 {
            warn!(file = %n.filename, size = n.size, "incomplete download_notify dropped");
            return Vec::new();
        }
        if let Some(busy) = self.busy(&n.filename, codes::DOWNLOAD_FAILED) {
            return busy;
        }
        let job = TransferJob::download(&n.url, &n.filename, n.size, &n.md5);
        info!(job = %job.id, file = %n.filename, size = n.size, "download requested");
        self.active = Some(job.id);
        vec![
            Action::Send(
                Outbound::DownloadAck {
                    status: Status::Success,
                    message: "download started".to_string(),
                    data: FileRef {
                        filename: n.filename,
                    },
                },
                Delivery::Bounded,
            ),
            Action::Transfer(job),
        ]
    }

    fn on_upload_request(&mut self, r: UploadRequest) -> Vec<Action> {
        if r.filename.is_empty() || r.url.is_empty() {
            warn!(file = %r.filename, "incomplete upload_request dropped");
            return Vec::new();
        }
        if let Some(busy) = self.busy(&r.filename, codes::UPLOAD_FAILED) {
            return busy;
        }
        let job = TransferJob::upload(&r.url, &r.filename);
        info!(job = %job.id, file = %r.filename, "upload requested");
        self.active = Some(job.id);
        vec![
            Action::Send(
                Outbound::UploadAck {
                    status: Status::Success,
                    message: "upload started".to_string(),
                    data: FileRef {
                        filename: r.filename,
                    },
                },
                Delivery::Bounded,
            ),
            Action::Transfer(job),
        ]
    }

    fn busy(&self, filename: &str, code: u16) -> Option<Vec<Action>> {
        let active = self.active?;
        warn!(job = %active, file = %filename, "transfer already active, request rejected");
        Some(vec![Action::Send(
            Outbound::error(code, "another transfer is in progress"),
            Delivery::Bounded,
        )])
    }

    /// Clear the active slot and turn the outcome into outbound messages.
    pub fn on_transfer_finished(
        &mut self,
        job: &TransferJob,
        result: Result<TransferReport, TransferError>,
    ) -> Vec<Action> {
        if self.active == Some(job.id) {
            self.active = None;
        }
        match result {
            Ok(TransferReport::Downloaded(rec)) => {
                self.mirror.replace(self.storage.list());
                vec![
                    Action::Send(
                        Outbound::DownloadComplete {
                            status: Status::Success,
                            data: Completion {
                                filename: rec.name,
                                md5: rec.md5,
                            },
                        },
                        Delivery::Bounded,
                    ),
                    Action::Send(self.file_list_message(), Delivery::Bounded),
                ]
            }
            Ok(TransferReport::Uploaded { name, md5, .. }) => {
                self.mirror.replace(self.storage.list());
                vec![Action::Send(
                    Outbound::UploadComplete {
                        status: Status::Success,
                        data: Completion {
                            filename: name,
                            md5,
                        },
                    },
                    Delivery::Bounded,
                )]
            }
            Err(TransferError::Aborted) => {
                info!(job = %job.id, "transfer aborted by disconnect");
                self.mirror.replace(self.storage.list());
                Vec::new()
            }
            Err(e) => {
                let code = e.code(job.direction);
                warn!(job = %job.id, file = %job.local_name, code, error = %e, "transfer failed");
                // Reclamation may have run even though the job failed.
                self.mirror.replace(self.storage.list());
                let what = match job.direction {
                    Direction::Download => "download",
                    Direction::Upload => "upload",
                };
                vec![Action::Send(
                    Outbound::error(code, format!("{what} of {} failed: {e}", job.local_name)),
                    Delivery::Bounded,
                )]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MacAddress, DEFAULT_NODE_PREFIX};
    use crate::integrity::hash_bytes;
    use crate::storage::{MemFs, ReclaimOrder, StorageError};

    fn core_with(capacity: u64) -> SessionCore<MemFs> {
        let identity = SessionIdentity::derive(
            MacAddress::new([0xa4, 0xcf, 0x12, 0x0b, 0x9e, 0x7f]),
            DEFAULT_NODE_PREFIX,
            "ws://server/ws/",
        );
        let storage = StorageManager::open(MemFs::new(), capacity, ReclaimOrder::OldestFirst).unwrap();
        SessionCore::new(identity, storage, TransferLimits::default())
    }

    fn sent(actions: &[Action]) -> Vec<&Outbound> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(m, _) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn online_ack_sends_empty_file_list() {
        let mut core = core_with(1024);
        let actions = core.on_frame(br#"{"type":"online_ack","status":"success"}"#);
        assert_eq!(actions.len(), 1);
        let msg = wire::encode(sent(&actions)[0]).unwrap();
        assert_eq!(msg, r#"{"type":"file_list","data":{"files":[]}}"#);
    }

    #[test]
    fn file_list_is_stable_without_changes() {
        let mut core = core_with(1024);
        core.storage_mut().write_new("a.bin", b"abc").unwrap();
        let a = wire::encode(&core.file_list_message()).unwrap();
        let b = wire::encode(&core.file_list_message()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn download_notify_acks_and_starts_job() {
        let mut core = core_with(4096);
        let actions = core.on_frame(
            br#"{"type":"download_notify","data":{"filename":"a.bin","url":"http://x/a.bin","md5":"deadbeefdeadbeefdeadbeefdeadbeef","size":1024}}"#,
        );
        assert_eq!(actions.len(), 2);
        match &actions[0] {
            Action::Send(Outbound::DownloadAck { data, .. }, Delivery::Bounded) => {
                assert_eq!(data.filename, "a.bin")
            }
            other => panic!("unexpected {other:?}"),
        }
        match &actions[1] {
            Action::Transfer(job) => {
                assert_eq!(job.direction, Direction::Download);
                assert_eq!(job.declared_size, 1024);
                assert_eq!(core.active_job(), Some(job.id));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn second_request_while_busy_is_rejected() {
        let mut core = core_with(4096);
        let frame = br#"{"type":"upload_request","data":{"filename":"f","url":"http://x/up"}}"#;
        assert_eq!(core.on_frame(frame).len(), 2);
        let actions = core.on_frame(frame);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            sent(&actions)[0],
            Outbound::Error { code: codes::UPLOAD_FAILED, .. }
        ));
    }

    #[test]
    fn incomplete_notify_is_dropped() {
        let mut core = core_with(4096);
        let zero = br#"{"type":"download_notify","data":{"filename":"a","url":"u","md5":"m","size":0}}"#;
        assert!(core.on_frame(zero).is_empty());
        let empty = br#"{"type":"download_notify","data":{"filename":"","url":"u","md5":"m","size":3}}"#;
        assert!(core.on_frame(empty).is_empty());
        assert!(core.active_job().is_none());
    }

    #[test]
    fn malformed_and_unknown_frames_are_dropped() {
        let mut core = core_with(16);
        assert!(core.on_frame(b"{oops").is_empty());
        assert!(core.on_frame(br#"{"type":"reboot"}"#).is_empty());
        assert!(core.on_frame(br#"{"type":"heartbeat_ack"}"#).is_empty());
        assert!(core
            .on_frame(br#"{"type":"error","code":1,"message":"x"}"#)
            .is_empty());
    }

    #[test]
    fn finished_download_refreshes_mirror_and_lists() {
        let mut core = core_with(4096);
        let mirror = core.mirror();
        let job = TransferJob::download("u", "a.bin", 3, "00");
        core.active = Some(job.id);
        let rec = core.storage_mut().write_new("f_900150.bin", b"abc").unwrap();
        let actions = core.on_transfer_finished(&job, Ok(TransferReport::Downloaded(rec.clone())));
        assert!(core.active_job().is_none());
        let msgs = sent(&actions);
        assert_eq!(msgs.len(), 2);
        match msgs[0] {
            Outbound::DownloadComplete { status, data } => {
                assert_eq!(*status, Status::Success);
                assert_eq!(data.md5, hash_bytes(b"abc").to_hex());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(msgs[1].kind(), "file_list");
        assert_eq!(mirror.snapshot(), vec![rec]);
    }

    #[test]
    fn failed_job_reports_error_code() {
        let mut core = core_with(4096);
        let job = TransferJob::download("u", "a.bin", 3, "00");
        let err = TransferError::Storage(StorageError::InsufficientSpace { needed: 9, free: 1 });
        let actions = core.on_transfer_finished(&job, Err(err));
        assert!(matches!(
            sent(&actions)[0],
            Outbound::Error { code: codes::INSUFFICIENT_STORAGE, .. }
        ));
        assert!(core
            .on_transfer_finished(&job, Err(TransferError::Aborted))
            .is_empty());
    }
}
