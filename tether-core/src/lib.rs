//! Tether device session engine.
//! Host-driven: no network I/O; the host passes events and receives actions.

pub mod connection;
pub mod core;
pub mod dispatch;
pub mod identity;
pub mod integrity;
pub mod progress;
pub mod protocol;
pub mod storage;
pub mod transfer;
pub mod wire;

pub use connection::{BackoffPolicy, ConnAction, ConnState, Connection};
pub use core::{Action, Delivery, SessionCore};
pub use dispatch::{route, FrameKind, InboundEvent, Route};
pub use identity::{MacAddress, SessionIdentity};
pub use protocol::{Inbound, Outbound, DEVICE_VERSION};
pub use storage::{FileListMirror, FileRecord, Filesystem, MemFs, ReclaimOrder, StorageManager};
pub use transfer::{
    Direction, Download, IntegrityPolicy, TransferError, TransferJob, TransferLimits,
    TransferReport, Upload,
};
pub use wire::{decode, encode, DecodeError, EncodeError};
