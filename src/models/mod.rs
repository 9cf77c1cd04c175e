//! Data models.

pub mod proto;

pub use proto::transfer::{AutoAdjustRecord, BaselineRecord, ClusterStateKind, ClusterStateRecord, TransferRequest, TransmissionMeta, TransmissionPolicy};
