/// The metadata header sent ahead of the bytes of a transmission unit.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransmissionMeta {
    /// The name of the unit, unique within its session.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// The absolute position of the next byte of the unit.
    #[prost(uint64, tag = "2")]
    pub offset: u64,
    /// The number of bytes which follow this header for the unit.
    #[prost(uint64, tag = "3")]
    pub count: u64,
    /// True if no bytes of this unit have been transferred before.
    #[prost(bool, tag = "4")]
    pub initial: bool,
    /// True if this header marks the end of the session.
    #[prost(bool, tag = "5")]
    pub exit: bool,
    /// Additional unit parameters.
    #[prost(map = "string, string", tag = "6")]
    pub params: ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    /// The transfer policy of the unit.
    #[prost(enumeration = "TransmissionPolicy", tag = "7")]
    pub policy: i32,
    /// An error reported by the peer, empty if none.
    #[prost(string, tag = "8")]
    pub error: ::prost::alloc::string::String,
}
/// A request from a demanding node to open a transfer session for a partition.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferRequest {
    /// The ID of the requesting session.
    #[prost(string, tag = "1")]
    pub session_id: ::prost::alloc::string::String,
    /// The partition to be transferred.
    #[prost(uint32, tag = "2")]
    pub partition: u32,
    /// The baseline topology version which the session was started at.
    #[prost(uint64, tag = "3")]
    pub baseline_version: u64,
    /// The node ID of the requester.
    #[prost(string, tag = "4")]
    pub requester: ::prost::alloc::string::String,
    /// The receiver state of every unit already known to the requester.
    #[prost(message, repeated, tag = "5")]
    pub resume: ::prost::alloc::vec::Vec<TransmissionMeta>,
}
/// The persisted form of a baseline topology.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BaselineRecord {
    /// The version of the baseline.
    #[prost(uint64, tag = "1")]
    pub version: u64,
    /// The node IDs of the baseline, sorted.
    #[prost(string, repeated, tag = "2")]
    pub nodes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// The unix timestamp in seconds of when the baseline was installed.
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}
/// The persisted form of the baseline auto-adjust settings.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AutoAdjustRecord {
    /// True if auto-adjust is enabled.
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    /// The auto-adjust timeout in millis.
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,
}
/// The persisted form of the cluster activation state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterStateRecord {
    /// The activation state, see `ClusterStateKind`.
    #[prost(enumeration = "ClusterStateKind", tag = "1")]
    pub state: i32,
}
/// The transfer policy of a transmission unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TransmissionPolicy {
    /// The unit is backed by a file on the receiving side.
    File = 0,
    /// The unit is backed by an in-memory region on the receiving side.
    Chunk = 1,
}
/// The cluster activation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClusterStateKind {
    Inactive = 0,
    Active = 1,
    ActiveReadOnly = 2,
}
