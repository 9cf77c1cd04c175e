//! The chunked transfer engine.
//!
//! Partition data moves between nodes as chunk I/O units: a transmittable target plus the byte
//! range of it which is being transferred. A unit is written to a transfer channel as a header
//! followed by its bytes, in segments bounded by the configured chunk size, and a unit which was
//! interrupted is resumed from the exact byte where it stopped.

pub mod channel;
#[cfg(test)]
mod channel_test;
pub mod connector;
pub mod meta;
pub mod server;
pub mod session;
#[cfg(test)]
mod session_test;
pub mod target;
pub mod unit;

pub use channel::TransferChannel;
pub use connector::{BoxStream, TcpConnector, TransferConnector};
pub use server::{serve_connection, TransferServer};
pub use session::{CancelToken, SessionOutcome, SessionStatus, TransferSession, VersionProbe};
pub use target::{AccessMode, BoxTarget, FileTarget, MemoryRegion, MemoryTarget, TargetIdentity, Transmittable};
pub use unit::ChunkIoUnit;

pub(crate) const METRIC_BYTES_SENT: &str = "tessera_transfer_bytes_sent";
pub(crate) const METRIC_BYTES_RECEIVED: &str = "tessera_transfer_bytes_received";
pub(crate) const METRIC_SESSIONS_SERVED: &str = "tessera_transfer_sessions_served";

/// The meta param naming the kind of a reported failure.
pub(crate) const PARAM_ERROR_KIND: &str = "error_kind";
/// The failure kind reported when the source of a unit is corrupted.
pub(crate) const PARAM_ERROR_KIND_CORRUPTED: &str = "corrupted";

/// Register the metrics of the transfer engine.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_BYTES_SENT, metrics::Unit::Bytes, "the number of partition bytes sent to peers");
    metrics::register_counter!(METRIC_BYTES_RECEIVED, metrics::Unit::Bytes, "the number of partition bytes received from peers");
}
