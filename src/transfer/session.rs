//! Transfer sessions.
//!
//! A session moves the units of a single partition from a source node to the local node over
//! one connection. The receiving side drives the session: it sends a `TransferRequest` listing
//! the state of every unit it already holds, then loads unit headers & bytes until the supplier
//! sends the exit marker.
//!
//! Sessions stop cooperatively. The stop check is consulted before any I/O and at every segment
//! boundary, and it trips once the session's cancel token is set or once the baseline version
//! observed by the cluster differs from the version the session was started for.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{GridError, GridResult};
use crate::models::{TransferRequest, TransmissionMeta};
use crate::storage::PartitionStore;
use crate::transfer::channel::TransferChannel;
use crate::transfer::connector::TransferConnector;
use crate::transfer::unit::ChunkIoUnit;
use crate::transfer::{PARAM_ERROR_KIND, PARAM_ERROR_KIND_CORRUPTED};
use crate::NodeId;

/// A probe returning the baseline version currently observed by the cluster.
pub type VersionProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// The status of a transfer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// The session is moving data.
    Running,
    /// All units were received in full.
    Completed,
    /// The session was stopped by a newer topology or by deactivation.
    Cancelled,
    /// The session stopped on an error.
    Failed,
}

impl SessionStatus {
    /// Check if a session in this status may move to the given status.
    ///
    /// `Running` is the only non-terminal status, and terminal statuses are final.
    pub fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.is_terminal()
    }

    /// Check if this status is terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<CancelInner>);

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a new untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip this token.
    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    /// Check if this token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    /// Wait until this token is tripped.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// The result of a finished session.
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: Uuid,
    pub partition: u32,
    pub source: NodeId,
    pub baseline_version: u64,
    pub status: SessionStatus,
    /// The error which stopped the session, if it did not complete.
    pub error: Option<GridError>,
    /// The units of the session, closed, with their transfer progress intact.
    pub units: Vec<ChunkIoUnit>,
}

/// A session moving one partition from a source node to the local node.
pub struct TransferSession {
    id: Uuid,
    partition: u32,
    source: NodeId,
    requester: NodeId,
    baseline_version: u64,
    units: Vec<ChunkIoUnit>,
    status: SessionStatus,
    cancel: CancelToken,
    probe: VersionProbe,
}

impl TransferSession {
    /// Create a new session.
    ///
    /// `units` are the units carried over from a previous attempt for the same partition, if
    /// any; they are resumed from their transferred offsets.
    pub fn new(
        partition: u32, source: NodeId, requester: NodeId, baseline_version: u64, units: Vec<ChunkIoUnit>, cancel: CancelToken, probe: VersionProbe,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            partition,
            source,
            requester,
            baseline_version,
            units,
            status: SessionStatus::Running,
            cancel,
            probe,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn source(&self) -> &NodeId {
        &self.source
    }

    pub fn baseline_version(&self) -> u64 {
        self.baseline_version
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn units(&self) -> &[ChunkIoUnit] {
        &self.units
    }

    /// Check if this session must stop.
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || (self.probe)() != self.baseline_version
    }

    /// Move this session to the given status, returning false if the transition is illegal.
    fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::error!(session = %self.id, from = %self.status, to = %next, "illegal transfer session status transition");
            return false;
        }
        self.status = next;
        true
    }

    /// Run this session to completion, returning its outcome.
    #[tracing::instrument(level = "debug", skip(self, connector, store), fields(session = %self.id, partition = self.partition, source = %self.source))]
    pub async fn run(mut self, connector: Arc<dyn TransferConnector>, store: Arc<dyn PartitionStore>, segment_cap: usize) -> SessionOutcome {
        // A stalled peer must not hold up cancellation, so the token is also awaited directly.
        let cancel = self.cancel.clone();
        let res = tokio::select! {
            res = self.receive(connector.as_ref(), store.as_ref(), segment_cap) => res,
            _ = cancel.cancelled() => Err(GridError::Cancelled),
        };
        for unit in self.units.iter_mut() {
            unit.close().await;
        }
        let (next, error) = match res {
            Ok(()) => (SessionStatus::Completed, None),
            Err(GridError::Cancelled) => (SessionStatus::Cancelled, Some(GridError::Cancelled)),
            Err(err) => (SessionStatus::Failed, Some(err)),
        };
        self.transition(next);
        match &error {
            None => tracing::debug!("transfer session completed"),
            Some(GridError::Cancelled) => tracing::debug!("transfer session cancelled"),
            Some(err) => tracing::warn!(error = %err, "transfer session failed"),
        }
        SessionOutcome {
            id: self.id,
            partition: self.partition,
            source: self.source,
            baseline_version: self.baseline_version,
            status: self.status,
            error,
            units: self.units,
        }
    }

    /// Receive all units of the partition from the source node.
    async fn receive(&mut self, connector: &dyn TransferConnector, store: &dyn PartitionStore, segment_cap: usize) -> GridResult<()> {
        if self.should_stop() {
            return Err(GridError::Cancelled);
        }
        let stream = connector.connect(&self.source).await?;
        let mut channel = TransferChannel::new(stream, segment_cap);
        channel
            .write_request(&TransferRequest {
                session_id: self.id.to_string(),
                partition: self.partition,
                baseline_version: self.baseline_version,
                requester: self.requester.clone(),
                resume: self.units.iter().map(|unit| unit.state()).collect(),
            })
            .await?;

        loop {
            if self.should_stop() {
                return Err(GridError::Cancelled);
            }
            let meta = channel.read_meta().await?;
            if let Some(err) = meta.error_opt() {
                return Err(self.supplier_failure(&meta, err));
            }
            if meta.exit {
                break;
            }

            let idx = match self.units.iter().position(|unit| unit.name() == meta.name) {
                Some(idx) => idx,
                None => self.add_unit(&meta, store).await?,
            };
            let (stop_cancel, stop_probe, version) = (self.cancel.clone(), self.probe.clone(), self.baseline_version);
            let stop = move || stop_cancel.is_cancelled() || stop_probe() != version;
            let unit = &mut self.units[idx];
            match channel.receive_unit(unit, &meta, &stop).await {
                Ok(()) => (),
                Err(err @ GridError::Corrupted(_)) => {
                    unit.reset();
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(unit) = self.units.iter().find(|unit| !unit.is_complete()) {
            return Err(GridError::Protocol(format!(
                "session ended before unit {} was fully loaded [transferred={}, total={}]",
                unit.name(),
                unit.transferred(),
                unit.count()
            )));
        }
        Ok(())
    }

    /// Register a unit first announced by the given header, returning its index.
    async fn add_unit(&mut self, meta: &TransmissionMeta, store: &dyn PartitionStore) -> GridResult<usize> {
        if !meta.initial {
            return Err(GridError::Protocol(format!("received a non-initial header for unknown unit {}", meta.name)));
        }
        if meta.offset.checked_add(meta.count).is_none() {
            return Err(GridError::Protocol(format!(
                "header for unit {} overflows [offset={}, count={}]",
                meta.name, meta.offset, meta.count
            )));
        }
        let target = store.open_for_write(self.partition, 0).await?;
        self.units.push(ChunkIoUnit::new(meta.name.clone(), meta.offset, meta.count, target));
        Ok(self.units.len() - 1)
    }

    /// Build the error for a failure reported by the supplier.
    ///
    /// A corrupted source unit restarts from zero on the next attempt.
    fn supplier_failure(&mut self, meta: &TransmissionMeta, err: &str) -> GridError {
        let corrupted = meta.params.get(PARAM_ERROR_KIND).map(String::as_str) == Some(PARAM_ERROR_KIND_CORRUPTED);
        if !corrupted {
            return GridError::Protocol(format!("supplier {} failed the session: {}", self.source, err));
        }
        if let Some(unit) = self.units.iter_mut().find(|unit| unit.name() == meta.name) {
            unit.reset();
        }
        GridError::Corrupted(format!("supplier {} reported corrupted unit {}: {}", self.source, meta.name, err))
    }
}
