use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::cluster::ClusterState;
use crate::error::{GridError, GridResult};
use crate::fixtures::{self, DuplexConnector, Supplier};
use crate::models::{TransferRequest, TransmissionMeta};
use crate::storage::{MemoryPartitionStore, PartitionStore};
use crate::transfer::meta::{read_frame, write_frame};
use crate::transfer::session::*;
use crate::transfer::{BoxStream, TransferConnector};
use crate::NodeId;

const SEGMENT_CAP: usize = 4096;

fn fixed_version(version: u64) -> VersionProbe {
    Arc::new(move || version)
}

fn new_session(partition: u32, cancel: CancelToken, probe: VersionProbe) -> TransferSession {
    TransferSession::new(partition, "node-b".into(), "node-a".into(), 1, Vec::new(), cancel, probe)
}

/// Setup a supplier `node-b` holding the given data for partition 3.
async fn setup_supplier(data: Vec<u8>) -> Result<(Supplier, tempfile::TempDir)> {
    let (gate, _db, tmpdir) = fixtures::active_gate("node-b", &["node-a", "node-b"]).await?;
    let store = MemoryPartitionStore::new();
    store.insert(3, data).await;
    Ok((Supplier { gate, store: Arc::new(store) }, tmpdir))
}

/// A connector whose peer answers every request with a fixed list of metas.
struct ScriptedConnector {
    metas: Vec<TransmissionMeta>,
}

#[async_trait]
impl TransferConnector for ScriptedConnector {
    async fn connect(&self, _node: &NodeId) -> GridResult<BoxStream> {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let metas = self.metas.clone();
        tokio::spawn(async move {
            let _request: TransferRequest = read_frame(&mut server).await?;
            for meta in metas.iter() {
                write_frame(&mut server, meta).await?;
            }
            Ok::<_, GridError>(())
        });
        Ok(Box::new(client))
    }
}

#[test]
fn session_status_transition_table() {
    use SessionStatus::*;
    let all = [Running, Completed, Cancelled, Failed];
    for from in all {
        for to in all {
            let expected = from == Running && to != Running;
            assert_eq!(from.can_transition_to(to), expected, "unexpected transition rule for {} -> {}", from, to);
        }
    }
    assert!(!Running.is_terminal(), "expected running to be non-terminal");
    assert!(Completed.is_terminal() && Cancelled.is_terminal() && Failed.is_terminal(), "expected terminal statuses");
}

#[tokio::test]
async fn session_receives_partition_from_supplier() -> Result<()> {
    let data = fixtures::random_bytes(50_000);
    let (supplier, _tmp) = setup_supplier(data.clone()).await?;
    let connector: Arc<dyn TransferConnector> = Arc::new(DuplexConnector::new(SEGMENT_CAP).with_supplier("node-b", supplier));
    let store = MemoryPartitionStore::new();

    let outcome = new_session(3, CancelToken::new(), fixed_version(1))
        .run(connector, Arc::new(store.clone()), SEGMENT_CAP)
        .await;

    assert_eq!(outcome.status, SessionStatus::Completed, "expected session to complete, got error {:?}", outcome.error);
    assert_eq!(outcome.units.len(), 1, "expected one unit, got {}", outcome.units.len());
    for unit in outcome.units {
        store.apply_received(3, unit.into_target()).await?;
    }
    let received = store.get(3).await?;
    assert!(received.as_deref() == Some(data.as_slice()), "expected applied partition data to equal the supplier's data");
    Ok(())
}

#[tokio::test]
async fn failed_session_resumes_in_next_session() -> Result<()> {
    let data = fixtures::random_bytes(64 * 1024);
    let (supplier, _tmp) = setup_supplier(data.clone()).await?;
    let duplex = Arc::new(DuplexConnector::new(SEGMENT_CAP).with_supplier("node-b", supplier));
    duplex.push_read_budget(Some(20_000));
    let connector: Arc<dyn TransferConnector> = duplex.clone();
    let store = MemoryPartitionStore::new();

    let first = new_session(3, CancelToken::new(), fixed_version(1))
        .run(connector.clone(), Arc::new(store.clone()), SEGMENT_CAP)
        .await;
    assert_eq!(first.status, SessionStatus::Failed, "expected first session to fail, got {:?}", first.status);
    assert!(
        matches!(&first.error, Some(err) if err.is_retryable()),
        "expected a retryable error, got {:?}",
        first.error
    );
    let transferred = first.units.iter().map(|unit| unit.transferred()).sum::<u64>();
    assert!(transferred > 0 && transferred < data.len() as u64, "expected partial progress, got {}", transferred);

    let second = TransferSession::new(3, "node-b".into(), "node-a".into(), 1, first.units, CancelToken::new(), fixed_version(1))
        .run(connector, Arc::new(store.clone()), SEGMENT_CAP)
        .await;

    assert_eq!(second.status, SessionStatus::Completed, "expected second session to complete, got error {:?}", second.error);
    assert_eq!(duplex.connects(), 2, "expected two connections, got {}", duplex.connects());
    let staged = store.get_staged(3).await?;
    assert!(staged.as_deref() == Some(data.as_slice()), "expected staged bytes to equal the supplier's data");
    Ok(())
}

#[tokio::test]
async fn cancelled_session_performs_no_io() -> Result<()> {
    let (supplier, _tmp) = setup_supplier(fixtures::random_bytes(1024)).await?;
    let duplex = Arc::new(DuplexConnector::new(SEGMENT_CAP).with_supplier("node-b", supplier));
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = new_session(3, cancel, fixed_version(1))
        .run(duplex.clone(), Arc::new(MemoryPartitionStore::new()), SEGMENT_CAP)
        .await;

    assert_eq!(outcome.status, SessionStatus::Cancelled, "expected session to be cancelled, got {:?}", outcome.status);
    assert!(matches!(outcome.error, Some(GridError::Cancelled)), "unexpected error {:?}", outcome.error);
    assert_eq!(duplex.connects(), 0, "expected no connection to be opened, got {}", duplex.connects());
    Ok(())
}

#[tokio::test]
async fn session_observing_newer_baseline_is_cancelled() -> Result<()> {
    let (supplier, _tmp) = setup_supplier(fixtures::random_bytes(1024)).await?;
    let duplex = Arc::new(DuplexConnector::new(SEGMENT_CAP).with_supplier("node-b", supplier));

    let outcome = new_session(3, CancelToken::new(), fixed_version(2))
        .run(duplex, Arc::new(MemoryPartitionStore::new()), SEGMENT_CAP)
        .await;

    assert_eq!(outcome.status, SessionStatus::Cancelled, "expected session to be cancelled, got {:?}", outcome.status);
    Ok(())
}

#[tokio::test]
async fn session_fails_when_supplier_is_inactive() -> Result<()> {
    let (supplier, _tmp) = setup_supplier(fixtures::random_bytes(1024)).await?;
    supplier.gate.set_state(ClusterState::Inactive, &fixtures::nodes(&["node-b"])).await?;
    let duplex = Arc::new(DuplexConnector::new(SEGMENT_CAP).with_supplier("node-b", supplier));

    let outcome = new_session(3, CancelToken::new(), fixed_version(1))
        .run(duplex, Arc::new(MemoryPartitionStore::new()), SEGMENT_CAP)
        .await;

    assert_eq!(outcome.status, SessionStatus::Failed, "expected session to fail, got {:?}", outcome.status);
    assert!(matches!(outcome.error, Some(GridError::Protocol(_))), "expected supplier failure, got {:?}", outcome.error);
    Ok(())
}

#[tokio::test]
async fn empty_partition_completes_without_units() -> Result<()> {
    let (supplier, _tmp) = setup_supplier(fixtures::random_bytes(1024)).await?;
    let duplex = Arc::new(DuplexConnector::new(SEGMENT_CAP).with_supplier("node-b", supplier));

    let outcome = new_session(9, CancelToken::new(), fixed_version(1))
        .run(duplex, Arc::new(MemoryPartitionStore::new()), SEGMENT_CAP)
        .await;

    assert_eq!(outcome.status, SessionStatus::Completed, "expected session to complete, got error {:?}", outcome.error);
    assert!(outcome.units.is_empty(), "expected no units, got {}", outcome.units.len());
    Ok(())
}

#[tokio::test]
async fn cancel_token_wakes_waiters() -> Result<()> {
    let cancel = CancelToken::new();
    let waiter = cancel.clone();
    let handle = tokio::spawn(async move { waiter.cancelled().await });

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle).await??;

    assert!(cancel.is_cancelled(), "expected token to be cancelled");
    Ok(())
}

#[tokio::test]
async fn overflowing_unit_header_fails_the_session() -> Result<()> {
    let header = TransmissionMeta {
        name: "part-3".into(),
        offset: u64::MAX - 10,
        count: 100,
        initial: true,
        ..Default::default()
    };
    let connector = Arc::new(ScriptedConnector { metas: vec![header] });

    let outcome = new_session(3, CancelToken::new(), fixed_version(1))
        .run(connector, Arc::new(MemoryPartitionStore::new()), SEGMENT_CAP)
        .await;

    assert_eq!(outcome.status, SessionStatus::Failed, "expected session to fail, got {:?}", outcome.status);
    assert!(matches!(outcome.error, Some(GridError::Protocol(_))), "expected a protocol error, got {:?}", outcome.error);
    assert!(outcome.units.is_empty(), "expected the malformed unit to not be registered");
    Ok(())
}
