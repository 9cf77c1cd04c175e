use anyhow::Result;

use crate::cluster::baseline::{AutoAdjustSettings, BaselineTopology};
use crate::cluster::gate::ClusterGate;
use crate::cluster::state::ClusterState;
use crate::config::Config;
use crate::database::Database;
use crate::error::GridError;
use crate::fixtures;

#[tokio::test]
async fn fresh_gate_is_inactive_with_initial_baseline() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::test_gate("node-a").await?;

    let snapshot = gate.snapshot();

    assert_eq!(snapshot.state, ClusterState::Inactive, "expected fresh cluster to be inactive, got {}", snapshot.state);
    assert_eq!(*snapshot.baseline, BaselineTopology::initial(), "expected the initial baseline, got {:?}", snapshot.baseline);
    assert!(matches!(gate.ensure_read(), Err(GridError::Activation(_))), "expected reads to be rejected");
    assert!(matches!(gate.ensure_write(), Err(GridError::Activation(_))), "expected writes to be rejected");
    Ok(())
}

#[tokio::test]
async fn set_baseline_requires_active_cluster() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::test_gate("node-a").await?;

    let res = gate.set_baseline(fixtures::nodes(&["node-a"])).await;

    assert!(matches!(res, Err(GridError::Activation(_))), "expected an activation error, got {:?}", res);
    assert_eq!(gate.baseline().version, 0, "expected baseline to be unchanged");
    Ok(())
}

#[tokio::test]
async fn first_activation_installs_live_nodes_as_baseline() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::test_gate("node-a").await?;
    let mut snapshots = gate.subscribe();

    gate.set_state(ClusterState::Active, &fixtures::nodes(&["node-a", "node-b"])).await?;

    let published = snapshots.borrow_and_update().clone();
    assert_eq!(published.state, ClusterState::Active, "expected an active snapshot to be published");
    assert_eq!(published.baseline.version, 1, "expected baseline version 1, got {}", published.baseline.version);
    assert_eq!(published.baseline.nodes, fixtures::nodes(&["node-a", "node-b"]), "unexpected baseline nodes");
    gate.ensure_read()?;
    gate.ensure_write()?;
    Ok(())
}

#[tokio::test]
async fn activation_without_live_nodes_keeps_initial_baseline() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::test_gate("node-a").await?;

    let snapshot = gate.set_state(ClusterState::Active, &Default::default()).await?;

    assert_eq!(snapshot.state, ClusterState::Active, "expected the cluster to be active, got {}", snapshot.state);
    assert!(snapshot.baseline.is_initial(), "expected the initial baseline to be kept, got {:?}", snapshot.baseline);
    let baseline = gate.set_baseline(fixtures::nodes(&["node-a"])).await?;
    assert_eq!(baseline.version, 1, "expected the first explicit baseline to be version 1, got {}", baseline.version);
    Ok(())
}

#[tokio::test]
async fn read_only_state_gates_writes() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::active_gate("node-a", &["node-a"]).await?;

    gate.set_state(ClusterState::ActiveReadOnly, &fixtures::nodes(&["node-a"])).await?;

    gate.ensure_read()?;
    assert!(matches!(gate.ensure_write(), Err(GridError::Activation(_))), "expected writes to be rejected");
    assert_eq!(gate.baseline().version, 1, "expected the baseline to be kept across state changes");
    Ok(())
}

#[tokio::test]
async fn requesting_current_state_is_a_noop() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::active_gate("node-a", &["node-a"]).await?;
    let mut snapshots = gate.subscribe();
    snapshots.borrow_and_update();

    gate.set_state(ClusterState::Active, &fixtures::nodes(&["node-a", "node-b"])).await?;

    assert!(!snapshots.has_changed()?, "expected no snapshot to be published");
    assert_eq!(gate.baseline().nodes, fixtures::nodes(&["node-a"]), "expected the baseline to be unchanged");
    Ok(())
}

#[tokio::test]
async fn baseline_versions_are_strictly_increasing() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::active_gate("node-a", &["node-a"]).await?;

    let mut last = gate.baseline().version;
    for ids in [&["node-a", "node-b"][..], &["node-a"][..], &["node-a"][..], &["node-a", "node-c"][..]] {
        let baseline = gate.set_baseline(fixtures::nodes(ids)).await?;
        assert!(baseline.version > last, "expected version {} to be greater than {}", baseline.version, last);
        last = baseline.version;
    }
    assert_eq!(last, 5, "expected 4 changes after version 1, got {}", last);
    Ok(())
}

#[tokio::test]
async fn empty_baseline_is_accepted_with_next_version() -> Result<()> {
    let (gate, _db, _tmpdir) = fixtures::active_gate("node-a", &["node-a"]).await?;
    let before = gate.baseline().version;

    let baseline = gate.set_baseline(Default::default()).await?;

    assert!(baseline.nodes.is_empty(), "expected an empty baseline, got {:?}", baseline.nodes);
    assert_eq!(baseline.version, before + 1, "expected version {}, got {}", before + 1, baseline.version);
    assert_eq!(gate.baseline(), baseline, "expected the empty baseline to be current");
    let next = gate.set_baseline(fixtures::nodes(&["node-a"])).await?;
    assert_eq!(next.version, before + 2, "expected versions to keep increasing, got {}", next.version);
    Ok(())
}

#[tokio::test]
async fn cluster_state_is_recovered_from_metastore() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let gate = ClusterGate::new(&config, &db).await?;
    gate.set_state(ClusterState::Active, &fixtures::nodes(&["node-a", "node-b"])).await?;
    let expected = gate.set_baseline(fixtures::nodes(&["node-a", "node-b", "node-c"])).await?;
    gate.set_state(ClusterState::ActiveReadOnly, &fixtures::nodes(&["node-a"])).await?;
    let settings = AutoAdjustSettings {
        enabled: true,
        timeout_ms: 5000,
    };
    gate.set_auto_adjust(settings).await?;
    drop(gate);

    let recovered = ClusterGate::new(&config, &db).await?;

    assert_eq!(recovered.state(), ClusterState::ActiveReadOnly, "unexpected recovered state {}", recovered.state());
    assert_eq!(*recovered.baseline(), *expected, "unexpected recovered baseline {:?}", recovered.baseline());
    assert_eq!(recovered.auto_adjust(), settings, "unexpected recovered auto-adjust settings {:?}", recovered.auto_adjust());
    Ok(())
}

#[tokio::test]
async fn auto_adjust_defaults_come_from_config() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let mut config = (*config).clone();
    config.baseline_auto_adjust_enabled = true;
    config.baseline_auto_adjust_timeout_ms = 1234;
    let db = Database::new(std::sync::Arc::new(config.clone())).await?;

    let gate = ClusterGate::new(&config, &db).await?;

    let expected = AutoAdjustSettings {
        enabled: true,
        timeout_ms: 1234,
    };
    assert_eq!(gate.auto_adjust(), expected, "unexpected default auto-adjust settings {:?}", gate.auto_adjust());
    Ok(())
}
