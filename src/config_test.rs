use anyhow::Result;

use crate::config::*;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter::<_, Config>(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NODE_ID".into(), "node-a".into()),
        ("SERVER_PORT".into(), "7100".into()),
        ("PEERS".into(), "node-b=127.0.0.1:7101, node-c=127.0.0.1:7102".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/tessera/data".into()),
        ("PARTITIONS".into(), "256".into()),
        ("BACKUPS".into(), "2".into()),
        ("TRANSFER_CHUNK_SIZE".into(), "65536".into()),
        ("TRANSFER_MAX_RETRIES".into(), "5".into()),
        ("TRANSFER_RETRY_BACKOFF_MS".into(), "100".into()),
        ("BASELINE_AUTO_ADJUST_ENABLED".into(), "true".into()),
        ("BASELINE_AUTO_ADJUST_TIMEOUT_MS".into(), "5000".into()),
        ("ACTIVATE_ON_START".into(), "true".into()),
    ])?
    .validated()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.node_id == "node-a", "unexpected value parsed for NODE_ID, got {}, expected {}", config.node_id, "node-a");
    assert!(config.server_port == 7100, "unexpected value parsed for SERVER_PORT, got {}, expected {}", config.server_port, 7100);
    assert_eq!(config.peer_addrs.len(), 2, "unexpected number of peers derived from PEERS, got {:?}", config.peer_addrs);
    assert_eq!(
        config.peer_addrs.get("node-c").map(|addr| addr.to_string()),
        Some("127.0.0.1:7102".to_string()),
        "unexpected address derived for peer node-c, got {:?}",
        config.peer_addrs.get("node-c"),
    );
    assert!(
        config.storage_data_path == "/usr/local/tessera/data",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/usr/local/tessera/data"
    );
    assert!(config.partitions == 256, "unexpected value parsed for PARTITIONS, got {}, expected {}", config.partitions, 256);
    assert!(config.backups == 2, "unexpected value parsed for BACKUPS, got {}, expected {}", config.backups, 2);
    assert!(
        config.transfer_chunk_size == 65536,
        "unexpected value parsed for TRANSFER_CHUNK_SIZE, got {}, expected {}",
        config.transfer_chunk_size,
        65536
    );
    assert!(
        config.transfer_max_retries == 5,
        "unexpected value parsed for TRANSFER_MAX_RETRIES, got {}, expected {}",
        config.transfer_max_retries,
        5
    );
    assert!(
        config.transfer_retry_backoff_ms == 100,
        "unexpected value parsed for TRANSFER_RETRY_BACKOFF_MS, got {}, expected {}",
        config.transfer_retry_backoff_ms,
        100
    );
    assert!(config.baseline_auto_adjust_enabled, "expected BASELINE_AUTO_ADJUST_ENABLED to be parsed as true");
    assert!(
        config.baseline_auto_adjust_timeout_ms == 5000,
        "unexpected value parsed for BASELINE_AUTO_ADJUST_TIMEOUT_MS, got {}, expected {}",
        config.baseline_auto_adjust_timeout_ms,
        5000
    );
    assert!(config.activate_on_start, "expected ACTIVATE_ON_START to be parsed as true");

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter::<_, Config>(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NODE_ID".into(), "node-a".into()),
        ("SERVER_PORT".into(), "7100".into()),
    ])?
    .validated()?;

    assert!(config.peer_addrs.is_empty(), "expected no peers to be derived, got {:?}", config.peer_addrs);
    assert!(
        config.storage_data_path == crate::database::DEFAULT_DATA_PATH,
        "unexpected default for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        crate::database::DEFAULT_DATA_PATH
    );
    assert!(config.partitions == DEFAULT_PARTITIONS, "unexpected default for PARTITIONS, got {}", config.partitions);
    assert!(config.backups == DEFAULT_BACKUPS, "unexpected default for BACKUPS, got {}", config.backups);
    assert!(
        config.transfer_chunk_size == DEFAULT_TRANSFER_CHUNK_SIZE,
        "unexpected default for TRANSFER_CHUNK_SIZE, got {}",
        config.transfer_chunk_size
    );
    assert!(
        config.transfer_max_retries == DEFAULT_TRANSFER_MAX_RETRIES,
        "unexpected default for TRANSFER_MAX_RETRIES, got {}",
        config.transfer_max_retries
    );
    assert!(!config.baseline_auto_adjust_enabled, "expected auto-adjust to be disabled by default");
    assert!(!config.activate_on_start, "expected ACTIVATE_ON_START to default to false");

    Ok(())
}

#[test]
fn config_rejects_malformed_peers() {
    let res = Config::parse_peers("node-b=127.0.0.1:7101,node-c");
    assert!(res.is_err(), "expected malformed peer entry to be rejected, got {:?}", res);

    let res = Config::parse_peers("node-b=not-an-address");
    assert!(res.is_err(), "expected invalid peer address to be rejected, got {:?}", res);
}

#[test]
fn config_rejects_zero_chunk_size() -> Result<()> {
    let res = envy::from_iter::<_, Config>(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NODE_ID".into(), "node-a".into()),
        ("SERVER_PORT".into(), "7100".into()),
        ("TRANSFER_CHUNK_SIZE".into(), "0".into()),
    ])?
    .validated();

    assert!(res.is_err(), "expected a zero chunk size to be rejected");
    Ok(())
}
