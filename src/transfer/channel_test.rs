use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::error::GridError;
use crate::fixtures;
use crate::models::TransmissionMeta;
use crate::transfer::channel::TransferChannel;
use crate::transfer::meta::write_frame;
use crate::transfer::target::{MemoryRegion, MemoryTarget};
use crate::transfer::unit::ChunkIoUnit;

fn unit_over(region: &MemoryRegion, count: u64) -> ChunkIoUnit {
    ChunkIoUnit::new(region.name(), 0, count, Box::new(MemoryTarget::new(region.clone())))
}

#[tokio::test]
async fn channel_moves_unit_in_bounded_segments() -> Result<()> {
    let data = fixtures::random_bytes(10_000);
    let source_region = MemoryRegion::with_data("part-0", data.clone());
    let dest_region = MemoryRegion::new("part-0");
    let (client, server) = tokio::io::duplex(1024);
    let mut sender = TransferChannel::new(client, 1000);
    let mut receiver = TransferChannel::new(server, 1000);

    let send = tokio::spawn(async move {
        let mut unit = unit_over(&source_region, 10_000);
        sender.send_unit(&mut unit, &|| false).await?;
        sender.write_meta(&TransmissionMeta::exit_marker()).await?;
        Ok::<_, GridError>(unit.transferred())
    });
    let mut dest = unit_over(&dest_region, 10_000);
    let header = receiver.read_meta().await?;
    receiver.receive_unit(&mut dest, &header, &|| false).await?;
    let exit = receiver.read_meta().await?;
    let sent = send.await??;

    assert!(header.initial && header.offset == 0 && header.count == 10_000, "unexpected header {:?}", header);
    assert!(exit.exit, "expected exit marker after the unit, got {:?}", exit);
    assert_eq!(sent, 10_000, "expected all bytes to be sent, got {}", sent);
    assert!(dest_region.to_vec()? == data, "expected received bytes to equal the source bytes");
    Ok(())
}

#[tokio::test]
async fn channel_stops_at_segment_boundary_when_cancelled() -> Result<()> {
    let source_region = MemoryRegion::with_data("part-1", fixtures::random_bytes(8192));
    let (client, _server) = tokio::io::duplex(64 * 1024);
    let mut sender = TransferChannel::new(client, 1024);
    let mut unit = unit_over(&source_region, 8192);
    let checks = Arc::new(AtomicUsize::new(0));
    let stop_checks = checks.clone();
    let stop = move || stop_checks.fetch_add(1, Ordering::SeqCst) >= 3;

    let res = sender.send_unit(&mut unit, &stop).await;

    assert!(matches!(res, Err(GridError::Cancelled)), "expected a cancelled error, got {:?}", res);
    assert_eq!(unit.transferred(), 3 * 1024, "expected exactly 3 segments before stopping, got {}", unit.transferred());
    assert_eq!(checks.load(Ordering::SeqCst), 4, "expected the stop check at every segment boundary");
    Ok(())
}

#[tokio::test]
async fn channel_end_before_unit_is_loaded_is_an_io_error() -> Result<()> {
    let dest_region = MemoryRegion::new("part-2");
    let mut dest = unit_over(&dest_region, 100);
    let (mut client, server) = tokio::io::duplex(1024);
    let mut receiver = TransferChannel::new(server, 1024);

    write_frame(&mut client, &dest.header()).await?;
    tokio::io::AsyncWriteExt::write_all(&mut client, &[1u8; 60]).await?;
    drop(client);
    let header = receiver.read_meta().await?;
    let res = receiver.receive_unit(&mut dest, &header, &|| false).await;

    assert!(
        matches!(&res, Err(GridError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof),
        "expected an unexpected EOF error, got {:?}",
        res
    );
    assert_eq!(dest.transferred(), 60, "expected received bytes to be kept, got {}", dest.transferred());
    Ok(())
}

#[tokio::test]
async fn channel_rejects_header_for_another_unit() -> Result<()> {
    let mut dest = unit_over(&MemoryRegion::new("part-3"), 10);
    let (_client, server) = tokio::io::duplex(1024);
    let mut receiver = TransferChannel::new(server, 1024);
    let mut header = dest.header();
    header.name = "part-4".into();

    let res = receiver.receive_unit(&mut dest, &header, &|| false).await;

    assert!(matches!(res, Err(GridError::Protocol(_))), "expected a protocol error, got {:?}", res);
    Ok(())
}
