//! Control-channel wire behavior: acknowledgement echoes, reassembly of
//! split writes, and terminal handling of malformed input.

mod common;

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use common::{single_table_status, Harness, WAIT_TIMEOUT};
use passage_updates::{Step, Update, UpdateDecoder};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn updates_are_acknowledged_with_their_own_bytes() -> Result<()> {
    let harness = Harness::start().await?;

    let update = Update::start(&single_table_status("ks1", "t1", Step::Waiting))?;
    let ack = harness.send_control(&update).await?;
    assert_eq!(ack, update);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn an_update_split_across_writes_is_reassembled() -> Result<()> {
    let harness = Harness::start().await?;

    let update = Update::start(&single_table_status("ks1", "t1", Step::Waiting))?;
    let payload = update.to_bytes()?;
    let (head, tail) = payload.split_at(payload.len() / 2);

    let mut stream = TcpStream::connect(harness.proxy.control_addr()).await?;
    stream.write_all(head).await?;
    stream.flush().await?;
    sleep(Duration::from_millis(50)).await;
    stream.write_all(tail).await?;

    // The acknowledgement must be the exact bytes that were sent.
    let mut decoder = UpdateDecoder::new();
    let mut chunk = [0u8; 4096];
    let ack = timeout(WAIT_TIMEOUT, async {
        loop {
            let n = stream.read(&mut chunk).await?;
            anyhow::ensure!(n > 0, "control connection closed before acknowledgement");
            decoder.extend(&chunk[..n])?;
            if let Some((ack, raw)) = decoder.next_update()? {
                anyhow::ensure!(raw.as_ref() == payload.as_slice(), "echo differs from input");
                return Ok::<_, anyhow::Error>(ack);
            }
        }
    })
    .await??;
    assert_eq!(ack, update);

    timeout(WAIT_TIMEOUT, harness.proxy.wait_ready()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_input_closes_the_control_connection() -> Result<()> {
    let harness = Harness::start().await?;

    let mut stream = TcpStream::connect(harness.proxy.control_addr()).await?;
    stream.write_all(b"this is not json").await?;

    let mut buf = [0u8; 64];
    let n = timeout(WAIT_TIMEOUT, stream.read(&mut buf)).await??;
    assert_eq!(n, 0, "connection must be closed without an acknowledgement");

    // The proxy itself survives: a fresh connection still works.
    let ack = harness.send_control(&Update::complete()).await?;
    assert_eq!(ack.kind, passage_updates::UpdateKind::Complete);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_table_update_before_start_is_dropped_not_fatal() -> Result<()> {
    let harness = Harness::start().await?;

    let early = Update::table_update(&passage_updates::Table::new(
        "ks1",
        "t1",
        Step::LoadingDataComplete,
    ))?;
    harness.send_control(&early).await?;

    // Start still works afterwards and the dropped update left no queue.
    harness
        .begin_migration(&single_table_status("ks1", "t1", Step::Waiting))
        .await?;
    assert_eq!(harness.proxy.queue_depth("ks1", "t1"), Some(0));
    Ok(())
}
