//! Mirror execution against the target cluster.
//!
//! All table workers funnel into one long-lived target connection. The write
//! half sits behind an async mutex so concurrent workers never interleave
//! the bytes of two frames; per-table ordering comes from each table's FIFO
//! queue and single worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::metrics::ProxyMetrics;
use crate::queue::TableQueue;

/// Attempts per mirrored query before it is dropped.
pub const WRITE_ATTEMPTS: u32 = 5;
/// Delay between attempts.
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Operation kinds the mirror path distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Use,
    Insert,
    Update,
    Delete,
    Truncate,
    Prepare,
    Misc,
}

impl QueryKind {
    /// Operations that must wait for a table's bulk load before touching it.
    /// Inserts are exempt: the bulk copy is idempotent per primary key, so a
    /// live insert that lands early is simply overwritten by a later one.
    pub fn pauses_loading_table(self) -> bool {
        matches!(self, Self::Update | Self::Delete | Self::Truncate)
    }
}

/// One query waiting to be replayed against the target.
#[derive(Debug, Clone)]
pub struct MirrorQuery {
    pub keyspace: String,
    pub table: String,
    pub kind: QueryKind,
    pub frame: Bytes,
}

/// The single shared connection to the target cluster.
pub struct TargetSession {
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TargetSession {
    /// Dial the target once at startup. Failure here is fatal to the proxy.
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("dial target {addr}"))?;
        let (mut read_half, writer) = stream.into_split();

        // Replies are not correlated with mirrored requests; drain them so
        // the connection never stalls on a full receive window.
        tokio::spawn(async move {
            let mut sink = [0u8; 16 * 1024];
            loop {
                match read_half.read(&mut sink).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(error = %err, "target connection read failed");
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            peer: addr,
        }))
    }

    /// Write one frame. The lock keeps frames from different workers whole.
    async fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await
    }

    /// Replay one request against the target with bounded retry.
    pub async fn execute(&self, frame: &[u8]) -> anyhow::Result<()> {
        for attempt in 1..WRITE_ATTEMPTS {
            match self.write_frame(frame).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(attempt, error = %err, target = %self.peer, "mirror write failed, retrying");
                }
            }
            tokio::time::sleep(WRITE_RETRY_DELAY).await;
        }
        self.write_frame(frame).await.with_context(|| {
            format!(
                "mirror write to {} failed after {WRITE_ATTEMPTS} attempts",
                self.peer
            )
        })
    }
}

/// Drain one table's queue into the target connection.
///
/// Takes the table's gate around every query; a paused table parks the
/// worker here, between queries, until the controller resumes it.
pub async fn run_table_worker(
    queue: Arc<TableQueue>,
    mut rx: mpsc::Receiver<MirrorQuery>,
    target: Arc<TargetSession>,
    metrics: Arc<ProxyMetrics>,
) {
    while let Some(query) = rx.recv().await {
        let _gate = queue.gate().await;
        match target.execute(&query.frame).await {
            Ok(()) => metrics.record_write(),
            Err(err) => {
                tracing::warn!(
                    keyspace = %query.keyspace,
                    table = %query.table,
                    kind = ?query.kind,
                    error = %err,
                    "dropping mirrored query"
                );
                metrics.record_write_fail();
            }
        }
        queue.mark_done();
    }
}
