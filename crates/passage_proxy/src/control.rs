//! Control-channel server for the migration service.
//!
//! Each connection carries a stream of JSON updates (see
//! [`passage_updates`]); the handler decodes them, routes them onto the
//! lifecycle controller's channels, and echoes the exact bytes of every
//! decoded message back as the acknowledgement. Any decode failure is
//! terminal for that connection only.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use passage_updates::{MigrationStatus, Table, Update, UpdateDecoder, UpdateKind};

/// Senders feeding the lifecycle controller.
pub(crate) struct ControlChannels {
    pub start: mpsc::Sender<MigrationStatus>,
    pub table_updated: mpsc::Sender<Table>,
    pub complete: mpsc::Sender<()>,
    pub shutdown: mpsc::Sender<()>,
}

/// Handle one control connection until it closes or fails to decode.
pub(crate) async fn handle_control_conn(
    mut stream: TcpStream,
    channels: &ControlChannels,
) -> anyhow::Result<()> {
    let mut decoder = UpdateDecoder::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("read control connection")?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&chunk[..n])?;
        while let Some((update, raw)) = decoder.next_update()? {
            tracing::debug!(id = %update.id, kind = %update.kind, "control update received");
            dispatch(&update, channels).await?;
            stream
                .write_all(&raw)
                .await
                .context("write control acknowledgement")?;
        }
    }
}

/// Route one update onto the controller's channels.
async fn dispatch(update: &Update, channels: &ControlChannels) -> anyhow::Result<()> {
    match update.kind {
        UpdateKind::Start => {
            let status: MigrationStatus =
                serde_json::from_slice(&update.data).context("decode migration status")?;
            let _ = channels.start.send(status).await;
        }
        UpdateKind::TableUpdate => {
            let table: Table =
                serde_json::from_slice(&update.data).context("decode table update")?;
            let _ = channels.table_updated.send(table).await;
        }
        UpdateKind::Complete => {
            // A status snapshot may ride along; only receipt matters.
            let _ = channels.complete.send(()).await;
        }
        UpdateKind::Shutdown => {
            let _ = channels.shutdown.send(()).await;
        }
    }
    Ok(())
}
