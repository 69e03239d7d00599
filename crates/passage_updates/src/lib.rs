//! Control-channel protocol shared by the proxy and the migration service.
//!
//! Each message on the wire is a single JSON object with no length prefix:
//! `{"ID": "<uuid>", "Type": <int>, "Data": "<base64>"}`. One socket write
//! carries one message, but reads may split or coalesce them, so receivers
//! reassemble with [`UpdateDecoder`]. The receiver acknowledges a message by
//! echoing its exact bytes back to the sender.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Hard cap on buffered bytes for one in-flight control message.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Migration progress for a single table, ordered from untouched to done.
///
/// The proxy itself only branches on [`Step::LoadingDataComplete`]; the rest
/// of the ladder belongs to the migration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    Waiting,
    MigratingSchema,
    WaitingToUnload,
    UnloadingData,
    WaitingToLoad,
    LoadingData,
    LoadingDataComplete,
    Errored,
}

/// One table tracked by the migration service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Table {
    pub keyspace: String,
    pub name: String,
    pub step: Step,
}

impl Table {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>, step: Step) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            step,
        }
    }
}

/// Full snapshot of migration progress, keyed keyspace then table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MigrationStatus {
    pub tables: HashMap<String, HashMap<String, Table>>,
}

impl MigrationStatus {
    /// Build a status from a flat list of tables.
    pub fn from_tables(tables: impl IntoIterator<Item = Table>) -> Self {
        let mut status = Self::default();
        for table in tables {
            status
                .tables
                .entry(table.keyspace.clone())
                .or_default()
                .insert(table.name.clone(), table);
        }
        status
    }
}

/// Kind of control update, carried as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum UpdateKind {
    Start,
    TableUpdate,
    Complete,
    Shutdown,
}

impl From<UpdateKind> for u8 {
    fn from(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::Start => 0,
            UpdateKind::TableUpdate => 1,
            UpdateKind::Complete => 2,
            UpdateKind::Shutdown => 3,
        }
    }
}

impl TryFrom<u8> for UpdateKind {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Start),
            1 => Ok(Self::TableUpdate),
            2 => Ok(Self::Complete),
            3 => Ok(Self::Shutdown),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// Envelope for one control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub kind: UpdateKind,
    #[serde(rename = "Data", with = "base64_bytes", default)]
    pub data: Vec<u8>,
}

impl Update {
    /// New update with a fresh id.
    pub fn new(kind: UpdateKind, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            data,
        }
    }

    /// Start update carrying the full migration status.
    pub fn start(status: &MigrationStatus) -> serde_json::Result<Self> {
        Ok(Self::new(UpdateKind::Start, serde_json::to_vec(status)?))
    }

    /// Per-table progress update.
    pub fn table_update(table: &Table) -> serde_json::Result<Self> {
        Ok(Self::new(UpdateKind::TableUpdate, serde_json::to_vec(table)?))
    }

    /// Migration-complete update. The payload is optional and ignored by the
    /// proxy, which only observes receipt.
    pub fn complete() -> Self {
        Self::new(UpdateKind::Complete, Vec::new())
    }

    pub fn shutdown() -> Self {
        Self::new(UpdateKind::Shutdown, Vec::new())
    }

    /// Wire bytes for this update.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Errors surfaced while decoding the control byte stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("control message exceeds {MAX_MESSAGE_LEN} buffered bytes")]
    MessageTooLarge,
    #[error("unknown update type {0}")]
    UnknownKind(u8),
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdateKind::Start => "start",
            UpdateKind::TableUpdate => "table-update",
            UpdateKind::Complete => "complete",
            UpdateKind::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Reassembles [`Update`] messages from an un-prefixed TCP byte stream.
///
/// Buffers input until a full JSON object parses, then hands back the update
/// together with the exact consumed bytes so the caller can echo them as the
/// acknowledgement.
#[derive(Default)]
pub struct UpdateDecoder {
    buf: BytesMut,
}

impl UpdateDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer another chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        if self.buf.len() + chunk.len() > MAX_MESSAGE_LEN {
            return Err(DecodeError::MessageTooLarge);
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Next complete update plus its raw bytes, or `None` until more input
    /// arrives.
    pub fn next_update(&mut self) -> Result<Option<(Update, Bytes)>, DecodeError> {
        let (update, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Update>();
            match stream.next() {
                None => return Ok(None),
                Some(Err(err)) if err.is_eof() => return Ok(None),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(update)) => (update, stream.byte_offset()),
            }
        };
        let raw = self.buf.split_to(consumed).freeze();
        Ok(Some((update, raw)))
    }
}

/// Send one update and wait for the echoed acknowledgement.
pub async fn send_update(stream: &mut TcpStream, update: &Update) -> anyhow::Result<Update> {
    let payload = update.to_bytes()?;
    stream.write_all(&payload).await?;

    let mut decoder = UpdateDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("control connection closed before acknowledgement");
        }
        decoder.extend(&chunk[..n])?;
        if let Some((ack, _)) = decoder.next_update()? {
            anyhow::ensure!(
                ack.id == update.id,
                "acknowledgement id mismatch: sent {}, got {}",
                update.id,
                ack.id
            );
            return Ok(ack);
        }
    }
}
