//! Shared helpers for proxy integration tests.
//!
//! Tests drive an embedded proxy between two in-process fake databases and
//! speak raw native-protocol frames on the client side and raw control
//! updates on the migration side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Instant};

use passage_proxy::{start_proxy, ProxyConfig, ProxyHandle};
use passage_updates::{send_update, MigrationStatus, Step, Table, Update};

/// Upper bound for every polling wait in the tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process stand-in for a database cluster: accepts connections and
/// records every byte it receives, with a way to push reply bytes back.
pub struct FakeDb {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
    replies: Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    accepted: Arc<AtomicUsize>,
}

impl FakeDb {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let received_for_accept = received.clone();
        let replies_for_accept = replies.clone();
        let accepted_for_accept = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted_for_accept.fetch_add(1, Ordering::SeqCst);
                let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
                replies_for_accept.lock().await.push(reply_tx);

                let received = received_for_accept.clone();
                let (mut read_half, mut write_half) = stream.into_split();
                tokio::spawn(async move {
                    let mut chunk = [0u8; 16 * 1024];
                    loop {
                        match read_half.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => received.lock().await.extend_from_slice(&chunk[..n]),
                        }
                    }
                });
                tokio::spawn(async move {
                    while let Some(bytes) = reply_rx.recv().await {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            received,
            replies,
            accepted,
        })
    }

    /// Everything received so far, across all connections.
    pub async fn received(&self) -> Vec<u8> {
        self.received.lock().await.clone()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Push bytes back on the most recently accepted connection.
    pub async fn reply_on_latest(&self, bytes: Vec<u8>) -> Result<()> {
        let replies = self.replies.lock().await;
        let tx = replies.last().context("no connection to reply on")?;
        tx.send(bytes).ok();
        Ok(())
    }

    /// Wait until the received stream contains `needle`.
    pub async fn wait_for_bytes(&self, needle: &[u8]) -> bool {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while Instant::now() < deadline {
            if contains(&self.received().await, needle) {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Poll `condition` until it holds or the shared deadline passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

// --- native-protocol frame builders ------------------------------------

pub fn long_string(text: &str) -> Vec<u8> {
    let mut out = (text.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(text.as_bytes());
    out
}

pub fn short_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = (bytes.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(bytes);
    out
}

pub fn frame_bytes(version: u8, flags: u8, stream: u16, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![version, flags];
    frame.extend_from_slice(&stream.to_be_bytes());
    frame.push(opcode);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

pub fn query_frame(stream: u16, statement: &str) -> Vec<u8> {
    frame_bytes(0x04, 0x00, stream, 0x07, &long_string(statement))
}

pub fn prepare_frame(stream: u16, statement: &str) -> Vec<u8> {
    frame_bytes(0x04, 0x00, stream, 0x09, &long_string(statement))
}

pub fn execute_frame(stream: u16, prepared_id: &[u8]) -> Vec<u8> {
    let mut body = short_bytes(prepared_id);
    // Consistency level rides along after the id; the proxy ignores it.
    body.extend_from_slice(&1u16.to_be_bytes());
    frame_bytes(0x04, 0x00, stream, 0x0A, &body)
}

/// RESULT/Prepared reply carrying `prepared_id` for the given stream.
pub fn prepared_result_frame(stream: u16, prepared_id: &[u8]) -> Vec<u8> {
    let mut body = 4i32.to_be_bytes().to_vec();
    body.extend_from_slice(&short_bytes(prepared_id));
    frame_bytes(0x84, 0x00, stream, 0x08, &body)
}

/// Read one complete frame off a client connection.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).await?;
    let body_len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(9 + body_len, 0);
    stream.read_exact(&mut frame[9..]).await?;
    Ok(frame)
}

// --- proxy harness ------------------------------------------------------

pub struct Harness {
    pub origin: FakeDb,
    pub target: FakeDb,
    pub proxy: ProxyHandle,
}

impl Harness {
    /// Proxy in the migrating phase, between two fresh fake databases.
    pub async fn start() -> Result<Self> {
        Self::start_with(false).await
    }

    /// Proxy started with the migration already complete.
    pub async fn start_completed() -> Result<Self> {
        Self::start_with(true).await
    }

    async fn start_with(migration_complete: bool) -> Result<Self> {
        let origin = FakeDb::start().await?;
        let target = FakeDb::start().await?;
        let proxy = start_proxy(ProxyConfig {
            listen_client: "127.0.0.1:0".parse()?,
            listen_control: "127.0.0.1:0".parse()?,
            origin: origin.addr,
            target: target.addr,
            migration_complete,
        })
        .await?;
        Ok(Self {
            origin,
            target,
            proxy,
        })
    }

    pub async fn connect_client(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.proxy.client_addr()).await?)
    }

    /// Deliver one control update and return its acknowledgement.
    pub async fn send_control(&self, update: &Update) -> Result<Update> {
        let mut stream = TcpStream::connect(self.proxy.control_addr()).await?;
        send_update(&mut stream, update).await
    }

    /// Send the Start update and wait for the proxy to become ready.
    pub async fn begin_migration(&self, status: &MigrationStatus) -> Result<()> {
        self.send_control(&Update::start(status)?).await?;
        timeout(WAIT_TIMEOUT, self.proxy.wait_ready())
            .await
            .context("proxy did not become ready")?;
        Ok(())
    }
}

pub fn single_table_status(keyspace: &str, table: &str, step: Step) -> MigrationStatus {
    MigrationStatus::from_tables([Table::new(keyspace, table, step)])
}
