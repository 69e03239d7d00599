//! Proxy composition root.
//!
//! Owns the pieces and wires them together: the client listener with its
//! per-connection forwarders, the mirror dispatch feeding per-table queues,
//! the control listener, and the lifecycle controller that applies
//! Start / TableUpdate / Complete / Shutdown. Also exposes the embeddable
//! run API (`run`, `run_with_shutdown`, `start_proxy`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use passage_updates::{MigrationStatus, Step, Table};

use crate::classify::{self, ClassifyError, PreparedQueries, UNKNOWN_PREPARED_PATH};
use crate::control::{self, ControlChannels};
use crate::frame::{self, FrameAccumulator};
use crate::metrics::{MetricsSnapshot, ProxyMetrics};
use crate::mirror::{self, MirrorQuery, QueryKind, TargetSession};
use crate::queue::MirrorQueues;
use crate::registry::TableRegistry;

/// Capacity of the lifecycle controller's input channels.
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Runtime configuration for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Client-facing data port.
    pub listen_client: SocketAddr,
    /// Port the migration service sends control updates to.
    pub listen_control: SocketAddr,
    /// Origin cluster address clients believe they are talking to.
    pub origin: SocketAddr,
    /// Target cluster address receiving mirrored writes.
    pub target: SocketAddr,
    /// Treat the migration as already finished: skip mirroring entirely and
    /// send every new connection straight to the target.
    pub migration_complete: bool,
}

/// Why a forwarded frame was not mirrored.
#[derive(Debug, thiserror::Error)]
enum MirrorError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error("no operation classified for request")]
    EmptyClassification,
    #[error("keyspace {0} is not tracked by the migration")]
    UnknownKeyspace(String),
    #[error("table {keyspace}.{table} is not tracked by the migration")]
    UnknownTable { keyspace: String, table: String },
    #[error(transparent)]
    Execute(anyhow::Error),
}

/// Which inspection a forwarder applies to the frames it copies.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ForwardLeg {
    /// Client requests bound for the origin: full mirror pipeline.
    ClientToOrigin,
    /// Origin replies bound for the client: prepared-id observation only.
    OriginToClient,
    /// Target-bound traffic after completion: no inspection at all.
    Passthrough,
}

/// State shared by every task of one proxy instance.
struct ProxyShared {
    config: ProxyConfig,
    metrics: Arc<ProxyMetrics>,
    registry: TableRegistry,
    queues: MirrorQueues,
    prepared: PreparedQueries,
    target: Arc<TargetSession>,
    /// Session-default keyspace set by the last valid USE.
    keyspace: std::sync::Mutex<String>,
    migration_complete: AtomicBool,
    origin_connections: std::sync::Mutex<u32>,
    redirect_fired: AtomicBool,
    redirect_tx: watch::Sender<bool>,
    ready_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyShared {
    fn increment_origin(&self) {
        if let Ok(mut count) = self.origin_connections.lock() {
            *count += 1;
        }
    }

    /// Drop one origin connection; the last one after completion fires the
    /// one-shot redirect-ready signal.
    fn decrement_origin(&self) {
        let drained = match self.origin_connections.lock() {
            Ok(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0 && self.migration_complete.load(Ordering::SeqCst)
            }
            Err(_) => false,
        };
        if drained && !self.redirect_fired.swap(true, Ordering::SeqCst) {
            tracing::info!("no open origin connections remain; ready for redirect");
            let _ = self.redirect_tx.send(true);
        }
    }

    fn origin_connection_count(&self) -> u32 {
        self.origin_connections.lock().map(|count| *count).unwrap_or(0)
    }

    fn begin_shutdown(&self) {
        tracing::info!("proxy shutting down");
        let _ = self.shutdown_tx.send(true);
    }

    /// Mirror pipeline entry for one client→origin frame.
    async fn mirror_frame(&self, frame_bytes: &Bytes) -> Result<(), MirrorError> {
        if frame::is_reply(frame_bytes) {
            classify::observe_reply(&self.prepared, frame_bytes)?;
            return Ok(());
        }
        self.mirror_request(frame_bytes).await
    }

    async fn mirror_request(&self, frame_bytes: &Bytes) -> Result<(), MirrorError> {
        let paths = classify::classify_request(&self.prepared, frame_bytes)?;
        let Some(path) = paths.first() else {
            return Err(MirrorError::EmptyClassification);
        };
        if paths.len() > 1 {
            // Batched statements are classified but not replayed.
            tracing::debug!(statements = paths.len(), "skipping mirror for batch request");
            return Ok(());
        }
        if path == UNKNOWN_PREPARED_PATH {
            tracing::debug!("request references a prepared id never observed; mirror skipped");
            return Ok(());
        }

        let mut segments = path.splitn(4, '/').skip(1);
        let opcode = segments.next().unwrap_or_default();
        let action = segments.next();
        let table_ref = segments.next();

        let Some(action) = action else {
            // Single-segment path (/startup, /options, ...): replay as-is so
            // the target connection sees the same session setup.
            return self.execute_direct(frame_bytes, QueryKind::Misc).await;
        };
        if opcode == "prepare" {
            return self.execute_direct(frame_bytes, QueryKind::Prepare).await;
        }
        if opcode != "query" && opcode != "execute" {
            return Ok(());
        }
        match action {
            "use" => match table_ref {
                Some(raw_keyspace) => self.handle_use(frame_bytes, raw_keyspace).await,
                None => Ok(()),
            },
            "select" => {
                self.metrics.record_read();
                Ok(())
            }
            "insert" | "update" | "delete" | "truncate" => {
                let Some(table_ref) = table_ref else {
                    return Ok(());
                };
                let kind = match action {
                    "insert" => QueryKind::Insert,
                    "update" => QueryKind::Update,
                    "delete" => QueryKind::Delete,
                    _ => QueryKind::Truncate,
                };
                self.enqueue_write(frame_bytes, table_ref, kind).await
            }
            // DDL and anything else forwards without a mirror.
            _ => Ok(()),
        }
    }

    /// Track the session keyspace and replay the USE against the target.
    async fn handle_use(&self, frame_bytes: &Bytes, raw_keyspace: &str) -> Result<(), MirrorError> {
        let keyspace = classify::normalize_identifier(raw_keyspace.trim_end_matches(';'));
        if !self.registry.contains_keyspace(&keyspace) {
            return Err(MirrorError::UnknownKeyspace(keyspace));
        }
        if let Ok(mut current) = self.keyspace.lock() {
            *current = keyspace;
        }
        self.execute_direct(frame_bytes, QueryKind::Use).await
    }

    /// Replay a frame on the target connection without queueing it.
    async fn execute_direct(&self, frame_bytes: &Bytes, kind: QueryKind) -> Result<(), MirrorError> {
        tracing::trace!(kind = ?kind, "replaying query directly against the target");
        self.target
            .execute(frame_bytes)
            .await
            .map_err(MirrorError::Execute)
    }

    /// Queue a mutating query under its table, pausing a still-loading table
    /// on its first write-class operation.
    async fn enqueue_write(
        &self,
        frame_bytes: &Bytes,
        table_ref: &str,
        kind: QueryKind,
    ) -> Result<(), MirrorError> {
        let (keyspace, table) = classify::extract_table_info(table_ref);
        let keyspace = match keyspace {
            Some(keyspace) => keyspace,
            None => self
                .keyspace
                .lock()
                .map(|current| current.clone())
                .unwrap_or_default(),
        };

        let Some(step) = self.registry.step(&keyspace, &table) else {
            return Err(MirrorError::UnknownTable { keyspace, table });
        };
        let Some(queue) = self.queues.get(&keyspace, &table) else {
            return Err(MirrorError::UnknownTable { keyspace, table });
        };

        if kind.pauses_loading_table() && !queue.is_paused() && step != Step::LoadingDataComplete {
            queue.pause().await;
            tracing::debug!(%keyspace, %table, "paused mirror consumption until the table finishes loading");
        }

        queue
            .enqueue(MirrorQuery {
                keyspace,
                table,
                kind,
                frame: frame_bytes.clone(),
            })
            .await;
        Ok(())
    }
}

/// Copy frames from `src` to `dst`, feeding them to the mirror side channel
/// the leg calls for. Returns when either socket closes or errors.
async fn forward(
    shared: &Arc<ProxyShared>,
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    leg: ForwardLeg,
) -> anyhow::Result<()> {
    let mut frames = FrameAccumulator::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = src.read(&mut chunk).await.context("socket read")?;
        if n == 0 {
            return Ok(());
        }
        frames.extend(&chunk[..n]);
        while let Some(frame_bytes) = frames.next_frame()? {
            // Observe origin replies before the client can see them, so a
            // client acting on a prepared result finds the id registered.
            if leg == ForwardLeg::OriginToClient && frame::is_reply(&frame_bytes) {
                match classify::observe_reply(&shared.prepared, &frame_bytes) {
                    Ok(()) => {}
                    Err(ClassifyError::Compressed) => {
                        tracing::debug!("compressed reply; prepared-id tracking skipped");
                    }
                    Err(err) => {
                        shared.metrics.record_read_fail();
                        tracing::debug!(error = %err, "could not inspect origin reply");
                    }
                }
            }

            dst.write_all(&frame_bytes).await.context("socket write")?;
            shared.metrics.record_packet();

            if leg == ForwardLeg::ClientToOrigin {
                if let Err(err) = shared.mirror_frame(&frame_bytes).await {
                    match err {
                        MirrorError::Execute(err) => {
                            tracing::warn!(error = %err, "mirror execution failed")
                        }
                        err => tracing::debug!(error = %err, "frame not mirrored"),
                    }
                }
            }
        }
    }
}

/// Serve one client connection: dial the phase-appropriate upstream and run
/// both forwarding legs until either side closes.
async fn handle_client_conn(shared: Arc<ProxyShared>, client: TcpStream, peer: SocketAddr) {
    let origin_bound = !shared.migration_complete.load(Ordering::SeqCst);
    let upstream_addr = if origin_bound {
        shared.config.origin
    } else {
        shared.config.target
    };
    let upstream = match TcpStream::connect(upstream_addr).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(upstream = %upstream_addr, error = %err, "upstream dial failed; dropping client connection");
            return;
        }
    };
    if origin_bound {
        shared.increment_origin();
    }
    tracing::debug!(%peer, upstream = %upstream_addr, origin_bound, "client connection established");

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();
    let (request_leg, reply_leg) = if origin_bound {
        (ForwardLeg::ClientToOrigin, ForwardLeg::OriginToClient)
    } else {
        (ForwardLeg::Passthrough, ForwardLeg::Passthrough)
    };

    // Either leg finishing tears both down: the select drops the other
    // future, closing its socket halves with it.
    tokio::select! {
        result = forward(&shared, client_read, upstream_write, request_leg) => {
            log_forward_exit(peer, "client", result);
        }
        result = forward(&shared, upstream_read, client_write, reply_leg) => {
            log_forward_exit(peer, "upstream", result);
        }
    }

    if origin_bound {
        shared.decrement_origin();
    }
}

fn log_forward_exit(peer: SocketAddr, side: &str, result: anyhow::Result<()>) {
    match result {
        Ok(()) => tracing::debug!(%peer, side, "connection closed"),
        Err(err) => tracing::debug!(%peer, side, error = %err, "forwarding stopped"),
    }
}

/// Accept client connections until shutdown.
async fn run_client_listener(shared: Arc<ProxyShared>, listener: TcpListener) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    if *shutdown_rx.borrow() {
        return;
    }
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tokio::spawn(handle_client_conn(shared.clone(), socket, peer));
                }
                Err(err) => tracing::warn!(error = %err, "client accept failed"),
            }
        }
    }
    tracing::info!("client listener shut down");
}

/// Accept control connections until shutdown.
async fn run_control_listener(
    shared: Arc<ProxyShared>,
    listener: TcpListener,
    channels: Arc<ControlChannels>,
) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    if *shutdown_rx.borrow() {
        return;
    }
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let channels = channels.clone();
                    tokio::spawn(async move {
                        if let Err(err) = control::handle_control_conn(socket, &channels).await {
                            tracing::warn!(%peer, error = %err, "control connection closed");
                        }
                    });
                }
                Err(err) => tracing::warn!(error = %err, "control accept failed"),
            }
        }
    }
    tracing::info!("control listener shut down");
}

/// Lifecycle controller: the single task that applies control updates.
async fn run_controller(
    shared: Arc<ProxyShared>,
    mut start_rx: mpsc::Receiver<MigrationStatus>,
    mut table_rx: mpsc::Receiver<Table>,
    mut complete_rx: mpsc::Receiver<()>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    if shared.migration_complete.load(Ordering::SeqCst) {
        tracing::info!("migration already complete; directing all connections to the target");
    } else {
        tracing::info!("waiting for migration start signal");
    }
    loop {
        tokio::select! {
            Some(status) = start_rx.recv() => apply_start(&shared, status),
            Some(table) = table_rx.recv() => apply_table_update(&shared, table),
            Some(()) = complete_rx.recv() => {
                shared.migration_complete.store(true, Ordering::SeqCst);
                tracing::info!("migration complete; directing new connections to the target");
            }
            Some(()) = shutdown_rx.recv() => {
                shared.begin_shutdown();
                return;
            }
            else => return,
        }
    }
}

/// Apply the Start update: create every table's queue and worker, publish
/// the status, and signal readiness.
fn apply_start(shared: &Arc<ProxyShared>, status: MigrationStatus) {
    if !shared.registry.publish(status.clone()) {
        tracing::warn!("duplicate migration start update ignored");
        return;
    }
    let mut table_count = 0usize;
    for (keyspace, tables) in &status.tables {
        for name in tables.keys() {
            let Some((queue, rx)) = shared.queues.install(keyspace, name) else {
                continue;
            };
            table_count += 1;
            tokio::spawn(mirror::run_table_worker(
                queue,
                rx,
                shared.target.clone(),
                shared.metrics.clone(),
            ));
        }
    }
    let _ = shared.ready_tx.send(true);
    tracing::info!(tables = table_count, "proxy ready to mirror queries");
}

/// Apply a TableUpdate: replace the registry entry and resume a paused
/// queue once the table's load has completed.
fn apply_table_update(shared: &Arc<ProxyShared>, table: Table) {
    if !shared.registry.is_published() {
        tracing::warn!(
            keyspace = %table.keyspace,
            table = %table.name,
            "dropping table update received before migration start"
        );
        return;
    }
    tracing::debug!(
        keyspace = %table.keyspace,
        table = %table.name,
        step = ?table.step,
        "table migration update"
    );
    let resume = table.step == Step::LoadingDataComplete;
    let keyspace = table.keyspace.clone();
    let name = table.name.clone();
    shared.registry.set_table(table);
    if resume {
        if let Some(queue) = shared.queues.get(&keyspace, &name) {
            queue.resume();
            tracing::debug!(%keyspace, table = %name, "resumed mirror consumption");
        }
    }
}

/// Running proxy plus the signals an embedding process observes.
pub struct ProxyHandle {
    shared: Arc<ProxyShared>,
    client_addr: SocketAddr,
    control_addr: SocketAddr,
    ready_rx: watch::Receiver<bool>,
    redirect_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyHandle {
    /// Address of the client data listener.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Address of the migration control listener.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Resolve once the Start update has been applied.
    pub async fn wait_ready(&self) {
        wait_for_flag(self.ready_rx.clone()).await;
    }

    /// Resolve once the last origin connection has drained after completion.
    pub async fn wait_redirect_ready(&self) {
        wait_for_flag(self.redirect_rx.clone()).await;
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_shutdown(&self) {
        wait_for_flag(self.shutdown_rx.clone()).await;
    }

    /// Whether the redirect-ready signal has fired.
    pub fn redirect_ready(&self) -> bool {
        *self.redirect_rx.borrow()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Mirror queue depth for one table, if the table is known.
    pub fn queue_depth(&self, keyspace: &str, table: &str) -> Option<usize> {
        self.shared
            .queues
            .get(keyspace, table)
            .map(|queue| queue.depth())
    }

    /// Whether one table's mirror queue is paused.
    pub fn queue_paused(&self, keyspace: &str, table: &str) -> Option<bool> {
        self.shared
            .queues
            .get(keyspace, table)
            .map(|queue| queue.is_paused())
    }

    /// Number of currently open origin-bound client connections.
    pub fn origin_connections(&self) -> u32 {
        self.shared.origin_connection_count()
    }

    /// Whether the proxy has entered the completed phase.
    pub fn migration_complete(&self) -> bool {
        self.shared.migration_complete.load(Ordering::SeqCst)
    }

    /// Ask the proxy to stop accepting and tear down.
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
    }
}

/// Latched-flag wait: resolves when the watch value is (or becomes) true.
async fn wait_for_flag(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Dial the target, bind the listeners, and spawn every proxy task.
///
/// Only these startup steps are fatal; everything later is logged and
/// survived, because the one contract that must hold is that the origin path
/// stays unperturbed.
pub async fn start_proxy(config: ProxyConfig) -> anyhow::Result<ProxyHandle> {
    let target = TargetSession::connect(config.target).await?;
    let client_listener = TcpListener::bind(config.listen_client)
        .await
        .with_context(|| format!("bind client listener {}", config.listen_client))?;
    let control_listener = TcpListener::bind(config.listen_control)
        .await
        .with_context(|| format!("bind control listener {}", config.listen_control))?;
    let client_addr = client_listener.local_addr().context("client listener address")?;
    let control_addr = control_listener
        .local_addr()
        .context("control listener address")?;

    let (ready_tx, ready_rx) = watch::channel(false);
    let (redirect_tx, redirect_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (start_tx, start_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let (table_tx, table_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let (complete_tx, complete_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let (shutdown_ctl_tx, shutdown_ctl_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

    let shared = Arc::new(ProxyShared {
        migration_complete: AtomicBool::new(config.migration_complete),
        config,
        metrics: Arc::new(ProxyMetrics::new()),
        registry: TableRegistry::new(),
        queues: MirrorQueues::new(),
        prepared: PreparedQueries::new(),
        target,
        keyspace: std::sync::Mutex::new(String::new()),
        origin_connections: std::sync::Mutex::new(0),
        redirect_fired: AtomicBool::new(false),
        redirect_tx,
        ready_tx,
        shutdown_tx,
    });

    let channels = Arc::new(ControlChannels {
        start: start_tx,
        table_updated: table_tx,
        complete: complete_tx,
        shutdown: shutdown_ctl_tx,
    });

    tokio::spawn(run_controller(
        shared.clone(),
        start_rx,
        table_rx,
        complete_rx,
        shutdown_ctl_rx,
    ));
    tokio::spawn(run_client_listener(shared.clone(), client_listener));
    tokio::spawn(run_control_listener(
        shared.clone(),
        control_listener,
        channels,
    ));

    tracing::info!(
        client = %client_addr,
        control = %control_addr,
        origin = %shared.config.origin,
        target = %shared.config.target,
        migration_complete = shared.migration_complete.load(Ordering::SeqCst),
        "proxy listening"
    );

    Ok(ProxyHandle {
        shared,
        client_addr,
        control_addr,
        ready_rx,
        redirect_rx,
        shutdown_rx,
    })
}

/// Run the proxy until interrupted.
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    run_with_shutdown(config, tokio::signal::ctrl_c()).await
}

/// Run the proxy until `shutdown` resolves or a Shutdown update arrives.
pub async fn run_with_shutdown<F>(config: ProxyConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let handle = start_proxy(config).await?;
    tokio::select! {
        result = shutdown => {
            result.context("wait for shutdown signal")?;
            handle.shutdown();
        }
        _ = handle.wait_shutdown() => {}
    }
    Ok(())
}
