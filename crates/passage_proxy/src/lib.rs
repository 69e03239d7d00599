//! Transparent CQL proxy that mirrors live writes during a cluster migration.
//!
//! A single proxy process hosts:
//! - a client listener that forwards native-protocol frames to the origin
//!   cluster byte-for-byte,
//! - a mirror path that replays mutating requests against the target
//!   cluster, gated per table by the migration's progress,
//! - a control listener the migration service drives with
//!   Start / TableUpdate / Complete / Shutdown updates.
//!
//! The contract that outranks everything else: the origin path is never
//! perturbed. Mirroring is best-effort with bounded retry, and nothing on
//! the mirror side may fail a client connection.

pub mod classify;
pub mod control;
pub mod frame;
pub mod metrics;
pub mod mirror;
pub mod proxy;
pub mod queue;
pub mod registry;

pub use metrics::MetricsSnapshot;
pub use proxy::{run, run_with_shutdown, start_proxy, ProxyConfig, ProxyHandle};
