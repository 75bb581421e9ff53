//! # zkswitch
//!
//! Master failover for a pool of interchangeable backends, coordinated
//! through ZooKeeper:
//! - Every watcher mirrors the shared master, server list and fail markers
//! - Health checks probe the published master over TCP
//! - A quorum of fail markers triggers an election guarded by an ephemeral
//!   judge lock
//! - The judge vacates the master and publishes the first reachable server
//! - A local TCP relay forwards clients to whichever master is published
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │              ZooKeeper                    │
//! │  <root>/master     published address      │
//! │  <root>/servers/*  candidates             │
//! │  <root>/fail/m-*   ephemeral fail markers │
//! │  <root>/min_fail   marker quorum          │
//! │  <root>/judge      ephemeral round lock   │
//! └───────────┬───────────────────────────────┘
//!             │ watches / writes
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ zkswitch 1 │   │ zkswitch 2 │   │ zkswitch 3 │
//! │  + relay   │   │  + relay   │   │  + relay   │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Lay out the tree
//! ```bash
//! zkswitch init --zk zk1:2181,zk2:2181 \
//!   --server 10.0.0.1:80 --server 10.0.0.2:80 --min-fail 2
//! ```
//!
//! ### Run a watcher with its relay
//! ```bash
//! zkswitch serve --config zkswitch.toml --bind 0.0.0.0:3456
//! ```
//!
//! ### Inspect the mirrored state
//! ```bash
//! zkswitch status --zk zk1:2181
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coord;
pub mod proxy;
pub mod watcher;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coord::{Coordination, CoordinationPaths, MemoryCoordination, ZkCoordination};
pub use proxy::ProxyServer;
pub use watcher::{Mirror, RoundOutcome, Watcher, WatcherState};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
