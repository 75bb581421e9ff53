//! Master failover watcher
//!
//! Every watcher process mirrors the shared coordination values, probes the
//! published master and, once enough processes agree it is gone, races for
//! the judge lock. The winner picks the first reachable server and publishes
//! it as the new master.
//!
//! ```text
//!  health check ──> fail marker ──> judge lock ──> vacate ──> publish
//!       ▲                                                       │
//!       └───────────────────── mirror ◄─────────────────────────┘
//! ```

pub mod controller;
pub mod mirror;
pub mod probe;
pub mod state;

pub use controller::{RoundOutcome, Watcher};
pub use mirror::{Mirror, MirrorSnapshot};
pub use probe::{Probe, TcpProbe};
pub use state::{StateCell, WatcherState};
