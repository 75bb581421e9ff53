//! Common utilities and types shared across zkswitch

pub mod config;
pub mod error;
pub mod shutdown;
pub mod utils;

pub use config::{Config, PathsConfig, ServerConfig, WatcherConfig, ZkConfig};
pub use error::{Error, Result};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use utils::{join_path, judge_id, parent_path, timestamp_now};
