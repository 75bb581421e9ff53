//! Coordination service client interface
//!
//! The watcher and the mirror only talk to the coordination service through
//! the [`Coordination`] trait:
//! - `get_watch` / `children_watch` read a value and leave a one-shot watch
//! - `create` makes persistent, ephemeral and sequential nodes
//! - `set` / `delete` take an optional expected version
//!
//! [`zk::ZkCoordination`] backs it with a ZooKeeper ensemble,
//! [`memory::MemoryCoordination`] with an in-process tree.

pub mod memory;
pub mod zk;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::common::{join_path, Error, PathsConfig, Result};

pub use memory::{MemoryCoordination, MemorySession, TreeEvent};
pub use zk::ZkCoordination;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

/// Why a watch fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    NodeChanged,
    NodeDeleted,
    ChildrenChanged,
    /// The session went away before anything changed.
    SessionClosed,
}

/// Firing side of a [`Watch`].
#[derive(Debug)]
pub struct WatchNotifier {
    tx: oneshot::Sender<WatchEvent>,
}

impl WatchNotifier {
    pub fn fire(self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }
}

/// One-shot change notification. Resolves at most once; resubscribe to keep
/// watching.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub fn pair() -> (WatchNotifier, Watch) {
        let (tx, rx) = oneshot::channel();
        (WatchNotifier { tx }, Watch { rx })
    }

    /// Wait for the watch to fire. A dropped notifier reads as
    /// [`WatchEvent::SessionClosed`].
    pub async fn fired(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::SessionClosed)
    }
}

/// Hierarchical key/value store with ephemeral nodes and one-shot watches.
#[async_trait]
pub trait Coordination: Send + Sync + 'static {
    /// Read a node's value and watch it for the next change.
    async fn get_watch(&self, path: &str) -> Result<(String, Watch)>;

    /// List a node's children (names, not full paths) and watch the list.
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Create a node, returning the path actually created (sequential nodes
    /// get a counter suffix).
    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> Result<String>;

    /// Overwrite a node's value; `None` matches any version.
    async fn set(&self, path: &str, value: &str, version: Option<i32>) -> Result<()>;

    /// Delete a node; `None` matches any version.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// End the session. Ephemeral nodes are reclaimed by the service.
    async fn close(&self) -> Result<()>;
}

/// Absolute coordination paths, resolved once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationPaths {
    pub root: String,
    pub master: String,
    pub servers: String,
    pub judge: String,
    pub fail: String,
    pub min_fail: String,
}

impl CoordinationPaths {
    pub fn from_config(conf: &PathsConfig) -> Self {
        let root = conf.root.trim_end_matches('/').to_string();
        Self {
            master: join_path(&root, &conf.master),
            servers: join_path(&root, &conf.server),
            judge: join_path(&root, &conf.judge),
            fail: join_path(&root, &conf.fail),
            min_fail: join_path(&root, &conf.min_fail),
            root,
        }
    }

    /// Prefix for this process's fail markers; the service appends the
    /// sequence number.
    pub fn fail_marker_prefix(&self) -> String {
        join_path(&self.fail, "/m-")
    }
}

impl Default for CoordinationPaths {
    fn default() -> Self {
        Self::from_config(&PathsConfig::default())
    }
}

/// Create `path` (and missing ancestors) as persistent nodes. The leaf gets
/// `value`; an existing leaf is left untouched. Returns whether the leaf was
/// created.
pub async fn ensure_node(client: &dyn Coordination, path: &str, value: &str) -> Result<bool> {
    let mut current = String::new();
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    for (i, part) in parts.iter().enumerate() {
        current.push('/');
        current.push_str(part);
        let data = if i + 1 == parts.len() { value } else { "" };
        match client.create(&current, data, CreateMode::Persistent).await {
            Ok(_) if i + 1 == parts.len() => return Ok(true),
            Ok(_) | Err(Error::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Lay out the tree a watcher group expects. Existing nodes are kept, so this
/// is safe to run against a live group.
pub async fn init_layout(
    client: &dyn Coordination,
    paths: &CoordinationPaths,
    servers: &[String],
    min_fail: usize,
) -> Result<()> {
    ensure_node(client, &paths.root, "").await?;
    ensure_node(client, &paths.fail, "").await?;
    ensure_node(client, &paths.servers, "").await?;
    if ensure_node(client, &paths.min_fail, &min_fail.to_string()).await? {
        tracing::info!("{} = {}", paths.min_fail, min_fail);
    }
    for srv in servers {
        if ensure_node(client, &join_path(&paths.servers, srv), "").await? {
            tracing::info!("Server registered: {}", srv);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_from_config() {
        let paths = CoordinationPaths::default();
        assert_eq!(paths.root, "/zkswitch");
        assert_eq!(paths.master, "/zkswitch/master");
        assert_eq!(paths.servers, "/zkswitch/servers");
        assert_eq!(paths.judge, "/zkswitch/judge");
        assert_eq!(paths.fail, "/zkswitch/fail");
        assert_eq!(paths.min_fail, "/zkswitch/min_fail");
        assert_eq!(paths.fail_marker_prefix(), "/zkswitch/fail/m-");
    }

    #[tokio::test]
    async fn test_watch_fires_once() {
        let (notifier, watch) = Watch::pair();
        notifier.fire(WatchEvent::NodeChanged);
        assert_eq!(watch.fired().await, WatchEvent::NodeChanged);
    }

    #[tokio::test]
    async fn test_watch_dropped_notifier() {
        let (notifier, watch) = Watch::pair();
        drop(notifier);
        assert_eq!(watch.fired().await, WatchEvent::SessionClosed);
    }

    #[tokio::test]
    async fn test_init_layout_idempotent() {
        let store = MemoryCoordination::new();
        let session = store.session();
        let paths = CoordinationPaths::default();
        let servers = vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()];

        init_layout(&session, &paths, &servers, 2).await.unwrap();
        assert_eq!(store.get(&paths.min_fail).as_deref(), Some("2"));
        assert_eq!(store.children(&paths.servers), servers);
        assert!(store.exists(&paths.fail));
        assert!(!store.exists(&paths.master));

        store.put(&paths.min_fail, "3");
        init_layout(&session, &paths, &servers, 2).await.unwrap();
        assert_eq!(store.get(&paths.min_fail).as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_ensure_node_reports_creation() {
        let store = MemoryCoordination::new();
        let session = store.session();
        assert!(ensure_node(&session, "/a/b/c", "x").await.unwrap());
        assert!(!ensure_node(&session, "/a/b/c", "y").await.unwrap());
        assert_eq!(store.get("/a/b/c").as_deref(), Some("x"));
        assert_eq!(store.get("/a/b").as_deref(), Some(""));
    }

    #[test]
    fn test_create_mode() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Ephemeral.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
    }
}
