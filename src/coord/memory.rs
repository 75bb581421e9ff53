//! In-process coordination service
//!
//! A single shared tree with ZooKeeper node semantics: ephemeral nodes owned
//! by a session, per-parent sequence counters, versioned writes and one-shot
//! data/child watches. Each [`MemorySession`] behaves like one client
//! connection. Fault switches let callers simulate an unavailable ensemble or
//! failing writes, and every mutation is recorded in an event log.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Coordination, CreateMode, Watch, WatchEvent, WatchNotifier};
use crate::common::{parent_path, Error, Result};

/// Mutation recorded by the tree, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Created(String),
    Set(String, String),
    Deleted(String),
}

#[derive(Debug)]
struct Node {
    value: String,
    version: i32,
    owner: Option<u64>,
    next_seq: u64,
}

impl Node {
    fn new(value: &str, owner: Option<u64>) -> Self {
        Self {
            value: value.to_string(),
            version: 0,
            owner,
            next_seq: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_deletes: usize,
    fail_sets: bool,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<(u64, WatchNotifier)>>,
    child_watches: HashMap<String, Vec<(u64, WatchNotifier)>>,
    next_session: u64,
    closed: HashSet<u64>,
    faults: Faults,
    events: Vec<TreeEvent>,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_data(&mut self, path: &str, event: WatchEvent) {
        for (_, notifier) in self.data_watches.remove(path).unwrap_or_default() {
            notifier.fire(event);
        }
    }

    fn fire_children(&mut self, path: &str) {
        for (_, notifier) in self.child_watches.remove(path).unwrap_or_default() {
            notifier.fire(WatchEvent::ChildrenChanged);
        }
    }

    fn insert(&mut self, path: &str, value: &str, owner: Option<u64>) {
        self.nodes.insert(path.to_string(), Node::new(value, owner));
        self.events.push(TreeEvent::Created(path.to_string()));
        self.fire_data(path, WatchEvent::NodeChanged);
        let parent = parent_path(path).to_string();
        self.fire_children(&parent);
    }

    fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        self.events.push(TreeEvent::Deleted(path.to_string()));
        self.fire_data(path, WatchEvent::NodeDeleted);
        self.fire_children(path);
        let parent = parent_path(path).to_string();
        self.fire_children(&parent);
    }

    fn check_session(&self, session: u64) -> Result<()> {
        if self.faults.unavailable {
            return Err(Error::Unavailable("connection loss".into()));
        }
        if self.closed.contains(&session) {
            return Err(Error::Unavailable("session closed".into()));
        }
        Ok(())
    }
}

/// Shared in-memory tree. Cloning shares the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordination {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new client session against this tree.
    pub fn session(&self) -> MemorySession {
        let mut tree = self.lock();
        tree.next_session += 1;
        MemorySession {
            id: tree.next_session,
            tree: self.tree.clone(),
        }
    }

    /// Create `path` and any missing ancestors as persistent empty nodes.
    pub fn ensure_path(&self, path: &str) {
        let mut tree = self.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if !tree.exists(&current) {
                tree.insert(&current, "", None);
            }
        }
    }

    /// Administrative write: create-or-set a persistent node, firing watches.
    pub fn put(&self, path: &str, value: &str) {
        self.ensure_path(path);
        let mut tree = self.lock();
        if let Some(node) = tree.nodes.get_mut(path) {
            node.value = value.to_string();
            node.version += 1;
        }
        tree.events
            .push(TreeEvent::Set(path.to_string(), value.to_string()));
        tree.fire_data(path, WatchEvent::NodeChanged);
    }

    /// Administrative delete, ignoring ownership.
    pub fn remove(&self, path: &str) {
        let mut tree = self.lock();
        if tree.nodes.contains_key(path) {
            tree.remove(path);
        }
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.lock().nodes.get(path).map(|n| n.value.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(path)
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().children(path)
    }

    /// Every mutation so far, in order.
    pub fn events(&self) -> Vec<TreeEvent> {
        self.lock().events.clone()
    }

    /// Values written to `path` through `set`/`put`, in order.
    pub fn writes(&self, path: &str) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TreeEvent::Set(p, v) if p == path => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    /// Fail every client operation with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().faults.unavailable = unavailable;
    }

    /// Fail the next `n` client deletes with `Unavailable`.
    pub fn fail_next_deletes(&self, n: usize) {
        self.lock().faults.fail_deletes = n;
    }

    /// Fail every client `set` with `Unavailable` while set.
    pub fn fail_sets(&self, fail: bool) {
        self.lock().faults.fail_sets = fail;
    }
}

/// One client session on a [`MemoryCoordination`] tree.
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Coordination for MemorySession {
    async fn get_watch(&self, path: &str) -> Result<(String, Watch)> {
        let mut tree = self.lock();
        tree.check_session(self.id)?;
        let value = match tree.nodes.get(path) {
            Some(node) => node.value.clone(),
            None => return Err(Error::NodeAbsent(path.to_string())),
        };
        let (notifier, watch) = Watch::pair();
        tree.data_watches
            .entry(path.to_string())
            .or_default()
            .push((self.id, notifier));
        Ok((value, watch))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut tree = self.lock();
        tree.check_session(self.id)?;
        if !tree.exists(path) {
            return Err(Error::NodeAbsent(path.to_string()));
        }
        let children = tree.children(path);
        let (notifier, watch) = Watch::pair();
        tree.child_watches
            .entry(path.to_string())
            .or_default()
            .push((self.id, notifier));
        Ok((children, watch))
    }

    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> Result<String> {
        let mut tree = self.lock();
        tree.check_session(self.id)?;
        let parent = parent_path(path).to_string();
        if !tree.exists(&parent) {
            return Err(Error::NodeAbsent(parent));
        }

        let created = if mode.is_sequential() {
            let seq = match tree.nodes.get_mut(&parent) {
                Some(node) => {
                    node.next_seq += 1;
                    node.next_seq - 1
                }
                None => 0,
            };
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };

        if tree.exists(&created) {
            return Err(Error::NodeExists(created));
        }
        let owner = mode.is_ephemeral().then_some(self.id);
        tree.insert(&created, value, owner);
        Ok(created)
    }

    async fn set(&self, path: &str, value: &str, version: Option<i32>) -> Result<()> {
        let mut tree = self.lock();
        tree.check_session(self.id)?;
        if tree.faults.fail_sets {
            return Err(Error::Unavailable("injected set failure".into()));
        }
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NodeAbsent(path.to_string()))?;
        if version.is_some_and(|v| v != node.version) {
            return Err(Error::VersionConflict(path.to_string()));
        }
        node.value = value.to_string();
        node.version += 1;
        tree.events
            .push(TreeEvent::Set(path.to_string(), value.to_string()));
        tree.fire_data(path, WatchEvent::NodeChanged);
        Ok(())
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let mut tree = self.lock();
        tree.check_session(self.id)?;
        if tree.faults.fail_deletes > 0 {
            tree.faults.fail_deletes -= 1;
            return Err(Error::Unavailable("injected delete failure".into()));
        }
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| Error::NodeAbsent(path.to_string()))?;
        if version.is_some_and(|v| v != node.version) {
            return Err(Error::VersionConflict(path.to_string()));
        }
        tree.remove(path);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut tree = self.lock();
        if !tree.closed.insert(self.id) {
            return Ok(());
        }

        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(self.id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            tree.remove(&path);
        }

        // Dropping this session's notifiers resolves its watches as closed.
        let id = self.id;
        let drop_owned = |_: &String, watches: &mut Vec<(u64, WatchNotifier)>| {
            watches.retain(|(owner, _)| *owner != id);
            !watches.is_empty()
        };
        tree.data_watches.retain(drop_owned);
        tree.child_watches.retain(drop_owned);
        Ok(())
    }
}
