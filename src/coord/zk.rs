//! ZooKeeper-backed coordination client
//!
//! The `zookeeper` crate is blocking, so every call runs on the blocking pool.
//! Its one-shot watch callbacks complete the [`Watch`] handed back to callers.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zookeeper::{Acl, WatchedEvent, WatchedEventType, ZkError, ZooKeeper};

use super::{Coordination, CreateMode, Watch, WatchEvent, WatchNotifier};
use crate::common::{Error, Result};

pub struct ZkCoordination {
    zk: Arc<ZooKeeper>,
}

impl ZkCoordination {
    /// Open a session. This is the only coordination failure that is fatal
    /// to startup.
    pub async fn connect(connect_string: &str, session_timeout: Duration) -> Result<Self> {
        let connect_string = connect_string.to_string();
        let zk = tokio::task::spawn_blocking(move || {
            ZooKeeper::connect(&connect_string, session_timeout, |event: WatchedEvent| {
                tracing::debug!("ZooKeeper session event: {:?}", event);
            })
        })
        .await
        .map_err(|e| Error::Other(format!("connect task failed: {}", e)))?
        .map_err(|e| Error::Unavailable(format!("cannot connect ZooKeeper: {:?}", e)))?;

        Ok(Self { zk: Arc::new(zk) })
    }

    async fn blocking<T, F>(&self, path: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ZooKeeper) -> std::result::Result<T, ZkError> + Send + 'static,
    {
        let zk = self.zk.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || op(&zk).map_err(|e| map_zk_error(&path, e)))
            .await
            .map_err(|e| Error::Other(format!("ZooKeeper task failed: {}", e)))?
    }
}

fn map_zk_error(path: &str, err: ZkError) -> Error {
    match err {
        ZkError::NoNode => Error::NodeAbsent(path.to_string()),
        ZkError::NodeExists => Error::NodeExists(path.to_string()),
        ZkError::BadVersion => Error::VersionConflict(path.to_string()),
        other => Error::Unavailable(format!("{}: {:?}", path, other)),
    }
}

/// ZooKeeper watchers are `Fn`; the notifier is taken on the first event so
/// the [`Watch`] still resolves at most once.
fn watch_callback(notifier: WatchNotifier) -> impl Fn(WatchedEvent) + Send + 'static {
    let notifier = Mutex::new(Some(notifier));
    move |event: WatchedEvent| {
        let kind = match event.event_type {
            WatchedEventType::NodeDeleted => WatchEvent::NodeDeleted,
            WatchedEventType::NodeChildrenChanged => WatchEvent::ChildrenChanged,
            WatchedEventType::None => WatchEvent::SessionClosed,
            _ => WatchEvent::NodeChanged,
        };
        let taken = notifier.lock().unwrap_or_else(|e| e.into_inner()).take();
        match taken {
            Some(notifier) => notifier.fire(kind),
            None => tracing::trace!("Watch already fired, dropping {:?}", event),
        }
    }
}

fn zk_mode(mode: CreateMode) -> zookeeper::CreateMode {
    match mode {
        CreateMode::Persistent => zookeeper::CreateMode::Persistent,
        CreateMode::Ephemeral => zookeeper::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zookeeper::CreateMode::EphemeralSequential,
    }
}

#[async_trait]
impl Coordination for ZkCoordination {
    async fn get_watch(&self, path: &str) -> Result<(String, Watch)> {
        let (notifier, watch) = Watch::pair();
        let owned = path.to_string();
        let (data, _stat) = self
            .blocking(path, move |zk| {
                zk.get_data_w(&owned, watch_callback(notifier))
            })
            .await?;
        Ok((String::from_utf8_lossy(&data).into_owned(), watch))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let (notifier, watch) = Watch::pair();
        let owned = path.to_string();
        let children = self
            .blocking(path, move |zk| {
                zk.get_children_w(&owned, watch_callback(notifier))
            })
            .await?;
        Ok((children, watch))
    }

    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> Result<String> {
        let owned = path.to_string();
        let data = value.as_bytes().to_vec();
        self.blocking(path, move |zk| {
            zk.create(&owned, data, Acl::open_unsafe().clone(), zk_mode(mode))
        })
        .await
    }

    async fn set(&self, path: &str, value: &str, version: Option<i32>) -> Result<()> {
        let owned = path.to_string();
        let data = value.as_bytes().to_vec();
        self.blocking(path, move |zk| zk.set_data(&owned, data, version))
            .await
            .map(|_stat| ())
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let owned = path.to_string();
        self.blocking(path, move |zk| zk.delete(&owned, version))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.blocking("/", |zk| zk.close()).await
    }
}
