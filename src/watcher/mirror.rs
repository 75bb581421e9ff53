//! Local mirror of the coordination values the watcher decides on
//!
//! One task per key keeps its field fresh: read with a watch, wait for the
//! watch (or shutdown), read again. Errors back off for a fixed interval.
//! Each task is the only writer of its field and publishes through a
//! `tokio::sync::watch` channel, so readers never block.
//!
//! A field reads as its default until the first answer for its key arrives
//! (a value or "absent"); `*_loaded()` tells the two cases apart.

use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::common::Result;
use crate::coord::{Coordination, CoordinationPaths, Watch, WatchEvent};

/// Point-in-time copy of every mirrored field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorSnapshot {
    /// Published master, empty when unknown or vacated.
    pub master: String,
    /// Candidate servers in coordination-service order.
    pub servers: Vec<String>,
    /// Live fail markers (names only).
    pub fail_markers: Vec<String>,
    /// Raw minimum-failure threshold.
    pub min_fail: String,
    /// Current judge payload, empty when no round is running.
    pub judge: String,
}

/// Reading side of one bound key.
struct Field<T> {
    value: watch::Receiver<T>,
    loaded: watch::Receiver<bool>,
}

impl<T: Clone> Field<T> {
    fn get(&self) -> T {
        self.value.borrow().clone()
    }

    fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }
}

pub struct Mirror {
    master: Field<String>,
    servers: Field<Vec<String>>,
    fail_markers: Field<Vec<String>>,
    min_fail: Field<String>,
    judge: Field<String>,
    trigger: ShutdownTrigger,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Mirror {
    /// Spawn the five binding tasks. Must be called inside a tokio runtime.
    pub fn bind(client: Arc<dyn Coordination>, paths: &CoordinationPaths, retry: Duration) -> Self {
        let (trigger, listener) = shutdown::channel();
        let key = |path: &str, quiet_absent: bool| Key {
            path: path.to_string(),
            quiet_absent,
            retry,
            shutdown: listener.clone(),
        };

        // Master is unset before the first election and judge exists only
        // while a round runs, so their absence is not worth a warning.
        let (master_task, master) = spawn_key(&client, key(&paths.master, true));
        let (judge_task, judge) = spawn_key(&client, key(&paths.judge, true));
        let (min_fail_task, min_fail) = spawn_key(&client, key(&paths.min_fail, false));
        let (servers_task, servers) = spawn_list(&client, key(&paths.servers, false));
        let (fail_task, fail_markers) = spawn_list(&client, key(&paths.fail, false));

        Self {
            master,
            servers,
            fail_markers,
            min_fail,
            judge,
            trigger,
            tasks: Mutex::new(vec![
                master_task,
                judge_task,
                min_fail_task,
                servers_task,
                fail_task,
            ]),
        }
    }

    pub fn master(&self) -> String {
        self.master.get()
    }

    pub fn servers(&self) -> Vec<String> {
        self.servers.get()
    }

    pub fn fail_count(&self) -> usize {
        self.fail_markers.value.borrow().len()
    }

    pub fn min_fail(&self) -> String {
        self.min_fail.get()
    }

    pub fn judge(&self) -> String {
        self.judge.get()
    }

    /// Whether the master key has been answered at least once.
    pub fn master_loaded(&self) -> bool {
        self.master.is_loaded()
    }

    /// Wait until every key has been answered, up to `timeout`.
    pub async fn wait_loaded(&self, timeout: Duration) -> bool {
        let mut pending = vec![
            self.master.loaded.clone(),
            self.servers.loaded.clone(),
            self.fail_markers.loaded.clone(),
            self.min_fail.loaded.clone(),
            self.judge.loaded.clone(),
        ];
        let all = async move {
            for rx in pending.iter_mut() {
                if rx.wait_for(|loaded| *loaded).await.is_err() {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(timeout, all).await.unwrap_or(false)
    }

    pub fn snapshot(&self) -> MirrorSnapshot {
        MirrorSnapshot {
            master: self.master(),
            servers: self.servers(),
            fail_markers: self.fail_markers.get(),
            min_fail: self.min_fail(),
            judge: self.judge(),
        }
    }

    /// Receiver for master changes (used by the relay and by tests).
    pub fn subscribe_master(&self) -> watch::Receiver<String> {
        self.master.value.clone()
    }

    /// Signal every binding task once and wait until all have exited.
    pub async fn shutdown(&self) {
        if !self.trigger.trigger() {
            tracing::debug!("Mirror already shut down");
        }
        let tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Mirror task ended abnormally: {}", e);
            }
        }
    }
}

/// Writing side of one bound key.
struct FieldTx<T> {
    value: watch::Sender<T>,
    loaded: watch::Sender<bool>,
}

fn field<T>(init: T) -> (FieldTx<T>, Field<T>) {
    let (value_tx, value) = watch::channel(init);
    let (loaded_tx, loaded) = watch::channel(false);
    (
        FieldTx {
            value: value_tx,
            loaded: loaded_tx,
        },
        Field { value, loaded },
    )
}

fn spawn_key(client: &Arc<dyn Coordination>, key: Key) -> (JoinHandle<()>, Field<String>) {
    let client = client.clone();
    let (tx, field) = field(String::new());
    let task = tokio::spawn(bind(key, tx, move |p| {
        let client = client.clone();
        async move { client.get_watch(&p).await }
    }));
    (task, field)
}

fn spawn_list(client: &Arc<dyn Coordination>, key: Key) -> (JoinHandle<()>, Field<Vec<String>>) {
    let client = client.clone();
    let (tx, field) = field(Vec::new());
    let task = tokio::spawn(bind(key, tx, move |p| {
        let client = client.clone();
        async move { client.children_watch(&p).await }
    }));
    (task, field)
}

struct Key {
    path: String,
    quiet_absent: bool,
    retry: Duration,
    shutdown: Shutdown,
}

/// Subscribe / wait / resubscribe until shutdown.
///
/// A missing node resets the field to its default ("unknown"); any other
/// error keeps the last known value.
async fn bind<T, F, Fut>(key: Key, tx: FieldTx<T>, fetch: F)
where
    T: Clone + Default + PartialEq + Debug + Send + Sync + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<(T, Watch)>>,
{
    let Key {
        path,
        quiet_absent,
        retry,
        mut shutdown,
    } = key;

    while !shutdown.is_triggered() {
        let fetched = tokio::select! {
            res = fetch(path.clone()) => Some(res),
            _ = shutdown.wait() => None,
        };
        let Some(fetched) = fetched else { break };

        let watch = match fetched {
            Ok((value, watch)) => {
                publish(&tx.value, &path, value);
                mark_loaded(&tx.loaded);
                watch
            }
            Err(e) => {
                if e.is_absent() {
                    if quiet_absent {
                        tracing::debug!("{} not set yet", path);
                    } else {
                        tracing::warn!("Get {} error: {}", path, e);
                    }
                    publish(&tx.value, &path, T::default());
                    mark_loaded(&tx.loaded);
                } else if e.is_retryable() {
                    tracing::info!("Get {} failed, retrying in {:?}: {}", path, retry, e);
                } else {
                    tracing::warn!("Get {} error: {}", path, e);
                }
                if shutdown.sleep(retry).await {
                    break;
                }
                continue;
            }
        };

        let event = tokio::select! {
            ev = watch.fired() => Some(ev),
            _ = shutdown.wait() => None,
        };
        match event {
            None => break,
            Some(WatchEvent::SessionClosed) => {
                if shutdown.sleep(retry).await {
                    break;
                }
            }
            Some(ev) => tracing::trace!("{} watch fired: {:?}", path, ev),
        }
    }
    tracing::debug!("Mirror of {} stopped", path);
}

fn mark_loaded(loaded: &watch::Sender<bool>) {
    loaded.send_if_modified(|done| !std::mem::replace(done, true));
}

fn publish<T: PartialEq + Debug>(tx: &watch::Sender<T>, path: &str, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            return false;
        }
        tracing::info!("{} = {:?}", path, value);
        *current = value;
        true
    });
}
