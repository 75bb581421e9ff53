//! Failover controller
//!
//! The health-check loop is the only writer of the local fail count and the
//! fail marker handle, and it runs each election round inline, so at most one
//! round is ever in flight per process. The shared [`WatcherState`] is only
//! changed through compare-and-set transitions; `shutdown()` moving to
//! `Closed` can therefore never be undone by a finishing round.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::common::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::common::{judge_id, Config, Error, Result, WatcherConfig};
use crate::coord::{Coordination, CoordinationPaths, CreateMode, ZkCoordination};
use crate::watcher::mirror::Mirror;
use crate::watcher::probe::{Probe, TcpProbe};
use crate::watcher::state::{StateCell, WatcherState};

/// How an election round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Fewer live fail markers than the threshold.
    NotEnoughFailures { markers: usize, threshold: usize },
    /// Another process holds the judge lock.
    JudgeTaken,
    /// The judge lock could not be created for another reason.
    JudgeUnavailable,
    /// The published master answered again once we held the lock.
    MasterRecovered,
    /// No candidate other than the current master is reachable.
    NoCandidate,
    /// The new master was published.
    Switched(String),
    /// Every publish attempt failed.
    PublishFailed(String),
    /// Shutdown interrupted the round.
    Cancelled,
}

struct Inner {
    client: Arc<dyn Coordination>,
    mirror: Arc<Mirror>,
    probe: Arc<dyn Probe>,
    paths: CoordinationPaths,
    conf: WatcherConfig,
    judge_id: String,
    state: StateCell,
    trigger: ShutdownTrigger,
    listener: Shutdown,
}

/// One watcher process: mirror + health check + election.
pub struct Watcher {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Build a watcher over an established session. Spawns the mirror tasks,
    /// so it must be called inside a tokio runtime.
    pub fn new(
        client: Arc<dyn Coordination>,
        paths: CoordinationPaths,
        conf: WatcherConfig,
        probe: Arc<dyn Probe>,
        judge_id: String,
    ) -> Self {
        let mirror = Arc::new(Mirror::bind(client.clone(), &paths, conf.mirror_retry()));
        let (trigger, listener) = shutdown::channel();
        tracing::info!("JudgeId: {}", judge_id);
        Self {
            inner: Arc::new(Inner {
                client,
                mirror,
                probe,
                paths,
                conf,
                judge_id,
                state: StateCell::new(),
                trigger,
                listener,
            }),
            task: Mutex::new(None),
        }
    }

    /// Connect to ZooKeeper and build a watcher with a TCP probe.
    ///
    /// Failing to open the session is the one fatal error.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = ZkCoordination::connect(&config.zk.connect_string(), config.zk.session_timeout())
            .await?;
        let id = judge_id(config.zk.hosts.first().map(String::as_str));
        Ok(Self::new(
            Arc::new(client),
            CoordinationPaths::from_config(&config.paths),
            config.watcher.clone(),
            Arc::new(TcpProbe::new(config.watcher.probe_timeout())),
            id,
        ))
    }

    pub fn mirror(&self) -> Arc<Mirror> {
        self.inner.mirror.clone()
    }

    pub fn state(&self) -> WatcherState {
        self.inner.state.get()
    }

    /// Recent states, oldest first.
    pub fn state_history(&self) -> Vec<WatcherState> {
        self.inner.state.history()
    }

    pub fn judge_id(&self) -> &str {
        &self.inner.judge_id
    }

    /// Start the health-check loop. Only valid from `NotRunning`.
    pub fn start(&self) {
        if !self
            .inner
            .state
            .transition(&[WatcherState::NotRunning], WatcherState::Watching)
        {
            tracing::warn!(
                "Watcher is {}, not {}; start ignored",
                self.state(),
                WatcherState::NotRunning
            );
            return;
        }
        let check = HealthCheck::new(self.inner.clone());
        let handle = tokio::spawn(check.run());
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!("Watcher started");
    }

    /// Stop everything and close the session. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.state.replace(WatcherState::Closed) == WatcherState::Closed {
            tracing::info!("Watcher already closed");
            return Ok(());
        }
        self.inner.trigger.trigger();

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Health check task ended abnormally: {}", e);
            }
        }
        self.inner.mirror.shutdown().await;
        self.inner.client.close().await?;
        tracing::info!("Watcher closed");
        Ok(())
    }
}

/// Owner of the per-process failure accounting.
struct HealthCheck {
    inner: Arc<Inner>,
    shutdown: Shutdown,
    fail_count: u32,
    marker: Option<String>,
}

impl HealthCheck {
    fn new(inner: Arc<Inner>) -> Self {
        let shutdown = inner.listener.clone();
        Self {
            inner,
            shutdown,
            fail_count: 0,
            marker: None,
        }
    }

    async fn run(mut self) {
        while self.check_once().await {}
        // Session close would reclaim it too; removing it now keeps the
        // marker count honest for the other watchers.
        if self.marker.is_some() {
            self.del_fail().await;
        }
        tracing::debug!("Health check loop stopped");
    }

    /// One iteration. Returns `false` once the loop should stop.
    async fn check_once(&mut self) -> bool {
        if self.inner.state.get() == WatcherState::Closed || self.shutdown.is_triggered() {
            return false;
        }
        let threshold = self.inner.conf.fail_threshold;
        let master = self.inner.mirror.master();

        if master.is_empty() && !self.inner.mirror.master_loaded() {
            tracing::debug!("Master not loaded yet, skipping check");
        } else if master.is_empty() {
            tracing::debug!("No master published, counting as failure");
            self.fail_count = self.fail_count.max(threshold);
        } else if self.inner.probe.reachable(&master).await {
            self.fail_count = 0;
            if self.marker.is_some() {
                self.del_fail().await;
            }
        } else {
            self.fail_count += 1;
            tracing::info!("Cannot connect master {} [{}]", master, self.fail_count);
        }

        if self.fail_count >= threshold && self.inner.state.get() == WatcherState::Watching {
            if self.add_fail().await {
                if self.shutdown.sleep(self.inner.conf.settle()).await {
                    return false;
                }
                if self
                    .inner
                    .state
                    .transition(&[WatcherState::Watching], WatcherState::FightForJudge)
                {
                    let outcome = self.fight_for_judge().await;
                    tracing::debug!("Election round ended: {:?}", outcome);
                }
                self.fail_count = 0;
            }
        }

        !self.shutdown.sleep(self.inner.conf.check_interval()).await
    }

    /// Raise this process's fail marker. Idempotent.
    async fn add_fail(&mut self) -> bool {
        if self.marker.is_some() {
            return true;
        }
        let prefix = self.inner.paths.fail_marker_prefix();
        match self
            .inner
            .client
            .create(&prefix, &self.inner.judge_id, CreateMode::EphemeralSequential)
            .await
        {
            Ok(path) => {
                tracing::info!("Fail marker created: {}", path);
                self.marker = Some(path);
                true
            }
            Err(e) => {
                tracing::warn!("Cannot create fail marker under {}: {}", self.inner.paths.fail, e);
                false
            }
        }
    }

    /// Drop the fail marker. The handle is only cleared once the node is
    /// known to be gone.
    async fn del_fail(&mut self) -> bool {
        let Some(path) = self.marker.clone() else {
            return true;
        };
        match self.inner.client.delete(&path, None).await {
            Ok(()) | Err(Error::NodeAbsent(_)) => {
                tracing::info!("Fail marker removed: {}", path);
                self.marker = None;
                true
            }
            Err(e) => {
                tracing::warn!("Cannot remove fail marker {}: {}", path, e);
                false
            }
        }
    }

    /// Mirrored threshold, or the sentinel when it does not parse.
    fn min_fail_threshold(&self) -> usize {
        let raw = self.inner.mirror.min_fail();
        match raw.trim().parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                let sentinel = self.inner.conf.min_fail_sentinel;
                tracing::warn!(
                    "{}",
                    Error::MalformedThreshold(format!("{} (using {})", raw, sentinel))
                );
                sentinel
            }
        }
    }

    /// One election round; always leaves a non-closed state at `Watching`.
    async fn fight_for_judge(&mut self) -> RoundOutcome {
        let outcome = self.judge_round().await;
        self.inner.state.transition(
            &[WatcherState::FightForJudge, WatcherState::SwitchMaster],
            WatcherState::Watching,
        );
        outcome
    }

    async fn judge_round(&mut self) -> RoundOutcome {
        let threshold = self.min_fail_threshold();
        let markers = self.inner.mirror.fail_count();
        if markers < threshold {
            tracing::info!("Judge, {} fail markers below threshold {}", markers, threshold);
            return RoundOutcome::NotEnoughFailures { markers, threshold };
        }

        let judge = self.inner.paths.judge.clone();
        match self
            .inner
            .client
            .create(&judge, &self.inner.judge_id, CreateMode::Ephemeral)
            .await
        {
            Ok(_) => tracing::info!("Judge lock acquired: {}", judge),
            Err(Error::NodeExists(_)) => return RoundOutcome::JudgeTaken,
            Err(e) => {
                tracing::warn!("Cannot create judge lock {}: {}", judge, e);
                return RoundOutcome::JudgeUnavailable;
            }
        }

        let outcome = self.switch_master().await;

        if let Err(e) = self.inner.client.delete(&judge, None).await {
            tracing::warn!("Cannot release judge lock {}: {}", judge, e);
        }
        outcome
    }

    /// Body of a round while holding the judge lock.
    async fn switch_master(&mut self) -> RoundOutcome {
        let master = self.inner.mirror.master();
        let servers = self.inner.mirror.servers();

        if !master.is_empty() && self.inner.probe.reachable(&master).await {
            tracing::info!("Judge, master {} reachable again", master);
            return RoundOutcome::MasterRecovered;
        }

        let mut new_master = None;
        for srv in servers.into_iter().filter(|s| *s != master) {
            if self.inner.probe.reachable(&srv).await {
                new_master = Some(srv);
                break;
            }
            tracing::info!("Judge, cannot connect server {}", srv);
        }
        let Some(new_master) = new_master else {
            tracing::warn!("Judge, no valid master found");
            return RoundOutcome::NoCandidate;
        };

        if !self
            .inner
            .state
            .transition(&[WatcherState::FightForJudge], WatcherState::SwitchMaster)
        {
            return RoundOutcome::Cancelled;
        }
        tracing::info!("Judge, set master {:?} -> {}", master, new_master);

        let master_path = &self.inner.paths.master;
        if let Err(e) = self.publish_master("").await {
            tracing::warn!("Cannot vacate master {}: {}", master_path, e);
        }
        if self.shutdown.sleep(self.inner.conf.vacate_settle()).await {
            return RoundOutcome::Cancelled;
        }

        let attempts = self.inner.conf.publish_attempts;
        for attempt in 1..=attempts {
            match self.publish_master(&new_master).await {
                Ok(()) => {
                    tracing::info!("Master switched to {}", new_master);
                    return RoundOutcome::Switched(new_master);
                }
                Err(e) => {
                    tracing::warn!("Cannot set master value [{}]: {}", attempt, e);
                    if attempt < attempts
                        && self.shutdown.sleep(self.inner.conf.publish_backoff()).await
                    {
                        return RoundOutcome::Cancelled;
                    }
                }
            }
        }
        tracing::error!("Cannot set master {} after {} attempts", new_master, attempts);
        RoundOutcome::PublishFailed(new_master)
    }

    /// Write the master value, creating the node on first publish.
    async fn publish_master(&self, value: &str) -> Result<()> {
        let path = &self.inner.paths.master;
        match self.inner.client.set(path, value, None).await {
            Err(Error::NodeAbsent(_)) => {
                match self
                    .inner
                    .client
                    .create(path, value, CreateMode::Persistent)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(Error::NodeExists(_)) => self.inner.client.set(path, value, None).await,
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }
}
