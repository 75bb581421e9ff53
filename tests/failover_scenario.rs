//! End-to-end failover on the in-memory coordination service

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use zkswitch::common::WatcherConfig;
use zkswitch::coord::{
    Coordination, CoordinationPaths, CreateMode, MemoryCoordination, MemorySession, TreeEvent,
    Watch,
};
use zkswitch::Result;
use zkswitch::watcher::{Probe, Watcher, WatcherState};

struct StaticProbe(HashSet<String>);

#[async_trait]
impl Probe for StaticProbe {
    async fn reachable(&self, addr: &str) -> bool {
        self.0.contains(addr)
    }
}

/// Session whose reads take a while to come back, like a busy ensemble.
struct SlowReads {
    session: MemorySession,
    delay: Duration,
}

#[async_trait]
impl Coordination for SlowReads {
    async fn get_watch(&self, path: &str) -> Result<(String, Watch)> {
        tokio::time::sleep(self.delay).await;
        self.session.get_watch(path).await
    }
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        tokio::time::sleep(self.delay).await;
        self.session.children_watch(path).await
    }
    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> Result<String> {
        self.session.create(path, value, mode).await
    }
    async fn set(&self, path: &str, value: &str, version: Option<i32>) -> Result<()> {
        self.session.set(path, value, version).await
    }
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.session.delete(path, version).await
    }
    async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}

fn markers_created(store: &MemoryCoordination, paths: &CoordinationPaths) -> usize {
    let prefix = paths.fail_marker_prefix();
    store
        .events()
        .iter()
        .filter(|e| matches!(e, TreeEvent::Created(p) if p.starts_with(&prefix)))
        .count()
}

fn judge_created(store: &MemoryCoordination, paths: &CoordinationPaths) -> bool {
    store
        .events()
        .contains(&TreeEvent::Created(paths.judge.clone()))
}

fn probe(up: &[&str]) -> Arc<StaticProbe> {
    Arc::new(StaticProbe(up.iter().map(|s| s.to_string()).collect()))
}

fn fast() -> WatcherConfig {
    WatcherConfig {
        check_interval_ms: 10,
        settle_ms: 20,
        vacate_settle_ms: 20,
        publish_backoff_ms: 10,
        mirror_retry_ms: 20,
        ..Default::default()
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn cluster(min_fail: &str) -> (MemoryCoordination, CoordinationPaths) {
    let paths = CoordinationPaths::default();
    let store = MemoryCoordination::new();
    store.put(&paths.master, "10.0.0.1:80");
    store.put(&paths.min_fail, min_fail);
    store.ensure_path(&paths.fail);
    for srv in ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"] {
        store.ensure_path(&format!("{}/{}", paths.servers, srv));
    }
    (store, paths)
}

#[tokio::test]
async fn test_master_moves_to_reachable_server() {
    let (store, paths) = cluster("3").await;

    // Two other watchers already gave up on the master.
    let others = store.session();
    for _ in 0..2 {
        others
            .create(&paths.fail_marker_prefix(), "peer", CreateMode::EphemeralSequential)
            .await
            .unwrap();
    }

    let watcher = Watcher::new(
        Arc::new(store.session()),
        paths.clone(),
        fast(),
        probe(&["10.0.0.2:80"]),
        "judge-a".into(),
    );
    watcher.start();

    eventually("master switch", || {
        store.get(&paths.master).as_deref() == Some("10.0.0.2:80")
    })
    .await;
    assert_eq!(
        store.writes(&paths.master),
        vec!["10.0.0.1:80", "", "10.0.0.2:80"]
    );

    // The new master answers, so our marker is withdrawn.
    eventually("marker removal", || store.children(&paths.fail).len() == 2).await;
    eventually("watching", || watcher.state() == WatcherState::Watching).await;
    let history = watcher.state_history();
    assert!(history.contains(&WatcherState::FightForJudge));
    assert!(history.contains(&WatcherState::SwitchMaster));
    assert!(!store.exists(&paths.judge));

    watcher.shutdown().await.unwrap();
    assert_eq!(watcher.state(), WatcherState::Closed);
}

#[tokio::test]
async fn test_healthy_master_raises_nothing() {
    let (store, paths) = cluster("1").await;
    let watcher = Watcher::new(
        Arc::new(store.session()),
        paths.clone(),
        fast(),
        probe(&["10.0.0.1:80", "10.0.0.2:80"]),
        "judge-a".into(),
    );
    watcher.start();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(markers_created(&store, &paths), 0);
    assert!(!judge_created(&store, &paths));
    assert_eq!(store.writes(&paths.master), vec!["10.0.0.1:80"]);
    assert_eq!(watcher.state(), WatcherState::Watching);

    watcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cold_start_with_slow_reads_raises_nothing() {
    let (store, paths) = cluster("3").await;
    let watchers: Vec<Watcher> = (0..3)
        .map(|i| {
            Watcher::new(
                Arc::new(SlowReads {
                    session: store.session(),
                    delay: Duration::from_millis(30),
                }),
                paths.clone(),
                fast(),
                probe(&["10.0.0.1:80"]),
                format!("judge-{}", i),
            )
        })
        .collect();
    for w in &watchers {
        w.start();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    for w in &watchers {
        assert!(w.mirror().master_loaded());
        w.shutdown().await.unwrap();
    }
    assert_eq!(markers_created(&store, &paths), 0);
    assert!(!judge_created(&store, &paths));
    assert_eq!(store.writes(&paths.master), vec!["10.0.0.1:80"]);
}

#[tokio::test]
async fn test_malformed_threshold_never_elects() {
    let (store, paths) = cluster("abc").await;
    let watcher = Watcher::new(
        Arc::new(store.session()),
        paths.clone(),
        fast(),
        probe(&["10.0.0.2:80"]),
        "judge-a".into(),
    );
    watcher.start();

    eventually("fail marker", || store.children(&paths.fail).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!judge_created(&store, &paths));
    assert_eq!(store.writes(&paths.master), vec!["10.0.0.1:80"]);

    watcher.shutdown().await.unwrap();
    // Shutdown withdraws the marker.
    assert!(store.children(&paths.fail).is_empty());
}

#[tokio::test]
async fn test_vacated_master_is_refilled() {
    let (store, paths) = cluster("1").await;
    store.put(&paths.master, "");
    let watcher = Watcher::new(
        Arc::new(store.session()),
        paths.clone(),
        fast(),
        probe(&["10.0.0.3:80"]),
        "judge-a".into(),
    );
    watcher.start();

    eventually("master published", || {
        store.get(&paths.master).as_deref() == Some("10.0.0.3:80")
    })
    .await;

    watcher.shutdown().await.unwrap();
}
