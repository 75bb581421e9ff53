//! Relay follows a failover driven by real TCP probes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use zkswitch::common::{shutdown, WatcherConfig};
use zkswitch::coord::{CoordinationPaths, MemoryCoordination};
use zkswitch::watcher::{TcpProbe, Watcher};
use zkswitch::ProxyServer;

async fn echo_backend(tag: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if sock.write_all(tag).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn ask(relay: SocketAddr) -> Vec<u8> {
    let mut conn = TcpStream::connect(relay).await.unwrap();
    conn.write_all(b"?").await.unwrap();
    let mut buf = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(2), conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.to_vec()
}

#[tokio::test]
async fn test_relay_switches_backend() {
    let dead = dead_addr().await;
    let live = echo_backend(b"B").await;

    let paths = CoordinationPaths::default();
    let store = MemoryCoordination::new();
    store.put(&paths.master, &dead.to_string());
    store.put(&paths.min_fail, "1");
    store.ensure_path(&paths.fail);
    store.ensure_path(&format!("{}/{}", paths.servers, dead));
    store.ensure_path(&format!("{}/{}", paths.servers, live));

    let conf = WatcherConfig {
        check_interval_ms: 20,
        probe_timeout_ms: 200,
        settle_ms: 20,
        vacate_settle_ms: 20,
        mirror_retry_ms: 20,
        ..Default::default()
    };
    let watcher = Watcher::new(
        Arc::new(store.session()),
        paths.clone(),
        conf.clone(),
        Arc::new(TcpProbe::new(conf.probe_timeout())),
        "judge-relay".into(),
    );
    let relay = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), watcher.mirror())
        .await
        .unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let (trigger, listener) = shutdown::channel();
    let relay_task = tokio::spawn(relay.run(listener));
    watcher.start();

    let mirror = watcher.mirror();
    let mut rx = mirror.subscribe_master();
    let live_str = live.to_string();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|m| *m == live_str))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(ask(relay_addr).await, b"B");
    assert_eq!(store.get(&paths.master), Some(live.to_string()));

    trigger.trigger();
    tokio_test::assert_ok!(relay_task.await.unwrap());
    watcher.shutdown().await.unwrap();
}
