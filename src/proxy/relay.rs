//! Relay server

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::common::shutdown::Shutdown;
use crate::common::Result;
use crate::watcher::Mirror;

pub struct ProxyServer {
    listener: TcpListener,
    mirror: Arc<Mirror>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, mirror: Arc<Mirror>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, mirror })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shutdown, then abort every in-flight connection.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!("Relay listening on {}", addr);
        let mut conns = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = shutdown.wait() => break,
                Some(done) = conns.join_next(), if !conns.is_empty() => {
                    if let Err(e) = done {
                        tracing::warn!("Relay connection task failed: {}", e);
                    }
                    continue;
                }
            };
            match accepted {
                Ok((client, peer)) => {
                    let id: u32 = rand::random();
                    tracing::debug!("[{:08x}] Accept {}", id, peer);
                    let master = self.mirror.master();
                    conns.spawn(relay(id, client, master));
                }
                Err(e) => tracing::warn!("Relay accept error: {}", e),
            }
        }

        if !conns.is_empty() {
            tracing::info!("Relay closing {} connections", conns.len());
        }
        conns.shutdown().await;
        tracing::info!("Relay on {} stopped", addr);
        Ok(())
    }
}

async fn relay(id: u32, mut client: TcpStream, master: String) {
    if master.is_empty() {
        tracing::warn!("[{:08x}] No master published, closing client", id);
        let _ = client.shutdown().await;
        return;
    }
    let mut backend = match TcpStream::connect(&master).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("[{:08x}] Cannot connect master {}: {}", id, master, e);
            let _ = client.shutdown().await;
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((up, down)) => {
            tracing::debug!("[{:08x}] Closed {}: {} bytes up, {} bytes down", id, master, up, down)
        }
        Err(e) => tracing::debug!("[{:08x}] Relay to {} ended: {}", id, master, e),
    }
}
