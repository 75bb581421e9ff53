//! Utility functions for zkswitch

use std::net::UdpSocket;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Resolve a relative coordination path under `root`.
///
/// `join_path("/app", "/master") == "/app/master"`; a trailing slash on the
/// root is dropped so paths never contain `//`.
pub fn join_path(root: &str, relative: &str) -> String {
    let root = root.trim_end_matches('/');
    if relative.starts_with('/') {
        format!("{}{}", root, relative)
    } else {
        format!("{}/{}", root, relative)
    }
}

/// Parent of a coordination path (`"/"` for top-level nodes).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Identity written into judge locks and fail markers.
///
/// `<unix-ts>,<pid>,<local-addr>` where the local address is the interface
/// used to reach `peer` (no packet is sent). Falls back to `unknown-addr`.
pub fn judge_id(peer: Option<&str>) -> String {
    let addr = peer
        .and_then(local_addr_towards)
        .unwrap_or_else(|| "unknown-addr".to_string());
    format!("{},{},{}", timestamp_now(), std::process::id(), addr)
}

fn local_addr_towards(peer: &str) -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(peer).ok()?;
    socket.local_addr().ok().map(|a| a.ip().to_string())
}
