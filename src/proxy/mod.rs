//! TCP relay in front of the published master
//!
//! Each accepted client is forwarded to whatever address the mirror holds at
//! connect time. Connections already established keep their backend across a
//! switch; new ones follow the new master.

pub mod relay;

pub use relay::ProxyServer;
