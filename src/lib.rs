//! ShellCache - offline-capable request-interception cache
//!
//! Installs a versioned application shell into a cache namespace, answers
//! intercepted requests from it while the origin is unreachable, and hands
//! control over to newer versions without mixing their entries.

pub mod config;
pub mod gateway;
pub mod http;
pub mod ipc;
pub mod store;

pub use config::{ConfigError, DaemonConfig, GatewayConfig};
pub use gateway::{CacheGateway, FetchOutcome, Registration};
pub use http::{HttpNetwork, Network, Request, Response};
pub use store::{CacheStore, DiskStore, MemoryStore};
