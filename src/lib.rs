//! Swivel - Proxy Pool Manager
//!
//! A proxy pool manager that owns a durable catalog of outbound HTTP proxies
//! and hands one proxy at a time to a caller for short-lived use, rotating
//! the underlying exit IP when policy permits.
//!
//! ## Features
//!
//! - Heterogeneous proxy kinds: static credentials, vendor-rotating APIs
//!   (TMProxy, KiotProxy, IPv4Xoay), mobile-hop reset endpoints, and sticky
//!   session templates
//! - Durable per-entry state in SQLite, keyed by fingerprint so reloading a
//!   proxy list is idempotent
//! - Per-entry minimum rotation interval and a per-pool usage cap
//! - Quarantine of entries whose rotation failed, until explicitly cleared
//! - Optional per-entry loopback forwarders that dial static assets directly
//!   and everything else through the assigned upstream
//!
//! ## Example
//!
//! ```no_run
//! use swivel::{PoolSettings, ProxyPool, StoreConfig};
//!
//! # async fn run() -> swivel::Result<()> {
//! let pool = ProxyPool::open(&StoreConfig::default()).await?;
//! pool.configure(PoolSettings {
//!     proxy_strings: vec!["static|1.2.3.4:8080:user:pass".to_string()],
//!     max_used: 5,
//!     ..PoolSettings::default()
//! })
//! .await?;
//!
//! let lease = pool.acquire().await?;
//! // ... use lease.credential ...
//! pool.release(lease.id).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod forwarder;
pub mod models;
pub mod pool;
pub mod repository;
pub mod vendor;

pub use config::{PoolSettings, StoreConfig};
pub use database::Database;
pub use error::{Result, SwivelError};
pub use models::{ProxyEntry, ProxyErrorInfo, ProxyKind, ProxyLease};
pub use pool::ProxyPool;
