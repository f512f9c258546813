//! Data model for the proxy catalog

mod proxy;
mod spec;

pub use proxy::{
    fingerprint, materialize_template, ProxyEntry, ProxyErrorInfo, ProxyKind, ProxyLease,
    UpstreamAddr,
};
pub use spec::{parse_proxy_line, ProxySpec};
