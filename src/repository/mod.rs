//! Catalog access layer

mod proxy;

pub use proxy::ProxyRepository;
