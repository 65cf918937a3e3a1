//! Connection lifecycle: open, authorize, keep alive, reconnect

pub mod backoff;
pub mod link;
pub mod manager;

pub use backoff::ExponentialBackoff;
pub use link::ConnectionLink;
pub use manager::ConnectionManager;
