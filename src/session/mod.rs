//! Request correlation and streaming subscriptions on one connection

pub mod correlator;
pub mod registry;

pub use correlator::{RequestCorrelator, ResponseHandle};
pub use registry::{SubscriptionEvent, SubscriptionHandle, SubscriptionRegistry};
