pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod session;
pub mod trading;
pub mod transport;

pub use client::{CommandOutcome, DerivClient};
pub use config::AppConfig;
pub use connection::ConnectionManager;
pub use domain::{
    BarrierSpec, ConnectionState, Contract, ContractState, ContractType, DurationUnit, OrderSpec,
};
pub use error::{DerivError, Result};
pub use session::{RequestCorrelator, SubscriptionEvent, SubscriptionHandle, SubscriptionRegistry};
pub use trading::{CommandParams, OrderLifecycleManager};
