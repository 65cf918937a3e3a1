//! Trading workflows on top of the correlated session

pub mod catalog;
pub mod command;
pub mod lifecycle;

pub use catalog::MarketCatalog;
pub use command::{CommandParams, TradeCommand};
pub use lifecycle::OrderLifecycleManager;
