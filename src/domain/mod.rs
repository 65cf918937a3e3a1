pub(crate) mod de;
pub mod market;
pub mod order;
pub mod state;

pub use market::*;
pub use order::*;
pub use state::*;
