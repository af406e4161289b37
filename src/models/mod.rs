pub mod contract;
pub mod trade;

pub use contract::*;
pub use trade::*;
