pub mod account;
pub mod action;
pub mod order;
pub mod trade;

pub use account::*;
pub use action::*;
pub use order::*;
pub use trade::*;
