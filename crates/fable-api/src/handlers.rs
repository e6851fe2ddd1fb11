//! Request handlers.

pub mod generations;
pub mod health;

pub use generations::*;
pub use health::*;
