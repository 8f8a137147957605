//! Type definitions

pub mod batch;
pub mod geocode;
pub mod messages;

pub use batch::*;
pub use geocode::*;
pub use messages::*;
