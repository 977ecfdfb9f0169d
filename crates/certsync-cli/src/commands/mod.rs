pub mod common;
pub mod discard;
pub mod drain;
pub mod queue;
pub mod status;
