pub mod agents;

pub use agents::*;
