//! Bounded command admission
//!
//! - `CommandQueue` - parallel lane for reads, serial lane for writes

mod command_queue;

pub use command_queue::*;
