//! Misc utilities.

mod checkpoint;
mod file;
mod lr_scheduler;
mod rate_counter;

pub use checkpoint::*;
pub use file::*;
pub use lr_scheduler::*;
pub use rate_counter::*;
