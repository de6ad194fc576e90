//! Frame sources, dataset splitting and the batch feeder.

mod feeder;
mod image_dir;
mod memory;
mod source;
mod split;

pub use feeder::*;
pub use image_dir::*;
pub use memory::*;
pub use source::*;
pub use split::*;
