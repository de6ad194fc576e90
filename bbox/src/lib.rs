//! Safe bounding box types and functions.

mod common;

pub use rect::*;
pub mod rect;

pub use tlbr::*;
pub mod tlbr;

pub use cycxhw::*;
pub mod cycxhw;

pub use grid::*;
pub mod grid;

pub mod prelude {
    pub use crate::{
        grid::RectGrid,
        rect::{Rect, RectFloat, RectNum},
    };
}
