use crate::{common::*, rect::RectFloat};

/// The rows and columns of a cell grid covered by a rectangle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GridSpan {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl GridSpan {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.cols.is_empty()
    }

    /// Iterates over covered `(row, col)` pairs in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows
            .clone()
            .flat_map(move |row| self.cols.clone().map(move |col| (row, col)))
    }
}

/// The distance in cells below which a box edge is snapped to a cell boundary.
pub const SNAP_TOLERANCE: f64 = 1e-6;

pub trait RectGrid: RectFloat
where
    Self::Type: Float,
{
    /// Finds the cells of a `grid_h` x `grid_w` grid of square `cell_size` cells that share
    /// a positive-area overlap with the rectangle.
    ///
    /// The rectangle is expected in the same unit as `cell_size`. Parts outside of the
    /// grid are ignored. Edges within [SNAP_TOLERANCE] cells of a cell boundary are
    /// snapped onto it, so that a box converted from ratio units still covers exactly the
    /// cells it was built from.
    fn grid_span(&self, cell_size: Self::Type, grid_h: usize, grid_w: usize) -> GridSpan {
        let zero = Self::Type::zero();
        debug_assert!(cell_size > zero, "cell_size must be positive");
        let tolerance: Self::Type = NumCast::from(SNAP_TOLERANCE).unwrap_or(zero);

        let snap = |value: Self::Type| -> Self::Type {
            let cells = value / cell_size;
            let nearest = cells.round();
            if (cells - nearest).abs() < tolerance {
                nearest
            } else {
                cells
            }
        };
        let lower = |value: Self::Type, limit: usize| -> usize {
            snap(value)
                .floor()
                .max(zero)
                .to_usize()
                .unwrap_or(0)
                .min(limit)
        };
        let upper = |value: Self::Type, limit: usize| -> usize {
            snap(value)
                .ceil()
                .max(zero)
                .to_usize()
                .unwrap_or(0)
                .min(limit)
        };

        // degenerated boxes cover nothing
        if !(self.b() > self.t() && self.r() > self.l()) {
            return GridSpan {
                rows: 0..0,
                cols: 0..0,
            };
        }

        GridSpan {
            rows: lower(self.t(), grid_h)..upper(self.b(), grid_h),
            cols: lower(self.l(), grid_w)..upper(self.r(), grid_w),
        }
    }
}

impl<R> RectGrid for R
where
    R: RectFloat,
    R::Type: Float,
{
}
