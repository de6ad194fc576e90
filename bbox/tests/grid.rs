use approx::assert_abs_diff_eq;
use bbox::{prelude::*, CyCxHW, TLBR};

#[test]
fn exact_cell_box_covers_one_cell() {
    let rect = TLBR::from_tlbr([8.0, 16.0, 16.0, 24.0]);
    let span = rect.grid_span(8.0, 4, 4);
    assert_eq!(span.rows, 1..2);
    assert_eq!(span.cols, 2..3);
    assert_eq!(span.cells().collect::<Vec<_>>(), vec![(1, 2)]);
}

#[test]
fn partial_overlap_covers_touched_cells() {
    let rect = TLBR::from_tlbr([1.0, 7.5, 9.0, 8.5]);
    let span = rect.grid_span(8.0, 4, 4);
    assert_eq!(span.rows, 0..2);
    assert_eq!(span.cols, 0..2);
    assert_eq!(span.cells().count(), 4);
}

#[test]
fn out_of_grid_parts_are_clipped() {
    let rect = TLBR::from_tlbr([-5.0, -5.0, 100.0, 3.0]);
    let span = rect.grid_span(2.0, 3, 3);
    assert_eq!(span.rows, 0..3);
    assert_eq!(span.cols, 0..2);

    let outside = TLBR::from_tlbr([10.0, 10.0, 12.0, 12.0]);
    assert!(outside.grid_span(2.0, 3, 3).is_empty());
}

#[test]
fn degenerated_box_covers_nothing() {
    let rect = TLBR::from_tlbr([4.0, 4.0, 4.0, 6.0]);
    assert!(rect.grid_span(2.0, 8, 8).is_empty());
}

#[test]
fn center_size_conversion() {
    let cycxhw = CyCxHW::from_cycxhw([0.5, 0.25, 0.5, 0.5]);
    let tlbr: TLBR<f64> = cycxhw.to_tlbr();
    let [t, l, b, r] = tlbr.tlbr();
    assert_abs_diff_eq!(t, 0.25);
    assert_abs_diff_eq!(l, 0.0);
    assert_abs_diff_eq!(b, 0.75);
    assert_abs_diff_eq!(r, 0.5);

    let pixels = cycxhw.to_pixel_tlbr(4.0, 8.0);
    assert_eq!(pixels.tlbr(), [1.0, 0.0, 3.0, 4.0]);
    assert!(CyCxHW::try_from_cycxhw([0.5, 0.5, -0.1, 0.2]).is_err());
}

#[test]
fn ratio_boxes_of_exact_cells_cover_one_cell() {
    let (height, width, cell) = (720.0, 1280.0, 8.0);
    let (grid_h, grid_w) = (90, 160);

    for row in 0..grid_h {
        for col in 0..grid_w {
            let cy = (cell * row as f64 + cell / 2.0) / height;
            let cx = (cell * col as f64 + cell / 2.0) / width;
            let rect = CyCxHW::from_cycxhw([cy, cx, cell / height, cell / width]);
            let span = rect.to_pixel_tlbr(height, width).grid_span(cell, grid_h, grid_w);
            assert_eq!(
                span.cells().collect::<Vec<_>>(),
                vec![(row, col)],
                "cell ({}, {})",
                row,
                col
            );
        }
    }
}

#[test]
fn edges_near_boundaries_snap() {
    let rect = TLBR::from_tlbr([8.0 - 1e-9, 16.0 + 1e-9, 16.0 + 1e-9, 24.0 - 1e-9]);
    assert_eq!(rect.grid_span(8.0, 4, 4).cells().collect::<Vec<_>>(), vec![(1, 2)]);

    let rect = TLBR::from_tlbr([7.9, 16.0, 16.0, 24.1]);
    let span = rect.grid_span(8.0, 4, 4);
    assert_eq!(span.rows, 0..2);
    assert_eq!(span.cols, 2..4);
}
