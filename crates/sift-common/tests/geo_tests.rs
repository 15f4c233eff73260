//! Tests for geotransforms, tile grids and level shapes working together.

use sift_common::{BoundingBox, GeoTransform, PixelWindow, RasterShape, TileCoord, TileGrid};

// ============================================================================
// Level footprints
// ============================================================================

#[test]
fn test_level_footprint_covers_level_zero() {
    let gt = GeoTransform::north_up(100.0, 500.0, 1.0, "EPSG:3857");
    let base = RasterShape::new(7, 9);
    let base_extent = gt.footprint(base.rows, base.cols);

    for level in 1..5 {
        let factor = 2f64.powi(level as i32);
        let shape = base.at_level(2, level);
        let extent = gt.scaled(factor).footprint(shape.rows, shape.cols);
        assert!(extent.min_x <= base_extent.min_x);
        assert!(extent.max_x >= base_extent.max_x);
        assert!(extent.min_y <= base_extent.min_y);
        assert!(extent.max_y >= base_extent.max_y);
    }
}

#[test]
fn test_window_subtransform_origin() {
    let gt = GeoTransform::north_up(0.0, 100.0, 2.0, "EPSG:4326");
    let window = PixelWindow::new(3, 4, 2, 2);
    let sub = gt.for_window(&window);
    assert_eq!(sub.origin_x, 8.0);
    assert_eq!(sub.origin_y, 94.0);
    assert_eq!(sub.pixel_width, 2.0);
}

// ============================================================================
// Viewport to tiles
// ============================================================================

#[test]
fn test_bbox_to_tiles() {
    // 100x100 raster with 1-unit pixels, tiles of 32x32
    let gt = GeoTransform::north_up(0.0, 100.0, 1.0, "EPSG:4326");
    let grid = TileGrid::new(32, 32);
    let viewport = BoundingBox::new(10.0, 60.0, 40.0, 90.0);

    let window = gt.window_for_bbox(&viewport, 100, 100).unwrap();
    assert_eq!(window, PixelWindow::new(10, 10, 30, 30));

    let tiles = grid.tiles_covering(0, &window);
    assert_eq!(tiles.len(), 4);
    assert!(tiles.contains(&TileCoord::new(0, 0, 0)));
    assert!(tiles.contains(&TileCoord::new(0, 1, 1)));
}

#[test]
fn test_bbox_parse_rejects_inverted() {
    assert!("10,10,5,5".parse::<BoundingBox>().is_err());
    assert!("1,2,3".parse::<BoundingBox>().is_err());
    assert!("a,b,c,d".parse::<BoundingBox>().is_err());
}
