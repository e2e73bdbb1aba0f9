//! Pixel-space crop of a [`Page`] for a single [`LayoutRegion`], with
//! optional polygon mask compositing.

use pageread_core::{BBox, Page, Point};

use crate::error::{Error, Result};

/// Crops `page` to `bbox` (already converted from `[0,1000]` normalized
/// space to page pixel space by the caller). When `polygon` is
/// non-empty, pixels outside the polygon are set to white so the
/// recognizer only sees the region's own content.
pub fn crop_region(page: &Page, bbox: &BBox, polygon: &[Point]) -> Result<Page> {
    let page_w = page.width() as f32;
    let page_h = page.height() as f32;
    let x1 = bbox.x1.max(0.0).min(page_w) as u32;
    let y1 = bbox.y1.max(0.0).min(page_h) as u32;
    let x2 = bbox.x2.max(0.0).min(page_w).ceil() as u32;
    let y2 = bbox.y2.max(0.0).min(page_h).ceil() as u32;

    if x2 <= x1 || y2 <= y1 {
        return Err(Error::PageRender { page: 0, reason: "degenerate crop box".to_string() });
    }

    let crop_w = (x2 - x1) as usize;
    let crop_h = (y2 - y1) as usize;
    let src = page.rgb();
    let src_w = page.width() as usize;
    let mut out = vec![255u8; crop_w * crop_h * 3];

    for row in 0..crop_h {
        let src_y = y1 as usize + row;
        let src_row_start = (src_y * src_w + x1 as usize) * 3;
        let dst_row_start = row * crop_w * 3;
        out[dst_row_start..dst_row_start + crop_w * 3]
            .copy_from_slice(&src[src_row_start..src_row_start + crop_w * 3]);
    }

    if !polygon.is_empty() {
        mask_outside_polygon(&mut out, crop_w, crop_h, polygon, x1 as f32, y1 as f32);
    }

    Ok(Page::new(crop_w as u32, crop_h as u32, out))
}

/// Sets every pixel whose center falls outside `polygon` (translated
/// into crop-local coordinates) to white, via the standard even-odd
/// ray-casting point-in-polygon test.
fn mask_outside_polygon(rgb: &mut [u8], width: usize, height: usize, polygon: &[Point], origin_x: f32, origin_y: f32) {
    let local: Vec<Point> = polygon
        .iter()
        .map(|p| Point { x: p.x - origin_x, y: p.y - origin_y })
        .collect();
    for y in 0..height {
        for x in 0..width {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            if !point_in_polygon(px, py, &local) {
                let idx = (y * width + x) * 3;
                rgb[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
    }
}

fn point_in_polygon(x: f32, y: f32, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return true;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].x, polygon[i].y);
        let (xj, yj) = (polygon[j].x, polygon[j].y);
        if (yi > y) != (yj > y) {
            let intersect_x = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < intersect_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_page(width: u32, height: u32, color: [u8; 3]) -> Page {
        let mut data = vec![0u8; (width * height * 3) as usize];
        for chunk in data.chunks_mut(3) {
            chunk.copy_from_slice(&color);
        }
        Page::new(width, height, data)
    }

    #[test]
    fn crop_region_extracts_expected_subrectangle() {
        let page = solid_page(10, 10, [5, 5, 5]);
        let bbox = BBox { x1: 2.0, y1: 2.0, x2: 6.0, y2: 5.0 };
        let cropped = crop_region(&page, &bbox, &[]).unwrap();
        assert_eq!(cropped.width(), 4);
        assert_eq!(cropped.height(), 3);
        assert!(cropped.rgb().iter().all(|b| *b == 5));
    }

    #[test]
    fn crop_region_rejects_degenerate_box() {
        let page = solid_page(10, 10, [0, 0, 0]);
        let bbox = BBox { x1: 5.0, y1: 5.0, x2: 5.0, y2: 5.0 };
        assert!(crop_region(&page, &bbox, &[]).is_err());
    }

    #[test]
    fn polygon_mask_whites_out_corners() {
        let page = solid_page(4, 4, [0, 0, 0]);
        let bbox = BBox { x1: 0.0, y1: 0.0, x2: 4.0, y2: 4.0 };
        // a diamond inscribed in the 4x4 box
        let polygon = vec![
            Point { x: 2.0, y: 0.0 },
            Point { x: 4.0, y: 2.0 },
            Point { x: 2.0, y: 4.0 },
            Point { x: 0.0, y: 2.0 },
        ];
        let cropped = crop_region(&page, &bbox, &polygon).unwrap();
        let top_left = &cropped.rgb()[0..3];
        assert_eq!(top_left, &[255, 255, 255]);
    }
}
