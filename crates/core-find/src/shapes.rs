//! Contour extraction and shape comparison.
//!
//! Contours come out of a binary raster (see [`crate::raster::binarize`]) and
//! are compared through the seven Hu moment invariants, which are invariant
//! under translation, scale, and rotation. The three distance methods mirror
//! the classic shape-matching formulations over log-scaled invariants.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::approximate_polygon_dp;
use imageproc::point::Point;

/// One extracted contour as an approximated closed polygon.
pub type ContourPoints = Vec<Point<i32>>;

/// Extract contours from a binary image.
///
/// `retrieval` follows the configured enumeration: 1 keeps only top-level
/// outer borders, anything else keeps the full list (the two-level and tree
/// modes differ only in hierarchy bookkeeping, which no consumer here reads).
/// `approx` selects point-chain approximation: 1 keeps the raw chain, the
/// other modes collapse it with a Douglas-Peucker pass.
pub fn extract_contours(binary: &GrayImage, retrieval: i64, approx: i64) -> Vec<ContourPoints> {
    let contours = find_contours::<i32>(binary);
    let mut result = Vec::new();
    for contour in contours {
        if retrieval == 1 && !(contour.border_type == BorderType::Outer && contour.parent.is_none())
        {
            continue;
        }
        if contour.points.len() < 3 {
            continue;
        }
        let points = if approx == 1 {
            contour.points
        } else {
            let approximated = approximate_polygon_dp(&contour.points, 3.0, true);
            if approximated.len() < 3 {
                contour.points
            } else {
                approximated
            }
        };
        result.push(points);
    }
    result
}

/// Axis-aligned bounding rectangle of a point set.
pub fn bounding_rect(points: &[Point<i32>]) -> (i32, i32, u32, u32) {
    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    if min_x > max_x {
        return (0, 0, 0, 0);
    }
    (
        min_x,
        min_y,
        (max_x - min_x + 1) as u32,
        (max_y - min_y + 1) as u32,
    )
}

/// Bounding rectangle of several contours taken together.
pub fn bounding_rect_of_all(contours: &[&ContourPoints]) -> (i32, i32, u32, u32) {
    let merged: Vec<Point<i32>> = contours.iter().flat_map(|c| c.iter().copied()).collect();
    bounding_rect(&merged)
}

/// Polygon moments up to third order computed with Green's theorem over the
/// closed point chain, the same construction classical contour moments use.
#[derive(Debug, Clone, Copy, Default)]
pub struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
    pub m20: f64,
    pub m11: f64,
    pub m02: f64,
    pub m30: f64,
    pub m21: f64,
    pub m12: f64,
    pub m03: f64,
}

pub fn polygon_moments(points: &[Point<i32>]) -> Moments {
    let n = points.len();
    if n < 3 {
        return Moments::default();
    }
    let (mut a00, mut a10, mut a01) = (0.0f64, 0.0f64, 0.0f64);
    let (mut a20, mut a11, mut a02) = (0.0f64, 0.0f64, 0.0f64);
    let (mut a30, mut a21, mut a12, mut a03) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);

    let mut prev = points[n - 1];
    for &p in points {
        let (xi_1, yi_1) = (prev.x as f64, prev.y as f64);
        let (xi, yi) = (p.x as f64, p.y as f64);
        let dxy = xi_1 * yi - xi * yi_1;
        a00 += dxy;
        a10 += dxy * (xi_1 + xi);
        a01 += dxy * (yi_1 + yi);
        a20 += dxy * (xi_1 * xi_1 + xi * xi_1 + xi * xi);
        a11 += dxy * (xi_1 * (yi + 2.0 * yi_1) + xi * (2.0 * yi + yi_1));
        a02 += dxy * (yi_1 * yi_1 + yi * yi_1 + yi * yi);
        a30 += dxy * (xi_1 + xi) * (xi_1 * xi_1 + xi * xi);
        a03 += dxy * (yi_1 + yi) * (yi_1 * yi_1 + yi * yi);
        a21 += dxy
            * (xi_1 * xi_1 * (3.0 * yi_1 + yi)
                + 2.0 * xi * xi_1 * (yi_1 + yi)
                + xi * xi * (yi_1 + 3.0 * yi));
        a12 += dxy
            * (yi_1 * yi_1 * (3.0 * xi_1 + xi)
                + 2.0 * yi * yi_1 * (xi_1 + xi)
                + yi * yi * (xi_1 + 3.0 * xi));
        prev = p;
    }

    // orient all moments to a positive area
    let sign = if a00 < 0.0 { -1.0 } else { 1.0 };
    Moments {
        m00: sign * a00 / 2.0,
        m10: sign * a10 / 6.0,
        m01: sign * a01 / 6.0,
        m20: sign * a20 / 12.0,
        m11: sign * a11 / 24.0,
        m02: sign * a02 / 12.0,
        m30: sign * a30 / 20.0,
        m21: sign * a21 / 60.0,
        m12: sign * a12 / 60.0,
        m03: sign * a03 / 20.0,
    }
}

/// Contour area (absolute polygon area).
pub fn contour_area(points: &[Point<i32>]) -> f64 {
    polygon_moments(points).m00.abs()
}

/// The seven Hu invariants of a contour.
pub fn hu_moments(points: &[Point<i32>]) -> [f64; 7] {
    let m = polygon_moments(points);
    if m.m00.abs() < f64::EPSILON {
        return [0.0; 7];
    }
    let xc = m.m10 / m.m00;
    let yc = m.m01 / m.m00;

    let mu20 = m.m20 - xc * m.m10;
    let mu11 = m.m11 - xc * m.m01;
    let mu02 = m.m02 - yc * m.m01;
    let mu30 = m.m30 - 3.0 * xc * m.m20 + 2.0 * xc * xc * m.m10;
    let mu21 = m.m21 - 2.0 * xc * m.m11 - yc * m.m20 + 2.0 * xc * xc * m.m01;
    let mu12 = m.m12 - 2.0 * yc * m.m11 - xc * m.m02 + 2.0 * yc * yc * m.m10;
    let mu03 = m.m03 - 3.0 * yc * m.m02 + 2.0 * yc * yc * m.m01;

    let inv2 = 1.0 / m.m00.powi(2);
    let inv25 = 1.0 / m.m00.powf(2.5);
    let n20 = mu20 * inv2;
    let n11 = mu11 * inv2;
    let n02 = mu02 * inv2;
    let n30 = mu30 * inv25;
    let n21 = mu21 * inv25;
    let n12 = mu12 * inv25;
    let n03 = mu03 * inv25;

    [
        n20 + n02,
        (n20 - n02).powi(2) + 4.0 * n11 * n11,
        (n30 - 3.0 * n12).powi(2) + (3.0 * n21 - n03).powi(2),
        (n30 + n12).powi(2) + (n21 + n03).powi(2),
        (n30 - 3.0 * n12) * (n30 + n12) * ((n30 + n12).powi(2) - 3.0 * (n21 + n03).powi(2))
            + (3.0 * n21 - n03) * (n21 + n03) * (3.0 * (n30 + n12).powi(2) - (n21 + n03).powi(2)),
        (n20 - n02) * ((n30 + n12).powi(2) - (n21 + n03).powi(2))
            + 4.0 * n11 * (n30 + n12) * (n21 + n03),
        (3.0 * n21 - n03) * (n30 + n12) * ((n30 + n12).powi(2) - 3.0 * (n21 + n03).powi(2))
            - (n30 - 3.0 * n12) * (n21 + n03) * (3.0 * (n30 + n12).powi(2) - (n21 + n03).powi(2)),
    ]
}

/// Shape distance between two contours over log-scaled Hu invariants.
/// `method` selects the formulation: 1 compares inverses, 2 absolute
/// differences, 3 the maximal relative difference. Lower is more similar;
/// identical shapes score 0.
pub fn match_shapes(a: &[Point<i32>], b: &[Point<i32>], method: i64) -> f64 {
    let hu_a = hu_moments(a);
    let hu_b = hu_moments(b);
    let eps = 1e-5;
    let mut result: f64 = 0.0;
    for i in 0..7 {
        let (ha, hb) = (hu_a[i], hu_b[i]);
        if ha.abs() <= eps || hb.abs() <= eps {
            continue;
        }
        let ma = ha.signum() * ha.abs().log10();
        let mb = hb.signum() * hb.abs().log10();
        match method {
            1 => result += (1.0 / ma - 1.0 / mb).abs(),
            2 => result += (ma - mb).abs(),
            _ => result = result.max((ma - mb).abs() / ma.abs()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn filled_rect(canvas: &mut GrayImage, x: u32, y: u32, w: u32, h: u32) {
        for yy in y..y + h {
            for xx in x..x + w {
                canvas.put_pixel(xx, yy, Luma([255]));
            }
        }
    }

    fn rect_points(x: i32, y: i32, w: i32, h: i32) -> ContourPoints {
        vec![
            Point::new(x, y),
            Point::new(x + w, y),
            Point::new(x + w, y + h),
            Point::new(x, y + h),
        ]
    }

    #[test]
    fn rectangle_area_matches_geometry() {
        let rect = rect_points(0, 0, 10, 4);
        assert!((contour_area(&rect) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn contours_found_for_distinct_blobs() {
        let mut img = GrayImage::new(64, 64);
        filled_rect(&mut img, 5, 5, 10, 10);
        filled_rect(&mut img, 40, 40, 12, 8);
        let external = extract_contours(&img, 1, 2);
        assert_eq!(external.len(), 2);
        // full list includes inner borders as well, never fewer
        let list = extract_contours(&img, 2, 2);
        assert!(list.len() >= external.len());
    }

    #[test]
    fn hu_invariants_are_scale_invariant() {
        let small = rect_points(0, 0, 10, 5);
        let large = rect_points(100, 50, 40, 20);
        let distance = match_shapes(&small, &large, 1);
        assert!(
            distance < 0.05,
            "same aspect rectangles should be near-identical, got {distance}"
        );
    }

    #[test]
    fn different_shapes_are_farther_than_identical_ones() {
        let square = rect_points(0, 0, 10, 10);
        let bar = rect_points(0, 0, 50, 3);
        let same = match_shapes(&square, &square, 1);
        let different = match_shapes(&square, &bar, 1);
        assert!(same <= 1e-9);
        assert!(different > same);
    }

    #[test]
    fn all_three_methods_are_zero_for_identical_shapes() {
        let square = rect_points(3, 7, 12, 12);
        for method in 1..=3 {
            assert!(match_shapes(&square, &square, method) <= 1e-9);
        }
    }
}
