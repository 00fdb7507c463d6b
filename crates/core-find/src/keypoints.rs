//! Keypoint detection, description, and brute-force matching.
//!
//! The feature pipeline is built from three small pieces: FAST corner
//! detection (9- and 12-point variants), a descriptor per keypoint (256-bit
//! BRIEF-style binary tests or a mean-normalized intensity patch), and
//! exhaustive k-NN matching under the distance the descriptor calls for.
//! The binary test pattern is generated from a fixed-seed generator so the
//! needle and haystack are always described with the same pattern.

use image::GrayImage;
use imageproc::corners::{corners_fast12, corners_fast9};
use imageproc::filter::box_filter;

/// Patch radius the descriptors sample within; keypoints closer to the
/// border are dropped at extraction time.
const BRIEF_RADIUS: i32 = 15;
const PATCH_RADIUS: i32 = 4;
const BRIEF_BITS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    /// 256 binary intensity comparisons packed into 32 bytes.
    Binary([u8; BRIEF_BITS / 8]),
    /// Mean-normalized 9x9 intensity patch.
    Patch(Vec<f32>),
}

/// Detect corners with the selected FAST variant, strongest first, capped at
/// `max_features` with a greedy minimum-distance spread.
pub fn detect(gray: &GrayImage, backend: &str, threshold: u8, max_features: usize) -> Vec<Keypoint> {
    let corners = match backend {
        "fast12" => corners_fast12(gray, threshold),
        _ => corners_fast9(gray, threshold),
    };
    let mut keypoints: Vec<Keypoint> = corners
        .into_iter()
        .map(|c| Keypoint {
            x: c.x as f32,
            y: c.y as f32,
            score: c.score,
        })
        .collect();
    keypoints.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // greedy non-maximum spread: drop corners crowding a stronger one
    let mut kept: Vec<Keypoint> = Vec::new();
    for kp in keypoints {
        if kept.len() >= max_features {
            break;
        }
        let crowded = kept
            .iter()
            .any(|k| (k.x - kp.x).abs() < 3.0 && (k.y - kp.y).abs() < 3.0);
        if !crowded {
            kept.push(kp);
        }
    }
    kept
}

/// The fixed BRIEF sampling pattern: pairs of offsets within the patch,
/// derived from a small deterministic generator.
fn brief_pattern() -> Vec<((i32, i32), (i32, i32))> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = move || {
        // xorshift step, reduced onto the patch square
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let span = (2 * BRIEF_RADIUS + 1) as u64;
    (0..BRIEF_BITS)
        .map(|_| {
            let a = (
                (next() % span) as i32 - BRIEF_RADIUS,
                (next() % span) as i32 - BRIEF_RADIUS,
            );
            let b = (
                (next() % span) as i32 - BRIEF_RADIUS,
                (next() % span) as i32 - BRIEF_RADIUS,
            );
            (a, b)
        })
        .collect()
}

/// Compute descriptors for the keypoints far enough from the border.
/// Returns the surviving keypoints with their descriptors, index-aligned.
pub fn extract(
    gray: &GrayImage,
    keypoints: &[Keypoint],
    backend: &str,
) -> (Vec<Keypoint>, Vec<Descriptor>) {
    match backend {
        "patch" => extract_patch(gray, keypoints),
        _ => extract_brief(gray, keypoints),
    }
}

fn extract_brief(gray: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, Vec<Descriptor>) {
    // smoothing stabilizes single-pixel comparisons
    let smoothed = box_filter(gray, 2, 2);
    let pattern = brief_pattern();
    let (w, h) = (gray.width() as i32, gray.height() as i32);
    let mut kept = Vec::new();
    let mut descriptors = Vec::new();
    for kp in keypoints {
        let (cx, cy) = (kp.x as i32, kp.y as i32);
        if cx < BRIEF_RADIUS || cy < BRIEF_RADIUS || cx + BRIEF_RADIUS >= w || cy + BRIEF_RADIUS >= h
        {
            continue;
        }
        let mut bits = [0u8; BRIEF_BITS / 8];
        for (i, ((ax, ay), (bx, by))) in pattern.iter().enumerate() {
            let pa = smoothed.get_pixel((cx + ax) as u32, (cy + ay) as u32)[0];
            let pb = smoothed.get_pixel((cx + bx) as u32, (cy + by) as u32)[0];
            if pa < pb {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        kept.push(*kp);
        descriptors.push(Descriptor::Binary(bits));
    }
    (kept, descriptors)
}

fn extract_patch(gray: &GrayImage, keypoints: &[Keypoint]) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let (w, h) = (gray.width() as i32, gray.height() as i32);
    let mut kept = Vec::new();
    let mut descriptors = Vec::new();
    for kp in keypoints {
        let (cx, cy) = (kp.x as i32, kp.y as i32);
        if cx < PATCH_RADIUS || cy < PATCH_RADIUS || cx + PATCH_RADIUS >= w || cy + PATCH_RADIUS >= h
        {
            continue;
        }
        let mut values = Vec::with_capacity(((2 * PATCH_RADIUS + 1) * (2 * PATCH_RADIUS + 1)) as usize);
        for dy in -PATCH_RADIUS..=PATCH_RADIUS {
            for dx in -PATCH_RADIUS..=PATCH_RADIUS {
                values.push(gray.get_pixel((cx + dx) as u32, (cy + dy) as u32)[0] as f32);
            }
        }
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        for v in &mut values {
            *v -= mean;
        }
        kept.push(*kp);
        descriptors.push(Descriptor::Patch(values));
    }
    (kept, descriptors)
}

/// One query-to-train correspondence with its descriptor distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DMatch {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

/// Distance between two descriptors: Hamming for binary, Euclidean for
/// patches. Mixing kinds yields an infinite distance so such pairs never
/// match.
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> f32 {
    match (a, b) {
        (Descriptor::Binary(da), Descriptor::Binary(db)) => da
            .iter()
            .zip(db.iter())
            .map(|(x, y)| (x ^ y).count_ones())
            .sum::<u32>() as f32,
        (Descriptor::Patch(da), Descriptor::Patch(db)) if da.len() == db.len() => da
            .iter()
            .zip(db.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        _ => f32::INFINITY,
    }
}

/// Exhaustive k-nearest-neighbor matching from `query` into `train`.
/// Each inner list is ordered by ascending distance and holds up to `k`
/// entries.
pub fn knn_match(query: &[Descriptor], train: &[Descriptor], k: usize) -> Vec<Vec<DMatch>> {
    let mut matches = Vec::with_capacity(query.len());
    for (qi, qd) in query.iter().enumerate() {
        let mut candidates: Vec<DMatch> = train
            .iter()
            .enumerate()
            .map(|(ti, td)| DMatch {
                query: qi,
                train: ti,
                distance: descriptor_distance(qd, td),
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(k);
        matches.push(candidates);
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// A checkered box on flat background produces stable FAST corners.
    fn cornered_image() -> GrayImage {
        let mut img = GrayImage::from_pixel(64, 64, Luma([30]));
        for y in 20..44 {
            for x in 20..44 {
                img.put_pixel(x, y, Luma([220]));
            }
        }
        img
    }

    #[test]
    fn fast_finds_corners_of_a_bright_box() {
        let img = cornered_image();
        let keypoints = detect(&img, "fast9", 20, 500);
        assert!(!keypoints.is_empty(), "box corners must fire the detector");
        assert!(keypoints.len() <= 500);
    }

    #[test]
    fn max_features_caps_detection() {
        let img = cornered_image();
        let keypoints = detect(&img, "fast9", 10, 2);
        assert!(keypoints.len() <= 2);
    }

    #[test]
    fn identical_patches_have_zero_distance() {
        let img = cornered_image();
        let keypoints = detect(&img, "fast9", 20, 500);
        for backend in ["brief", "patch"] {
            let (kept, descriptors) = extract(&img, &keypoints, backend);
            assert_eq!(kept.len(), descriptors.len());
            if let Some(d) = descriptors.first() {
                assert_eq!(descriptor_distance(d, d), 0.0);
            }
        }
    }

    #[test]
    fn knn_returns_self_as_best_match() {
        let img = cornered_image();
        let keypoints = detect(&img, "fast9", 20, 500);
        let (_kept, descriptors) = extract(&img, &keypoints, "brief");
        assert!(!descriptors.is_empty());
        let matches = knn_match(&descriptors, &descriptors, 2);
        for (qi, list) in matches.iter().enumerate() {
            assert!(!list.is_empty());
            assert_eq!(list[0].query, qi);
            assert_eq!(list[0].distance, 0.0);
            if list.len() > 1 {
                assert!(list[0].distance <= list[1].distance);
            }
        }
    }

    #[test]
    fn mixed_descriptor_kinds_never_match() {
        let binary = Descriptor::Binary([0; 32]);
        let patch = Descriptor::Patch(vec![0.0; 81]);
        assert_eq!(descriptor_distance(&binary, &patch), f32::INFINITY);
    }
}
