//! Projection estimation for the feature pipeline.
//!
//! Matched keypoints vote on a transform from needle to haystack
//! coordinates: either a full perspective homography (solved from four point
//! pairs, judged by reprojection error) or a fundamental matrix (the
//! normalized 8-point construction, judged by symmetric epipolar line
//! distance). Estimation runs inside a random-sample-consensus
//! loop; the returned mask marks the matches that are inliers of the
//! winning model.

use rand::seq::SliceRandom;
use rand::Rng;

/// Row-major 3x3 projective transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform(pub [[f64; 3]; 3]);

impl Transform {
    /// Project a point, applying the perspective divide.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.0;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        let w = if w.abs() < f64::EPSILON { f64::EPSILON } else { w };
        (
            (m[0][0] * x + m[0][1] * y + m[0][2]) / w,
            (m[1][0] * x + m[1][1] * y + m[1][2]) / w,
        )
    }
}

/// Solve a dense linear system in place with partial pivoting.
/// Returns `None` for (near-)singular systems, which RANSAC treats as a
/// degenerate sample to skip.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = a.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-10 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in row + 1..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}

/// Homography from exactly four point correspondences (h33 fixed to 1).
pub fn homography_from_points(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Transform> {
    if src.len() != 4 || dst.len() != 4 {
        return None;
    }
    let mut a = Vec::with_capacity(8);
    let mut b = Vec::with_capacity(8);
    for i in 0..4 {
        let (x, y) = src[i];
        let (u, v) = dst[i];
        a.push(vec![x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u]);
        b.push(u);
        a.push(vec![0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v]);
        b.push(v);
    }
    let h = solve(a, b)?;
    Some(Transform([
        [h[0], h[1], h[2]],
        [h[3], h[4], h[5]],
        [h[6], h[7], 1.0],
    ]))
}

fn transpose(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (r, row) in m.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            out[c][r] = *value;
        }
    }
    out
}

fn mat_mul(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            for k in 0..3 {
                out[r][c] += a[r][k] * b[k][c];
            }
        }
    }
    out
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix. Returns the
/// eigenvalues with their eigenvectors as matrix columns.
fn jacobi_eigen(mut a: Vec<Vec<f64>>) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = a.len();
    let mut v = vec![vec![0.0; n]; n];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    for _sweep in 0..64 {
        let mut off = 0.0;
        for p in 0..n {
            for q in p + 1..n {
                off += a[p][q] * a[p][q];
            }
        }
        if off < 1e-24 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                if a[p][q].abs() < 1e-18 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = if theta >= 0.0 {
                    1.0 / (theta + (theta * theta + 1.0).sqrt())
                } else {
                    1.0 / (theta - (theta * theta + 1.0).sqrt())
                };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k][p];
                    let vkq = v[k][q];
                    v[k][p] = c * vkp - s * vkq;
                    v[k][q] = s * vkp + c * vkq;
                }
            }
        }
    }
    let eigenvalues = (0..n).map(|i| a[i][i]).collect();
    (eigenvalues, v)
}

/// Eigenvector of the smallest eigenvalue, i.e. the least-squares null
/// vector of the normal matrix.
fn smallest_eigenvector(a: Vec<Vec<f64>>) -> Vec<f64> {
    let n = a.len();
    let (values, vectors) = jacobi_eigen(a);
    let index = values
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.abs().partial_cmp(&y.1.abs()).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);
    (0..n).map(|r| vectors[r][index]).collect()
}

/// Isotropic point normalization: centroid at the origin, mean distance
/// sqrt(2). Returns the conditioning transform and the normalized points.
fn normalization(points: &[(f64, f64)]) -> ([[f64; 3]; 3], Vec<(f64, f64)>) {
    let n = points.len().max(1) as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let transform = [
        [scale, 0.0, -scale * cx],
        [0.0, scale, -scale * cy],
        [0.0, 0.0, 1.0],
    ];
    let normalized = points
        .iter()
        .map(|p| ((p.0 - cx) * scale, (p.1 - cy) * scale))
        .collect();
    (transform, normalized)
}

/// Project the estimate onto the rank-2 manifold every valid fundamental
/// matrix lives on, dropping its smallest singular value.
fn enforce_rank_two(f: [[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let ftf = mat_mul(&transpose(&f), &f);
    let (values, vectors) = jacobi_eigen(ftf.iter().map(|r| r.to_vec()).collect());
    let mut order: Vec<usize> = (0..3).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut rebuilt = [[0.0; 3]; 3];
    // keep the two dominant singular triplets
    for &index in order.iter().take(2) {
        let sigma = values[index].max(0.0).sqrt();
        if sigma < 1e-12 {
            continue;
        }
        let v_col = [vectors[0][index], vectors[1][index], vectors[2][index]];
        // u = F v / sigma
        let u = [
            (f[0][0] * v_col[0] + f[0][1] * v_col[1] + f[0][2] * v_col[2]) / sigma,
            (f[1][0] * v_col[0] + f[1][1] * v_col[1] + f[1][2] * v_col[2]) / sigma,
            (f[2][0] * v_col[0] + f[2][1] * v_col[1] + f[2][2] * v_col[2]) / sigma,
        ];
        for r in 0..3 {
            for c in 0..3 {
                rebuilt[r][c] += sigma * u[r] * v_col[c];
            }
        }
    }
    rebuilt
}

/// Fundamental matrix from at least eight correspondences with the
/// normalized 8-point construction.
pub fn fundamental_from_points(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Transform> {
    if src.len() < 8 || src.len() != dst.len() {
        return None;
    }
    let (t_src, src_n) = normalization(src);
    let (t_dst, dst_n) = normalization(dst);

    // normal matrix of the epipolar constraint dst' F src = 0
    let mut ata = vec![vec![0.0; 9]; 9];
    for (&(x, y), &(u, v)) in src_n.iter().zip(dst_n.iter()) {
        let row = [u * x, u * y, u, v * x, v * y, v, x, y, 1.0];
        for i in 0..9 {
            for j in 0..9 {
                ata[i][j] += row[i] * row[j];
            }
        }
    }
    let f = smallest_eigenvector(ata);
    if f.iter().map(|v| v * v).sum::<f64>().sqrt() < 1e-12 {
        return None;
    }
    let estimate = enforce_rank_two([
        [f[0], f[1], f[2]],
        [f[3], f[4], f[5]],
        [f[6], f[7], f[8]],
    ]);
    let magnitude: f64 = estimate.iter().flatten().map(|v| v * v).sum();
    if magnitude.sqrt() < 1e-12 {
        // rank projection collapsed the estimate; a zero matrix would score
        // every correspondence as an inlier
        return None;
    }
    // undo the conditioning: F = T_dst' * F_hat * T_src
    let denormalized = mat_mul(&mat_mul(&transpose(&t_dst), &estimate), &t_src);
    Some(Transform(denormalized))
}

/// Symmetric epipolar line distance of a correspondence under a fundamental
/// matrix: how far each point sits from the epipolar line the other point
/// induces, combined over both images.
pub fn epipolar_distance(f: &Transform, src: (f64, f64), dst: (f64, f64)) -> f64 {
    let m = &f.0;
    let (x, y) = src;
    let (u, v) = dst;
    // epipolar line of the source point, in destination coordinates
    let fx = (
        m[0][0] * x + m[0][1] * y + m[0][2],
        m[1][0] * x + m[1][1] * y + m[1][2],
        m[2][0] * x + m[2][1] * y + m[2][2],
    );
    // epipolar line of the destination point, in source coordinates
    let ftd = (
        m[0][0] * u + m[1][0] * v + m[2][0],
        m[0][1] * u + m[1][1] * v + m[2][1],
    );
    let constraint = u * fx.0 + v * fx.1 + fx.2;
    let line_dst = fx.0 * fx.0 + fx.1 * fx.1;
    let line_src = ftd.0 * ftd.0 + ftd.1 * ftd.1;
    if line_dst <= 1e-12 && line_src <= 1e-12 {
        return if constraint.abs() < 1e-9 { 0.0 } else { f64::MAX };
    }
    let mut squared = 0.0;
    if line_dst > 1e-12 {
        squared += constraint * constraint / line_dst;
    }
    if line_src > 1e-12 {
        squared += constraint * constraint / line_src;
    }
    squared.sqrt()
}

/// Result of a consensus estimation: the model plus the inlier mask over the
/// input correspondences.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub transform: Transform,
    pub inliers: Vec<bool>,
}

/// Estimate a transform under RANSAC.
///
/// `method` 0 estimates a perspective homography from 4-point samples,
/// judging inliers by reprojection error against `reproj_threshold` (a zero
/// threshold keeps only exact projections). Any other method estimates a
/// fundamental matrix from 8-point samples, judging inliers by the
/// symmetric epipolar line distance. Returns `None` when no sample produced
/// a valid model.
pub fn ransac_transform<R: Rng + ?Sized>(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
    method: i64,
    reproj_threshold: f64,
    rng: &mut R,
) -> Option<Consensus> {
    let sample_size = if method == 0 { 4 } else { 8 };
    if src.len() < sample_size || src.len() != dst.len() {
        return None;
    }
    // a zero threshold means "exact projections only"; the elimination solve
    // leaves residue of around 1e-10, so exactness gets an epsilon floor
    let reproj_threshold = reproj_threshold.max(1e-6);
    let indices: Vec<usize> = (0..src.len()).collect();
    let iterations = 200;
    let mut best: Option<Consensus> = None;
    let mut best_count = 0usize;

    for _ in 0..iterations {
        let sample: Vec<usize> = indices
            .choose_multiple(rng, sample_size)
            .copied()
            .collect();
        let s: Vec<(f64, f64)> = sample.iter().map(|&i| src[i]).collect();
        let d: Vec<(f64, f64)> = sample.iter().map(|&i| dst[i]).collect();
        let transform = if method == 0 {
            homography_from_points(&s, &d)
        } else {
            fundamental_from_points(&s, &d)
        };
        let Some(transform) = transform else {
            continue;
        };

        let inliers: Vec<bool> = src
            .iter()
            .zip(dst.iter())
            .map(|(&(x, y), &(u, v))| {
                let error = if method == 0 {
                    let (px, py) = transform.apply(x, y);
                    ((px - u).powi(2) + (py - v).powi(2)).sqrt()
                } else {
                    epipolar_distance(&transform, (x, y), (u, v))
                };
                error <= reproj_threshold
            })
            .collect();
        let count = inliers.iter().filter(|&&i| i).count();
        if count > best_count {
            best_count = count;
            let all_inliers = count == src.len();
            best = Some(Consensus { transform, inliers });
            if all_inliers {
                break;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn identity_from_identical_quads() {
        let pts = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)];
        let h = homography_from_points(&pts, &pts).unwrap();
        let (x, y) = h.apply(5.0, 7.0);
        assert!((x - 5.0).abs() < 1e-9 && (y - 7.0).abs() < 1e-9);
    }

    #[test]
    fn translation_recovered_exactly() {
        let src = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)];
        let dst: Vec<(f64, f64)> = src.iter().map(|&(x, y)| (x + 30.0, y + 5.0)).collect();
        let h = homography_from_points(&src, &dst).unwrap();
        let (x, y) = h.apply(4.0, 4.0);
        assert!((x - 34.0).abs() < 1e-6 && (y - 9.0).abs() < 1e-6);
    }

    /// A rectified stereo pair: matches shift horizontally by a
    /// depth-dependent disparity, so corresponding rows must agree.
    fn stereo_pairs() -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..12 {
            let x = (i * 7 % 50) as f64;
            let y = (i * 11 % 40) as f64;
            let disparity = 5.0 + (i % 4) as f64 * 3.0;
            src.push((x, y));
            dst.push((x + disparity, y));
        }
        (src, dst)
    }

    #[test]
    fn fundamental_matrix_satisfies_the_epipolar_constraint() {
        let (src, dst) = stereo_pairs();
        let f = fundamental_from_points(&src, &dst).unwrap();
        for (&s, &d) in src.iter().zip(dst.iter()) {
            let distance = epipolar_distance(&f, s, d);
            assert!(distance < 0.5, "consistent pair scored {distance}");
        }
        let (sx, sy) = src[3];
        let off_row = (dst[3].0, dst[3].1 + 15.0);
        assert!(
            epipolar_distance(&f, (sx, sy), off_row) > 2.0,
            "a row-violating pair must sit far from its epipolar line"
        );
    }

    #[test]
    fn fundamental_matrix_requires_eight_points() {
        let (src, dst) = stereo_pairs();
        assert!(fundamental_from_points(&src[..7], &dst[..7]).is_none());
    }

    #[test]
    fn epipolar_ransac_rejects_row_violating_outliers() {
        let mut rng = StdRng::seed_from_u64(11);
        let (src, mut dst) = stereo_pairs();
        dst[2].1 += 25.0;
        dst[9].1 -= 30.0;
        let consensus = ransac_transform(&src, &dst, 1, 1.0, &mut rng).unwrap();
        let inliers = consensus.inliers.iter().filter(|&&i| i).count();
        assert!(inliers >= 9, "clean correspondences form the consensus");
        assert!(!consensus.inliers[2] && !consensus.inliers[9]);
    }

    #[test]
    fn degenerate_samples_are_rejected() {
        let collinear = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (3.0, 3.0)];
        assert!(homography_from_points(&collinear, &collinear).is_none());
    }

    #[test]
    fn ransac_survives_outliers() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..20 {
            let (x, y) = ((i % 5) as f64 * 10.0, (i / 5) as f64 * 10.0);
            src.push((x, y));
            dst.push((x + 100.0, y + 50.0));
        }
        // inject gross outliers
        dst[3] = (0.0, 0.0);
        dst[11] = (500.0, 500.0);
        let consensus = ransac_transform(&src, &dst, 0, 1.0, &mut rng).unwrap();
        let inliers = consensus.inliers.iter().filter(|&&i| i).count();
        assert_eq!(inliers, 18);
        let (x, y) = consensus.transform.apply(10.0, 10.0);
        assert!((x - 110.0).abs() < 1e-6 && (y - 60.0).abs() < 1e-6);
    }
}
