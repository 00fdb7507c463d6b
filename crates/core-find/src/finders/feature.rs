//! Feature matching: detect, match, project.
//!
//! Stage one detects corners on optionally up-scaled grayscale views of the
//! needle and haystack and describes them. Stage two matches descriptors
//! with exhaustive k-NN, optionally filtered by the ratio test (drop
//! ambiguous best matches) and the symmetry test (keep mutual best matches
//! only); the running similarity becomes `matched / detected`. Stage three
//! estimates a projection under RANSAC; with `similarityRatio` set the
//! similarity is replaced by the inlier ratio, and the needle's frame
//! corners are projected to obtain the haystack bounding box. A single match
//! is produced; multi-instance feature matching is not supported.

use image::{imageops, GrayImage, Rgb};
use core_imglog::ImageLogger;
use rand::SeedableRng;

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::keypoints::{self, DMatch, Keypoint};
use crate::matching::Match;
use crate::projection;
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::{expect_image, Target};
use core_param::CvParameter;

pub const DETECT_BACKENDS: [&str; 2] = ["fast9", "fast12"];
pub const EXTRACT_BACKENDS: [&str; 2] = ["brief", "patch"];
pub const MATCH_BACKENDS: [&str; 2] = ["bruteforce", "bruteforce-hamming"];

/// Register the four feature categories.
pub fn register(cfg: &mut LocalConfig) {
    cfg.register("feature", "feature_projectors", &["mixed"]);
    cfg.register("fdetect", "feature_detectors", &DETECT_BACKENDS);
    cfg.register("fextract", "feature_extractors", &EXTRACT_BACKENDS);
    cfg.register("fmatch", "feature_matchers", &MATCH_BACKENDS);
}

pub fn configure_feature_category(
    cfg: &mut LocalConfig,
    backend: Option<&str>,
    category: &str,
    reset: bool,
) -> Result<(), FindError> {
    if reset {
        finder::configure_find(cfg, Some("feature"), true)?;
    }
    let backend = match (backend, category) {
        (Some(b), _) => b.to_owned(),
        (None, "feature") => "mixed".to_owned(),
        (None, "fdetect") => core_config::with(|s| s.feature_detect_backend.clone()),
        (None, "fextract") => core_config::with(|s| s.feature_extract_backend.clone()),
        (None, "fmatch") => core_config::with(|s| s.feature_match_backend.clone()),
        (None, other) => return Err(finder::reject_category(other)),
    };
    cfg.ensure_supported(category, &backend)?;
    tracing::debug!(target: "find.feature", backend = %backend, category, "setting backend");

    let params = match category {
        "feature" => CategoryParams::new(&backend)
            // 0 perspective homography, 1 fundamental matrix
            .with("projectionMethod", CvParameter::int_enum(0, 0, 1))
            .with(
                "ransacReprojThreshold",
                CvParameter::float(0.0, Some(0.0), Some(200.0)).with_delta(50.0, 1.0),
            )
            .with("minDetectedFeatures", CvParameter::int(4, Some(1), None))
            .with("minMatchedFeatures", CvParameter::int(4, Some(1), None))
            // 0 matched/detected ratio, 1 projected/matched ratio
            .with("similarityRatio", CvParameter::int_enum(1, 0, 1)),
        "fdetect" => CategoryParams::new(&backend)
            .with("nzoom", CvParameter::float(1.0, Some(1.0), Some(10.0)).with_delta(2.5, 1.0))
            .with("hzoom", CvParameter::float(1.0, Some(1.0), Some(10.0)).with_delta(2.5, 1.0))
            .with("threshold", CvParameter::int(20, Some(1), Some(254)).with_delta(50.0, 1.0))
            .with("maxFeatures", CvParameter::int(500, Some(10), None).with_delta(100.0, 1.0)),
        "fextract" => CategoryParams::new(&backend),
        "fmatch" => CategoryParams::new(&backend)
            .with(
                "ratioThreshold",
                CvParameter::float(0.65, Some(0.0), Some(1.0)).with_delta(0.25, 0.01),
            )
            .with("ratioTest", CvParameter::boolean(false))
            .with("symmetryTest", CvParameter::boolean(false)),
        other => return Err(finder::reject_category(other)),
    };
    cfg.set_category(category, params);
    Ok(())
}

fn ratio_test(matches: Vec<Vec<DMatch>>, threshold: f32) -> Vec<DMatch> {
    let total = matches.len();
    let kept: Vec<DMatch> = matches
        .into_iter()
        .filter_map(|list| match list.as_slice() {
            [only] => Some(*only),
            [first, second, ..] => {
                // smooth so the 0/0 case reads as a fully ambiguous 1.0
                let d1 = first.distance + 1e-7;
                let d2 = second.distance + 1e-7;
                (d1 / d2 < threshold).then_some(*first)
            }
            [] => None,
        })
        .collect();
    tracing::debug!(target: "find.feature", "ratio test kept {}/{total}", kept.len());
    kept
}

fn symmetry_test(forward: Vec<DMatch>, backward: &[DMatch]) -> Vec<DMatch> {
    let total = forward.len();
    let kept: Vec<DMatch> = forward
        .into_iter()
        .filter(|fm| {
            backward
                .iter()
                .any(|bm| fm.query == bm.train && fm.train == bm.query)
        })
        .collect();
    tracing::debug!(target: "find.feature", "symmetry test kept {}/{total}", kept.len());
    kept
}

fn draw_keypoints(canvas: &mut image::RgbImage, points: &[(f64, f64)], radius: i32, color: Rgb<u8>) {
    for &(x, y) in points {
        raster::draw_marker_circle(canvas, x as i32, y as i32, radius, color);
    }
}

/// Run the full detect/match/project pipeline and project
/// `locations_in_needle` into the haystack.
///
/// The image logger must already hold four staging hotmaps (detect, match,
/// project, final); the stages draw their keypoint overlays onto them. On
/// any failed gate the running similarity stays at its last value and `None`
/// is returned.
pub(crate) fn project_features(
    cfg: &LocalConfig,
    imglog: &mut ImageLogger,
    locations_in_needle: &[(f64, f64)],
    ngray: &GrayImage,
    hgray: &GrayImage,
    similarity: f64,
) -> Result<Option<Vec<(i32, i32)>>, FindError> {
    // defaults in case no match is found; stages override as they go
    imglog.locations.push((0, 0));
    imglog.similarities.push(0.0);

    tracing::debug!(
        target: "find.feature",
        "performing {}-{}-{} feature matching (no color)",
        cfg.backend("fdetect").unwrap_or("?"),
        cfg.backend("fextract").unwrap_or("?"),
        cfg.backend("fmatch").unwrap_or("?")
    );

    // stage 1: detect and describe on optionally zoomed views
    let nfactor = cfg.fval("fdetect", "nzoom");
    let hfactor = cfg.fval("fdetect", "hzoom");
    let threshold = cfg.ival("fdetect", "threshold").clamp(1, 254) as u8;
    let max_features = cfg.ival("fdetect", "maxFeatures").max(1) as usize;
    let detect_backend = cfg
        .backend("fdetect")
        .ok_or_else(|| FindError::UninitializedBackend("fdetect".to_owned()))?
        .to_owned();
    let extract_backend = cfg
        .backend("fextract")
        .ok_or_else(|| FindError::UninitializedBackend("fextract".to_owned()))?
        .to_owned();
    cfg.ensure_supported("fmatch", cfg.backend("fmatch").unwrap_or(""))?;

    let zoomed = |gray: &GrayImage, factor: f64| -> GrayImage {
        if factor > 1.0 {
            imageops::resize(
                gray,
                (gray.width() as f64 * factor) as u32,
                (gray.height() as f64 * factor) as u32,
                imageops::FilterType::Triangle,
            )
        } else {
            gray.clone()
        }
    };
    let nzoomed = zoomed(ngray, nfactor);
    let hzoomed = zoomed(hgray, hfactor);

    let nkp = keypoints::detect(&nzoomed, &detect_backend, threshold, max_features);
    let hkp = keypoints::detect(&hzoomed, &detect_backend, threshold, max_features);
    let (mut nkp, ndescriptors) = keypoints::extract(&nzoomed, &nkp, &extract_backend);
    let (mut hkp, hdescriptors) = keypoints::extract(&hzoomed, &hkp, &extract_backend);
    // reduce keypoint coordinates to the original image size
    for kp in nkp.iter_mut() {
        kp.x /= nfactor as f32;
        kp.y /= nfactor as f32;
    }
    for kp in hkp.iter_mut() {
        kp.x /= hfactor as f32;
        kp.y /= hfactor as f32;
    }
    tracing::debug!(
        target: "find.feature",
        "detected {} keypoints in needle and {} in haystack",
        nkp.len(),
        hkp.len()
    );
    let hotmap_base = imglog.hotmaps.len() - 4;
    let hkp_locations: Vec<(f64, f64)> = hkp.iter().map(|k| (k.x as f64, k.y as f64)).collect();
    draw_keypoints(&mut imglog.hotmaps[hotmap_base], &hkp_locations, 3, Rgb([255, 0, 0]));

    let min_detected = cfg.ival("feature", "minDetectedFeatures") as usize;
    if nkp.len() < min_detected || hkp.len() < min_detected {
        tracing::debug!(
            target: "find.feature",
            "no acceptable best match after feature detection: only {}/{} needle and {}/{} haystack features",
            nkp.len(),
            min_detected,
            hkp.len(),
            min_detected
        );
        return Ok(None);
    }

    // stage 2: k-NN matching with optional ratio and symmetry tests
    let use_ratio = cfg.bval("fmatch", "ratioTest");
    let use_symmetry = cfg.bval("fmatch", "symmetryTest");
    let ratio_threshold = cfg.fval("fmatch", "ratioThreshold") as f32;
    let k = if use_ratio { 2 } else { 1 };
    let forward = keypoints::knn_match(&ndescriptors, &hdescriptors, k);
    let mut matches = if use_ratio {
        ratio_test(forward, ratio_threshold)
    } else {
        forward.into_iter().filter_map(|l| l.into_iter().next()).collect()
    };
    if use_symmetry {
        let backward = keypoints::knn_match(&hdescriptors, &ndescriptors, k);
        let backward = if use_ratio {
            ratio_test(backward, ratio_threshold)
        } else {
            backward.into_iter().filter_map(|l| l.into_iter().next()).collect()
        };
        matches = symmetry_test(matches, &backward);
    }
    matches.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mnkp: Vec<Keypoint> = matches.iter().map(|m| nkp[m.query]).collect();
    let mhkp: Vec<Keypoint> = matches.iter().map(|m| hkp[m.train]).collect();
    let mhkp_locations: Vec<(f64, f64)> =
        mhkp.iter().map(|k| (k.x as f64, k.y as f64)).collect();
    draw_keypoints(
        &mut imglog.hotmaps[hotmap_base + 1],
        &mhkp_locations,
        2,
        Rgb([255, 255, 0]),
    );

    let match_similarity = mnkp.len() as f64 / nkp.len() as f64;
    if let Some(last) = imglog.similarities.last_mut() {
        *last = match_similarity;
    }
    let min_matched = cfg.ival("feature", "minMatchedFeatures") as usize;
    if match_similarity < similarity || mnkp.len() < min_matched {
        tracing::debug!(
            target: "find.feature",
            "no acceptable best match after feature matching: {} of {} required, similarity {match_similarity} of {similarity} required",
            mnkp.len(),
            min_matched
        );
        return Ok(None);
    }

    // stage 3: RANSAC projection
    let src: Vec<(f64, f64)> = mnkp.iter().map(|k| (k.x as f64, k.y as f64)).collect();
    let dst: Vec<(f64, f64)> = mhkp.iter().map(|k| (k.x as f64, k.y as f64)).collect();
    let method = cfg.ival("feature", "projectionMethod");
    // the reprojection threshold applies to the homography; epipolar
    // consensus is always judged against a 10 pixel line distance
    let reproj = if method == 0 {
        cfg.fval("feature", "ransacReprojThreshold")
    } else {
        10.0
    };
    let mut rng = rand::rngs::StdRng::from_entropy();
    let Some(consensus) = projection::ransac_transform(&src, &dst, method, reproj, &mut rng)
    else {
        tracing::warn!(target: "find.feature", "projection error occurred during feature matching");
        if let Some(last) = imglog.similarities.last_mut() {
            *last = 0.0;
        }
        return Ok(None);
    };

    let inlier_locations: Vec<(f64, f64)> = dst
        .iter()
        .zip(consensus.inliers.iter())
        .filter(|(_, &inlier)| inlier)
        .map(|(&p, _)| p)
        .collect();
    draw_keypoints(
        &mut imglog.hotmaps[hotmap_base + 2],
        &inlier_locations,
        1,
        Rgb([0, 255, 0]),
    );

    let inliers = inlier_locations.len();
    let ransac_similarity = inliers as f64 / mnkp.len() as f64;
    if cfg.ival("feature", "similarityRatio") == 1 {
        if let Some(last) = imglog.similarities.last_mut() {
            *last = ransac_similarity;
        }
    }
    let achieved = imglog.similarities.last().copied().unwrap_or(0.0);
    if achieved < similarity {
        tracing::debug!(
            target: "find.feature",
            "no acceptable best match after projection: {achieved} is less than required {similarity}"
        );
        return Ok(None);
    }

    let projected: Vec<(i32, i32)> = locations_in_needle
        .iter()
        .map(|&(x, y)| {
            let (px, py) = consensus.transform.apply(x, y);
            (px as i32, py as i32)
        })
        .collect();
    imglog.locations.extend(projected.iter().copied());
    let final_index = imglog.hotmaps.len() - 1;
    let projected_f: Vec<(f64, f64)> = projected.iter().map(|&(x, y)| (x as f64, y as f64)).collect();
    draw_keypoints(&mut imglog.hotmaps[final_index], &projected_f, 3, Rgb([0, 0, 255]));
    Ok(Some(projected))
}

/// Emit the detect/match/project stage hotmaps (level-gated) plus the final
/// canonical hotmap.
pub(crate) fn emit_feature_hotmaps(imglog: &mut ImageLogger) -> Result<(), FindError> {
    let logging_level = core_config::with(|s| s.image_logging_level);
    let base = imglog.hotmaps.len() - 4;
    for (i, stage) in ["detect", "match", "project"].iter().enumerate() {
        if logging_level > core_config::log_level::DEBUG && i < 2 {
            continue;
        }
        if logging_level > core_config::log_level::INFO && i == 2 {
            continue;
        }
        let name = format!(
            "imglog{}-3hotmap-{}{}.png",
            imglog.printable_step(),
            i + 1,
            stage
        );
        let hotmap = &imglog.hotmaps[base + i];
        imglog.dump_hotmap(&name, hotmap)?;
    }
    finder::emit_final_hotmap(imglog)
}

#[derive(Debug, Clone)]
pub struct FeatureFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
}

impl FeatureFinder {
    pub fn new() -> Result<FeatureFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        register(&mut cfg);
        let mut this = FeatureFinder {
            cfg,
            imglog: ImageLogger::new(),
        };
        this.configure()?;
        Ok(this)
    }
}

impl Finder for FeatureFinder {
    fn backend_name(&self) -> &'static str {
        "feature"
    }

    fn config(&self) -> &LocalConfig {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut LocalConfig {
        &mut self.cfg
    }

    fn imglog(&self) -> &ImageLogger {
        &self.imglog
    }

    fn imglog_mut(&mut self) -> &mut ImageLogger {
        &mut self.imglog
    }

    fn configure_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        reset: bool,
    ) -> Result<(), FindError> {
        if !matches!(category, "feature" | "fdetect" | "fextract" | "fmatch") {
            return Err(finder::reject_category(category));
        }
        configure_feature_category(&mut self.cfg, backend, category, reset)
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if !matches!(category, "feature" | "fdetect" | "fextract" | "fmatch") {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)
    }

    fn configure(&mut self) -> Result<(), FindError> {
        configure_feature_category(&mut self.cfg, None, "feature", true)?;
        configure_feature_category(&mut self.cfg, None, "fdetect", false)?;
        configure_feature_category(&mut self.cfg, None, "fextract", false)?;
        configure_feature_category(&mut self.cfg, None, "fmatch", false)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        for category in ["feature", "fdetect", "fextract", "fmatch"] {
            self.synchronize_backend(None, category, false)?;
        }
        Ok(())
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let needle_image = expect_image(needle, self.backend_name())?;
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;
        self.synchronize()?;

        let ngray = raster::gray_of_rgb(&needle_image.pixels);
        let hgray = raster::gray_of_rgb(&haystack_image.pixels);
        for _ in 0..4 {
            self.imglog.hotmaps.push((*haystack_image.pixels).clone());
        }

        let (nw, nh) = (needle_image.width() as f64, needle_image.height() as f64);
        // frame corners plus center, projected for logging and the box
        let npoints = [
            (0.0, 0.0),
            (nw, 0.0),
            (0.0, nh),
            (nw, nh),
            (nw / 2.0, nh / 2.0),
        ];

        let similarity = self.cfg.fval("find", "similarity");
        let projected = project_features(
            &self.cfg,
            &mut self.imglog,
            &npoints,
            &ngray,
            &hgray,
            similarity,
        )?;

        match projected {
            Some(points) if !points.is_empty() => {
                let (x, y) = points[0];
                let (w, h) = (
                    (points[3].0 - points[0].0).unsigned_abs(),
                    (points[3].1 - points[0].1).unsigned_abs(),
                );
                let achieved = self.imglog.similarities.last().copied().unwrap_or(0.0);
                let matches = vec![Match::new(x, y, w, h, 0, 0, achieved)];
                self.log(core_config::log_level::WARNING)?;
                Ok(matches)
            }
            _ => {
                self.log(core_config::log_level::ERROR)?;
                Ok(Vec::new())
            }
        }
    }

    fn log(&mut self, level: u32) -> Result<(), FindError> {
        finder::log_with(&mut self.imglog, level, emit_feature_hotmaps)
    }

    fn duplicate(&self) -> Box<dyn Finder> {
        Box::new(self.clone())
    }
}
