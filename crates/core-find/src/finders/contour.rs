//! Contour matching.
//!
//! The haystack is binarized (blur + threshold), contours are extracted on
//! both sides, and every haystack contour is scored against every needle
//! contour through the Hu-moment shape distance. Assignment is injective:
//! each needle contour greedily takes the closest unconsumed haystack
//! contour, and consuming marks the entire distance row with 1.1, an
//! impossible distance that also poisons later means, so the loop cutoff
//! `mean > 1 - find.similarity` is compared against a mean over these
//! artificially inflated values once rows run out.

use image::Rgb;
use core_imglog::ImageLogger;

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::matching::Match;
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::shapes::{self, ContourPoints};
use crate::target::{expect_image, Target};
use core_param::CvParameter;

pub const THRESHOLD_BACKENDS: [&str; 3] = ["normal", "adaptive", "canny"];

/// Register the contour and threshold categories.
pub fn register(cfg: &mut LocalConfig) {
    cfg.register("contour", "contour_extractors", &["mixed"]);
    cfg.register("threshold", "threshold_filters", &THRESHOLD_BACKENDS);
}

/// Generate the `contour` category schema.
pub fn configure_contour(
    cfg: &mut LocalConfig,
    backend: Option<&str>,
    reset: bool,
) -> Result<(), FindError> {
    if reset {
        finder::configure_find(cfg, Some("contour"), true)?;
    }
    let backend = backend.unwrap_or("mixed");
    cfg.ensure_supported("contour", backend)?;
    cfg.set_category(
        "contour",
        CategoryParams::new(backend)
            // 1 external borders only, 2 full list, 3 two-level, 4 tree
            .with("retrievalMode", CvParameter::int_enum(2, 1, 4))
            // 1 none, 2 simple, 3-4 Teh-Chin variants
            .with("approxMethod", CvParameter::int_enum(2, 1, 4))
            .with("minArea", CvParameter::int(0, Some(0), None).with_delta(100.0, 1.0))
            // 1, 2, 3 select the Hu-moment distance formulation
            .with("contoursMatch", CvParameter::int_enum(1, 1, 3)),
    );
    Ok(())
}

/// Generate a `threshold`-style category schema (`threshold`, `threshold2`,
/// `threshold3` all share it).
pub fn configure_threshold(
    cfg: &mut LocalConfig,
    backend: Option<&str>,
    category: &str,
    reset: bool,
) -> Result<(), FindError> {
    if reset {
        configure_contour(cfg, None, true)?;
    }
    let backend = match backend {
        Some(b) => b.to_owned(),
        None => core_config::with(|s| s.contour_threshold_backend.clone()),
    };
    cfg.ensure_supported(category, &backend)?;
    tracing::debug!(target: "find.contour", backend = %backend, category, "setting threshold backend");

    let mut params = CategoryParams::new(&backend)
        // 1 box, 2 median, 3 gaussian, 4 none
        .with("blurType", CvParameter::int_enum(4, 1, 4))
        .with("blurKernelSize", CvParameter::int(5, Some(1), None).with_delta(100.0, 1.0))
        .with("blurKernelSigma", CvParameter::int(0, Some(0), None).with_delta(100.0, 1.0));
    match backend.as_str() {
        "normal" => {
            params.insert("thresholdValue", CvParameter::int(122, Some(0), Some(255)).with_delta(50.0, 1.0));
            params.insert("thresholdMax", CvParameter::int(255, Some(0), Some(255)).with_delta(20.0, 1.0));
            // 0 binary, 1 inverted, 2 truncate, 3 tozero, 4 tozero inverted,
            // 5 mask, 6 otsu, 7 triangle
            params.insert("thresholdType", CvParameter::int_enum(1, 0, 7));
        }
        "adaptive" => {
            params.insert("thresholdMax", CvParameter::int(255, Some(0), Some(255)).with_delta(20.0, 1.0));
            // 0 mean window, 1 gaussian-weighted window
            params.insert("adaptiveMethod", CvParameter::int_enum(1, 0, 1));
            // 0 normal, 1 inverted
            params.insert("thresholdType", CvParameter::int_enum(1, 0, 1));
            params.insert("blockSize", CvParameter::int(11, Some(3), None).with_delta(200.0, 2.0));
            params.insert("constant", CvParameter::int(2, Some(-255), Some(255)).with_delta(1.0, 0.9));
        }
        _ => {
            params.insert("threshold1", CvParameter::float(100.0, Some(0.0), None).with_delta(50.0, 1.0));
            params.insert("threshold2", CvParameter::float(1000.0, Some(0.0), None).with_delta(500.0, 1.0));
        }
    }
    cfg.set_category(category, params);
    Ok(())
}

/// Binarize and extract contours under the `contour`/`threshold` categories,
/// dropping contours below the configured minimal area.
pub(crate) fn image_contours(
    cfg: &LocalConfig,
    threshold_category: &str,
    rgb: &image::RgbImage,
) -> (image::GrayImage, Vec<ContourPoints>) {
    let gray = raster::gray_of_rgb(rgb);
    let binary = raster::binarize(cfg, threshold_category, &gray);
    let contours = shapes::extract_contours(
        &binary,
        cfg.ival("contour", "retrievalMode"),
        cfg.ival("contour", "approxMethod"),
    );
    (binary, contours)
}

fn draw_contours(binary: &image::GrayImage, contours: &[ContourPoints]) -> image::RgbImage {
    let mut canvas = raster::rgb_of_gray(binary);
    for contour in contours {
        for point in contour {
            if (point.x as u32) < canvas.width() && (point.y as u32) < canvas.height() {
                canvas.put_pixel(point.x as u32, point.y as u32, Rgb([255, 255, 255]));
            }
        }
    }
    canvas
}

#[derive(Debug, Clone)]
pub struct ContourFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
}

impl ContourFinder {
    pub fn new() -> Result<ContourFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        register(&mut cfg);
        let mut this = ContourFinder {
            cfg,
            imglog: ImageLogger::new(),
        };
        this.configure()?;
        Ok(this)
    }
}

impl Finder for ContourFinder {
    fn backend_name(&self) -> &'static str {
        "contour"
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
        match category {
            "contour" => configure_contour(&mut self.cfg, backend, reset),
            "threshold" => configure_threshold(&mut self.cfg, backend, "threshold", reset),
            other => Err(finder::reject_category(other)),
        }
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if !matches!(category, "contour" | "threshold") {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)
    }

    fn configure(&mut self) -> Result<(), FindError> {
        configure_contour(&mut self.cfg, None, true)?;
        configure_threshold(&mut self.cfg, None, "threshold", false)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        self.synchronize_backend(None, "contour", false)?;
        self.synchronize_backend(None, "threshold", false)
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let needle_image = expect_image(needle, self.backend_name())?;
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;

        let min_area = self.cfg.fval("contour", "minArea");
        let method = self.cfg.ival("contour", "contoursMatch");
        let (_, needle_contours) = image_contours(&self.cfg, "threshold", &needle_image.pixels);
        let (haystack_binary, haystack_contours) =
            image_contours(&self.cfg, "threshold", &haystack_image.pixels);

        self.imglog.hotmaps.push(raster::rgb_of_gray(&haystack_binary));
        self.imglog
            .hotmaps
            .push(draw_contours(&haystack_binary, &haystack_contours));
        let mut final_hotmap = (*haystack_image.pixels).clone();

        let mut matches = Vec::new();
        if needle_contours.is_empty() || haystack_contours.is_empty() {
            tracing::debug!(
                target: "find.contour",
                "no contours to compare ({} needle, {} haystack)",
                needle_contours.len(),
                haystack_contours.len()
            );
            self.imglog.hotmaps.push(final_hotmap);
            self.log(core_config::log_level::WARNING)?;
            return Ok(matches);
        }

        let mut distances =
            vec![vec![1.0f64; needle_contours.len()]; haystack_contours.len()];
        for (i, hcontour) in haystack_contours.iter().enumerate() {
            if shapes::contour_area(hcontour) < min_area {
                continue;
            }
            for (j, ncontour) in needle_contours.iter().enumerate() {
                if shapes::contour_area(ncontour) < min_area {
                    continue;
                }
                distances[i][j] = shapes::match_shapes(hcontour, ncontour, method);
            }
        }

        let all_needle: Vec<&ContourPoints> = needle_contours.iter().collect();
        let (nx, ny, nw, nh) = shapes::bounding_rect_of_all(&all_needle);
        let required_distance = 1.0 - self.cfg.fval("find", "similarity");
        let (dx, dy) = needle.center_offset;

        loop {
            let mut matched_contours: Vec<&ContourPoints> = Vec::new();
            let mut matched_distances = vec![0.0f64; needle_contours.len()];
            for j in 0..needle_contours.len() {
                let (best_row, best) = distances
                    .iter()
                    .enumerate()
                    .map(|(i, row)| (i, row[j]))
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .unwrap_or((0, 1.1));
                matched_distances[j] = best;
                // the needle-to-haystack map is injective, so the entire row
                // is consumed rather than a single cell
                for cell in distances[best_row].iter_mut() {
                    *cell = 1.1;
                }
                matched_contours.push(&haystack_contours[best_row]);
            }
            let average_distance =
                matched_distances.iter().sum::<f64>() / matched_distances.len() as f64;
            tracing::debug!(
                target: "find.contour",
                average_distance,
                required_distance,
                "average distance to next needle shape"
            );
            if average_distance > required_distance {
                break;
            }

            let (x, y, w, h) = shapes::bounding_rect_of_all(&matched_contours);
            let (wx, wy) = (w as f64 / nw.max(1) as f64, h as f64 / nh.max(1) as f64);
            let upleft = (
                (((x - nx) as f64 * wx) as i32).max(0),
                (((y - ny) as f64 * wy) as i32).max(0),
            );
            let downright = (
                (upleft.0 + (needle_image.width() as f64 * wx) as i32)
                    .min(haystack_image.width() as i32),
                (upleft.1 + (needle_image.height() as f64 * wy) as i32)
                    .min(haystack_image.height() as i32),
            );
            let scaled_offset = ((dx as f64 * wx) as i32, (dy as f64 * wy) as i32);
            raster::draw_match_rect(
                &mut final_hotmap,
                upleft.0,
                upleft.1,
                (downright.0 - upleft.0).max(0) as u32,
                (downright.1 - upleft.1).max(0) as u32,
                Rgb([255, 255, 255]),
            );
            let similarity = 1.0 - average_distance;
            self.imglog.similarities.push(similarity);
            self.imglog.locations.push(upleft);
            matches.push(Match::new(
                upleft.0,
                upleft.1,
                (downright.0 - upleft.0).max(0) as u32,
                (downright.1 - upleft.1).max(0) as u32,
                scaled_offset.0,
                scaled_offset.1,
                similarity,
            ));
        }

        self.imglog.hotmaps.push(final_hotmap);
        self.log(core_config::log_level::WARNING)?;
        Ok(matches)
    }

    fn log(&mut self, level: u32) -> Result<(), FindError> {
        finder::log_with(&mut self.imglog, level, |imglog| {
            let step = imglog.printable_step();
            imglog.dump_hotmap(&format!("imglog{step}-3hotmap-1threshold.png"), &imglog.hotmaps[0])?;
            imglog.dump_hotmap(&format!("imglog{step}-3hotmap-2contours.png"), &imglog.hotmaps[1])?;
            finder::emit_final_hotmap(imglog)
        })
    }

    fn duplicate(&self) -> Box<dyn Finder> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_param::ParamValue;
    use image::RgbImage;

    fn blob_canvas() -> RgbImage {
        crate::testutil::silence_imglog();
        let mut canvas = RgbImage::from_pixel(100, 80, Rgb([255, 255, 255]));
        for y in 10u32..34 {
            for x in 10u32..34 {
                canvas.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        for y in 45u32..75 {
            for x in 55u32..95 {
                canvas.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        canvas
    }

    fn with_similarity(finder: &mut ContourFinder, value: f64) {
        finder
            .config_mut()
            .set_value("find", "similarity", ParamValue::Float(value));
    }

    #[test]
    fn self_match_is_nearly_perfect() {
        let canvas = blob_canvas();
        let needle = Target::image_from_pixels(canvas.clone());
        let haystack = Target::image_from_pixels(canvas);
        let mut finder = ContourFinder::new().unwrap();
        with_similarity(&mut finder, 0.8);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(!matches.is_empty());
        assert!(
            matches[0].similarity >= 0.99,
            "self match similarity {}",
            matches[0].similarity
        );
    }

    #[test]
    fn dissimilar_shapes_break_the_distance_cutoff() {
        let mut needle_canvas = RgbImage::from_pixel(60, 60, Rgb([255, 255, 255]));
        // a thin diagonal zig: nothing like the fat blobs in the haystack
        for i in 0u32..50 {
            for t in 0u32..2 {
                needle_canvas.put_pixel(5 + i, 30 + (i % 7) + t, Rgb([0, 0, 0]));
            }
        }
        let needle = Target::image_from_pixels(needle_canvas);
        let haystack = Target::image_from_pixels(blob_canvas());
        let mut finder = ContourFinder::new().unwrap();
        with_similarity(&mut finder, 0.999);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn blank_haystack_matches_nothing() {
        let needle = Target::image_from_pixels(blob_canvas());
        let haystack = Target::image_from_pixels(RgbImage::from_pixel(50, 50, Rgb([255, 255, 255])));
        let mut finder = ContourFinder::new().unwrap();
        with_similarity(&mut finder, 0.5);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn min_area_filters_small_contours() {
        let canvas = blob_canvas();
        let needle = Target::image_from_pixels(canvas.clone());
        let haystack = Target::image_from_pixels(canvas);
        let mut finder = ContourFinder::new().unwrap();
        with_similarity(&mut finder, 0.8);
        // larger than any contour in the scene: every pair stays at the
        // impossible 1.0 default and the cutoff trips immediately
        finder
            .config_mut()
            .set_value("contour", "minArea", ParamValue::Int(100_000));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn threshold_category_switch_changes_schema() {
        let mut finder = ContourFinder::new().unwrap();
        finder
            .configure_backend(Some("canny"), "threshold", false)
            .unwrap();
        assert!(finder.config().param("threshold", "threshold1").is_some());
        assert!(finder.config().param("threshold", "thresholdValue").is_none());
        assert!(matches!(
            finder.configure_backend(Some("bogus"), "threshold", false),
            Err(FindError::UnsupportedBackend { .. })
        ));
        assert!(matches!(
            finder.configure_backend(None, "tdetect", false),
            Err(FindError::UnsupportedCategory(_))
        ));
    }
}
