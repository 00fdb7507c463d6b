//! Text matching: detect candidate regions, then read them.
//!
//! Detection backends:
//! * `contours`: binarize the haystack, take contour bounding boxes as
//!   character candidates (filtered by area, size, and aspect ratio), then
//!   group characters into lines by horizontal or vertical proximity.
//! * `erstat`: sweep threshold levels over the color channels, the
//!   lightness channel, and the gradient magnitude (plus negated channels
//!   for dark-on-bright text), keep components whose bounding boxes stay
//!   stable across enough levels, and merge the grouped candidates into a
//!   final set of nonintersecting rectangles.
//! * `components`: connected-component labeling with configurable 4/8
//!   connectivity; the recognition wiring for raw components is still open,
//!   so after the diagnostic stage it reports as unimplemented.
//!
//! Recognition backends read a preprocessed crop of each candidate (border,
//! zoom, optional binarization, distance transform, and erosion/dilation):
//! * `glyph`: segment ink into cells and score each cell against the
//!   built-in glyph atlas by overlap on a downsampled grid.
//! * `knn`: nearest atlas glyph by grid distance.
//! * `beamSearch`: reserved, unimplemented.
//!
//! The final similarity of a candidate is the edit-distance complement
//! `1 - edit(needle, output) / max(|needle|, |output|)`.

use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::{distance_transform, Norm as DtNorm};
use imageproc::gradients::sobel_gradients;
use imageproc::morphology::{dilate, erode};
use imageproc::region_labelling::{connected_components, Connectivity};
use core_imglog::ImageLogger;

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::finders::contour::{configure_contour, configure_threshold, THRESHOLD_BACKENDS};
use crate::font;
use crate::matching::{sort_best_first, Match};
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::shapes;
use crate::target::{expect_image, expect_text, Target};
use core_param::CvParameter;

pub const DETECT_BACKENDS: [&str; 3] = ["erstat", "contours", "components"];
pub const OCR_BACKENDS: [&str; 3] = ["glyph", "knn", "beamSearch"];

type Box2D = (i32, i32, u32, u32);

/// Register the text categories (including the contour/threshold categories
/// the detection stage borrows).
pub fn register(cfg: &mut LocalConfig) {
    cfg.register("text", "text_matchers", &["mixed"]);
    cfg.register("tdetect", "text_detectors", &DETECT_BACKENDS);
    cfg.register("ocr", "text_recognizers", &OCR_BACKENDS);
    cfg.register("contour", "contour_extractors", &["mixed"]);
    cfg.register("threshold", "threshold_filters", &THRESHOLD_BACKENDS);
    cfg.register("threshold2", "threshold_filters2", &THRESHOLD_BACKENDS);
    cfg.register("threshold3", "threshold_filters3", &THRESHOLD_BACKENDS);
}

pub fn configure_text_category(
    cfg: &mut LocalConfig,
    backend: Option<&str>,
    category: &str,
    reset: bool,
) -> Result<(), FindError> {
    match category {
        "contour" => return configure_contour(cfg, backend, reset),
        "threshold" | "threshold2" | "threshold3" => {
            return configure_threshold(cfg, backend, category, reset);
        }
        _ => {}
    }
    if reset {
        finder::configure_find(cfg, Some("text"), true)?;
    }
    let backend = match (backend, category) {
        (Some(b), _) => b.to_owned(),
        (None, "text") => "mixed".to_owned(),
        (None, "tdetect") => core_config::with(|s| s.text_detect_backend.clone()),
        (None, "ocr") => core_config::with(|s| s.text_ocr_backend.clone()),
        (None, other) => return Err(finder::reject_category(other)),
    };
    cfg.ensure_supported(category, &backend)?;
    tracing::debug!(target: "find.text", backend = %backend, category, "setting backend");

    let params = match category {
        "text" => CategoryParams::new(&backend),
        "tdetect" => match backend.as_str() {
            "erstat" => CategoryParams::new(&backend)
                // step between swept threshold levels
                .with("thresholdDelta", CvParameter::int(8, Some(1), Some(255)).with_delta(50.0, 1.0))
                // area bounds as fractions of the haystack area
                .with("minArea", CvParameter::float(0.00025, Some(0.0), Some(1.0)).with_delta(0.25, 0.001))
                .with("maxArea", CvParameter::float(0.13, Some(0.0), Some(1.0)).with_delta(0.25, 0.001))
                // required stability: fraction of levels a region must survive
                .with("minProbability", CvParameter::float(0.4, Some(0.0), Some(1.0)).with_delta(0.25, 0.01))
                .with("nonMaxSuppression", CvParameter::boolean(true)),
            "contours" => CategoryParams::new(&backend)
                .with("maxArea", CvParameter::int(10000, Some(0), None).with_delta(1000.0, 10.0))
                .with("minWidth", CvParameter::int(1, Some(0), None).with_delta(100.0, 1.0))
                .with("maxWidth", CvParameter::int(100, Some(0), None).with_delta(100.0, 1.0))
                .with("minHeight", CvParameter::int(1, Some(0), None).with_delta(100.0, 1.0))
                .with("maxHeight", CvParameter::int(100, Some(0), None).with_delta(100.0, 1.0))
                .with("minAspectRatio", CvParameter::float(0.1, Some(0.0), None).with_delta(10.0, 1.0))
                .with("maxAspectRatio", CvParameter::float(1.5, Some(0.0), None).with_delta(10.0, 1.0))
                .with("horizontalSpacing", CvParameter::int(10, Some(0), None).with_delta(10.0, 1.0))
                .with("verticalVariance", CvParameter::int(10, Some(0), None).with_delta(10.0, 1.0))
                // 0 horizontal, 1 vertical
                .with("orientation", CvParameter::int_enum(0, 0, 1))
                .with("minChars", CvParameter::int(3, Some(0), None).with_delta(2.0, 0.9)),
            _ => CategoryParams::new(&backend)
                // equal delta and tolerance: one failed trial, and no value
                // between 4 and 8 is ever selected
                .with("connectivity", CvParameter::int(4, Some(4), Some(8)).with_delta(4.0, 4.0)),
        },
        "ocr" => {
            let mut params = CategoryParams::new(&backend);
            if backend != "beamSearch" {
                params.insert("char_whitelist", CvParameter::string(font::ALPHABET));
            }
            params.insert("binarize_text", CvParameter::boolean(true));
            params.insert("min_confidence", CvParameter::int(0, Some(0), Some(100)).with_delta(25.0, 1.0));
            params.insert("zoom_factor", CvParameter::float(1.0, Some(1.0), Some(100.0)).with_delta(25.0, 1.0));
            params.insert("border_size", CvParameter::int(10, Some(0), Some(100)).with_delta(25.0, 1.0));
            // 0 erode, 1 dilate, 2 both, 3 none
            params.insert("erode_dilate", CvParameter::int_enum(3, 0, 3));
            // 0 rectangle, 1 ellipse, 2 cross
            params.insert("ed_kernel_type", CvParameter::int_enum(0, 0, 2));
            params.insert("ed_kernel_width", CvParameter::int(1, Some(1), Some(1000)).with_delta(250.0, 2.0));
            params.insert("ed_kernel_height", CvParameter::int(1, Some(1), Some(1000)).with_delta(250.0, 2.0));
            params.insert("distance_transform", CvParameter::boolean(false));
            // 1 L1, 2 L2, 3 Chebyshev
            params.insert("dt_distance_type", CvParameter::int_enum(1, 1, 3));
            // 0 (precise) or one of the 3x3 and 5x5 masks
            params.insert("dt_mask_size", CvParameter::int(3, Some(0), Some(5)).with_delta(8.0, 2.0));
            params
        }
        other => return Err(finder::reject_category(other)),
    };
    cfg.set_category(category, params);
    Ok(())
}

#[derive(Debug, Clone)]
pub struct TextFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
}

impl TextFinder {
    pub fn new() -> Result<TextFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        register(&mut cfg);
        let mut this = TextFinder {
            cfg,
            imglog: ImageLogger::new(),
        };
        this.configure()?;
        Ok(this)
    }

    fn detect_regions(&mut self, haystack: &RgbImage) -> Result<Vec<Box2D>, FindError> {
        let backend = self
            .cfg
            .backend("tdetect")
            .ok_or_else(|| FindError::UninitializedBackend("tdetect".to_owned()))?
            .to_owned();
        match backend.as_str() {
            "erstat" => Ok(self.detect_erstat(haystack)),
            "contours" => Ok(self.detect_contours(haystack)),
            "components" => self.detect_components(haystack),
            other => Err(FindError::unsupported(other, &DETECT_BACKENDS)),
        }
    }

    /// Contour-based detection: filter contour boxes into character
    /// candidates and group them into lines.
    fn detect_contours(&mut self, haystack: &RgbImage) -> Vec<Box2D> {
        let mut char_canvas = haystack.clone();
        let mut text_canvas = haystack.clone();

        let gray = raster::gray_of_rgb(haystack);
        let binary = raster::binarize(&self.cfg, "threshold", &gray);
        let contours = shapes::extract_contours(
            &binary,
            self.cfg.ival("contour", "retrievalMode"),
            self.cfg.ival("contour", "approxMethod"),
        );

        let min_area = self.cfg.fval("contour", "minArea");
        let max_area = self.cfg.fval("tdetect", "maxArea");
        let (min_w, max_w) = (
            self.cfg.ival("tdetect", "minWidth"),
            self.cfg.ival("tdetect", "maxWidth"),
        );
        let (min_h, max_h) = (
            self.cfg.ival("tdetect", "minHeight"),
            self.cfg.ival("tdetect", "maxHeight"),
        );
        let (min_ratio, max_ratio) = (
            self.cfg.fval("tdetect", "minAspectRatio"),
            self.cfg.fval("tdetect", "maxAspectRatio"),
        );

        let mut char_regions: Vec<Box2D> = Vec::new();
        for contour in &contours {
            let (x, y, w, h) = shapes::bounding_rect(contour);
            let area = shapes::contour_area(contour);
            let ratio = w as f64 / h.max(1) as f64;
            if area < min_area
                || area > max_area
                || (w as i64) < min_w
                || (w as i64) > max_w
                || (h as i64) < min_h
                || (h as i64) > max_h
                || ratio < min_ratio
                || ratio > max_ratio
            {
                tracing::debug!(
                    target: "find.text",
                    "ignoring contour {w}x{h} with area {area} and aspect ratio {ratio}"
                );
                continue;
            }
            raster::draw_match_rect(&mut char_canvas, x, y, w, h, Rgb([255, 0, 0]));
            char_regions.push((x, y, w, h));
        }
        char_regions.sort_by_key(|r| r.0);

        let dx = self.cfg.ival("tdetect", "horizontalSpacing");
        let dy = self.cfg.ival("tdetect", "verticalVariance");
        let orientation = self.cfg.ival("tdetect", "orientation");
        let min_chars = self.cfg.ival("tdetect", "minChars");

        let mut slots: Vec<Option<Box2D>> = char_regions.into_iter().map(Some).collect();
        let mut text_regions = Vec::new();
        for i in 0..slots.len() {
            let Some(mut region) = slots[i] else { continue };
            let mut chars_for_text = 0i64;
            for j in 0..slots.len() {
                if i == j {
                    continue;
                }
                let Some(other) = slots[j] else { continue };
                let (x1, y1, w1, h1) = (
                    region.0 as i64,
                    region.1 as i64,
                    region.2 as i64,
                    region.3 as i64,
                );
                let (x2, y2, w2, h2) =
                    (other.0 as i64, other.1 as i64, other.2 as i64, other.3 as i64);
                let is_text = if orientation == 0 {
                    x2 - (x1 + w1) < dx
                        && x1 - (x2 + w2) < dx
                        && (y1 - y2).abs() < dy
                        && (h1 - h2).abs() < 2 * dy
                } else {
                    y2 - (y1 + h1) < dy
                        && y1 - (y2 + h2) < dy
                        && (x1 - x2).abs() < dx
                        && (w1 - w2).abs() < 2 * dx
                };
                if is_text {
                    let nx = x1.min(x2);
                    let ny = y1.min(y2);
                    region = (
                        nx as i32,
                        ny as i32,
                        ((x1 + w1).max(x2 + w2) - nx) as u32,
                        ((y1 + h1).max(y2 + h2) - ny) as u32,
                    );
                    chars_for_text += 1;
                    slots[j] = None;
                }
            }
            if chars_for_text < min_chars {
                tracing::debug!(
                    target: "find.text",
                    "ignoring text contour with {chars_for_text}<{min_chars} characters"
                );
                continue;
            }
            raster::draw_match_rect(
                &mut text_canvas,
                region.0,
                region.1,
                region.2,
                region.3,
                Rgb([0, 255, 0]),
            );
            text_regions.push(region);
            slots[i] = None;
        }

        self.imglog.hotmaps.push(char_canvas);
        self.imglog.hotmaps.push(text_canvas);
        text_regions
    }

    /// Channel-wise threshold-sweep extremal regions.
    fn detect_erstat(&mut self, haystack: &RgbImage) -> Vec<Box2D> {
        let mut char_canvas = haystack.clone();
        let mut text_canvas = haystack.clone();
        let (width, height) = haystack.dimensions();
        let image_area = (width * height) as f64;

        // B, G, R, lightness, and gradient magnitude channels, then negated
        // variants of all but the gradient
        let gray = raster::gray_of_rgb(haystack);
        let mut channels: Vec<GrayImage> = Vec::new();
        for c in 0..3usize {
            channels.push(GrayImage::from_fn(width, height, |x, y| {
                Luma([haystack.get_pixel(x, y)[c]])
            }));
        }
        channels.push(gray.clone());
        let gradients = sobel_gradients(&gray);
        let max_gradient = gradients.pixels().map(|p| p[0]).max().unwrap_or(1).max(1);
        channels.push(GrayImage::from_fn(width, height, |x, y| {
            Luma([(gradients.get_pixel(x, y)[0] as u32 * 255 / max_gradient as u32) as u8])
        }));
        let negatives: Vec<GrayImage> = channels[..4]
            .iter()
            .map(|ch| GrayImage::from_fn(width, height, |x, y| Luma([255 - ch.get_pixel(x, y)[0]])))
            .collect();
        channels.extend(negatives);

        let delta = self.cfg.ival("tdetect", "thresholdDelta").clamp(1, 255) as usize;
        let min_area = self.cfg.fval("tdetect", "minArea") * image_area;
        let max_area = self.cfg.fval("tdetect", "maxArea") * image_area;
        let min_probability = self.cfg.fval("tdetect", "minProbability");
        let suppress = self.cfg.bval("tdetect", "nonMaxSuppression");

        tracing::debug!(
            target: "find.text",
            "extracting stable extremal regions from {} channels",
            channels.len()
        );
        let mut char_regions: Vec<(Box2D, usize)> = Vec::new();
        let levels: Vec<u8> = (delta..256).step_by(delta).map(|l| l as u8).collect();
        for channel in &channels {
            for &level in &levels {
                let binary = GrayImage::from_fn(width, height, |x, y| {
                    Luma([if channel.get_pixel(x, y)[0] >= level { 255 } else { 0 }])
                });
                for (bbox, area) in component_boxes(&binary, Connectivity::Eight) {
                    if (area as f64) < min_area || area as f64 > max_area {
                        continue;
                    }
                    // count repeated sightings of roughly the same box
                    match char_regions.iter_mut().find(|(seen, _)| boxes_close(*seen, bbox)) {
                        Some((_, count)) => *count += 1,
                        None => char_regions.push((bbox, 1)),
                    }
                }
            }
        }
        let required = ((min_probability * levels.len() as f64).ceil() as usize).max(1);
        let mut stable: Vec<Box2D> = char_regions
            .into_iter()
            .filter(|(_, count)| *count >= required)
            .map(|(bbox, _)| bbox)
            .collect();
        if suppress {
            stable = merge_nonintersecting(stable);
        }
        for &(x, y, w, h) in &stable {
            raster::draw_match_rect(&mut char_canvas, x, y, w, h, Rgb([255, 0, 0]));
        }

        // group stable characters into lines by proximity scaled to their
        // own height, then merge intersecting groups
        let mut groups: Vec<Box2D> = Vec::new();
        let mut slots: Vec<Option<Box2D>> = {
            stable.sort_by_key(|r| r.0);
            stable.into_iter().map(Some).collect()
        };
        for i in 0..slots.len() {
            let Some(mut region) = slots[i] else { continue };
            let mut members = 1;
            for j in 0..slots.len() {
                if i == j {
                    continue;
                }
                let Some(other) = slots[j] else { continue };
                let gap = (other.0 as i64 - (region.0 as i64 + region.2 as i64))
                    .max(region.0 as i64 - (other.0 as i64 + other.2 as i64));
                let dy = (other.1 as i64 - region.1 as i64).abs();
                if gap < region.3 as i64 && dy < region.3 as i64 / 2 + 1 {
                    let nx = region.0.min(other.0);
                    let ny = region.1.min(other.1);
                    region = (
                        nx,
                        ny,
                        ((region.0 as i64 + region.2 as i64).max(other.0 as i64 + other.2 as i64)
                            - nx as i64) as u32,
                        ((region.1 as i64 + region.3 as i64).max(other.1 as i64 + other.3 as i64)
                            - ny as i64) as u32,
                    );
                    members += 1;
                    slots[j] = None;
                }
            }
            if members >= 2 {
                groups.push(region);
                slots[i] = None;
            }
        }
        let final_regions = merge_nonintersecting(groups);
        for &(x, y, w, h) in &final_regions {
            raster::draw_match_rect(&mut text_canvas, x, y, w, h, Rgb([0, 255, 0]));
        }

        self.imglog.hotmaps.push(char_canvas);
        self.imglog.hotmaps.push(text_canvas);
        final_regions
    }

    /// Connected-component candidates. The downstream recognition wiring for
    /// raw components is unfinished, so this logs its diagnostic canvases
    /// and reports unimplemented.
    fn detect_components(&mut self, haystack: &RgbImage) -> Result<Vec<Box2D>, FindError> {
        let mut char_canvas = haystack.clone();
        let text_canvas = haystack.clone();
        let connectivity = match self.cfg.ival("tdetect", "connectivity") {
            8 => Connectivity::Eight,
            _ => Connectivity::Four,
        };
        let gray = raster::gray_of_rgb(haystack);
        let binary = raster::binarize(&self.cfg, "threshold", &gray);
        let min_area = self.cfg.fval("contour", "minArea");
        let boxes = component_boxes(&binary, connectivity);
        tracing::debug!(target: "find.text", "detected {} component labels", boxes.len());
        for (bbox, area) in boxes {
            if (area as f64) < min_area {
                continue;
            }
            raster::draw_match_rect(&mut char_canvas, bbox.0, bbox.1, bbox.2, bbox.3, Rgb([255, 0, 0]));
        }
        self.imglog.hotmaps.push(char_canvas);
        self.imglog.hotmaps.push(text_canvas);
        let last = raster::rgb_of_gray(&binary);
        self.imglog.hotmaps.push(last);
        self.log(core_config::log_level::WARNING)?;
        Err(FindError::NotImplemented(
            "the connected components method for text detection needs more labels",
        ))
    }

    /// Preprocess one candidate crop for recognition.
    fn preprocess_candidate(&self, haystack: &RgbImage, region: Box2D) -> GrayImage {
        let (width, height) = haystack.dimensions();
        let border = self.cfg.ival("ocr", "border_size").max(0) as i64;
        let x0 = (region.0 as i64 - border).max(0) as u32;
        let y0 = (region.1 as i64 - border).max(0) as u32;
        let x1 = ((region.0 as i64 + region.2 as i64 + border).min(width as i64)) as u32;
        let y1 = ((region.1 as i64 + region.3 as i64 + border).min(height as i64)) as u32;
        let crop = imageops::crop_imm(haystack, x0, y0, x1 - x0, y1 - y0).to_image();

        let factor = self.cfg.fval("ocr", "zoom_factor").max(1.0);
        let crop = if factor > 1.0 {
            tracing::debug!(target: "find.text", factor, "zooming candidate for recognition");
            imageops::resize(
                &crop,
                (crop.width() as f64 * factor) as u32,
                (crop.height() as f64 * factor) as u32,
                imageops::FilterType::Triangle,
            )
        } else {
            crop
        };

        let gray = raster::gray_of_rgb(&crop);
        let mut text_img = if self.cfg.bval("ocr", "binarize_text") {
            raster::binarize(&self.cfg, "threshold2", &gray)
        } else {
            gray
        };

        if self.cfg.bval("ocr", "distance_transform") {
            let norm = match self.cfg.ival("ocr", "dt_distance_type") {
                2 => DtNorm::L2,
                3 => DtNorm::LInf,
                _ => DtNorm::L1,
            };
            let distances = distance_transform(&text_img, norm);
            text_img = raster::binarize(&self.cfg, "threshold3", &distances);
        }

        let ed_mode = self.cfg.ival("ocr", "erode_dilate");
        if ed_mode < 3 {
            let norm = match self.cfg.ival("ocr", "ed_kernel_type") {
                1 => DtNorm::L2,
                2 => DtNorm::L1,
                _ => DtNorm::LInf,
            };
            let k = (self
                .cfg
                .ival("ocr", "ed_kernel_width")
                .max(self.cfg.ival("ocr", "ed_kernel_height"))
                / 2)
            .max(1) as u8;
            if ed_mode == 0 || ed_mode == 2 {
                text_img = erode(&text_img, norm, k);
            }
            if ed_mode == 1 || ed_mode == 2 {
                text_img = dilate(&text_img, norm, k);
            }
        }
        text_img
    }

    /// Read the preprocessed candidate with the configured recognizer.
    fn recognize(&self, text_img: &GrayImage) -> Result<String, FindError> {
        let backend = self
            .cfg
            .backend("ocr")
            .ok_or_else(|| FindError::UninitializedBackend("ocr".to_owned()))?;
        if backend == "beamSearch" {
            return Err(FindError::NotImplemented(
                "the beamSearch recognizer is not yet available",
            ));
        }
        let whitelist = self.cfg.sval("ocr", "char_whitelist");
        let min_confidence = self.cfg.ival("ocr", "min_confidence") as f64 / 100.0;

        let mut cells: Vec<(Box2D, u32)> = component_boxes_positive(text_img);
        // drop speckles below a couple of pixels
        cells.retain(|(_, area)| *area >= 3);
        cells.sort_by_key(|(bbox, _)| bbox.0);

        let mut output = String::new();
        for (bbox, _) in cells {
            let cell = imageops::crop_imm(text_img, bbox.0 as u32, bbox.1 as u32, bbox.2, bbox.3)
                .to_image();
            let grid = cell_grid(&cell);
            let mut best: Option<(char, f64)> = None;
            for ch in whitelist.chars() {
                let Some(reference) = font::glyph(ch) else { continue };
                let score = match backend {
                    "knn" => 1.0 - grid_distance(&grid, reference),
                    _ => grid_overlap(&grid, reference),
                };
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((ch, score));
                }
            }
            if let Some((ch, score)) = best {
                if score >= min_confidence {
                    output.push(ch);
                }
            }
        }
        tracing::debug!(target: "find.text", output = %output, "recognizer output");
        Ok(output)
    }
}

/// Bounding boxes and pixel areas of the non-background components.
fn component_boxes(binary: &GrayImage, connectivity: Connectivity) -> Vec<(Box2D, u32)> {
    let labels = connected_components(binary, connectivity, Luma([0u8]));
    let mut extents: std::collections::HashMap<u32, (i32, i32, i32, i32, u32)> =
        std::collections::HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        if label[0] == 0 {
            continue;
        }
        let entry = extents
            .entry(label[0])
            .or_insert((x as i32, y as i32, x as i32, y as i32, 0));
        entry.0 = entry.0.min(x as i32);
        entry.1 = entry.1.min(y as i32);
        entry.2 = entry.2.max(x as i32);
        entry.3 = entry.3.max(y as i32);
        entry.4 += 1;
    }
    extents
        .into_values()
        .map(|(x0, y0, x1, y1, area)| {
            (
                (x0, y0, (x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32),
                area,
            )
        })
        .collect()
}

fn component_boxes_positive(binary: &GrayImage) -> Vec<(Box2D, u32)> {
    component_boxes(binary, Connectivity::Eight)
}

fn boxes_close(a: Box2D, b: Box2D) -> bool {
    (a.0 - b.0).abs() <= 2
        && (a.1 - b.1).abs() <= 2
        && (a.2 as i32 - b.2 as i32).abs() <= 2
        && (a.3 as i32 - b.3 as i32).abs() <= 2
}

/// Produce a final set of nonintersecting rectangles by repeatedly merging
/// any two that intersect.
fn merge_nonintersecting(regions: Vec<Box2D>) -> Vec<Box2D> {
    let mut queue: Vec<(Box2D, bool)> = regions.into_iter().map(|r| (r, true)).collect();
    let mut merged = Vec::new();
    while queue.len() >= 2 {
        let (mut first, alive) = queue.remove(0);
        if !alive {
            continue;
        }
        for entry in queue.iter_mut() {
            let (other, other_alive) = *entry;
            if !other_alive {
                continue;
            }
            let intersects = first.0 < other.0 + other.2 as i32
                && first.0 + first.2 as i32 > other.0
                && first.1 < other.1 + other.3 as i32
                && first.1 + first.3 as i32 > other.1;
            if intersects {
                let nx = first.0.min(other.0);
                let ny = first.1.min(other.1);
                first = (
                    nx,
                    ny,
                    ((first.0 + first.2 as i32).max(other.0 + other.2 as i32) - nx) as u32,
                    ((first.1 + first.3 as i32).max(other.1 + other.3 as i32) - ny) as u32,
                );
                entry.1 = false;
            }
        }
        merged.push(first);
    }
    for (region, alive) in queue {
        if alive {
            merged.push(region);
        }
    }
    merged
}

/// Downsample a cell to the glyph grid as on/off ink flags.
fn cell_grid(cell: &GrayImage) -> Vec<bool> {
    let resized = imageops::resize(
        cell,
        font::GLYPH_WIDTH,
        font::GLYPH_HEIGHT,
        imageops::FilterType::Nearest,
    );
    resized.pixels().map(|p| p[0] > 127).collect()
}

fn glyph_flag(reference: &[u8; 5], index: usize) -> bool {
    let (col, row) = (index % font::GLYPH_WIDTH as usize, index / font::GLYPH_WIDTH as usize);
    reference[col] >> row & 1 == 1
}

/// Fraction of grid cells agreeing with the reference glyph.
fn grid_overlap(grid: &[bool], reference: &[u8; 5]) -> f64 {
    let total = grid.len().max(1);
    let agreeing = grid
        .iter()
        .enumerate()
        .filter(|(i, &ink)| ink == glyph_flag(reference, *i))
        .count();
    agreeing as f64 / total as f64
}

/// Normalized grid distance (the k-NN metric).
fn grid_distance(grid: &[bool], reference: &[u8; 5]) -> f64 {
    1.0 - grid_overlap(grid, reference)
}

impl Finder for TextFinder {
    fn backend_name(&self) -> &'static str {
        "text"
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
        if !matches!(
            category,
            "text" | "tdetect" | "ocr" | "contour" | "threshold" | "threshold2" | "threshold3"
        ) {
            return Err(finder::reject_category(category));
        }
        configure_text_category(&mut self.cfg, backend, category, reset)
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if !matches!(
            category,
            "text" | "tdetect" | "ocr" | "contour" | "threshold" | "threshold2" | "threshold3"
        ) {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)
    }

    fn configure(&mut self) -> Result<(), FindError> {
        configure_text_category(&mut self.cfg, None, "text", true)?;
        configure_text_category(&mut self.cfg, None, "tdetect", false)?;
        configure_text_category(&mut self.cfg, None, "ocr", false)?;
        configure_contour(&mut self.cfg, None, false)?;
        configure_threshold(&mut self.cfg, None, "threshold", false)?;
        configure_threshold(&mut self.cfg, None, "threshold2", false)?;
        configure_threshold(&mut self.cfg, None, "threshold3", false)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        for category in [
            "text", "tdetect", "ocr", "contour", "threshold", "threshold2", "threshold3",
        ] {
            self.synchronize_backend(None, category, false)?;
        }
        Ok(())
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let needle_text = expect_text(needle, self.backend_name())?.clone();
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;

        let pixels = (*haystack_image.pixels).clone();
        let regions = self.detect_regions(&pixels)?;
        let mut final_hotmap = pixels.clone();

        let required = self.cfg.fval("find", "similarity");
        let (dx, dy) = needle.center_offset;
        let mut matches = Vec::new();
        for region in regions {
            let text_img = self.preprocess_candidate(&pixels, region);
            self.imglog.hotmaps.push(raster::rgb_of_gray(&text_img));
            let output = self.recognize(&text_img)?;

            let denominator = output.chars().count().max(needle_text.value.chars().count());
            let similarity = if denominator == 0 {
                0.0
            } else {
                1.0 - needle_text.distance_to(&output) as f64 / denominator as f64
            };
            tracing::debug!(target: "find.text", output = %output, similarity, "candidate read");
            self.imglog.similarities.push(similarity);
            if similarity >= required {
                self.imglog.locations.push((region.0, region.1));
                raster::draw_match_rect(
                    &mut final_hotmap,
                    region.0,
                    region.1,
                    region.2,
                    region.3,
                    Rgb([255, 255, 255]),
                );
                matches.push(Match::new(
                    region.0, region.1, region.2, region.3, dx, dy, similarity,
                ));
            }
        }
        sort_best_first(&mut matches);

        self.imglog.hotmaps.push(final_hotmap);
        self.log(core_config::log_level::WARNING)?;
        Ok(matches)
    }

    fn log(&mut self, level: u32) -> Result<(), FindError> {
        finder::log_with(&mut self.imglog, level, |imglog| {
            let step = imglog.printable_step();
            imglog.dump_hotmap(&format!("imglog{step}-3hotmap-1char.png"), &imglog.hotmaps[0])?;
            imglog.dump_hotmap(&format!("imglog{step}-3hotmap-2text.png"), &imglog.hotmaps[1])?;
            for i in 2..imglog.hotmaps.len() - 1 {
                let name = format!(
                    "imglog{step}-3hotmap-3ocr-{}text-{}.png",
                    i - 1,
                    core_imglog::similarity_token(
                        imglog.similarities.get(i - 2).copied().unwrap_or(0.0)
                    )
                );
                imglog.dump_hotmap(&name, &imglog.hotmaps[i])?;
            }
            let best = imglog
                .similarities
                .iter()
                .copied()
                .fold(0.0f64, f64::max);
            let name = format!(
                "imglog{step}-3hotmap-{}.png",
                core_imglog::similarity_token(best)
            );
            let last = imglog.hotmaps.last().ok_or(core_imglog::LogError::MissingHotmap)?;
            imglog.dump_hotmap(&name, last)?;
            Ok(())
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

    fn text_scene(value: &str) -> RgbImage {
        crate::testutil::silence_imglog();
        font::render_text(value, 2, 12)
    }

    fn text_target(value: &str) -> Target {
        Target {
            data: crate::target::TargetData::Text(crate::target::TextData {
                value: value.to_owned(),
                text_file: None,
            }),
            settings: crate::target::MatchSettings::Inherit,
            center_offset: (0, 0),
        }
    }

    fn finder_with(detect: &str, ocr: &str, similarity: f64) -> TextFinder {
        let mut finder = TextFinder::new().unwrap();
        finder.configure_backend(Some(detect), "tdetect", false).unwrap();
        finder.configure_backend(Some(ocr), "ocr", false).unwrap();
        finder
            .config_mut()
            .set_value("find", "similarity", ParamValue::Float(similarity));
        finder
    }

    #[test]
    fn rendered_text_is_read_back_by_contour_detection() {
        let scene = text_scene("HELLO");
        let haystack = Target::image_from_pixels(scene);
        let needle = text_target("HELLO");
        let mut finder = finder_with("contours", "glyph", 0.8);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 1, "one text line expected");
        assert!(
            matches[0].similarity >= 0.8,
            "recognized with similarity {}",
            matches[0].similarity
        );
    }

    #[test]
    fn wrong_needle_text_scores_low() {
        let scene = text_scene("HELLO");
        let haystack = Target::image_from_pixels(scene);
        let needle = text_target("XYZQW");
        let mut finder = finder_with("contours", "glyph", 0.8);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn knn_recognizer_reads_digits() {
        let scene = text_scene("2026");
        let haystack = Target::image_from_pixels(scene);
        let needle = text_target("2026");
        let mut finder = finder_with("contours", "knn", 0.7);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].similarity >= 0.7);
    }

    #[test]
    fn erstat_detection_finds_the_text_line() {
        let scene = text_scene("HELLO");
        let haystack = Target::image_from_pixels(scene);
        let needle = text_target("HELLO");
        let mut finder = finder_with("erstat", "glyph", 0.6);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(!matches.is_empty(), "erstat should produce a text region");
        assert!(matches[0].similarity >= 0.6);
    }

    #[test]
    fn components_detection_is_not_implemented() {
        let scene = text_scene("HELLO");
        let haystack = Target::image_from_pixels(scene);
        let needle = text_target("HELLO");
        let mut finder = finder_with("components", "glyph", 0.5);
        assert!(matches!(
            finder.find(&needle, &haystack).unwrap_err(),
            FindError::NotImplemented(_)
        ));
    }

    #[test]
    fn beam_search_recognizer_is_not_implemented() {
        let scene = text_scene("HELLO");
        let haystack = Target::image_from_pixels(scene);
        let needle = text_target("HELLO");
        let mut finder = finder_with("contours", "beamSearch", 0.5);
        assert!(matches!(
            finder.find(&needle, &haystack).unwrap_err(),
            FindError::NotImplemented(_)
        ));
    }

    #[test]
    fn vertical_orientation_groups_stacked_glyphs() {
        crate::testutil::silence_imglog();
        // two 'O' glyphs stacked vertically with a small gap
        let mut scene = RgbImage::from_pixel(40, 60, Rgb([255, 255, 255]));
        for oy in [14u32, 34] {
            let cell = font::render_glyph('O', 2).unwrap();
            for (x, y, pixel) in cell.enumerate_pixels() {
                if pixel[0] > 0 {
                    scene.put_pixel(14 + x, oy + y, Rgb([0, 0, 0]));
                }
            }
        }
        let haystack = Target::image_from_pixels(scene);
        let needle = text_target("OO");
        let mut finder = finder_with("contours", "glyph", 0.7);
        finder
            .config_mut()
            .set_value("tdetect", "orientation", ParamValue::Int(1));
        finder
            .config_mut()
            .set_value("tdetect", "minChars", ParamValue::Int(1));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 1, "stacked glyphs form one vertical region");
        assert!(matches[0].similarity >= 0.7);
    }

    #[test]
    fn image_needles_are_incompatible() {
        let scene = text_scene("HELLO");
        let needle = Target::image_from_pixels(scene.clone());
        let haystack = Target::image_from_pixels(scene);
        let mut finder = finder_with("contours", "glyph", 0.5);
        assert!(matches!(
            finder.find(&needle, &haystack).unwrap_err(),
            FindError::IncompatibleTarget { .. }
        ));
    }
}
