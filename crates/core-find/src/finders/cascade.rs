//! Boosted Haar cascade detection.
//!
//! The pattern file is a cascade XML document: a base window size, an
//! ordered list of boosted stages (each a set of decision stumps over shared
//! Haar features with a stage rejection threshold), and the feature table
//! itself (weighted rectangle sums). Detection slides the scaled window over
//! an integral image of the haystack; a window must clear every stage to be
//! reported, and raw hits are grouped so that only locations confirmed by at
//! least `minNeighbors` overlapping windows survive.
//!
//! Feature values are normalized by the window area and the full intensity
//! range, so stump thresholds live in [-1, 1] regardless of window scale.
//! Only the HAAR feature type is evaluated; other cascade flavors are
//! rejected as unimplemented. The classifier reports no matching rate of its
//! own (a window is either accepted or rejected), so the configured
//! `find.similarity` is echoed as a placeholder.

use image::{GrayImage, Rgb};
use quick_xml::events::Event;
use quick_xml::Reader;
use core_imglog::ImageLogger;

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::matching::Match;
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::{expect_image, expect_pattern, Target};
use core_param::CvParameter;

#[derive(Debug, Clone, Copy)]
struct HaarRect {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    weight: f64,
}

#[derive(Debug, Clone, Default)]
struct HaarFeature {
    rects: Vec<HaarRect>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DecisionStump {
    feature: usize,
    threshold: f64,
    left_value: f64,
    right_value: f64,
}

#[derive(Debug, Clone, Default)]
struct CascadeStage {
    threshold: f64,
    stumps: Vec<DecisionStump>,
}

#[derive(Debug, Clone)]
pub(crate) struct CascadeClassifier {
    width: u32,
    height: u32,
    stages: Vec<CascadeStage>,
    features: Vec<HaarFeature>,
}

impl CascadeClassifier {
    pub(crate) fn from_xml(text: &str) -> Result<CascadeClassifier, FindError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<String> = Vec::new();
        let mut current_text = String::new();
        let mut feature_type = String::new();
        let mut width = 0u32;
        let mut height = 0u32;
        let mut stages: Vec<CascadeStage> = Vec::new();
        let mut features: Vec<HaarFeature> = Vec::new();
        let mut stage = CascadeStage::default();
        let mut stump = DecisionStump::default();
        let mut feature = HaarFeature::default();

        let invalid = |what: &str| FindError::InvalidMatchFile(format!("cascade data: {what}"));

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    stack.push(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                    current_text.clear();
                }
                Ok(Event::Text(text)) => {
                    current_text.push_str(&text.unescape().map_err(|e| invalid(&e.to_string()))?);
                }
                Ok(Event::End(_)) => {
                    let name = stack.pop().unwrap_or_default();
                    let parent = stack.last().map(String::as_str).unwrap_or("");
                    match (parent, name.as_str()) {
                        (_, "featureType") => feature_type = current_text.trim().to_owned(),
                        ("cascade", "width") => {
                            width = current_text.trim().parse().map_err(|_| invalid("width"))?;
                        }
                        ("cascade", "height") => {
                            height = current_text.trim().parse().map_err(|_| invalid("height"))?;
                        }
                        (_, "stageThreshold") => {
                            stage.threshold =
                                current_text.trim().parse().map_err(|_| invalid("stageThreshold"))?;
                        }
                        (_, "internalNodes") => {
                            let fields: Vec<&str> = current_text.split_whitespace().collect();
                            if fields.len() != 4 {
                                return Err(invalid("internalNodes must hold four fields"));
                            }
                            stump.feature =
                                fields[2].parse().map_err(|_| invalid("feature index"))?;
                            stump.threshold =
                                fields[3].parse().map_err(|_| invalid("stump threshold"))?;
                        }
                        (_, "leafValues") => {
                            let leaves: Vec<f64> = current_text
                                .split_whitespace()
                                .map(|v| v.parse().map_err(|_| invalid("leaf value")))
                                .collect::<Result<_, _>>()?;
                            if leaves.len() != 2 {
                                return Err(invalid("stumps carry exactly two leaves"));
                            }
                            stump.left_value = leaves[0];
                            stump.right_value = leaves[1];
                        }
                        ("weakClassifiers", "_") => {
                            stage.stumps.push(stump);
                            stump = DecisionStump::default();
                        }
                        ("stages", "_") => {
                            stages.push(std::mem::take(&mut stage));
                        }
                        ("rects", "_") => {
                            let fields: Vec<f64> = current_text
                                .split_whitespace()
                                .map(|v| {
                                    v.trim_end_matches('.')
                                        .parse()
                                        .map_err(|_| invalid("rect field"))
                                })
                                .collect::<Result<_, _>>()?;
                            if fields.len() != 5 {
                                return Err(invalid("rects hold x y w h weight"));
                            }
                            feature.rects.push(HaarRect {
                                x: fields[0] as i32,
                                y: fields[1] as i32,
                                w: fields[2] as i32,
                                h: fields[3] as i32,
                                weight: fields[4],
                            });
                        }
                        ("features", "_") => {
                            features.push(std::mem::take(&mut feature));
                        }
                        _ => {}
                    }
                    current_text.clear();
                }
                Ok(Event::Eof) => break,
                Err(err) => return Err(invalid(&err.to_string())),
                _ => {}
            }
        }

        if feature_type != "HAAR" {
            return Err(FindError::NotImplemented(
                "only HAAR feature cascades are evaluated",
            ));
        }
        if width == 0 || height == 0 || stages.is_empty() || features.is_empty() {
            return Err(invalid("missing window size, stages, or features"));
        }
        Ok(CascadeClassifier {
            width,
            height,
            stages,
            features,
        })
    }

    /// Multi-scale sliding-window detection over an integral image.
    fn detect(
        &self,
        gray: &GrayImage,
        scale_factor: f64,
        min_neighbors: i64,
        min_size: (u32, u32),
        max_size: (u32, u32),
    ) -> Vec<(i32, i32, u32, u32)> {
        let (image_w, image_h) = gray.dimensions();
        let stride = (image_w + 1) as usize;
        let mut integral = vec![0u64; stride * (image_h + 1) as usize];
        for y in 0..image_h as usize {
            let mut row = 0u64;
            for x in 0..image_w as usize {
                row += gray.get_pixel(x as u32, y as u32)[0] as u64;
                integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
            }
        }
        let rect_sum = |x: i32, y: i32, w: i32, h: i32| -> f64 {
            let (x0, y0) = (x.max(0) as usize, y.max(0) as usize);
            let x1 = ((x + w).max(0) as usize).min(image_w as usize);
            let y1 = ((y + h).max(0) as usize).min(image_h as usize);
            if x1 <= x0 || y1 <= y0 {
                return 0.0;
            }
            (integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0]) as f64
        };

        let mut raw = Vec::new();
        let scale_factor = scale_factor.max(1.05);
        let mut scale = 1.0f64;
        loop {
            let window_w = (self.width as f64 * scale).round() as u32;
            let window_h = (self.height as f64 * scale).round() as u32;
            if window_w > image_w || window_h > image_h {
                break;
            }
            let oversized = (max_size.0 > 0 && window_w > max_size.0)
                || (max_size.1 > 0 && window_h > max_size.1);
            if oversized {
                break;
            }
            if window_w >= min_size.0 && window_h >= min_size.1 {
                let step = scale.round().max(1.0) as u32;
                let area = (window_w * window_h) as f64;
                for y in (0..=image_h - window_h).step_by(step as usize) {
                    for x in (0..=image_w - window_w).step_by(step as usize) {
                        if self.window_passes(x as i32, y as i32, scale, area, &rect_sum) {
                            raw.push((x as i32, y as i32, window_w, window_h));
                        }
                    }
                }
            }
            scale *= scale_factor;
        }

        if min_neighbors <= 0 {
            return raw;
        }
        group_rectangles(&raw, min_neighbors as usize)
    }

    fn window_passes(
        &self,
        ox: i32,
        oy: i32,
        scale: f64,
        window_area: f64,
        rect_sum: &dyn Fn(i32, i32, i32, i32) -> f64,
    ) -> bool {
        for stage in &self.stages {
            let mut score = 0.0;
            for stump in &stage.stumps {
                let Some(feature) = self.features.get(stump.feature) else {
                    return false;
                };
                let mut value = 0.0;
                for rect in &feature.rects {
                    let sum = rect_sum(
                        ox + (rect.x as f64 * scale).round() as i32,
                        oy + (rect.y as f64 * scale).round() as i32,
                        (rect.w as f64 * scale).round() as i32,
                        (rect.h as f64 * scale).round() as i32,
                    );
                    value += rect.weight * sum;
                }
                let normalized = value / (255.0 * window_area);
                score += if normalized < stump.threshold {
                    stump.left_value
                } else {
                    stump.right_value
                };
            }
            if score < stage.threshold {
                return false;
            }
        }
        true
    }
}

/// Average overlapping detections, dropping clusters thinner than
/// `min_neighbors` members.
fn group_rectangles(raw: &[(i32, i32, u32, u32)], min_neighbors: usize) -> Vec<(i32, i32, u32, u32)> {
    let mut clusters: Vec<(i64, i64, i64, i64, usize)> = Vec::new();
    for &(x, y, w, h) in raw {
        let mut merged = false;
        for cluster in clusters.iter_mut() {
            let cx = cluster.0 / cluster.4 as i64;
            let cy = cluster.1 / cluster.4 as i64;
            let cw = cluster.2 / cluster.4 as i64;
            let delta = (0.2 * 0.5 * (cw + w as i64) as f64) as i64;
            if (x as i64 - cx).abs() <= delta && (y as i64 - cy).abs() <= delta {
                cluster.0 += x as i64;
                cluster.1 += y as i64;
                cluster.2 += w as i64;
                cluster.3 += h as i64;
                cluster.4 += 1;
                merged = true;
                break;
            }
        }
        if !merged {
            clusters.push((x as i64, y as i64, w as i64, h as i64, 1));
        }
    }
    clusters
        .into_iter()
        .filter(|c| c.4 >= min_neighbors)
        .map(|(sx, sy, sw, sh, n)| {
            let n = n as i64;
            ((sx / n) as i32, (sy / n) as i32, (sw / n) as u32, (sh / n) as u32)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CascadeFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
}

impl CascadeFinder {
    pub fn new() -> Result<CascadeFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        cfg.register("cascade", "cascade_methods", &["none"]);
        let mut this = CascadeFinder {
            cfg,
            imglog: ImageLogger::new(),
        };
        this.configure_backend(None, "cascade", true)?;
        Ok(this)
    }
}

impl Finder for CascadeFinder {
    fn backend_name(&self) -> &'static str {
        "cascade"
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
        _backend: Option<&str>,
        category: &str,
        reset: bool,
    ) -> Result<(), FindError> {
        if category != "cascade" {
            return Err(finder::reject_category(category));
        }
        if reset {
            finder::configure_find(&mut self.cfg, Some("cascade"), true)?;
        }
        self.cfg.set_category(
            "cascade",
            CategoryParams::new("none")
                .with("scaleFactor", CvParameter::float(1.1, Some(1.05), None).with_delta(0.1, 0.01))
                .with("minNeighbors", CvParameter::int(3, Some(0), None).with_delta(1.0, 0.9))
                .with("minWidth", CvParameter::int(0, Some(0), None).with_delta(100.0, 1.0))
                .with("maxWidth", CvParameter::int(1000, Some(0), None).with_delta(100.0, 1.0))
                .with("minHeight", CvParameter::int(0, Some(0), None).with_delta(100.0, 1.0))
                .with("maxHeight", CvParameter::int(1000, Some(0), None).with_delta(100.0, 1.0)),
        );
        Ok(())
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if category != "cascade" {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)
    }

    fn configure(&mut self) -> Result<(), FindError> {
        self.configure_backend(None, "cascade", true)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        self.synchronize_backend(None, "cascade", false)
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let pattern = expect_pattern(needle, self.backend_name())?;
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;

        let xml = std::fs::read_to_string(&pattern.data_file)?;
        let classifier = CascadeClassifier::from_xml(&xml)?;
        let gray = raster::gray_of_rgb(&haystack_image.pixels);
        let mut canvas = (*haystack_image.pixels).clone();

        let rects = classifier.detect(
            &gray,
            self.cfg.fval("cascade", "scaleFactor"),
            self.cfg.ival("cascade", "minNeighbors"),
            (
                self.cfg.ival("cascade", "minWidth").max(0) as u32,
                self.cfg.ival("cascade", "minHeight").max(0) as u32,
            ),
            (
                self.cfg.ival("cascade", "maxWidth").max(0) as u32,
                self.cfg.ival("cascade", "maxHeight").max(0) as u32,
            ),
        );

        // the classifier is binary, so the configured similarity stands in
        let similarity = self.cfg.fval("find", "similarity");
        let (dx, dy) = needle.center_offset;
        let mut matches = Vec::new();
        for (x, y, w, h) in rects {
            raster::draw_match_rect(&mut canvas, x, y, w, h, Rgb([255, 0, 0]));
            self.imglog.locations.push((x, y));
            matches.push(Match::new(x, y, w, h, dx, dy, similarity));
        }
        self.imglog.similarities.push(similarity);
        self.imglog.hotmaps.push(canvas);
        self.log(core_config::log_level::WARNING)?;
        Ok(matches)
    }

    fn log(&mut self, level: u32) -> Result<(), FindError> {
        finder::log_with(&mut self.imglog, level, finder::emit_final_hotmap)
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

    /// One stage, one stump: fires when the bottom half of the window is
    /// brighter than the top half by a comfortable margin.
    fn edge_cascade_xml(stage_threshold: f64) -> String {
        format!(
            r#"<?xml version="1.0"?>
<opencv_storage>
<cascade>
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>12</height>
  <width>12</width>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>{stage_threshold}</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>0 -1 0 0.25</internalNodes>
          <leafValues>0.0 1.0</leafValues>
        </_>
      </weakClassifiers>
    </_>
  </stages>
  <features>
    <_>
      <rects>
        <_>0 0 12 12 -1.</_>
        <_>0 6 12 6 2.</_>
      </rects>
    </_>
  </features>
</cascade>
</opencv_storage>
"#
        )
    }

    fn banded_scene() -> RgbImage {
        let mut canvas = RgbImage::from_pixel(60, 40, Rgb([255, 255, 255]));
        // dark band: the top half of any window starting around y = 10
        for y in 10u32..16 {
            for x in 10u32..50 {
                canvas.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        canvas
    }

    fn write_cascade(dir: &std::path::Path, threshold: f64) -> std::path::PathBuf {
        let path = dir.join("edge_cascade.xml");
        std::fs::write(&path, edge_cascade_xml(threshold)).unwrap();
        path
    }

    #[test]
    fn classifier_parses_the_xml_structure() {
        let classifier = CascadeClassifier::from_xml(&edge_cascade_xml(0.5)).unwrap();
        assert_eq!((classifier.width, classifier.height), (12, 12));
        assert_eq!(classifier.stages.len(), 1);
        assert_eq!(classifier.stages[0].stumps.len(), 1);
        assert_eq!(classifier.features[0].rects.len(), 2);
    }

    #[test]
    fn non_haar_cascades_are_not_implemented() {
        let xml = edge_cascade_xml(0.5).replace("HAAR", "LBP");
        assert!(matches!(
            CascadeClassifier::from_xml(&xml),
            Err(FindError::NotImplemented(_))
        ));
    }

    #[test]
    fn dark_over_bright_edges_are_detected() {
        crate::testutil::silence_imglog();
        let dir = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(dir.path(), 0.5);
        let needle = Target::pattern(&cascade_path.to_string_lossy()).unwrap();
        let haystack = Target::image_from_pixels(banded_scene());
        let mut finder = CascadeFinder::new().unwrap();
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(!matches.is_empty(), "band edge should trigger the cascade");
        // every reported window straddles the dark band
        for m in &matches {
            assert!(m.y >= 5 && m.y <= 16, "window at y = {}", m.y);
            assert_eq!(m.similarity, finder.config().fval("find", "similarity"));
        }
    }

    #[test]
    fn impossible_stage_threshold_rejects_everything() {
        crate::testutil::silence_imglog();
        let dir = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(dir.path(), 1.0e9);
        let needle = Target::pattern(&cascade_path.to_string_lossy()).unwrap();
        let haystack = Target::image_from_pixels(banded_scene());
        let mut finder = CascadeFinder::new().unwrap();
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn size_limits_filter_scales() {
        crate::testutil::silence_imglog();
        let dir = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(dir.path(), 0.5);
        let needle = Target::pattern(&cascade_path.to_string_lossy()).unwrap();
        let haystack = Target::image_from_pixels(banded_scene());
        let mut finder = CascadeFinder::new().unwrap();
        finder
            .config_mut()
            .set_value("cascade", "maxWidth", ParamValue::Int(6));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty(), "no window can fit under maxWidth 6");
    }

    #[test]
    fn image_needles_are_incompatible() {
        crate::testutil::silence_imglog();
        let needle = Target::image_from_pixels(banded_scene());
        let haystack = Target::image_from_pixels(banded_scene());
        let mut finder = CascadeFinder::new().unwrap();
        assert!(matches!(
            finder.find(&needle, &haystack).unwrap_err(),
            FindError::IncompatibleTarget { .. }
        ));
    }
}
