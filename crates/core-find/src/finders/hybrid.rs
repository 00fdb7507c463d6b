//! Fallback-chain matching.
//!
//! A chain target holds an ordered sequence of sub-targets, each optionally
//! carrying its own finder configuration. Matching walks the chain in
//! document order: a step with own settings runs under them, any other step
//! runs under the hybrid's default matcher (the `hybrid` category backend),
//! and the first step producing a non-empty match list wins. A non-chain
//! needle is treated as a one-step chain.

use core_imglog::ImageLogger;

use crate::errors::FindError;
use crate::finder::{self, finder_for_backend, Finder};
use crate::matching::Match;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::{MatchSettings, Target, TargetData};

pub const HYBRID_BACKENDS: [&str; 8] = [
    "bitmap", "contour", "template", "feature", "cascade", "text", "tempfeat", "deep",
];

pub struct HybridFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
    /// Default matcher for steps without their own settings, bound by
    /// synchronization.
    matcher: Option<Box<dyn Finder>>,
}

impl Clone for HybridFinder {
    fn clone(&self) -> Self {
        HybridFinder {
            cfg: self.cfg.clone(),
            imglog: self.imglog.clone(),
            matcher: self.matcher.as_ref().map(|m| m.duplicate()),
        }
    }
}

impl std::fmt::Debug for HybridFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridFinder")
            .field("matcher", &self.matcher.as_ref().map(|m| m.backend_name()))
            .finish_non_exhaustive()
    }
}

impl HybridFinder {
    pub fn new() -> Result<HybridFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        cfg.register("hybrid", "hybrid_methods", &HYBRID_BACKENDS);
        let mut this = HybridFinder {
            cfg,
            imglog: ImageLogger::new(),
            matcher: None,
        };
        this.configure_backend(None, "hybrid", true)?;
        Ok(this)
    }

    fn default_matcher(&mut self) -> Result<&mut Box<dyn Finder>, FindError> {
        if self.matcher.is_none() {
            self.synchronize_backend(None, "hybrid", false)?;
        }
        self.matcher
            .as_mut()
            .ok_or_else(|| FindError::UninitializedBackend("hybrid".to_owned()))
    }
}

impl Finder for HybridFinder {
    fn backend_name(&self) -> &'static str {
        "hybrid"
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
        if category != "hybrid" {
            return Err(finder::reject_category(category));
        }
        if reset {
            finder::configure_find(&mut self.cfg, Some("hybrid"), true)?;
        }
        let backend = match backend {
            Some(b) => b.to_owned(),
            None => core_config::with(|s| s.hybrid_match_backend.clone()),
        };
        self.cfg.ensure_supported("hybrid", &backend)?;
        self.cfg.set_category("hybrid", CategoryParams::new(&backend));
        Ok(())
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if category != "hybrid" {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)?;
        let configured = self
            .cfg
            .backend("hybrid")
            .unwrap_or("template")
            .to_owned();
        self.matcher = Some(finder_for_backend(&configured)?);
        Ok(())
    }

    fn configure(&mut self) -> Result<(), FindError> {
        self.configure_backend(None, "hybrid", true)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        self.synchronize_backend(None, "hybrid", false)
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let single_step;
        let steps: &[Target] = match &needle.data {
            TargetData::Chain(chain) => &chain.steps,
            _ => {
                tracing::debug!(target: "find.hybrid", "defaulting to one step chain");
                single_step = [needle.clone()];
                &single_step
            }
        };

        for step in steps {
            let matches = match &step.settings {
                // a step bringing hybrid settings would recurse; run it under
                // the default matcher like an unconfigured step
                MatchSettings::Own(settings) if settings.backend_name() != "hybrid" => {
                    let mut matcher = settings.duplicate();
                    matcher.find(step, haystack)
                }
                _ => self.default_matcher()?.find(step, haystack),
            };
            let found = matches?;
            if !found.is_empty() {
                return Ok(found);
            }
            tracing::debug!(target: "find.hybrid", "chain step found nothing, falling back");
        }
        Ok(Vec::new())
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
    use crate::matchfile;
    use crate::steps;
    use crate::target::ChainData;
    use core_param::ParamValue;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    fn scene() -> RgbImage {
        crate::testutil::silence_imglog();
        let mut canvas = RgbImage::from_pixel(120, 90, Rgb([255, 255, 255]));
        for y in 30u32..60 {
            for x in 40u32..90 {
                canvas.put_pixel(x, y, Rgb([180, 40, 40]));
            }
        }
        canvas
    }

    fn crop(image: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
        image::imageops::crop_imm(image, x, y, w, h).to_image()
    }

    fn write_template_match(dir: &Path, name: &str, similarity: f64) {
        let mut finder = finder_for_backend("template").unwrap();
        finder
            .config_mut()
            .set_value("find", "similarity", ParamValue::Float(similarity));
        matchfile::to_file(finder.config(), &dir.join(name)).unwrap();
    }

    fn write_bitmap_match(dir: &Path, name: &str) {
        let mut finder = finder_for_backend("bitmap").unwrap();
        finder
            .config_mut()
            .set_value("find", "similarity", ParamValue::Float(1.0));
        matchfile::to_file(finder.config(), &dir.join(name)).unwrap();
    }

    fn chain_target(dir: &Path, name: &str) -> Target {
        let steps = steps::load(&dir.join(format!("{name}.steps"))).unwrap();
        Target {
            data: TargetData::Chain(ChainData {
                name: name.to_owned(),
                steps,
            }),
            settings: MatchSettings::Inherit,
            center_offset: (0, 0),
        }
    }

    #[test]
    fn first_failing_step_falls_through_to_the_second() {
        let dir = tempfile::tempdir().unwrap();
        let scene = scene();
        // step 1: a bitmap that exists nowhere in the scene
        RgbImage::from_pixel(20, 20, Rgb([0, 255, 0]))
            .save(dir.path().join("missing.png"))
            .unwrap();
        write_bitmap_match(dir.path(), "missing.match");
        // step 2: a template crop that does exist
        crop(&scene, 36, 26, 58, 38)
            .save(dir.path().join("present.png"))
            .unwrap();
        write_template_match(dir.path(), "present.match", 0.8);
        std::fs::write(
            dir.path().join("fallback.steps"),
            "missing.png\tmissing.match\npresent.png\tpresent.match\n",
        )
        .unwrap();

        let needle = chain_target(dir.path(), "fallback");
        let haystack = Target::image_from_pixels(scene);
        let mut finder = HybridFinder::new().unwrap();
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 1, "second step must provide the match");
        assert!((matches[0].x - 36).abs() <= 1 && (matches[0].y - 26).abs() <= 1);
    }

    #[test]
    fn chain_order_prefers_the_first_succeeding_step() {
        let dir = tempfile::tempdir().unwrap();
        let scene = scene();
        crop(&scene, 36, 26, 58, 38)
            .save(dir.path().join("first.png"))
            .unwrap();
        write_template_match(dir.path(), "first.match", 0.8);
        crop(&scene, 36, 26, 40, 30)
            .save(dir.path().join("second.png"))
            .unwrap();
        write_template_match(dir.path(), "second.match", 0.8);
        std::fs::write(
            dir.path().join("ordered.steps"),
            "first.png\tfirst.match\nsecond.png\tsecond.match\n",
        )
        .unwrap();

        let needle = chain_target(dir.path(), "ordered");
        let haystack = Target::image_from_pixels(scene);
        let mut finder = HybridFinder::new().unwrap();
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 1);
        // the first step's needle is the wider crop
        assert_eq!(matches[0].width, 58);
    }

    #[test]
    fn non_chain_needle_is_a_one_step_chain() {
        let scene = scene();
        let needle = Target::image_from_pixels(crop(&scene, 36, 26, 58, 38));
        let haystack = Target::image_from_pixels(scene);
        let mut finder = HybridFinder::new().unwrap();
        // default hybrid backend is template matching
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(!matches.is_empty());
        assert!((matches[0].x - 36).abs() <= 1);
    }

    #[test]
    fn empty_chain_matches_nothing() {
        let needle = Target {
            data: TargetData::Chain(ChainData {
                name: "empty".into(),
                steps: Vec::new(),
            }),
            settings: MatchSettings::Inherit,
            center_offset: (0, 0),
        };
        let haystack = Target::image_from_pixels(scene());
        let mut finder = HybridFinder::new().unwrap();
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }
}
