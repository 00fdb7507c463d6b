//! Template-then-feature hybrid matching.
//!
//! Template matching is strong on large, feature-abundant regions but picky;
//! feature matching is robust on small regions but noisy when candidates
//! abound. The hybrid runs a coarse template pass at the lower
//! `tempfeat.front_similarity`, then re-examines each surviving candidate
//! with the feature pipeline on a needle-sized crop. A candidate that passes
//! keeps the template-derived location (more stable) with the feature
//! similarity. When every feature attempt lands at exactly zero similarity
//! the needle is feature poor and the template results filtered by
//! `find.similarity` stand in for all of them, even if one candidate was
//! excellent. The whole run happens under image-log accumulation so the
//! inner stages flush as one step.

use image::Rgb;
use core_imglog::ImageLogger;
use core_param::{CvParameter, ParamValue};

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::finders::{feature, template};
use crate::matching::Match;
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::{expect_image, Target};

/// Restores the previous accumulation state even on error paths.
struct AccumulationScope {
    previous: bool,
}

impl AccumulationScope {
    fn enter() -> AccumulationScope {
        let previous = core_imglog::accumulating();
        core_imglog::set_accumulate(true);
        AccumulationScope { previous }
    }
}

impl Drop for AccumulationScope {
    fn drop(&mut self) {
        core_imglog::set_accumulate(self.previous);
    }
}

#[derive(Debug, Clone)]
pub struct TemplateFeatureFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
}

impl TemplateFeatureFinder {
    pub fn new() -> Result<TemplateFeatureFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        cfg.register("tempfeat", "tempfeat_matchers", &["mixed"]);
        template::register(&mut cfg);
        feature::register(&mut cfg);
        let mut this = TemplateFeatureFinder {
            cfg,
            imglog: ImageLogger::new(),
        };
        this.configure()?;
        Ok(this)
    }

    fn configure_tempfeat(&mut self, backend: Option<&str>, reset: bool) -> Result<(), FindError> {
        if reset {
            finder::configure_find(&mut self.cfg, Some("tempfeat"), true)?;
        }
        let backend = backend.unwrap_or("mixed");
        self.cfg.ensure_supported("tempfeat", backend)?;
        self.cfg.set_category(
            "tempfeat",
            CategoryParams::new(backend).with(
                "front_similarity",
                CvParameter::float(0.7, Some(0.0), Some(1.0)),
            ),
        );
        Ok(())
    }
}

impl Finder for TemplateFeatureFinder {
    fn backend_name(&self) -> &'static str {
        "tempfeat"
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
            "tempfeat" => self.configure_tempfeat(backend, reset),
            "template" => template::configure_template(&mut self.cfg, backend, reset),
            "feature" | "fdetect" | "fextract" | "fmatch" => {
                feature::configure_feature_category(&mut self.cfg, backend, category, reset)
            }
            other => Err(finder::reject_category(other)),
        }
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if !matches!(
            category,
            "tempfeat" | "template" | "feature" | "fdetect" | "fextract" | "fmatch"
        ) {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)
    }

    fn configure(&mut self) -> Result<(), FindError> {
        self.configure_tempfeat(None, true)?;
        template::configure_template(&mut self.cfg, None, false)?;
        feature::configure_feature_category(&mut self.cfg, None, "feature", false)?;
        feature::configure_feature_category(&mut self.cfg, None, "fdetect", false)?;
        feature::configure_feature_category(&mut self.cfg, None, "fextract", false)?;
        feature::configure_feature_category(&mut self.cfg, None, "fmatch", false)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        for category in ["tempfeat", "template", "feature", "fdetect", "fextract", "fmatch"] {
            self.synchronize_backend(None, category, false)?;
        }
        Ok(())
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let needle_image = expect_image(needle, self.backend_name())?;
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;

        // accumulate one template and multiple feature cases into one step
        let accumulation = AccumulationScope::enter();

        let template_similarity = self.cfg.fval("tempfeat", "front_similarity");
        let feature_similarity = self.cfg.fval("find", "similarity");
        tracing::debug!(
            target: "find.tempfeat",
            template_similarity,
            feature_similarity,
            "matching with front and final similarity"
        );

        self.cfg
            .set_value("find", "similarity", ParamValue::Float(template_similarity));
        let template_result = template::find_template(
            &self.cfg,
            &mut self.imglog,
            needle_image,
            haystack_image,
            needle.center_offset,
        );
        self.cfg
            .set_value("find", "similarity", ParamValue::Float(feature_similarity));
        let template_maxima = template_result?;

        let ngray = raster::gray_of_rgb(&needle_image.pixels);
        let hgray = raster::gray_of_rgb(&haystack_image.pixels);
        let mut final_hotmap = (*haystack_image.pixels).clone();
        let (nw, nh) = (needle_image.width(), needle_image.height());
        let (hw, hh) = (haystack_image.width(), haystack_image.height());

        let mut feature_maxima: Vec<(f64, (i32, i32))> = Vec::new();
        let mut is_feature_poor = false;
        for (i, upleft) in template_maxima.iter().enumerate() {
            let left = upleft.x.clamp(0, hw as i32 - 1) as u32;
            let up = upleft.y.clamp(0, hh as i32 - 1) as u32;
            let right = (left + nw).min(hw);
            let down = (up + nh).min(hh);
            tracing::debug!(
                target: "find.tempfeat",
                "feature check on candidate region {left},{up} to {right},{down}"
            );
            let region_gray =
                image::imageops::crop_imm(&hgray, left, up, right - left, down - up).to_image();
            let region_rgb = image::imageops::crop_imm(
                &*haystack_image.pixels,
                left,
                up,
                right - left,
                down - up,
            )
            .to_image();
            for _ in 0..4 {
                self.imglog.hotmaps.push(region_rgb.clone());
            }

            let projected = feature::project_features(
                &self.cfg,
                &mut self.imglog,
                &[(0.0, 0.0)],
                &ngray,
                &region_gray,
                feature_similarity,
            )?;
            let attempt_similarity = self.imglog.similarities.last().copied().unwrap_or(0.0);
            let template_similarity_i = self.imglog.similarities.get(i).copied().unwrap_or(0.0);

            if projected.is_some()
                || (attempt_similarity > 0.0
                    && attempt_similarity < template_similarity_i
                    && template_similarity_i > feature_similarity)
            {
                // prefer the template location for stability; both should
                // ultimately coincide
                if let Some(last) = self.imglog.locations.last_mut() {
                    *last = (left as i32, up as i32);
                }
                feature_maxima.push((attempt_similarity, (left as i32, up as i32)));
            } else if attempt_similarity == 0.0 {
                is_feature_poor = true;
            }
        }

        if is_feature_poor {
            tracing::warn!(
                target: "find.tempfeat",
                "feature poor needle detected, falling back to template matching"
            );
            // template results are ordered best first, so the fallback list
            // stays ordered as well
            feature_maxima = template_maxima
                .iter()
                .enumerate()
                .filter(|(i, _)| {
                    self.imglog.similarities.get(*i).copied().unwrap_or(0.0) >= feature_similarity
                })
                .map(|(i, m)| {
                    (
                        self.imglog.similarities.get(i).copied().unwrap_or(0.0),
                        (m.x, m.y),
                    )
                })
                .collect();
        }

        drop(accumulation);

        if feature_maxima.is_empty() {
            tracing::debug!(
                target: "find.tempfeat",
                feature_similarity,
                "no acceptable match with the required feature similarity"
            );
            if self.imglog.similarities.len() > 1 {
                // dump a hotmap for debugging even on feature-stage failure
                self.imglog.hotmaps.push(final_hotmap);
                let idx = template_maxima.len().min(self.imglog.similarities.len() - 1);
                let sim = self.imglog.similarities[idx];
                let loc = self.imglog.locations.get(idx).copied().unwrap_or((0, 0));
                self.imglog.similarities.push(sim);
                self.imglog.locations.push(loc);
            } else if let Some(first) = self.imglog.hotmaps.first().cloned() {
                // only the template hotmap is of interest on a template miss
                self.imglog.hotmaps.push(first);
            }
            self.log(core_config::log_level::WARNING)?;
            return Ok(Vec::new());
        }

        feature_maxima.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let (dx, dy) = needle.center_offset;
        let mut matches = Vec::new();
        for &(similarity, (x, y)) in &feature_maxima {
            raster::draw_match_rect(&mut final_hotmap, x, y, nw, nh, Rgb([0, 0, 255]));
            matches.push(Match::new(x, y, nw, nh, dx, dy, similarity));
        }
        self.imglog.hotmaps.push(final_hotmap);
        let best = feature_maxima[0];
        self.imglog.similarities.push(best.0);
        self.imglog.locations.push(best.1);

        self.log(core_config::log_level::WARNING)?;
        Ok(matches)
    }

    fn log(&mut self, level: u32) -> Result<(), FindError> {
        finder::log_with(&mut self.imglog, level, |imglog| {
            let step = imglog.printable_step();
            let candidates = imglog.similarities.len() / 2;
            for i in 0..candidates {
                if let Some(hotmap) = imglog.hotmaps.get(i) {
                    let name = format!(
                        "imglog{step}-3hotmap-{}template-{}.png",
                        i + 1,
                        core_imglog::similarity_token(imglog.similarities[i])
                    );
                    imglog.dump_hotmap(&name, hotmap)?;
                }
                // the project-stage crop of this candidate's feature attempt
                let crop_index = candidates + 1 + 4 * i + 3;
                if let (Some(hotmap), Some(similarity)) = (
                    imglog.hotmaps.get(crop_index),
                    imglog.similarities.get(candidates + i),
                ) {
                    let name = format!(
                        "imglog{step}-3hotmap-{}feature-{}.png",
                        i + 1,
                        core_imglog::similarity_token(*similarity)
                    );
                    imglog.dump_hotmap(&name, hotmap)?;
                }
            }
            if imglog.similarities.len() % 2 == 1 {
                finder::emit_final_hotmap(imglog)?;
            }
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
    use crate::finders::feature::tests::noise_canvas;
    use image::RgbImage;

    fn crop(image: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
        image::imageops::crop_imm(image, x, y, w, h).to_image()
    }

    fn finder_with(front: f64, fin: f64) -> TemplateFeatureFinder {
        let mut finder = TemplateFeatureFinder::new().unwrap();
        finder
            .config_mut()
            .set_value("tempfeat", "front_similarity", ParamValue::Float(front));
        finder
            .config_mut()
            .set_value("find", "similarity", ParamValue::Float(fin));
        finder
    }

    #[test]
    fn textured_crop_passes_both_stages() {
        let scene = noise_canvas(150, 120);
        let needle = Target::image_from_pixels(crop(&scene, 30, 20, 70, 60));
        let haystack = Target::image_from_pixels(scene);
        let mut finder = finder_with(0.7, 0.4);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(!matches.is_empty());
        let best = &matches[0];
        assert!((best.x - 30).abs() <= 2 && (best.y - 20).abs() <= 2);
        assert!(best.similarity >= 0.4);
        assert!(!core_imglog::accumulating(), "accumulation restored on exit");
    }

    #[test]
    fn feature_poor_needle_falls_back_to_template() {
        // a solid box offers template peaks but no corners to describe
        let mut scene = RgbImage::from_pixel(120, 90, Rgb([255, 255, 255]));
        for y in 20u32..50 {
            for x in 30u32..70 {
                scene.put_pixel(x, y, Rgb([10, 10, 200]));
            }
        }
        let needle = Target::image_from_pixels(crop(&scene, 25, 15, 50, 40));
        let haystack = Target::image_from_pixels(scene);
        let mut finder = finder_with(0.6, 0.8);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(
            !matches.is_empty(),
            "template fallback should accept the solid box"
        );
        assert!((matches[0].x - 25).abs() <= 2 && (matches[0].y - 15).abs() <= 2);
        assert!(!core_imglog::accumulating());
    }

    #[test]
    fn missing_needle_yields_empty_result() {
        let scene = noise_canvas(120, 90);
        let needle = Target::image_from_pixels(RgbImage::from_pixel(40, 30, Rgb([0, 128, 0])));
        let haystack = Target::image_from_pixels(scene);
        let mut finder = finder_with(0.9, 0.9);
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
        assert!(!core_imglog::accumulating());
    }
}
