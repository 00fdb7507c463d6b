//! Pixel-exact bitmap matching.
//!
//! The simplest backend: slide the needle over the haystack and accept the
//! first window whose every channel of every pixel lies within the tolerance
//! `255 * (1 - find.similarity)`. At most one match is returned, and since
//! the scan reports no matching rate of its own the configured similarity is
//! echoed back on success.

use image::Rgb;
use core_imglog::ImageLogger;

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::matching::Match;
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::{expect_image, Target};

#[derive(Debug, Clone)]
pub struct BitmapFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
}

impl BitmapFinder {
    pub fn new() -> Result<BitmapFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        cfg.register("bitmap", "bitmap_methods", &["none"]);
        let mut this = BitmapFinder {
            cfg,
            imglog: ImageLogger::new(),
        };
        this.configure_backend(None, "bitmap", true)?;
        Ok(this)
    }
}

impl Finder for BitmapFinder {
    fn backend_name(&self) -> &'static str {
        "bitmap"
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
        if category != "bitmap" {
            return Err(finder::reject_category(category));
        }
        if reset {
            finder::configure_find(&mut self.cfg, Some("bitmap"), true)?;
        }
        self.cfg.set_category("bitmap", CategoryParams::new("none"));
        Ok(())
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if category != "bitmap" {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)
    }

    fn configure(&mut self) -> Result<(), FindError> {
        self.configure_backend(None, "bitmap", true)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        self.synchronize_backend(None, "bitmap", false)
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let needle_image = expect_image(needle, self.backend_name())?;
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;

        let similarity = self.cfg.fval("find", "similarity");
        let tolerance = (255.0 * (1.0 - similarity)).round() as i16;
        tracing::debug!(
            target: "find.bitmap",
            tolerance,
            "performing bitmap matching (color)"
        );

        let mut hotmap = (*haystack_image.pixels).clone();
        let (nw, nh) = (needle_image.width(), needle_image.height());
        let (hw, hh) = (haystack_image.width(), haystack_image.height());
        let mut matches = Vec::new();

        if nw <= hw && nh <= hh {
            'scan: for y in 0..=(hh - nh) {
                for x in 0..=(hw - nw) {
                    if window_within_tolerance(needle_image, haystack_image, x, y, tolerance) {
                        let (dx, dy) = needle.center_offset;
                        matches.push(Match::new(x as i32, y as i32, nw, nh, dx, dy, similarity));
                        self.imglog.locations.push((x as i32, y as i32));
                        self.imglog.similarities.push(similarity);
                        raster::draw_match_rect(
                            &mut hotmap,
                            x as i32,
                            y as i32,
                            nw,
                            nh,
                            Rgb([0, 0, 255]),
                        );
                        break 'scan;
                    }
                }
            }
        } else {
            tracing::warn!(
                target: "find.bitmap",
                "the searched image ({nw}x{nh}) is larger than its region ({hw}x{hh})"
            );
        }

        self.imglog.hotmaps.push(hotmap);
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

fn window_within_tolerance(
    needle: &crate::target::ImageData,
    haystack: &crate::target::ImageData,
    ox: u32,
    oy: u32,
    tolerance: i16,
) -> bool {
    for (nx, ny, pixel) in needle.pixels.enumerate_pixels() {
        let hp = haystack.pixels.get_pixel(ox + nx, oy + ny);
        for channel in 0..3 {
            let delta = (pixel[channel] as i16 - hp[channel] as i16).abs();
            if delta > tolerance {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetData;
    use image::RgbImage;

    fn shapes_canvas() -> RgbImage {
        crate::testutil::silence_imglog();
        let mut canvas = RgbImage::from_pixel(120, 90, Rgb([255, 255, 255]));
        for y in 10..40 {
            for x in 60..100 {
                canvas.put_pixel(x, y, Rgb([0, 0, 255]));
            }
        }
        for y in 50..80 {
            for x in 10..40 {
                canvas.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        canvas
    }

    fn crop(image: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
        image::imageops::crop_imm(image, x, y, w, h).to_image()
    }

    #[test]
    fn exact_subimage_matches_once_at_its_location() {
        let haystack_pixels = shapes_canvas();
        let needle = Target::image_from_pixels(crop(&haystack_pixels, 55, 5, 50, 40));
        let haystack = Target::image_from_pixels(haystack_pixels);

        let mut finder = BitmapFinder::new().unwrap();
        finder
            .config_mut()
            .set_value("find", "similarity", core_param::ParamValue::Float(1.0));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].x, matches[0].y), (55, 5));
        assert_eq!((matches[0].width, matches[0].height), (50, 40));
    }

    #[test]
    fn distinct_needle_produces_no_match() {
        let haystack = Target::image_from_pixels(shapes_canvas());
        let needle = Target::image_from_pixels(RgbImage::from_pixel(20, 20, Rgb([0, 255, 0])));
        let mut finder = BitmapFinder::new().unwrap();
        finder
            .config_mut()
            .set_value("find", "similarity", core_param::ParamValue::Float(1.0));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn tolerance_allows_small_pixel_noise() {
        let clean = shapes_canvas();
        let mut noisy = clean.clone();
        for pixel in noisy.pixels_mut() {
            pixel[0] = pixel[0].saturating_add(6);
        }
        let needle = Target::image_from_pixels(crop(&clean, 10, 50, 30, 30));
        let haystack = Target::image_from_pixels(noisy);
        let mut finder = BitmapFinder::new().unwrap();
        finder
            .config_mut()
            .set_value("find", "similarity", core_param::ParamValue::Float(0.9));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn text_needles_are_incompatible() {
        let haystack = Target::image_from_pixels(shapes_canvas());
        let needle = Target {
            data: TargetData::Text(crate::target::TextData {
                value: "hello".into(),
                text_file: None,
            }),
            settings: crate::target::MatchSettings::Inherit,
            center_offset: (0, 0),
        };
        let mut finder = BitmapFinder::new().unwrap();
        let err = finder.find(&needle, &haystack).unwrap_err();
        assert!(matches!(err, FindError::IncompatibleTarget { .. }));
    }
}
