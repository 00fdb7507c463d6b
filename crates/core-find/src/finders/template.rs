//! Template matching over normalized correlation surfaces.
//!
//! Three backends: normalized squared difference (inverted so that maximum
//! is always best), normalized cross-correlation, and zero-mean normalized
//! cross-correlation. The surface is clamped to [0, 1] and peaks are
//! extracted iteratively, wiping a needle-half-sized region around each
//! accepted peak so overlapping rediscoveries are suppressed. A zero
//! similarity threshold returns only the single best peak, which keeps the
//! extraction loop finite.

use image::{ImageBuffer, Luma, Rgb};
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use core_imglog::ImageLogger;

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::matching::Match;
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::{expect_image, ImageData, Target};

pub const TEMPLATE_BACKENDS: [&str; 3] = ["sqdiff_normed", "ccorr_normed", "ccoeff_normed"];

type Surface = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Register the template category on a configuration.
pub fn register(cfg: &mut LocalConfig) {
    cfg.register("template", "template_matchers", &TEMPLATE_BACKENDS);
}

/// Generate the template category schema.
pub fn configure_template(
    cfg: &mut LocalConfig,
    backend: Option<&str>,
    reset: bool,
) -> Result<(), FindError> {
    if reset {
        finder::configure_find(cfg, Some("template"), true)?;
    }
    let backend = match backend {
        Some(b) => b.to_owned(),
        None => core_config::with(|s| s.template_match_backend.clone()),
    };
    cfg.ensure_supported("template", &backend)?;
    tracing::debug!(target: "find.template", backend = %backend, "setting backend for template");
    cfg.set_category(
        "template",
        CategoryParams::new(&backend).with("nocolor", core_param::CvParameter::boolean(false)),
    );
    Ok(())
}

/// Zero-mean normalized cross-correlation surface of one channel.
fn zncc_surface(haystack: &image::GrayImage, needle: &image::GrayImage) -> Surface {
    let (hw, hh) = haystack.dimensions();
    let (nw, nh) = needle.dimensions();
    let (rw, rh) = (hw - nw + 1, hh - nh + 1);
    let area = (nw * nh) as f64;

    let needle_values: Vec<f64> = needle.pixels().map(|p| p[0] as f64).collect();
    let needle_mean = needle_values.iter().sum::<f64>() / area;
    let needle_centered: Vec<f64> = needle_values.iter().map(|v| v - needle_mean).collect();
    let needle_norm = needle_centered.iter().map(|v| v * v).sum::<f64>().sqrt();

    // summed-area tables for the window statistics
    let stride = (hw + 1) as usize;
    let mut sums = vec![0.0f64; stride * (hh + 1) as usize];
    let mut squares = vec![0.0f64; stride * (hh + 1) as usize];
    for y in 0..hh as usize {
        let mut row = 0.0;
        let mut row_sq = 0.0;
        for x in 0..hw as usize {
            let v = haystack.get_pixel(x as u32, y as u32)[0] as f64;
            row += v;
            row_sq += v * v;
            sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            squares[(y + 1) * stride + x + 1] = squares[y * stride + x + 1] + row_sq;
        }
    }
    let window = |table: &[f64], x: usize, y: usize| {
        table[(y + nh as usize) * stride + x + nw as usize] + table[y * stride + x]
            - table[y * stride + x + nw as usize]
            - table[(y + nh as usize) * stride + x]
    };

    let mut surface = Surface::new(rw, rh);
    for y in 0..rh as usize {
        for x in 0..rw as usize {
            let mut cross = 0.0f64;
            for (i, centered) in needle_centered.iter().enumerate() {
                let (dx, dy) = (i as u32 % nw, i as u32 / nw);
                cross += centered
                    * haystack.get_pixel(x as u32 + dx, y as u32 + dy)[0] as f64;
            }
            let w_sum = window(&sums, x, y);
            let w_sq = window(&squares, x, y);
            // subtract the window-mean times the (zero-sum) template term
            let w_var = (w_sq - w_sum * w_sum / area).max(0.0);
            let denominator = needle_norm * w_var.sqrt();
            let value = if denominator < f64::EPSILON {
                0.0
            } else {
                cross / denominator
            };
            surface.put_pixel(x as u32, y as u32, Luma([value as f32]));
        }
    }
    surface
}

fn average_surfaces(mut surfaces: Vec<Surface>) -> Surface {
    let first = surfaces.remove(0);
    let mut combined = first;
    for surface in &surfaces {
        for (x, y, pixel) in combined.enumerate_pixels_mut() {
            pixel[0] += surface.get_pixel(x, y)[0];
        }
    }
    let count = (surfaces.len() + 1) as f32;
    for pixel in combined.pixels_mut() {
        pixel[0] /= count;
    }
    combined
}

fn channel_planes(rgb: &image::RgbImage) -> [image::GrayImage; 3] {
    let (w, h) = rgb.dimensions();
    let mut planes = [
        image::GrayImage::new(w, h),
        image::GrayImage::new(w, h),
        image::GrayImage::new(w, h),
    ];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            planes[c].put_pixel(x, y, Luma([pixel[c]]));
        }
    }
    planes
}

/// Compute the correlation surface for the configured method. Color
/// matching evaluates the three channel planes and averages them.
pub(crate) fn match_surface(
    needle: &ImageData,
    haystack: &ImageData,
    nocolor: bool,
    method: &str,
) -> Result<Option<Surface>, FindError> {
    if haystack.width() < needle.width() || haystack.height() < needle.height() {
        tracing::warn!(
            target: "find.template",
            "the size of the searched image ({}x{}) exceeds its region ({}x{})",
            needle.width(),
            needle.height(),
            haystack.width(),
            haystack.height()
        );
        return Ok(None);
    }
    let proc_method = match method {
        "sqdiff_normed" => Some(MatchTemplateMethod::SumOfSquaredErrorsNormalized),
        "ccorr_normed" => Some(MatchTemplateMethod::CrossCorrelationNormalized),
        "ccoeff_normed" => None,
        other => return Err(FindError::unsupported(other, &TEMPLATE_BACKENDS)),
    };

    let run_channel = |h: &image::GrayImage, n: &image::GrayImage| -> Surface {
        match proc_method {
            Some(m) => match_template(h, n, m),
            None => zncc_surface(h, n),
        }
    };

    let surface = if nocolor {
        let ngray = raster::gray_of_rgb(&needle.pixels);
        let hgray = raster::gray_of_rgb(&haystack.pixels);
        run_channel(&hgray, &ngray)
    } else {
        let nplanes = channel_planes(&needle.pixels);
        let hplanes = channel_planes(&haystack.pixels);
        let surfaces: Vec<Surface> = nplanes
            .iter()
            .zip(hplanes.iter())
            .map(|(n, h)| run_channel(h, n))
            .collect();
        average_surfaces(surfaces)
    };
    Ok(Some(surface))
}

fn best_peak(surface: &Surface) -> (u32, u32, f32) {
    let mut best = (0, 0, f32::NEG_INFINITY);
    for (x, y, pixel) in surface.enumerate_pixels() {
        if pixel[0] > best.2 {
            best = (x, y, pixel[0]);
        }
    }
    best
}

/// The shared template matching loop, also driven by the template-feature
/// hybrid. Appends one marked surface hotmap per recorded similarity and the
/// final annotated haystack.
pub(crate) fn find_template(
    cfg: &LocalConfig,
    imglog: &mut ImageLogger,
    needle: &ImageData,
    haystack: &ImageData,
    center_offset: (i32, i32),
) -> Result<Vec<Match>, FindError> {
    let method = cfg
        .backend("template")
        .ok_or_else(|| FindError::UninitializedBackend("template".to_owned()))?
        .to_owned();
    cfg.ensure_supported("template", &method)?;
    let nocolor = cfg.bval("template", "nocolor");
    tracing::debug!(
        target: "find.template",
        method = %method,
        "performing template matching {} color",
        if nocolor { "without" } else { "with" }
    );

    let Some(mut surface) = match_surface(needle, haystack, nocolor, &method)? else {
        return Ok(Vec::new());
    };
    // switch minimum-is-best methods to maximum-is-best
    if method == "sqdiff_normed" {
        for pixel in surface.pixels_mut() {
            pixel[0] = 1.0 - pixel[0];
        }
    }
    for pixel in surface.pixels_mut() {
        // degenerate windows (zero variance) can yield non-finite scores
        pixel[0] = if pixel[0].is_finite() {
            pixel[0].clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    let universal_hotmap = raster::surface_to_hotmap(&surface);
    let mut final_hotmap = (*haystack.pixels).clone();
    let similarity = cfg.fval("find", "similarity");
    let (nw, nh) = (needle.width(), needle.height());
    let (rw, rh) = surface.dimensions();
    let mut matches = Vec::new();

    loop {
        let (x, y, value) = best_peak(&surface);
        let value = value.clamp(0.0, 1.0) as f64;
        tracing::debug!(
            target: "find.template",
            value,
            similarity,
            "next best match at ({x}, {y})"
        );

        if value < similarity {
            if matches.is_empty() {
                // keep the best rejected candidate for diagnosis
                record_candidate(imglog, &universal_hotmap, x, y, value);
            }
            break;
        }

        record_candidate(imglog, &universal_hotmap, x, y, value);
        raster::draw_match_rect(&mut final_hotmap, x as i32, y as i32, nw, nh, Rgb([255, 255, 255]));
        matches.push(Match::new(
            x as i32,
            y as i32,
            nw,
            nh,
            center_offset.0,
            center_offset.1,
            value,
        ));
        if similarity == 0.0 {
            // a zero threshold accepts everything; stop at the single best
            break;
        }

        let x0 = x.saturating_sub(nw / 2);
        let x1 = (x + nw / 2).min(rw);
        let y0 = y.saturating_sub(nh / 2);
        let y1 = (y + nh / 2).min(rh);
        for wy in y0..y1 {
            for wx in x0..x1 {
                surface.put_pixel(wx, wy, Luma([0.0]));
            }
        }
    }

    tracing::debug!(target: "find.template", "a total of {} matches found", matches.len());
    imglog.hotmaps.push(final_hotmap);
    Ok(matches)
}

fn record_candidate(imglog: &mut ImageLogger, universal: &image::RgbImage, x: u32, y: u32, value: f64) {
    let mut marked = universal.clone();
    raster::draw_marker_circle(
        &mut marked,
        x as i32,
        y as i32,
        (30.0 * value) as i32,
        Rgb([255, 255, 255]),
    );
    imglog.hotmaps.push(marked);
    imglog.similarities.push(value);
    imglog.locations.push((x as i32, y as i32));
}

/// Emit the per-candidate surface hotmaps followed by the final canonical
/// hotmap.
pub(crate) fn emit_template_hotmaps(imglog: &mut ImageLogger) -> Result<(), FindError> {
    for i in 0..imglog.similarities.len() {
        let name = format!(
            "imglog{}-3hotmap-{}template-{}.png",
            imglog.printable_step(),
            i + 1,
            core_imglog::similarity_token(imglog.similarities[i])
        );
        let hotmap = &imglog.hotmaps[i];
        imglog.dump_hotmap(&name, hotmap)?;
    }
    finder::emit_final_hotmap(imglog)
}

#[derive(Debug, Clone)]
pub struct TemplateFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
}

impl TemplateFinder {
    pub fn new() -> Result<TemplateFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        register(&mut cfg);
        let mut this = TemplateFinder {
            cfg,
            imglog: ImageLogger::new(),
        };
        this.configure_backend(None, "template", true)?;
        Ok(this)
    }
}

impl Finder for TemplateFinder {
    fn backend_name(&self) -> &'static str {
        "template"
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
        if category != "template" {
            return Err(finder::reject_category(category));
        }
        configure_template(&mut self.cfg, backend, reset)
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if category != "template" {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)
    }

    fn configure(&mut self) -> Result<(), FindError> {
        self.configure_backend(None, "template", true)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        self.synchronize_backend(None, "template", false)
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let needle_image = expect_image(needle, self.backend_name())?;
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;
        let matches = find_template(
            &self.cfg,
            &mut self.imglog,
            needle_image,
            haystack_image,
            needle.center_offset,
        )?;
        self.log(core_config::log_level::WARNING)?;
        Ok(matches)
    }

    fn log(&mut self, level: u32) -> Result<(), FindError> {
        finder::log_with(&mut self.imglog, level, emit_template_hotmaps)
    }

    fn duplicate(&self) -> Box<dyn Finder> {
        Box::new(self.clone())
    }
}
