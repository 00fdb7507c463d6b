//! Raster preprocessing shared by the contour and text finders.
//!
//! The `threshold`-style categories drive a two-stage binarization: an
//! optional blur (box, median, or Gaussian) followed by one of the fixed,
//! adaptive, or Canny edge backends. Kernel sizes are expected to be odd;
//! the calibrator snaps even values before every run and [`binarize`] guards
//! once more so a hand-written match file cannot produce a skewed kernel.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_hollow_rect_mut};
use imageproc::filter::{box_filter, gaussian_blur_f32, median_filter};
use imageproc::rect::Rect;

use crate::settings::LocalConfig;

/// Grayscale view of an RGB raster.
pub fn gray_of_rgb(rgb: &RgbImage) -> GrayImage {
    image::imageops::grayscale(rgb)
}

/// Widen a grayscale raster back to RGB for drawing overlays on it.
pub fn rgb_of_gray(gray: &GrayImage) -> RgbImage {
    let mut rgb = RgbImage::new(gray.width(), gray.height());
    for (x, y, pixel) in gray.enumerate_pixels() {
        rgb.put_pixel(x, y, Rgb([pixel[0], pixel[0], pixel[0]]));
    }
    rgb
}

/// Render a correlation surface (values in [0, 1]) as a grayscale hotmap.
pub fn surface_to_hotmap(surface: &image::ImageBuffer<Luma<f32>, Vec<f32>>) -> RgbImage {
    let mut out = RgbImage::new(surface.width(), surface.height());
    for (x, y, pixel) in surface.enumerate_pixels() {
        let v = (pixel[0].clamp(0.0, 1.0) * 255.0) as u8;
        out.put_pixel(x, y, Rgb([v, v, v]));
    }
    out
}

/// Standard match annotation: a heavy dark frame with a colored inline.
pub fn draw_match_rect(canvas: &mut RgbImage, x: i32, y: i32, w: u32, h: u32, accent: Rgb<u8>) {
    if w == 0 || h == 0 {
        return;
    }
    if w > 2 && h > 2 {
        draw_hollow_rect_mut(
            canvas,
            Rect::at(x + 1, y + 1).of_size(w - 2, h - 2),
            Rgb([0, 0, 0]),
        );
    }
    draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w, h), Rgb([0, 0, 0]));
    draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w, h), accent);
}

pub fn draw_marker_circle(canvas: &mut RgbImage, x: i32, y: i32, radius: i32, accent: Rgb<u8>) {
    draw_hollow_circle_mut(canvas, (x, y), radius.max(1), accent);
}

fn odd(size: i64) -> u32 {
    let size = size.max(1);
    if size % 2 == 0 { size as u32 + 1 } else { size as u32 }
}

/// Apply the configured blur stage of a `threshold`-style category.
fn blur(cfg: &LocalConfig, category: &str, gray: &GrayImage) -> GrayImage {
    let kernel = odd(cfg.ival(category, "blurKernelSize"));
    let radius = kernel / 2;
    match cfg.ival(category, "blurType") {
        1 => box_filter(gray, radius, radius),
        2 => median_filter(gray, radius, radius),
        3 => {
            let sigma = cfg.fval(category, "blurKernelSigma") as f32;
            // derive a sigma from the kernel size when none is configured
            let sigma = if sigma <= 0.0 {
                0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
            } else {
                sigma
            };
            gaussian_blur_f32(gray, sigma.max(0.1))
        }
        _ => gray.clone(),
    }
}

/// Fixed-threshold variants matching the `thresholdType` enumeration.
fn fixed_threshold(gray: &GrayImage, value: u8, max: u8, kind: i64) -> GrayImage {
    let level = match kind {
        6 => imageproc::contrast::otsu_level(gray),
        7 => triangle_level(gray),
        _ => value,
    };
    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, pixel) in gray.enumerate_pixels() {
        let v = pixel[0];
        let binary = if v > level { max } else { 0 };
        let mapped = match kind {
            1 => if v > level { 0 } else { max },
            2 => v.min(level),
            3 => if v > level { v } else { 0 },
            4 => if v > level { 0 } else { v },
            _ => binary,
        };
        out.put_pixel(x, y, Luma([mapped]));
    }
    out
}

/// Triangle threshold selection over the grayscale histogram.
fn triangle_level(gray: &GrayImage) -> u8 {
    let mut histogram = [0u32; 256];
    for pixel in gray.pixels() {
        histogram[pixel[0] as usize] += 1;
    }
    let peak = (0..256).max_by_key(|&i| histogram[i]).unwrap_or(0);
    let tail = if peak > 127 {
        (0..256).find(|&i| histogram[i] > 0).unwrap_or(0)
    } else {
        (0..256).rev().find(|&i| histogram[i] > 0).unwrap_or(255)
    };
    let (px, py) = (peak as f64, histogram[peak] as f64);
    let (tx, ty) = (tail as f64, histogram[tail] as f64);
    let norm = ((ty - py).powi(2) + (tx - px).powi(2)).sqrt();
    if norm == 0.0 {
        return peak as u8;
    }
    let mut best = peak;
    let mut best_distance = 0.0;
    let range: Box<dyn Iterator<Item = usize>> = if tail > peak {
        Box::new(peak..=tail)
    } else {
        Box::new(tail..=peak)
    };
    for i in range {
        let distance = ((ty - py) * (i as f64 - px) - (tx - px) * (histogram[i] as f64 - py)).abs() / norm;
        if distance > best_distance {
            best_distance = distance;
            best = i;
        }
    }
    best as u8
}

/// Mean-window adaptive threshold with the configured block size and
/// constant, using a summed-area table for the local means.
fn adaptive_mean(gray: &GrayImage, block: u32, constant: f64, max: u8, inverted: bool) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut integral = vec![0u64; ((w + 1) * (h + 1)) as usize];
    let stride = (w + 1) as usize;
    for y in 0..h as usize {
        let mut row = 0u64;
        for x in 0..w as usize {
            row += gray.get_pixel(x as u32, y as u32)[0] as u64;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
        }
    }
    let radius = (block / 2) as i64;
    let mut out = GrayImage::new(w, h);
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let x0 = (x - radius).max(0) as usize;
            let y0 = (y - radius).max(0) as usize;
            let x1 = (x + radius + 1).min(w as i64) as usize;
            let y1 = (y + radius + 1).min(h as i64) as usize;
            let area = ((x1 - x0) * (y1 - y0)) as f64;
            let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0];
            let mean = sum as f64 / area;
            let v = gray.get_pixel(x as u32, y as u32)[0] as f64;
            let above = v > mean - constant;
            let on = above != inverted;
            out.put_pixel(x as u32, y as u32, Luma([if on { max } else { 0 }]));
        }
    }
    out
}

/// Gaussian-weighted adaptive threshold: the local mean is a Gaussian blur.
fn adaptive_gaussian(
    gray: &GrayImage,
    block: u32,
    constant: f64,
    max: u8,
    inverted: bool,
) -> GrayImage {
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let means = gaussian_blur_f32(gray, sigma.max(0.1));
    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, pixel) in gray.enumerate_pixels() {
        let mean = means.get_pixel(x, y)[0] as f64;
        let above = pixel[0] as f64 > mean - constant;
        let on = above != inverted;
        out.put_pixel(x, y, Luma([if on { max } else { 0 }]));
    }
    out
}

/// Binarize a grayscale raster according to a `threshold`-style category
/// (`threshold`, `threshold2`, or `threshold3`): blur first to suppress
/// noise-born edges, then apply the active threshold backend.
pub fn binarize(cfg: &LocalConfig, category: &str, gray: &GrayImage) -> GrayImage {
    let blurred = blur(cfg, category, gray);
    match cfg.backend(category).unwrap_or("normal") {
        "adaptive" => {
            let block = odd(cfg.ival(category, "blockSize"));
            let constant = cfg.fval(category, "constant");
            let max = cfg.ival(category, "thresholdMax").clamp(0, 255) as u8;
            let inverted = cfg.ival(category, "thresholdType") == 1;
            match cfg.ival(category, "adaptiveMethod") {
                1 => adaptive_gaussian(&blurred, block, constant, max, inverted),
                _ => adaptive_mean(&blurred, block, constant, max, inverted),
            }
        }
        "canny" => imageproc::edges::canny(
            &blurred,
            cfg.fval(category, "threshold1") as f32,
            cfg.fval(category, "threshold2") as f32,
        ),
        _ => fixed_threshold(
            &blurred,
            cfg.ival(category, "thresholdValue").clamp(0, 255) as u8,
            cfg.ival(category, "thresholdMax").clamp(0, 255) as u8,
            cfg.ival(category, "thresholdType"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder;
    use crate::finders::contour;

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(x * 255 / width.max(1)) as u8]))
    }

    fn contour_config(threshold_backend: &str) -> LocalConfig {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        contour::register(&mut cfg);
        finder::configure_find(&mut cfg, Some("contour"), true).unwrap();
        contour::configure_contour(&mut cfg, None, false).unwrap();
        contour::configure_threshold(&mut cfg, Some(threshold_backend), "threshold", false).unwrap();
        cfg
    }

    #[test]
    fn fixed_binary_threshold_splits_a_gradient() {
        let cfg = contour_config("normal");
        let binary = binarize(&cfg, "threshold", &gradient(64, 8));
        let left = binary.get_pixel(2, 4)[0];
        let right = binary.get_pixel(61, 4)[0];
        // default type is inverted binary: dark side on, bright side off
        assert_eq!(left, 255);
        assert_eq!(right, 0);
    }

    #[test]
    fn adaptive_threshold_marks_local_contrast() {
        let cfg = contour_config("adaptive");
        let mut img = GrayImage::from_pixel(32, 32, Luma([200]));
        for y in 12..20 {
            for x in 12..20 {
                img.put_pixel(x, y, Luma([20]));
            }
        }
        let binary = binarize(&cfg, "threshold", &img);
        // inverted adaptive: the dark square stands out as foreground
        assert_eq!(binary.get_pixel(15, 15)[0], 255);
        assert_eq!(binary.get_pixel(2, 2)[0], 0);
    }

    #[test]
    fn canny_marks_strong_edges_only() {
        let mut cfg = contour_config("canny");
        cfg.set_value(
            "threshold",
            "threshold2",
            core_param::ParamValue::Float(200.0),
        );
        let mut img = GrayImage::from_pixel(32, 32, Luma([0]));
        for y in 0..32 {
            for x in 16..32 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let edges = binarize(&cfg, "threshold", &img);
        let edge_pixels = edges.pixels().filter(|p| p[0] > 0).count();
        assert!(edge_pixels > 0, "vertical step edge must be detected");
    }

    #[test]
    fn even_kernel_sizes_are_snapped_to_odd() {
        assert_eq!(odd(4), 5);
        assert_eq!(odd(5), 5);
        assert_eq!(odd(0), 1);
    }
}
