//! Convolutional detector matching.
//!
//! A small convolutional network (two conv+pool blocks and two linear
//! layers) maps a grayscale view of the haystack, centered and padded to the
//! configured input size, onto a probability grid of `owidth * oheight`
//! location cells plus one no-location class. Cells whose probability clears
//! `find.similarity` become matches, scaled back to haystack coordinates.
//!
//! Weights load from a named-tensor CSV file (one row per tensor: the tensor
//! name followed by its flat values); without a pattern data file the
//! network keeps its deterministic architecture-seeded initialization, which
//! exercises the full pipeline but carries no trained knowledge. Networks
//! are cached process-wide by architecture string with latest-wins
//! replacement. Training requires an autograd stack this workspace does not
//! carry, so `train` reports unimplemented while `test` evaluates a stored
//! model's accuracy with forward passes only.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex};

use image::{imageops, Rgb};
use ndarray::{Array1, Array2, Array3, Array4};
use core_imglog::ImageLogger;

use crate::errors::FindError;
use crate::finder::{self, Finder};
use crate::matching::Match;
use crate::raster;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::{expect_image, expect_pattern, Target};
use core_param::CvParameter;

static NET_CACHE: LazyLock<Mutex<HashMap<String, Arc<DeepNet>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Geometry of the network derived from the `deep` category parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Architecture {
    iwidth: usize,
    iheight: usize,
    owidth: usize,
    oheight: usize,
    channels1: usize,
    kernel1: usize,
    pool1: usize,
    channels2: usize,
    kernel2: usize,
    pool2: usize,
    linear1: usize,
}

impl Architecture {
    fn from_config(cfg: &LocalConfig) -> Architecture {
        Architecture {
            iwidth: cfg.ival("deep", "iwidth").max(1) as usize,
            iheight: cfg.ival("deep", "iheight").max(1) as usize,
            owidth: cfg.ival("deep", "owidth").max(1) as usize,
            oheight: cfg.ival("deep", "oheight").max(1) as usize,
            channels1: cfg.ival("deep", "channels_conv1").max(1) as usize,
            kernel1: cfg.ival("deep", "kernel_conv1").max(1) as usize,
            pool1: cfg.ival("deep", "kernel_pool1").max(1) as usize,
            channels2: cfg.ival("deep", "channels_conv2").max(1) as usize,
            kernel2: cfg.ival("deep", "kernel_conv2").max(1) as usize,
            pool2: cfg.ival("deep", "kernel_pool2").max(1) as usize,
            linear1: cfg.ival("deep", "outputs_linear1").max(1) as usize,
        }
    }

    fn key(&self) -> String {
        format!(
            "deep-i{}x{}-o{}x{}-c{}k{}p{}-c{}k{}p{}-f{}",
            self.iwidth,
            self.iheight,
            self.owidth,
            self.oheight,
            self.channels1,
            self.kernel1,
            self.pool1,
            self.channels2,
            self.kernel2,
            self.pool2,
            self.linear1
        )
    }

    /// Spatial extent after the two conv+pool blocks.
    fn reduced(&self) -> (usize, usize) {
        let rw = ((self.iwidth - self.kernel1 + 1) / self.pool1 - self.kernel2 + 1) / self.pool2;
        let rh = ((self.iheight - self.kernel1 + 1) / self.pool1 - self.kernel2 + 1) / self.pool2;
        (rw, rh)
    }

    fn classes(&self) -> usize {
        self.owidth * self.oheight + 1
    }
}

#[derive(Debug)]
pub(crate) struct DeepNet {
    arch: Architecture,
    conv1_weight: Array4<f32>,
    conv1_bias: Array1<f32>,
    conv2_weight: Array4<f32>,
    conv2_bias: Array1<f32>,
    fc1_weight: Array2<f32>,
    fc1_bias: Array1<f32>,
    fc2_weight: Array2<f32>,
    fc2_bias: Array1<f32>,
}

impl DeepNet {
    /// Architecture-seeded deterministic initialization.
    fn initialized(arch: Architecture) -> DeepNet {
        let mut state: u64 = arch
            .key()
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
            });
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // small symmetric weights
            (state >> 11) as f32 / (1u64 << 53) as f32 * 0.2 - 0.05
        };
        let (rw, rh) = arch.reduced();
        let n = rw * rh * arch.channels2;
        let conv1_weight =
            Array4::from_shape_simple_fn((arch.channels1, 1, arch.kernel1, arch.kernel1), &mut next);
        let conv1_bias = Array1::from_shape_simple_fn(arch.channels1, &mut next);
        let conv2_weight = Array4::from_shape_simple_fn(
            (arch.channels2, arch.channels1, arch.kernel2, arch.kernel2),
            &mut next,
        );
        let conv2_bias = Array1::from_shape_simple_fn(arch.channels2, &mut next);
        let fc1_weight = Array2::from_shape_simple_fn((arch.linear1, n), &mut next);
        let fc1_bias = Array1::from_shape_simple_fn(arch.linear1, &mut next);
        let fc2_weight = Array2::from_shape_simple_fn((arch.classes(), arch.linear1), &mut next);
        let fc2_bias = Array1::from_shape_simple_fn(arch.classes(), &mut next);
        DeepNet {
            arch,
            conv1_weight,
            conv1_bias,
            conv2_weight,
            conv2_bias,
            fc1_weight,
            fc1_bias,
            fc2_weight,
            fc2_bias,
        }
    }

    /// Load named tensors from a CSV weight file over a fresh network.
    fn from_weight_file(arch: Architecture, path: &Path) -> Result<DeepNet, FindError> {
        let mut net = DeepNet::initialized(arch);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|e| FindError::InvalidMatchFile(format!("weight file: {e}")))?;
        for record in reader.records() {
            let record = record.map_err(|e| FindError::InvalidMatchFile(format!("weight row: {e}")))?;
            let mut fields = record.iter();
            let Some(name) = fields.next() else { continue };
            let values: Vec<f32> = fields
                .map(|v| {
                    v.trim()
                        .parse()
                        .map_err(|_| FindError::InvalidMatchFile(format!("weight value {v:?}")))
                })
                .collect::<Result<_, _>>()?;
            net.assign(name, &values)?;
        }
        Ok(net)
    }

    fn assign(&mut self, name: &str, values: &[f32]) -> Result<(), FindError> {
        let mismatch = |expected: usize| {
            FindError::InvalidMatchFile(format!(
                "tensor {name} holds {} values, expected {expected}",
                values.len()
            ))
        };
        match name {
            "conv1.weight" => fill4(&mut self.conv1_weight, values).map_err(mismatch),
            "conv1.bias" => fill1(&mut self.conv1_bias, values).map_err(mismatch),
            "conv2.weight" => fill4(&mut self.conv2_weight, values).map_err(mismatch),
            "conv2.bias" => fill1(&mut self.conv2_bias, values).map_err(mismatch),
            "fc1.weight" => fill2(&mut self.fc1_weight, values).map_err(mismatch),
            "fc1.bias" => fill1(&mut self.fc1_bias, values).map_err(mismatch),
            "fc2.weight" => fill2(&mut self.fc2_weight, values).map_err(mismatch),
            "fc2.bias" => fill1(&mut self.fc2_bias, values).map_err(mismatch),
            other => {
                tracing::warn!(target: "find.deep", "skipping unknown tensor {other}");
                Ok(())
            }
        }
    }

    /// Inference pass over one normalized grayscale input.
    pub(crate) fn forward(&self, input: &Array2<f32>) -> Array1<f32> {
        let arch = &self.arch;
        let stacked = input
            .clone()
            .into_shape((1, arch.iheight, arch.iwidth))
            .unwrap_or_else(|_| Array3::zeros((1, arch.iheight, arch.iwidth)));
        let conv1 = convolve(&stacked, &self.conv1_weight, &self.conv1_bias);
        let pooled1 = relu3(max_pool(&conv1, arch.pool1));
        let conv2 = convolve(&pooled1, &self.conv2_weight, &self.conv2_bias);
        let pooled2 = relu3(max_pool(&conv2, arch.pool2));

        let flat: Array1<f32> = Array1::from_iter(pooled2.iter().copied());
        let hidden = relu1(self.fc1_weight.dot(&flat) + &self.fc1_bias);
        relu1(self.fc2_weight.dot(&hidden) + &self.fc2_bias)
    }

    /// Probability distribution over the location classes.
    pub(crate) fn probabilities(&self, input: &Array2<f32>) -> Array1<f32> {
        softmax(self.forward(input))
    }
}

fn fill1(target: &mut Array1<f32>, values: &[f32]) -> Result<(), usize> {
    if values.len() != target.len() {
        return Err(target.len());
    }
    for (slot, value) in target.iter_mut().zip(values) {
        *slot = *value;
    }
    Ok(())
}

fn fill2(target: &mut Array2<f32>, values: &[f32]) -> Result<(), usize> {
    if values.len() != target.len() {
        return Err(target.len());
    }
    for (slot, value) in target.iter_mut().zip(values) {
        *slot = *value;
    }
    Ok(())
}

fn fill4(target: &mut Array4<f32>, values: &[f32]) -> Result<(), usize> {
    if values.len() != target.len() {
        return Err(target.len());
    }
    for (slot, value) in target.iter_mut().zip(values) {
        *slot = *value;
    }
    Ok(())
}

/// Valid-padding convolution over channel-major data.
fn convolve(input: &Array3<f32>, weight: &Array4<f32>, bias: &Array1<f32>) -> Array3<f32> {
    let (in_channels, in_h, in_w) = input.dim();
    let (out_channels, weight_channels, kh, kw) = weight.dim();
    let out_h = in_h.saturating_sub(kh) + 1;
    let out_w = in_w.saturating_sub(kw) + 1;
    let mut output = Array3::zeros((out_channels, out_h, out_w));
    for oc in 0..out_channels {
        for y in 0..out_h {
            for x in 0..out_w {
                let mut acc = bias[oc];
                for ic in 0..in_channels.min(weight_channels) {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            acc += weight[[oc, ic, ky, kx]] * input[[ic, y + ky, x + kx]];
                        }
                    }
                }
                output[[oc, y, x]] = acc;
            }
        }
    }
    output
}

fn max_pool(input: &Array3<f32>, k: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = input.dim();
    let k = k.max(1);
    let (out_h, out_w) = (in_h / k, in_w / k);
    let mut output = Array3::zeros((channels, out_h, out_w));
    for c in 0..channels {
        for y in 0..out_h {
            for x in 0..out_w {
                let mut best = f32::NEG_INFINITY;
                for dy in 0..k {
                    for dx in 0..k {
                        best = best.max(input[[c, y * k + dy, x * k + dx]]);
                    }
                }
                output[[c, y, x]] = best;
            }
        }
    }
    output
}

fn relu3(mut a: Array3<f32>) -> Array3<f32> {
    a.mapv_inplace(|v| v.max(0.0));
    a
}

fn relu1(mut a: Array1<f32>) -> Array1<f32> {
    a.mapv_inplace(|v| v.max(0.0));
    a
}

fn softmax(logits: Array1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Array1<f32> = logits.mapv(|v| (v - max).exp());
    let sum = exps.sum().max(f32::MIN_POSITIVE);
    exps / sum
}

/// Center-pad a grayscale view onto the network input size, preserving the
/// aspect ratio, and normalize to [0, 1].
fn prepare_input(gray: &image::GrayImage, arch: &Architecture) -> Array2<f32> {
    let (iw, ih) = (arch.iwidth as u32, arch.iheight as u32);
    let scale = f64::min(
        iw as f64 / gray.width() as f64,
        ih as f64 / gray.height() as f64,
    )
    .min(1.0);
    let scaled_w = ((gray.width() as f64 * scale) as u32).max(1);
    let scaled_h = ((gray.height() as f64 * scale) as u32).max(1);
    let thumb = imageops::resize(gray, scaled_w, scaled_h, imageops::FilterType::Triangle);

    let mut input = Array2::from_elem((arch.iheight, arch.iwidth), 1.0f32);
    let ox = (iw - scaled_w) / 2;
    let oy = (ih - scaled_h) / 2;
    for (x, y, pixel) in thumb.enumerate_pixels() {
        input[[(oy + y) as usize, (ox + x) as usize]] = pixel[0] as f32 / 255.0;
    }
    input
}

#[derive(Debug, Clone)]
pub struct DeepFinder {
    cfg: LocalConfig,
    imglog: ImageLogger,
    net: Option<Arc<DeepNet>>,
}

impl DeepFinder {
    pub fn new() -> Result<DeepFinder, FindError> {
        let mut cfg = LocalConfig::new();
        finder::register_find(&mut cfg);
        cfg.register("deep", "deep_methods", &["none"]);
        let mut this = DeepFinder {
            cfg,
            imglog: ImageLogger::new(),
            net: None,
        };
        this.configure_backend(None, "deep", true)?;
        this.synchronize_backend(None, "deep", false)?;
        Ok(this)
    }

    fn bind_net(&mut self, weights: Option<&Path>) -> Result<Arc<DeepNet>, FindError> {
        let arch = Architecture::from_config(&self.cfg);
        let key = arch.key();
        if weights.is_none() {
            if let Some(net) = self.net.as_ref().filter(|n| n.arch == arch) {
                return Ok(Arc::clone(net));
            }
            let mut cache = NET_CACHE.lock().unwrap_or_else(|poison| poison.into_inner());
            if let Some(net) = cache.get(&key) {
                self.net = Some(Arc::clone(net));
                return Ok(Arc::clone(net));
            }
            let net = Arc::new(DeepNet::initialized(arch));
            cache.insert(key, Arc::clone(&net));
            self.net = Some(Arc::clone(&net));
            return Ok(net);
        }

        let net = Arc::new(DeepNet::from_weight_file(arch, weights.unwrap_or(Path::new("")))?);
        let mut cache = NET_CACHE.lock().unwrap_or_else(|poison| poison.into_inner());
        // one instance per architecture, the latest binding wins
        cache.insert(key, Arc::clone(&net));
        self.net = Some(Arc::clone(&net));
        Ok(net)
    }

    /// Evaluate a stored model: forward passes over a CSV of flat samples
    /// against a CSV of expected class indices, returning the accuracy.
    pub fn test(&mut self, samples: &Path, targets: &Path) -> Result<f64, FindError> {
        let net = self.bind_net(None)?;
        let arch = Architecture::from_config(&self.cfg);
        let read_rows = |path: &Path| -> Result<Vec<Vec<f32>>, FindError> {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(path)
                .map_err(|e| FindError::InvalidMatchFile(format!("dataset: {e}")))?;
            let mut rows = Vec::new();
            for record in reader.records() {
                let record =
                    record.map_err(|e| FindError::InvalidMatchFile(format!("dataset row: {e}")))?;
                rows.push(
                    record
                        .iter()
                        .map(|v| v.trim().parse::<f32>().unwrap_or(0.0))
                        .collect(),
                );
            }
            Ok(rows)
        };
        let samples = read_rows(samples)?;
        let targets = read_rows(targets)?;

        let mut correct = 0usize;
        let mut total = 0usize;
        for (sample, target) in samples.iter().zip(targets.iter()) {
            let expected = target.first().copied().unwrap_or(0.0) as usize;
            let mut input = Array2::zeros((arch.iheight, arch.iwidth));
            for (i, value) in sample.iter().enumerate().take(arch.iwidth * arch.iheight) {
                input[[i / arch.iwidth, i % arch.iwidth]] = *value;
            }
            let output = net.probabilities(&input);
            let predicted = output
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0);
            correct += usize::from(predicted == expected);
            total += 1;
        }
        let accuracy = if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        };
        tracing::info!(target: "find.deep", correct, total, accuracy, "test set evaluated");
        Ok(accuracy)
    }

    /// Training hook. The native stack carries no automatic differentiation,
    /// so model fitting is out of reach here; store externally trained
    /// weights in the pattern's CSV file instead.
    pub fn train(
        &mut self,
        _epochs: usize,
        _samples: &Path,
        _targets: &Path,
        _out: Option<&Path>,
    ) -> Result<(), FindError> {
        Err(FindError::NotImplemented(
            "network training requires an external training pipeline",
        ))
    }
}

impl Finder for DeepFinder {
    fn backend_name(&self) -> &'static str {
        "deep"
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
        if category != "deep" {
            return Err(finder::reject_category(category));
        }
        if reset {
            finder::configure_find(&mut self.cfg, Some("deep"), true)?;
        }
        self.cfg.set_category(
            "deep",
            CategoryParams::new("none")
                .with("use_cuda", CvParameter::boolean(false))
                .with("batch_size", CvParameter::int(1000, Some(0), None))
                .with("log_interval", CvParameter::int(10, Some(1), None))
                .with("learning_rate", CvParameter::float(0.01, Some(0.0), Some(1.0)))
                .with("sgd_momentum", CvParameter::float(0.5, Some(0.0), Some(1.0)))
                .with("iwidth", CvParameter::int(150, Some(1), None))
                .with("iheight", CvParameter::int(150, Some(1), None))
                .with("owidth", CvParameter::int(15, Some(1), None))
                .with("oheight", CvParameter::int(15, Some(1), None))
                .with("channels_conv1", CvParameter::int(10, Some(1), None))
                .with("kernel_conv1", CvParameter::int(5, Some(1), None))
                .with("kernel_pool1", CvParameter::int(2, Some(1), None))
                .with("channels_conv2", CvParameter::int(20, Some(1), None))
                .with("kernel_conv2", CvParameter::int(5, Some(1), None))
                .with("kernel_pool2", CvParameter::int(2, Some(1), None))
                .with("outputs_linear1", CvParameter::int(50, Some(1), None)),
        );
        Ok(())
    }

    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        _reset: bool,
    ) -> Result<(), FindError> {
        if category != "deep" {
            return Err(finder::reject_category(category));
        }
        finder::check_synchronized(&self.cfg, category, backend)?;
        self.bind_net(None)?;
        Ok(())
    }

    fn configure(&mut self) -> Result<(), FindError> {
        self.configure_backend(None, "deep", true)
    }

    fn synchronize(&mut self) -> Result<(), FindError> {
        self.synchronize_backend(None, "deep", false)
    }

    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError> {
        let pattern = expect_pattern(needle, self.backend_name())?;
        let haystack_image = expect_image(haystack, self.backend_name())?;
        finder::stage_inputs(&mut self.imglog, &self.cfg, needle, haystack)?;

        let net = self.bind_net(Some(&pattern.data_file))?;
        let arch = Architecture::from_config(&self.cfg);
        let gray = raster::gray_of_rgb(&haystack_image.pixels);
        let input = prepare_input(&gray, &arch);
        let output = net.probabilities(&input);

        // probability grid over the location cells (no-location class last)
        let mut activity = image::GrayImage::new(arch.owidth as u32, arch.oheight as u32);
        for y in 0..arch.oheight {
            for x in 0..arch.owidth {
                let p = output[y * arch.owidth + x];
                activity.put_pixel(x as u32, y as u32, image::Luma([(p * 255.0) as u8]));
            }
        }
        self.imglog.hotmaps.push(raster::rgb_of_gray(&activity));

        let mut canvas = (*haystack_image.pixels).clone();
        let similarity = self.cfg.fval("find", "similarity");
        let cell_w = haystack_image.width() as f64 / arch.owidth as f64;
        let cell_h = haystack_image.height() as f64 / arch.oheight as f64;
        let (ndx, ndy) = needle.center_offset;
        let mut matches = Vec::new();
        for y in 0..arch.oheight {
            for x in 0..arch.owidth {
                let p = output[y * arch.owidth + x] as f64;
                if p > similarity {
                    let ox = (x as f64 * cell_w) as i32;
                    let oy = (y as f64 * cell_h) as i32;
                    raster::draw_match_rect(
                        &mut canvas,
                        ox,
                        oy,
                        cell_w as u32,
                        cell_h as u32,
                        Rgb([0, 0, 255]),
                    );
                    self.imglog.locations.push((ox, oy));
                    self.imglog.similarities.push(p);
                    matches.push(Match::new(
                        ox,
                        oy,
                        cell_w as u32,
                        cell_h as u32,
                        ndx,
                        ndy,
                        p,
                    ));
                }
            }
        }
        self.imglog.hotmaps.push(canvas);
        self.log(core_config::log_level::WARNING)?;
        Ok(matches)
    }

    fn log(&mut self, level: u32) -> Result<(), FindError> {
        finder::log_with(&mut self.imglog, level, |imglog| {
            let name = format!("imglog{}-3hotmap-1activity.png", imglog.printable_step());
            imglog.dump_hotmap(&name, &imglog.hotmaps[0])?;
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

    fn small_architecture(finder: &mut DeepFinder) {
        crate::testutil::silence_imglog();
        let cfg = finder.config_mut();
        cfg.set_value("deep", "iwidth", ParamValue::Int(30));
        cfg.set_value("deep", "iheight", ParamValue::Int(30));
        cfg.set_value("deep", "owidth", ParamValue::Int(3));
        cfg.set_value("deep", "oheight", ParamValue::Int(3));
        cfg.set_value("deep", "channels_conv1", ParamValue::Int(2));
        cfg.set_value("deep", "kernel_conv1", ParamValue::Int(3));
        cfg.set_value("deep", "channels_conv2", ParamValue::Int(3));
        cfg.set_value("deep", "kernel_conv2", ParamValue::Int(3));
        cfg.set_value("deep", "outputs_linear1", ParamValue::Int(10));
    }

    fn write_pattern(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("detector.csv");
        // an empty tensor list keeps the seeded initialization
        std::fs::write(&path, "note,0\n").unwrap();
        path
    }

    #[test]
    fn probabilities_form_a_distribution() {
        let mut finder = DeepFinder::new().unwrap();
        small_architecture(&mut finder);
        finder.synchronize().unwrap();
        let arch = Architecture::from_config(finder.config());
        let net = finder.net.clone().unwrap();
        let input = Array2::from_elem((arch.iheight, arch.iwidth), 0.5f32);
        let probabilities = net.probabilities(&input);
        assert_eq!(probabilities.len(), arch.classes());
        let sum: f32 = probabilities.sum();
        assert!((sum - 1.0).abs() < 1e-4, "softmax sums to one, got {sum}");
        assert!(probabilities.iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn zero_similarity_accepts_every_cell() {
        let dir = tempfile::tempdir().unwrap();
        let mut finder = DeepFinder::new().unwrap();
        small_architecture(&mut finder);
        finder
            .config_mut()
            .set_value("find", "similarity", ParamValue::Float(0.0));
        let needle = Target::pattern(&write_pattern(dir.path()).to_string_lossy()).unwrap();
        let haystack =
            Target::image_from_pixels(RgbImage::from_pixel(60, 60, Rgb([128, 128, 128])));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert_eq!(matches.len(), 9, "3x3 grid of cells all clear a zero threshold");
        for pair in matches.windows(2) {
            assert!(pair[0].similarity > 0.0 && pair[1].similarity > 0.0);
        }
    }

    #[test]
    fn high_similarity_rejects_untrained_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut finder = DeepFinder::new().unwrap();
        small_architecture(&mut finder);
        finder
            .config_mut()
            .set_value("find", "similarity", ParamValue::Float(0.99));
        let needle = Target::pattern(&write_pattern(dir.path()).to_string_lossy()).unwrap();
        let haystack =
            Target::image_from_pixels(RgbImage::from_pixel(60, 60, Rgb([128, 128, 128])));
        let matches = finder.find(&needle, &haystack).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn network_cache_keeps_one_instance_per_architecture() {
        let mut finder = DeepFinder::new().unwrap();
        small_architecture(&mut finder);
        finder.synchronize().unwrap();
        let first = finder.net.clone().unwrap();
        finder.synchronize().unwrap();
        let second = finder.net.clone().unwrap();
        assert!(Arc::ptr_eq(&first, &second), "same architecture reuses the net");

        finder
            .config_mut()
            .set_value("deep", "outputs_linear1", ParamValue::Int(12));
        finder.synchronize().unwrap();
        let third = finder.net.clone().unwrap();
        assert!(!Arc::ptr_eq(&first, &third), "new architecture builds a new net");
    }

    #[test]
    fn weight_rows_with_wrong_arity_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "conv1.bias,1.0\n").unwrap();
        let mut finder = DeepFinder::new().unwrap();
        small_architecture(&mut finder);
        // two channels configured, one bias provided
        let err = finder.bind_net(Some(&path)).unwrap_err();
        assert!(matches!(err, FindError::InvalidMatchFile(_)));
    }

    #[test]
    fn training_is_a_documented_stub() {
        let mut finder = DeepFinder::new().unwrap();
        small_architecture(&mut finder);
        let err = finder
            .train(1, Path::new("s.csv"), Path::new("t.csv"), None)
            .unwrap_err();
        assert!(matches!(err, FindError::NotImplemented(_)));
    }

    #[test]
    fn test_hook_reports_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let mut finder = DeepFinder::new().unwrap();
        small_architecture(&mut finder);
        finder.synchronize().unwrap();
        // one flat sample of the right arity, expected class 0
        let sample: Vec<String> = std::iter::repeat("0.5".to_owned()).take(900).collect();
        let samples_path = dir.path().join("samples.csv");
        std::fs::write(&samples_path, sample.join(",") + "\n").unwrap();
        let targets_path = dir.path().join("targets.csv");
        std::fs::write(&targets_path, "0\n").unwrap();
        let accuracy = finder.test(&samples_path, &targets_path).unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
    }
}
