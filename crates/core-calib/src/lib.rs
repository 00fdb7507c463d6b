//! Calibration of finder configurations.
//!
//! A calibrator owns a list of match *cases* (needle/haystack pairs, each
//! marked for maximization or minimization of similarity) and a scalar
//! error function over a finder: the mean dissimilarity across the cases,
//! optionally with a wall-time penalty or a spatial-peak formulation.
//!
//! Three levels of automation build on that error:
//! * [`Calibrator::calibrate`]: a coordinate-wise hill climb with adaptive
//!   step ("twiddle"): try each non-fixed parameter up, then down, growing
//!   the step by 1.1 on improvement and shrinking it by 0.9 otherwise, until
//!   every step falls below its tolerance or the error reaches zero.
//! * [`Calibrator::search`]: multi-start calibration from random parameter
//!   values, uniform over the ranges or Gaussian around the current values.
//! * [`Calibrator::benchmark`]: exhaustive enumeration of backend
//!   combinations across the finder's categories, each timed and optionally
//!   calibrated, sorted by attained similarity.
//!
//! During any run the image logger accumulates (and is cleared after every
//! case) so calibration never floods the artifact directory, and any failure
//! inside a `find` call is rescued and scored as similarity zero.

use std::path::Path;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use core_find::finder::Finder;
use core_find::{FindError, Target};
use core_param::ParamValue;

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("invalid match case line {0:?}: expected 'needle haystack max|min'")]
    InvalidCaseLine(String),
    #[error("need at least a single needle/haystack pair or a case file")]
    NoCases,
    #[error(transparent)]
    Find(#[from] FindError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The error function variant used by a calibrator.
#[derive(Debug, Clone, PartialEq)]
pub enum RunKind {
    /// Mean dissimilarity over the cases.
    Default,
    /// [`RunKind::Default`] plus a linear penalty for exceeding the allowed
    /// wall time (in seconds).
    Performance { max_exec_time: f64 },
    /// Mean over all matches of a case: similarity at the expected peak
    /// location, one minus similarity anywhere else.
    Peak { location: (i32, i32) },
}

/// One match case: what to search, where, and in which direction the
/// similarity counts.
#[derive(Debug, Clone)]
pub struct MatchCase {
    pub needle: Target,
    pub haystack: Target,
    pub maximize: bool,
}

pub struct Calibrator {
    cases: Vec<MatchCase>,
    pub run_kind: RunKind,
}

/// Restores the accumulation flag even when a calibration errors out.
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

impl Calibrator {
    /// Calibrator over one explicit needle/haystack pair (maximizing).
    pub fn new(needle: Target, haystack: Target) -> Calibrator {
        Calibrator {
            cases: vec![MatchCase {
                needle,
                haystack,
                maximize: true,
            }],
            run_kind: RunKind::Default,
        }
    }

    /// Calibrator over a case list file: one `needle haystack max|min` line
    /// per case, targets resolved through their data file extensions.
    pub fn from_case_file(path: &Path) -> Result<Calibrator, CalibError> {
        let text = std::fs::read_to_string(path)?;
        let mut cases = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [needle, haystack, direction] = fields.as_slice() else {
                return Err(CalibError::InvalidCaseLine(line.to_owned()));
            };
            let maximize = match *direction {
                "max" => true,
                "min" => false,
                _ => return Err(CalibError::InvalidCaseLine(line.to_owned())),
            };
            info!(
                target: "calib",
                needle, haystack, maximize,
                "registering match case"
            );
            cases.push(MatchCase {
                needle: Target::from_data_file(needle)?,
                haystack: Target::from_data_file(haystack)?,
                maximize,
            });
        }
        if cases.is_empty() {
            return Err(CalibError::NoCases);
        }
        Ok(Calibrator {
            cases,
            run_kind: RunKind::Default,
        })
    }

    pub fn cases(&self) -> &[MatchCase] {
        &self.cases
    }

    /// Evaluate the configured error function. Lower is better; failures
    /// inside `find` count as similarity zero and never propagate.
    pub fn run(&self, finder: &mut dyn Finder) -> f64 {
        handle_restricted_values(finder);
        match self.run_kind {
            RunKind::Default => self.run_default(finder),
            RunKind::Performance { max_exec_time } => self.run_performance(finder, max_exec_time),
            RunKind::Peak { location } => self.run_peak(finder, location),
        }
    }

    fn case_similarity(&self, finder: &mut dyn Finder, case: &MatchCase) -> f64 {
        let similarity = match finder.find(&case.needle, &case.haystack) {
            Ok(matches) => matches.first().map(|m| m.similarity).unwrap_or_else(|| {
                warn!(target: "calib", "no match was found at this step");
                0.0
            }),
            Err(err) => {
                warn!(target: "calib", error = %err, "match attempt failed at this step");
                0.0
            }
        };
        finder.imglog_mut().clear();
        similarity
    }

    fn run_default(&self, finder: &mut dyn Finder) -> f64 {
        let mut total = 0.0;
        for case in &self.cases {
            let similarity = self.case_similarity(finder, case);
            total += if case.maximize { similarity } else { 1.0 - similarity };
        }
        1.0 - total / self.cases.len() as f64
    }

    fn run_performance(&self, finder: &mut dyn Finder, max_exec_time: f64) -> f64 {
        let start = Instant::now();
        let error = self.run_default(finder);
        let total_time = start.elapsed().as_secs_f64();
        // overruns convert into a linear scalar penalty, never a hard stop
        error + (total_time - max_exec_time).max(0.0)
    }

    fn run_peak(&self, finder: &mut dyn Finder, peak: (i32, i32)) -> f64 {
        let mut total = 0.0;
        for case in &self.cases {
            let similarity = match finder.find(&case.needle, &case.haystack) {
                Ok(matches) if !matches.is_empty() => {
                    let subtotal: f64 = matches
                        .iter()
                        .map(|m| {
                            if (m.x, m.y) == peak {
                                m.similarity
                            } else {
                                1.0 - m.similarity
                            }
                        })
                        .sum();
                    subtotal / matches.len() as f64
                }
                Ok(_) => 0.0,
                Err(err) => {
                    warn!(target: "calib", error = %err, "match attempt failed at this step");
                    0.0
                }
            };
            finder.imglog_mut().clear();
            total += if case.maximize { similarity } else { 1.0 - similarity };
        }
        1.0 - total / self.cases.len() as f64
    }

    /// Twiddle the non-fixed parameters of the finder to minimize the error,
    /// for at most `max_attempts` rounds. Similarity thresholds are pinned
    /// to zero during the search and restored on exit; each parameter's
    /// final delta is the widest step that still produced an improvement
    /// (its flat-region width). Returns the attained similarity.
    pub fn calibrate(&self, finder: &mut dyn Finder, max_attempts: usize) -> f64 {
        let pinned = pin_similarities(finder);
        let _accumulation = AccumulationScope::enter();
        let mut best_error = self.run(finder);
        debug!(target: "calib", best_error, "calibration start");
        let mut max_deltas: std::collections::HashMap<(String, String), f64> =
            std::collections::HashMap::new();

        for attempt in 0..max_attempts {
            info!(target: "calib", attempt = attempt + 1, max_attempts, best_error, "calibration try");
            if best_error == 0.0 {
                info!(target: "calib", "exiting due to zero error");
                break;
            }

            let mut slowdown = true;
            for (category, key) in finder.config().param_keys() {
                let Some(param) = finder.config().param(&category, &key) else {
                    continue;
                };
                if param.fixed {
                    continue;
                }
                if matches!(param.value, ParamValue::Str(_) | ParamValue::Null) {
                    continue;
                }
                if param.delta < param.tolerance {
                    debug!(
                        target: "calib",
                        "parameter {category}/{key} slowed down below tolerance"
                    );
                    continue;
                }
                slowdown = false;

                let param = param.clone();
                let start_value = param.value.clone();
                let (range_min, range_max) = param.range();

                // enumerated integers: distances are meaningless, so sweep
                // every mode and keep the best
                if param.enumerated && matches!(param.value, ParamValue::Int(_)) {
                    let start = match start_value {
                        ParamValue::Int(v) => v,
                        _ => 0,
                    };
                    let mut delta_coeff = 0.9;
                    let mut best_mode = start;
                    for mode in (range_min as i64)..(range_max as i64) {
                        if mode == start {
                            continue;
                        }
                        finder
                            .config_mut()
                            .set_value(&category, &key, ParamValue::Int(mode));
                        let error = self.run(finder);
                        debug!(
                            target: "calib",
                            "{category}/{key}: {start} +> {mode} = {error} (best {best_error})"
                        );
                        if error < best_error {
                            best_error = error;
                            best_mode = mode;
                            delta_coeff = 1.1;
                        }
                    }
                    finder
                        .config_mut()
                        .set_value(&category, &key, ParamValue::Int(best_mode));
                    if let Some(p) = finder.config_mut().param_mut(&category, &key) {
                        p.delta *= delta_coeff;
                        max_deltas.insert((category.clone(), key.clone()), p.delta);
                    }
                    continue;
                }

                // step upward (booleans flip instead)
                let up_value = match &start_value {
                    ParamValue::Float(v) => ParamValue::Float((v + param.delta).min(range_max)),
                    ParamValue::Int(v) => {
                        ParamValue::Int(((*v + param.delta.ceil() as i64) as f64).min(range_max) as i64)
                    }
                    ParamValue::Bool(v) => ParamValue::Bool(!v),
                    other => other.clone(),
                };
                finder.config_mut().set_value(&category, &key, up_value);
                let error = self.run(finder);
                debug!(
                    target: "calib",
                    "{category}/{key}: {start_value:?} +delta = {error} (best {best_error})"
                );
                if error < best_error {
                    best_error = error;
                    if let Some(p) = finder.config_mut().param_mut(&category, &key) {
                        p.delta *= 1.1;
                        max_deltas.insert((category.clone(), key.clone()), p.delta);
                    }
                    continue;
                }

                if matches!(start_value, ParamValue::Bool(_)) {
                    // both boolean values have been seen now
                    finder
                        .config_mut()
                        .set_value(&category, &key, start_value.clone());
                    continue;
                }

                // step downward from the original value
                let down_value = match &start_value {
                    ParamValue::Float(v) => ParamValue::Float((v - param.delta).max(range_min)),
                    ParamValue::Int(v) => {
                        ParamValue::Int(((*v - param.delta.floor() as i64) as f64).max(range_min) as i64)
                    }
                    other => other.clone(),
                };
                finder.config_mut().set_value(&category, &key, down_value);
                let error = self.run(finder);
                debug!(
                    target: "calib",
                    "{category}/{key}: {start_value:?} -delta = {error} (best {best_error})"
                );
                if error < best_error {
                    best_error = error;
                    if let Some(p) = finder.config_mut().param_mut(&category, &key) {
                        p.delta *= 1.1;
                        max_deltas.insert((category.clone(), key.clone()), p.delta);
                    }
                } else {
                    finder
                        .config_mut()
                        .set_value(&category, &key, start_value.clone());
                    if let Some(p) = finder.config_mut().param_mut(&category, &key) {
                        p.delta *= 0.9;
                        if error > best_error {
                            max_deltas.insert((category.clone(), key.clone()), p.delta);
                        }
                    }
                }
            }

            if slowdown {
                info!(target: "calib", "exiting due to sufficient slowdown for all parameters");
                break;
            }
        }

        // retain each parameter's flat-region width as its final delta
        for (category, key) in finder.config().param_keys() {
            if let Some(p) = finder.config_mut().param_mut(&category, &key) {
                if let Some(max_delta) = max_deltas.get(&(category.clone(), key.clone())) {
                    p.delta = *max_delta;
                } else if p.fixed {
                    p.delta = 0.0;
                }
            }
        }
        restore_similarities(finder, pinned);
        debug!(target: "calib", best_error, "calibration end");
        1.0 - best_error
    }

    /// Multi-start calibration: each start replaces every non-fixed
    /// parameter with a random value (uniform over its range, or Gaussian
    /// around the current value with the delta as deviation) and keeps the
    /// best configuration seen. Returns the attained similarity.
    pub fn search(
        &self,
        finder: &mut dyn Finder,
        random_starts: usize,
        uniform: bool,
        calibration: bool,
        max_attempts: usize,
    ) -> f64 {
        let pinned = pin_similarities(finder);
        let _accumulation = AccumulationScope::enter();
        let mut best_error = self.run(finder);
        let init_config = finder.config().clone();
        let mut best_config = init_config.clone();
        let mut rng = rand::thread_rng();

        for start in 0..random_starts {
            info!(target: "calib", start = start + 1, random_starts, best_error, "random run");
            let mut config = init_config.clone();
            for (category, key) in config.param_keys() {
                let Some(param) = config.param_mut(&category, &key) else {
                    continue;
                };
                if param.fixed {
                    continue;
                }
                let mean = if uniform { None } else { param.value.as_f64() };
                let deviation = if uniform { None } else { Some(param.delta) };
                param.value = param.random_value(&mut rng, mean, deviation);
                debug!(
                    target: "calib",
                    "setting {category}/{key} to random value {:?}",
                    param.value
                );
            }
            *finder.config_mut() = config;

            let error = if calibration {
                1.0 - self.calibrate(finder, max_attempts)
            } else {
                self.run(finder)
            };
            if error < best_error {
                info!(target: "calib", error, best_error, "random start improved the error");
                best_error = error;
                best_config = finder.config().clone();
            }
        }

        *finder.config_mut() = best_config;
        restore_similarities(finder, pinned);
        info!(target: "calib", best_error, "best error for all random starts");
        1.0 - best_error
    }

    /// Enumerate every Cartesian combination of backends across the
    /// finder's non-root categories; configure, optionally calibrate or
    /// search, and time one run each. Returns `(method, similarity,
    /// elapsed_seconds)` tuples sorted by similarity, best first.
    pub fn benchmark(
        &self,
        finder: &mut dyn Finder,
        random_starts: usize,
        uniform: bool,
        calibration: bool,
        max_attempts: usize,
    ) -> Result<Vec<(String, f64, f64)>, CalibError> {
        info!(
            target: "calib",
            calibration,
            "performing benchmarking"
        );
        let _accumulation = AccumulationScope::enter();
        let pinned = pin_similarities(finder);

        let categories: Vec<String> = finder
            .config()
            .categories()
            .filter(|c| *c != "type" && *c != "find")
            .map(str::to_owned)
            .collect();
        let backend_lists: Vec<Vec<String>> = categories
            .iter()
            .map(|category| {
                finder
                    .config()
                    .backends_for(category)
                    .map(|b| b.iter().map(|s| (*s).to_owned()).collect())
                    .unwrap_or_default()
            })
            .collect();

        let mut combos: Vec<Vec<String>> = vec![Vec::new()];
        for backends in &backend_lists {
            let mut expanded = Vec::new();
            for combo in &combos {
                for backend in backends {
                    let mut next = combo.clone();
                    next.push(backend.clone());
                    expanded.push(next);
                }
            }
            combos = expanded;
        }

        let mut results = Vec::new();
        for combo in combos {
            let method = combo.join("+");
            info!(target: "calib", method = %method, "benchmark testing");
            for (backend, category) in combo.iter().zip(categories.iter()) {
                finder.configure_backend(Some(backend), category, false)?;
                finder.config_mut().can_calibrate(category, calibration)?;
            }

            if random_starts > 0 {
                self.search(finder, random_starts, uniform, calibration, max_attempts);
            } else if calibration {
                self.calibrate(finder, max_attempts);
            }

            let start = Instant::now();
            let similarity = 1.0 - self.run(finder);
            let elapsed = start.elapsed().as_secs_f64();
            debug!(
                target: "calib",
                method = %method,
                similarity,
                elapsed,
                "benchmark result"
            );
            results.push((method, similarity, elapsed));
        }

        restore_similarities(finder, pinned);
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }
}

/// Similarity thresholds short-circuit matching, so runs happen with them
/// pinned to zero. Returns the values to restore.
fn pin_similarities(finder: &mut dyn Finder) -> Vec<(&'static str, &'static str, ParamValue)> {
    let mut pinned = Vec::new();
    for (category, key) in [("find", "similarity"), ("tempfeat", "front_similarity")] {
        if let Some(param) = finder.config_mut().param_mut(category, key) {
            pinned.push((category, key, param.value.clone()));
            param.value = ParamValue::Float(0.0);
            param.fixed = true;
        }
    }
    pinned
}

fn restore_similarities(finder: &mut dyn Finder, pinned: Vec<(&'static str, &'static str, ParamValue)>) {
    for (category, key, value) in pinned {
        finder.config_mut().set_value(category, key, value);
    }
}

/// Snap parameters whose backends require restricted values: blur kernels
/// and adaptive block sizes must be odd, and the distance transform mask is
/// one of 0, 3, or 5.
fn handle_restricted_values(finder: &mut dyn Finder) {
    let cfg = finder.config_mut();
    for category in ["threshold", "threshold2", "threshold3"] {
        if !cfg.has_category(category) {
            continue;
        }
        if let Some(ParamValue::Int(size)) = cfg.param(category, "blurKernelSize").map(|p| p.value.clone()) {
            if size % 2 == 0 {
                cfg.set_value(category, "blurKernelSize", ParamValue::Int(size + 1));
            }
        }
        if cfg.backend(category) == Some("adaptive") {
            if let Some(ParamValue::Int(size)) = cfg.param(category, "blockSize").map(|p| p.value.clone()) {
                if size % 2 == 0 {
                    cfg.set_value(category, "blockSize", ParamValue::Int(size + 1));
                }
            }
        }
    }
    if let Some(ParamValue::Int(mask)) = cfg.param("ocr", "dt_mask_size").map(|p| p.value.clone()) {
        if ![0, 3, 5].contains(&mask) {
            let snapped = [0i64, 3, 5]
                .into_iter()
                .min_by_key(|m| (m - mask).abs())
                .unwrap_or(3);
            cfg.set_value("ocr", "dt_mask_size", ParamValue::Int(snapped));
        }
    }
}
