//! Process-wide configuration defaults.
//!
//! Every finder reads its default backend names and the image logger its
//! destination, level, and quality from one shared [`Settings`] value. The
//! bag can be replaced wholesale, mutated through [`update`], or shadowed for
//! the duration of a scope with [`TemporaryConfig`], which restores the
//! previous state on drop.
//!
//! An optional `pixelseek.toml` file can override the defaults. Loading is
//! tolerant: a missing file or a parse error falls back to the built-in
//! defaults rather than failing startup.

use std::fs;
use std::path::PathBuf;
use std::sync::{LazyLock, RwLock};

use serde::Deserialize;
use tracing::{info, warn};

/// Image-log severity thresholds, mirroring conventional log levels.
pub mod log_level {
    pub const DEBUG: u32 = 10;
    pub const INFO: u32 = 20;
    pub const WARNING: u32 = 30;
    pub const ERROR: u32 = 40;
    pub const CRITICAL: u32 = 50;
}

/// The shared property bag consumed by finder construction and image logging.
///
/// Delay and behavior flags at the bottom belong to the input-driving layer;
/// they live here so one temporary-override scope covers the whole process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    // default backends per category
    pub find_backend: String,
    pub contour_threshold_backend: String,
    pub template_match_backend: String,
    pub feature_detect_backend: String,
    pub feature_extract_backend: String,
    pub feature_match_backend: String,
    pub text_detect_backend: String,
    pub text_ocr_backend: String,
    pub hybrid_match_backend: String,

    // image logging
    pub image_logging_level: u32,
    pub image_logging_destination: String,
    pub image_logging_step_width: usize,
    /// PNG compression level in [0, 9].
    pub image_quality: u8,

    // operational parameters consumed by the input-driving layer
    pub click_delay: f64,
    pub delay_after_drag: f64,
    pub delay_before_drop: f64,
    pub delay_before_keys: f64,
    pub delay_between_keys: f64,
    pub rescan_speed_on_find: f64,
    pub smooth_mouse_drag: bool,
    pub screen_autoconnect: bool,
    pub preprocess_special_chars: bool,
    pub save_needle_on_error: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            find_backend: "hybrid".into(),
            contour_threshold_backend: "adaptive".into(),
            template_match_backend: "ccoeff_normed".into(),
            feature_detect_backend: "fast9".into(),
            feature_extract_backend: "brief".into(),
            feature_match_backend: "bruteforce-hamming".into(),
            text_detect_backend: "contours".into(),
            text_ocr_backend: "glyph".into(),
            hybrid_match_backend: "template".into(),

            image_logging_level: log_level::ERROR,
            image_logging_destination: "./imglog".into(),
            image_logging_step_width: 3,
            image_quality: 3,

            click_delay: 0.1,
            delay_after_drag: 0.5,
            delay_before_drop: 0.5,
            delay_before_keys: 0.2,
            delay_between_keys: 0.1,
            rescan_speed_on_find: 0.2,
            smooth_mouse_drag: true,
            screen_autoconnect: true,
            preprocess_special_chars: true,
            save_needle_on_error: true,
        }
    }
}

static SETTINGS: LazyLock<RwLock<Settings>> = LazyLock::new(|| RwLock::new(Settings::default()));

/// Snapshot of the current settings.
pub fn get() -> Settings {
    SETTINGS
        .read()
        .unwrap_or_else(|poison| poison.into_inner())
        .clone()
}

/// Read a single property without cloning the whole bag.
pub fn with<R>(f: impl FnOnce(&Settings) -> R) -> R {
    let guard = SETTINGS.read().unwrap_or_else(|poison| poison.into_inner());
    f(&guard)
}

/// Mutate the shared settings in place.
pub fn update<R>(f: impl FnOnce(&mut Settings) -> R) -> R {
    let mut guard = SETTINGS
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
    f(&mut guard)
}

/// Replace the shared settings wholesale.
pub fn set(settings: Settings) {
    update(|current| *current = settings);
}

/// Scope guard shadowing the process-wide settings.
///
/// Entering saves the current bag; any [`update`] calls inside the scope act
/// on the live settings as usual; dropping the guard restores the saved bag,
/// so no property leaks out of the scope.
#[derive(Debug)]
pub struct TemporaryConfig {
    saved: Settings,
}

impl TemporaryConfig {
    pub fn begin() -> TemporaryConfig {
        TemporaryConfig { saved: get() }
    }
}

impl Drop for TemporaryConfig {
    fn drop(&mut self) {
        set(self.saved.clone());
    }
}

/// Best-effort configuration file discovery: a local `pixelseek.toml` wins.
pub fn discover() -> PathBuf {
    PathBuf::from("pixelseek.toml")
}

/// Load settings from a TOML file, falling back to the defaults when the
/// file is absent or malformed. The loaded value is returned but not
/// installed; call [`set`] to make it the process-wide bag.
pub fn load_from(path: Option<PathBuf>) -> Settings {
    let path = path.unwrap_or_else(discover);
    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str::<Settings>(&content) {
            Ok(settings) => {
                info!(target: "config", path = %path.display(), "settings_loaded");
                settings
            }
            Err(err) => {
                warn!(
                    target: "config",
                    path = %path.display(),
                    error = %err,
                    "settings_parse_failed_using_defaults"
                );
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}
