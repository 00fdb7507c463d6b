//! Image logging for the matching process.
//!
//! Every finder invocation records the needle and haystack being matched plus
//! a sequence of *hotmaps* (diagnostic images drawn by the finder stages) with
//! parallel similarity and location lists. When a find call completes, the
//! finder decides which hotmaps to dump and under which names; this crate
//! provides the primitives (destination handling, PNG encoding, step
//! numbering) and the shared guards.
//!
//! Process-wide state mirrors the per-process telemetry counters elsewhere in
//! the workspace: a monotonically increasing step counter and an accumulation
//! flag that suspends emission while an outer finder groups the work of inner
//! finders into one logical step. Destination, level, step width, and PNG
//! quality are read from `core-config` at each use so that scoped settings
//! overrides take effect immediately.
//!
//! Invariants:
//! * Each completed emission clears the per-call state and advances the step
//!   counter by exactly one.
//! * The destination directory is wiped and recreated on the first dump of a
//!   process (step 1) when it already exists from a previous run.
//! * Asking to emit with no recorded hotmaps is a finder bug and surfaces as
//!   [`LogError::MissingHotmap`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ImageError, RgbImage};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("no matching was performed in order to be image logged")]
    MissingHotmap,
    #[error("image log destination error: {0}")]
    Io(#[from] io::Error),
    #[error("image log encoding error: {0}")]
    Image(#[from] ImageError),
}

/// Number of the current step, prefixed to every artifact filename.
static STEP: AtomicU64 = AtomicU64::new(1);
/// Suspends emission so an outer finder can flush inner stages as one step.
static ACCUMULATE: AtomicBool = AtomicBool::new(false);

pub fn step() -> u64 {
    STEP.load(Ordering::Relaxed)
}

/// Reset the step counter; used by tests and long-lived hosts that restart a
/// logging session.
pub fn reset_step(value: u64) {
    STEP.store(value, Ordering::Relaxed);
}

pub fn accumulating() -> bool {
    ACCUMULATE.load(Ordering::Relaxed)
}

pub fn set_accumulate(enabled: bool) {
    ACCUMULATE.store(enabled, Ordering::Relaxed);
}

/// What a needle dump writes beside the step-numbered name.
#[derive(Debug, Clone)]
pub enum DumpPayload {
    /// Raster targets dump their pixels as PNG.
    Raster(RgbImage),
    /// Text targets dump their value as a `.txt` file.
    Text(String),
    /// Pattern targets copy their classifier data file verbatim.
    DataFile(PathBuf),
}

/// A target reference the logger can persist: a display name, the payload,
/// and optionally the rendered match configuration for a `.match` sidecar.
#[derive(Debug, Clone)]
pub struct Dumpable {
    pub name: String,
    pub payload: DumpPayload,
    pub match_text: Option<String>,
}

/// Per-invocation logging state of one finder.
#[derive(Debug, Default, Clone)]
pub struct ImageLogger {
    pub needle: Option<Dumpable>,
    pub haystack: Option<Dumpable>,
    /// Diagnostic images ordered by finder stage; the last one is the final
    /// canonical hotmap.
    pub hotmaps: Vec<RgbImage>,
    pub similarities: Vec<f64>,
    pub locations: Vec<(i32, i32)>,
}

impl ImageLogger {
    pub fn new() -> ImageLogger {
        ImageLogger::default()
    }

    /// Step number zero-padded to the configured width.
    pub fn printable_step(&self) -> String {
        let width = core_config::with(|s| s.image_logging_step_width);
        format!("{:0width$}", step(), width = width)
    }

    /// Decide whether a `log(level)` call should emit artifacts now.
    ///
    /// Returns `false` when the level is below the configured threshold or
    /// when accumulation defers emission to the outer finder. Emission with
    /// no recorded hotmaps is an error.
    pub fn begin_emission(&self, level: u32) -> Result<bool, LogError> {
        if level < core_config::with(|s| s.image_logging_level) {
            return Ok(false);
        }
        if accumulating() {
            return Ok(false);
        }
        if self.hotmaps.is_empty() {
            return Err(LogError::MissingHotmap);
        }
        Ok(true)
    }

    /// Write the current needle and haystack under their step-numbered names.
    pub fn dump_matched_images(&self) -> Result<(), LogError> {
        if core_config::with(|s| s.image_logging_level) > core_config::log_level::WARNING {
            return Ok(());
        }
        let destination = self.prepare_destination()?;

        if let Some(needle) = &self.needle {
            let base = format!("imglog{}-1needle-{}", self.printable_step(), needle.name);
            match &needle.payload {
                DumpPayload::Raster(pixels) => {
                    self.encode_png(&destination.join(format!("{base}.png")), pixels)?;
                }
                DumpPayload::Text(value) => {
                    fs::write(destination.join(format!("{base}.txt")), value)?;
                }
                DumpPayload::DataFile(path) => {
                    let ext = path
                        .extension()
                        .map(|e| e.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "dat".to_owned());
                    fs::copy(path, destination.join(format!("{base}.{ext}")))?;
                }
            }
            if let Some(match_text) = &needle.match_text {
                fs::write(destination.join(format!("{base}.match")), match_text)?;
            }
        }

        if let Some(haystack) = &self.haystack {
            let base = format!("imglog{}-2haystack-{}", self.printable_step(), haystack.name);
            if let DumpPayload::Raster(pixels) = &haystack.payload {
                self.encode_png(&destination.join(format!("{base}.png")), pixels)?;
            }
        }
        Ok(())
    }

    /// Write one named hotmap into the logging destination.
    pub fn dump_hotmap(&self, name: &str, hotmap: &RgbImage) -> Result<(), LogError> {
        let destination = ensure_destination()?;
        debug!(target: "imglog", name, "dumping hotmap");
        self.encode_png(&destination.join(name), hotmap)
    }

    /// Clear the per-call state and advance the process-wide step counter.
    /// Every successful emission must end here.
    pub fn conclude(&mut self) {
        self.clear();
        STEP.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop all accumulated state without advancing the step.
    pub fn clear(&mut self) {
        self.needle = None;
        self.haystack = None;
        self.hotmaps.clear();
        self.similarities.clear();
        self.locations.clear();
    }

    /// Move another logger's accumulated state into this one, preserving
    /// stage order. Composite finders use this to adopt the records of the
    /// components they ran under accumulation.
    pub fn absorb(&mut self, other: &mut ImageLogger) {
        self.hotmaps.append(&mut other.hotmaps);
        self.similarities.append(&mut other.similarities);
        self.locations.append(&mut other.locations);
        other.needle = None;
        other.haystack = None;
    }

    fn prepare_destination(&self) -> Result<PathBuf, LogError> {
        let destination = PathBuf::from(core_config::with(|s| s.image_logging_destination.clone()));
        if !destination.exists() {
            fs::create_dir_all(&destination)?;
        } else if step() == 1 {
            // first dump into a leftover destination from a previous run
            fs::remove_dir_all(&destination)?;
            fs::create_dir_all(&destination)?;
        }
        Ok(destination)
    }

    fn encode_png(&self, path: &Path, pixels: &RgbImage) -> Result<(), LogError> {
        let quality = core_config::with(|s| s.image_quality);
        // The PNG encoder exposes three compression tiers; the finer-grained
        // [0, 9] quality setting maps onto them.
        let compression = match quality {
            0..=2 => CompressionType::Fast,
            3..=6 => CompressionType::Default,
            _ => CompressionType::Best,
        };
        let file = io::BufWriter::new(fs::File::create(path)?);
        let encoder = PngEncoder::new_with_quality(file, compression, FilterType::Adaptive);
        pixels.write_with_encoder(encoder)?;
        Ok(())
    }
}

fn ensure_destination() -> Result<PathBuf, LogError> {
    let destination = PathBuf::from(core_config::with(|s| s.image_logging_destination.clone()));
    if !destination.exists() {
        fs::create_dir_all(&destination)?;
    }
    Ok(destination)
}

/// Format a similarity for inclusion in artifact filenames.
pub fn similarity_token(similarity: f64) -> String {
    format!("{similarity:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn scoped(destination: &Path, level: u32) -> (MutexGuard<'static, ()>, core_config::TemporaryConfig) {
        let guard = TEST_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        let scope = core_config::TemporaryConfig::begin();
        let dest = destination.to_string_lossy().into_owned();
        core_config::update(|s| {
            s.image_logging_destination = dest;
            s.image_logging_level = level;
        });
        reset_step(1);
        set_accumulate(false);
        (guard, scope)
    }

    fn solid(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]))
    }

    #[test]
    fn printable_step_is_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let (_guard, _scope) = scoped(&dir.path().join("log"), core_config::log_level::ERROR);
        reset_step(7);
        let logger = ImageLogger::new();
        assert_eq!(logger.printable_step(), "007");
        reset_step(1);
    }

    #[test]
    fn emission_honors_level_and_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let (_guard, _scope) = scoped(&dir.path().join("log"), core_config::log_level::WARNING);
        let mut logger = ImageLogger::new();
        assert!(!logger.begin_emission(core_config::log_level::DEBUG).unwrap());

        // due for emission but nothing recorded: a finder bug
        assert!(matches!(
            logger.begin_emission(core_config::log_level::WARNING),
            Err(LogError::MissingHotmap)
        ));

        logger.hotmaps.push(solid(4, 4));
        assert!(logger.begin_emission(core_config::log_level::WARNING).unwrap());

        set_accumulate(true);
        assert!(!logger.begin_emission(core_config::log_level::WARNING).unwrap());
        set_accumulate(false);
    }

    #[test]
    fn conclude_advances_the_step_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let (_guard, _scope) = scoped(&dir.path().join("log"), core_config::log_level::ERROR);
        let mut logger = ImageLogger::new();
        logger.hotmaps.push(solid(4, 4));
        logger.similarities.push(0.5);
        logger.locations.push((1, 2));
        let before = step();
        logger.conclude();
        assert_eq!(step(), before + 1);
        assert!(logger.hotmaps.is_empty());
        assert!(logger.similarities.is_empty());
        assert!(logger.locations.is_empty());
    }

    #[test]
    fn matched_images_and_hotmap_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        let (_guard, _scope) = scoped(&log_dir, core_config::log_level::DEBUG);

        let mut logger = ImageLogger::new();
        logger.needle = Some(Dumpable {
            name: "needle_image".into(),
            payload: DumpPayload::Raster(solid(6, 6)),
            match_text: Some("# IMAGE MATCH DATA\n[find]\nbackend = bitmap\n".into()),
        });
        logger.haystack = Some(Dumpable {
            name: "screen".into(),
            payload: DumpPayload::Raster(solid(12, 12)),
            match_text: None,
        });
        logger.dump_matched_images().unwrap();
        logger.hotmaps.push(solid(12, 12));
        logger
            .dump_hotmap(
                &format!("imglog{}-3hotmap-{}.png", logger.printable_step(), similarity_token(1.0)),
                &logger.hotmaps[0],
            )
            .unwrap();

        assert!(log_dir.join("imglog001-1needle-needle_image.png").exists());
        assert!(log_dir.join("imglog001-1needle-needle_image.match").exists());
        assert!(log_dir.join("imglog001-2haystack-screen.png").exists());
        assert!(log_dir.join("imglog001-3hotmap-1.0.png").exists());
    }

    #[test]
    fn first_step_wipes_a_preexisting_destination() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("stale.png"), b"stale").unwrap();
        let (_guard, _scope) = scoped(&log_dir, core_config::log_level::DEBUG);

        let mut logger = ImageLogger::new();
        logger.needle = Some(Dumpable {
            name: "n".into(),
            payload: DumpPayload::Raster(solid(2, 2)),
            match_text: None,
        });
        logger.haystack = Some(Dumpable {
            name: "h".into(),
            payload: DumpPayload::Raster(solid(2, 2)),
            match_text: None,
        });
        logger.dump_matched_images().unwrap();
        assert!(!log_dir.join("stale.png").exists());
        assert!(log_dir.join("imglog001-1needle-n.png").exists());
    }

    #[test]
    fn text_needles_dump_as_text_files() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        let (_guard, _scope) = scoped(&log_dir, core_config::log_level::DEBUG);

        let mut logger = ImageLogger::new();
        logger.needle = Some(Dumpable {
            name: "hello".into(),
            payload: DumpPayload::Text("hello world".into()),
            match_text: None,
        });
        logger.haystack = Some(Dumpable {
            name: "screen".into(),
            payload: DumpPayload::Raster(solid(4, 4)),
            match_text: None,
        });
        logger.dump_matched_images().unwrap();
        let contents = std::fs::read_to_string(log_dir.join("imglog001-1needle-hello.txt")).unwrap();
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn absorb_moves_stage_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_guard, _scope) = scoped(&dir.path().join("log"), core_config::log_level::ERROR);
        let mut outer = ImageLogger::new();
        let mut inner = ImageLogger::new();
        outer.hotmaps.push(solid(2, 2));
        outer.similarities.push(0.1);
        inner.hotmaps.push(solid(3, 3));
        inner.similarities.push(0.9);
        outer.absorb(&mut inner);
        assert_eq!(outer.hotmaps.len(), 2);
        assert_eq!(outer.similarities, vec![0.1, 0.9]);
        assert!(inner.hotmaps.is_empty());
    }
}
