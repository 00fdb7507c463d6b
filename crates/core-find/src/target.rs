//! Targets: what a finder searches for.
//!
//! Four kinds share one wrapper: raster images, text values, classifier
//! pattern files, and fallback chains of sub-targets. Every target carries
//! its match settings, either [`MatchSettings::Inherit`] (use whatever the
//! caller configures) or [`MatchSettings::Own`] (a finder configured
//! specifically for this target, usually restored from a `.match` sidecar),
//! plus a center offset applied to the match center to produce the click
//! point.
//!
//! Image pixel data is cached process-wide by resolved path; cache entries
//! are immutable once inserted and shared between all targets loading the
//! same file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use image::RgbImage;
use core_imglog::{DumpPayload, Dumpable};
use core_resolve::FileResolver;

use crate::errors::FindError;
use crate::finder::{finder_for_backend, Finder};
use crate::matchfile;
use crate::steps;

static IMAGE_CACHE: LazyLock<Mutex<HashMap<PathBuf, Arc<RgbImage>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// How a target binds to a finder configuration.
pub enum MatchSettings {
    /// Defer to the finder of the calling region.
    Inherit,
    /// This target brings its own configured finder.
    Own(Box<dyn Finder>),
}

impl MatchSettings {
    pub fn own_finder(&self) -> Option<&dyn Finder> {
        match self {
            MatchSettings::Own(finder) => Some(finder.as_ref()),
            MatchSettings::Inherit => None,
        }
    }
}

impl Clone for MatchSettings {
    fn clone(&self) -> Self {
        match self {
            MatchSettings::Inherit => MatchSettings::Inherit,
            MatchSettings::Own(finder) => MatchSettings::Own(finder.duplicate()),
        }
    }
}

impl std::fmt::Debug for MatchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchSettings::Inherit => write!(f, "Inherit"),
            MatchSettings::Own(finder) => write!(f, "Own({})", finder.backend_name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageData {
    pub filename: Option<PathBuf>,
    pub pixels: Arc<RgbImage>,
}

impl ImageData {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

#[derive(Debug, Clone)]
pub struct TextData {
    pub value: String,
    pub text_file: Option<PathBuf>,
}

impl TextData {
    /// Levenshtein edit distance to another string.
    pub fn distance_to(&self, other: &str) -> usize {
        let a: Vec<char> = self.value.chars().collect();
        let b: Vec<char> = other.chars().collect();
        let mut previous: Vec<usize> = (0..=b.len()).collect();
        let mut current = vec![0usize; b.len() + 1];
        for (i, ca) in a.iter().enumerate() {
            current[0] = i + 1;
            for (j, cb) in b.iter().enumerate() {
                let substitution = previous[j] + usize::from(ca != cb);
                current[j + 1] = substitution
                    .min(previous[j + 1] + 1)
                    .min(current[j] + 1);
            }
            std::mem::swap(&mut previous, &mut current);
        }
        previous[b.len()]
    }
}

#[derive(Debug, Clone)]
pub struct PatternData {
    pub data_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ChainData {
    pub name: String,
    pub steps: Vec<Target>,
}

#[derive(Debug, Clone)]
pub enum TargetData {
    Image(ImageData),
    Text(TextData),
    Pattern(PatternData),
    Chain(ChainData),
}

#[derive(Debug, Clone)]
pub struct Target {
    pub data: TargetData,
    pub settings: MatchSettings,
    /// Offset from the match center toward the click point.
    pub center_offset: (i32, i32),
}

impl Target {
    fn new(data: TargetData, settings: MatchSettings) -> Target {
        Target {
            data,
            settings,
            center_offset: (0, 0),
        }
    }

    /// Load an image target, using the process-wide pixel cache and picking
    /// up a `.match` sidecar when one exists beside the data file.
    pub fn image_from_file(filename: &str) -> Result<Target, FindError> {
        Target::image_from_file_with_cache(filename, true)
    }

    /// Like [`Target::image_from_file`] but with explicit control over the
    /// pixel cache, for callers whose files change between loads.
    pub fn image_from_file_with_cache(filename: &str, use_cache: bool) -> Result<Target, FindError> {
        let path = resolve_existing(filename)?;
        let pixels = load_cached(&path, use_cache)?;
        let settings = sidecar_settings(&path)?;
        Ok(Target::new(
            TargetData::Image(ImageData {
                filename: Some(path),
                pixels,
            }),
            settings,
        ))
    }

    /// Wrap in-memory pixels (e.g. a fresh screen capture) as a target.
    pub fn image_from_pixels(pixels: RgbImage) -> Target {
        Target::new(
            TargetData::Image(ImageData {
                filename: None,
                pixels: Arc::new(pixels),
            }),
            MatchSettings::Inherit,
        )
    }

    /// Build a text target. A `<value>.txt` file in the registered paths
    /// overrides the literal value, and its sidecar settings are honored.
    pub fn text(value: &str) -> Result<Target, FindError> {
        let resolver = FileResolver::new();
        match resolver.find(&format!("{value}.txt"), "") {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)?;
                let settings = sidecar_settings(&path)?;
                Ok(Target::new(
                    TargetData::Text(TextData {
                        value: contents.trim_end_matches('\n').to_owned(),
                        text_file: Some(path),
                    }),
                    settings,
                ))
            }
            None => Ok(Target::new(
                TargetData::Text(TextData {
                    value: value.to_owned(),
                    text_file: None,
                }),
                MatchSettings::Inherit,
            )),
        }
    }

    /// Build a pattern target around a classifier data file.
    pub fn pattern(filename: &str) -> Result<Target, FindError> {
        let path = resolve_existing(filename)?;
        let settings = sidecar_settings(&path)?;
        Ok(Target::new(
            TargetData::Pattern(PatternData { data_file: path }),
            settings,
        ))
    }

    /// Load a chain target from its `.steps` file.
    pub fn chain(name: &str) -> Result<Target, FindError> {
        let path = resolve_existing(&format!("{name}.steps"))?;
        let steps = steps::load(&path)?;
        let settings = sidecar_settings(&path)?;
        Ok(Target::new(
            TargetData::Chain(ChainData {
                name: name.to_owned(),
                steps,
            }),
            settings,
        ))
    }

    /// Pick the target type from the data file extension.
    pub fn from_data_file(filename: &str) -> Result<Target, FindError> {
        let path = resolve_existing(filename)?;
        let stem = path_stem(&path);
        match path.extension().and_then(|e| e.to_str()) {
            Some("png") | Some("jpg") => Target::image_from_file(&path.to_string_lossy()),
            Some("txt") => Target::text(&stem),
            Some("xml") | Some("csv") => Target::pattern(&path.to_string_lossy()),
            Some("steps") => Target::chain(&stem),
            _ => Err(FindError::IncompatibleTargetFile(
                path.to_string_lossy().into_owned(),
            )),
        }
    }

    /// Restore a target from a data file plus its `.match` sidecar, picking
    /// the target kind from the configured `find.backend`.
    pub fn from_match_file(filename: &str) -> Result<Target, FindError> {
        let path = resolve_existing(filename)?;
        let match_path = path.with_extension("match");
        let finder = matchfile::from_file(&match_path)?;
        let stem = path_stem(&path);
        let mut target = match finder.backend_name() {
            "text" => Target::text(&stem)?,
            "cascade" | "deep" => Target::pattern(&path.to_string_lossy())?,
            "hybrid" => Target::chain(&stem)?,
            _ => Target::image_from_file(&path.to_string_lossy())?,
        };
        target.settings = MatchSettings::Own(finder);
        Ok(target)
    }

    /// Save the target data, recreating the `.match` sidecar when the target
    /// carries its own settings.
    pub fn save(&self, filename: &Path) -> Result<(), FindError> {
        match &self.data {
            TargetData::Image(image) => {
                let path = if filename.extension().and_then(|e| e.to_str()) == Some("png") {
                    filename.to_path_buf()
                } else {
                    filename.with_extension("png")
                };
                image.pixels.save(&path)?;
            }
            TargetData::Text(text) => {
                std::fs::write(filename, &text.value)?;
            }
            TargetData::Pattern(pattern) => {
                if pattern.data_file != filename {
                    std::fs::copy(&pattern.data_file, filename)?;
                }
            }
            TargetData::Chain(chain) => {
                steps::save(chain, filename)?;
            }
        }
        if let MatchSettings::Own(finder) = &self.settings {
            let match_path = filename.with_extension("match");
            matchfile::to_file(finder.config(), &match_path)?;
        }
        Ok(())
    }

    /// Display name used in artifact filenames.
    pub fn name(&self) -> String {
        match &self.data {
            TargetData::Image(image) => image
                .filename
                .as_deref()
                .map(path_stem)
                .unwrap_or_else(|| "noname".to_owned()),
            TargetData::Text(text) => text.value.chars().take(30).collect(),
            TargetData::Pattern(pattern) => path_stem(&pattern.data_file),
            TargetData::Chain(chain) => chain.name.clone(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.data {
            TargetData::Image(_) => "image",
            TargetData::Text(_) => "text",
            TargetData::Pattern(_) => "pattern",
            TargetData::Chain(_) => "chain",
        }
    }

    /// Similarity threshold of the target's own settings, if any.
    pub fn similarity(&self) -> Option<f64> {
        self.settings
            .own_finder()
            .map(|finder| finder.config().fval("find", "similarity"))
    }

    /// Copy with a different required similarity. A target without its own
    /// settings materializes the process-default finder first.
    pub fn with_similarity(&self, similarity: f64) -> Result<Target, FindError> {
        let mut copy = self.clone();
        if matches!(copy.settings, MatchSettings::Inherit) {
            let backend = core_config::with(|s| s.find_backend.clone());
            copy.settings = MatchSettings::Own(finder_for_backend(&backend)?);
        }
        if let MatchSettings::Own(finder) = &mut copy.settings {
            finder.config_mut().set_value(
                "find",
                "similarity",
                core_param::ParamValue::Float(similarity),
            );
        }
        Ok(copy)
    }

    /// Copy with a different center offset.
    pub fn with_center_offset(&self, dx: i32, dy: i32) -> Target {
        let mut copy = self.clone();
        copy.center_offset = (dx, dy);
        copy
    }

    /// Representation handed to the image logger.
    pub fn dumpable(&self, match_text: Option<String>) -> Dumpable {
        let payload = match &self.data {
            TargetData::Image(image) => DumpPayload::Raster((*image.pixels).clone()),
            TargetData::Text(text) => DumpPayload::Text(text.value.clone()),
            TargetData::Pattern(pattern) => DumpPayload::DataFile(pattern.data_file.clone()),
            TargetData::Chain(_) => DumpPayload::Text(self.name()),
        };
        let match_text = match (&self.settings, match_text) {
            // a target with its own settings dumps those, not the caller's
            (MatchSettings::Own(finder), _) => Some(matchfile::render(finder.config())),
            (MatchSettings::Inherit, fallback) => fallback,
        };
        Dumpable {
            name: self.name(),
            payload,
            match_text,
        }
    }
}

/// Capability checks: finders accept only the target kinds they understand.
pub fn expect_image<'t>(
    target: &'t Target,
    finder: &'static str,
) -> Result<&'t ImageData, FindError> {
    match &target.data {
        TargetData::Image(image) => Ok(image),
        _ => Err(FindError::IncompatibleTarget {
            finder,
            target: target.kind_name(),
        }),
    }
}

pub fn expect_text<'t>(target: &'t Target, finder: &'static str) -> Result<&'t TextData, FindError> {
    match &target.data {
        TargetData::Text(text) => Ok(text),
        _ => Err(FindError::IncompatibleTarget {
            finder,
            target: target.kind_name(),
        }),
    }
}

pub fn expect_pattern<'t>(
    target: &'t Target,
    finder: &'static str,
) -> Result<&'t PatternData, FindError> {
    match &target.data {
        TargetData::Pattern(pattern) => Ok(pattern),
        _ => Err(FindError::IncompatibleTarget {
            finder,
            target: target.kind_name(),
        }),
    }
}

fn path_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "noname".to_owned())
}

fn resolve_existing(filename: &str) -> Result<PathBuf, FindError> {
    let direct = PathBuf::from(filename);
    if direct.exists() {
        return Ok(direct);
    }
    let resolver = FileResolver::new();
    match resolver.search(filename, "", false)? {
        Some(path) => Ok(path),
        None => Err(core_resolve::ResolveError::FileNotFound(filename.to_owned()).into()),
    }
}

fn sidecar_settings(data_path: &Path) -> Result<MatchSettings, FindError> {
    let match_path = data_path.with_extension("match");
    if match_path.exists() {
        let mut finder = matchfile::from_file(&match_path)?;
        // binding may be refused by finders without runtime objects
        match finder.synchronize() {
            Ok(()) | Err(FindError::UnsupportedCategory(_)) => {}
            Err(err) => return Err(err),
        }
        Ok(MatchSettings::Own(finder))
    } else {
        Ok(MatchSettings::Inherit)
    }
}

fn load_cached(path: &Path, use_cache: bool) -> Result<Arc<RgbImage>, FindError> {
    if use_cache {
        let cache = IMAGE_CACHE.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(pixels) = cache.get(path) {
            return Ok(Arc::clone(pixels));
        }
    }
    let pixels = Arc::new(image::open(path)?.to_rgb8());
    if use_cache {
        let mut cache = IMAGE_CACHE.lock().unwrap_or_else(|poison| poison.into_inner());
        cache.insert(path.to_path_buf(), Arc::clone(&pixels));
    }
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checker(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([40, 40, 40])
            }
        })
    }

    #[test]
    fn edit_distance_counts_mutations() {
        let text = TextData {
            value: "kitten".into(),
            text_file: None,
        };
        assert_eq!(text.distance_to("kitten"), 0);
        assert_eq!(text.distance_to("sitting"), 3);
        assert_eq!(text.distance_to(""), 6);
    }

    #[test]
    fn image_cache_shares_pixel_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("button.png");
        checker(16).save(&path).unwrap();

        let first = Target::image_from_file(&path.to_string_lossy()).unwrap();
        let second = Target::image_from_file(&path.to_string_lossy()).unwrap();
        let (first_px, second_px) = match (&first.data, &second.data) {
            (TargetData::Image(a), TargetData::Image(b)) => (&a.pixels, &b.pixels),
            _ => panic!("expected image targets"),
        };
        assert!(Arc::ptr_eq(first_px, second_px));
    }

    #[test]
    fn data_file_extension_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("thing.png");
        checker(8).save(&png).unwrap();
        let txt = dir.path().join("word.txt");
        std::fs::write(&txt, "word").unwrap();
        let odd = dir.path().join("blob.bin");
        std::fs::write(&odd, "x").unwrap();

        assert_eq!(
            Target::from_data_file(&png.to_string_lossy()).unwrap().kind_name(),
            "image"
        );
        assert_eq!(
            Target::from_data_file(&txt.to_string_lossy()).unwrap().kind_name(),
            "text"
        );
        assert!(matches!(
            Target::from_data_file(&odd.to_string_lossy()),
            Err(FindError::IncompatibleTargetFile(_))
        ));
    }

    #[test]
    fn missing_files_surface_file_not_found() {
        assert!(matches!(
            Target::image_from_file("definitely_not_present.png"),
            Err(FindError::FileNotFound(_))
        ));
    }

    #[test]
    fn center_offset_copies_do_not_alias() {
        let target = Target::image_from_pixels(checker(8));
        let shifted = target.with_center_offset(3, -2);
        assert_eq!(shifted.center_offset, (3, -2));
        assert_eq!(target.center_offset, (0, 0));
    }

    #[test]
    fn capability_checks_reject_wrong_kinds() {
        let image = Target::image_from_pixels(checker(8));
        assert!(expect_image(&image, "template").is_ok());
        let err = expect_text(&image, "text").unwrap_err();
        assert!(matches!(err, FindError::IncompatibleTarget { .. }));
    }

    #[test]
    fn saving_recreates_the_match_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = Target::image_from_pixels(checker(16));
        let mut own = crate::finder::finder_for_backend("template").unwrap();
        own.config_mut().set_value(
            "find",
            "similarity",
            core_param::ParamValue::Float(0.55),
        );
        target.settings = MatchSettings::Own(own);

        let saved = dir.path().join("widget.png");
        target.save(&saved).unwrap();
        assert!(saved.exists());
        assert!(dir.path().join("widget.match").exists());

        let restored = Target::from_match_file(&saved.to_string_lossy()).unwrap();
        assert_eq!(restored.kind_name(), "image");
        assert_eq!(restored.similarity(), Some(0.55));
    }

    #[test]
    fn with_similarity_materializes_default_settings() {
        let target = Target::image_from_pixels(checker(8));
        assert!(target.similarity().is_none());
        let tuned = target.with_similarity(0.42).unwrap();
        assert_eq!(tuned.similarity(), Some(0.42));
        // the source target stays untouched
        assert!(target.similarity().is_none());
    }

    #[test]
    fn text_targets_prefer_a_resolvable_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greeting.txt"), "HELLO FILE\n").unwrap();
        let _scope =
            core_resolve::CustomFileResolver::begin([dir.path().to_path_buf()]);
        let from_file = Target::text("greeting").unwrap();
        match &from_file.data {
            TargetData::Text(text) => {
                assert_eq!(text.value, "HELLO FILE");
                assert!(text.text_file.is_some());
            }
            other => panic!("expected text target, got {other:?}"),
        }
        let literal = Target::text("no such stem").unwrap();
        match &literal.data {
            TargetData::Text(text) => {
                assert_eq!(text.value, "no such stem");
                assert!(text.text_file.is_none());
            }
            other => panic!("expected text target, got {other:?}"),
        }
    }
}
