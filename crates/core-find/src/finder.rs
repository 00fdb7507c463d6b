//! The finder contract and its shared base configuration.
//!
//! Every finder owns a [`LocalConfig`] of categories and an
//! [`ImageLogger`]. Configuration is phase-split: construction registers the
//! category tables and generates parameter schemas (`configure_backend`),
//! while `synchronize_backend` binds schema values to whatever runtime
//! objects the backend needs. Nothing is bound during construction unless a
//! caller asks for it, which keeps finders cheap to build from match files.
//!
//! The `type` root category (single backend `cv`) and the `find` category
//! (backend = the finder's own name, plus the `similarity` threshold) are
//! shared by every finder and live here.

use core_imglog::ImageLogger;
use core_param::CvParameter;

use crate::errors::FindError;
use crate::matchfile;
use crate::matching::Match;
use crate::settings::{CategoryParams, LocalConfig};
use crate::target::Target;

/// All selectable `find.backend` values.
pub const FIND_BACKENDS: [&str; 9] = [
    "bitmap", "contour", "template", "feature", "cascade", "text", "tempfeat", "deep", "hybrid",
];

/// Contract shared by all matching backends.
pub trait Finder {
    /// The name this finder registers under `find.backend`.
    fn backend_name(&self) -> &'static str;

    fn config(&self) -> &LocalConfig;
    fn config_mut(&mut self) -> &mut LocalConfig;
    fn imglog(&self) -> &ImageLogger;
    fn imglog_mut(&mut self) -> &mut ImageLogger;

    /// Regenerate the parameter schema of one category (optionally selecting
    /// a new backend for it). `reset` regenerates the parent chain first.
    fn configure_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        reset: bool,
    ) -> Result<(), FindError>;

    /// Bind one category's schema to its runtime objects. Fails with
    /// [`FindError::UninitializedBackend`] when the named backend was never
    /// configured for the category.
    fn synchronize_backend(
        &mut self,
        backend: Option<&str>,
        category: &str,
        reset: bool,
    ) -> Result<(), FindError>;

    /// Regenerate the full schema from defaults.
    fn configure(&mut self) -> Result<(), FindError>;

    /// Rebind all dependent runtime objects.
    fn synchronize(&mut self) -> Result<(), FindError>;

    /// Find all needle targets in a haystack image, best match first.
    fn find(&mut self, needle: &Target, haystack: &Target) -> Result<Vec<Match>, FindError>;

    /// Flush (or defer) the image log for the last `find` call.
    fn log(&mut self, level: u32) -> Result<(), FindError>;

    /// Clone this finder, configuration included, behind the trait object.
    fn duplicate(&self) -> Box<dyn Finder>;
}

impl std::fmt::Debug for dyn Finder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Finder({})", self.backend_name())
    }
}

/// Register the root and find categories in a fresh configuration.
pub fn register_find(cfg: &mut LocalConfig) {
    cfg.register("type", "backend_types", &["cv"]);
    cfg.register("find", "find_methods", &FIND_BACKENDS);
}

/// Configure the root `type` category.
pub fn configure_type(cfg: &mut LocalConfig) {
    cfg.set_category("type", CategoryParams::new("cv"));
}

/// Configure the shared `find` category. The backend defaults to the
/// process-wide `find_backend` setting when none is given.
pub fn configure_find(
    cfg: &mut LocalConfig,
    backend: Option<&str>,
    reset: bool,
) -> Result<(), FindError> {
    if reset {
        configure_type(cfg);
    }
    let backend = match backend {
        Some(b) => b.to_owned(),
        None => core_config::with(|s| s.find_backend.clone()),
    };
    cfg.ensure_supported("find", &backend)?;
    tracing::debug!(target: "find", backend = %backend, "setting backend for find");
    cfg.set_category(
        "find",
        CategoryParams::new(&backend)
            .with("similarity", CvParameter::float(0.8, Some(0.0), Some(1.0))),
    );
    Ok(())
}

/// Shared synchronize check: the category must be configured, and when a
/// backend name is passed it must be the configured one.
pub fn check_synchronized(
    cfg: &LocalConfig,
    category: &str,
    backend: Option<&str>,
) -> Result<(), FindError> {
    let configured = cfg
        .backend(category)
        .ok_or_else(|| FindError::UninitializedBackend(category.to_owned()))?;
    if let Some(requested) = backend {
        if requested != configured {
            return Err(FindError::UninitializedBackend(requested.to_owned()));
        }
    }
    Ok(())
}

/// Reject categories a finder does not own.
pub fn reject_category(category: &str) -> FindError {
    FindError::UnsupportedCategory(category.to_owned())
}

/// Standard find prologue: record needle and haystack on the image logger
/// and dump them (the needle with this finder's rendered configuration).
pub(crate) fn stage_inputs(
    imglog: &mut ImageLogger,
    cfg: &LocalConfig,
    needle: &Target,
    haystack: &Target,
) -> Result<(), FindError> {
    imglog.needle = Some(needle.dumpable(Some(matchfile::render(cfg))));
    imglog.haystack = Some(haystack.dumpable(None));
    imglog.dump_matched_images()?;
    Ok(())
}

/// Shared `log` skeleton.
///
/// Under accumulation nothing happens: the outer finder will flush. Otherwise
/// the per-finder `emit` closure runs when the level clears the configured
/// threshold, and the logger concludes (clear + step increment) exactly once.
/// The logger is cleared even when emission fails, so no state leaks across
/// calls on error paths.
pub(crate) fn log_with<F>(
    imglog: &mut ImageLogger,
    level: u32,
    emit: F,
) -> Result<(), FindError>
where
    F: FnOnce(&mut ImageLogger) -> Result<(), FindError>,
{
    if core_imglog::accumulating() {
        return Ok(());
    }
    let due = match imglog.begin_emission(level) {
        Ok(due) => due,
        Err(err) => {
            imglog.clear();
            return Err(err.into());
        }
    };
    if due {
        if let Err(err) = emit(imglog) {
            imglog.clear();
            return Err(err);
        }
    }
    imglog.conclude();
    Ok(())
}

/// Emit the final canonical hotmap named after the last similarity. Most
/// finders end their emission with this.
pub(crate) fn emit_final_hotmap(imglog: &mut ImageLogger) -> Result<(), FindError> {
    let similarity = imglog.similarities.last().copied().unwrap_or(0.0);
    let name = format!(
        "imglog{}-3hotmap-{}.png",
        imglog.printable_step(),
        core_imglog::similarity_token(similarity)
    );
    let hotmap = imglog
        .hotmaps
        .last()
        .ok_or(core_imglog::LogError::MissingHotmap)?;
    imglog.dump_hotmap(&name, hotmap)?;
    Ok(())
}

/// Build the finder selected by a `find.backend` value.
pub fn finder_for_backend(backend: &str) -> Result<Box<dyn Finder>, FindError> {
    use crate::finders::*;
    match backend {
        "bitmap" => Ok(Box::new(bitmap::BitmapFinder::new()?)),
        "contour" => Ok(Box::new(contour::ContourFinder::new()?)),
        "template" => Ok(Box::new(template::TemplateFinder::new()?)),
        "feature" => Ok(Box::new(feature::FeatureFinder::new()?)),
        "cascade" => Ok(Box::new(cascade::CascadeFinder::new()?)),
        "text" => Ok(Box::new(text::TextFinder::new()?)),
        "tempfeat" => Ok(Box::new(tempfeat::TemplateFeatureFinder::new()?)),
        "deep" => Ok(Box::new(deep::DeepFinder::new()?)),
        "hybrid" => Ok(Box::new(hybrid::HybridFinder::new()?)),
        other => Err(FindError::unsupported(other, &FIND_BACKENDS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_category_rejects_unknown_backends() {
        let mut cfg = LocalConfig::new();
        register_find(&mut cfg);
        assert!(matches!(
            configure_find(&mut cfg, Some("nonsense"), true),
            Err(FindError::UnsupportedBackend { .. })
        ));
    }

    #[test]
    fn find_category_carries_the_similarity_threshold() {
        let mut cfg = LocalConfig::new();
        register_find(&mut cfg);
        configure_find(&mut cfg, Some("template"), true).unwrap();
        assert_eq!(cfg.backend("type"), Some("cv"));
        assert_eq!(cfg.backend("find"), Some("template"));
        assert_eq!(cfg.fval("find", "similarity"), 0.8);
    }

    #[test]
    fn synchronize_check_requires_configuration() {
        let mut cfg = LocalConfig::new();
        register_find(&mut cfg);
        assert!(matches!(
            check_synchronized(&cfg, "find", None),
            Err(FindError::UninitializedBackend(_))
        ));
        configure_find(&mut cfg, Some("template"), true).unwrap();
        assert!(check_synchronized(&cfg, "find", None).is_ok());
        assert!(check_synchronized(&cfg, "find", Some("template")).is_ok());
        assert!(matches!(
            check_synchronized(&cfg, "find", Some("feature")),
            Err(FindError::UninitializedBackend(_))
        ));
    }

    #[test]
    fn factory_covers_every_backend() {
        for backend in FIND_BACKENDS {
            let finder = finder_for_backend(backend).unwrap();
            assert_eq!(finder.backend_name(), backend);
            assert_eq!(finder.config().backend("find"), Some(backend));
        }
        assert!(finder_for_backend("unknown").is_err());
    }
}
