//! The `.match` file codec.
//!
//! A match file persists one finder configuration as an INI-like document:
//! one section per category in registration order, a mandatory `backend`
//! option per section, and one option per parameter rendered through the
//! parameter grammar. Key case is preserved. Reading builds the finder
//! selected by the `find.backend` value and overlays the stored parameters
//! onto its freshly generated schema.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use core_param::CvParameter;
use core_resolve::FileResolver;
use tracing::{debug, warn};

use crate::errors::FindError;
use crate::finder::{finder_for_backend, Finder};
use crate::settings::LocalConfig;

const HEADER: &str = "# IMAGE MATCH DATA";

/// Render a configuration as match file text.
pub fn render(cfg: &LocalConfig) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for category in cfg.categories() {
        let Some(params) = cfg.category(category) else {
            continue;
        };
        out.push_str(&format!("[{category}]\n"));
        out.push_str(&format!("backend = {}\n", params.backend));
        for (key, param) in params.iter() {
            out.push_str(&format!("{key} = {param}\n"));
        }
        out.push('\n');
    }
    out
}

/// Write a configuration to a match file, appending the `.match` extension
/// when absent.
pub fn to_file(cfg: &LocalConfig, path: &Path) -> Result<PathBuf, FindError> {
    let path = if path.extension().and_then(|e| e.to_str()) == Some("match") {
        path.to_path_buf()
    } else {
        path.with_extension("match")
    };
    std::fs::write(&path, render(cfg))?;
    Ok(path)
}

type Sections = Vec<(String, Vec<(String, String)>)>;

/// Minimal INI reader: `[section]` headers, `key = value` options, comment
/// lines starting with `#` or `;`. Option keys keep their case.
fn parse_sections(text: &str) -> Result<Sections, FindError> {
    let mut sections: Sections = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push((name.to_owned(), Vec::new()));
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(FindError::InvalidMatchFile(format!(
                "line {} is neither a section nor an option: {line:?}",
                number + 1
            )));
        };
        match sections.last_mut() {
            Some((_, options)) => {
                options.push((key.trim().to_owned(), value.trim().to_owned()));
            }
            None => {
                return Err(FindError::InvalidMatchFile(format!(
                    "option before any section at line {}",
                    number + 1
                )));
            }
        }
    }
    Ok(sections)
}

/// Build a finder from match file text.
pub fn from_text(text: &str) -> Result<Box<dyn Finder>, FindError> {
    let sections = parse_sections(text)?;
    let lookup: HashMap<&str, &Vec<(String, String)>> = sections
        .iter()
        .map(|(name, options)| (name.as_str(), options))
        .collect();

    let find_section = lookup.get("find").ok_or_else(|| {
        FindError::InvalidMatchFile("no image matching configuration can be found".into())
    })?;
    let backend = find_section
        .iter()
        .find(|(key, _)| key == "backend")
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| core_config::with(|s| s.find_backend.clone()));

    let mut finder = finder_for_backend(&backend)?;
    let categories: Vec<String> = finder.config().categories().map(str::to_owned).collect();
    for category in categories {
        let Some(options) = lookup.get(category.as_str()) else {
            continue;
        };
        if let Some((_, stored_backend)) = options.iter().find(|(key, _)| key == "backend") {
            let configured = finder.config().backend(&category).map(str::to_owned);
            if configured.as_deref() != Some(stored_backend.as_str()) {
                finder.configure_backend(Some(stored_backend), &category, false)?;
            }
        }
        for (key, value) in options.iter() {
            if key == "backend" {
                continue;
            }
            if finder.config().param(&category, key).is_some() {
                let param = CvParameter::from_string(value)?;
                debug!(target: "find.matchfile", "{category}/{key} = {param}");
                if let Some(params) = finder.config_mut().category_mut(&category) {
                    params.insert(key, param);
                }
            } else {
                warn!(
                    target: "find.matchfile",
                    "skipping unknown option {category}/{key}"
                );
            }
        }
    }
    Ok(finder)
}

/// Read a finder from a match file, resolving the name through the
/// registered target paths when it does not exist as given.
pub fn from_file(path: &Path) -> Result<Box<dyn Finder>, FindError> {
    let mut path = path.to_path_buf();
    if path.extension().and_then(|e| e.to_str()) != Some("match") {
        path = path.with_extension("match");
    }
    if !path.exists() {
        let resolver = FileResolver::new();
        if let Some(found) = resolver.find(&path.to_string_lossy(), "") {
            path = found;
        }
    }
    let text = std::fs::read_to_string(&path).map_err(|err| {
        FindError::InvalidMatchFile(format!(
            "match file {} cannot be read: {err}",
            path.display()
        ))
    })?;
    from_text(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_param::ParamValue;

    #[test]
    fn rendered_configuration_reads_back() {
        let finder = finder_for_backend("template").unwrap();
        let text = render(finder.config());
        assert!(text.starts_with(HEADER));
        let restored = from_text(&text).unwrap();
        assert_eq!(restored.backend_name(), "template");
        assert_eq!(restored.config(), finder.config());
    }

    #[test]
    fn parameter_fields_survive_the_round_trip() {
        let mut finder = finder_for_backend("feature").unwrap();
        {
            let param = finder
                .config_mut()
                .param_mut("feature", "ransacReprojThreshold")
                .unwrap();
            param.delta = 50.0;
            param.tolerance = 1.0;
            param.fixed = false;
        }
        let restored = from_text(&render(finder.config())).unwrap();
        let reloaded = restored
            .config()
            .param("feature", "ransacReprojThreshold")
            .unwrap();
        let original = finder
            .config()
            .param("feature", "ransacReprojThreshold")
            .unwrap();
        assert_eq!(reloaded, original);
    }

    #[test]
    fn missing_find_section_is_an_error() {
        let err = from_text("[template]\nbackend = ccoeff_normed\n").unwrap_err();
        assert!(matches!(err, FindError::InvalidMatchFile(_)));
    }

    #[test]
    fn unknown_find_backend_is_unsupported() {
        let err = from_text("[find]\nbackend = warp_drive\n").unwrap_err();
        assert!(matches!(err, FindError::UnsupportedBackend { .. }));
    }

    #[test]
    fn section_backend_switch_regenerates_the_schema() {
        let mut finder = finder_for_backend("contour").unwrap();
        finder
            .configure_backend(Some("canny"), "threshold", false)
            .unwrap();
        finder
            .config_mut()
            .set_value("threshold", "threshold1", ParamValue::Float(42.0));
        let restored = from_text(&render(finder.config())).unwrap();
        assert_eq!(restored.config().backend("threshold"), Some("canny"));
        assert_eq!(restored.config().fval("threshold", "threshold1"), 42.0);
    }

    #[test]
    fn file_round_trip_appends_extension() {
        let dir = tempfile::tempdir().unwrap();
        let finder = finder_for_backend("bitmap").unwrap();
        let written = to_file(finder.config(), &dir.path().join("button")).unwrap();
        assert_eq!(written.extension().and_then(|e| e.to_str()), Some("match"));
        let restored = from_file(&written).unwrap();
        assert_eq!(restored.backend_name(), "bitmap");
    }
}
