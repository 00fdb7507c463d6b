//! The `.steps` chain file codec.
//!
//! A steps file describes a fallback chain: one step per line, exactly two
//! tab-separated fields: the step's data (a literal text value or a path to
//! a target data file), then the path of the match file configuring that step.
//! A `.steps` data field splices another chain in place, in document order;
//! the loader tracks canonicalized paths to refuse cyclic includes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use core_resolve::FileResolver;
use tracing::debug;

use crate::errors::FindError;
use crate::matchfile;
use crate::target::{ChainData, MatchSettings, Target, TargetData};

/// Load the flattened step list of a chain file.
pub fn load(path: &Path) -> Result<Vec<Target>, FindError> {
    let mut visited = HashSet::new();
    load_into(path, &mut visited)
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve a step field against the chain file's own directory first, then
/// the registered target paths.
fn resolve_step_file(base: &Path, name: &str) -> Result<PathBuf, FindError> {
    let beside = base.join(name);
    if beside.exists() {
        return Ok(beside);
    }
    let direct = PathBuf::from(name);
    if direct.exists() {
        return Ok(direct);
    }
    match FileResolver::new().search(name, "", false)? {
        Some(found) => Ok(found),
        None => Err(core_resolve::ResolveError::FileNotFound(name.to_owned()).into()),
    }
}

fn load_into(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<Vec<Target>, FindError> {
    let marker = canonical(path);
    if !visited.insert(marker.clone()) {
        return Err(FindError::InvalidStepsFile(format!(
            "cyclic chain include through {}",
            path.display()
        )));
    }
    let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let text = std::fs::read_to_string(path)?;
    let mut steps = Vec::new();

    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line
            .trim_end_matches(['\t', '\n'])
            .split('\t')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() != 2 {
            return Err(FindError::InvalidStepsFile(format!(
                "invalid chain step line {} in {}: {line:?}",
                number + 1,
                path.display()
            )));
        }
        let (data, match_name) = (fields[0], fields[1]);

        if data.ends_with(".steps") {
            let nested = resolve_step_file(&base, data)?;
            debug!(target: "find.steps", nested = %nested.display(), "splicing nested chain");
            let mut nested_steps = load_into(&nested, visited)?;
            steps.append(&mut nested_steps);
            continue;
        }
        steps.push(load_step(&base, data, match_name)?);
    }
    visited.remove(&marker);
    Ok(steps)
}

/// Build one chain step from its data and match fields. The step kind comes
/// from the data file extension, with a bare value treated as literal text.
fn load_step(base: &Path, data: &str, match_name: &str) -> Result<Target, FindError> {
    let match_path = resolve_step_file(base, match_name)?;
    let finder = matchfile::from_file(&match_path)?;

    let extension = Path::new(data)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let mut target = match extension {
        "png" | "jpg" => {
            let data_path = resolve_step_file(base, data)?;
            Target::image_from_file(&data_path.to_string_lossy())?
        }
        "xml" | "csv" => {
            let data_path = resolve_step_file(base, data)?;
            Target::pattern(&data_path.to_string_lossy())?
        }
        "txt" => {
            let data_path = resolve_step_file(base, data)?;
            let value = std::fs::read_to_string(&data_path)?;
            let mut text = Target::text(value.trim_end_matches('\n'))?;
            if let TargetData::Text(text_data) = &mut text.data {
                text_data.text_file = Some(data_path);
            }
            text
        }
        // a field without a known data extension is a literal text value
        _ => Target::text(data)?,
    };
    // the step line's match file overrides any sidecar the data file had
    target.settings = MatchSettings::Own(finder);
    Ok(target)
}

/// Save a chain: one line per step, recreating each step's match file beside
/// its data file.
pub fn save(chain: &ChainData, path: &Path) -> Result<(), FindError> {
    let mut lines = String::new();
    for step in &chain.steps {
        let data_path = match &step.data {
            TargetData::Image(image) => image.filename.clone().ok_or_else(|| {
                FindError::InvalidStepsFile("image step without a data file cannot be saved".into())
            })?,
            TargetData::Pattern(pattern) => pattern.data_file.clone(),
            TargetData::Text(text) => text.text_file.clone().ok_or_else(|| {
                FindError::InvalidStepsFile(format!(
                    "text step {:?} does not have a corresponding file",
                    text.value
                ))
            })?,
            TargetData::Chain(_) => {
                return Err(FindError::InvalidStepsFile(
                    "chains are flattened on load and cannot nest on save".into(),
                ));
            }
        };
        let match_path = data_path.with_extension("match");
        match &step.settings {
            MatchSettings::Own(finder) => {
                matchfile::to_file(finder.config(), &match_path)?;
            }
            MatchSettings::Inherit => {
                return Err(FindError::InvalidStepsFile(format!(
                    "step {} carries no own match settings to save",
                    data_path.display()
                )));
            }
        }
        lines.push_str(&format!(
            "{}\t{}\n",
            data_path.to_string_lossy(),
            match_path.to_string_lossy()
        ));
    }
    std::fs::write(path, lines)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::finder_for_backend;
    use image::{Rgb, RgbImage};

    fn write_match(dir: &Path, name: &str, backend: &str) -> PathBuf {
        let finder = finder_for_backend(backend).unwrap();
        matchfile::to_file(finder.config(), &dir.join(name)).unwrap()
    }

    fn write_image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(8, 8, Rgb([200, 10, 10])).save(&path).unwrap();
        path
    }

    #[test]
    fn two_field_lines_build_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "first.png");
        write_image(dir.path(), "second.png");
        write_match(dir.path(), "first.match", "template");
        write_match(dir.path(), "second.match", "bitmap");
        let steps_path = dir.path().join("flow.steps");
        std::fs::write(
            &steps_path,
            "first.png\tfirst.match\nsecond.png\tsecond.match\n",
        )
        .unwrap();

        let steps = load(&steps_path).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name(), "first");
        assert_eq!(
            steps[0].settings.own_finder().unwrap().backend_name(),
            "template"
        );
        assert_eq!(
            steps[1].settings.own_finder().unwrap().backend_name(),
            "bitmap"
        );
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let steps_path = dir.path().join("bad.steps");
        std::fs::write(&steps_path, "only_one_field\n").unwrap();
        assert!(matches!(
            load(&steps_path),
            Err(FindError::InvalidStepsFile(_))
        ));

        std::fs::write(&steps_path, "a\tb\tc\n").unwrap();
        assert!(matches!(
            load(&steps_path),
            Err(FindError::InvalidStepsFile(_))
        ));
    }

    #[test]
    fn nested_chains_splice_in_document_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "outer.png");
        write_image(dir.path(), "inner.png");
        write_match(dir.path(), "outer.match", "template");
        write_match(dir.path(), "inner.match", "template");
        std::fs::write(dir.path().join("inner.steps"), "inner.png\tinner.match\n").unwrap();
        std::fs::write(
            dir.path().join("outer.steps"),
            "inner.steps\tinner.match\nouter.png\touter.match\n",
        )
        .unwrap();

        let steps = load(&dir.path().join("outer.steps")).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name(), "inner");
        assert_eq!(steps[1].name(), "outer");
    }

    #[test]
    fn cyclic_includes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.steps"), "b.steps\twhatever\n").unwrap();
        std::fs::write(dir.path().join("b.steps"), "a.steps\twhatever\n").unwrap();
        let err = load(&dir.path().join("a.steps")).unwrap_err();
        assert!(matches!(err, FindError::InvalidStepsFile(message) if message.contains("cyclic")));
    }

    #[test]
    fn literal_text_fields_become_text_steps() {
        let dir = tempfile::tempdir().unwrap();
        write_match(dir.path(), "word.match", "text");
        let steps_path = dir.path().join("t.steps");
        std::fs::write(&steps_path, "HELLO\tword.match\n").unwrap();
        let steps = load(&steps_path).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind_name(), "text");
        assert_eq!(steps[0].name(), "HELLO");
    }

    #[test]
    fn saving_recreates_match_files_beside_data() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = write_image(dir.path(), "shot.png");
        write_match(dir.path(), "shot.match", "template");
        let steps_path = dir.path().join("chain.steps");
        std::fs::write(&steps_path, "shot.png\tshot.match\n").unwrap();
        let steps = load(&steps_path).unwrap();

        std::fs::remove_file(dir.path().join("shot.match")).unwrap();
        let chain = ChainData {
            name: "chain".into(),
            steps,
        };
        save(&chain, &steps_path).unwrap();
        assert!(dir.path().join("shot.match").exists());
        let text = std::fs::read_to_string(&steps_path).unwrap();
        assert!(text.contains(&image_path.to_string_lossy().into_owned()));
    }
}
