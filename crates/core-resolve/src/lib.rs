//! Name-to-path resolution for target data files.
//!
//! Targets are usually referenced by bare names (`shape_blue_circle`) and
//! resolved against a process-wide list of registered directories. A lookup
//! first tries the name as given in every directory, then retries with each
//! of the known target extensions appended. [`FileResolver::find`] reports a
//! miss as `None` so fallback call sites stay signal-flow;
//! [`FileResolver::search`] converts a miss into [`ResolveError::FileNotFound`]
//! unless silenced.

use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};

use thiserror::Error;
use tracing::info;

/// Extensions tried, in order, when the bare name does not exist.
const FALLBACK_EXTENSIONS: [&str; 5] = ["png", "xml", "txt", "csv", "steps"];

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("file {0} not found in any registered path")]
    FileNotFound(String),
}

static TARGET_PATHS: LazyLock<RwLock<Vec<PathBuf>>> = LazyLock::new(|| RwLock::new(Vec::new()));

/// Handle over the process-wide list of target directories.
///
/// The list is shared between all instances; the type exists so call sites
/// read naturally and so [`CustomFileResolver`] has something to hand back.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileResolver;

impl FileResolver {
    pub fn new() -> FileResolver {
        FileResolver
    }

    /// Register a directory unless it is already present.
    pub fn add_path(&self, directory: impl Into<PathBuf>) {
        let directory = directory.into();
        let mut paths = write_paths();
        if !paths.contains(&directory) {
            info!(target: "resolve", path = %directory.display(), "adding target path");
            paths.push(directory);
        }
    }

    /// Deregister a directory, reporting whether it was present.
    pub fn remove_path(&self, directory: impl AsRef<Path>) -> bool {
        let directory = directory.as_ref();
        let mut paths = write_paths();
        match paths.iter().position(|p| p == directory) {
            Some(index) => {
                info!(target: "resolve", path = %directory.display(), "removing target path");
                paths.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop all registered directories.
    pub fn clear(&self) {
        write_paths().clear();
    }

    /// Snapshot of the registered directories, in registration order.
    pub fn paths(&self) -> Vec<PathBuf> {
        read_paths().clone()
    }

    /// Locate `filename` in the registered directories, trying the known
    /// target extensions when the bare name misses. `restriction` is a plain
    /// substring filter over candidate paths. Returns `None` on a miss.
    pub fn find(&self, filename: &str, restriction: &str) -> Option<PathBuf> {
        for directory in read_paths().iter() {
            let fullname = directory.join(filename);
            if !fullname.to_string_lossy().contains(restriction) {
                continue;
            }
            if fullname.exists() {
                return Some(fullname);
            }
            for extension in FALLBACK_EXTENSIONS {
                let with_ext = directory.join(format!("{filename}.{extension}"));
                if with_ext.exists() {
                    return Some(with_ext);
                }
            }
        }
        None
    }

    /// Like [`FileResolver::find`] but a miss is an error unless `silent`.
    pub fn search(
        &self,
        filename: &str,
        restriction: &str,
        silent: bool,
    ) -> Result<Option<PathBuf>, ResolveError> {
        match self.find(filename, restriction) {
            Some(path) => Ok(Some(path)),
            None if silent => Ok(None),
            None => Err(ResolveError::FileNotFound(filename.to_owned())),
        }
    }
}

fn read_paths() -> std::sync::RwLockReadGuard<'static, Vec<PathBuf>> {
    TARGET_PATHS
        .read()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn write_paths() -> std::sync::RwLockWriteGuard<'static, Vec<PathBuf>> {
    TARGET_PATHS
        .write()
        .unwrap_or_else(|poison| poison.into_inner())
}

/// Scope that temporarily replaces the registered directories.
///
/// While the guard lives, searches see only the paths given at construction;
/// dropping it restores the previous list.
#[derive(Debug)]
pub struct CustomFileResolver {
    saved: Vec<PathBuf>,
}

impl CustomFileResolver {
    pub fn begin(paths: impl IntoIterator<Item = PathBuf>) -> CustomFileResolver {
        let resolver = FileResolver::new();
        let saved = resolver.paths();
        resolver.clear();
        for path in paths {
            resolver.add_path(path);
        }
        CustomFileResolver { saved }
    }

    pub fn resolver(&self) -> FileResolver {
        FileResolver::new()
    }
}

impl Drop for CustomFileResolver {
    fn drop(&mut self) {
        let resolver = FileResolver::new();
        resolver.clear();
        for path in self.saved.drain(..) {
            resolver.add_path(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    // Registered paths are process-wide; tests serialize and clean up.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn exclusive() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        FileResolver::new().clear();
        guard
    }

    #[test]
    fn add_remove_and_clear() {
        let _guard = exclusive();
        let resolver = FileResolver::new();
        resolver.add_path("alpha");
        resolver.add_path("alpha");
        resolver.add_path("beta");
        assert_eq!(resolver.paths().len(), 2);
        assert!(resolver.remove_path("alpha"));
        assert!(!resolver.remove_path("alpha"));
        resolver.clear();
        assert!(resolver.paths().is_empty());
    }

    #[test]
    fn search_tries_known_extensions() {
        let _guard = exclusive();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("button.png"), b"png").unwrap();
        std::fs::write(dir.path().join("flow.steps"), b"steps").unwrap();

        let resolver = FileResolver::new();
        resolver.add_path(dir.path());

        let hit = resolver.find("button", "").unwrap();
        assert_eq!(hit, dir.path().join("button.png"));
        let hit = resolver.find("flow", "").unwrap();
        assert_eq!(hit, dir.path().join("flow.steps"));
        resolver.clear();
    }

    #[test]
    fn missing_file_is_an_error_unless_silent() {
        let _guard = exclusive();
        let resolver = FileResolver::new();
        assert_eq!(
            resolver.search("no_such_file", "", false),
            Err(ResolveError::FileNotFound("no_such_file".into()))
        );
        assert_eq!(resolver.search("no_such_file", "", true), Ok(None));
    }

    #[test]
    fn restriction_filters_directories() {
        let _guard = exclusive();
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        std::fs::write(one.path().join("shared.txt"), b"one").unwrap();
        std::fs::write(two.path().join("shared.txt"), b"two").unwrap();

        let resolver = FileResolver::new();
        resolver.add_path(one.path());
        resolver.add_path(two.path());

        let restricted = two.path().to_string_lossy().into_owned();
        let hit = resolver.find("shared.txt", &restricted).unwrap();
        assert_eq!(hit, two.path().join("shared.txt"));
        resolver.clear();
    }

    #[test]
    fn custom_resolver_scopes_the_path_list() {
        let _guard = exclusive();
        let resolver = FileResolver::new();
        resolver.add_path("outer");
        {
            let scope = CustomFileResolver::begin([PathBuf::from("inner")]);
            assert_eq!(scope.resolver().paths(), vec![PathBuf::from("inner")]);
        }
        assert_eq!(resolver.paths(), vec![PathBuf::from("outer")]);
        resolver.clear();
    }
}
