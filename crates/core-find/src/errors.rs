//! Error kinds shared by the matching core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FindError {
    #[error(transparent)]
    FileNotFound(#[from] core_resolve::ResolveError),
    #[error("finder '{finder}' cannot match a target of kind '{target}'")]
    IncompatibleTarget {
        finder: &'static str,
        target: &'static str,
    },
    #[error("the target file {0} is not among any of the known types")]
    IncompatibleTargetFile(String),
    #[error("backend '{backend}' is not among the supported ones: {supported:?}")]
    UnsupportedBackend {
        backend: String,
        supported: Vec<&'static str>,
    },
    #[error("backend category '{0}' is not supported")]
    UnsupportedCategory(String),
    #[error("backend '{0}' has not been configured yet")]
    UninitializedBackend(String),
    #[error("{0}")]
    NotImplemented(&'static str),
    #[error("match file error: {0}")]
    InvalidMatchFile(String),
    #[error("steps file error: {0}")]
    InvalidStepsFile(String),
    #[error(transparent)]
    Param(#[from] core_param::ParamError),
    #[error(transparent)]
    Log(#[from] core_imglog::LogError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl FindError {
    /// Build the standard unsupported-backend error from a candidate name and
    /// the registry slice it was checked against.
    pub fn unsupported(backend: &str, supported: &[&'static str]) -> FindError {
        FindError::UnsupportedBackend {
            backend: backend.to_owned(),
            supported: supported.to_vec(),
        }
    }
}
