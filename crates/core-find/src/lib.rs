//! Target finding: the matching core.
//!
//! A [`Finder`](finder::Finder) takes a *needle* [`Target`](target::Target)
//! and a *haystack* raster and produces [`Match`](matching::Match) records
//! ordered best first. Eight concrete finders share one contract and one
//! configuration model: a [`LocalConfig`](settings::LocalConfig) of categories,
//! each category naming an active backend plus its calibratable parameters.
//! Finder configurations round-trip through `.match` files and fallback
//! chains through `.steps` files.
//!
//! Module map:
//! * [`settings`]: category/backend registry and parameter storage
//! * [`matching`]: the match record
//! * [`target`]: image/text/pattern/chain targets and the image cache
//! * [`finder`]: the finder contract, shared base categories, the factory
//! * [`finders`]: the concrete backends
//! * [`raster`], [`shapes`], [`keypoints`], [`projection`], [`font`]: the
//!   raster/geometry toolbox the finders are built from
//! * [`matchfile`], [`steps`]: the two file codecs

pub mod errors;
pub mod finder;
pub mod finders;
pub mod font;
pub mod keypoints;
pub mod matchfile;
pub mod matching;
pub mod projection;
pub mod raster;
pub mod settings;
pub mod shapes;
pub mod steps;
pub mod target;

pub use errors::FindError;
pub use finder::{finder_for_backend, Finder};
pub use matching::Match;
pub use settings::{CategoryParams, LocalConfig};
pub use target::{MatchSettings, Target, TargetData};
