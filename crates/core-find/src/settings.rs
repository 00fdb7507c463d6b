//! Backend configuration storage shared by all finders.
//!
//! A finder's configuration is a set of *categories*, one per pluggable
//! sub-algorithm (`find`, `template`, `fdetect`, ...). Each category names
//! its active *backend* and carries the backend's parameters. The tables of
//! known categories and their backend lists are registered by the finder at
//! construction; the parameter schemas are (re)generated by
//! `configure_backend` and bound to runtime objects by `synchronize_backend`
//! on the finder itself.
//!
//! Invariants:
//! * Every configured category has a `backend` value drawn from its
//!   registered backend list.
//! * Category registration order is stable; match files and benchmark
//!   enumeration both follow it.

use std::collections::BTreeMap;

use core_param::{CvParameter, ParamValue};

use crate::errors::FindError;

/// Parameters of one configured category: the active backend plus one
/// [`CvParameter`] per tunable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryParams {
    pub backend: String,
    params: BTreeMap<String, CvParameter>,
}

impl CategoryParams {
    pub fn new(backend: &str) -> CategoryParams {
        CategoryParams {
            backend: backend.to_owned(),
            params: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: &str, param: CvParameter) {
        self.params.insert(key.to_owned(), param);
    }

    /// Builder-style insertion used by the schema tables.
    pub fn with(mut self, key: &str, param: CvParameter) -> CategoryParams {
        self.insert(key, param);
        self
    }

    pub fn get(&self, key: &str) -> Option<&CvParameter> {
        self.params.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut CvParameter> {
        self.params.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CvParameter)> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut CvParameter)> {
        self.params.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }
}

/// The nested category -> (key -> parameter) configuration of one finder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalConfig {
    /// (category, algorithm-group) pairs in registration order.
    categories: Vec<(String, String)>,
    /// algorithm-group -> supported backend names.
    algorithms: BTreeMap<String, Vec<&'static str>>,
    params: BTreeMap<String, CategoryParams>,
}

impl LocalConfig {
    pub fn new() -> LocalConfig {
        LocalConfig::default()
    }

    /// Declare a category and the backends its algorithm group supports.
    pub fn register(&mut self, category: &str, group: &str, backends: &[&'static str]) {
        if !self.categories.iter().any(|(c, _)| c == category) {
            self.categories.push((category.to_owned(), group.to_owned()));
        }
        self.algorithms.insert(group.to_owned(), backends.to_vec());
    }

    /// Categories in registration order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|(c, _)| c.as_str())
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|(c, _)| c == category)
    }

    /// Supported backends of a category, if the category is registered.
    pub fn backends_for(&self, category: &str) -> Option<&[&'static str]> {
        let group = &self.categories.iter().find(|(c, _)| c == category)?.1;
        self.algorithms.get(group).map(|v| v.as_slice())
    }

    /// Validate a backend choice against the category registry.
    pub fn ensure_supported(&self, category: &str, backend: &str) -> Result<(), FindError> {
        let supported = self
            .backends_for(category)
            .ok_or_else(|| FindError::UnsupportedCategory(category.to_owned()))?;
        if supported.contains(&backend) {
            Ok(())
        } else {
            Err(FindError::unsupported(backend, supported))
        }
    }

    /// Install a freshly generated category schema, replacing any previous
    /// parameters of that category.
    pub fn set_category(&mut self, category: &str, params: CategoryParams) {
        self.params.insert(category.to_owned(), params);
    }

    pub fn category(&self, category: &str) -> Option<&CategoryParams> {
        self.params.get(category)
    }

    pub fn category_mut(&mut self, category: &str) -> Option<&mut CategoryParams> {
        self.params.get_mut(category)
    }

    /// Active backend of a configured category.
    pub fn backend(&self, category: &str) -> Option<&str> {
        self.params.get(category).map(|c| c.backend.as_str())
    }

    pub fn param(&self, category: &str, key: &str) -> Option<&CvParameter> {
        self.params.get(category).and_then(|c| c.get(key))
    }

    pub fn param_mut(&mut self, category: &str, key: &str) -> Option<&mut CvParameter> {
        self.params.get_mut(category).and_then(|c| c.get_mut(key))
    }

    fn expect_param(&self, category: &str, key: &str) -> &CvParameter {
        self.param(category, key).unwrap_or_else(|| {
            panic!("configuration schema invariant broken: missing {category}/{key}")
        })
    }

    /// Typed accessors. The schema generated by `configure_backend`
    /// guarantees presence and type of every parameter a finder reads, so a
    /// miss here is a programming error, not a runtime condition.
    pub fn fval(&self, category: &str, key: &str) -> f64 {
        match &self.expect_param(category, key).value {
            ParamValue::Float(v) => *v,
            ParamValue::Int(v) => *v as f64,
            other => panic!("{category}/{key} is not numeric: {other:?}"),
        }
    }

    pub fn ival(&self, category: &str, key: &str) -> i64 {
        match &self.expect_param(category, key).value {
            ParamValue::Int(v) => *v,
            ParamValue::Float(v) => *v as i64,
            other => panic!("{category}/{key} is not numeric: {other:?}"),
        }
    }

    pub fn bval(&self, category: &str, key: &str) -> bool {
        match &self.expect_param(category, key).value {
            ParamValue::Bool(v) => *v,
            other => panic!("{category}/{key} is not boolean: {other:?}"),
        }
    }

    pub fn sval(&self, category: &str, key: &str) -> String {
        match &self.expect_param(category, key).value {
            ParamValue::Str(v) => v.clone(),
            other => panic!("{category}/{key} is not a string: {other:?}"),
        }
    }

    pub fn set_value(&mut self, category: &str, key: &str, value: ParamValue) {
        if let Some(param) = self.param_mut(category, key) {
            param.value = value;
        }
    }

    /// Mark or unmark a whole category for calibration by toggling the
    /// `fixed` flag of each of its parameters.
    pub fn can_calibrate(&mut self, category: &str, mark: bool) -> Result<(), FindError> {
        if !self.has_category(category) {
            return Err(FindError::UnsupportedCategory(category.to_owned()));
        }
        if let Some(params) = self.params.get_mut(category) {
            for (key, param) in params.iter_mut() {
                param.fixed = !mark;
                tracing::debug!(
                    target: "find",
                    "setting {category}/{key} to fixed={} for calibration",
                    param.fixed
                );
            }
        }
        Ok(())
    }

    /// Snapshot of every (category, key) parameter address, in category
    /// registration order. The calibrator walks this while mutating.
    pub fn param_keys(&self) -> Vec<(String, String)> {
        let mut keys = Vec::new();
        for (category, _) in &self.categories {
            if let Some(params) = self.params.get(category) {
                for key in params.keys() {
                    keys.push((category.clone(), key.clone()));
                }
            }
        }
        keys
    }
}
