//! Parameter resolution for triggered builds.
//!
//! Parameters come from three places, merged in this order (later wins):
//! 1. `KEY=VALUE` tokens and dotenv files, in token order
//! 2. the upstream build number, when one is supplied
//! 3. `params_from_env` names looked up in the environment

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::Path;

use crate::error::DownstreamError;
use crate::Result;

/// Key under which the upstream build number is passed downstream.
pub const UPSTREAM_BUILD_NUMBER_PARAM: &str = "DRONE_UPSTREAM_BUILD_NUMBER";

/// Placeholder shown instead of values sourced from the environment.
pub const REDACTED: &str = "[from-environment]";

/// Merged build parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    values: BTreeMap<String, String>,
    from_env: BTreeSet<String>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a parameter.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Insert a parameter whose value must never be displayed.
    pub fn insert_from_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.from_env.insert(key.clone());
        self.values.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the real key/value pairs, sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Key/value pairs safe to show to a human.
    pub fn redacted(&self) -> BTreeMap<&str, &str> {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if self.from_env.contains(k) {
                    REDACTED
                } else {
                    v.as_str()
                };
                (k.as_str(), shown)
            })
            .collect()
    }

    /// `KEY: value` lines for the summary printed after a trigger.
    pub fn summary_lines(&self) -> Vec<String> {
        self.redacted()
            .into_iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect()
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let file_err = |reason: String| DownstreamError::ParamFile {
            path: path.display().to_string(),
            reason,
        };
        let iter = dotenvy::from_path_iter(path).map_err(|e| file_err(e.to_string()))?;
        for item in iter {
            let (key, value) = item.map_err(|e| file_err(e.to_string()))?;
            self.insert(key, value);
        }
        Ok(())
    }
}

/// Parse `KEY=VALUE` tokens and dotenv file paths into a parameter set.
///
/// A token splits at its first `=`, so values may themselves contain `=`.
/// A token without `=` must name an existing file.
pub fn parse_params<S: AsRef<str>>(tokens: &[S]) -> Result<ParameterSet> {
    let mut params = ParameterSet::new();
    for token in tokens {
        let token = token.as_ref();
        match token.split_once('=') {
            Some((key, value)) => params.insert(key, value),
            None => {
                let path = Path::new(token);
                if !path.exists() {
                    return Err(DownstreamError::InvalidParam(token.to_string()));
                }
                params.merge_file(path)?;
            }
        }
    }
    Ok(params)
}

/// Inputs for a full parameter resolution.
#[derive(Debug, Clone, Default)]
pub struct ParamSources {
    /// `KEY=VALUE` tokens or dotenv file paths.
    pub tokens: Vec<String>,
    /// Environment variable names to pass through by name.
    pub from_env: Vec<String>,
    /// Build number of the pipeline doing the triggering, if known.
    pub upstream_build_number: Option<String>,
}

impl ParamSources {
    /// Resolve against the current process environment.
    pub fn resolve(&self) -> Result<ParameterSet> {
        self.resolve_os(|key| std::env::var_os(key))
    }

    /// Resolve using `lookup` for `from_env` names.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ParameterSet>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.resolve_os(|key| lookup(key).map(OsString::from))
    }

    /// Like [`resolve_with`](Self::resolve_with), but a variable that is set
    /// to a non-UTF-8 value fails as `NonUnicodeEnvParam` rather than
    /// looking missing.
    pub fn resolve_os<F>(&self, lookup: F) -> Result<ParameterSet>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut params = parse_params(&self.tokens)?;

        if let Some(number) = &self.upstream_build_number {
            params.insert(UPSTREAM_BUILD_NUMBER_PARAM, number.clone());
        }

        for key in &self.from_env {
            let value = lookup(key)
                .ok_or_else(|| DownstreamError::MissingEnvParam(key.clone()))?
                .into_string()
                .map_err(|_| DownstreamError::NonUnicodeEnvParam(key.clone()))?;
            params.insert_from_env(key.clone(), value);
        }

        Ok(params)
    }
}
