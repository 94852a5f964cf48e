//! Repository reference parsing.
//!
//! References take the form `owner/name`, `owner/name@branch` or
//! `owner/name@branch@environment`. In deploy mode the branch segment may
//! instead hold a build number.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DownstreamError;
use crate::Result;

/// Maximum number of `@`-separated segments in a reference.
const MAX_SEGMENTS: usize = 3;

/// Coordinates of the repository and build selector to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    pub owner: String,
    pub name: String,
    /// Empty for "latest", otherwise a branch or a build number.
    pub selector: String,
}

impl RepoTarget {
    /// `owner/name`
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// A parsed repository entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub target: RepoTarget,
    /// Third segment, used as the deploy environment for this entry.
    pub environment: Option<String>,
}

impl RepoRef {
    /// Parse a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let mut segments = reference.splitn(MAX_SEGMENTS, '@');
        let repo = segments.next().unwrap_or_default();
        let selector = segments.next().unwrap_or_default().to_string();
        let environment = segments
            .next()
            .filter(|env| !env.is_empty())
            .map(str::to_string);

        let (owner, name) = match repo.split_once('/') {
            Some((owner, name)) if !name.contains('/') => (owner, name),
            _ => return Err(DownstreamError::ReferenceParse(reference.to_string())),
        };
        if owner.is_empty() || name.is_empty() {
            return Err(DownstreamError::ReferenceParse(reference.to_string()));
        }

        Ok(RepoRef {
            target: RepoTarget {
                owner: owner.to_string(),
                name: name.to_string(),
                selector,
            },
            environment,
        })
    }
}

impl FromStr for RepoRef {
    type Err = DownstreamError;

    fn from_str(s: &str) -> Result<Self> {
        RepoRef::parse(s)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target.slug())?;
        if !self.target.selector.is_empty() || self.environment.is_some() {
            write!(f, "@{}", self.target.selector)?;
        }
        if let Some(env) = &self.environment {
            write!(f, "@{env}")?;
        }
        Ok(())
    }
}
