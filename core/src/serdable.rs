//! Third-party types wrapped so they can live in serde descriptors.

use std::{
    ops::Deref,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// A glob pattern written as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GlobPattern(glob::Pattern);

impl GlobPattern {
    pub fn parse(pattern: &str) -> Result<Self, glob::PatternError> {
        glob::Pattern::new(pattern).map(Self)
    }

    /// Files under `root` matched by the pattern, sorted by path.
    /// Unreadable entries are skipped.
    pub fn expand(&self, root: impl AsRef<Path>) -> Result<Vec<PathBuf>, glob::PatternError> {
        let full = root.as_ref().join(self.0.as_str());
        let mut res: Vec<PathBuf> = glob::glob(&full.to_string_lossy())?
            .filter_map(|entry| match entry {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("Skipping unreadable glob match: {}", e);
                    None
                }
            })
            .filter(|p| p.is_file())
            .collect();
        res.sort();
        Ok(res)
    }
}

impl Deref for GlobPattern {
    type Target = glob::Pattern;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for GlobPattern {
    type Error = glob::PatternError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<GlobPattern> for String {
    fn from(p: GlobPattern) -> Self {
        p.0.as_str().to_owned()
    }
}
