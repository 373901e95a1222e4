//! Declared inputs and outputs of a grading step.
//!
//! Paths in [`GradingFileInput::src`](InputSource::Path) and
//! [`GradingFileOutput::dest`] are relative to [`GradingArtifacts::root`];
//! `GradingFileInput::dest` and `GradingFileOutput::src` are relative to the sandbox.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::sandbox::RunLog;

/// A named slot for a digest that some step produces.
///
/// The value is owned by the artifact declaration that carries it; passing a produced
/// digest to a later step means cloning the holder into that step's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestHolder {
    pub name: String,
    pub value: Option<Digest>,
}

impl DigestHolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn with_value(name: impl Into<String>, value: Digest) -> Self {
        Self {
            name: name.into(),
            value: Some(value),
        }
    }

    pub fn is_produced(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    Path(PathBuf),
    Digest(DigestHolder),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingFileInput {
    pub src: InputSource,
    pub dest: PathBuf,
    pub executable: bool,
}

impl GradingFileInput {
    pub fn from_path(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            src: InputSource::Path(src.into()),
            dest: dest.into(),
            executable: false,
        }
    }

    pub fn from_digest(holder: DigestHolder, dest: impl Into<PathBuf>) -> Self {
        Self {
            src: InputSource::Digest(holder),
            dest: dest.into(),
            executable: false,
        }
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingFileOutput {
    pub src: PathBuf,
    pub dest: Option<PathBuf>,
    pub digest: Option<DigestHolder>,
    pub executable: bool,
    /// A missing file is not an error.
    pub optional: bool,
    /// Only needed while the batch runs; not checked on cache lookup.
    pub intermediate: bool,
    pub maxlen: Option<u64>,
}

impl GradingFileOutput {
    fn new(src: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dest: None,
            digest: None,
            executable: false,
            optional: false,
            intermediate: false,
            maxlen: None,
        }
    }

    pub fn to_path(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self::new(src).also_to_path(dest)
    }

    pub fn to_digest(src: impl Into<PathBuf>, holder: impl Into<String>) -> Self {
        Self {
            digest: Some(DigestHolder::new(holder)),
            ..Self::new(src)
        }
    }

    pub fn also_to_path(mut self, dest: impl Into<PathBuf>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn intermediate(mut self) -> Self {
        self.intermediate = true;
        self
    }

    pub fn maxlen(mut self, n: u64) -> Self {
        self.maxlen = Some(n);
        self
    }

    /// Digest-captured outputs are tracked by their digest; their `dest` copy can always
    /// be restored from the content store.
    pub fn is_hashed(&self) -> bool {
        self.digest.is_some()
    }

    pub fn digest_value(&self) -> Option<&Digest> {
        self.digest.as_ref().and_then(|h| h.value.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingArtifacts {
    pub root: PathBuf,
    pub inputs: Vec<GradingFileInput>,
    pub outputs: Vec<GradingFileOutput>,
    /// Filled by the run step, or restored from the cache.
    pub run_log: Option<RunLog>,
    /// Whether the last step on this batch was answered from the cache.
    #[serde(skip)]
    pub cached: bool,
}

impl GradingArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn input(mut self, input: GradingFileInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: GradingFileOutput) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    /// Looks up the produced digest of the output holder named `name`.
    pub fn produced(&self, name: &str) -> Option<&Digest> {
        self.outputs
            .iter()
            .filter_map(|o| o.digest.as_ref())
            .find(|h| h.name == name)
            .and_then(|h| h.value.as_ref())
    }

    /// A holder suitable for feeding the output named `name` into a later step.
    pub fn produced_holder(&self, name: &str) -> Option<DigestHolder> {
        self.outputs
            .iter()
            .filter_map(|o| o.digest.as_ref())
            .find(|h| h.name == name)
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::digest::digest_bytes;

    #[test]
    fn builders() {
        let mut a = GradingArtifacts::new("/pkg")
            .input(GradingFileInput::from_path("sol.cpp", "compilable"))
            .output(
                GradingFileOutput::to_digest("executable", "exe")
                    .also_to_path("build/exe")
                    .executable(),
            )
            .output(GradingFileOutput::to_path("log.txt", "build/log.txt").optional());

        assert_eq!(a.resolve("sol.cpp"), Path::new("/pkg/sol.cpp"));
        assert_eq!(a.resolve("/abs/x"), Path::new("/abs/x"));
        assert!(a.outputs[0].is_hashed());
        assert!(!a.outputs[1].is_hashed());
        assert_eq!(a.produced("exe"), None);

        let d = digest_bytes("bin");
        a.outputs[0].digest.as_mut().unwrap().value = Some(d.clone());
        assert_eq!(a.produced("exe"), Some(&d));
        assert_eq!(
            a.produced_holder("exe"),
            Some(DigestHolder::with_value("exe", d))
        );
    }
}
