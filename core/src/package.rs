//! The problem package descriptor.
//!
//! Paths inside a package are relative to the directory holding the descriptor.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

use lazy_regex::{lazy_regex, Lazy, Regex};
use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::outcome::Outcome;
use crate::serdable::GlobPattern;

/// Name of the group that must come first when present.
pub const SAMPLES_GROUP: &str = "samples";

static IDENTIFIER: Lazy<Regex> = lazy_regex!(r"^[A-Za-z_][A-Za-z0-9_]*$");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeItem {
    pub path: PathBuf,
    /// Language name in the environment. Inferred from the extension when unset.
    #[serde(default)]
    pub language: Option<String>,
    /// Extra files staged next to the source when compiling, e.g. headers.
    /// Must live under the source's directory; their relative layout is kept.
    #[serde(default)]
    pub compilation_files: Vec<PathBuf>,
}

impl CodeItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            language: None,
            compilation_files: Vec::new(),
        }
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.language = Some(lang.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Testcase {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorCall {
    pub name: String,
    /// Shell-quoted argument string appended to the generator's command.
    #[serde(default)]
    pub args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestcaseGroup {
    pub name: String,
    #[serde(default)]
    pub testcases: Vec<Testcase>,
    /// Matches `.in` files; a sibling `.out` with the same stem is taken as the answer.
    #[serde(default)]
    pub testcase_glob: Option<GlobPattern>,
    #[serde(default)]
    pub generators: Vec<GeneratorCall>,
    /// A program (or a `.txt` file) whose lines are `<generator> <args...>`.
    #[serde(default)]
    pub generator_script: Option<CodeItem>,
    /// Overrides the package validator for this group.
    #[serde(default)]
    pub validator: Option<CodeItem>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl TestcaseGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            testcases: Vec::new(),
            testcase_glob: None,
            generators: Vec::new(),
            generator_script: None,
            validator: None,
            weight: default_weight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    pub name: String,
    #[serde(flatten)]
    pub code: CodeItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    #[serde(flatten)]
    pub code: CodeItem,
    pub outcome: Outcome,
}

/// A value passed to validators as `--name=value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Bool(b) => write!(f, "{}", b),
            Primitive::Int(n) => write!(f, "{}", n),
            Primitive::Float(x) => write!(f, "{}", x),
            Primitive::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Package {
    pub name: String,
    /// Milliseconds.
    pub time_limit: u64,
    /// MiB.
    pub memory_limit: u64,
    #[serde(default)]
    pub checker: Option<CodeItem>,
    #[serde(default)]
    pub validator: Option<CodeItem>,
    #[serde(default)]
    pub generators: Vec<Generator>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
    #[serde(default)]
    pub testcases: Vec<TestcaseGroup>,
    #[serde(default)]
    pub vars: BTreeMap<String, Primitive>,
}

impl Package {
    pub const FILENAME: &str = "problem.toml";

    pub fn from_toml(s: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Parses and [checks](Self::check) the descriptor at `path`.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = fsutil::read_to_string(path).context("Cannot read package file")?;
        let pkg = Self::from_toml(&s)
            .with_context(|| format!("Invalid package TOML: {}", path.to_string_lossy()))?;
        pkg.check()
            .with_context(|| format!("Invalid package: {}", path.to_string_lossy()))?;
        Ok(pkg)
    }

    pub fn check(&self) -> Result<()> {
        if let Some(first) = self.solutions.first() {
            ensure!(
                first.outcome == Outcome::Accepted,
                "The first solution must be expected to be ACCEPTED, but {} expects {}",
                first.code.path.to_string_lossy(),
                first.outcome
            );
        }

        if let Some(i) = self.testcases.iter().position(|g| g.name == SAMPLES_GROUP) {
            ensure!(
                i == 0,
                "The \"{}\" group must be the first group, but it is group #{}",
                SAMPLES_GROUP,
                i
            );
        }

        let mut groups = HashSet::new();
        for g in &self.testcases {
            ensure!(groups.insert(&g.name), "Duplicate testcase group '{}'", g.name);
        }

        let mut gens = HashSet::new();
        for g in &self.generators {
            ensure!(gens.insert(&g.name), "Duplicate generator '{}'", g.name);
        }
        for group in &self.testcases {
            for call in &group.generators {
                ensure!(
                    gens.contains(&call.name),
                    "Group '{}' calls unknown generator '{}'",
                    group.name,
                    call.name
                );
            }
        }

        for name in self.vars.keys() {
            ensure!(
                IDENTIFIER.is_match(name),
                "Variable '{}' is not a valid identifier",
                name
            );
        }
        Ok(())
    }

    pub fn generator(&self, name: &str) -> Result<&Generator> {
        self.generators
            .iter()
            .find(|g| g.name == name)
            .with_context(|| format!("Generator '{}' not found", name))
    }

    pub fn group(&self, name: &str) -> Result<&TestcaseGroup> {
        self.testcases
            .iter()
            .find(|g| g.name == name)
            .with_context(|| format!("Testcase group '{}' not found", name))
    }

    /// The first solution expected to be accepted. Used to produce answers.
    pub fn main_solution(&self) -> Option<&Solution> {
        self.solutions.iter().find(|s| s.outcome == Outcome::Accepted)
    }

    /// The validator of `group`, falling back to the package one.
    pub fn validator_for<'a>(&'a self, group: &'a TestcaseGroup) -> Option<&'a CodeItem> {
        group.validator.as_ref().or(self.validator.as_ref())
    }

    /// `--name=value` arguments for validators.
    pub fn var_args(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(k, v)| format!("--{}={}", k, v))
            .collect()
    }
}
