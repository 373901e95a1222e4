use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::sandbox::SandboxKind;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(skip)]
    pub source_config_file: Option<PathBuf>,
    /// Working state: blob store, cache records, solution runs. Relative to the package.
    pub box_dir: PathBuf,
    /// Built testcases. Relative to the package.
    pub build_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Overrides the backend named by the environment.
    pub backend: Option<SandboxKind>,
    pub wall_grace_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Runs slower than this many time limits are TLE without consulting the checker.
    pub hard_tle_multiplier: f64,
    /// Accepted-but-slow runs below this many time limits are reported as barely passing.
    pub warning_multiplier: f64,
    /// Raise the CPU limit to `hard_tle_multiplier` time limits so soft TLEs are measured.
    /// Off caps CPU at the time limit, and slow runs then never reach the checker.
    pub double_tl_verification: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_config_file: None,
            box_dir: PathBuf::from(".box"),
            build_dir: PathBuf::from("build"),
            sandbox: SandboxConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: None,
            wall_grace_ms: 500,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            hard_tle_multiplier: 2.0,
            warning_multiplier: 2.0,
            double_tl_verification: true,
        }
    }
}

impl SandboxConfig {
    pub fn wall_grace(&self) -> Duration {
        Duration::from_millis(self.wall_grace_ms)
    }
}

impl Config {
    pub const FILENAME: &str = "kbox.toml";

    pub fn from_toml(s: &str) -> StdResult<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(filepath: PathBuf) -> anyhow::Result<Self> {
        let toml = fsutil::read_to_string(&filepath).context("Cannot read a file")?;
        let mut cfg = Self::from_toml(&toml)
            .with_context(|| format!("Invalid config TOML: {:?}", filepath))?;
        cfg.source_config_file = Some(filepath);
        Ok(cfg)
    }

    /// Loads `kbox.toml` from `dir` if present, otherwise the defaults.
    pub fn from_dir_or_default(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = dir.as_ref().join(Self::FILENAME);
        if path.is_file() {
            Self::from_toml_file(path)
        } else {
            log::debug!("No {} in {}, using defaults", Self::FILENAME, dir.as_ref().to_string_lossy());
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.timing.hard_tle_multiplier, 2.0);
        assert_eq!(cfg.timing.warning_multiplier, 2.0);
        assert!(cfg.timing.double_tl_verification);
        assert_eq!(cfg.sandbox.wall_grace(), Duration::from_millis(500));
        assert_eq!(cfg.sandbox.backend, None);
    }

    #[test]
    fn full_toml() {
        let cfg = Config::from_toml(
            r#"
box_dir = "state"
build_dir = "out"

[sandbox]
backend = "permissive"
wall_grace_ms = 100

[timing]
hard_tle_multiplier = 3.0
warning_multiplier = 1.5
double_tl_verification = false
"#,
        )
        .unwrap();
        assert_eq!(cfg.box_dir, Path::new("state"));
        assert_eq!(cfg.build_dir, Path::new("out"));
        assert_eq!(cfg.sandbox.backend, Some(SandboxKind::Permissive));
        assert_eq!(cfg.sandbox.wall_grace_ms, 100);
        assert_eq!(cfg.timing.hard_tle_multiplier, 3.0);
        assert_eq!(cfg.timing.warning_multiplier, 1.5);
        assert!(!cfg.timing.double_tl_verification);
    }

    #[test]
    fn rejects_typos() {
        assert!(Config::from_toml("[timing]\nhard_multiplier = 3.0").is_err());
        assert!(Config::from_toml("[sandbox]\nbackend = \"isolate\"").is_err());
    }

    #[test]
    fn from_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::from_dir_or_default(dir.path()).unwrap(), Config::default());

        fsutil::write(dir.path().join(Config::FILENAME), "box_dir = \"x\"").unwrap();
        let cfg = Config::from_dir_or_default(dir.path()).unwrap();
        assert_eq!(cfg.box_dir, Path::new("x"));
        assert_eq!(cfg.source_config_file, Some(dir.path().join(Config::FILENAME)));
    }
}
