use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::cache::DependencyCache;
use crate::checker::TimingPolicy;
use crate::config::Config;
use crate::digest::Digest;
use crate::environment::Environment;
use crate::error::*;
use crate::package::Package;
use crate::sandbox::{self, Sandbox, SandboxSettings};
use crate::storage::ContentStore;

/// Where a build reads and writes, all resolved against the package directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    pub package_dir: PathBuf,
    pub box_dir: PathBuf,
    pub build_dir: PathBuf,
}

impl BuildLayout {
    pub fn new(package_dir: impl Into<PathBuf>, config: &Config) -> Self {
        let package_dir = package_dir.into();
        Self {
            box_dir: package_dir.join(&config.box_dir),
            build_dir: package_dir.join(&config.build_dir),
            package_dir,
        }
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.build_dir.join("tests")
    }

    /// `<build>/tests/<group>`
    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.tests_dir().join(group)
    }

    pub fn validator_log(&self, group: &str) -> PathBuf {
        self.group_dir(group).join("validator.log")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.box_dir.join("runs")
    }

    /// `<box>/runs/<solution index>/<group>`
    pub fn solution_runs_dir(&self, index: usize, group: &str) -> PathBuf {
        self.runs_dir().join(index.to_string()).join(group)
    }

    /// Scratch files of answer generation.
    pub fn gen_runs_dir(&self) -> PathBuf {
        self.runs_dir().join(".gen")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.box_dir.join(".storage")
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.box_dir.join(".sandbox")
    }
}

/// Everything one build needs, created once and passed by reference.
pub struct BuildContext {
    pub config: Config,
    pub environment: Environment,
    pub package: Package,
    pub layout: BuildLayout,
    sandbox: Box<dyn Sandbox>,
    cache: DependencyCache,
}

impl BuildContext {
    /// Opens the blob store and the cache under the box directory and creates the sandbox
    /// backend. `[sandbox] backend` in the config overrides the environment's choice.
    pub fn new(
        package_dir: impl Into<PathBuf>,
        config: Config,
        environment: Environment,
        package: Package,
    ) -> Result<Self> {
        let layout = BuildLayout::new(package_dir, &config);
        let kind = config.sandbox.backend.unwrap_or(environment.sandbox);
        let settings =
            SandboxSettings::new(layout.sandbox_root()).wall_grace(config.sandbox.wall_grace());
        log::info!("Using {} sandbox", kind);
        let sandbox = sandbox::new_sandbox(kind, settings);
        Self::with_sandbox(layout, config, environment, package, sandbox)
    }

    /// Like [`Self::new`] with a caller-provided sandbox.
    pub fn with_sandbox(
        layout: BuildLayout,
        config: Config,
        environment: Environment,
        package: Package,
        sandbox: Box<dyn Sandbox>,
    ) -> Result<Self> {
        let store = ContentStore::open(layout.storage_dir()).context("Cannot open blob store")?;
        let cache = DependencyCache::open(&layout.box_dir, store).context("Cannot open cache")?;
        Ok(Self {
            config,
            environment,
            package,
            layout,
            sandbox,
            cache,
        })
    }

    /// Reads `kbox.toml` (optional) and `problem.toml` from `package_dir`.
    pub fn load(package_dir: impl AsRef<Path>, environment: Environment) -> Result<Self> {
        let dir = package_dir.as_ref();
        let config = Config::from_dir_or_default(dir)?;
        let package = Package::from_toml_file(dir.join(Package::FILENAME))?;
        Self::new(dir, config, environment, package)
    }

    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    pub fn cache(&self) -> &DependencyCache {
        &self.cache
    }

    pub fn store(&self) -> &ContentStore {
        self.cache.store()
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.package.time_limit)
    }

    pub fn timing(&self) -> TimingPolicy {
        TimingPolicy::new(self.time_limit(), &self.config.timing)
    }

    /// Blob contents as text, for diagnostics. Empty when absent.
    pub fn blob_to_string_lossy(&self, digest: Option<&Digest>) -> String {
        let Some(d) = digest else {
            return String::new();
        };
        match self.store().read(d) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                log::warn!("Cannot read blob {}: {}", d, e);
                String::new()
            }
        }
    }
}
