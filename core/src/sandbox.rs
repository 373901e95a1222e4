//! Single-process execution under resource limits.
//!
//! Two backends implement [`Sandbox`]: [`IsolatedSandbox`] applies rlimits and reads the
//! child's rusage so it can tell CPU timeouts, wall timeouts and memory overruns apart;
//! [`PermissiveSandbox`] only knows whether the child exited or died by a signal.
//! Both arm a wall-clock [watchdog](watchdog) for every execution.

mod execution;
mod isolated;
mod params;
mod permissive;
mod watchdog;
mod workdir;

use std::{io, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

pub use execution::Execution;
pub use isolated::IsolatedSandbox;
pub use params::SandboxParams;
pub use permissive::PermissiveSandbox;
pub use workdir::Workdir;

/// File every execution appends its command line to, inside the working directory.
pub const COMMANDS_LOG: &str = "commands.log";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SandboxKind {
    #[default]
    Isolated,
    Permissive,
}

/// How a sandboxed process ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStatus {
    Ok,
    Signaled,
    CpuTimeout,
    WallTimeout,
    MemoryLimitExceeded,
    NonzeroExit,
    SandboxError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLog {
    pub exit_status: ExitStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// `None` when the backend cannot measure it.
    pub cpu_time: Option<Duration>,
    pub wall_time: Duration,
    /// Peak resident set size in KiB, `None` when unavailable.
    pub memory_kb: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RunLog {
    pub fn sandbox_error(message: impl Into<String>) -> Self {
        Self {
            exit_status: ExitStatus::SandboxError,
            exit_code: None,
            signal: None,
            cpu_time: None,
            wall_time: Duration::ZERO,
            memory_kb: None,
            message: Some(message.into()),
        }
    }

    /// Time used for judging: CPU time if measured, wall time otherwise.
    pub fn time(&self) -> Duration {
        self.cpu_time.unwrap_or(self.wall_time)
    }

    pub fn is_ok(&self) -> bool {
        self.exit_status == ExitStatus::Ok
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Cannot split command line '{0}'")]
    BadCommand(String),

    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to spawn '{0}': {1}")]
    Spawn(String, #[source] io::Error),

    #[error("Failed to start watchdog: {0}")]
    Watchdog(#[source] io::Error),

    #[error("Failed to wait for pid {0}: {1}")]
    Wait(i32, #[source] io::Error),

    #[error(transparent)]
    Fs(#[from] fsutil::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSettings {
    /// Directory under which working directories are created.
    pub workdir_root: PathBuf,
    /// Added to the wall limit before the watchdog kills the child.
    pub wall_grace: Duration,
    /// Wall budget used when the params carry neither a wall nor a CPU limit.
    pub default_wall_limit: Duration,
}

impl SandboxSettings {
    pub const DEFAULT_WALL_GRACE: Duration = Duration::from_millis(500);
    pub const DEFAULT_WALL_LIMIT: Duration = Duration::from_secs(60);

    pub fn new(workdir_root: impl Into<PathBuf>) -> Self {
        Self {
            workdir_root: workdir_root.into(),
            wall_grace: Self::DEFAULT_WALL_GRACE,
            default_wall_limit: Self::DEFAULT_WALL_LIMIT,
        }
    }

    pub fn wall_grace(mut self, grace: Duration) -> Self {
        self.wall_grace = grace;
        self
    }

    /// The budget the watchdog waits before killing.
    pub fn watchdog_budget(&self, params: &SandboxParams) -> Duration {
        let wall = params
            .wall_time_limit
            .or(params.time_limit.map(|t| t * 2))
            .unwrap_or(self.default_wall_limit);
        wall + self.wall_grace
    }
}

pub trait Sandbox {
    fn kind(&self) -> SandboxKind;

    fn settings(&self) -> &SandboxSettings;

    fn create_workdir(&self) -> fsutil::Result<Workdir> {
        Workdir::create_in(&self.settings().workdir_root)
    }

    /// Starts `command` inside `workdir` and returns without waiting.
    /// A failure to start is carried by the handle and reported as
    /// [`ExitStatus::SandboxError`] on [`Execution::wait`].
    fn spawn(&self, workdir: &Workdir, command: &str, params: &SandboxParams) -> Execution;

    fn execute(&self, workdir: &Workdir, command: &str, params: &SandboxParams) -> RunLog {
        self.spawn(workdir, command, params).wait()
    }
}

pub fn new_sandbox(kind: SandboxKind, settings: SandboxSettings) -> Box<dyn Sandbox> {
    match kind {
        SandboxKind::Isolated => Box::new(IsolatedSandbox::new(settings)),
        SandboxKind::Permissive => Box::new(PermissiveSandbox::new(settings)),
    }
}
