use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Limits and redirections for one sandboxed execution.
/// Stream paths are relative to the working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxParams {
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,

    /// CPU time limit.
    pub time_limit: Option<Duration>,
    pub wall_time_limit: Option<Duration>,
    /// Address space limit in MiB.
    pub memory_limit_mb: Option<u64>,
    pub stack_limit_mb: Option<u64>,
    /// Largest file the process may write, in KiB.
    pub file_size_limit_kb: Option<u64>,
    pub max_processes: Option<u64>,

    pub preserve_env: bool,
    pub set_env: BTreeMap<String, String>,
    /// Host directories the program expects to see read-only.
    pub mirror_dirs: Vec<PathBuf>,
}

impl SandboxParams {
    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_file = Some(path.into());
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn wall_time_limit(mut self, limit: Duration) -> Self {
        self.wall_time_limit = Some(limit);
        self
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    /// Params that change what a step produces. Used as part of the cache key.
    ///
    /// Stream redirections are left out: the artifact declarations already say
    /// which files get captured.
    pub fn cacheable(&self) -> serde_json::Value {
        serde_json::json!({
            "time_limit_ms": self.time_limit.map(|d| d.as_millis() as u64),
            "wall_time_limit_ms": self.wall_time_limit.map(|d| d.as_millis() as u64),
            "memory_limit_mb": self.memory_limit_mb,
            "stack_limit_mb": self.stack_limit_mb,
            "file_size_limit_kb": self.file_size_limit_kb,
            "max_processes": self.max_processes,
            "preserve_env": self.preserve_env,
            "set_env": self.set_env,
            "mirror_dirs": self.mirror_dirs,
        })
    }
}
