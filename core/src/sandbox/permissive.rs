use super::{
    execution::{Launch, Reaper, Termination},
    isolated::Rlimits,
    Execution, ExitStatus, Sandbox, SandboxKind, SandboxParams, SandboxSettings, Workdir,
};

/// Fallback backend for hosts where address-space limits or rusage are not usable.
///
/// It only caps CPU seconds and stack, and only reports whether the child exited
/// (`OK` / `NONZERO_EXIT`) or died by a signal (`SIGNALED`). A signal death may be a CPU
/// rlimit, an allocation failure or a plain crash; callers must not guess which. The one
/// cause it does know is its own watchdog kill, reported as `WALL_TIMEOUT`.
/// CPU time and memory are never measured.
#[derive(Debug, Clone)]
pub struct PermissiveSandbox {
    settings: SandboxSettings,
}

impl PermissiveSandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }
}

impl Sandbox for PermissiveSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Permissive
    }

    fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    fn spawn(&self, workdir: &Workdir, command: &str, params: &SandboxParams) -> Execution {
        let full = Rlimits::from_params(params);
        let limits = Rlimits {
            cpu_secs: full.cpu_secs,
            stack_bytes: full.stack_bytes,
            ..Default::default()
        };
        Launch {
            workdir,
            command,
            params,
            settings: &self.settings,
            reaper: Reaper::Plain,
            classify,
        }
        .spawn(move |cmd| limits.install(cmd))
    }
}

fn classify(t: &Termination, _params: &SandboxParams) -> ExitStatus {
    if t.watchdog_fired && t.signal == Some(libc::SIGKILL) {
        return ExitStatus::WallTimeout;
    }
    if t.signal.is_some() {
        return ExitStatus::Signaled;
    }
    match t.exit_code {
        Some(0) => ExitStatus::Ok,
        Some(_) => ExitStatus::NonzeroExit,
        None => ExitStatus::SandboxError,
    }
}
