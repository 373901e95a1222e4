use std::{io, os::unix::process::CommandExt};

use nix::sys::resource::{setrlimit, Resource};

use super::{
    execution::{Launch, Reaper, Termination},
    Execution, ExitStatus, Sandbox, SandboxKind, SandboxParams, SandboxSettings, Workdir,
};

/// Strict backend: rlimits in the child, rusage from `wait4`.
#[derive(Debug, Clone)]
pub struct IsolatedSandbox {
    settings: SandboxSettings,
}

impl IsolatedSandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }
}

impl Sandbox for IsolatedSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Isolated
    }

    fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    fn spawn(&self, workdir: &Workdir, command: &str, params: &SandboxParams) -> Execution {
        let limits = Rlimits::from_params(params);
        Launch {
            workdir,
            command,
            params,
            settings: &self.settings,
            reaper: Reaper::Rusage,
            classify,
        }
        .spawn(move |cmd| limits.install(cmd))
    }
}

/// Address-space headroom above the memory limit. Allocations must succeed past the limit so
/// the peak RSS can show the overrun; the cap only stops runaway programs.
const ADDRESS_SPACE_HEADROOM_MB: u64 = 1024;

fn address_space_cap_mb(limit_mb: u64) -> u64 {
    limit_mb.saturating_add(limit_mb.max(ADDRESS_SPACE_HEADROOM_MB))
}

/// Resource limits applied between fork and exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct Rlimits {
    pub cpu_secs: Option<u64>,
    pub address_space_bytes: Option<u64>,
    pub stack_bytes: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub processes: Option<u64>,
}

impl Rlimits {
    pub fn from_params(params: &SandboxParams) -> Self {
        Self {
            cpu_secs: params.time_limit.map(|t| {
                let ms = t.as_millis() as u64;
                ((ms + 999) / 1000).max(1)
            }),
            address_space_bytes: params.memory_limit_mb.map(|mb| address_space_cap_mb(mb) << 20),
            stack_bytes: params.stack_limit_mb.map(|mb| mb << 20),
            file_size_bytes: params.file_size_limit_kb.map(|kb| kb << 10),
            processes: params.max_processes,
        }
    }

    pub fn install(self, cmd: &mut std::process::Command) {
        // SAFETY: the closure only issues setrlimit syscalls, which are async-signal-safe.
        unsafe {
            cmd.pre_exec(move || self.apply().map_err(io::Error::from));
        }
    }

    fn apply(&self) -> nix::Result<()> {
        if let Some(secs) = self.cpu_secs {
            // SIGXCPU at the soft limit, SIGKILL one second later.
            setrlimit(Resource::RLIMIT_CPU, secs, secs + 1)?;
        }
        if let Some(n) = self.address_space_bytes {
            setrlimit(Resource::RLIMIT_AS, n, n)?;
        }
        if let Some(n) = self.stack_bytes {
            setrlimit(Resource::RLIMIT_STACK, n, n)?;
        }
        if let Some(n) = self.file_size_bytes {
            setrlimit(Resource::RLIMIT_FSIZE, n, n)?;
        }
        if let Some(n) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, n, n)?;
        }
        Ok(())
    }
}

fn classify(t: &Termination, params: &SandboxParams) -> ExitStatus {
    let wall_exceeded = params.wall_time_limit.map_or(false, |l| t.wall_time > l);
    if wall_exceeded || (t.watchdog_fired && t.signal == Some(libc::SIGKILL)) {
        return ExitStatus::WallTimeout;
    }

    let cpu_exceeded = match (params.time_limit, t.cpu_time) {
        (Some(limit), Some(cpu)) => cpu > limit,
        _ => false,
    };
    if cpu_exceeded || t.signal == Some(libc::SIGXCPU) {
        return ExitStatus::CpuTimeout;
    }

    let mem_exceeded = match (params.memory_limit_mb, t.memory_kb) {
        (Some(mb), Some(kb)) => kb > mb * 1024,
        _ => false,
    };
    if mem_exceeded {
        return ExitStatus::MemoryLimitExceeded;
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
