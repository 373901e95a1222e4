use std::{
    fs::File,
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

use super::{
    watchdog::Watchdog, ExitStatus, RunLog, SandboxError, SandboxParams, SandboxSettings, Workdir,
};

/// What the backend learned about a finished child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct Termination {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_time: Option<Duration>,
    pub wall_time: Duration,
    pub memory_kb: Option<u64>,
    pub watchdog_fired: bool,
}

pub(super) type Classifier = fn(&Termination, &SandboxParams) -> ExitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Reaper {
    /// `wait4`, collecting CPU time and peak RSS.
    Rusage,
    /// Plain wait; only the exit code or signal is known.
    Plain,
}

/// Handle to a sandboxed process started by [`super::Sandbox::spawn`].
pub struct Execution {
    state: State,
}

enum State {
    Failed(RunLog),
    Running(Box<Running>),
}

struct Running {
    child: Child,
    pid: Pid,
    started: Instant,
    watchdog: Watchdog,
    reaper: Reaper,
    classify: Classifier,
    params: SandboxParams,
}

impl Execution {
    fn failed(e: SandboxError) -> Self {
        log::error!("Sandbox error: {:#}", e);
        Self {
            state: State::Failed(RunLog::sandbox_error(e.to_string())),
        }
    }

    pub fn pid(&self) -> Option<i32> {
        match &self.state {
            State::Running(r) => Some(r.pid.as_raw()),
            State::Failed(_) => None,
        }
    }

    /// Blocks until the process has ended and the watchdog is disarmed.
    pub fn wait(self) -> RunLog {
        match self.state {
            State::Failed(log) => log,
            State::Running(r) => r.wait(),
        }
    }
}

pub(super) struct Launch<'a> {
    pub workdir: &'a Workdir,
    pub command: &'a str,
    pub params: &'a SandboxParams,
    pub settings: &'a SandboxSettings,
    pub reaper: Reaper,
    pub classify: Classifier,
}

impl<'a> Launch<'a> {
    /// Spawns the child. `configure` runs on the prepared [`Command`] right before spawning.
    pub fn spawn(self, configure: impl FnOnce(&mut Command)) -> Execution {
        match self.try_spawn(configure) {
            Ok(r) => Execution {
                state: State::Running(Box::new(r)),
            },
            Err(e) => Execution::failed(e),
        }
    }

    fn try_spawn(self, configure: impl FnOnce(&mut Command)) -> Result<Running, SandboxError> {
        self.workdir.append_command_log(self.command);

        let mut cmd = build_command(self.workdir, self.command, self.params)?;
        configure(&mut cmd);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(self.command.to_owned(), e))?;
        let pid = Pid::from_raw(child.id() as i32);
        log::debug!("Spawned pid {}: {}", pid, self.command);

        let budget = self.settings.watchdog_budget(self.params);
        let watchdog = match Watchdog::arm(pid, budget) {
            Ok(w) => w,
            Err(e) => {
                let _ = killpg(pid, Signal::SIGKILL);
                let _ = child.wait();
                return Err(SandboxError::Watchdog(e));
            }
        };

        Ok(Running {
            child,
            pid,
            started,
            watchdog,
            reaper: self.reaper,
            classify: self.classify,
            params: self.params.clone(),
        })
    }
}

impl Running {
    fn wait(self: Box<Self>) -> RunLog {
        let Running {
            mut child,
            pid,
            started,
            watchdog,
            reaper,
            classify,
            params,
        } = *self;

        if let Err(e) = wait_exited(pid) {
            watchdog.disarm();
            let _ = killpg(pid, Signal::SIGKILL);
            let _ = child.wait();
            return RunLog::sandbox_error(SandboxError::Wait(pid.as_raw(), e).to_string());
        }
        let wall_time = started.elapsed();
        let watchdog_fired = watchdog.disarm();

        let reaped = match reaper {
            Reaper::Rusage => reap_with_rusage(pid),
            Reaper::Plain => child.wait().map(|st| Termination {
                exit_code: st.code(),
                signal: st.signal(),
                ..Default::default()
            }),
        };
        let t = match reaped {
            Ok(t) => Termination {
                wall_time,
                watchdog_fired,
                ..t
            },
            Err(e) => {
                return RunLog::sandbox_error(SandboxError::Wait(pid.as_raw(), e).to_string())
            }
        };

        let exit_status = classify(&t, &params);
        log::debug!(
            "pid {} finished: {} (code={:?}, signal={:?}, wall={:?})",
            pid,
            exit_status,
            t.exit_code,
            t.signal,
            t.wall_time
        );
        RunLog {
            exit_status,
            exit_code: t.exit_code,
            signal: t.signal,
            cpu_time: t.cpu_time,
            wall_time: t.wall_time,
            memory_kb: t.memory_kb,
            message: None,
        }
    }
}

fn build_command(
    workdir: &Workdir,
    command: &str,
    params: &SandboxParams,
) -> Result<Command, SandboxError> {
    let argv = shlex::split(command).ok_or_else(|| SandboxError::BadCommand(command.to_owned()))?;
    let (program, args) = argv.split_first().ok_or(SandboxError::EmptyCommand)?;
    let program = if program.contains('/') {
        workdir.relative_path(program)
    } else {
        PathBuf::from(program)
    };

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir.path()).process_group(0);

    if !params.preserve_env {
        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", workdir.path());
    }
    cmd.envs(&params.set_env);

    cmd.stdin(match &params.stdin_file {
        Some(p) => Stdio::from(fsutil::open(workdir.relative_path(p))?),
        None => Stdio::null(),
    });
    cmd.stdout(open_output(workdir, params.stdout_file.as_deref())?);
    cmd.stderr(open_output(workdir, params.stderr_file.as_deref())?);
    Ok(cmd)
}

fn open_output(workdir: &Workdir, path: Option<&Path>) -> Result<Stdio, SandboxError> {
    let Some(p) = path else {
        return Ok(Stdio::null());
    };
    let f: File = fsutil::create_with_mkdir(workdir.relative_path(p))?;
    Ok(Stdio::from(f))
}

/// Waits until `pid` has exited without reaping it.
fn wait_exited(pid: Pid) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data and fully written by waitid on success.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn reap_with_rusage(pid: Pid) -> io::Result<Termination> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data and fully written by wait4 on success.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if rc == pid.as_raw() {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let (exit_code, signal) = if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    };
    Ok(Termination {
        exit_code,
        signal,
        cpu_time: Some(timeval(usage.ru_utime) + timeval(usage.ru_stime)),
        memory_kb: Some(usage.ru_maxrss.max(0) as u64),
        ..Default::default()
    })
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}
