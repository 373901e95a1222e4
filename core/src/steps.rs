//! Compile and run steps: stage declared inputs into a fresh working directory, execute,
//! harvest declared outputs. [`cached`] wraps both with the dependency cache.

pub mod cached;

use std::borrow::Cow;

use crate::artifacts::{GradingArtifacts, InputSource};
use crate::cache::CacheError;
use crate::error::*;
use crate::sandbox::{RunLog, Sandbox, SandboxParams, Workdir};
use crate::storage::ContentStore;

/// Runs `commands` in order, stopping at the first one that does not end with
/// `ExitStatus::Ok`. Outputs are harvested only when every command succeeded.
///
/// On failure the failing command's [`RunLog`] is left in `artifacts.run_log`, with its
/// standard error as the message.
pub fn compile(
    commands: &[String],
    params: &SandboxParams,
    sandbox: &dyn Sandbox,
    store: &ContentStore,
    artifacts: &mut GradingArtifacts,
) -> Result<bool> {
    let workdir = sandbox.create_workdir()?;
    stage_inputs(&workdir, store, artifacts)?;
    artifacts.run_log = None;

    for (i, command) in commands.iter().enumerate() {
        let stdout = format!("compile-{}.stdout", i);
        let stderr = format!("compile-{}.stderr", i);
        let p = params.clone().stdout(&stdout).stderr(&stderr);

        let mut log = sandbox.execute(&workdir, command, &p);
        if !log.is_ok() {
            log::error!("`{}` failed: {}", command, log.exit_status);
            if log.message.is_none() {
                log.message = workdir.read_to_string_lossy(&stderr).ok();
            }
            artifacts.run_log = Some(log);
            return Ok(false);
        }
        artifacts.run_log = Some(log);
    }

    harvest_outputs(&workdir, store, artifacts)
}

/// Runs a single command. Returns `None` when a required output is missing.
pub fn run(
    command: &str,
    params: &SandboxParams,
    sandbox: &dyn Sandbox,
    store: &ContentStore,
    artifacts: &mut GradingArtifacts,
) -> Result<Option<RunLog>> {
    let workdir = sandbox.create_workdir()?;
    stage_inputs(&workdir, store, artifacts)?;

    let log = sandbox.execute(&workdir, command, params);
    if !harvest_outputs(&workdir, store, artifacts)? {
        artifacts.run_log = None;
        return Ok(None);
    }
    artifacts.run_log = Some(log.clone());
    Ok(Some(log))
}

/// Appends shell-quoted `args` to `command`.
pub fn append_args(command: &str, args: &[String]) -> Result<String> {
    let mut res = command.to_owned();
    for arg in args {
        let quoted: Cow<str> = shlex::try_quote(arg)
            .map_err(|e| anyhow!("Cannot quote argument {:?}: {}", arg, e))?;
        res.push(' ');
        res.push_str(&quoted);
    }
    Ok(res)
}

fn stage_inputs(
    workdir: &Workdir,
    store: &ContentStore,
    artifacts: &GradingArtifacts,
) -> Result<()> {
    for input in &artifacts.inputs {
        match &input.src {
            InputSource::Path(p) => {
                let src = artifacts.resolve(p);
                workdir
                    .stage_path(&input.dest, &src, input.executable)
                    .with_context(|| format!("Cannot stage input {}", src.to_string_lossy()))?;
            }
            InputSource::Digest(h) => {
                let d = h
                    .value
                    .as_ref()
                    .ok_or_else(|| CacheError::ConsumedBeforeProduced(h.name.clone()))?;
                workdir.stage_digest(&input.dest, store, d, input.executable)?;
            }
        }
        log::debug!("Staged {}", input.dest.to_string_lossy());
    }
    Ok(())
}

fn harvest_outputs(
    workdir: &Workdir,
    store: &ContentStore,
    artifacts: &mut GradingArtifacts,
) -> Result<bool> {
    let root = artifacts.root.clone();
    for output in &mut artifacts.outputs {
        if !workdir.exists(&output.src) {
            if output.optional {
                continue;
            }
            log::error!(
                "Output artifact {} does not exist",
                output.src.to_string_lossy()
            );
            return Ok(false);
        }

        if let Some(holder) = &mut output.digest {
            let d = workdir.read_to_store(&output.src, store, output.maxlen)?;
            if let Some(dest) = &output.dest {
                let dest = root.join(dest);
                store.copy_to(&d, &dest, None)?;
                fsutil::set_executable(&dest, output.executable)?;
            }
            holder.value = Some(d);
            continue;
        }

        let Some(dest) = &output.dest else {
            continue;
        };
        let dest = root.join(dest);
        workdir.copy_out(&output.src, &dest, output.maxlen)?;
        fsutil::set_executable(&dest, output.executable)?;
    }
    Ok(true)
}
