use std::slice;

use crate::artifacts::GradingArtifacts;
use crate::cache::DependencyCache;
use crate::error::Result;
use crate::sandbox::{ExitStatus, RunLog, Sandbox, SandboxParams};

/// [`super::compile`], skipped when the cache holds an up-to-date result.
pub fn compile(
    commands: &[String],
    params: &SandboxParams,
    sandbox: &dyn Sandbox,
    artifacts: &mut GradingArtifacts,
    cache: &DependencyCache,
) -> Result<bool> {
    let extra = params.cacheable();
    cache.memoize(commands, &extra, slice::from_mut(artifacts), |batch| {
        super::compile(commands, params, sandbox, cache.store(), &mut batch[0])
    })
}

/// [`super::run`], skipped when the cache holds an up-to-date result.
/// A run is recorded whatever the program's verdict, as long as its outputs were harvested.
/// Sandbox failures are not recorded, so they are retried on the next build.
pub fn run(
    command: &str,
    params: &SandboxParams,
    sandbox: &dyn Sandbox,
    artifacts: &mut GradingArtifacts,
    cache: &DependencyCache,
) -> Result<Option<RunLog>> {
    artifacts.run_log = None;
    let commands = [command.to_owned()];
    let extra = params.cacheable();
    cache.memoize(&commands, &extra, slice::from_mut(artifacts), |batch| {
        let log = super::run(command, params, sandbox, cache.store(), &mut batch[0])?;
        Ok(log.map_or(true, |l| l.exit_status != ExitStatus::SandboxError))
    })?;
    Ok(artifacts.run_log.clone())
}
