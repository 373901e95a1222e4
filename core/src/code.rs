//! Compiling and running [`CodeItem`]s under their language profile.

use std::path::{Path, PathBuf};

use crate::artifacts::{DigestHolder, GradingArtifacts, GradingFileInput, GradingFileOutput, InputSource};
use crate::context::BuildContext;
use crate::digest::Digest;
use crate::environment::ExecutionConfig;
use crate::error::*;
use crate::package::CodeItem;
use crate::sandbox::RunLog;
use crate::steps;

/// Holder names used by [`compile_item`] and [`run_item`].
pub const EXECUTABLE: &str = "executable";
pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";

/// Where a captured stream goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// A file relative to the package directory. The content is also stored as a blob,
    /// so a cache hit can restore the file even after it was removed.
    Path(PathBuf),
    /// The blob store; read it back with [`ItemRun::produced`].
    Digest,
}

impl Sink {
    fn output(&self, src: &str, holder: &str) -> GradingFileOutput {
        match self {
            Sink::Path(p) => GradingFileOutput::to_digest(src, holder).also_to_path(p),
            Sink::Digest => GradingFileOutput::to_digest(src, holder),
        }
    }
}

/// Everything [`run_item`] binds around the executable.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub stdin: Option<InputSource>,
    pub stdout: Option<Sink>,
    pub stderr: Option<Sink>,
    pub inputs: Vec<GradingFileInput>,
    pub outputs: Vec<GradingFileOutput>,
    pub extra_args: Vec<String>,
    /// Merged over the language's execution profile.
    pub limits: Option<ExecutionConfig>,
}

impl RunRequest {
    pub fn stdin_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(InputSource::Path(path.into()));
        self
    }

    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = Some(sink);
        self
    }

    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = Some(sink);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn limits(mut self, limits: ExecutionConfig) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Result of [`run_item`]. `log` is `None` when a required output was not produced.
#[derive(Debug)]
pub struct ItemRun {
    pub log: Option<RunLog>,
    pub artifacts: GradingArtifacts,
}

impl ItemRun {
    pub fn produced(&self, holder: &str) -> Option<&Digest> {
        self.artifacts.produced(holder)
    }

    pub fn exited_ok(&self) -> bool {
        self.log.as_ref().map_or(false, RunLog::is_ok)
    }
}

/// Compiles `item` and returns the digest of its executable. Languages without
/// compile commands use the source itself as the executable.
pub fn compile_item(ctx: &BuildContext, item: &CodeItem) -> Result<Digest> {
    let env = &ctx.environment;
    let lang = env.find_language(item.language.as_deref(), &item.path)?;
    let source = ctx.layout.package_dir.join(&item.path);
    ensure!(
        source.is_file(),
        "Source file {} does not exist",
        source.to_string_lossy()
    );

    let compilation = env.compilation(lang);
    if compilation.commands.is_empty() {
        log::debug!("{} is not compiled", item.path.to_string_lossy());
        return ctx
            .store()
            .put_path(&source)
            .with_context(|| format!("Cannot store {}", item.path.to_string_lossy()));
    }

    let mapping = env.file_mapping(lang);
    let commands = compilation
        .commands
        .iter()
        .map(|c| mapping.render(c))
        .collect::<Result<Vec<_>>>()?;
    let params = compilation.sandbox.unwrap_or_default().to_params();

    let mut artifacts = GradingArtifacts::new(&ctx.layout.package_dir);
    for (src, dest) in compilation_files(&ctx.layout.package_dir, item)? {
        artifacts = artifacts.input(GradingFileInput::from_path(src, dest));
    }
    artifacts = artifacts
        .input(GradingFileInput::from_path(&item.path, mapping.compilable()))
        .output(GradingFileOutput::to_digest(mapping.executable(), EXECUTABLE).executable());

    log::info!("Compiling {}", item.path.to_string_lossy());
    let ok = steps::cached::compile(&commands, &params, ctx.sandbox(), &mut artifacts, ctx.cache())?;
    if !ok {
        let detail = artifacts
            .run_log
            .as_ref()
            .map(|l| format!("{}\n{}", l.exit_status, l.message.as_deref().unwrap_or("")))
            .unwrap_or_default();
        bail!("Failed compiling {}: {}", item.path.to_string_lossy(), detail.trim_end());
    }
    if artifacts.cached {
        log::info!("{} is up to date", item.path.to_string_lossy());
    }
    artifacts
        .produced(EXECUTABLE)
        .cloned()
        .with_context(|| format!("No executable for {}", item.path.to_string_lossy()))
}

/// Runs the compiled `executable` of `item` with the streams and files in `req`.
pub fn run_item(
    ctx: &BuildContext,
    item: &CodeItem,
    executable: &Digest,
    req: RunRequest,
) -> Result<ItemRun> {
    let env = &ctx.environment;
    let lang = env.find_language(item.language.as_deref(), &item.path)?;
    let mut execution = env.execution(lang);
    if let Some(over) = &req.limits {
        execution = ExecutionConfig::merge([Some(&execution), Some(over)]);
    }
    let mapping = env.file_mapping(lang);

    let template = execution
        .command
        .as_deref()
        .with_context(|| format!("Language '{}' has no run command", lang.name))?;
    let command = steps::append_args(&mapping.render(template)?, &req.extra_args)?;
    let mut params = execution.sandbox.unwrap_or_default().to_params();

    let mut artifacts = GradingArtifacts::new(&ctx.layout.package_dir).input(
        GradingFileInput::from_digest(
            DigestHolder::with_value(EXECUTABLE, executable.clone()),
            mapping.executable(),
        )
        .executable(),
    );
    if let Some(src) = req.stdin {
        params = params.stdin(mapping.input());
        artifacts.inputs.push(GradingFileInput {
            src,
            dest: mapping.input().into(),
            executable: false,
        });
    }
    if let Some(sink) = &req.stdout {
        params = params.stdout(mapping.output());
        artifacts.outputs.push(sink.output(mapping.output(), STDOUT));
    }
    if let Some(sink) = &req.stderr {
        params = params.stderr(mapping.error());
        artifacts.outputs.push(sink.output(mapping.error(), STDERR));
    }
    artifacts.inputs.extend(req.inputs);
    artifacts.outputs.extend(req.outputs);

    let log = steps::cached::run(&command, &params, ctx.sandbox(), &mut artifacts, ctx.cache())?;
    Ok(ItemRun { log, artifacts })
}

/// Extra compile files of `item`, paired with where they go in the sandbox:
/// their path relative to the source's directory.
fn compilation_files(package_dir: &Path, item: &CodeItem) -> Result<Vec<(PathBuf, PathBuf)>> {
    let code_dir = package_dir
        .join(&item.path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| package_dir.to_path_buf());
    let code_dir = code_dir
        .canonicalize()
        .with_context(|| format!("Cannot resolve {}", code_dir.to_string_lossy()))?;

    let mut res = Vec::with_capacity(item.compilation_files.len());
    for file in &item.compilation_files {
        let full = package_dir.join(file);
        ensure!(
            full.is_file(),
            "Compilation file {} for {} does not exist",
            file.to_string_lossy(),
            item.path.to_string_lossy()
        );
        let full = full
            .canonicalize()
            .with_context(|| format!("Cannot resolve {}", full.to_string_lossy()))?;
        let dest = full
            .strip_prefix(&code_dir)
            .with_context(|| {
                format!(
                    "Compilation file {} is not under the directory of {}",
                    file.to_string_lossy(),
                    item.path.to_string_lossy()
                )
            })?
            .to_path_buf();
        res.push((full, dest));
    }
    Ok(res)
}
