//! Building testcase inputs and their answers.
//!
//! Each group directory is rebuilt from scratch: explicit testcases first, then glob
//! matches, then generator calls, then generator-script lines, numbered `000.in`,
//! `001.in`, ... in that order.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use crate::artifacts::InputSource;
use crate::checker;
use crate::code::{self, RunRequest, Sink};
use crate::context::BuildContext;
use crate::digest::Digest;
use crate::environment::{EnvironmentSandbox, ExecutionConfig};
use crate::error::*;
use crate::package::{GeneratorCall, TestcaseGroup};
use crate::testing::TestcaseEntry;

/// Compiles the package generators, or only those named in `only`.
pub fn compile_generators(
    ctx: &BuildContext,
    only: Option<&HashSet<String>>,
) -> Result<HashMap<String, Digest>> {
    let mut res = HashMap::new();
    for gen in &ctx.package.generators {
        if only.map_or(false, |names| !names.contains(&gen.name)) {
            continue;
        }
        let digest = code::compile_item(ctx, &gen.code)
            .with_context(|| format!("Failed compiling generator '{}'", gen.name))?;
        res.insert(gen.name.clone(), digest);
    }
    Ok(res)
}

/// Splits a generator script into calls: first word is the generator, the rest its args.
/// Blank lines are skipped.
pub fn parse_script(script: &str) -> Result<Vec<GeneratorCall>> {
    let mut res = Vec::new();
    for (lineno, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let words = shlex::split(line)
            .with_context(|| format!("Generator script line {}: bad quoting", lineno + 1))?;
        let Some((name, args)) = words.split_first() else {
            continue;
        };
        let args = shlex::try_join(args.iter().map(String::as_str))
            .map_err(|e| anyhow!("Generator script line {}: {}", lineno + 1, e))?;
        res.push(GeneratorCall {
            name: name.clone(),
            args: (!args.is_empty()).then_some(args),
        });
    }
    Ok(res)
}

/// Text of the group's generator script. `.txt` scripts are read as is; anything else
/// is compiled and run, and its standard output is the script.
pub fn run_generator_script(ctx: &BuildContext, group: &TestcaseGroup) -> Result<String> {
    let Some(script) = &group.generator_script else {
        return Ok(String::new());
    };
    if script.path.extension().map_or(false, |e| e == "txt") {
        let path = ctx.layout.package_dir.join(&script.path);
        return Ok(fsutil::read_to_string(path)?);
    }

    let digest = code::compile_item(ctx, script)
        .with_context(|| format!("Failed compiling generator script of group '{}'", group.name))?;
    let run = code::run_item(
        ctx,
        script,
        &digest,
        RunRequest::default().stdout(Sink::Digest).stderr(Sink::Digest),
    )?;
    if !run.exited_ok() {
        bail!(
            "Generator script of group '{}' failed ({}):\n{}",
            group.name,
            run.log.as_ref().map_or("no output".to_owned(), |l| l.exit_status.to_string()),
            ctx.blob_to_string_lossy(run.produced(code::STDERR))
        );
    }
    Ok(ctx.blob_to_string_lossy(run.produced(code::STDOUT)))
}

/// Generators a set of groups needs, including those named by generator scripts.
pub fn necessary_generators(ctx: &BuildContext, groups: &HashSet<String>) -> Result<HashSet<String>> {
    let mut res = HashSet::new();
    for group in ctx.package.testcases.iter().filter(|g| groups.contains(&g.name)) {
        res.extend(group.generators.iter().map(|c| c.name.clone()));
        if group.generator_script.is_some() {
            let script = run_generator_script(ctx, group)?;
            res.extend(parse_script(&script)?.into_iter().map(|c| c.name));
        }
    }
    Ok(res)
}

/// Builds the inputs of every group, or of `groups` only. A failing group is reported
/// and skipped; the others are still built.
pub fn generate_testcases(ctx: &BuildContext, groups: Option<&HashSet<String>>) -> Result<()> {
    let needed = groups.map(|g| necessary_generators(ctx, g)).transpose()?;
    let compiled = compile_generators(ctx, needed.as_ref())?;

    let mut failed = Vec::new();
    for group in &ctx.package.testcases {
        if groups.map_or(false, |g| !g.contains(&group.name)) {
            continue;
        }
        match build_group(ctx, group, &compiled) {
            Ok(n) => log::info!("Group '{}': {} testcases", group.name, n),
            Err(e) => {
                log::error!("Group '{}': {:#}", group.name, e);
                failed.push(group.name.clone());
            }
        }
    }
    ensure!(failed.is_empty(), "Failed building groups: {}", failed.join(", "));
    Ok(())
}

fn build_group(
    ctx: &BuildContext,
    group: &TestcaseGroup,
    compiled: &HashMap<String, Digest>,
) -> Result<usize> {
    let dir = ctx.layout.group_dir(&group.name);
    if dir.exists() {
        fsutil::remove_dir_all(&dir)?;
    }
    fsutil::mkdir_all(&dir)?;

    let mut next = 0;
    let root = &ctx.layout.package_dir;

    for tc in &group.testcases {
        let output = tc.output_path.as_ref().map(|p| root.join(p));
        copy_testcase(&root.join(&tc.input_path), output.as_deref(), &dir, next)?;
        next += 1;
    }

    if let Some(glob) = &group.testcase_glob {
        let matched = glob
            .expand(root)
            .with_context(|| format!("Bad testcase glob '{}'", glob.as_str()))?;
        for input in matched.iter().filter(|p| p.extension().map_or(false, |e| e == "in")) {
            copy_testcase(input, Some(&input.with_extension("out")), &dir, next)?;
            next += 1;
        }
    }

    let mut calls = group.generators.clone();
    if group.generator_script.is_some() {
        calls.extend(parse_script(&run_generator_script(ctx, group)?)?);
    }
    for call in &calls {
        run_generator(ctx, call, compiled, &dir, next)?;
        next += 1;
    }
    Ok(next)
}

fn copy_testcase(input: &Path, output: Option<&Path>, dir: &Path, index: usize) -> Result<()> {
    let entry = TestcaseEntry::new(dir, index);
    fsutil::copy_file(input, &entry.input)?;
    if let Some(output) = output.filter(|p| p.is_file()) {
        fsutil::copy_file(output, &entry.output)?;
    }
    Ok(())
}

fn run_generator(
    ctx: &BuildContext,
    call: &GeneratorCall,
    compiled: &HashMap<String, Digest>,
    dir: &Path,
    index: usize,
) -> Result<()> {
    let gen = ctx.package.generator(&call.name)?;
    let digest = compiled
        .get(&call.name)
        .with_context(|| format!("Generator '{}' is not compiled", call.name))?;
    let args = match &call.args {
        Some(a) => shlex::split(a)
            .with_context(|| format!("Bad quoting in arguments of '{}': {}", call.name, a))?,
        None => Vec::new(),
    };

    let entry = TestcaseEntry::new(dir, index);
    let req = RunRequest::default()
        .stdout(Sink::Path(entry.input.clone()))
        .stderr(Sink::Digest)
        .args(args);
    let run = code::run_item(ctx, &gen.code, digest, req)?;
    if !run.exited_ok() {
        bail!(
            "Failed generating {} with '{}' ({}):\n{}",
            entry.input.to_string_lossy(),
            call.name,
            run.log.as_ref().map_or("no output".to_owned(), |l| l.exit_status.to_string()),
            ctx.blob_to_string_lossy(run.produced(code::STDERR))
        );
    }
    Ok(())
}

/// Runs the main solution on every built input that has no answer yet, with time and
/// wall limits of `hard_tle_multiplier` time limits.
pub fn generate_outputs(ctx: &BuildContext, groups: Option<&HashSet<String>>) -> Result<()> {
    let main = ctx
        .package
        .main_solution()
        .context("No main solution to generate answers with")?;
    let digest = code::compile_item(ctx, &main.code).context("Failed compiling main solution")?;

    let timing = ctx.timing();
    let limit_ms = timing.hard_limit().as_millis() as u64;
    let limits = ExecutionConfig::with_sandbox(EnvironmentSandbox {
        time_limit: Some(limit_ms),
        wall_time_limit: Some(limit_ms),
        memory_limit: Some(ctx.package.memory_limit),
        ..Default::default()
    });
    let stderr_path = ctx.layout.gen_runs_dir().join("main.stderr");

    let mut failed = Vec::new();
    for group in &ctx.package.testcases {
        if groups.map_or(false, |g| !g.contains(&group.name)) {
            continue;
        }
        let res = (|| -> Result<()> {
            for tc in TestcaseEntry::enumerate(ctx.layout.group_dir(&group.name))? {
                if tc.has_output() {
                    continue;
                }
                let req = RunRequest {
                    stdin: Some(InputSource::Path(tc.input.clone())),
                    ..Default::default()
                }
                .stdout(Sink::Path(tc.output.clone()))
                .stderr(Sink::Path(stderr_path.clone()))
                .limits(limits.clone());
                let run = code::run_item(ctx, &main.code, &digest, req)?;
                if !run.exited_ok() {
                    let verdict = checker::check_with_no_output(run.log.as_ref(), &timing);
                    fsutil::remove_file_if_exists(&tc.output)?;
                    bail!(
                        "Main solution failed on {} with {}; stderr at {}",
                        tc.input.to_string_lossy(),
                        verdict.outcome,
                        stderr_path.to_string_lossy()
                    );
                }
            }
            Ok(())
        })();
        if let Err(e) = res {
            log::error!("Group '{}': {:#}", group.name, e);
            failed.push(group.name.clone());
        }
    }
    ensure!(
        failed.is_empty(),
        "Failed generating answers for groups: {}",
        failed.join(", ")
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn script_lines() {
        let script = "gen 1 2\n\n  gen --n=5 'a b'  \nother\n";
        let calls = parse_script(script).unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].name, "gen");
        assert_eq!(calls[0].args.as_deref(), Some("1 2"));
        assert_eq!(
            shlex::split(calls[1].args.as_deref().unwrap()).unwrap(),
            ["--n=5", "a b"]
        );
        assert_eq!(calls[2].name, "other");
        assert_eq!(calls[2].args, None);

        assert!(parse_script("gen 'unterminated").is_err());
    }

    #[test]
    fn copies_answers_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        fsutil::write(d.join("a.in"), "1").unwrap();
        fsutil::write(d.join("a.out"), "2").unwrap();
        fsutil::write(d.join("b.in"), "3").unwrap();
        let out = d.join("g");
        fsutil::mkdir_all(&out).unwrap();

        copy_testcase(&d.join("a.in"), Some(&d.join("a.out")), &out, 0).unwrap();
        copy_testcase(&d.join("b.in"), Some(&d.join("b.out")), &out, 1).unwrap();

        let got = TestcaseEntry::enumerate(&out).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].has_output());
        assert!(!got[1].has_output());
        assert_eq!(fsutil::read_to_string(&got[1].input).unwrap(), "3");
    }
}
