//! Running candidate solutions over the built testcases and judging them against
//! their declared outcome.

use std::{
    collections::{BTreeSet, HashSet},
    path::PathBuf,
    time::Duration,
};

use serde::Serialize;

use crate::checker::{self, Evaluation, TestcaseIo, TestcaseLog, TimingPolicy};
use crate::code::{self, RunRequest, Sink};
use crate::context::BuildContext;
use crate::digest::Digest;
use crate::environment::{EnvironmentSandbox, ExecutionConfig};
use crate::error::*;
use crate::outcome::Outcome;
use crate::package::{CodeItem, Solution};
use crate::testing::TestcaseEntry;

pub fn compile_solutions(ctx: &BuildContext) -> Result<Vec<Digest>> {
    ctx.package
        .solutions
        .iter()
        .map(|s| {
            code::compile_item(ctx, &s.code)
                .with_context(|| format!("Failed compiling solution {}", s.code.path.to_string_lossy()))
        })
        .collect()
}

/// Sandbox limits of a solution run: CPU is the hard cutoff, or TL when double-TL
/// verification is turned off. Wall is always the hard cutoff.
pub fn solution_limits(ctx: &BuildContext) -> ExecutionConfig {
    let timing = ctx.timing();
    let hard_ms = timing.hard_limit().as_millis() as u64;
    let cpu_ms = if ctx.config.timing.double_tl_verification {
        hard_ms
    } else {
        timing.time_limit.as_millis() as u64
    };
    ExecutionConfig::with_sandbox(EnvironmentSandbox {
        time_limit: Some(cpu_ms),
        wall_time_limit: Some(hard_ms),
        memory_limit: Some(ctx.package.memory_limit),
        ..Default::default()
    })
}

/// Evaluations of one solution, group by group in package order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SolutionRun {
    pub index: usize,
    pub path: PathBuf,
    pub expected: Outcome,
    pub groups: Vec<(String, Vec<Evaluation>)>,
}

impl SolutionRun {
    pub fn evaluations(&self) -> impl Iterator<Item = &Evaluation> {
        self.groups.iter().flat_map(|(_, evs)| evs.iter())
    }

    pub fn report(&self, timing: &TimingPolicy) -> SolutionReport {
        judge(self.expected, self.evaluations(), timing)
    }
}

/// Aggregated judgement of a solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SolutionReport {
    pub expected: Outcome,
    /// Distinct non-`Accepted` verdicts the expectation allows.
    pub matched: BTreeSet<Outcome>,
    /// Distinct non-`Accepted` verdicts the expectation does not allow.
    pub unmatched: BTreeSet<Outcome>,
    pub max_time: Duration,
    pub ok: bool,
    /// Passed, but the slowest run was within the warning margin above the time limit.
    pub barely_passed: bool,
}

pub fn judge<'a, I>(expected: Outcome, evaluations: I, timing: &TimingPolicy) -> SolutionReport
where
    I: IntoIterator<Item = &'a Evaluation>,
{
    let mut matched = BTreeSet::new();
    let mut unmatched = BTreeSet::new();
    let mut max_time = Duration::ZERO;
    for ev in evaluations {
        max_time = max_time.max(ev.time());
        let o = ev.result.outcome;
        if o.is_accepted() {
            continue;
        }
        if expected.matches(o) {
            matched.insert(o);
        } else {
            unmatched.insert(o);
        }
    }

    let ok = if expected.is_accepted() {
        matched.is_empty() && unmatched.is_empty()
    } else {
        unmatched.is_empty() && !matched.is_empty()
    };

    let within_margin = max_time > timing.time_limit && max_time < timing.warning_limit();
    let only_tle = matched
        .iter()
        .all(|o| *o == Outcome::TimeLimitExceeded);
    SolutionReport {
        expected,
        matched,
        unmatched,
        max_time,
        ok,
        barely_passed: ok && within_margin && only_tle,
    }
}

/// Runs solution `index` on every testcase of every group, writing
/// `<NNN>.out`, `<NNN>.err` and `<NNN>.log` under its runs directory.
pub fn run_solution(
    ctx: &BuildContext,
    index: usize,
    solution: &Solution,
    digest: &Digest,
    checker: Option<(&CodeItem, &Digest)>,
    groups: Option<&HashSet<String>>,
) -> Result<SolutionRun> {
    let timing = ctx.timing();
    let limits = solution_limits(ctx);
    let mut run = SolutionRun {
        index,
        path: solution.code.path.clone(),
        expected: solution.outcome,
        groups: Vec::new(),
    };

    for group in &ctx.package.testcases {
        if groups.map_or(false, |g| !g.contains(&group.name)) {
            continue;
        }
        let out_dir = ctx.layout.solution_runs_dir(index, &group.name);
        fsutil::mkdir_all(&out_dir)?;

        let mut evaluations = Vec::new();
        for tc in TestcaseEntry::enumerate(ctx.layout.group_dir(&group.name))? {
            let stem = tc.stem();
            let stdout_path = out_dir.join(format!("{}.out", stem));
            let stderr_path = out_dir.join(format!("{}.err", stem));
            let log_path = out_dir.join(format!("{}.log", stem));

            let req = RunRequest::default()
                .stdin_path(&tc.input)
                .stdout(Sink::Path(stdout_path.clone()))
                .stderr(Sink::Path(stderr_path.clone()))
                .limits(limits.clone());
            let item_run = code::run_item(ctx, &solution.code, digest, req).with_context(|| {
                format!(
                    "Failed running {} on {}",
                    solution.code.path.to_string_lossy(),
                    tc.input.to_string_lossy()
                )
            })?;
            let log = item_run.log;

            let result = match checker {
                Some((item, checker_digest)) => checker::check(log.as_ref(), &timing, || {
                    ensure!(
                        tc.has_output(),
                        "No answer for {}; generate outputs first",
                        tc.input.to_string_lossy()
                    );
                    checker::run_checker(ctx, item, checker_digest, &tc, &stdout_path)
                })?,
                None => checker::check_with_no_output(log.as_ref(), &timing),
            };
            log::debug!(
                "{} {}/{}: {}",
                solution.code.path.to_string_lossy(),
                group.name,
                stem,
                result.outcome
            );

            let ev = Evaluation {
                result,
                testcase: TestcaseIo {
                    index: tc.index,
                    input: tc.input.clone(),
                    output: tc.output.clone(),
                },
                log: TestcaseLog {
                    run_log: log,
                    stdout_path,
                    stderr_path,
                    log_path: log_path.clone(),
                },
            };
            fsutil::write_json_with_mkdir(&log_path, &ev)?;
            evaluations.push(ev);
        }
        run.groups.push((group.name.clone(), evaluations));
    }
    Ok(run)
}

/// Compiles the checker and every solution, runs them, and logs each solution's
/// judgement. Fails if any solution does not match its expectation.
pub fn run_solutions(ctx: &BuildContext, groups: Option<&HashSet<String>>) -> Result<Vec<SolutionRun>> {
    let checker = checker::compile_checker(ctx)?;
    let digests = compile_solutions(ctx)?;
    let timing = ctx.timing();

    let mut runs = Vec::with_capacity(digests.len());
    let mut failed = Vec::new();
    for (index, (solution, digest)) in ctx.package.solutions.iter().zip(&digests).enumerate() {
        let path = solution.code.path.to_string_lossy();
        log::info!("Running {} (expects {})", path, solution.outcome);
        let run = run_solution(
            ctx,
            index,
            solution,
            digest,
            checker.as_ref().map(|(item, d)| (item, d)),
            groups,
        )?;

        let report = run.report(&timing);
        if report.ok {
            log::info!("{}: OK ({} ms)", path, report.max_time.as_millis());
            if report.barely_passed {
                log::warn!(
                    "{} passed with {} ms, within {}x of the {} ms time limit",
                    path,
                    report.max_time.as_millis(),
                    timing.warning_multiplier,
                    timing.time_limit.as_millis()
                );
            }
        } else {
            let seen: Vec<&str> = report
                .matched
                .iter()
                .chain(&report.unmatched)
                .map(|o| o.short_name())
                .collect();
            log::error!(
                "{}: FAILED, expected {} but got [{}]",
                path,
                solution.outcome.short_name(),
                seen.join(", ")
            );
            failed.push(path.into_owned());
        }
        runs.push(run);
    }
    ensure!(failed.is_empty(), "Solutions failed: {}", failed.join(", "));
    Ok(runs)
}
