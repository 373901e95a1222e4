//! Turning a run log and the checker's opinion into a verdict.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::artifacts::GradingFileInput;
use crate::code::{self, RunRequest, Sink};
use crate::config::TimingConfig;
use crate::context::BuildContext;
use crate::digest::Digest;
use crate::error::*;
use crate::outcome::Outcome;
use crate::package::CodeItem;
use crate::sandbox::{ExitStatus, RunLog};
use crate::testing::TestcaseEntry;

/// The time limit and the multipliers judged against it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingPolicy {
    pub time_limit: Duration,
    pub hard_multiplier: f64,
    pub warning_multiplier: f64,
}

impl TimingPolicy {
    pub fn new(time_limit: Duration, cfg: &TimingConfig) -> Self {
        Self {
            time_limit,
            hard_multiplier: cfg.hard_tle_multiplier,
            warning_multiplier: cfg.warning_multiplier,
        }
    }

    /// Past this, the run is TLE without consulting the checker.
    pub fn hard_limit(&self) -> Duration {
        self.time_limit.mul_f64(self.hard_multiplier)
    }

    pub fn warning_limit(&self) -> Duration {
        self.time_limit.mul_f64(self.warning_multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerResult {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The verdict before a soft TLE replaced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_tle_outcome: Option<Outcome>,
}

impl CheckerResult {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            message: None,
            no_tle_outcome: None,
        }
    }

    pub fn with_message(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(outcome)
        }
    }
}

/// What the checker program reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerRun {
    pub log: Option<RunLog>,
    pub stderr: String,
}

/// Verdict from the run log alone. `Accepted` here only means "ask the checker".
pub fn check_pre_output(log: Option<&RunLog>, timing: &TimingPolicy) -> CheckerResult {
    let Some(log) = log else {
        return CheckerResult::new(Outcome::InternalError);
    };
    if log.time() > timing.hard_limit() {
        return CheckerResult::new(Outcome::TimeLimitExceeded);
    }
    let outcome = match log.exit_status {
        ExitStatus::Signaled | ExitStatus::NonzeroExit => Outcome::RuntimeError,
        ExitStatus::CpuTimeout | ExitStatus::WallTimeout => Outcome::TimeLimitExceeded,
        ExitStatus::MemoryLimitExceeded => Outcome::MemoryLimitExceeded,
        ExitStatus::SandboxError => Outcome::InternalError,
        ExitStatus::Ok => Outcome::Accepted,
    };
    CheckerResult::new(outcome)
}

/// Maps the checker's own termination to a verdict.
pub fn checker_outcome(run: &CheckerRun) -> CheckerResult {
    let code = run.log.as_ref().and_then(|l| match l.exit_status {
        ExitStatus::Ok | ExitStatus::NonzeroExit => l.exit_code,
        _ => None,
    });
    let outcome = match code {
        Some(0) => Outcome::Accepted,
        Some(1) | Some(2) => Outcome::WrongAnswer,
        Some(3) => Outcome::JudgeFailed,
        _ => {
            log::error!(
                "Checker ended unexpectedly: {}",
                run.log
                    .as_ref()
                    .map_or("no run log".to_owned(), |l| l.exit_status.to_string())
            );
            Outcome::InternalError
        }
    };
    CheckerResult::with_message(outcome, run.stderr.clone())
}

/// Replaces a determined verdict by TLE when the run exceeded the time limit.
fn convert_soft_tle(mut result: CheckerResult, log: Option<&RunLog>, timing: &TimingPolicy) -> CheckerResult {
    if let Some(log) = log {
        if log.time() > timing.time_limit && result.outcome != Outcome::TimeLimitExceeded {
            result.no_tle_outcome = Some(result.outcome);
            result.outcome = Outcome::TimeLimitExceeded;
        }
    }
    result
}

/// Verdict for runs judged without a checker. Only a clean run can become a soft TLE.
pub fn check_with_no_output(log: Option<&RunLog>, timing: &TimingPolicy) -> CheckerResult {
    let pre = check_pre_output(log, timing);
    if pre.outcome != Outcome::Accepted {
        return pre;
    }
    convert_soft_tle(pre, log, timing)
}

/// Full decision: pre-checks, then `invoke_checker` only if the run itself was fine.
pub fn check<F>(log: Option<&RunLog>, timing: &TimingPolicy, invoke_checker: F) -> Result<CheckerResult>
where
    F: FnOnce() -> Result<CheckerRun>,
{
    let pre = check_pre_output(log, timing);
    if pre.outcome != Outcome::Accepted {
        return Ok(pre);
    }
    let run = invoke_checker()?;
    Ok(convert_soft_tle(checker_outcome(&run), log, timing))
}

pub fn compile_checker(ctx: &BuildContext) -> Result<Option<(CodeItem, Digest)>> {
    let Some(item) = &ctx.package.checker else {
        return Ok(None);
    };
    let digest = code::compile_item(ctx, item).context("Failed compiling checker")?;
    Ok(Some((item.clone(), digest)))
}

pub const CHECKER_INPUT: &str = "input.txt";
pub const CHECKER_OUTPUT: &str = "output.txt";
pub const CHECKER_EXPECTED: &str = "expected.txt";

/// Runs `checker input.txt output.txt expected.txt`.
pub fn run_checker(
    ctx: &BuildContext,
    checker: &CodeItem,
    digest: &Digest,
    testcase: &TestcaseEntry,
    program_output: &Path,
) -> Result<CheckerRun> {
    let mut req = RunRequest::default()
        .stderr(Sink::Digest)
        .args([CHECKER_INPUT, CHECKER_OUTPUT, CHECKER_EXPECTED]);
    req.inputs = vec![
        GradingFileInput::from_path(&testcase.input, CHECKER_INPUT),
        GradingFileInput::from_path(program_output, CHECKER_OUTPUT),
        GradingFileInput::from_path(&testcase.output, CHECKER_EXPECTED),
    ];
    let run = code::run_item(ctx, checker, digest, req)?;
    Ok(CheckerRun {
        stderr: ctx.blob_to_string_lossy(run.produced(code::STDERR)),
        log: run.log,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseIo {
    pub index: usize,
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseLog {
    pub run_log: Option<RunLog>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub log_path: PathBuf,
}

/// One solution on one testcase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub result: CheckerResult,
    pub testcase: TestcaseIo,
    pub log: TestcaseLog,
}

impl Evaluation {
    pub fn time(&self) -> Duration {
        self.log.run_log.as_ref().map_or(Duration::ZERO, RunLog::time)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    fn timing() -> TimingPolicy {
        TimingPolicy::new(Duration::from_millis(100), &TimingConfig::default())
    }

    fn log_with(status: ExitStatus, ms: u64) -> RunLog {
        RunLog {
            exit_status: status,
            exit_code: match status {
                ExitStatus::Ok => Some(0),
                ExitStatus::NonzeroExit => Some(1),
                _ => None,
            },
            signal: None,
            cpu_time: Some(Duration::from_millis(ms)),
            wall_time: Duration::from_millis(ms),
            memory_kb: Some(1024),
            message: None,
        }
    }

    fn checker_exit(code: i32) -> CheckerRun {
        let mut log = log_with(
            if code == 0 { ExitStatus::Ok } else { ExitStatus::NonzeroExit },
            5,
        );
        log.exit_code = Some(code);
        CheckerRun {
            log: Some(log),
            stderr: format!("exit {}", code),
        }
    }

    #[test]
    fn checker_exit_codes() {
        let cases = [
            (0, Outcome::Accepted),
            (1, Outcome::WrongAnswer),
            (2, Outcome::WrongAnswer),
            (3, Outcome::JudgeFailed),
            (4, Outcome::InternalError),
            (42, Outcome::InternalError),
        ];
        for (code, want) in cases {
            let ok = log_with(ExitStatus::Ok, 10);
            let res = check(Some(&ok), &timing(), || Ok(checker_exit(code))).unwrap();
            assert_eq!(res.outcome, want, "exit {}", code);
            assert_eq!(res.message.as_deref(), Some(format!("exit {}", code).as_str()));
            assert_eq!(res.no_tle_outcome, None);
        }
    }

    #[test]
    fn killed_checker_is_internal_error() {
        let mut log = log_with(ExitStatus::Signaled, 5);
        log.signal = Some(9);
        let run = CheckerRun {
            log: Some(log),
            stderr: String::new(),
        };
        assert_eq!(checker_outcome(&run).outcome, Outcome::InternalError);
        let none = CheckerRun {
            log: None,
            stderr: String::new(),
        };
        assert_eq!(checker_outcome(&none).outcome, Outcome::InternalError);
    }

    #[test]
    fn soft_tle_keeps_checker_verdict() {
        let slow = log_with(ExitStatus::Ok, 150);

        let res = check(Some(&slow), &timing(), || Ok(checker_exit(0))).unwrap();
        assert_eq!(res.outcome, Outcome::TimeLimitExceeded);
        assert_eq!(res.no_tle_outcome, Some(Outcome::Accepted));

        let res = check(Some(&slow), &timing(), || Ok(checker_exit(1))).unwrap();
        assert_eq!(res.outcome, Outcome::TimeLimitExceeded);
        assert_eq!(res.no_tle_outcome, Some(Outcome::WrongAnswer));
    }

    #[test]
    fn hard_tle_skips_checker() {
        let called = Cell::new(false);
        let log = log_with(ExitStatus::Ok, 210);
        let res = check(Some(&log), &timing(), || {
            called.set(true);
            Ok(checker_exit(0))
        })
        .unwrap();
        assert_eq!(res.outcome, Outcome::TimeLimitExceeded);
        assert_eq!(res.no_tle_outcome, None);
        assert!(!called.get());
    }

    #[test]
    fn soft_tle_below_a_raised_hard_cutoff() {
        let t = TimingPolicy {
            hard_multiplier: 3.0,
            ..timing()
        };
        let log = log_with(ExitStatus::Ok, 250);
        let res = check(Some(&log), &t, || Ok(checker_exit(0))).unwrap();
        assert_eq!(res.outcome, Outcome::TimeLimitExceeded);
        assert_eq!(res.no_tle_outcome, Some(Outcome::Accepted));

        let res = check(Some(&log), &t, || Ok(checker_exit(2))).unwrap();
        assert_eq!(res.no_tle_outcome, Some(Outcome::WrongAnswer));

        // with the default cutoff the same run is a hard TLE
        let res = check(Some(&log), &timing(), || Ok(checker_exit(0))).unwrap();
        assert_eq!(res.no_tle_outcome, None);
    }

    #[test]
    fn pre_checks_in_order() {
        let t = timing();
        let cases = [
            (ExitStatus::Signaled, Outcome::RuntimeError),
            (ExitStatus::NonzeroExit, Outcome::RuntimeError),
            (ExitStatus::CpuTimeout, Outcome::TimeLimitExceeded),
            (ExitStatus::WallTimeout, Outcome::TimeLimitExceeded),
            (ExitStatus::MemoryLimitExceeded, Outcome::MemoryLimitExceeded),
            (ExitStatus::SandboxError, Outcome::InternalError),
        ];
        for (status, want) in cases {
            let log = log_with(status, 10);
            let res = check(Some(&log), &t, || panic!("checker must not run")).unwrap();
            assert_eq!(res.outcome, want, "{}", status);
        }
        let res = check(None, &t, || panic!("checker must not run")).unwrap();
        assert_eq!(res.outcome, Outcome::InternalError);
    }

    #[test]
    fn slow_failures_keep_their_own_verdict() {
        let cases = [
            (ExitStatus::NonzeroExit, Outcome::RuntimeError),
            (ExitStatus::Signaled, Outcome::RuntimeError),
            (ExitStatus::MemoryLimitExceeded, Outcome::MemoryLimitExceeded),
            (ExitStatus::SandboxError, Outcome::InternalError),
        ];
        for (status, want) in cases {
            let log = log_with(status, 150);
            let res = check(Some(&log), &timing(), || panic!("checker must not run")).unwrap();
            assert_eq!(res.outcome, want, "{}", status);
            assert_eq!(res.no_tle_outcome, None, "{}", status);

            let res = check_with_no_output(Some(&log), &timing());
            assert_eq!(res.outcome, want, "{}", status);
            assert_eq!(res.no_tle_outcome, None, "{}", status);
        }
    }

    #[test]
    fn slow_clean_run_without_checker_is_soft_tle() {
        let log = log_with(ExitStatus::Ok, 150);
        let res = check_with_no_output(Some(&log), &timing());
        assert_eq!(res.outcome, Outcome::TimeLimitExceeded);
        assert_eq!(res.no_tle_outcome, Some(Outcome::Accepted));
    }

    #[test]
    fn permissive_logs_are_timed_by_wall_clock() {
        let mut log = log_with(ExitStatus::Ok, 10);
        log.cpu_time = None;
        log.wall_time = Duration::from_millis(150);
        let res = check_with_no_output(Some(&log), &timing());
        assert_eq!(res.outcome, Outcome::TimeLimitExceeded);
        assert_eq!(res.no_tle_outcome, Some(Outcome::Accepted));
    }

    #[test]
    fn evaluation_log_is_json() {
        let ev = Evaluation {
            result: CheckerResult::new(Outcome::Accepted),
            testcase: TestcaseIo {
                index: 0,
                input: PathBuf::from("000.in"),
                output: PathBuf::from("000.out"),
            },
            log: TestcaseLog {
                run_log: Some(log_with(ExitStatus::Ok, 12)),
                stdout_path: PathBuf::from("000.out"),
                stderr_path: PathBuf::from("000.err"),
                log_path: PathBuf::from("000.log"),
            },
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""outcome":"ACCEPTED""#));
        let back: Evaluation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.time(), Duration::from_millis(12));
    }
}
