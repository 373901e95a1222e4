use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use kbox_core::checker::Evaluation;
use kbox_core::code;
use kbox_core::context::{BuildContext, BuildLayout};
use kbox_core::environment::Environment;
use kbox_core::package::Package;
use kbox_core::sandbox::{
    self, Execution, Sandbox, SandboxKind, SandboxParams, SandboxSettings, Workdir,
};
use kbox_core::solutions::{self, SolutionRun};
use kbox_core::validators::{self, GroupValidation};
use kbox_core::{generators, Config, Outcome};
use tempfile::TempDir;

const ENVIRONMENT: &str = r#"
sandbox = "permissive"

[[languages]]
name = "sh"
extension = "sh"
execution = { command = "sh #{executable}" }
"#;

const PROBLEM: &str = r#"
name = "sum"
timeLimit = 500
memoryLimit = 256
checker = { path = "checker.sh" }
validator = { path = "validator.sh" }

[vars]
MAX = 100

[[generators]]
name = "gen"
path = "gen.sh"

[[solutions]]
path = "sol.sh"
outcome = "accepted"

[[solutions]]
path = "wa.sh"
outcome = "wa"

[[solutions]]
path = "slow.sh"
outcome = "tle"

[[testcases]]
name = "samples"
testcases = [{ inputPath = "samples/1.in", outputPath = "samples/1.out" }]

[[testcases]]
name = "main"
testcaseGlob = "manual/*.in"
generators = [{ name = "gen", args = "1 2" }, { name = "gen", args = "100 5" }]
generatorScript = { path = "script.txt" }
"#;

const VALIDATOR: &str = r#"
log=""
max=0
while [ $# -gt 0 ]; do
    case "$1" in
        --testOverviewLogFileName) log="$2"; shift ;;
        --MAX=*) max="${1#--MAX=}" ;;
    esac
    shift
done
read a b || exit 3
[ "$a" -ge 1 ] && [ "$a" -le "$max" ] || { echo "a out of range: $a" >&2; exit 3; }
tags=""
[ "$a" -eq 1 ] && tags="min-value-hit"
[ "$a" -eq "$max" ] && tags="${tags:+$tags,}max-value-hit"
[ -n "$log" ] && echo "\"a\": $tags" > "$log"
exit 0
"#;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write(root: &Path, name: &str, contents: &str) {
    fsutil::write_with_mkdir(root.join(name), contents).unwrap();
}

fn package_dir() -> TempDir {
    init();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "problem.toml", PROBLEM);
    write(root, "kbox.toml", "[sandbox]\nwall_grace_ms = 100\n");
    write(root, "samples/1.in", "3 4\n");
    write(root, "samples/1.out", "7\n");
    write(root, "manual/a.in", "2 2\n");
    write(root, "manual/a.out", "4\n");
    write(root, "manual/notes.txt", "not a testcase\n");
    write(root, "script.txt", "gen 5 5\n\n");
    write(root, "gen.sh", "echo \"$1 $2\"\n");
    write(root, "validator.sh", VALIDATOR);
    write(root, "checker.sh", "[ \"$(cat \"$2\")\" = \"$(cat \"$3\")\" ] || exit 1\n");
    write(root, "sol.sh", "read a b\necho $((a + b))\n");
    write(root, "wa.sh", "echo 0\n");
    write(root, "slow.sh", "sleep 3\n");
    dir
}

fn environment() -> Environment {
    Environment::from_toml(ENVIRONMENT).unwrap()
}

/// Delegates to a real backend and counts every process it starts.
struct CountingSandbox {
    inner: Box<dyn Sandbox>,
    spawned: Arc<AtomicUsize>,
}

impl Sandbox for CountingSandbox {
    fn kind(&self) -> SandboxKind {
        self.inner.kind()
    }

    fn settings(&self) -> &SandboxSettings {
        self.inner.settings()
    }

    fn spawn(&self, workdir: &Workdir, command: &str, params: &SandboxParams) -> Execution {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn(workdir, command, params)
    }
}

fn counting_context(dir: &Path) -> (BuildContext, Arc<AtomicUsize>) {
    let config = Config::from_dir_or_default(dir).unwrap();
    let package = Package::from_toml_file(dir.join(Package::FILENAME)).unwrap();
    let layout = BuildLayout::new(dir, &config);
    let settings = SandboxSettings::new(layout.sandbox_root()).wall_grace(config.sandbox.wall_grace());
    let spawned = Arc::new(AtomicUsize::new(0));
    let sandbox = CountingSandbox {
        inner: sandbox::new_sandbox(SandboxKind::Permissive, settings),
        spawned: Arc::clone(&spawned),
    };
    let ctx = BuildContext::with_sandbox(layout, config, environment(), package, Box::new(sandbox))
        .unwrap();
    (ctx, spawned)
}

fn build(ctx: &BuildContext) -> (Vec<GroupValidation>, Vec<SolutionRun>) {
    generators::generate_testcases(ctx, None).unwrap();
    generators::generate_outputs(ctx, None).unwrap();
    let validations = validators::validate_testcases(ctx, None).unwrap();
    let runs = solutions::run_solutions(ctx, None).unwrap();
    (validations, runs)
}

fn read(path: impl AsRef<Path>) -> String {
    fsutil::read_to_string(path).unwrap()
}

#[test]
fn builds_validates_and_judges_a_package() {
    let dir = package_dir();
    let ctx = BuildContext::load(dir.path(), environment()).unwrap();
    let (validations, runs) = build(&ctx);

    let samples = ctx.layout.group_dir("samples");
    assert_eq!(read(samples.join("000.in")), "3 4\n");
    assert_eq!(read(samples.join("000.out")), "7\n");

    // glob match, then generator calls, then script lines
    let main = ctx.layout.group_dir("main");
    let built: Vec<(String, String)> = (0..4)
        .map(|i| {
            (
                read(main.join(format!("{:03}.in", i))),
                read(main.join(format!("{:03}.out", i))),
            )
        })
        .collect();
    assert_eq!(
        built,
        [
            ("2 2\n".to_owned(), "4\n".to_owned()),
            ("1 2\n".to_owned(), "3\n".to_owned()),
            ("100 5\n".to_owned(), "105\n".to_owned()),
            ("5 5\n".to_owned(), "10\n".to_owned()),
        ]
    );
    assert!(!main.join("004.in").exists());

    assert_eq!(validations.len(), 2);
    assert!(validations.iter().all(GroupValidation::is_ok));
    let main_validation = &validations[1];
    assert_eq!(main_validation.group, "main");
    assert!(main_validation.unhit_bounds().is_empty());
    assert_eq!(
        read(ctx.layout.validator_log("main")),
        "\"a\": min-value-hit,max-value-hit\n"
    );
    assert_eq!(validations[0].unhit_bounds(), [("a", "min"), ("a", "max")]);

    let timing = ctx.timing();
    let reports: Vec<_> = runs.iter().map(|r| r.report(&timing)).collect();
    assert!(reports.iter().all(|r| r.ok));
    assert!(reports[0].matched.is_empty());
    assert_eq!(reports[1].matched.iter().copied().collect::<Vec<_>>(), [Outcome::WrongAnswer]);
    assert_eq!(
        reports[2].matched.iter().copied().collect::<Vec<_>>(),
        [Outcome::TimeLimitExceeded]
    );
    assert!(reports[2].max_time > Duration::from_millis(500));

    let run_dir = ctx.layout.solution_runs_dir(0, "main");
    assert_eq!(read(run_dir.join("002.out")), "105\n");
    assert!(run_dir.join("002.err").is_file());
    let ev: Evaluation = fsutil::read_json_with_deserialize(run_dir.join("002.log")).unwrap();
    assert_eq!(ev.result.outcome, Outcome::Accepted);
    assert_eq!(ev.testcase.index, 2);

    let ev: Evaluation =
        fsutil::read_json_with_deserialize(ctx.layout.solution_runs_dir(1, "samples").join("000.log"))
            .unwrap();
    assert_eq!(ev.result.outcome, Outcome::WrongAnswer);
}

#[test]
fn warm_rebuild_runs_nothing() {
    let dir = package_dir();
    let cold = BuildContext::load(dir.path(), environment()).unwrap();
    let (cold_validations, cold_runs) = build(&cold);
    let cold_digests = solutions::compile_solutions(&cold).unwrap();
    drop(cold);

    let (warm, spawned) = counting_context(dir.path());
    let (warm_validations, warm_runs) = build(&warm);
    assert_eq!(spawned.load(Ordering::SeqCst), 0);
    assert_eq!(solutions::compile_solutions(&warm).unwrap(), cold_digests);
    assert_eq!(warm_validations, cold_validations);
    assert_eq!(warm_runs, cold_runs);

    // restored from the blob store after the group directories were rebuilt
    assert_eq!(read(warm.layout.group_dir("main").join("001.out")), "3\n");
}

#[test]
fn changed_input_reruns_what_depends_on_it() {
    let dir = package_dir();
    build(&BuildContext::load(dir.path(), environment()).unwrap());

    write(dir.path(), "samples/1.in", "10 20\n");
    write(dir.path(), "samples/1.out", "30\n");
    let (ctx, spawned) = counting_context(dir.path());
    let (_, runs) = build(&ctx);
    assert!(spawned.load(Ordering::SeqCst) > 0);

    let run_dir = ctx.layout.solution_runs_dir(0, "samples");
    assert_eq!(read(run_dir.join("000.out")), "30\n");
    assert!(runs[0].report(&ctx.timing()).ok);
}

#[test]
fn failing_validation_is_reported_per_testcase() {
    let dir = package_dir();
    write(dir.path(), "samples/1.in", "1000 1\n");
    write(dir.path(), "samples/1.out", "1001\n");
    let ctx = BuildContext::load(dir.path(), environment()).unwrap();
    generators::generate_testcases(&ctx, None).unwrap();

    let validations = validators::validate_testcases(&ctx, None).unwrap();
    let samples = &validations[0];
    assert!(!samples.is_ok());
    assert!(samples.testcases[0]
        .message
        .as_deref()
        .unwrap_or("")
        .contains("out of range"));
}

#[test]
fn unmet_expectation_fails_the_run() {
    let dir = package_dir();
    // the "wrong" solution is actually correct
    write(dir.path(), "wa.sh", "read a b\necho $((a + b))\n");
    let ctx = BuildContext::load(dir.path(), environment()).unwrap();
    generators::generate_testcases(&ctx, None).unwrap();
    generators::generate_outputs(&ctx, None).unwrap();

    let err = solutions::run_solutions(&ctx, None).unwrap_err();
    assert!(format!("{:#}", err).contains("wa.sh"));
}

#[test]
fn without_a_checker_only_the_run_is_judged() {
    let dir = package_dir();
    let problem = PROBLEM
        .replace("checker = { path = \"checker.sh\" }\n", "")
        .replace("path = \"wa.sh\"\noutcome = \"wa\"", "path = \"re.sh\"\noutcome = \"rte\"");
    write(dir.path(), "problem.toml", &problem);
    write(dir.path(), "re.sh", "exit 1\n");

    let ctx = BuildContext::load(dir.path(), environment()).unwrap();
    assert!(ctx.package.checker.is_none());
    generators::generate_testcases(&ctx, None).unwrap();
    let runs = solutions::run_solutions(&ctx, None).unwrap();
    assert_eq!(runs[1].path, Path::new("re.sh"));
    assert!(runs[1]
        .evaluations()
        .all(|e| e.result.outcome == Outcome::RuntimeError));
}

#[test]
fn slow_correct_solution_keeps_the_checker_verdict() {
    let dir = package_dir();
    write(dir.path(), "slow.sh", "sleep 0.7\nread a b\necho $((a + b))\n");
    let ctx = BuildContext::load(dir.path(), environment()).unwrap();
    let (_, runs) = build(&ctx);

    let slow = &runs[2];
    assert_eq!(slow.path, Path::new("slow.sh"));
    for ev in slow.evaluations() {
        assert_eq!(ev.result.outcome, Outcome::TimeLimitExceeded);
        assert_eq!(ev.result.no_tle_outcome, Some(Outcome::Accepted));
    }
    let report = slow.report(&ctx.timing());
    assert!(report.ok);
    assert!(report.barely_passed);
}

#[test]
fn uncompiled_language_stores_the_source() {
    let dir = package_dir();
    let ctx = BuildContext::load(dir.path(), environment()).unwrap();
    let gen = ctx.package.generator("gen").unwrap();
    let digest = code::compile_item(&ctx, &gen.code).unwrap();
    assert_eq!(
        ctx.blob_to_string_lossy(Some(&digest)),
        "echo \"$1 $2\"\n"
    );
}
