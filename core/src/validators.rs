//! Checking built inputs against the problem constraints.
//!
//! Validators read the input on stdin and receive one `--name=value` argument per
//! package variable. They write a bounds overview to `validator.log`, one line per
//! variable: `"n": min-value-hit,max-value-hit`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Write as _,
    path::{Path, PathBuf},
};

use lazy_regex::{lazy_regex, Lazy, Regex};
use serde::Serialize;

use crate::artifacts::GradingFileOutput;
use crate::code::{self, RunRequest, Sink};
use crate::context::BuildContext;
use crate::digest::Digest;
use crate::error::*;
use crate::package::CodeItem;
use crate::testing::TestcaseEntry;

pub const OVERVIEW_LOG: &str = "validator.log";
const OVERVIEW_HOLDER: &str = "overview";

static OVERVIEW_LINE: Lazy<Regex> = lazy_regex!(r#"^"([^"]*)"\s*:\s*(.*)$"#);

/// Whether the minimum and the maximum of a variable were seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Bounds {
    pub min_hit: bool,
    pub max_hit: bool,
}

impl Bounds {
    pub fn or(self, other: Bounds) -> Bounds {
        Bounds {
            min_hit: self.min_hit || other.min_hit,
            max_hit: self.max_hit || other.max_hit,
        }
    }

    pub fn all_hit(self) -> bool {
        self.min_hit && self.max_hit
    }
}

pub type HitBounds = BTreeMap<String, Bounds>;

pub fn parse_overview(log: &str) -> HitBounds {
    let mut res = HitBounds::new();
    for line in log.lines() {
        let Some(caps) = OVERVIEW_LINE.captures(line.trim()) else {
            continue;
        };
        let tags = &caps[2];
        let hit = Bounds {
            min_hit: tags.contains("min-value-hit"),
            max_hit: tags.contains("max-value-hit"),
        };
        let e = res.entry(caps[1].to_owned()).or_default();
        *e = e.or(hit);
    }
    res
}

pub fn merge_bounds(into: &mut HitBounds, other: &HitBounds) {
    for (name, b) in other {
        let e = into.entry(name.clone()).or_default();
        *e = e.or(*b);
    }
}

/// Renders bounds back in the overview format.
pub fn format_overview(bounds: &HitBounds) -> String {
    let mut s = String::new();
    for (name, b) in bounds {
        let mut tags = Vec::new();
        if b.min_hit {
            tags.push("min-value-hit");
        }
        if b.max_hit {
            tags.push("max-value-hit");
        }
        let _ = writeln!(s, "\"{}\": {}", name, tags.join(","));
    }
    s
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestcaseValidation {
    pub path: PathBuf,
    pub ok: bool,
    pub hit_bounds: HitBounds,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupValidation {
    pub group: String,
    pub testcases: Vec<TestcaseValidation>,
    /// OR of the bounds of the valid testcases.
    pub hit_bounds: HitBounds,
}

impl GroupValidation {
    pub fn is_ok(&self) -> bool {
        self.testcases.iter().all(|t| t.ok)
    }

    /// `(variable, "min"|"max")` for every bound no valid testcase reached.
    pub fn unhit_bounds(&self) -> Vec<(&str, &'static str)> {
        let mut res = Vec::new();
        for (name, b) in &self.hit_bounds {
            if b.all_hit() {
                continue;
            }
            if !b.min_hit {
                res.push((name.as_str(), "min"));
            }
            if !b.max_hit {
                res.push((name.as_str(), "max"));
            }
        }
        res
    }
}

/// Compiled validator for each group that has one (its own or the package's).
pub fn compile_validators(ctx: &BuildContext) -> Result<HashMap<String, (CodeItem, Digest)>> {
    let mut res = HashMap::new();
    for group in &ctx.package.testcases {
        let Some(validator) = ctx.package.validator_for(group) else {
            continue;
        };
        let digest = code::compile_item(ctx, validator).with_context(|| {
            format!(
                "Failed compiling validator {} of group '{}'",
                validator.path.to_string_lossy(),
                group.name
            )
        })?;
        res.insert(group.name.clone(), (validator.clone(), digest));
    }
    Ok(res)
}

pub fn validate_testcase(
    ctx: &BuildContext,
    validator: &CodeItem,
    digest: &Digest,
    input: &Path,
) -> Result<TestcaseValidation> {
    let mut args = ctx.package.var_args();
    args.push("--testOverviewLogFileName".to_owned());
    args.push(OVERVIEW_LOG.to_owned());

    let mut req = RunRequest::default()
        .stdin_path(input)
        .stderr(Sink::Digest)
        .args(args);
    req.outputs
        .push(GradingFileOutput::to_digest(OVERVIEW_LOG, OVERVIEW_HOLDER).optional());

    let run = code::run_item(ctx, validator, digest, req)?;
    let overview = ctx.blob_to_string_lossy(run.produced(OVERVIEW_HOLDER));
    let stderr = ctx.blob_to_string_lossy(run.produced(code::STDERR));
    let ok = run.exited_ok();
    Ok(TestcaseValidation {
        path: input.to_path_buf(),
        ok,
        hit_bounds: parse_overview(&overview),
        message: (!ok || !stderr.is_empty()).then_some(stderr),
    })
}

/// Validates every built input of every group with a validator, or of `groups` only,
/// and writes each group's merged overview to its `validator.log`.
pub fn validate_testcases(
    ctx: &BuildContext,
    groups: Option<&HashSet<String>>,
) -> Result<Vec<GroupValidation>> {
    let compiled = compile_validators(ctx)?;
    let mut res = Vec::new();
    for group in &ctx.package.testcases {
        if groups.map_or(false, |g| !g.contains(&group.name)) {
            continue;
        }
        let Some((validator, digest)) = compiled.get(&group.name) else {
            continue;
        };

        let mut gv = GroupValidation {
            group: group.name.clone(),
            testcases: Vec::new(),
            hit_bounds: HitBounds::new(),
        };
        for tc in TestcaseEntry::enumerate(ctx.layout.group_dir(&group.name))? {
            let v = validate_testcase(ctx, validator, digest, &tc.input)?;
            if v.ok {
                merge_bounds(&mut gv.hit_bounds, &v.hit_bounds);
            } else {
                log::error!(
                    "{} failed validation: {}",
                    tc.input.to_string_lossy(),
                    v.message.as_deref().unwrap_or("").trim_end()
                );
            }
            gv.testcases.push(v);
        }
        fsutil::write_with_mkdir(
            ctx.layout.validator_log(&group.name),
            format_overview(&gv.hit_bounds),
        )?;
        for (name, which) in gv.unhit_bounds() {
            log::warn!("Group '{}': {} {}-value not hit", group.name, name, which);
        }
        res.push(gv);
    }
    Ok(res)
}
