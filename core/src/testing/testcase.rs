use std::path::{Path, PathBuf};

use lazy_regex::{lazy_regex, Lazy, Regex};

use crate::error::*;

static BUILT_INPUT: Lazy<Regex> = lazy_regex!(r"^(\d{3,})\.in$");

/// A built testcase: `<dir>/<NNN>.in` and its answer `<dir>/<NNN>.out`.
/// The answer may not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestcaseEntry {
    pub index: usize,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl TestcaseEntry {
    pub fn new(dir: impl AsRef<Path>, index: usize) -> Self {
        let dir = dir.as_ref();
        Self {
            index,
            input: dir.join(Self::input_name(index)),
            output: dir.join(Self::output_name(index)),
        }
    }

    pub fn input_name(index: usize) -> String {
        format!("{:03}.in", index)
    }

    pub fn output_name(index: usize) -> String {
        format!("{:03}.out", index)
    }

    /// `000.in` → `000`
    pub fn stem(&self) -> String {
        format!("{:03}", self.index)
    }

    pub fn has_output(&self) -> bool {
        self.output.is_file()
    }

    /// Built testcases of a group directory, ordered by index.
    pub fn enumerate(dir: impl AsRef<Path>) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        ensure!(
            dir.is_dir(),
            "Testcases are not built: {} does not exist",
            dir.to_string_lossy()
        );

        let mut res = Vec::new();
        for entry in fsutil::read_dir(dir)?.filter_map(std::result::Result::ok) {
            let Ok(ft) = entry.file_type() else {
                continue;
            };
            if ft.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(caps) = name.to_str().and_then(|s| BUILT_INPUT.captures(s)) else {
                continue;
            };
            let Ok(index) = caps[1].parse::<usize>() else {
                continue;
            };
            res.push(Self::new(dir, index));
        }
        res.sort_by_key(|t| t.index);
        Ok(res)
    }
}
