use std::{collections::HashMap, str::FromStr};

use once_cell::sync::Lazy;
use serde::{de, Deserialize, Deserializer, Serialize};

/// Verdict of one run, or the expectation declared for a solution.
///
/// `Incorrect` and `TleOrRte` only appear as expectations; the classifier never produces them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Accepted,
    WrongAnswer,
    Incorrect,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    TleOrRte,
    InternalError,
    JudgeFailed,
}

const ALIASES: &[(Outcome, &[&str])] = &[
    (Outcome::Accepted, &["accepted", "ac", "correct"]),
    (Outcome::WrongAnswer, &["wrong answer", "wa"]),
    (Outcome::Incorrect, &["incorrect", "fail"]),
    (Outcome::RuntimeError, &["runtime error", "rte", "re"]),
    (
        Outcome::TimeLimitExceeded,
        &["time limit exceeded", "timeout", "tle"],
    ),
    (Outcome::MemoryLimitExceeded, &["memory limit exceeded", "mle"]),
    (Outcome::TleOrRte, &["tle or rte", "tle/rte", "tle+rte"]),
    (Outcome::InternalError, &["internal error", "ie"]),
    (Outcome::JudgeFailed, &["judge failed", "jf"]),
];

/// Lowercases and drops everything but ASCII letters and digits,
/// so `"TLE/RTE"`, `"tle+rte"` and `"TLE_RTE"` compare equal.
pub fn normalize_name(s: &str) -> String {
    s.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

static LOOKUP: Lazy<HashMap<String, Outcome>> = Lazy::new(|| {
    use strum::IntoEnumIterator;

    let mut m = HashMap::new();
    for o in Outcome::iter() {
        m.insert(normalize_name(&o.to_string()), o);
    }
    for (o, names) in ALIASES {
        for name in *names {
            m.insert(normalize_name(name), *o);
        }
    }
    m
});

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Unknown outcome '{0}'")]
pub struct UnknownOutcome(String);

impl FromStr for Outcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LOOKUP
            .get(&normalize_name(s))
            .copied()
            .ok_or_else(|| UnknownOutcome(s.to_owned()))
    }
}

impl<'de> Deserialize<'de> for Outcome {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Outcome {
    /// Whether a measured `outcome` is allowed by this expectation.
    pub fn matches(self, outcome: Outcome) -> bool {
        use Outcome::*;
        match self {
            Incorrect => matches!(
                outcome,
                WrongAnswer | RuntimeError | MemoryLimitExceeded | TimeLimitExceeded
            ),
            TleOrRte => matches!(outcome, TimeLimitExceeded | RuntimeError),
            expected => expected == outcome,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == Outcome::Accepted
    }

    pub fn short_name(self) -> &'static str {
        use Outcome::*;
        match self {
            Accepted => "AC",
            WrongAnswer => "WA",
            Incorrect => "FAIL",
            RuntimeError => "RTE",
            TimeLimitExceeded => "TLE",
            MemoryLimitExceeded => "MLE",
            TleOrRte => "TLE/RTE",
            InternalError => "IE",
            JudgeFailed => "JF",
        }
    }
}
