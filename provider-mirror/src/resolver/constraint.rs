//! Version constraint grammar used by Terraform and OpenTofu manifests.
//!
//! Supports `=`, `!=`, `<`, `<=`, `>`, `>=`, `~>`, and comma-separated
//! conjunctions, evaluated over [`semver::Version`] precedence. Registry
//! version strings are parsed leniently: an optional `v` prefix and one to
//! three numeric segments (`1.0` reads as `1.0.0`), with prerelease and
//! build suffixes.

use semver::{BuildMetadata, Prerelease, Version};

use crate::error::{Error, Result};

/// A parsed constraint: the conjunction of one or more comparators.
#[derive(Debug, Clone)]
pub struct Constraint {
    comparators: Vec<Comparator>,
    original: String,
}

#[derive(Debug, Clone)]
struct Comparator {
    op: Op,
    version: Version,
    /// Number of version segments the manifest author wrote; `~>` bumps the
    /// second-to-last specified segment for its upper bound.
    segments: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Pessimistic,
}

impl Constraint {
    /// Parses a constraint string such as `">= 1.2, < 2.0"`.
    pub fn parse(input: &str) -> Result<Constraint> {
        let comparators = input
            .split(',')
            .map(parse_comparator)
            .collect::<Result<Vec<_>>>()?;

        if comparators.is_empty() {
            return Err(Error::Config(format!("empty version constraint: {input:?}")));
        }

        Ok(Constraint {
            comparators,
            original: input.to_string(),
        })
    }

    /// True if `version` satisfies every comparator.
    ///
    /// Prerelease versions only satisfy comparators that themselves name a
    /// prerelease (`!=` excepted), matching the conventional grammar's
    /// behavior of hiding prereleases from range constraints.
    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    pub fn original(&self) -> &str {
        &self.original
    }
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        if !v.pre.is_empty() && self.version.pre.is_empty() {
            return self.op == Op::Ne;
        }

        let ord = v.cmp_precedence(&self.version);
        match self.op {
            Op::Eq => ord.is_eq(),
            Op::Ne => ord.is_ne(),
            Op::Gt => ord.is_gt(),
            Op::Gte => ord.is_ge(),
            Op::Lt => ord.is_lt(),
            Op::Lte => ord.is_le(),
            Op::Pessimistic => {
                ord.is_ge() && v.cmp_precedence(&self.pessimistic_upper_bound()).is_lt()
            }
        }
    }

    /// Exclusive upper bound for `~>`: `~> 1.2.3` allows up to (not
    /// including) `1.3.0`; `~> 1.2` and `~> 1` allow up to `2.0.0`.
    fn pessimistic_upper_bound(&self) -> Version {
        let mut upper = Version::new(self.version.major + 1, 0, 0);
        if self.segments >= 3 {
            upper = Version::new(self.version.major, self.version.minor + 1, 0);
        }
        upper
    }
}

fn parse_comparator(part: &str) -> Result<Comparator> {
    let part = part.trim();

    let (op, rest) = if let Some(rest) = part.strip_prefix("~>") {
        (Op::Pessimistic, rest)
    } else if let Some(rest) = part.strip_prefix(">=") {
        (Op::Gte, rest)
    } else if let Some(rest) = part.strip_prefix("<=") {
        (Op::Lte, rest)
    } else if let Some(rest) = part.strip_prefix("!=") {
        (Op::Ne, rest)
    } else if let Some(rest) = part.strip_prefix('>') {
        (Op::Gt, rest)
    } else if let Some(rest) = part.strip_prefix('<') {
        (Op::Lt, rest)
    } else if let Some(rest) = part.strip_prefix('=') {
        (Op::Eq, rest)
    } else {
        (Op::Eq, part)
    };

    let (version, segments) = parse_lenient(rest.trim())
        .ok_or_else(|| Error::Config(format!("parsing constraint {part:?}: invalid version")))?;

    Ok(Comparator {
        op,
        version,
        segments,
    })
}

/// Parses a version string leniently, returning the version and how many
/// numeric segments were written. Returns `None` for anything that is not a
/// version.
pub fn parse_lenient(input: &str) -> Option<(Version, usize)> {
    let input = input.trim();
    let input = input.strip_prefix(['v', 'V']).unwrap_or(input);
    if input.is_empty() {
        return None;
    }

    if let Ok(v) = Version::parse(input) {
        return Some((v, 3));
    }

    let (rest, build) = match input.split_once('+') {
        Some((rest, build)) => (rest, Some(build)),
        None => (input, None),
    };
    let (core, pre) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };

    let segments: Vec<&str> = core.split('.').collect();
    if segments.is_empty() || segments.len() > 3 {
        return None;
    }

    let mut numbers = [0u64; 3];
    for (i, segment) in segments.iter().enumerate() {
        numbers[i] = segment.parse().ok()?;
    }

    let version = Version {
        major: numbers[0],
        minor: numbers[1],
        patch: numbers[2],
        pre: match pre {
            Some(p) => Prerelease::new(p).ok()?,
            None => Prerelease::EMPTY,
        },
        build: match build {
            Some(b) => BuildMetadata::new(b).ok()?,
            None => BuildMetadata::EMPTY,
        },
    };

    Some((version, segments.len()))
}
