//! Identifier bounds, ranges and bounded identifier parsing.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest accepted item identifier.
pub const MIN_ID: u64 = 1;

/// Largest accepted item identifier.
pub const MAX_ID: u64 = 99_999_999;

/// Whole file name: alphabetic prefix (at most 8 letters), at most 12
/// digits ending the stem, then a short extension.
static ITEM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{0,8}(\d{1,12})\.[A-Za-z0-9]{1,8}$").expect("valid regex")
});

/// `<prefix><digits>[-_<prefix><digits>]` at the start of a file stem.
static ITEM_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{0,8}(\d{1,12})(?:[-_][A-Za-z]{0,8}(\d{1,12}))?(?:\.|$)")
        .expect("valid regex")
});

/// Validates a single identifier against `[MIN_ID, MAX_ID]`.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] when the identifier is outside the bounds.
pub fn validate_id(id: u64) -> Result<u64> {
    if id < MIN_ID || id > MAX_ID {
        return Err(Error::OutOfRange {
            id,
            min: MIN_ID,
            max: MAX_ID,
        });
    }
    Ok(id)
}

/// Validates both ends of a range. A reversed pair is swapped, not rejected.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] when either bound is outside the bounds.
pub fn validate_range(start: u64, end: u64) -> Result<IdRange> {
    validate_id(start)?;
    validate_id(end)?;
    if start > end {
        log::warn!("Reversed identifier range {start}-{end}, using {end}-{start}");
        return Ok(IdRange { start: end, end: start });
    }
    Ok(IdRange { start, end })
}

/// Inclusive identifier interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRange {
    /// First identifier in the interval.
    pub start: u64,
    /// Last identifier in the interval.
    pub end: u64,
}

impl IdRange {
    /// Builds a validated range (see [`validate_range`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] when either bound is outside the bounds.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        validate_range(start, end)
    }

    /// Returns true if `id` lies inside the interval.
    #[must_use]
    pub const fn contains(&self, id: u64) -> bool {
        self.start <= id && id <= self.end
    }

    /// Returns true if `[start, end]` shares at least one identifier with this interval.
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        start <= self.end && self.start <= end
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for IdRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (s, s),
        };
        let parse = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| Error::Config(format!("invalid range bound {v:?} in {s:?}")))
        };
        validate_range(parse(start)?, parse(end)?)
    }
}

/// Returns true if `[start, end]` overlaps any filter interval.
///
/// An empty filter list retains everything.
#[must_use]
pub fn in_range(filters: &[IdRange], start: u64, end: u64) -> bool {
    filters.is_empty() || filters.iter().any(|r| r.overlaps(start, end))
}

/// Final path component of an archive member or URL path.
fn file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Extracts the numeric item identifier from a name such as `PMC160.pdf`
/// or `dir/ITEM160.pdf`. The identifier is not bounds-checked.
#[must_use]
pub fn parse_item_id(name: &str) -> Option<u64> {
    let caps = ITEM_ID_RE.captures(file_name(name))?;
    caps.get(1)?.as_str().parse().ok()
}

/// Extracts the identifier range covered by an archive name, such as
/// `PMC150.zip` (single item) or `PMC100-PMC199.zip`. The pair is returned
/// as written; bounds and ordering are left to [`validate_range`].
#[must_use]
pub fn parse_item_range(name: &str) -> Option<(u64, u64)> {
    let caps = ITEM_RANGE_RE.captures(file_name(name))?;
    let start: u64 = caps.get(1)?.as_str().parse().ok()?;
    let end = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => start,
    };
    Some((start, end))
}
