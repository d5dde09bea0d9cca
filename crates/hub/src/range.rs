//! Step-function lookup over half-open numeric ranges.
//!
//! Used to map yesterday's temperature to an evapotranspiration percentage.
//! Configured as a flat token list that alternates `"low-high"` and `"value"`,
//! e.g. `["-50", "25", "50-65", "50", "65-75", "75", "75-", "100"]`. An empty
//! low bound means unbounded below, an empty high bound unbounded above.

use anyhow::{bail, Context, Result};
use std::fmt;

/// Stand-in for +∞ on an open-ended range.
pub const POS_INF: f64 = 1e99;
/// Stand-in for -∞ on an open-ended range.
pub const NEG_INF: f64 = -1e99;

/// `[x1, x2)` mapped to `y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub x1: f64,
    pub x2: f64,
    pub y: f64,
}

/// Ordered list of ranges. Ranges must not overlap; if they do, the first
/// match in configured order wins.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeMapper {
    ranges: Vec<Range>,
}

impl RangeMapper {
    pub fn new(ranges: Vec<Range>) -> Self {
        Self { ranges }
    }

    /// Parse the alternating `"low-high", "value"` token list.
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        if tokens.is_empty() {
            bail!("must have at least one range");
        }

        let mut ranges = Vec::with_capacity(tokens.len() / 2);
        for (i, pair) in tokens.chunks(2).enumerate() {
            let idx = i * 2;
            let range_tok = pair[0].as_ref().trim();
            let Some(value_tok) = pair.get(1).map(|v| v.as_ref().trim()) else {
                bail!("range '{range_tok}' at index {idx} has no value");
            };

            let bounds: Vec<&str> = range_tok.split('-').collect();
            if bounds.len() != 2 {
                bail!("bad range '{range_tok}' at index {idx}");
            }

            let x1 = parse_bound(bounds[0], NEG_INF)
                .with_context(|| format!("bad low value '{}' at index {idx}", bounds[0]))?;
            let x2 = parse_bound(bounds[1], POS_INF)
                .with_context(|| format!("bad high value '{}' at index {idx}", bounds[1]))?;
            let y: f64 = value_tok
                .parse()
                .with_context(|| format!("bad value '{value_tok}' at index {}", idx + 1))?;

            ranges.push(Range { x1, x2, y });
        }

        Ok(Self::new(ranges))
    }

    /// Value of the first range containing `x`, or 0 when none does.
    pub fn get_y(&self, x: f64) -> f64 {
        self.ranges
            .iter()
            .find(|r| x >= r.x1 && x < r.x2)
            .map(|r| r.y)
            .unwrap_or(0.0)
    }
}

fn parse_bound(s: &str, open: f64) -> Result<f64, std::num::ParseFloatError> {
    let s = s.trim();
    if s.is_empty() {
        Ok(open)
    } else {
        s.parse()
    }
}

impl fmt::Display for RangeMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{:.2}-{:.2}, {:.2}]", r.x1, r.x2, r.y)?;
        }
        write!(f, "}}")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
