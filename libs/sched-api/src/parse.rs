//! Parsers for range strings and schedtag configs.

use std::collections::BTreeSet;

use crate::error::ParseError;
use crate::types::{SchedtagConfig, SchedtagStrategy};

/// Most values a range string may expand to.
pub const MAX_RANGE_VALUES: usize = 65536;

/// Parse a comma separated list of integers and inclusive ranges.
///
/// Empty fragments are skipped, reversed ranges (`"11-7"`) are accepted and
/// the result is sorted and deduplicated. A fragment that is neither an
/// integer nor a complete `a-b` range is an error, as is a string expanding
/// to more than [`MAX_RANGE_VALUES`] values.
pub fn parse_range(input: &str) -> Result<Vec<i64>, ParseError> {
    let mut values = BTreeSet::new();

    for fragment in input.split(',') {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }

        let invalid = || ParseError::InvalidRange {
            fragment: fragment.to_string(),
        };

        match fragment.split_once('-') {
            Some((start, end)) => {
                let start: i64 = start.trim().parse().map_err(|_| invalid())?;
                let end: i64 = end.trim().parse().map_err(|_| invalid())?;
                let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
                if hi.abs_diff(lo) >= MAX_RANGE_VALUES as u64 {
                    return Err(ParseError::RangeTooLarge {
                        fragment: fragment.to_string(),
                        limit: MAX_RANGE_VALUES,
                    });
                }
                values.extend(lo..=hi);
            }
            None => {
                let value: i64 = fragment.parse().map_err(|_| invalid())?;
                values.insert(value);
            }
        }

        if values.len() > MAX_RANGE_VALUES {
            return Err(ParseError::RangeTooLarge {
                fragment: fragment.to_string(),
                limit: MAX_RANGE_VALUES,
            });
        }
    }

    Ok(values.into_iter().collect())
}

/// Parse a schedtag config of the form `<id>:<strategy>`.
pub fn parse_schedtag_config(input: &str) -> Result<SchedtagConfig, ParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParseError::EmptySchedtag);
    }

    let Some((id, strategy)) = input.split_once(':') else {
        return Err(ParseError::InvalidSchedtag(input.to_string()));
    };

    let id = id.trim();
    if id.is_empty() {
        return Err(ParseError::InvalidSchedtag(input.to_string()));
    }

    let strategy: SchedtagStrategy = strategy.trim().parse()?;

    Ok(SchedtagConfig {
        id: id.to_string(),
        strategy,
    })
}
