//! Frame range expressions.
//!
//! `expand("1-5, 20, 50-55x2")` gives `[1, 2, 3, 4, 5, 20, 50, 52, 54]` and
//! `collapse` turns a list back into `"1-5, 20, 50, 52, 54"`.

use std::collections::BTreeSet;

use crate::error::{QueueError, Result};

/// Placeholder used for jobs and tasks whose frame range is not known.
pub const UNKNOWN: &str = "Unknown";

/// Largest number of frames a single expression may expand to.
pub const MAX_FRAMES: usize = 1_000_000;

pub fn is_unknown(expr: &str) -> bool {
    let expr = expr.trim();
    expr.is_empty() || expr == UNKNOWN
}

/// Expand a range expression into a sorted, duplicate-free list of frames.
///
/// Groups are separated by commas and/or whitespace. Each group is a single
/// frame (`10`), a range (`1-10`, also reversed `10-1`) or a stepped range
/// (`1-10x2`).
pub fn expand(expr: &str) -> Result<Vec<i64>> {
    let groups: Vec<&str> = expr
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|g| !g.is_empty())
        .collect();

    if groups.is_empty() {
        return Err(QueueError::InvalidFrameRange("no frame range specified".to_string()));
    }

    let mut frames = BTreeSet::new();
    for group in groups {
        if let Ok(frame) = group.parse::<i64>() {
            frames.insert(frame);
            continue;
        }
        let (first, last, step) = parse_sequence(group)
            .ok_or_else(|| QueueError::InvalidFrameRange(expr.to_string()))?;
        let span = first.abs_diff(last) / step as u64 + 1;
        if span.saturating_add(frames.len() as u64) > MAX_FRAMES as u64 {
            return Err(QueueError::InvalidFrameRange(format!(
                "{} expands to more than {} frames",
                expr, MAX_FRAMES
            )));
        }
        if first <= last {
            frames.extend((first..=last).step_by(step));
        } else {
            frames.extend((last..=first).rev().step_by(step));
        }
    }

    Ok(frames.into_iter().collect())
}

fn parse_sequence(group: &str) -> Option<(i64, i64, usize)> {
    let (first, rest) = group.split_once('-')?;
    let (last, step) = match rest.split_once('x') {
        Some((last, step)) => (last, step.parse::<usize>().ok()?),
        None => (rest, 1),
    };
    if step == 0 || !is_digits(first) || !is_digits(last) {
        return None;
    }
    Some((first.parse().ok()?, last.parse().ok()?, step))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Collapse frames into the shortest expression of contiguous runs.
pub fn collapse(frames: &[i64]) -> String {
    let sorted: BTreeSet<i64> = frames.iter().copied().collect();

    let mut runs: Vec<(i64, i64)> = Vec::new();
    for frame in sorted {
        match runs.last_mut() {
            Some((_, last)) if *last + 1 == frame => *last = frame,
            _ => runs.push((frame, frame)),
        }
    }

    runs.iter()
        .map(|(first, last)| {
            if first == last {
                first.to_string()
            } else {
                format!("{}-{}", first, last)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Split a frame list into consecutive chunks of at most `size` frames.
pub fn chunk(frames: &[i64], size: usize) -> Vec<Vec<i64>> {
    frames.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

/// Number of frames in an expression, or `None` when the range is unknown.
pub fn frame_count(expr: &str) -> Option<usize> {
    if is_unknown(expr) {
        return None;
    }
    expand(expr).ok().map(|frames| frames.len())
}

/// First and last frame of an expression.
pub fn bounds(expr: &str) -> Option<(i64, i64)> {
    if is_unknown(expr) {
        return None;
    }
    let frames = expand(expr).ok()?;
    Some((*frames.first()?, *frames.last()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_mixed_groups() {
        let frames = expand("1-5, 20, 24, 50-55x2, 1001-1002").unwrap();
        assert_eq!(frames, vec![1, 2, 3, 4, 5, 20, 24, 50, 52, 54, 1001, 1002]);
    }

    #[test]
    fn test_expand_removes_duplicates_and_sorts() {
        assert_eq!(expand("10 3 3-5 4").unwrap(), vec![3, 4, 5, 10]);
    }

    #[test]
    fn test_expand_reversed_range() {
        assert_eq!(expand("5-1x2").unwrap(), vec![1, 3, 5]);
    }

    #[test]
    fn test_expand_rejects_garbage() {
        assert!(expand("").is_err());
        assert!(expand("1-").is_err());
        assert!(expand("a-b").is_err());
        assert!(expand("1-10x0").is_err());
    }

    #[test]
    fn test_expand_refuses_huge_ranges() {
        assert!(matches!(expand("1-10000000000"), Err(QueueError::InvalidFrameRange(_))));
        assert!(matches!(expand("1-600000, 700000-1400000"), Err(QueueError::InvalidFrameRange(_))));
        assert_eq!(frame_count("1-10000000000"), None);
        assert_eq!(expand("1-10000000000x100000000").unwrap().len(), 100);
    }

    #[test]
    fn test_collapse() {
        assert_eq!(collapse(&[1, 2, 3, 4, 5, 20, 24, 1001, 1002]), "1-5, 20, 24, 1001-1002");
        assert_eq!(collapse(&[7]), "7");
        assert_eq!(collapse(&[]), "");
        assert_eq!(collapse(&[3, 1, 2, 2]), "1-3");
    }

    #[test]
    fn test_chunk_into_task_ranges() {
        let frames = expand("1-10").unwrap();
        let tasks: Vec<String> = chunk(&frames, 4).iter().map(|c| collapse(c)).collect();
        assert_eq!(tasks, vec!["1-4", "5-8", "9-10"]);
    }

    #[test]
    fn test_unknown_frames() {
        assert!(is_unknown("Unknown"));
        assert_eq!(frame_count(UNKNOWN), None);
        assert_eq!(frame_count("1-10x3"), Some(4));
        assert_eq!(bounds("20, 1-3"), Some((1, 20)));
    }
}
