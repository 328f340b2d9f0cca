//! CPU list ("range text") parsing and formatting
//!
//! The kernel and the kubelet encode integer sets as comma-separated
//! singles or inclusive ranges, e.g. `0-5,34,46-48`. Parsing keeps the
//! textual order and any duplicates; formatting produces the canonical
//! sorted, deduplicated form.

use std::collections::BTreeSet;
use thiserror::Error;

/// Largest number of ids a single range may expand to
pub const MAX_RANGE_SPAN: u32 = 65536;

/// Errors produced while parsing a CPU list
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuSetParseError {
    #[error("invalid cpu list element {0:?}")]
    InvalidNumber(String),

    #[error("malformed cpu range {0:?}")]
    MalformedRange(String),
}

/// Parse a CPU list such as `"1,2-7,9,10-13,14"`
///
/// Surrounding newlines are ignored. An empty list yields an empty vector.
/// A range whose low bound exceeds its high bound expands to nothing; one
/// covering more than [`MAX_RANGE_SPAN`] ids is rejected as malformed.
pub fn parse_cpu_list(s: &str) -> Result<Vec<u32>, CpuSetParseError> {
    let s = s.trim_matches('\n');
    if s.is_empty() {
        return Ok(Vec::new());
    }

    let mut result = Vec::new();
    for token in s.split(',') {
        let bounds: Vec<&str> = token.split('-').collect();
        match bounds.as_slice() {
            [single] => result.push(parse_element(single, token)?),
            [start, end] => {
                let start = parse_range_bound(start, token)?;
                let end = parse_range_bound(end, token)?;
                if end.saturating_sub(start) >= MAX_RANGE_SPAN {
                    return Err(CpuSetParseError::MalformedRange(token.to_string()));
                }
                result.extend(start..=end);
            }
            _ => return Err(CpuSetParseError::MalformedRange(token.to_string())),
        }
    }

    Ok(result)
}

fn parse_element(s: &str, token: &str) -> Result<u32, CpuSetParseError> {
    s.parse()
        .map_err(|_| CpuSetParseError::InvalidNumber(token.to_string()))
}

fn parse_range_bound(s: &str, token: &str) -> Result<u32, CpuSetParseError> {
    s.parse()
        .map_err(|_| CpuSetParseError::MalformedRange(token.to_string()))
}

/// Render a set of CPU ids in canonical form, e.g. `0-3,5,7-8`
pub fn format_cpu_list<'a, I>(cpus: I) -> String
where
    I: IntoIterator<Item = &'a u32>,
{
    let sorted: BTreeSet<u32> = cpus.into_iter().copied().collect();

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for cpu in sorted {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == cpu => *end = cpu,
            _ => ranges.push((cpu, cpu)),
        }
    }

    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<u32>::new());
        assert_eq!(parse_cpu_list("\n").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_parse_single() {
        assert_eq!(parse_cpu_list("3").unwrap(), vec![3]);
        assert_eq!(parse_cpu_list("3\n").unwrap(), vec![3]);
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_mixed() {
        assert_eq!(
            parse_cpu_list("0-2,5,7-8").unwrap(),
            vec![0, 1, 2, 5, 7, 8]
        );
        assert_eq!(
            parse_cpu_list("0-5,34,46-48\n").unwrap(),
            vec![0, 1, 2, 3, 4, 5, 34, 46, 47, 48]
        );
    }

    #[test]
    fn test_parse_keeps_order_and_duplicates() {
        assert_eq!(parse_cpu_list("5,1-2,2").unwrap(), vec![5, 1, 2, 2]);
    }

    #[test]
    fn test_parse_inverted_range_is_empty() {
        assert_eq!(parse_cpu_list("5-3").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_parse_range_span_limit() {
        assert_eq!(parse_cpu_list("0-65535").unwrap().len(), 65536);
        assert_eq!(
            parse_cpu_list("0-4294967295"),
            Err(CpuSetParseError::MalformedRange("0-4294967295".to_string()))
        );
        assert_eq!(
            parse_cpu_list("2,100-65636"),
            Err(CpuSetParseError::MalformedRange("100-65636".to_string()))
        );
    }

    #[test]
    fn test_parse_non_numeric_range() {
        assert_eq!(
            parse_cpu_list("a-b"),
            Err(CpuSetParseError::MalformedRange("a-b".to_string()))
        );
    }

    #[test]
    fn test_parse_three_part_range() {
        assert_eq!(
            parse_cpu_list("1-2-3"),
            Err(CpuSetParseError::MalformedRange("1-2-3".to_string()))
        );
    }

    #[test]
    fn test_parse_invalid_element() {
        assert!(matches!(
            parse_cpu_list("1,x"),
            Err(CpuSetParseError::InvalidNumber(_))
        ));
        assert!(parse_cpu_list("1,,2").is_err());
        assert!(parse_cpu_list("-1").is_err());
    }

    #[test]
    fn test_format_canonical() {
        assert_eq!(format_cpu_list(&[7, 0, 1, 2, 3, 5, 8, 3]), "0-3,5,7-8");
        assert_eq!(format_cpu_list(&[4]), "4");
        assert_eq!(format_cpu_list(&[]), "");
    }
}
