//! badblocks defect-list parsing. The scan prints one bad block number
//! per stdout line; progress chatter goes to stderr and never reaches
//! this parser.

use crate::models::DefectList;
use crate::parsers::{ParseError, ParseResult};

/// Parse badblocks stdout. Empty output is a valid, positive result:
/// the device has no defects.
pub fn parse_badblocks(stdout: &str, block_size: u32) -> ParseResult<DefectList> {
    let mut blocks: Vec<u64> = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<u64>() {
            Ok(n) => blocks.push(n),
            // A non-numeric stdout line means the tool broke off
            // mid-output; keep the offending text for the report.
            Err(_) => return Err(ParseError::Malformed(line.to_string())),
        }
    }

    blocks.sort_unstable();
    blocks.dedup();

    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for &b in &blocks {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == b => *end = b,
            _ => ranges.push((b, b)),
        }
    }

    Ok(DefectList {
        bad_blocks: blocks.len() as u64,
        ranges,
        block_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_is_a_clean_result() {
        let list = parse_badblocks("", 4096).unwrap();
        assert_eq!(list.bad_blocks, 0);
        assert!(list.ranges.is_empty());
    }

    #[test]
    fn consecutive_blocks_collapse_into_ranges() {
        let list = parse_badblocks("100\n101\n102\n4000\n9000\n9001\n", 4096).unwrap();
        assert_eq!(list.bad_blocks, 6);
        assert_eq!(list.ranges, vec![(100, 102), (4000, 4000), (9000, 9001)]);
    }

    #[test]
    fn duplicates_are_collapsed() {
        let list = parse_badblocks("7\n7\n8\n", 1024).unwrap();
        assert_eq!(list.bad_blocks, 2);
        assert_eq!(list.ranges, vec![(7, 8)]);
    }

    #[test]
    fn truncated_output_is_malformed() {
        assert!(matches!(
            parse_badblocks("100\n101\nbadblocks: Input/output er", 4096),
            Err(ParseError::Malformed(_))
        ));
    }
}
