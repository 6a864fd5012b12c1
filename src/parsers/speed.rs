//! Speed-sample parsing: dd transfer summaries to MB/s figures, plus
//! the outlier-trimmed aggregation used by the sampled-read and
//! sequential speed tests.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{AccessPattern, SpeedSample};
use crate::parsers::{ParseError, ParseResult};

lazy_static! {
    // "104857600 bytes (105 MB, 100 MiB) copied, 0.894 s, 117 MB/s"
    static ref RE_DD_SPEED: Regex =
        Regex::new(r"([\d.,]+)\s*(kB|KB|MB|GB|MiB|GiB)/s").unwrap();
}

/// Extract the throughput figure from one dd transfer summary.
pub fn parse_dd_speed(raw: &str) -> ParseResult<f64> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let caps = RE_DD_SPEED
        .captures_iter(raw)
        .last()
        .ok_or_else(|| ParseError::Unrecognized(raw.lines().last().unwrap_or("").to_string()))?;

    let value: f64 = caps[1]
        .replace(',', ".")
        .parse()
        .map_err(|_| ParseError::Malformed(caps[0].to_string()))?;

    let mbps = match &caps[2] {
        "kB" | "KB" => value / 1000.0,
        "MB" => value,
        "GB" => value * 1000.0,
        "MiB" => value * 1.048_576,
        "GiB" => value * 1073.741_824,
        _ => value,
    };
    Ok(mbps)
}

/// Fold per-sample throughput into one figure, excluding device hiccups:
/// samples outside [median/2, median*2] are dropped before averaging.
pub fn aggregate_samples(samples: &[f64], pattern: AccessPattern, errors: u32) -> SpeedSample {
    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let (kept, excluded): (Vec<f64>, usize) = if sorted.len() >= 3 {
        let median = sorted[sorted.len() / 2];
        let kept: Vec<f64> = sorted
            .iter()
            .copied()
            .filter(|&s| s >= median / 2.0 && s <= median * 2.0)
            .collect();
        let excluded = sorted.len() - kept.len();
        (kept, excluded)
    } else {
        (sorted.clone(), 0)
    };

    let mean = if kept.is_empty() {
        0.0
    } else {
        kept.iter().sum::<f64>() / kept.len() as f64
    };

    SpeedSample {
        pattern,
        samples_mbps: samples.to_vec(),
        mean_mbps: mean,
        excluded: excluded as u32,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gnu_dd_summary() {
        let raw = "100+0 records in\n100+0 records out\n\
                   104857600 bytes (105 MB, 100 MiB) copied, 0.894 s, 117 MB/s\n";
        let mbps = parse_dd_speed(raw).unwrap();
        assert!((mbps - 117.0).abs() < f64::EPSILON);
    }

    #[test]
    fn gb_scale_converts() {
        let mbps = parse_dd_speed("1073741824 bytes copied, 0.5 s, 2.1 GB/s").unwrap();
        assert!((mbps - 2100.0).abs() < 0.01);
    }

    #[test]
    fn output_without_rate_is_unrecognized() {
        assert!(matches!(
            parse_dd_speed("dd: failed to open '/dev/sdz': No such file"),
            Err(ParseError::Unrecognized(_))
        ));
    }

    #[test]
    fn aggregation_drops_hiccups() {
        // One stall far below the median must not drag the mean down.
        let sample = aggregate_samples(
            &[110.0, 115.0, 3.0, 120.0, 118.0],
            AccessPattern::Sequential,
            0,
        );
        assert_eq!(sample.excluded, 1);
        assert!(sample.mean_mbps > 100.0);
        assert_eq!(sample.samples_mbps.len(), 5);
    }

    #[test]
    fn small_sample_sets_are_kept_whole() {
        let sample = aggregate_samples(&[50.0, 200.0], AccessPattern::Random, 1);
        assert_eq!(sample.excluded, 0);
        assert!((sample.mean_mbps - 125.0).abs() < f64::EPSILON);
        assert_eq!(sample.errors, 1);
    }
}
