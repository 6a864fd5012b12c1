//! Capacity and HPA probe parsing: `hdparm -N` for the cheap addressable
//! sector query, `f3probe` for the destructive full-capacity verdict.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::CapacityProbe;
use crate::parsers::{ParseError, ParseResult};

lazy_static! {
    // Modern hdparm: " max sectors   = 234441648/234441648, HPA is disabled"
    static ref RE_HDPARM_PAIR: Regex =
        Regex::new(r"max sectors\s*=\s*(\d+)/(\d+)").unwrap();
    // Historic two-line form.
    static ref RE_HDPARM_NATIVE: Regex =
        Regex::new(r"(?i)native\s*max sectors:\s*(\d+)").unwrap();
    static ref RE_HDPARM_CURRENT: Regex =
        Regex::new(r"(?i)current\s*max sectors:\s*(\d+)").unwrap();

    // f3probe report lines.
    static ref RE_F3_USABLE: Regex =
        Regex::new(r"\*Usable\* size:\s*([0-9.]+)\s*(\w+)\s*\((\d+)\s*blocks\)").unwrap();
    static ref RE_F3_ANNOUNCED: Regex =
        Regex::new(r"Announced size:\s*([0-9.]+)\s*(\w+)\s*\((\d+)\s*blocks\)").unwrap();
    static ref RE_F3_BLOCK_SIZE: Regex =
        Regex::new(r"Physical block size:\s*([0-9.]+)\s*Byte").unwrap();
    static ref RE_F3_LAST_SEC: Regex = Regex::new(r"--last-sec=(\d+)").unwrap();
}

/// Parse `hdparm -N` output into the sector-count pair.
pub fn parse_hdparm_hpa(raw: &str) -> ParseResult<CapacityProbe> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut probe = CapacityProbe::default();
    if let Some(c) = RE_HDPARM_PAIR.captures(raw) {
        probe.current_max_sectors = c[1].parse().ok();
        probe.native_max_sectors = c[2].parse().ok();
    } else {
        if let Some(c) = RE_HDPARM_NATIVE.captures(raw) {
            probe.native_max_sectors = c[1].parse().ok();
        }
        if let Some(c) = RE_HDPARM_CURRENT.captures(raw) {
            probe.current_max_sectors = c[1].parse().ok();
        }
    }

    if probe.native_max_sectors.is_none() && probe.current_max_sectors.is_none() {
        let head: String = raw.lines().take(2).collect::<Vec<_>>().join(" | ");
        return Err(ParseError::Unrecognized(head));
    }
    Ok(probe)
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    match unit.to_ascii_uppercase().as_str() {
        "BYTE" | "BYTES" | "B" => Some(1),
        "KB" => Some(1 << 10),
        "MB" => Some(1 << 20),
        "GB" => Some(1 << 30),
        "TB" => Some(1 << 40),
        _ => None,
    }
}

fn size_to_bytes(value: &str, unit: &str) -> Option<u64> {
    let v: f64 = value.parse().ok()?;
    unit_multiplier(unit).map(|m| (v * m as f64) as u64)
}

/// Parse an `f3probe` run. The exit code is part of the contract: the
/// probe reports its verdict, not a fault, so both 0 (genuine) and the
/// documented fake exit are valid results here.
pub fn parse_f3probe(raw: &str, exit_code: i32) -> ParseResult<CapacityProbe> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut probe = CapacityProbe::default();
    let lower = raw.to_lowercase();

    if lower.contains("good news") && lower.contains("real thing") {
        probe.fake_reported = Some(false);
    }
    if lower.contains("bad news") || lower.contains("is fake") || lower.contains("a fake") {
        probe.fake_reported = Some(true);
    }

    if let Some(c) = RE_F3_USABLE.captures(raw) {
        probe.usable_bytes = size_to_bytes(&c[1], &c[2]);
        probe.usable_blocks = c[3].parse().ok();
    }
    if let Some(c) = RE_F3_ANNOUNCED.captures(raw) {
        probe.announced_bytes = size_to_bytes(&c[1], &c[2]);
        probe.announced_blocks = c[3].parse().ok();
    }
    if let Some(c) = RE_F3_BLOCK_SIZE.captures(raw) {
        probe.physical_block_size = c[1].parse::<f64>().ok().map(|v| v as u32);
    }
    if let Some(c) = RE_F3_LAST_SEC.captures(raw) {
        probe.last_usable_sector = c[1].parse().ok();
    }
    if probe.last_usable_sector.is_none() {
        // f3fix convention: last sector = usable blocks - 1.
        probe.last_usable_sector = probe.usable_blocks.map(|b| b.saturating_sub(1));
    }

    if probe.fake_reported.is_none() {
        // Text was inconclusive; fall back to the exit code.
        probe.fake_reported = match exit_code {
            0 if probe.usable_blocks.is_some() => Some(false),
            1 => Some(true),
            _ => None,
        };
    }

    if probe.fake_reported.is_none() && probe.announced_blocks.is_none() {
        let head: String = raw.lines().take(2).collect::<Vec<_>>().join(" | ");
        return Err(ParseError::Unrecognized(head));
    }
    Ok(probe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hdparm_modern_pair() {
        let raw = "/dev/sdb:\n max sectors   = 468862128/468862128, HPA is disabled\n";
        let probe = parse_hdparm_hpa(raw).unwrap();
        assert_eq!(probe.current_max_sectors, Some(468_862_128));
        assert_eq!(probe.native_max_sectors, Some(468_862_128));
        assert_eq!(probe.hpa_hidden_sectors(), None);
    }

    #[test]
    fn hdparm_hpa_enabled_shows_hidden_sectors() {
        let raw = "/dev/sdb:\n max sectors   = 234441648/468862128, HPA is enabled\n";
        let probe = parse_hdparm_hpa(raw).unwrap();
        assert_eq!(probe.hpa_hidden_sectors(), Some(234_420_480));
    }

    #[test]
    fn hdparm_legacy_two_line_form() {
        let raw = " native  max sectors: 976773168\n current max sectors: 976773168\n";
        let probe = parse_hdparm_hpa(raw).unwrap();
        assert_eq!(probe.native_max_sectors, Some(976_773_168));
    }

    #[test]
    fn hdparm_garbage_is_unrecognized() {
        assert!(matches!(
            parse_hdparm_hpa("SG_IO: bad/missing sense data\n"),
            Err(ParseError::Unrecognized(_))
        ));
    }

    #[test]
    fn f3probe_fake_report() {
        let raw = "\
Bad news: The device `/dev/sdc' is a counterfeit of type limbo

Device geometry:
                 *Usable* size: 7.88 GB (16526168 blocks)
                Announced size: 256.00 GB (536870912 blocks)
                        Module: 256.00 GB (2^38 Bytes)
        Physical block size: 512.00 Byte (2^9 Bytes)

Probe time: 1'14\"
You can fix it with: f3fix --last-sec=16526167 /dev/sdc
";
        let probe = parse_f3probe(raw, 1).unwrap();
        assert_eq!(probe.fake_reported, Some(true));
        assert_eq!(probe.usable_blocks, Some(16_526_168));
        assert_eq!(probe.announced_blocks, Some(536_870_912));
        assert_eq!(probe.physical_block_size, Some(512));
        assert_eq!(probe.last_usable_sector, Some(16_526_167));
        assert!(probe.usable_bytes.unwrap() < probe.announced_bytes.unwrap());
    }

    #[test]
    fn f3probe_genuine_report() {
        let raw = "Good news: The device `/dev/sdb' is the real thing\n\n\
                 *Usable* size: 14.84 GB (31116288 blocks)\n\
                Announced size: 14.84 GB (31116288 blocks)\n";
        let probe = parse_f3probe(raw, 0).unwrap();
        assert_eq!(probe.fake_reported, Some(false));
        assert_eq!(probe.last_usable_sector, Some(31_116_287));
    }

    #[test]
    fn f3probe_inconclusive_is_unrecognized() {
        assert!(parse_f3probe("f3probe: cannot open device", 2).is_err());
    }
}
