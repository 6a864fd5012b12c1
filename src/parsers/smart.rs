//! smartctl output parsing: device identity, health verdict, the ATA
//! attribute table with an NVMe health-log fallback, and the self-test
//! log used when polling short/extended tests.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{SmartAttribute, SmartData};
use crate::parsers::{ParseError, ParseResult};

/// Attribute ids whose threshold breach is considered predictive of
/// near-term failure.
pub const PRE_FAIL_ATTRIBUTE_IDS: &[u8] = &[5, 10, 187, 196, 197, 198];

/// Attribute ids worth surfacing but not failure-predictive on their own.
pub const WARNING_ATTRIBUTE_IDS: &[u8] = &[1, 7, 188, 199, 200];

const VENDOR_SIGNATURES: &[(&str, &str)] = &[
    ("WDC", "Western Digital"),
    ("WD", "Western Digital"),
    ("Seagate", "Seagate"),
    ("ST", "Seagate"),
    ("TOSHIBA", "Toshiba"),
    ("HGST", "HGST"),
    ("Hitachi", "Hitachi"),
    ("Samsung", "Samsung"),
    ("SanDisk", "SanDisk"),
    ("Kingston", "Kingston"),
    ("Crucial", "Crucial"),
    ("Intel", "Intel"),
];

lazy_static! {
    // ID# ATTRIBUTE_NAME FLAG VALUE WORST THRESH TYPE UPDATED WHEN_FAILED RAW_VALUE
    static ref RE_ATTRIBUTE: Regex = Regex::new(
        r"(?i)^\s*(\d+)\s+(\S+)\s+0x[0-9a-f]+\s+(\d+)\s+(\d+)\s+(\d+)\s+\S+\s+\S+\s+\S+\s+(\d+)"
    )
    .unwrap();
    static ref RE_MODEL: Regex =
        Regex::new(r"(?m)^(?:Device Model|Model Number|Product):\s+(.+)$").unwrap();
    static ref RE_SERIAL: Regex = Regex::new(r"(?m)^Serial Number:\s+(.+)$").unwrap();
    static ref RE_FIRMWARE: Regex = Regex::new(r"(?m)^Firmware Version:\s+(.+)$").unwrap();
    static ref RE_CAPACITY: Regex = Regex::new(
        r"(?m)^(?:User Capacity|Namespace 1 Size/Capacity|Total NVM Capacity):\s+([\d,.]+)"
    )
    .unwrap();
    static ref RE_TEMP_TEXT: Regex =
        Regex::new(r"(?im)^(?:Current Drive )?Temperature:\s*(\d+)\s*(?:Celsius|C)").unwrap();
    static ref RE_NVME_POH: Regex = Regex::new(r"(?m)^Power On Hours:\s+([\d,]+)").unwrap();
    static ref RE_NVME_CYCLES: Regex = Regex::new(r"(?m)^Power Cycles:\s+([\d,]+)").unwrap();
    static ref RE_SELFTEST_REMAINING: Regex =
        Regex::new(r"(\d+)%\s*(?:of test remaining|remaining|completed)").unwrap();
}

fn parse_grouped(s: &str) -> Option<u64> {
    s.replace([',', '.'], "").parse().ok()
}

fn detect_vendor(model: &str) -> String {
    let lower = model.to_lowercase();
    for (sig, vendor) in VENDOR_SIGNATURES {
        if lower.contains(&sig.to_lowercase()) {
            return vendor.to_string();
        }
    }
    String::new()
}

/// Parse a full `smartctl -a` dump.
///
/// Vendor quirks are expected: absent fields stay `None`/empty and the
/// record is returned partial. Only output that carries no recognizable
/// SMART structure at all is a parse failure.
pub fn parse_smart(raw: &str) -> ParseResult<SmartData> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut smart = SmartData::default();

    if let Some(c) = RE_MODEL.captures(raw) {
        smart.model = c[1].trim().to_string();
        smart.vendor = detect_vendor(&smart.model);
    }
    if let Some(c) = RE_SERIAL.captures(raw) {
        smart.serial = c[1].trim().to_string();
    }
    if let Some(c) = RE_FIRMWARE.captures(raw) {
        smart.firmware = c[1].trim().to_string();
    }
    if let Some(c) = RE_CAPACITY.captures(raw) {
        smart.capacity_bytes = parse_grouped(&c[1]);
    }

    smart.smart_supported =
        raw.contains("SMART support is: Available") || raw.contains("SMART/Health");
    smart.smart_enabled =
        raw.contains("SMART support is: Enabled") || raw.contains("SMART/Health");
    if raw.contains("PASSED") {
        smart.health_passed = Some(true);
    } else if raw.contains("FAILED") {
        smart.health_passed = Some(false);
    }

    for line in raw.lines() {
        if let Some(c) = RE_ATTRIBUTE.captures(line) {
            let id: u8 = match c[1].parse() {
                Ok(v) => v,
                Err(_) => continue, // ids above 255 are not ATA attributes
            };
            let value: u64 = c[3].parse().unwrap_or(0);
            let worst: u64 = c[4].parse().unwrap_or(0);
            let threshold: u64 = c[5].parse().unwrap_or(0);
            let raw_value: u64 = c[6].parse().unwrap_or(0);
            smart.attributes.insert(
                id,
                SmartAttribute {
                    id,
                    name: c[2].to_string(),
                    value: value.min(255) as u8,
                    worst: worst.min(255) as u8,
                    threshold: threshold.min(255) as u8,
                    raw: raw_value,
                    pre_fail: PRE_FAIL_ATTRIBUTE_IDS.contains(&id),
                },
            );
        }
    }

    // NVMe health logs have no attribute table.
    if smart.attributes.is_empty() {
        if let Some(c) = RE_NVME_POH.captures(raw) {
            smart.power_on_hours = parse_grouped(&c[1]);
        }
        if let Some(c) = RE_NVME_CYCLES.captures(raw) {
            smart.power_cycles = parse_grouped(&c[1]);
        }
    }

    extract_metrics(&mut smart, raw);

    let recognizable = !smart.attributes.is_empty()
        || smart.smart_supported
        || !smart.model.is_empty()
        || smart.power_on_hours.is_some()
        || smart.temperature_c.is_some();
    if !recognizable {
        let head: String = raw.lines().take(2).collect::<Vec<_>>().join(" | ");
        return Err(ParseError::Unrecognized(head));
    }

    Ok(smart)
}

/// Derived metrics pulled from the attribute table first, free text second.
fn extract_metrics(smart: &mut SmartData, raw: &str) {
    if smart.temperature_c.is_none() {
        // 194 carries the temperature in the low byte on many drives.
        for id in [194u8, 190] {
            let low = smart.attr_raw(id).map(|raw| raw & 0xFF);
            if let Some(low) = low {
                if low > 0 && low < 100 {
                    smart.temperature_c = Some(low as i64);
                    break;
                }
            }
        }
    }
    if smart.temperature_c.is_none() {
        if let Some(c) = RE_TEMP_TEXT.captures(raw) {
            if let Ok(t) = c[1].parse::<i64>() {
                if t > 0 && t < 100 {
                    smart.temperature_c = Some(t);
                }
            }
        }
    }

    if smart.power_on_hours.is_none() {
        smart.power_on_hours = smart.attr_raw(9);
    }
    if smart.power_cycles.is_none() {
        smart.power_cycles = smart.attr_raw(12);
    }
}

/// State of the drive self-test routine as reported by
/// `smartctl -l selftest`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelfTestStatus {
    Passed,
    Failed,
    /// Percent remaining when the log reports it.
    InProgress(Option<u8>),
    Unknown,
}

pub fn parse_self_test_log(raw: &str) -> SelfTestStatus {
    let lower = raw.to_lowercase();
    if lower.contains("in progress") || lower.contains("self-test routine in progress") {
        let remaining = RE_SELFTEST_REMAINING
            .captures(raw)
            .and_then(|c| c[1].parse::<u8>().ok());
        return SelfTestStatus::InProgress(remaining);
    }
    if raw.contains("Completed without error") {
        return SelfTestStatus::Passed;
    }
    if lower.contains("read failure")
        || lower.contains("completed: failed")
        || lower.contains("unknown failure")
    {
        return SelfTestStatus::Failed;
    }
    SelfTestStatus::Unknown
}
