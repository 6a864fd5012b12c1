//! Health Scoring Engine. Deterministic and pure: the same set of
//! normalized results always folds to the same assessment, with no
//! accumulation across calls.

use crate::config::ScoringConfig;
use crate::models::{
    AccessPattern, DefectList, Device, HealthAssessment, HealthLevel, NormalizedResult,
    RiskFactor, Severity, SmartData, SpeedSample,
};

/// Weighted penalty against the running score. `fatal` additionally
/// clamps the final score into the critical band.
struct Finding {
    factor: RiskFactor,
    fatal: bool,
}

fn finding(
    attribute_id: Option<u8>,
    severity: Severity,
    penalty: u32,
    fatal: bool,
    description: String,
) -> Finding {
    Finding {
        factor: RiskFactor {
            attribute_id,
            severity,
            description,
            penalty,
        },
        fatal,
    }
}

/// Compute the health assessment for one device from every normalized
/// result currently known for it.
pub fn calculate_health(
    device: &Device,
    results: &[NormalizedResult],
    config: &ScoringConfig,
) -> HealthAssessment {
    let mut smart: Option<&SmartData> = None;
    let mut defects: Option<&DefectList> = None;
    let mut seq_speed: Option<&SpeedSample> = None;
    let mut any_speed: Option<&SpeedSample> = None;

    for result in results {
        match result {
            NormalizedResult::SmartAttributes(s) => smart = Some(s),
            NormalizedResult::DefectList(d) => defects = Some(d),
            NormalizedResult::SpeedSample(s) => {
                any_speed = Some(s);
                if s.pattern == AccessPattern::Sequential {
                    seq_speed = Some(s);
                }
            }
            NormalizedResult::CapacityProbe(_) => {} // detector territory
        }
    }
    let speed = seq_speed.or(any_speed);

    if smart.is_none() && defects.is_none() && speed.is_none() {
        return HealthAssessment {
            device_id: device.id.clone(),
            score: 100,
            level: HealthLevel::Unknown,
            risk_factors: Vec::new(),
            recommendations: vec!["No diagnostic data collected yet.".to_string()],
        };
    }

    let mut findings: Vec<Finding> = Vec::new();
    let mut recommendations: Vec<String> = Vec::new();

    if let Some(smart) = smart {
        score_smart(smart, device, config, &mut findings, &mut recommendations);
    }
    if let Some(defects) = defects {
        score_defects(defects, device, config, &mut findings, &mut recommendations);
    }
    if let Some(speed) = speed {
        score_speed(speed, device, config, &mut findings, &mut recommendations);
    }

    let penalty_sum: i64 = findings.iter().map(|f| f.factor.penalty as i64).sum();
    let mut score = (100 - penalty_sum).clamp(0, 100) as u8;
    if findings.iter().any(|f| f.fatal) {
        score = score.min(config.critical_band_ceiling);
    }

    // Fatal factors first, then by severity and weight; tie-break on the
    // description so the ordering is total.
    findings.sort_by(|a, b| {
        b.fatal
            .cmp(&a.fatal)
            .then(b.factor.severity.cmp(&a.factor.severity))
            .then(b.factor.penalty.cmp(&a.factor.penalty))
            .then(a.factor.description.cmp(&b.factor.description))
    });

    if recommendations.is_empty() {
        recommendations.push("Device looks healthy. Keep monitoring periodically.".to_string());
    }

    HealthAssessment {
        device_id: device.id.clone(),
        score,
        level: level_for(score),
        risk_factors: findings.into_iter().map(|f| f.factor).collect(),
        recommendations,
    }
}

fn level_for(score: u8) -> HealthLevel {
    match score {
        90..=100 => HealthLevel::Excellent,
        75..=89 => HealthLevel::Good,
        50..=74 => HealthLevel::Fair,
        25..=49 => HealthLevel::Poor,
        _ => HealthLevel::Critical,
    }
}

/// Penalty for a counter-style pre-fail attribute: the larger of the
/// usage tiers (>100 / >10 / >0 of the weight) and, when the vendor
/// threshold is breached by the raw count, a severity-scaled multiple
/// of the weight.
fn counter_penalty(raw: u64, threshold: u8, weight: u32) -> u32 {
    let tier = if raw > 100 {
        weight
    } else if raw > 10 {
        (weight as f64 * 0.7) as u32
    } else if raw > 0 {
        (weight as f64 * 0.3) as u32
    } else {
        0
    };

    let over_threshold = if threshold > 0 && raw > threshold as u64 {
        let ratio = (raw as f64 / threshold as f64).clamp(1.0, 2.0);
        (weight as f64 * ratio) as u32
    } else {
        0
    };

    tier.max(over_threshold)
}

fn score_smart(
    smart: &SmartData,
    device: &Device,
    config: &ScoringConfig,
    findings: &mut Vec<Finding>,
    recommendations: &mut Vec<String>,
) {
    let w = &config.weights;

    if let Some(temp) = smart.temperature_c {
        score_temperature(
            temp,
            config.temp_safe_max(device.class),
            findings,
            recommendations,
        );
    }

    if smart.health_passed == Some(false) {
        findings.push(finding(
            None,
            Severity::Critical,
            50,
            true,
            "SMART overall health self-assessment FAILED".to_string(),
        ));
        recommendations
            .push("Back up immediately: the drive reports imminent failure.".to_string());
    }

    if let Some(n) = smart.reallocated_sectors() {
        if n > 0 {
            let threshold = smart.attr(5).map(|a| a.threshold).unwrap_or(0);
            let penalty = counter_penalty(n, threshold, w.reallocated);
            let severity = if n > 100 { Severity::Critical } else { Severity::Warning };
            findings.push(finding(
                Some(5),
                severity,
                penalty,
                false,
                format!("Reallocated sectors: {}", n),
            ));
            if n > 100 {
                recommendations.push(format!(
                    "High reallocated sector count ({}). Consider replacing the drive.",
                    n
                ));
            } else if n > 10 {
                recommendations.push(format!(
                    "Reallocated sectors detected ({}). Monitor regularly.",
                    n
                ));
            }
        }
    }

    if let Some(n) = smart.pending_sectors() {
        if n > 0 {
            let penalty = if n > 10 {
                w.pending
            } else {
                (w.pending as f64 * 0.5) as u32
            };
            let severity = if n > 10 { Severity::Critical } else { Severity::Warning };
            findings.push(finding(
                Some(197),
                severity,
                penalty,
                false,
                format!("Pending sectors: {}", n),
            ));
            if n > 10 {
                recommendations.push(format!(
                    "{} pending sectors. Run a surface scan or an extended self-test.",
                    n
                ));
            }
        }
    }

    // Any uncorrectable sector is a fatal indicator: the score lands in
    // the critical band no matter what the weighted sum says.
    if let Some(n) = smart.uncorrectable_sectors() {
        if n > 0 {
            let penalty = (w.uncorrectable as f64 * (n as f64 / 5.0).min(1.0)) as u32;
            findings.push(finding(
                Some(198),
                Severity::Critical,
                penalty.max(w.uncorrectable / 5),
                true,
                format!("Uncorrectable sectors: {}", n),
            ));
            recommendations
                .push("Uncorrectable sectors indicate permanent damage. Back up now.".to_string());
        }
    }

    // Remaining known pre-fail counters without a dedicated weight.
    for id in [10u8, 187, 196] {
        if let Some(attr) = smart.attr(id) {
            if attr.raw > 0 {
                let weight = if id == 196 { w.reallocation_events } else { w.generic_pre_fail };
                let penalty = counter_penalty(attr.raw, attr.threshold, weight);
                findings.push(finding(
                    Some(id),
                    Severity::Warning,
                    penalty,
                    false,
                    format!("{}: {}", attr.name, attr.raw),
                ));
            }
        }
    }

    // An attribute normalized value at or below its vendor threshold is
    // the drive's own failure prediction.
    for attr in smart.attributes.values() {
        if attr.pre_fail && attr.threshold > 0 && attr.value <= attr.threshold {
            findings.push(finding(
                Some(attr.id),
                Severity::Critical,
                w.generic_pre_fail,
                true,
                format!(
                    "{} normalized value {} at/below vendor threshold {}",
                    attr.name, attr.value, attr.threshold
                ),
            ));
        }
    }

    if let Some(n) = smart.crc_errors() {
        if n > 0 {
            let penalty = if n > 100 {
                w.crc_errors
            } else {
                (w.crc_errors as f64 * 0.5) as u32
            };
            findings.push(finding(
                Some(199),
                Severity::Warning,
                penalty,
                false,
                format!("UDMA CRC errors: {}", n),
            ));
            if n > 100 {
                recommendations
                    .push(format!("Many CRC errors ({}). Check the SATA/USB cable.", n));
            }
        }
    }

    if let Some(poh) = smart.power_on_hours {
        let (penalty, note) = if poh > config.poh_critical {
            (w.power_on_hours, true)
        } else if poh > config.poh_concern {
            ((w.power_on_hours as f64 * 0.6) as u32, false)
        } else if poh > config.poh_warning {
            ((w.power_on_hours as f64 * 0.3) as u32, false)
        } else {
            (0, false)
        };
        if penalty > 0 {
            findings.push(finding(
                Some(9),
                Severity::Info,
                penalty,
                false,
                format!("Power-on hours: {}", poh),
            ));
            if note {
                recommendations.push(format!(
                    "Drive has {} power-on hours. Consider preventive replacement.",
                    poh
                ));
            }
        }
    }

    if smart.self_test_passed == Some(false) {
        findings.push(finding(
            None,
            Severity::Critical,
            30,
            false,
            "SMART self-test reported a failure".to_string(),
        ));
    }
}

fn score_temperature(
    temp: i64,
    safe_max: i64,
    findings: &mut Vec<Finding>,
    recommendations: &mut Vec<String>,
) {
    let (penalty, severity) = if temp > safe_max + 20 {
        (15, Severity::Critical)
    } else if temp > safe_max + 10 {
        (10, Severity::Warning)
    } else if temp > safe_max {
        (5, Severity::Info)
    } else {
        return;
    };
    findings.push(finding(
        Some(194),
        severity,
        penalty,
        false,
        format!("Temperature: {}\u{b0}C (safe up to {}\u{b0}C)", temp, safe_max),
    ));
    if severity == Severity::Critical {
        recommendations.push(format!("Critical temperature {}\u{b0}C. Improve cooling now.", temp));
    } else if severity == Severity::Warning {
        recommendations.push(format!("High temperature {}\u{b0}C. Check airflow.", temp));
    }
}

fn score_defects(
    defects: &DefectList,
    device: &Device,
    config: &ScoringConfig,
    findings: &mut Vec<Finding>,
    recommendations: &mut Vec<String>,
) {
    if defects.bad_blocks == 0 {
        return;
    }
    // Base penalty plus a density-scaled term, capped.
    let base = 10.0 + 6.0 * (defects.bad_blocks as f64).log10();
    let penalty = (base as u32).min(config.defect_penalty_cap);
    let defect_bytes = defects.bad_blocks * defects.block_size as u64;
    let density_ppm = if device.capacity_bytes > 0 {
        defect_bytes as f64 * 1_000_000.0 / device.capacity_bytes as f64
    } else {
        0.0
    };
    let severity = if defects.bad_blocks > 100 {
        Severity::Critical
    } else {
        Severity::Warning
    };
    findings.push(finding(
        None,
        severity,
        penalty,
        false,
        format!(
            "{} bad blocks ({:.2} ppm of capacity)",
            defects.bad_blocks, density_ppm
        ),
    ));
    recommendations.push(format!(
        "Surface scan found {} bad blocks. Do not store important data without redundancy.",
        defects.bad_blocks
    ));
}

fn score_speed(
    speed: &SpeedSample,
    device: &Device,
    config: &ScoringConfig,
    findings: &mut Vec<Finding>,
    recommendations: &mut Vec<String>,
) {
    if speed.errors > 0 {
        findings.push(finding(
            None,
            Severity::Critical,
            30,
            false,
            format!("{} read errors during sampled reads", speed.errors),
        ));
        recommendations
            .push("Read errors during sampling; run a full surface scan.".to_string());
    }

    if speed.mean_mbps <= 0.0 {
        return;
    }
    let baseline = config.speed_baseline_mbps(device.class);
    let ratio = speed.mean_mbps / baseline;
    if ratio < 0.5 {
        let penalty = (((0.5 - ratio) / 0.5) * config.speed_penalty_cap as f64).round() as u32;
        findings.push(finding(
            None,
            Severity::Warning,
            penalty.max(1),
            false,
            format!(
                "Read speed {:.1} MB/s far below class baseline {:.0} MB/s",
                speed.mean_mbps, baseline
            ),
        ));
        recommendations.push("Sequential read speed is unusually low for this device class.".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceClass, SmartAttribute};
    use std::collections::BTreeMap;

    fn device() -> Device {
        Device {
            id: "sdb".to_string(),
            path: "/dev/sdb".to_string(),
            capacity_bytes: 1_000_000_000_000,
            bus: "SATA".to_string(),
            class: DeviceClass::Hdd,
            model: "Test Disk".to_string(),
            serial: "XYZ".to_string(),
            mounted: false,
        }
    }

    fn smart_with(attrs: &[(u8, &str, u8, u8, u64, bool)]) -> SmartData {
        let mut table = BTreeMap::new();
        for &(id, name, value, threshold, raw, pre_fail) in attrs {
            table.insert(
                id,
                SmartAttribute {
                    id,
                    name: name.to_string(),
                    value,
                    worst: value,
                    threshold,
                    raw,
                    pre_fail,
                },
            );
        }
        SmartData {
            smart_supported: true,
            smart_enabled: true,
            health_passed: Some(true),
            attributes: table,
            ..SmartData::default()
        }
    }

    #[test]
    fn reallocated_over_threshold_lands_in_poor_band() {
        // A raw count five times over the vendor threshold.
        let smart = smart_with(&[(5, "Reallocated_Sector_Ct", 180, 10, 50, true)]);
        let results = vec![NormalizedResult::SmartAttributes(smart)];
        let assessment = calculate_health(&device(), &results, &ScoringConfig::default());
        assert!(assessment.score <= 40, "score was {}", assessment.score);
        assert!(assessment
            .risk_factors
            .iter()
            .any(|f| f.attribute_id == Some(5)));
    }

    #[test]
    fn uncorrectable_sectors_force_critical_band() {
        let smart = smart_with(&[(198, "Offline_Uncorrectable", 100, 0, 1, true)]);
        let results = vec![NormalizedResult::SmartAttributes(smart)];
        let assessment = calculate_health(&device(), &results, &ScoringConfig::default());
        assert!(assessment.score <= 24);
        assert_eq!(assessment.level, HealthLevel::Critical);
        assert_eq!(assessment.risk_factors[0].attribute_id, Some(198));
    }

    #[test]
    fn scoring_is_pure_and_idempotent() {
        let smart = smart_with(&[
            (5, "Reallocated_Sector_Ct", 190, 140, 12, true),
            (199, "UDMA_CRC_Error_Count", 200, 0, 7, false),
        ]);
        let results = vec![
            NormalizedResult::SmartAttributes(smart),
            NormalizedResult::SpeedSample(SpeedSample {
                pattern: AccessPattern::Sequential,
                samples_mbps: vec![30.0, 32.0, 31.0],
                mean_mbps: 31.0,
                excluded: 0,
                errors: 0,
            }),
        ];
        let cfg = ScoringConfig::default();
        let first = calculate_health(&device(), &results, &cfg);
        let second = calculate_health(&device(), &results, &cfg);
        assert_eq!(first, second);
    }

    #[test]
    fn clean_drive_scores_excellent() {
        let smart = smart_with(&[(194, "Temperature_Celsius", 117, 0, 33, false)]);
        let results = vec![NormalizedResult::SmartAttributes(smart)];
        let assessment = calculate_health(&device(), &results, &ScoringConfig::default());
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.level, HealthLevel::Excellent);
        assert!(assessment.risk_factors.is_empty());
    }

    #[test]
    fn hot_drive_is_penalized_by_class_band() {
        let mut smart = smart_with(&[(194, "Temperature_Celsius", 100, 0, 58, false)]);
        smart.temperature_c = Some(58);
        let results = vec![NormalizedResult::SmartAttributes(smart)];
        let assessment = calculate_health(&device(), &results, &ScoringConfig::default());
        // HDD safe band tops out at 45; 58 is in the warning tier.
        assert!(assessment.score < 100);
        assert!(assessment
            .risk_factors
            .iter()
            .any(|f| f.description.starts_with("Temperature")));
    }

    #[test]
    fn no_data_yields_unknown_level() {
        let assessment = calculate_health(&device(), &[], &ScoringConfig::default());
        assert_eq!(assessment.level, HealthLevel::Unknown);
    }

    #[test]
    fn empty_defect_list_adds_no_penalty() {
        let results = vec![NormalizedResult::DefectList(DefectList {
            bad_blocks: 0,
            ranges: vec![],
            block_size: 4096,
        })];
        let assessment = calculate_health(&device(), &results, &ScoringConfig::default());
        assert_eq!(assessment.score, 100);
    }
}
