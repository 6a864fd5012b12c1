//! Static test catalog: every diagnostic the engine can run, its cost,
//! destructiveness, preconditions and backing tool. Catalog order is
//! execution order within a device.

use std::time::Duration;

use crate::config::ToolKind;
use crate::models::{DeviceClass, DiagnosticProfile, TestKind, TestPhase};

#[derive(Debug, Clone)]
pub struct TestDefinition {
    pub kind: TestKind,
    pub label: &'static str,
    pub description: &'static str,
    pub phase: TestPhase,
    pub estimated: Duration,
    /// Per-run deadline enforced by the invoker; independent of any
    /// session-level timing (sessions have none).
    pub timeout: Duration,
    pub destructive: bool,
    pub requires_privilege: bool,
    pub requires_unmount: bool,
    pub applies_to: &'static [DeviceClass],
    pub tool: Option<ToolKind>,
}

const ALL_CLASSES: &[DeviceClass] = &[
    DeviceClass::Hdd,
    DeviceClass::Ssd,
    DeviceClass::Nvme,
    DeviceClass::Unknown,
];

/// ATA-command surface; NVMe devices answer neither `hdparm -N` nor the
/// ATA self-test routine.
const ATA_CLASSES: &[DeviceClass] = &[DeviceClass::Hdd, DeviceClass::Ssd, DeviceClass::Unknown];

pub const CATALOG: &[TestDefinition] = &[
    TestDefinition {
        kind: TestKind::SmartInfo,
        label: "SMART information",
        description: "Collect SMART identity, health verdict and attributes",
        phase: TestPhase::Quick,
        estimated: Duration::from_secs(2),
        timeout: Duration::from_secs(30),
        destructive: false,
        requires_privilege: true,
        requires_unmount: false,
        applies_to: ALL_CLASSES,
        tool: Some(ToolKind::Smartctl),
    },
    TestDefinition {
        kind: TestKind::HealthCheck,
        label: "Health check",
        description: "Fold collected results into a health score",
        phase: TestPhase::Quick,
        estimated: Duration::from_secs(2),
        timeout: Duration::from_secs(10),
        destructive: false,
        requires_privilege: false,
        requires_unmount: false,
        applies_to: ALL_CLASSES,
        tool: None,
    },
    TestDefinition {
        kind: TestKind::FakeQuick,
        label: "Quick fake check",
        description: "Query HPA and addressable capacity for mismatches",
        phase: TestPhase::Quick,
        estimated: Duration::from_secs(5),
        timeout: Duration::from_secs(30),
        destructive: false,
        requires_privilege: true,
        requires_unmount: false,
        applies_to: ATA_CLASSES,
        tool: Some(ToolKind::Hdparm),
    },
    TestDefinition {
        kind: TestKind::SmartShort,
        label: "SMART short self-test",
        description: "Drive-internal short self-test (~2 minutes)",
        phase: TestPhase::Simple,
        estimated: Duration::from_secs(120),
        timeout: Duration::from_secs(360),
        destructive: false,
        requires_privilege: true,
        requires_unmount: false,
        applies_to: ATA_CLASSES,
        tool: Some(ToolKind::Smartctl),
    },
    TestDefinition {
        kind: TestKind::ReadSample,
        label: "Sampled reads",
        description: "Read random samples across the device",
        phase: TestPhase::Simple,
        estimated: Duration::from_secs(60),
        timeout: Duration::from_secs(300),
        destructive: false,
        requires_privilege: true,
        requires_unmount: false,
        applies_to: ALL_CLASSES,
        tool: Some(ToolKind::Dd),
    },
    TestDefinition {
        kind: TestKind::SpeedTest,
        label: "Speed test",
        description: "Measure sequential read throughput",
        phase: TestPhase::Simple,
        estimated: Duration::from_secs(30),
        timeout: Duration::from_secs(300),
        destructive: false,
        requires_privilege: true,
        requires_unmount: false,
        applies_to: ALL_CLASSES,
        tool: Some(ToolKind::Dd),
    },
    TestDefinition {
        kind: TestKind::F3Probe,
        label: "Full-capacity fake probe",
        description: "Definitive counterfeit detection; ERASES DATA",
        phase: TestPhase::Intensive,
        estimated: Duration::from_secs(300),
        timeout: Duration::from_secs(6 * 3600),
        destructive: true,
        requires_privilege: true,
        requires_unmount: true,
        applies_to: ALL_CLASSES,
        tool: Some(ToolKind::F3Probe),
    },
    TestDefinition {
        kind: TestKind::SmartExtended,
        label: "SMART extended self-test",
        description: "Full drive-internal self-test (may take hours)",
        phase: TestPhase::Extended,
        estimated: Duration::from_secs(4 * 3600),
        timeout: Duration::from_secs(12 * 3600),
        destructive: false,
        requires_privilege: true,
        requires_unmount: false,
        applies_to: ATA_CLASSES,
        tool: Some(ToolKind::Smartctl),
    },
    TestDefinition {
        kind: TestKind::BadblocksRo,
        label: "Surface scan (read-only)",
        description: "Scan for defective sectors without writing",
        phase: TestPhase::Extended,
        estimated: Duration::from_secs(5 * 3600),
        timeout: Duration::from_secs(24 * 3600),
        destructive: false,
        requires_privilege: true,
        requires_unmount: true,
        applies_to: ALL_CLASSES,
        tool: Some(ToolKind::Badblocks),
    },
    TestDefinition {
        kind: TestKind::BadblocksRw,
        label: "Surface scan (non-destructive write)",
        description: "Read-write scan preserving data (slow)",
        phase: TestPhase::Extended,
        estimated: Duration::from_secs(10 * 3600),
        timeout: Duration::from_secs(48 * 3600),
        destructive: false,
        requires_privilege: true,
        requires_unmount: true,
        applies_to: ALL_CLASSES,
        tool: Some(ToolKind::Badblocks),
    },
    TestDefinition {
        kind: TestKind::BadblocksWipe,
        label: "Destructive surface scan",
        description: "Full write-mode scan; ERASES DATA",
        phase: TestPhase::Extended,
        estimated: Duration::from_secs(12 * 3600),
        timeout: Duration::from_secs(48 * 3600),
        destructive: true,
        requires_privilege: true,
        requires_unmount: true,
        applies_to: ALL_CLASSES,
        tool: Some(ToolKind::Badblocks),
    },
];

pub fn definition(kind: TestKind) -> &'static TestDefinition {
    CATALOG
        .iter()
        .find(|def| def.kind == kind)
        .expect("every TestKind has a catalog entry")
}

/// Tests auto-scheduled for a profile, in catalog order. Destructive
/// entries are never part of any profile; they require an explicit,
/// confirmed request per run.
pub fn profile_tests(profile: DiagnosticProfile, class: DeviceClass) -> Vec<&'static TestDefinition> {
    CATALOG
        .iter()
        .filter(|def| !def.destructive)
        .filter(|def| def.applies_to.contains(&class))
        .filter(|def| match profile {
            DiagnosticProfile::Quick => def.phase == TestPhase::Quick,
            DiagnosticProfile::Full => {
                def.phase == TestPhase::Quick || def.phase == TestPhase::Simple
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_an_entry() {
        for kind in [
            TestKind::SmartInfo,
            TestKind::HealthCheck,
            TestKind::FakeQuick,
            TestKind::SmartShort,
            TestKind::ReadSample,
            TestKind::SpeedTest,
            TestKind::F3Probe,
            TestKind::SmartExtended,
            TestKind::BadblocksRo,
            TestKind::BadblocksRw,
            TestKind::BadblocksWipe,
        ] {
            assert_eq!(definition(kind).kind, kind);
        }
    }

    #[test]
    fn profiles_never_include_destructive_tests() {
        for class in [
            DeviceClass::Hdd,
            DeviceClass::Ssd,
            DeviceClass::Nvme,
            DeviceClass::Unknown,
        ] {
            for profile in [DiagnosticProfile::Quick, DiagnosticProfile::Full] {
                assert!(profile_tests(profile, class).iter().all(|d| !d.destructive));
            }
        }
    }

    #[test]
    fn quick_profile_is_sub_ten_second_tests() {
        let tests = profile_tests(DiagnosticProfile::Quick, DeviceClass::Hdd);
        assert_eq!(
            tests.iter().map(|d| d.kind).collect::<Vec<_>>(),
            vec![TestKind::SmartInfo, TestKind::HealthCheck, TestKind::FakeQuick]
        );
        assert!(tests.iter().all(|d| d.estimated <= Duration::from_secs(10)));
    }

    #[test]
    fn full_profile_adds_simple_phase() {
        let tests = profile_tests(DiagnosticProfile::Full, DeviceClass::Hdd);
        assert_eq!(
            tests.iter().map(|d| d.kind).collect::<Vec<_>>(),
            vec![
                TestKind::SmartInfo,
                TestKind::HealthCheck,
                TestKind::FakeQuick,
                TestKind::SmartShort,
                TestKind::ReadSample,
                TestKind::SpeedTest,
            ]
        );
    }

    #[test]
    fn nvme_skips_ata_only_tests() {
        let tests = profile_tests(DiagnosticProfile::Full, DeviceClass::Nvme);
        assert!(tests.iter().all(|d| d.kind != TestKind::FakeQuick));
        assert!(tests.iter().all(|d| d.kind != TestKind::SmartShort));
    }

    #[test]
    fn destructive_tests_require_privilege_and_unmount() {
        for def in CATALOG.iter().filter(|d| d.destructive) {
            assert!(def.requires_privilege);
            assert!(def.requires_unmount);
        }
    }
}
