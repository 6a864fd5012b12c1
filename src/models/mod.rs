use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================
// Devices
// ============================================================

/// Broad device classification used for test applicability and
/// class-dependent scoring baselines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Hdd,
    Ssd,
    Nvme,
    Unknown,
}

/// A physical storage device as reported by the enumeration collaborator.
/// Immutable for the duration of a diagnostic session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable kernel name, e.g. "sdb" or "nvme0n1".
    pub id: String,
    /// Full device node path, e.g. "/dev/sdb".
    pub path: String,
    /// Capacity as announced by the device.
    pub capacity_bytes: u64,
    /// Transport bus, e.g. "USB", "SATA", "NVMe".
    #[serde(default)]
    pub bus: String,
    pub class: DeviceClass,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub mounted: bool,
}

// ============================================================
// Test runs
// ============================================================

/// Rough cost bucket, mirroring the four wizard phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestPhase {
    Quick,
    Simple,
    Intensive,
    Extended,
}

/// Every diagnostic the engine knows how to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    SmartInfo,
    HealthCheck,
    FakeQuick,
    SmartShort,
    ReadSample,
    SpeedTest,
    F3Probe,
    SmartExtended,
    BadblocksRo,
    BadblocksRw,
    BadblocksWipe,
}

impl TestKind {
    pub fn id(&self) -> &'static str {
        match self {
            TestKind::SmartInfo => "smart_info",
            TestKind::HealthCheck => "health_check",
            TestKind::FakeQuick => "fake_quick",
            TestKind::SmartShort => "smart_short",
            TestKind::ReadSample => "read_sample",
            TestKind::SpeedTest => "speed_test",
            TestKind::F3Probe => "f3probe",
            TestKind::SmartExtended => "smart_extended",
            TestKind::BadblocksRo => "badblocks_ro",
            TestKind::BadblocksRw => "badblocks_rw",
            TestKind::BadblocksWipe => "badblocks_wipe",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    /// Expected non-exceptional outcome (e.g. insufficient privilege);
    /// distinct from Failed so a session can still reach Complete.
    Skipped,
}

impl TestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestState::Pending | TestState::Running)
    }
}

/// One scheduled execution of a catalog test against one device.
/// Owned exclusively by the orchestrator; terminal states are final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: Uuid,
    pub device_id: String,
    pub test: TestKind,
    pub state: TestState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<NormalizedResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set only through `Confirmation`; checked before a destructive
    /// run may enter Running.
    pub destructive_confirmed: bool,
}

impl TestRun {
    pub fn new(device_id: &str, test: TestKind) -> Self {
        TestRun {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            test,
            state: TestState::Pending,
            started_at: None,
            finished_at: None,
            message: String::new(),
            raw_output: None,
            result: None,
            error: None,
            destructive_confirmed: false,
        }
    }

    pub fn start(&mut self) {
        if !self.state.is_terminal() {
            self.state = TestState::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Move to a terminal state. Once terminal, further transitions are
    /// ignored: no state leaves Succeeded/Failed/Cancelled/TimedOut/Skipped.
    pub fn finish(&mut self, state: TestState, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        debug_assert!(state.is_terminal());
        self.state = state;
        self.message = message.into();
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> f64 {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => (f - s).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

/// Proof that the caller acknowledged data loss for one destructive run.
/// Cannot be constructed by accident: there is no Default and the only
/// constructor names the consequence.
#[derive(Debug, Clone)]
pub struct Confirmation {
    _acknowledged: (),
}

impl Confirmation {
    pub fn acknowledge_data_loss() -> Self {
        Confirmation { _acknowledged: () }
    }
}

// ============================================================
// Normalized results
// ============================================================

/// Tagged union of every test family's normalized output. Scoring and
/// fake detection match exhaustively over this, so a new family is a
/// compile-time-checked extension point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum NormalizedResult {
    SmartAttributes(SmartData),
    CapacityProbe(CapacityProbe),
    DefectList(DefectList),
    SpeedSample(SpeedSample),
}

/// One row of the ATA attribute table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmartAttribute {
    pub id: u8,
    pub name: String,
    /// Normalized value (vendor scale, typically 1..=253).
    pub value: u8,
    pub worst: u8,
    /// Vendor threshold; 0 when the vendor publishes none.
    pub threshold: u8,
    pub raw: u64,
    /// Known pre-fail attribute (threshold breach predicts failure).
    pub pre_fail: bool,
}

/// Normalized SMART snapshot. Vendor quirks leave fields unset rather
/// than failing the parse; consumers must treat `None` as unknown,
/// never as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartData {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub firmware: String,
    pub capacity_bytes: Option<u64>,
    pub smart_supported: bool,
    pub smart_enabled: bool,
    /// Overall SMART health self-assessment, when the drive reports one.
    pub health_passed: Option<bool>,
    pub temperature_c: Option<i64>,
    pub power_on_hours: Option<u64>,
    pub power_cycles: Option<u64>,
    /// Attribute table keyed by id; BTreeMap keeps iteration deterministic.
    #[serde(default)]
    pub attributes: BTreeMap<u8, SmartAttribute>,
    /// Outcome of the most recent self-test log entry, when polled.
    pub self_test_passed: Option<bool>,
}

impl SmartData {
    pub fn attr(&self, id: u8) -> Option<&SmartAttribute> {
        self.attributes.get(&id)
    }

    pub fn attr_raw(&self, id: u8) -> Option<u64> {
        self.attributes.get(&id).map(|a| a.raw)
    }

    pub fn reallocated_sectors(&self) -> Option<u64> {
        self.attr_raw(5)
    }

    pub fn pending_sectors(&self) -> Option<u64> {
        self.attr_raw(197)
    }

    pub fn uncorrectable_sectors(&self) -> Option<u64> {
        self.attr_raw(198)
    }

    pub fn crc_errors(&self) -> Option<u64> {
        self.attr_raw(199)
    }
}

/// Capacity and HPA evidence from `hdparm -N` or `f3probe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CapacityProbe {
    /// Sector counts from the HPA query.
    pub native_max_sectors: Option<u64>,
    pub current_max_sectors: Option<u64>,
    /// Sizes reported by the destructive probe.
    pub announced_bytes: Option<u64>,
    pub usable_bytes: Option<u64>,
    pub announced_blocks: Option<u64>,
    pub usable_blocks: Option<u64>,
    pub physical_block_size: Option<u32>,
    /// Last addressable sector a capacity fix should keep.
    pub last_usable_sector: Option<u64>,
    /// Verdict carried in the destructive probe output; `None` for the
    /// non-destructive HPA query.
    pub fake_reported: Option<bool>,
}

impl CapacityProbe {
    /// Sectors hidden behind a Host Protected Area, if one is set.
    pub fn hpa_hidden_sectors(&self) -> Option<u64> {
        match (self.native_max_sectors, self.current_max_sectors) {
            (Some(native), Some(current)) if native != current => {
                Some(native.max(current) - native.min(current))
            }
            _ => None,
        }
    }

    /// Bytes actually addressable according to this probe.
    pub fn addressable_bytes(&self) -> Option<u64> {
        if let Some(usable) = self.usable_bytes {
            return Some(usable);
        }
        self.current_max_sectors.map(|s| s * 512)
    }
}

/// Bad-block scan outcome. An empty list is a valid, positive result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefectList {
    pub bad_blocks: u64,
    /// Inclusive block ranges, consecutive blocks collapsed.
    pub ranges: Vec<(u64, u64)>,
    pub block_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessPattern {
    Sequential,
    Random,
}

/// Aggregated read throughput from timed samples, hiccups excluded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeedSample {
    pub pattern: AccessPattern,
    pub samples_mbps: Vec<f64>,
    pub mean_mbps: f64,
    pub excluded: u32,
    /// Read errors hit while sampling (failed dd invocations).
    pub errors: u32,
}

// ============================================================
// Assessments
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFactor {
    /// SMART attribute id when the factor stems from one.
    pub attribute_id: Option<u8>,
    pub severity: Severity,
    pub description: String,
    pub penalty: u32,
}

/// Derived health verdict for one device. Recomputed from scratch on new
/// data; superseded, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthAssessment {
    pub device_id: String,
    pub score: u8,
    pub level: HealthLevel,
    pub risk_factors: Vec<RiskFactor>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FakeVerdict {
    Unknown,
    LikelyGenuine,
    Suspicious,
    ConfirmedFake,
}

impl FakeVerdict {
    /// Escalation rank; transitions never decrease it except on
    /// authoritative destructive evidence.
    pub fn rank(&self) -> u8 {
        match self {
            FakeVerdict::Unknown => 0,
            FakeVerdict::LikelyGenuine => 1,
            FakeVerdict::Suspicious => 2,
            FakeVerdict::ConfirmedFake => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    CapacityMismatch,
    HiddenArea,
    MarkerMismatch,
    MarkerWraparound,
    DestructiveProbe,
    QuickCheckClean,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub source: EvidenceSource,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FakeAssessment {
    pub device_id: String,
    pub verdict: FakeVerdict,
    /// 0-100; 100 only after a positive destructive probe.
    pub confidence: u8,
    pub evidence: Vec<Evidence>,
    pub summary: String,
}

// ============================================================
// Sessions, reports, events
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Collecting,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticProfile {
    Quick,
    Full,
}

/// Progress update emitted to the presentation collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub session_id: Uuid,
    pub device_id: String,
    pub test_id: &'static str,
    pub state: TestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRunSummary {
    pub test_id: &'static str,
    pub state: TestState,
    pub message: String,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TestRun> for TestRunSummary {
    fn from(run: &TestRun) -> Self {
        TestRunSummary {
            test_id: run.test.id(),
            state: run.state,
            message: run.message.clone(),
            duration_seconds: run.duration_seconds(),
            error: run.error.clone(),
        }
    }
}

/// Final structured value handed to the report-rendering collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub session_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub device: Device,
    pub session_state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthAssessment>,
    pub fake: FakeAssessment,
    pub runs: Vec<TestRunSummary>,
    pub actions: Vec<crate::remediation::RemediationAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        let mut run = TestRun::new("sdb", TestKind::SmartInfo);
        run.start();
        run.finish(TestState::Cancelled, "cancelled by user");
        run.finish(TestState::Succeeded, "late success must not apply");
        assert_eq!(run.state, TestState::Cancelled);
        assert_eq!(run.message, "cancelled by user");
    }

    #[test]
    fn hpa_hidden_sectors_requires_disagreement() {
        let mut probe = CapacityProbe::default();
        assert_eq!(probe.hpa_hidden_sectors(), None);
        probe.native_max_sectors = Some(1000);
        probe.current_max_sectors = Some(1000);
        assert_eq!(probe.hpa_hidden_sectors(), None);
        probe.current_max_sectors = Some(900);
        assert_eq!(probe.hpa_hidden_sectors(), Some(100));
    }

    #[test]
    fn missing_smart_counters_stay_unknown() {
        let smart = SmartData::default();
        assert_eq!(smart.reallocated_sectors(), None);
        assert_eq!(smart.pending_sectors(), None);
        assert_eq!(smart.uncorrectable_sectors(), None);
    }
}
