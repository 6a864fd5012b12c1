//! Fake-Device Detector: a forward-only state machine over FakeVerdict,
//! fed capacity/HPA probes, marker-consistency probes and the destructive
//! full-capacity probe.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use rand::{rngs::StdRng, RngCore, SeedableRng};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{
    CapacityProbe, Confirmation, Device, Evidence, EvidenceSource, FakeAssessment, FakeVerdict,
};
use crate::utils::{human_bytes, task_manager::CancelFlag};

const MARKER_BLOCK: usize = 4096;
/// Offsets probed as fractions of the reported capacity.
const MARKER_POSITIONS: &[f64] = &[0.0, 0.25, 0.5, 0.75, 0.999];

/// Outcome of the write-then-read marker pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerProbeOutcome {
    pub offsets_tested: Vec<u64>,
    pub mismatches: u32,
    /// A late high-offset write clobbered the offset-0 marker: the
    /// device wraps writes around its real capacity.
    pub wrapped: bool,
}

pub struct FakeDetector {
    device_id: String,
    verdict: FakeVerdict,
    confidence: u8,
    evidence: Vec<Evidence>,
    tolerance_pct: f64,
}

impl FakeDetector {
    pub fn new(device_id: &str, tolerance_pct: f64) -> Self {
        FakeDetector {
            device_id: device_id.to_string(),
            verdict: FakeVerdict::Unknown,
            confidence: 0,
            evidence: Vec::new(),
            tolerance_pct,
        }
    }

    pub fn verdict(&self) -> FakeVerdict {
        self.verdict
    }

    /// Escalate, never downgrade. The one exception is handled in
    /// `observe_capacity_probe`: a clean destructive probe is
    /// authoritative new evidence and may settle on LikelyGenuine.
    fn escalate(&mut self, to: FakeVerdict, confidence: u8) {
        if to.rank() >= self.verdict.rank() {
            self.verdict = to;
            self.confidence = self.confidence.max(confidence);
        }
    }

    fn add_evidence(&mut self, source: EvidenceSource, description: String) {
        self.evidence.push(Evidence {
            source,
            description,
        });
    }

    /// Cheap check (Quick path): reported capacity against addressable
    /// bytes, plus the HPA query. Discrepancies are evidence, not a
    /// verdict; a clean pass on an Unknown device leans LikelyGenuine.
    pub fn observe_capacity_probe(&mut self, device: &Device, probe: &CapacityProbe) {
        let mut suspicious = false;

        if let Some(hidden) = probe.hpa_hidden_sectors() {
            suspicious = true;
            self.add_evidence(
                EvidenceSource::HiddenArea,
                format!(
                    "Host Protected Area hides {} ({} sectors)",
                    human_bytes(hidden * 512),
                    hidden
                ),
            );
            self.escalate(FakeVerdict::Suspicious, 40);
        }

        if let Some(addressable) = probe.addressable_bytes() {
            if device.capacity_bytes > 0 && mismatch_pct(device.capacity_bytes, addressable) > self.tolerance_pct {
                suspicious = true;
                self.add_evidence(
                    EvidenceSource::CapacityMismatch,
                    format!(
                        "capacity mismatch: reported {} but only {} addressable",
                        human_bytes(device.capacity_bytes),
                        human_bytes(addressable)
                    ),
                );
                self.escalate(FakeVerdict::Suspicious, 60);
            }
        }

        match probe.fake_reported {
            Some(true) => {
                // Only the destructive probe carries this flag, and only
                // its positive finding may confirm a fake.
                self.add_evidence(
                    EvidenceSource::DestructiveProbe,
                    match (probe.announced_bytes, probe.usable_bytes) {
                        (Some(a), Some(u)) => format!(
                            "destructive probe: announced {} but only {} usable",
                            human_bytes(a),
                            human_bytes(u)
                        ),
                        _ => "destructive probe reported a counterfeit device".to_string(),
                    },
                );
                self.verdict = FakeVerdict::ConfirmedFake;
                self.confidence = 100;
                info!(device = %self.device_id, "destructive probe confirmed fake");
            }
            Some(false) => {
                self.add_evidence(
                    EvidenceSource::DestructiveProbe,
                    "destructive probe wrote and verified the full announced capacity".to_string(),
                );
                // Authoritative: overrides an earlier Suspicious.
                if self.verdict != FakeVerdict::ConfirmedFake {
                    self.verdict = FakeVerdict::LikelyGenuine;
                    self.confidence = self.confidence.max(90);
                }
            }
            None => {
                if !suspicious && self.verdict == FakeVerdict::Unknown {
                    self.add_evidence(
                        EvidenceSource::QuickCheckClean,
                        "quick capacity checks consistent".to_string(),
                    );
                    self.escalate(FakeVerdict::LikelyGenuine, 40);
                }
            }
        }
    }

    /// Marker write-back results strengthen an existing suspicion or
    /// raise one; a clean pass never clears Suspicious by itself.
    pub fn observe_consistency(&mut self, outcome: &MarkerProbeOutcome) {
        if outcome.wrapped {
            self.add_evidence(
                EvidenceSource::MarkerWraparound,
                "high-offset write wrapped around onto offset 0".to_string(),
            );
            self.escalate(FakeVerdict::Suspicious, 80);
        }
        if outcome.mismatches > 0 {
            self.add_evidence(
                EvidenceSource::MarkerMismatch,
                format!(
                    "{} of {} marker blocks failed read-back verification",
                    outcome.mismatches,
                    outcome.offsets_tested.len()
                ),
            );
            self.escalate(FakeVerdict::Suspicious, 70);
        }
    }

    /// Whether it is worth asking the user to confirm the destructive
    /// full-capacity probe.
    pub fn escalation_recommended(&self) -> bool {
        self.verdict == FakeVerdict::Suspicious
    }

    pub fn assessment(&self) -> FakeAssessment {
        let summary = match self.verdict {
            FakeVerdict::ConfirmedFake => "Counterfeit device confirmed by destructive probe".to_string(),
            FakeVerdict::Suspicious => {
                "Suspicious: run the destructive full-capacity probe to confirm".to_string()
            }
            FakeVerdict::LikelyGenuine => "Capacity checks look genuine".to_string(),
            FakeVerdict::Unknown => "Not enough evidence to judge authenticity".to_string(),
        };
        FakeAssessment {
            device_id: self.device_id.clone(),
            verdict: self.verdict,
            confidence: self.confidence,
            evidence: self.evidence.clone(),
            summary,
        }
    }
}

fn mismatch_pct(a: u64, b: u64) -> f64 {
    let max = a.max(b);
    if max == 0 {
        return 0.0;
    }
    (max - a.min(b)) as f64 * 100.0 / max as f64
}

fn marker_payload(offset: u64) -> Vec<u8> {
    // Deterministic per offset so verification needs no side table.
    let mut rng = StdRng::seed_from_u64(offset ^ 0xD15C_F00D);
    let mut buf = vec![0u8; MARKER_BLOCK];
    rng.fill_bytes(&mut buf);
    buf
}

/// Write-then-read 4 KiB markers at offsets spanning the reported
/// capacity, then re-read the offset-0 marker to catch wrap-around.
///
/// Destructive: overwrites device data at the probed offsets, so the
/// caller must hold a recorded `Confirmation`. Cancellation is honored
/// between offsets, bounding how long a revoked probe keeps writing.
pub fn marker_consistency_probe(
    path: &Path,
    reported_capacity: u64,
    _confirm: &Confirmation,
    cancel: &CancelFlag,
) -> Result<MarkerProbeOutcome> {
    if reported_capacity < MARKER_BLOCK as u64 * 2 {
        return Err(EngineError::InvalidParameter(
            "device too small for marker probe".to_string(),
        ));
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let last_block = reported_capacity - MARKER_BLOCK as u64;
    let offsets: Vec<u64> = MARKER_POSITIONS
        .iter()
        .map(|f| {
            let raw = (reported_capacity as f64 * f) as u64;
            (raw / MARKER_BLOCK as u64 * MARKER_BLOCK as u64).min(last_block)
        })
        .collect();

    // Write pass.
    for &offset in &offsets {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&marker_payload(offset))?;
        file.flush()?;
        debug!(offset, "marker written");
    }

    // Read-back pass.
    let mut mismatches = 0u32;
    let mut buf = vec![0u8; MARKER_BLOCK];
    for &offset in &offsets {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        if buf != marker_payload(offset) {
            mismatches += 1;
        }
    }

    // Wrap detection: a wrapping device maps high offsets onto low ones,
    // so after the high writes the offset-0 marker no longer verifies.
    file.seek(SeekFrom::Start(offsets[0]))?;
    file.read_exact(&mut buf)?;
    let wrapped = buf != marker_payload(offsets[0]) && mismatches < offsets.len() as u32;

    Ok(MarkerProbeOutcome {
        offsets_tested: offsets,
        mismatches,
        wrapped,
    })
}
