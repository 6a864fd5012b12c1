//! Engine configuration: external tool locations, parallelism bounds and
//! the documented scoring/detection constants.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::DeviceClass;

/// badblocks invocation parameters.
pub const BADBLOCKS_BLOCK_SIZE: u32 = 4096;
pub const BADBLOCKS_BLOCKS_AT_ONCE: u32 = 65536;

/// Locate `name` on PATH, falling back to the given well-known location.
pub fn find_executable(name: &str, fallback: &str) -> PathBuf {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(fallback)
}

fn available(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Smartctl,
    Hdparm,
    Badblocks,
    F3Probe,
    F3Fix,
    Wipefs,
    Dd,
    Udevadm,
    Lsblk,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Smartctl => "smartctl",
            ToolKind::Hdparm => "hdparm",
            ToolKind::Badblocks => "badblocks",
            ToolKind::F3Probe => "f3probe",
            ToolKind::F3Fix => "f3fix",
            ToolKind::Wipefs => "wipefs",
            ToolKind::Dd => "dd",
            ToolKind::Udevadm => "udevadm",
            ToolKind::Lsblk => "lsblk",
        }
    }
}

/// Resolved locations of the external diagnostic tools. `None` means the
/// tool is absent; the corresponding runs fail with "tool unavailable"
/// without aborting their session.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub smartctl: Option<PathBuf>,
    pub hdparm: Option<PathBuf>,
    pub badblocks: Option<PathBuf>,
    pub f3probe: Option<PathBuf>,
    pub f3fix: Option<PathBuf>,
    pub wipefs: Option<PathBuf>,
    pub dd: Option<PathBuf>,
    pub udevadm: Option<PathBuf>,
    pub lsblk: Option<PathBuf>,
}

impl ToolPaths {
    /// Resolve every tool from PATH with the usual sbin fallbacks.
    pub fn discover() -> Self {
        ToolPaths {
            smartctl: available(&find_executable("smartctl", "/usr/sbin/smartctl")),
            hdparm: available(&find_executable("hdparm", "/usr/sbin/hdparm")),
            badblocks: available(&find_executable("badblocks", "/sbin/badblocks")),
            f3probe: available(&find_executable("f3probe", "/usr/bin/f3probe")),
            f3fix: available(&find_executable("f3fix", "/usr/bin/f3fix")),
            wipefs: available(&find_executable("wipefs", "/usr/sbin/wipefs")),
            dd: available(&find_executable("dd", "/usr/bin/dd")),
            udevadm: available(&find_executable("udevadm", "/usr/bin/udevadm")),
            lsblk: available(&find_executable("lsblk", "/usr/bin/lsblk")),
        }
    }

    pub fn get(&self, kind: ToolKind) -> Option<&PathBuf> {
        match kind {
            ToolKind::Smartctl => self.smartctl.as_ref(),
            ToolKind::Hdparm => self.hdparm.as_ref(),
            ToolKind::Badblocks => self.badblocks.as_ref(),
            ToolKind::F3Probe => self.f3probe.as_ref(),
            ToolKind::F3Fix => self.f3fix.as_ref(),
            ToolKind::Wipefs => self.wipefs.as_ref(),
            ToolKind::Dd => self.dd.as_ref(),
            ToolKind::Udevadm => self.udevadm.as_ref(),
            ToolKind::Lsblk => self.lsblk.as_ref(),
        }
    }
}

/// Attribute weights applied by the scoring engine (default vendor table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeWeights {
    pub reallocated: u32,
    pub pending: u32,
    pub uncorrectable: u32,
    pub reallocation_events: u32,
    pub crc_errors: u32,
    pub power_on_hours: u32,
    /// Applied to pre-fail attributes without a dedicated weight.
    pub generic_pre_fail: u32,
}

impl Default for AttributeWeights {
    fn default() -> Self {
        AttributeWeights {
            reallocated: 35,
            pending: 35,
            uncorrectable: 40,
            reallocation_events: 20,
            crc_errors: 15,
            power_on_hours: 10,
            generic_pre_fail: 25,
        }
    }
}

/// Scoring constants. The design fixes their role, not their values; the
/// concrete numbers here are documented in DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub weights: AttributeWeights,
    /// Power-on-hour tiers (warning / concern / critical).
    pub poh_warning: u64,
    pub poh_concern: u64,
    pub poh_critical: u64,
    /// Any fatal indicator clamps the score to this ceiling.
    pub critical_band_ceiling: u8,
    /// Cap for the defect-density penalty.
    pub defect_penalty_cap: u32,
    /// Cap for the slow-read penalty.
    pub speed_penalty_cap: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            weights: AttributeWeights::default(),
            poh_warning: 25_000,
            poh_concern: 40_000,
            poh_critical: 60_000,
            critical_band_ceiling: 24,
            defect_penalty_cap: 40,
            speed_penalty_cap: 20,
        }
    }
}

impl ScoringConfig {
    /// Upper bound of the safe temperature band for a device class.
    pub fn temp_safe_max(&self, class: DeviceClass) -> i64 {
        match class {
            DeviceClass::Hdd | DeviceClass::Unknown => 45,
            DeviceClass::Ssd => 55,
            DeviceClass::Nvme => 60,
        }
    }

    /// Expected sequential read throughput for a healthy device.
    pub fn speed_baseline_mbps(&self, class: DeviceClass) -> f64 {
        match class {
            DeviceClass::Hdd | DeviceClass::Unknown => 80.0,
            DeviceClass::Ssd => 180.0,
            DeviceClass::Nvme => 800.0,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max devices diagnosed concurrently; within one device runs are
    /// always serialized.
    pub max_parallel_devices: usize,
    /// Reported-vs-addressable capacity tolerance, percent.
    pub capacity_tolerance_pct: f64,
    pub scoring: ScoringConfig,
    /// Where evidence exports land.
    pub report_dir: PathBuf,
    /// Effective privilege; defaults to the real uid check. Tests
    /// override this to exercise scheduling without root.
    pub privileged: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_parallel_devices: num_cpus::get().min(4),
            capacity_tolerance_pct: 5.0,
            scoring: ScoringConfig::default(),
            report_dir: crate::utils::cache_dir().join("reports"),
            privileged: crate::utils::is_elevated(),
        }
    }
}
