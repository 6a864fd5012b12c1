//! Remediation Advisor: maps a fake-device assessment to an ordered list
//! of corrective actions. Advice is informational; execution re-enters
//! the Tool Invoker under the same destructive-confirmation discipline
//! as the test catalog.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ToolPaths;
use crate::error::{EngineError, Result};
use crate::invoker::{ToolInvoker, ToolOutput};
use crate::models::{
    CapacityProbe, Confirmation, Device, DiagnosticReport, EvidenceSource, FakeAssessment,
    FakeVerdict,
};
use crate::utils::task_manager::CancelFlag;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ExportEvidence,
    FixCapacity,
    RecoverData,
    WipeSignatures,
    DisableHpa,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub kind: ActionKind,
    pub label: String,
    pub description: String,
    /// Command lines to run, in order; empty for purely informational
    /// actions or when the backing tool is not installed.
    pub commands: Vec<Vec<String>>,
    pub destructive: bool,
}

fn tool_cmd(path: Option<&std::path::PathBuf>, args: &[String]) -> Vec<Vec<String>> {
    match path {
        Some(p) => {
            let mut cmd = vec![p.display().to_string()];
            cmd.extend(args.iter().cloned());
            vec![cmd]
        }
        None => Vec::new(),
    }
}

/// Build the ordered action list for a verdict. Pure: no I/O, no state.
pub fn advise(
    assessment: &FakeAssessment,
    probe: Option<&CapacityProbe>,
    device: &Device,
    tools: &ToolPaths,
) -> Vec<RemediationAction> {
    let mut actions = Vec::new();

    let has_hpa_evidence = assessment
        .evidence
        .iter()
        .any(|e| e.source == EvidenceSource::HiddenArea);

    if assessment.verdict == FakeVerdict::ConfirmedFake
        || assessment.verdict == FakeVerdict::Suspicious
    {
        actions.push(RemediationAction {
            kind: ActionKind::ExportEvidence,
            label: "Export evidence report".to_string(),
            description: "Write a JSON evidence bundle for a refund dispute or vendor report."
                .to_string(),
            commands: Vec::new(),
            destructive: false,
        });
    }

    if assessment.verdict == FakeVerdict::ConfirmedFake {
        if let Some(last_sec) = probe.and_then(|p| p.last_usable_sector) {
            actions.push(RemediationAction {
                kind: ActionKind::FixCapacity,
                label: "Fix capacity to the real size".to_string(),
                description: format!(
                    "Re-partition the device to its verified capacity (last usable sector {}). Erases the device.",
                    last_sec
                ),
                commands: tool_cmd(
                    tools.f3fix.as_ref(),
                    &[format!("--last-sec={}", last_sec), device.path.clone()],
                ),
                destructive: true,
            });
        }

        actions.push(RemediationAction {
            kind: ActionKind::RecoverData,
            label: "Try to recover data first".to_string(),
            description:
                "Mount read-only and copy anything valuable off before any destructive fix."
                    .to_string(),
            commands: Vec::new(),
            destructive: false,
        });

        let mut wipe_cmds = tool_cmd(tools.wipefs.as_ref(), &["-a".to_string(), device.path.clone()]);
        if let Some(dd) = tools.dd.as_ref() {
            wipe_cmds.push(vec![
                dd.display().to_string(),
                "if=/dev/zero".to_string(),
                format!("of={}", device.path),
                "bs=1M".to_string(),
                "count=32".to_string(),
                "conv=fsync".to_string(),
            ]);
        }
        actions.push(RemediationAction {
            kind: ActionKind::WipeSignatures,
            label: "Prepare for return or disposal".to_string(),
            description:
                "Remove filesystem signatures and the partition table (quick wipe of metadata)."
                    .to_string(),
            commands: wipe_cmds,
            destructive: true,
        });
    }

    if has_hpa_evidence {
        let native = probe.and_then(|p| p.native_max_sectors);
        let args = native
            .map(|n| {
                vec![
                    "--yes-i-know-what-i-am-doing".to_string(),
                    "-N".to_string(),
                    format!("p{}", n),
                    device.path.clone(),
                ]
            })
            .unwrap_or_default();
        actions.push(RemediationAction {
            kind: ActionKind::DisableHpa,
            label: "Remove the Host Protected Area".to_string(),
            description: "Restore the native max sector count so the full capacity is addressable."
                .to_string(),
            commands: if args.is_empty() {
                Vec::new()
            } else {
                tool_cmd(tools.hdparm.as_ref(), &args)
            },
            destructive: true,
        });
    }

    actions
}

/// Execute one advised action. Destructive actions demand the same
/// explicit confirmation as destructive catalog tests.
pub async fn execute_action(
    action: &RemediationAction,
    confirm: Option<&Confirmation>,
    cancel: &CancelFlag,
) -> Result<Vec<ToolOutput>> {
    if action.destructive && confirm.is_none() {
        return Err(EngineError::PreconditionViolation(format!(
            "destructive action '{}' requires explicit confirmation",
            action.label
        )));
    }
    if action.commands.is_empty() {
        return Err(EngineError::InvalidParameter(format!(
            "action '{}' is informational or its tool is not installed",
            action.label
        )));
    }

    let mut outputs = Vec::new();
    for command in &action.commands {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EngineError::InvalidParameter("empty command".to_string()))?;
        info!(action = ?action.kind, program, "executing remediation command");
        let output = ToolInvoker::execute(
            Path::new(program),
            args,
            Duration::from_secs(600),
            cancel,
        )
        .await?;
        if output.exit_code != 0 {
            return Err(EngineError::SystemError(format!(
                "{} exited with {}: {}",
                program,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        outputs.push(output);
    }
    Ok(outputs)
}

/// Collect udev properties for the evidence bundle. Best effort: a
/// missing udevadm yields an empty map.
pub async fn collect_udev_properties(
    tools: &ToolPaths,
    device_path: &str,
    cancel: &CancelFlag,
) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    let Some(udevadm) = tools.udevadm.as_ref() else {
        return props;
    };
    let args = vec![
        "info".to_string(),
        "--query=property".to_string(),
        "--name".to_string(),
        device_path.to_string(),
    ];
    if let Ok(output) = ToolInvoker::execute(udevadm, &args, Duration::from_secs(10), cancel).await
    {
        for line in output.stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                props.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    props
}

#[derive(Debug, Serialize)]
struct EvidencePayload<'a> {
    timestamp: String,
    host_os: String,
    report: &'a DiagnosticReport,
    udev: &'a BTreeMap<String, String>,
}

/// Write the evidence bundle next to the other reports and return its
/// path.
pub fn export_evidence(
    report: &DiagnosticReport,
    udev: &BTreeMap<String, String>,
    out_dir: &Path,
) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let ts = Local::now().format("%Y%m%d-%H%M%S");
    let dev_short = report.device.id.replace('/', "_");
    let out_path = out_dir.join(format!("fake-evidence_{}_{}.json", dev_short, ts));

    let payload = EvidencePayload {
        timestamp: ts.to_string(),
        host_os: sysinfo::System::long_os_version().unwrap_or_else(|| "Unknown".to_string()),
        report,
        udev,
    };
    std::fs::write(&out_path, serde_json::to_string_pretty(&payload)?)?;
    info!(path = %out_path.display(), "evidence exported");
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceClass, Evidence};

    fn device() -> Device {
        Device {
            id: "sdc".to_string(),
            path: "/dev/sdc".to_string(),
            capacity_bytes: 256 * 1024 * 1024 * 1024,
            bus: "USB".to_string(),
            class: DeviceClass::Unknown,
            model: String::new(),
            serial: String::new(),
            mounted: false,
        }
    }

    fn tools() -> ToolPaths {
        ToolPaths {
            f3fix: Some("/usr/bin/f3fix".into()),
            wipefs: Some("/usr/sbin/wipefs".into()),
            dd: Some("/usr/bin/dd".into()),
            hdparm: Some("/usr/sbin/hdparm".into()),
            ..ToolPaths::default()
        }
    }

    fn confirmed_fake() -> FakeAssessment {
        FakeAssessment {
            device_id: "sdc".to_string(),
            verdict: FakeVerdict::ConfirmedFake,
            confidence: 100,
            evidence: vec![],
            summary: String::new(),
        }
    }

    #[test]
    fn confirmed_fake_gets_ordered_actions() {
        let probe = CapacityProbe {
            last_usable_sector: Some(16_526_167),
            ..CapacityProbe::default()
        };
        let actions = advise(&confirmed_fake(), Some(&probe), &device(), &tools());
        let kinds: Vec<ActionKind> = actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::ExportEvidence,
                ActionKind::FixCapacity,
                ActionKind::RecoverData,
                ActionKind::WipeSignatures,
            ]
        );

        let fix = &actions[1];
        assert!(fix.destructive);
        assert_eq!(fix.commands[0][1], "--last-sec=16526167");
        assert_eq!(fix.commands[0][2], "/dev/sdc");
    }

    #[test]
    fn hpa_evidence_adds_removal_action() {
        let assessment = FakeAssessment {
            verdict: FakeVerdict::Suspicious,
            evidence: vec![Evidence {
                source: EvidenceSource::HiddenArea,
                description: "HPA".to_string(),
            }],
            ..confirmed_fake()
        };
        let probe = CapacityProbe {
            native_max_sectors: Some(468_862_128),
            current_max_sectors: Some(234_441_648),
            ..CapacityProbe::default()
        };
        let actions = advise(&assessment, Some(&probe), &device(), &tools());
        let hpa = actions
            .iter()
            .find(|a| a.kind == ActionKind::DisableHpa)
            .unwrap();
        assert!(hpa.destructive);
        assert!(hpa.commands[0].contains(&"p468862128".to_string()));
    }

    #[test]
    fn genuine_devices_need_no_actions() {
        let assessment = FakeAssessment {
            verdict: FakeVerdict::LikelyGenuine,
            ..confirmed_fake()
        };
        assert!(advise(&assessment, None, &device(), &tools()).is_empty());
    }

    #[tokio::test]
    async fn destructive_action_requires_confirmation() {
        let actions = advise(
            &confirmed_fake(),
            Some(&CapacityProbe {
                last_usable_sector: Some(100),
                ..CapacityProbe::default()
            }),
            &device(),
            &tools(),
        );
        let fix = actions.iter().find(|a| a.kind == ActionKind::FixCapacity).unwrap();
        let err = execute_action(fix, None, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::PreconditionViolation(_)));
    }

    #[tokio::test]
    async fn informational_action_cannot_be_executed() {
        let actions = advise(&confirmed_fake(), None, &device(), &tools());
        let recover = actions.iter().find(|a| a.kind == ActionKind::RecoverData).unwrap();
        let err = execute_action(recover, Some(&Confirmation::acknowledge_data_loss()), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
    }
}
