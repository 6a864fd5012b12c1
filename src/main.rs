//! Thin CLI front end over the diagnostic engine: list devices, run
//! quick/full sessions, request destructive probes, print the report.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use diskprobe::config::{EngineConfig, ToolPaths};
use diskprobe::device;
use diskprobe::models::{Confirmation, Device, DiagnosticProfile, TestKind};
use diskprobe::orchestrator::Orchestrator;
use diskprobe::remediation;
use diskprobe::utils::{self, task_manager::CancelFlag};

#[derive(Parser)]
#[command(name = "diskprobe", version, about = "Storage-device diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List physical storage devices
    List,
    /// Run the quick, non-destructive diagnostic profile
    Quick {
        /// Device name or path, e.g. sdb or /dev/sdb
        device: String,
    },
    /// Run the full non-destructive diagnostic profile
    Full {
        device: String,
    },
    /// Run the destructive full-capacity fake probe (ERASES DATA)
    Probe {
        device: String,
        /// Acknowledge that the probe overwrites the device
        #[arg(long)]
        yes_destroy_my_data: bool,
        /// Export a JSON evidence bundle next to the logs
        #[arg(long)]
        export: bool,
    },
    /// Run a badblocks surface scan
    Scan {
        device: String,
        /// ro, rw (non-destructive write) or wipe (ERASES DATA)
        #[arg(long, default_value = "ro")]
        mode: String,
        #[arg(long)]
        yes_destroy_my_data: bool,
    },
}

async fn find_device(tools: &ToolPaths, wanted: &str) -> anyhow::Result<Device> {
    let devices = device::enumerate(tools, &CancelFlag::new()).await?;
    let name = wanted.trim_start_matches("/dev/");
    devices
        .into_iter()
        .find(|d| d.id == name)
        .with_context(|| format!("device '{}' not found", wanted))
}

fn spawn_progress_printer(orch: &Orchestrator) {
    let mut rx = orch.subscribe();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.percent {
                Some(pct) => eprintln!(
                    "[{}] {:?} {:>3}% {}",
                    event.test_id, event.state, pct, event.message
                ),
                None => eprintln!("[{}] {:?} {}", event.test_id, event.state, event.message),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = utils::log::init_logger();
    let cli = Cli::parse();

    let tools = ToolPaths::discover();
    let config = EngineConfig::default();
    let report_dir = config.report_dir.clone();
    let orch = Orchestrator::new(config, tools.clone());

    match cli.command {
        Command::List => {
            let devices = device::enumerate(&tools, &CancelFlag::new()).await?;
            for d in &devices {
                println!(
                    "{:<10} {:>10}  {:<5} {:<8} {}{}",
                    d.id,
                    utils::human_bytes(d.capacity_bytes),
                    d.bus,
                    format!("{:?}", d.class),
                    d.model,
                    if d.mounted { "  (mounted)" } else { "" }
                );
            }
            if devices.is_empty() {
                eprintln!("no physical storage devices found");
            }
        }
        Command::Quick { device } => {
            run_profile(&orch, &tools, &device, DiagnosticProfile::Quick).await?;
        }
        Command::Full { device } => {
            run_profile(&orch, &tools, &device, DiagnosticProfile::Full).await?;
        }
        Command::Probe {
            device,
            yes_destroy_my_data,
            export,
        } => {
            if !yes_destroy_my_data {
                bail!("the full-capacity probe overwrites the device; pass --yes-destroy-my-data to confirm");
            }
            let dev = find_device(&tools, &device).await?;
            spawn_progress_printer(&orch);
            let mut session = orch.plan_session(dev, DiagnosticProfile::Quick);
            orch.request_test(
                &mut session,
                TestKind::F3Probe,
                Some(Confirmation::acknowledge_data_loss()),
            )?;
            let report = orch.run_session(&mut session).await?;
            if export {
                let udev =
                    remediation::collect_udev_properties(&tools, &report.device.path, &CancelFlag::new())
                        .await;
                let path = remediation::export_evidence(&report, &udev, &report_dir)?;
                eprintln!("evidence written to {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Scan {
            device,
            mode,
            yes_destroy_my_data,
        } => {
            let kind = match mode.as_str() {
                "ro" => TestKind::BadblocksRo,
                "rw" => TestKind::BadblocksRw,
                "wipe" => TestKind::BadblocksWipe,
                other => bail!("unknown scan mode '{}'", other),
            };
            let confirm = if kind == TestKind::BadblocksWipe {
                if !yes_destroy_my_data {
                    bail!("wipe mode erases the device; pass --yes-destroy-my-data to confirm");
                }
                Some(Confirmation::acknowledge_data_loss())
            } else {
                None
            };
            let dev = find_device(&tools, &device).await?;
            spawn_progress_printer(&orch);
            let mut session = orch.plan_empty(dev, DiagnosticProfile::Full);
            orch.request_test(&mut session, kind, confirm)?;
            let report = orch.run_session(&mut session).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn run_profile(
    orch: &Orchestrator,
    tools: &ToolPaths,
    device: &str,
    profile: DiagnosticProfile,
) -> anyhow::Result<()> {
    let dev = find_device(tools, device).await?;
    spawn_progress_printer(orch);
    let mut session = orch.plan_session(dev, profile);
    let report = orch.run_session(&mut session).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
