//! Device enumeration adapter: the thin `lsblk -J` wrapper feeding the
//! engine its Device records. Polling and change detection belong to
//! the embedding application; this module only produces one snapshot.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::ToolPaths;
use crate::error::{EngineError, Result};
use crate::invoker::ToolInvoker;
use crate::models::{Device, DeviceClass};
use crate::utils::task_manager::CancelFlag;

/// Kernel names that are never physical storage devices.
const IGNORED_PREFIXES: &[&str] = &["loop", "sr", "dm-", "zram", "ram", "md"];

#[derive(Debug, Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// lsblk emits numbers and booleans as strings on older versions;
/// tolerate both shapes.
#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default, deserialize_with = "flexible_u64")]
    size: Option<u64>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    rota: Option<bool>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkChild>,
}

#[derive(Debug, Deserialize)]
struct LsblkChild {
    #[serde(default)]
    mountpoint: Option<String>,
}

fn flexible_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn flexible_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::String(s)) => match s.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|v| v != 0),
        _ => None,
    })
}

fn classify(name: &str, rota: Option<bool>) -> DeviceClass {
    if name.starts_with("nvme") {
        return DeviceClass::Nvme;
    }
    match rota {
        Some(false) => DeviceClass::Ssd,
        Some(true) => DeviceClass::Hdd,
        None => DeviceClass::Unknown,
    }
}

fn bus_label(tran: Option<&str>, name: &str) -> String {
    if name.starts_with("nvme") {
        return "NVMe".to_string();
    }
    match tran.map(|t| t.trim().to_ascii_uppercase()) {
        Some(t) if t == "USB" => "USB".to_string(),
        Some(t) if t == "SATA" || t == "ATA" => "SATA".to_string(),
        Some(t) if t == "NVME" => "NVMe".to_string(),
        Some(t) if t == "SAS" => "SAS".to_string(),
        Some(t) if !t.is_empty() => t,
        _ => "Unknown".to_string(),
    }
}

fn parse_lsblk(json: &str) -> Result<Vec<Device>> {
    let report: LsblkReport = serde_json::from_str(json)?;
    let mut devices = Vec::new();
    for dev in report.blockdevices {
        if dev.kind.as_deref() != Some("disk") {
            continue;
        }
        if IGNORED_PREFIXES.iter().any(|p| dev.name.starts_with(p)) {
            continue;
        }
        let mounted = dev.mountpoint.is_some()
            || dev.children.iter().any(|c| c.mountpoint.is_some());
        devices.push(Device {
            path: format!("/dev/{}", dev.name),
            capacity_bytes: dev.size.unwrap_or(0),
            bus: bus_label(dev.tran.as_deref(), &dev.name),
            class: classify(&dev.name, dev.rota),
            model: dev.model.unwrap_or_default().trim().to_string(),
            serial: dev.serial.unwrap_or_default().trim().to_string(),
            mounted,
            id: dev.name,
        });
    }
    Ok(devices)
}

/// One enumeration snapshot of the physical disks on this host.
pub async fn enumerate(tools: &ToolPaths, cancel: &CancelFlag) -> Result<Vec<Device>> {
    let lsblk = tools
        .lsblk
        .as_ref()
        .ok_or_else(|| EngineError::ToolUnavailable("lsblk".to_string()))?;
    let args = vec![
        "-J".to_string(),
        "-b".to_string(),
        "-o".to_string(),
        "NAME,SIZE,TYPE,MODEL,SERIAL,ROTA,TRAN,MOUNTPOINT".to_string(),
    ];
    let out = ToolInvoker::execute(lsblk, &args, Duration::from_secs(10), cancel).await?;
    if out.exit_code != 0 {
        return Err(EngineError::SystemError(format!(
            "lsblk exited with {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }
    let devices = parse_lsblk(&out.stdout)?;
    debug!(count = devices.len(), "devices enumerated");
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_lsblk_json() {
        let json = r#"{
            "blockdevices": [
                {"name":"sda","size":4000787030016,"type":"disk","model":"WDC WD40EFRX","serial":"WD-1","rota":true,"tran":"sata","mountpoint":null,
                 "children":[{"mountpoint":"/data"}]},
                {"name":"nvme0n1","size":1000204886016,"type":"disk","model":"Samsung 980","serial":"S5-2","rota":false,"tran":"nvme","mountpoint":null},
                {"name":"loop0","size":4096,"type":"loop","mountpoint":null},
                {"name":"sdb","size":"240057409536","type":"disk","model":" USB Stick ","serial":null,"rota":"0","tran":"usb","mountpoint":null}
            ]
        }"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices.len(), 3);

        let sda = &devices[0];
        assert_eq!(sda.class, DeviceClass::Hdd);
        assert_eq!(sda.bus, "SATA");
        assert!(sda.mounted);
        assert_eq!(sda.path, "/dev/sda");

        let nvme = &devices[1];
        assert_eq!(nvme.class, DeviceClass::Nvme);
        assert_eq!(nvme.bus, "NVMe");
        assert!(!nvme.mounted);

        // String-typed size/rota from older lsblk still parse.
        let sdb = &devices[2];
        assert_eq!(sdb.capacity_bytes, 240_057_409_536);
        assert_eq!(sdb.class, DeviceClass::Ssd);
        assert_eq!(sdb.bus, "USB");
        assert_eq!(sdb.model, "USB Stick");
    }

    #[test]
    fn pseudo_devices_are_ignored() {
        let json = r#"{"blockdevices":[
            {"name":"zram0","size":8192,"type":"disk"},
            {"name":"dm-0","size":8192,"type":"disk"}
        ]}"#;
        assert!(parse_lsblk(json).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_lsblk("not json").is_err());
    }
}
