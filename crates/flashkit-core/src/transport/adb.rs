//! Normal-mode probe over `adb`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::parse_device_list;
use super::traits::{DeviceEntry, DeviceProbe, ErrorSlot};
use crate::config::Timeouts;
use crate::error::FlashError;
use crate::process;
use crate::session::DeviceMode;

static GETPROP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]$").expect("valid regex"));

/// Property prefixes worth showing for a connected device.
const PROPERTY_PREFIXES: &[&str] = &[
    "ro.product.brand",
    "ro.product.manufacturer",
    "ro.product.model",
    "ro.product.device",
    "ro.product.cpu.abi",
    "ro.build.version.release",
    "ro.build.version.sdk",
    "ro.build.version.security_patch",
    "ro.build.display.id",
    "ro.boot.slot_suffix",
    "ro.boot.verifiedbootstate",
    "ro.serialno",
];

/// Parse `getprop` output lines of the form `[key]: [value]`.
pub fn parse_getprop(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let caps = GETPROP_LINE.captures(line.trim())?;
            Some((caps[1].to_string(), caps[2].to_string()))
        })
        .collect()
}

/// Keep the display-worthy properties, in [`PROPERTY_PREFIXES`] order.
fn select_properties(all: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut selected: Vec<(String, String)> = all
        .into_iter()
        .filter(|(key, value)| !value.is_empty() && PROPERTY_PREFIXES.contains(&key.as_str()))
        .collect();
    selected.sort_by_key(|(key, _)| PROPERTY_PREFIXES.iter().position(|p| p == key));
    selected
}

pub struct AdbProbe {
    path: PathBuf,
    timeouts: Timeouts,
    last_error: ErrorSlot,
}

impl AdbProbe {
    pub fn new(path: impl Into<PathBuf>, timeouts: &Timeouts) -> Self {
        Self {
            path: path.into(),
            timeouts: timeouts.clone(),
            last_error: ErrorSlot::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceProbe for AdbProbe {
    fn mode(&self) -> DeviceMode {
        DeviceMode::NormalMode
    }

    fn list_devices(&self) -> Vec<DeviceEntry> {
        let output = match process::run(&self.path, &["devices"], self.timeouts.device_list()) {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "adb devices failed");
                self.last_error.set(e.to_string());
                return Vec::new();
            }
        };
        if !output.success() {
            self.last_error.set(output.combined().trim().to_string());
            return Vec::new();
        }

        let devices = parse_device_list(&output.stdout);
        match devices.iter().find(|d| d.description == "unauthorized") {
            Some(device) => {
                let err = FlashError::DeviceUnauthorized {
                    id: device.id.clone(),
                };
                warn!("{}", err);
                self.last_error.set(err.to_string());
            }
            None => self.last_error.clear(),
        }
        devices
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    fn properties(&self, id: &str) -> Vec<(String, String)> {
        match process::run(
            &self.path,
            &["-s", id, "shell", "getprop"],
            self.timeouts.command(),
        ) {
            Ok(output) if output.success() => select_properties(parse_getprop(&output.stdout)),
            Ok(output) => {
                debug!(id, output = %output.combined().trim(), "getprop failed");
                Vec::new()
            }
            Err(e) => {
                debug!(id, error = %e, "getprop failed");
                Vec::new()
            }
        }
    }
}
