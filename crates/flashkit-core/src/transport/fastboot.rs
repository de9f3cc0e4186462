//! Bootloader-mode probe and client over `fastboot`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use super::parse_device_list;
use super::traits::{DeviceEntry, DeviceProbe, ErrorSlot, FlashTransport};
use crate::config::Timeouts;
use crate::error::{FlashError, Result};
use crate::process::{self, CommandOutput};
use crate::session::DeviceMode;

pub struct FastbootProbe {
    path: PathBuf,
    timeouts: Timeouts,
    last_error: ErrorSlot,
}

impl FastbootProbe {
    pub fn new(path: impl Into<PathBuf>, timeouts: &Timeouts) -> Self {
        Self {
            path: path.into(),
            timeouts: timeouts.clone(),
            last_error: ErrorSlot::default(),
        }
    }
}

impl DeviceProbe for FastbootProbe {
    fn mode(&self) -> DeviceMode {
        DeviceMode::BootloaderMode
    }

    fn list_devices(&self) -> Vec<DeviceEntry> {
        match process::run(&self.path, &["devices"], self.timeouts.device_list()) {
            Ok(output) if output.success() => {
                self.last_error.clear();
                parse_device_list(&output.stdout)
            }
            Ok(output) => {
                self.last_error.set(output.combined().trim().to_string());
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "fastboot devices failed");
                self.last_error.set(e.to_string());
                Vec::new()
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }
}

/// Runs bootloader commands against one device.
pub struct FastbootClient {
    path: PathBuf,
    serial: Option<String>,
    timeouts: Timeouts,
}

impl FastbootClient {
    pub fn new(path: impl Into<PathBuf>, serial: Option<String>, timeouts: &Timeouts) -> Self {
        Self {
            path: path.into(),
            serial,
            timeouts: timeouts.clone(),
        }
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Run `fastboot [-s serial] <args>` and require a zero exit.
    pub fn command(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut full: Vec<OsString> = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".into());
            full.push(serial.into());
        }
        full.extend(args.iter().map(OsString::from));

        let output = process::run(&self.path, &full, timeout)?;
        if !output.success() && output.combined().to_ascii_lowercase().contains("unauthorized") {
            return Err(FlashError::DeviceUnauthorized {
                id: self.serial.clone().unwrap_or_default(),
            });
        }
        output.ensure_success()
    }
}

/// Pull the value of `name` out of `getvar` output.
///
/// Fastboot prints `name: value` on stderr, surrounded by timing lines.
pub fn parse_getvar(name: &str, output: &str) -> Option<String> {
    let prefix = format!("{}:", name);
    output
        .lines()
        .map(|line| line.trim().trim_start_matches("(bootloader)").trim())
        .find_map(|line| line.strip_prefix(&prefix).map(|v| v.trim().to_string()))
}

impl FlashTransport for FastbootClient {
    fn is_attached(&self) -> bool {
        let devices = match process::run(&self.path, &["devices"], self.timeouts.device_list()) {
            Ok(output) if output.success() => parse_device_list(&output.stdout),
            _ => return false,
        };
        match &self.serial {
            Some(serial) => devices.iter().any(|d| &d.id == serial),
            None => !devices.is_empty(),
        }
    }

    fn flash_partition(&self, partition: &str, image: &Path) -> Result<()> {
        let image = image.to_string_lossy();
        info!(partition, image = %image, "fastboot flash");
        self.command(&["flash", partition, &image], self.timeouts.flash())?;
        Ok(())
    }

    fn getvar_all(&self) -> Result<String> {
        let output = self.command(&["getvar", "all"], self.timeouts.command())?;
        Ok(output.combined())
    }

    fn getvar(&self, name: &str) -> Result<String> {
        let output = self.command(&["getvar", name], self.timeouts.command())?;
        let combined = output.combined();
        parse_getvar(name, &combined).ok_or_else(|| FlashError::CommandFailed {
            command: output.command.clone(),
            code: output.code,
            output: format!("no value for {}: {}", name, combined.trim()),
        })
    }

    fn fetch_partition(&self, partition: &str, out: &Path) -> Result<()> {
        let out = out.to_string_lossy();
        info!(partition, out = %out, "fastboot fetch");
        self.command(&["fetch", partition, &out], self.timeouts.backup())?;
        Ok(())
    }
}
