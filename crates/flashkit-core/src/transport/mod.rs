//! Transport layer module.
//!
//! Each transport wraps one external tool: `adb` for normal mode,
//! `fastboot` for bootloader mode and the vendor tool for mask-ROM.

pub mod adb;
pub mod fastboot;
pub mod maskrom;
pub mod mock;
pub mod traits;

pub use adb::AdbProbe;
pub use fastboot::{FastbootClient, FastbootProbe};
pub use maskrom::{LineBuffer, MaskRomProbe, MaskRomRunner};
pub use mock::{MockFlashTransport, MockProbe};
pub use traits::{DeviceEntry, DeviceProbe, FlashTransport};

/// Parse `adb devices` / `fastboot devices` output.
///
/// Lines are `<serial>\t<state>`. The header, daemon banners and blank
/// lines are skipped.
pub fn parse_device_list(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices"))
        .filter(|line| !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.splitn(2, ['\t', ' ']);
            let id = parts.next()?.trim();
            let description = parts.next().unwrap_or("").trim();
            if id.is_empty() {
                return None;
            }
            Some(DeviceEntry::new(id, description))
        })
        .collect()
}
