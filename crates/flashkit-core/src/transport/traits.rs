//! Transport abstractions.
//!
//! Defines the traits the monitor and the workers talk to, allowing
//! different implementations (CLI tool wrappers, mocks).

use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;
use crate::session::DeviceMode;

/// One line of a device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Serial for adb/fastboot, port for mask-ROM.
    pub id: String,
    pub description: String,
}

impl DeviceEntry {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// Lists the devices reachable on one transport.
///
/// Probes never fail: a missing tool or a broken command yields an empty
/// list and a recorded [`last_error`](DeviceProbe::last_error).
pub trait DeviceProbe: Send + Sync {
    fn mode(&self) -> DeviceMode;

    fn list_devices(&self) -> Vec<DeviceEntry>;

    /// Error of the most recent listing, cleared on success.
    fn last_error(&self) -> Option<String>;

    /// Extended key/value properties of device `id`.
    fn properties(&self, _id: &str) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Bootloader-side operations used by flashing and backup.
pub trait FlashTransport: Send + Sync {
    /// Whether the target device is currently enumerated.
    fn is_attached(&self) -> bool;

    fn flash_partition(&self, partition: &str, image: &Path) -> Result<()>;

    /// Combined output of `getvar all`.
    fn getvar_all(&self) -> Result<String>;

    /// Value of a single variable.
    fn getvar(&self, name: &str) -> Result<String>;

    /// Stream `partition` into `out`.
    fn fetch_partition(&self, partition: &str, out: &Path) -> Result<()>;
}

/// Last-error cell shared by the probes.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(Mutex<Option<String>>);

impl ErrorSlot {
    pub(crate) fn set(&self, message: impl Into<String>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    pub(crate) fn clear(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
