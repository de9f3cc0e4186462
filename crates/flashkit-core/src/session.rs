//! Observed device session and its shared handle.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

/// Transport the device is currently reachable on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    None,
    NormalMode,
    BootloaderMode,
    MaskRomMode,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::None => write!(f, "none"),
            DeviceMode::NormalMode => write!(f, "normal"),
            DeviceMode::BootloaderMode => write!(f, "bootloader"),
            DeviceMode::MaskRomMode => write!(f, "mask-rom"),
        }
    }
}

/// A single observation of the attached device.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub mode: DeviceMode,
    /// Serial for adb/fastboot, port for mask-ROM. `None` when no device.
    pub id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl DeviceSession {
    pub fn none() -> Self {
        Self {
            mode: DeviceMode::None,
            id: None,
            observed_at: Utc::now(),
        }
    }

    pub fn new(mode: DeviceMode, id: impl Into<String>) -> Self {
        Self {
            mode,
            id: Some(id.into()),
            observed_at: Utc::now(),
        }
    }

    /// Same `(mode, id)` pair, ignoring the timestamp.
    pub fn same_device(&self, other: &DeviceSession) -> bool {
        self.mode == other.mode && self.id == other.id
    }

    pub fn is_attached(&self) -> bool {
        self.mode != DeviceMode::None
    }
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} ({})", self.mode, id),
            None => write!(f, "{}", self.mode),
        }
    }
}

/// Shared, lock-protected current session.
///
/// The monitor thread is the only writer.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<DeviceSession>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> DeviceSession {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn replace(&self, session: DeviceSession) -> DeviceSession {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, session)
    }

    /// Refresh the observation timestamp without producing a transition.
    pub(crate) fn touch(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.observed_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_device_ignores_timestamp() {
        let a = DeviceSession::new(DeviceMode::NormalMode, "X");
        let mut b = a.clone();
        b.observed_at = a.observed_at + chrono::Duration::seconds(3);
        assert!(a.same_device(&b));
        assert!(!a.same_device(&DeviceSession::new(DeviceMode::BootloaderMode, "X")));
        assert!(!a.same_device(&DeviceSession::none()));
    }

    #[test]
    fn test_handle_replace_returns_previous() {
        let handle = SessionHandle::new();
        assert!(!handle.current().is_attached());
        let prev = handle.replace(DeviceSession::new(DeviceMode::MaskRomMode, "COM3"));
        assert_eq!(prev.mode, DeviceMode::None);
        assert_eq!(handle.current().id.as_deref(), Some("COM3"));
    }
}
