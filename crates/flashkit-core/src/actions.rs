//! One-shot device actions: reboots and bootloader lock state.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::config::Timeouts;
use crate::error::{FlashError, Result};
use crate::events::{Confirm, FlashObserver, LogLevel};
use crate::process;
use crate::session::{DeviceMode, DeviceSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootTarget {
    System,
    Bootloader,
    Recovery,
    /// Userspace fastboot.
    Fastbootd,
}

impl RebootTarget {
    fn args(&self, mode: DeviceMode) -> &'static [&'static str] {
        match (self, mode) {
            (RebootTarget::System, _) => &["reboot"],
            (RebootTarget::Bootloader, DeviceMode::BootloaderMode) => &["reboot-bootloader"],
            (RebootTarget::Bootloader, _) => &["reboot", "bootloader"],
            (RebootTarget::Recovery, _) => &["reboot", "recovery"],
            (RebootTarget::Fastbootd, _) => &["reboot", "fastboot"],
        }
    }
}

impl fmt::Display for RebootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootTarget::System => write!(f, "system"),
            RebootTarget::Bootloader => write!(f, "bootloader"),
            RebootTarget::Recovery => write!(f, "recovery"),
            RebootTarget::Fastbootd => write!(f, "fastbootd"),
        }
    }
}

impl FromStr for RebootTarget {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(RebootTarget::System),
            "bootloader" => Ok(RebootTarget::Bootloader),
            "recovery" => Ok(RebootTarget::Recovery),
            "fastbootd" | "fastboot" => Ok(RebootTarget::Fastbootd),
            other => Err(FlashError::Config(format!("unknown reboot target: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Unlock,
    Lock,
}

impl LockAction {
    fn verb(&self) -> &'static str {
        match self {
            LockAction::Unlock => "unlock",
            LockAction::Lock => "lock",
        }
    }

    fn prompt(&self, id: &str) -> String {
        match self {
            LockAction::Unlock => format!(
                "Unlocking the bootloader of {} erases all user data. Continue?",
                id
            ),
            LockAction::Lock => format!(
                "Locking the bootloader of {} may erase user data and can brick a device \
                 running unsigned images. Continue?",
                id
            ),
        }
    }
}

pub struct DeviceActions {
    adb: PathBuf,
    fastboot: PathBuf,
    timeouts: Timeouts,
    observer: Arc<dyn FlashObserver>,
}

impl DeviceActions {
    pub fn new(
        adb: impl Into<PathBuf>,
        fastboot: impl Into<PathBuf>,
        timeouts: &Timeouts,
        observer: Arc<dyn FlashObserver>,
    ) -> Self {
        Self {
            adb: adb.into(),
            fastboot: fastboot.into(),
            timeouts: timeouts.clone(),
            observer,
        }
    }

    fn run(&self, program: &Path, id: &str, args: &[&str]) -> Result<()> {
        let mut full: Vec<OsString> = vec!["-s".into(), id.into()];
        full.extend(args.iter().map(OsString::from));
        process::run(program, &full, self.timeouts.reboot())?.ensure_success()?;
        Ok(())
    }

    /// Reboot the attached device using whichever transport it is on.
    pub fn reboot(&self, session: &DeviceSession, target: RebootTarget) -> Result<()> {
        let program = match session.mode {
            DeviceMode::NormalMode => &self.adb,
            DeviceMode::BootloaderMode => &self.fastboot,
            DeviceMode::MaskRomMode | DeviceMode::None => {
                return Err(FlashError::DeviceAbsent {
                    mode: "normal or bootloader".to_string(),
                });
            }
        };
        let id = session.id.as_deref().unwrap_or_default();

        info!(id, mode = %session.mode, target = %target, "Rebooting");
        self.observer
            .log(LogLevel::Info, &format!("Rebooting {} into {}", id, target));
        self.run(program, id, target.args(session.mode))
    }

    /// `fastboot flashing unlock|lock`, after confirmation.
    pub fn set_lock(
        &self,
        session: &DeviceSession,
        action: LockAction,
        confirm: &dyn Confirm,
    ) -> Result<()> {
        if session.mode != DeviceMode::BootloaderMode {
            return Err(FlashError::DeviceAbsent {
                mode: DeviceMode::BootloaderMode.to_string(),
            });
        }
        let id = session.id.as_deref().unwrap_or_default();

        if !confirm.confirm(&action.prompt(id)) {
            self.observer.log(
                LogLevel::Warn,
                &format!("Bootloader {} declined", action.verb()),
            );
            return Err(FlashError::Declined);
        }

        self.observer.log(
            LogLevel::Info,
            &format!("Requesting bootloader {} on {}, confirm on the device", action.verb(), id),
        );
        self.run(&self.fastboot, id, &["flashing", action.verb()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AutoConfirm, QueueObserver};

    fn actions(adb: &Path, fastboot: &Path) -> DeviceActions {
        DeviceActions::new(
            adb,
            fastboot,
            &Timeouts::default(),
            Arc::new(QueueObserver::new()),
        )
    }

    #[test]
    fn test_reboot_target_parse() {
        assert_eq!("Recovery".parse::<RebootTarget>().unwrap(), RebootTarget::Recovery);
        assert_eq!("fastboot".parse::<RebootTarget>().unwrap(), RebootTarget::Fastbootd);
        assert!("edl".parse::<RebootTarget>().is_err());
    }

    #[test]
    fn test_reboot_args_per_transport() {
        assert_eq!(
            RebootTarget::Bootloader.args(DeviceMode::NormalMode),
            &["reboot", "bootloader"]
        );
        assert_eq!(
            RebootTarget::Bootloader.args(DeviceMode::BootloaderMode),
            &["reboot-bootloader"]
        );
        assert_eq!(RebootTarget::System.args(DeviceMode::BootloaderMode), &["reboot"]);
    }

    #[test]
    fn test_reboot_without_device() {
        let a = actions(Path::new("adb"), Path::new("fastboot"));
        assert!(matches!(
            a.reboot(&DeviceSession::none(), RebootTarget::System),
            Err(FlashError::DeviceAbsent { .. })
        ));
    }

    #[test]
    fn test_lock_requires_bootloader_mode() {
        let a = actions(Path::new("adb"), Path::new("fastboot"));
        let session = DeviceSession::new(DeviceMode::NormalMode, "X");
        assert!(matches!(
            a.set_lock(&session, LockAction::Unlock, &AutoConfirm(true)),
            Err(FlashError::DeviceAbsent { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_declined_unlock_runs_nothing() {
        use crate::transport::test_support::fake_tool;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.log");
        let fastboot = fake_tool(
            dir.path(),
            "fastboot",
            &format!(r#"echo "$@" >> {}"#, log.display()),
        );
        let a = actions(Path::new("adb"), &fastboot);
        let session = DeviceSession::new(DeviceMode::BootloaderMode, "FB1");

        assert!(matches!(
            a.set_lock(&session, LockAction::Unlock, &AutoConfirm(false)),
            Err(FlashError::Declined)
        ));
        assert!(!log.exists());

        a.set_lock(&session, LockAction::Unlock, &AutoConfirm(true))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "-s FB1 flashing unlock\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_reboot_uses_session_transport() {
        use crate::transport::test_support::fake_tool;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.log");
        let script = format!(r#"echo "$0 $@" >> {}"#, log.display());
        let adb = fake_tool(dir.path(), "adb", &script);
        let fastboot = fake_tool(dir.path(), "fastboot", &script);
        let a = actions(&adb, &fastboot);

        a.reboot(
            &DeviceSession::new(DeviceMode::NormalMode, "SER1"),
            RebootTarget::Recovery,
        )
        .unwrap();
        a.reboot(
            &DeviceSession::new(DeviceMode::BootloaderMode, "FB1"),
            RebootTarget::System,
        )
        .unwrap();

        let lines: Vec<String> = std::fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("adb -s SER1 reboot recovery"));
        assert!(lines[1].ends_with("fastboot -s FB1 reboot"));
    }
}
