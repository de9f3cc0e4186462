//! Partition backup over the bootloader transport.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::error::{FlashError, Result};
use crate::events::{FlashObserver, LogLevel, Operation};
use crate::transport::FlashTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub partition: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Parse a partition size reported by the bootloader.
///
/// Decimal is tried first, then hexadecimal with or without `0x`.
pub fn parse_size(raw: &str) -> Result<u64> {
    let value = raw.trim();
    if let Ok(size) = value.parse::<u64>() {
        return Ok(size);
    }
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(hex, 16).map_err(|_| FlashError::InvalidSize(raw.to_string()))
}

/// Find `partition-size:<partition>:<value>` in `getvar all` output.
pub fn find_partition_size(output: &str, partition: &str) -> Option<String> {
    let pattern = format!(r"partition-size:{}:\s*(\S+)", regex::escape(partition));
    let re = Regex::new(&pattern).ok()?;
    re.captures(output).map(|caps| caps[1].to_string())
}

/// Best-effort removal of an incomplete dump.
fn discard_partial(out: &Path) {
    if out.exists() {
        match fs::remove_file(out) {
            Ok(()) => debug!(path = %out.display(), "Removed incomplete backup"),
            Err(e) => warn!(path = %out.display(), error = %e, "Incomplete backup left on disk"),
        }
    }
}

pub struct PartitionBackupEngine {
    transport: Arc<dyn FlashTransport>,
    observer: Arc<dyn FlashObserver>,
}

impl PartitionBackupEngine {
    pub fn new(transport: Arc<dyn FlashTransport>, observer: Arc<dyn FlashObserver>) -> Self {
        Self {
            transport,
            observer,
        }
    }

    /// Size of `partition` in bytes: `getvar all` first, then a targeted query.
    pub fn discover_size(&self, partition: &str) -> Result<u64> {
        match self.transport.getvar_all() {
            Ok(output) => match find_partition_size(&output, partition) {
                Some(raw) => return parse_size(&raw),
                None => debug!(partition, "getvar all does not list the partition"),
            },
            Err(e) => warn!(error = %e, "getvar all failed, querying the partition directly"),
        }

        let raw = self
            .transport
            .getvar(&format!("partition-size:{}", partition))?;
        parse_size(&raw)
    }

    #[instrument(skip(self, out), fields(out = %out.display()))]
    pub fn backup(&self, partition: &str, out: &Path) -> Result<BackupReport> {
        match self.run(partition, out) {
            Ok(report) => {
                let message = format!(
                    "Backed up {} ({} bytes) to {}",
                    report.partition,
                    report.bytes,
                    report.path.display()
                );
                info!("{}", message);
                self.observer.log(LogLevel::Info, &message);
                Ok(report)
            }
            Err(e) => {
                self.observer
                    .log(LogLevel::Error, &format!("Backup of {} failed: {}", partition, e));
                Err(e)
            }
        }
    }

    fn run(&self, partition: &str, out: &Path) -> Result<BackupReport> {
        self.observer.progress(Operation::Backup, 0);
        let expected = self.discover_size(partition)?;
        self.observer.log(
            LogLevel::Info,
            &format!("{} is {} bytes, reading...", partition, expected),
        );

        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = self.transport.fetch_partition(partition, out) {
            discard_partial(out);
            return Err(e);
        }

        let actual = fs::metadata(out)?.len();
        if actual != expected {
            discard_partial(out);
            return Err(FlashError::SizeMismatch {
                partition: partition.to_string(),
                expected,
                actual,
            });
        }

        self.observer.progress(Operation::Backup, 100);
        Ok(BackupReport {
            partition: partition.to_string(),
            path: out.to_path_buf(),
            bytes: actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::QueueObserver;
    use crate::transport::MockFlashTransport;

    fn engine(mock: &MockFlashTransport) -> PartitionBackupEngine {
        PartitionBackupEngine::new(Arc::new(mock.clone()), Arc::new(QueueObserver::new()))
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size(" 0x4000000 ").unwrap(), 0x4000000);
        assert_eq!(parse_size("0XFF").unwrap(), 255);
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert_eq!(parse_size("1f").unwrap(), 31);
        assert!(matches!(parse_size("zz"), Err(FlashError::InvalidSize(_))));
        assert!(matches!(parse_size(""), Err(FlashError::InvalidSize(_))));
    }

    #[test]
    fn test_find_partition_size_is_exact() {
        let output = "(bootloader) partition-size:boot_a: 0x4000000\n\
                      (bootloader) partition-size:boot: 0x2000\n\
                      (bootloader) partition-type:boot:raw\n";
        assert_eq!(find_partition_size(output, "boot").as_deref(), Some("0x2000"));
        assert_eq!(
            find_partition_size(output, "boot_a").as_deref(),
            Some("0x4000000")
        );
        assert_eq!(find_partition_size(output, "vbmeta"), None);
    }

    #[test]
    fn test_size_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockFlashTransport::new();
        mock.set_getvar_all(Ok("(bootloader) partition-size:userdata: 104857600\n"));
        mock.set_fetch_bytes(104857599);

        let out = dir.path().join("userdata.img");
        match engine(&mock).backup("userdata", &out) {
            Err(FlashError::SizeMismatch {
                partition,
                expected,
                actual,
            }) => {
                assert_eq!(partition, "userdata");
                assert_eq!(expected, 104857600);
                assert_eq!(actual, 104857599);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!out.exists());
    }

    #[test]
    fn test_backup_from_getvar_all() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockFlashTransport::new();
        mock.set_getvar_all(Ok("partition-size:boot: 0x2000\nall: done\n"));
        mock.set_fetch_bytes(0x2000);

        let out = dir.path().join("nested/backups/boot.img");
        let report = engine(&mock).backup("boot", &out).unwrap();
        assert_eq!(report.bytes, 0x2000);
        assert_eq!(fs::metadata(&out).unwrap().len(), 0x2000);
        assert_eq!(mock.getvar_calls(), vec!["all".to_string()]);
    }

    #[test]
    fn test_falls_back_to_targeted_getvar() {
        let mock = MockFlashTransport::new();
        mock.set_getvar_all(Err("FAILED (remote: 'unknown command')"));
        mock.set_var("partition-size:dtbo", "0x800000");
        assert_eq!(engine(&mock).discover_size("dtbo").unwrap(), 0x800000);
        assert_eq!(
            mock.getvar_calls(),
            vec!["all".to_string(), "partition-size:dtbo".to_string()]
        );

        let mock = MockFlashTransport::new();
        mock.set_getvar_all(Ok("partition-size:boot: 0x2000\n"));
        mock.set_var("partition-size:dtbo", "4096");
        assert_eq!(engine(&mock).discover_size("dtbo").unwrap(), 4096);
    }

    #[test]
    fn test_unknown_partition_fails_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockFlashTransport::new();
        mock.set_fetch_bytes(10);

        let out = dir.path().join("nope.img");
        assert!(matches!(
            engine(&mock).backup("nope", &out),
            Err(FlashError::CommandFailed { .. })
        ));
        assert!(!out.exists());
    }
}
