//! Mask-ROM detection and vendor command execution.
//!
//! The vendor tool prints free text, so detection matches three independent
//! patterns (port, device, chip). Only the port is mandatory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info};

use super::traits::{DeviceEntry, DeviceProbe, ErrorSlot};
use crate::config::{MaskRomConfig, Timeouts};
use crate::error::Result;
use crate::events::{FlashObserver, LogLevel, Operation};
use crate::process::{self, ChildSlot, CommandOutput};
use crate::session::DeviceMode;

static PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*port\s*[:=]\s*(\S+)").expect("valid regex"));
static DEVICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*device\s*[:=]\s*(.+?)\s*$").expect("valid regex"));
static CHIP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:chip|hw\s*chip|cpu)\s*[:=]\s*(.+?)\s*$").expect("valid regex")
});

/// How often streamed output is flushed to the log sink.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Parse `detect` output. No port means no device.
pub fn parse_detect_output(output: &str) -> Vec<DeviceEntry> {
    let Some(port) = PORT.captures(output).map(|c| c[1].to_string()) else {
        return Vec::new();
    };
    let parts: Vec<String> = [&*DEVICE, &*CHIP]
        .iter()
        .filter_map(|re| re.captures(output).map(|c| c[1].to_string()))
        .collect();
    let description = if parts.is_empty() {
        "mask-rom device".to_string()
    } else {
        parts.join(", ")
    };
    vec![DeviceEntry::new(port, description)]
}

pub struct MaskRomProbe {
    path: PathBuf,
    detect_args: Vec<String>,
    timeout: Duration,
    last_error: ErrorSlot,
}

impl MaskRomProbe {
    pub fn new(path: impl Into<PathBuf>, config: &MaskRomConfig, timeouts: &Timeouts) -> Self {
        Self {
            path: path.into(),
            detect_args: config.detect_args.clone(),
            timeout: timeouts.mask_rom_detect(),
            last_error: ErrorSlot::default(),
        }
    }
}

impl DeviceProbe for MaskRomProbe {
    fn mode(&self) -> DeviceMode {
        DeviceMode::MaskRomMode
    }

    fn list_devices(&self) -> Vec<DeviceEntry> {
        let output = match process::run(&self.path, &self.detect_args, self.timeout) {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "Mask-ROM detect failed");
                self.last_error.set(e.to_string());
                return Vec::new();
            }
        };
        let devices = parse_detect_output(&output.combined());
        if devices.is_empty() && !output.success() {
            self.last_error.set(output.combined().trim().to_string());
        } else {
            self.last_error.clear();
        }
        devices
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }
}

/// Batches streamed lines so the log sink is not flooded.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<String>,
    flush_at: Option<Instant>,
    interval: Duration,
}

impl LineBuffer {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            flush_at: None,
            interval,
        }
    }

    /// Queue `line`. Returns the batch when the flush deadline has passed.
    pub fn push(&mut self, line: String, now: Instant) -> Option<Vec<String>> {
        self.pending.push(line);
        let deadline = *self.flush_at.get_or_insert(now + self.interval);
        if now >= deadline {
            Some(self.take())
        } else {
            None
        }
    }

    /// Drain everything pending and reset the deadline.
    pub fn take(&mut self) -> Vec<String> {
        self.flush_at = None;
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Runs vendor commands one at a time, stoppable from another thread.
pub struct MaskRomRunner {
    slot: ChildSlot,
    observer: Arc<dyn FlashObserver>,
}

impl MaskRomRunner {
    pub fn new(observer: Arc<dyn FlashObserver>) -> Self {
        Self {
            slot: ChildSlot::new(),
            observer,
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_running()
    }

    /// Kill the running command. It then reports [`FlashError::Cancelled`].
    ///
    /// [`FlashError::Cancelled`]: crate::FlashError::Cancelled
    pub fn stop(&self) -> bool {
        let stopped = self.slot.stop();
        if stopped {
            self.observer.log(LogLevel::Warn, "Mask-ROM command stopped");
        }
        stopped
    }

    pub fn run(&self, program: &Path, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        info!(program = %program.display(), args = ?args, "Running mask-ROM command");
        self.observer.progress(Operation::MaskRomCommand, 0);

        let observer = &self.observer;
        let emit = |lines: Vec<String>, level: LogLevel| {
            if !lines.is_empty() {
                observer.log(level, &lines.join("\n"));
            }
        };

        let mut buffer = LineBuffer::new(FLUSH_INTERVAL);
        let result = process::run_tracked(program, args, timeout, &self.slot, |_, line| {
            if let Some(batch) = buffer.push(line.to_string(), Instant::now()) {
                emit(batch, LogLevel::Info);
            }
        });
        emit(buffer.take(), LogLevel::Info);

        let output = result?.ensure_success()?;
        self.observer.progress(Operation::MaskRomCommand, 100);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlashError;
    use crate::events::{FlashEvent, QueueObserver};

    #[test]
    fn test_detect_with_all_fields() {
        let output = "Scanning...\nPort: /dev/ttyACM0\nDevice: MT65xx Preloader\nHW chip: MT6765\n";
        assert_eq!(
            parse_detect_output(output),
            vec![DeviceEntry::new("/dev/ttyACM0", "MT65xx Preloader, MT6765")]
        );
    }

    #[test]
    fn test_detect_port_only() {
        let devices = parse_detect_output("port = COM7\n");
        assert_eq!(devices, vec![DeviceEntry::new("COM7", "mask-rom device")]);
    }

    #[test]
    fn test_detect_without_port_is_empty() {
        assert!(parse_detect_output("Device: something\nchip: X\n").is_empty());
        assert!(parse_detect_output("waiting for device... timeout\n").is_empty());
    }

    #[test]
    fn test_line_buffer_flushes_on_deadline() {
        let start = Instant::now();
        let mut buffer = LineBuffer::new(Duration::from_millis(250));

        assert_eq!(buffer.push("a".into(), start), None);
        assert_eq!(buffer.push("b".into(), start + Duration::from_millis(100)), None);
        assert_eq!(
            buffer.push("c".into(), start + Duration::from_millis(260)),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(buffer.is_empty());

        assert_eq!(buffer.push("d".into(), start + Duration::from_millis(270)), None);
        assert_eq!(buffer.take(), vec!["d".to_string()]);
    }

    #[test]
    fn test_missing_tool_probe_is_quiet() {
        let probe = MaskRomProbe::new(
            "/nonexistent/flashkit/bromtool",
            &MaskRomConfig::default(),
            &Timeouts::default(),
        );
        assert!(probe.list_devices().is_empty());
        assert!(probe.last_error().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_streams_output_to_log() {
        let observer = Arc::new(QueueObserver::new());
        let runner = MaskRomRunner::new(observer.clone());
        let args = vec!["-c".to_string(), "echo one; echo two".to_string()];

        let output = runner
            .run(Path::new("/bin/sh"), &args, Duration::from_secs(5))
            .unwrap();
        assert_eq!(output.stdout, "one\ntwo\n");

        let logged: String = observer
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Log { message, .. } => Some(message),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        assert!(logged.contains("one\ntwo"));
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_stop_reports_cancelled() {
        use std::thread;

        let runner = Arc::new(MaskRomRunner::new(Arc::new(QueueObserver::new())));
        let worker = {
            let runner = runner.clone();
            thread::spawn(move || {
                let args = vec!["-c".to_string(), "sleep 10".to_string()];
                runner.run(Path::new("/bin/sh"), &args, Duration::from_secs(30))
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !runner.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(runner.stop());
        assert!(matches!(worker.join().unwrap(), Err(FlashError::Cancelled)));
    }
}
