//! Engine facade.
//!
//! Owns the resolved toolchain, the shared device session and the single
//! operation guard, and runs flash/backup/download work on one-shot worker
//! threads. Front ends talk to the engine and listen to its observer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::actions::{DeviceActions, LockAction, RebootTarget};
use crate::backup::{BackupReport, PartitionBackupEngine};
use crate::config::AppConfig;
use crate::error::{FlashError, Result};
use crate::events::{Confirm, FlashEvent, FlashObserver, LogLevel, Operation};
use crate::flash::{FlashJob, FlashOrchestrator, FlashReport};
use crate::monitor::{DeviceSessionMonitor, MonitorHandle};
use crate::process::CommandOutput;
use crate::session::{DeviceMode, DeviceSession, SessionHandle};
use crate::tool::{DependencyAcquirer, Os, Tool, ToolKind, ToolLocator};
use crate::transport::{
    AdbProbe, DeviceEntry, DeviceProbe, FastbootClient, FastbootProbe, FlashTransport,
    MaskRomProbe, MaskRomRunner,
};

/// Configuration plus the tools resolved from it.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub config: AppConfig,
    pub adb: Tool,
    pub fastboot: Tool,
    pub mask_rom: Tool,
}

impl Toolchain {
    /// Catalog entries without any lookup.
    pub fn unresolved(config: AppConfig) -> Self {
        Self {
            adb: Tool::for_kind(ToolKind::Adb, &config),
            fastboot: Tool::for_kind(ToolKind::Fastboot, &config),
            mask_rom: Tool::for_kind(ToolKind::MaskRom, &config),
            config,
        }
    }

    /// Locate every tool. Missing tools stay unresolved.
    pub fn resolve(config: AppConfig) -> Self {
        Self::resolve_with(config.clone(), &ToolLocator::new(&config))
    }

    pub fn resolve_with(config: AppConfig, locator: &ToolLocator) -> Self {
        let mut toolchain = Self::unresolved(config);
        let mut kinds = vec![ToolKind::Adb, ToolKind::Fastboot];
        if toolchain.config.mask_rom.enabled {
            kinds.push(ToolKind::MaskRom);
        }
        for kind in kinds {
            let custom = toolchain.tool(kind).custom_path(&toolchain.config).cloned();
            let tool = toolchain.tool_mut(kind);
            if let Err(e) = locator.resolve(tool, custom.as_deref()) {
                warn!(tool = %kind, error = %e, "Tool unavailable");
            }
        }
        toolchain
    }

    pub fn tool(&self, kind: ToolKind) -> &Tool {
        match kind {
            ToolKind::Adb => &self.adb,
            ToolKind::Fastboot => &self.fastboot,
            ToolKind::MaskRom => &self.mask_rom,
        }
    }

    fn tool_mut(&mut self, kind: ToolKind) -> &mut Tool {
        match kind {
            ToolKind::Adb => &mut self.adb,
            ToolKind::Fastboot => &mut self.fastboot,
            ToolKind::MaskRom => &mut self.mask_rom,
        }
    }

    /// Resolved path, or the bare executable name so spawning reports the
    /// tool as missing.
    pub fn path(&self, kind: ToolKind) -> PathBuf {
        let tool = self.tool(kind);
        tool.resolved
            .clone()
            .unwrap_or_else(|| PathBuf::from(tool.file_name(Os::current())))
    }
}

/// Held while a flash or backup runs. Released on drop, including unwinding.
#[derive(Debug)]
pub struct OperationGuard {
    flag: Arc<AtomicBool>,
}

impl OperationGuard {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| FlashError::OperationInProgress)?;
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Engine {
    toolchain: RwLock<Arc<Toolchain>>,
    session: SessionHandle,
    observer: Arc<dyn FlashObserver>,
    confirm: Arc<dyn Confirm>,
    busy: Arc<AtomicBool>,
    mask_rom_armed: Arc<AtomicBool>,
    mask_rom_runner: Arc<MaskRomRunner>,
    monitor: Mutex<Option<MonitorHandle>>,
    flash_transport: Option<Arc<dyn FlashTransport>>,
}

impl Engine {
    pub fn new(
        toolchain: Toolchain,
        observer: Arc<dyn FlashObserver>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            toolchain: RwLock::new(Arc::new(toolchain)),
            session: SessionHandle::new(),
            mask_rom_runner: Arc::new(MaskRomRunner::new(observer.clone())),
            observer,
            confirm,
            busy: Arc::new(AtomicBool::new(false)),
            mask_rom_armed: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
            flash_transport: None,
        }
    }

    /// Resolve tools from `config` and build an engine around them.
    pub fn from_config(
        config: AppConfig,
        observer: Arc<dyn FlashObserver>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self::new(Toolchain::resolve(config), observer, confirm)
    }

    /// Use `transport` for flash and backup instead of `fastboot`.
    pub fn with_flash_transport(mut self, transport: Arc<dyn FlashTransport>) -> Self {
        self.flash_transport = Some(transport);
        self
    }

    pub fn toolchain(&self) -> Arc<Toolchain> {
        self.toolchain
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Swap in a toolchain resolved from `config`, restarting the monitor
    /// if it was running.
    pub fn reconfigure(&self, config: AppConfig) -> Result<()> {
        self.install_toolchain(Toolchain::resolve(config))
    }

    fn install_toolchain(&self, toolchain: Toolchain) -> Result<()> {
        *self.toolchain.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(toolchain);
        info!("Toolchain reconfigured");
        if self.stop_monitor() {
            self.start_monitor()?;
        }
        Ok(())
    }

    fn probes(
        &self,
        toolchain: &Toolchain,
    ) -> (Box<dyn DeviceProbe>, Box<dyn DeviceProbe>, Box<dyn DeviceProbe>) {
        let timeouts = &toolchain.config.timeouts;
        (
            Box::new(AdbProbe::new(toolchain.path(ToolKind::Adb), timeouts)),
            Box::new(FastbootProbe::new(toolchain.path(ToolKind::Fastboot), timeouts)),
            Box::new(MaskRomProbe::new(
                toolchain.path(ToolKind::MaskRom),
                &toolchain.config.mask_rom,
                timeouts,
            )),
        )
    }

    fn build_monitor(&self, toolchain: &Toolchain) -> DeviceSessionMonitor {
        let (normal, bootloader, mask_rom) = self.probes(toolchain);
        DeviceSessionMonitor::new(
            normal,
            bootloader,
            mask_rom,
            self.session.clone(),
            self.observer.clone(),
        )
        .with_interval(toolchain.config.poll_interval())
        .with_arm_flag(self.mask_rom_armed.clone())
    }

    /// Start the background session monitor. No-op when already running.
    pub fn start_monitor(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.is_some() {
            return Ok(());
        }
        let toolchain = self.toolchain();
        *monitor = Some(self.build_monitor(&toolchain).spawn()?);
        debug!("Monitor started");
        Ok(())
    }

    /// Stop the monitor. Returns whether one was running.
    pub fn stop_monitor(&self) -> bool {
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(mut handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Run a single monitor iteration on the calling thread.
    pub fn observe_once(&self) -> DeviceSession {
        let toolchain = self.toolchain();
        self.build_monitor(&toolchain).step();
        self.session.current()
    }

    /// Enable mask-ROM detection for the next monitor iterations, until the
    /// first hit.
    pub fn arm_mask_rom_detection(&self) -> Result<()> {
        if !self.toolchain().config.mask_rom.enabled {
            return Err(FlashError::Config(
                "mask-ROM support is disabled, set mask_rom.enabled = true".to_string(),
            ));
        }
        self.mask_rom_armed.store(true, Ordering::SeqCst);
        self.observer
            .log(LogLevel::Info, "Waiting for a mask-ROM device...");
        Ok(())
    }

    pub fn mask_rom_armed(&self) -> bool {
        self.mask_rom_armed.load(Ordering::SeqCst)
    }

    /// Devices currently listed by the normal and bootloader transports.
    pub fn list_devices(&self) -> Vec<(DeviceMode, DeviceEntry)> {
        let toolchain = self.toolchain();
        let (normal, bootloader, _) = self.probes(&toolchain);
        let mut devices = Vec::new();
        for probe in [normal, bootloader] {
            let mode = probe.mode();
            devices.extend(probe.list_devices().into_iter().map(|d| (mode, d)));
            if let Some(err) = probe.last_error() {
                debug!(mode = %mode, error = %err, "Probe error");
            }
        }
        devices
    }

    pub fn device_properties(&self, id: &str) -> Vec<(String, String)> {
        let toolchain = self.toolchain();
        AdbProbe::new(toolchain.path(ToolKind::Adb), &toolchain.config.timeouts).properties(id)
    }

    /// One-off mask-ROM detection, independent of the arm flag.
    pub fn detect_mask_rom(&self) -> Result<Vec<DeviceEntry>> {
        let toolchain = self.toolchain();
        let probe = MaskRomProbe::new(
            toolchain.path(ToolKind::MaskRom),
            &toolchain.config.mask_rom,
            &toolchain.config.timeouts,
        );
        let devices = probe.list_devices();
        match (devices.is_empty(), probe.last_error()) {
            (true, Some(err)) => Err(FlashError::DeviceAbsent {
                mode: format!("mask-rom ({})", err),
            }),
            _ => Ok(devices),
        }
    }

    fn actions(&self) -> DeviceActions {
        let toolchain = self.toolchain();
        DeviceActions::new(
            toolchain.path(ToolKind::Adb),
            toolchain.path(ToolKind::Fastboot),
            &toolchain.config.timeouts,
            self.observer.clone(),
        )
    }

    pub fn reboot(&self, target: RebootTarget) -> Result<()> {
        self.actions().reboot(&self.session.current(), target)
    }

    pub fn set_bootloader_lock(&self, action: LockAction) -> Result<()> {
        self.actions()
            .set_lock(&self.session.current(), action, self.confirm.as_ref())
    }

    fn bootloader_transport(&self, toolchain: &Toolchain) -> Arc<dyn FlashTransport> {
        if let Some(transport) = &self.flash_transport {
            return transport.clone();
        }
        let session = self.session.current();
        let serial = match session.mode {
            DeviceMode::BootloaderMode => session.id,
            _ => None,
        };
        Arc::new(FastbootClient::new(
            toolchain.path(ToolKind::Fastboot),
            serial,
            &toolchain.config.timeouts,
        ))
    }

    fn complete(
        observer: &dyn FlashObserver,
        operation: Operation,
        success: bool,
        summary: String,
    ) {
        observer.on_event(&FlashEvent::JobComplete {
            operation,
            success,
            summary,
        });
    }

    /// Flash `job` on a worker thread after confirmation.
    pub fn spawn_flash(&self, job: FlashJob) -> Result<JoinHandle<Result<FlashReport>>> {
        let guard = OperationGuard::acquire(&self.busy)?;

        let prompt = format!(
            "Flash {} from {}? The current contents will be overwritten.",
            job.selection,
            job.source.display()
        );
        if !self.confirm.confirm(&prompt) {
            self.observer.log(LogLevel::Warn, "Flash declined");
            return Err(FlashError::Declined);
        }

        let toolchain = self.toolchain();
        let orchestrator = FlashOrchestrator::new(
            self.bootloader_transport(&toolchain),
            toolchain.config.retry.clone(),
            self.observer.clone(),
        );
        let observer = self.observer.clone();

        let handle = thread::Builder::new()
            .name("flash-worker".into())
            .spawn(move || {
                let _guard = guard;
                let mut job = job;
                let result = orchestrator.flash(&mut job);
                let (success, summary) = match &result {
                    Ok(report) => (report.is_success(), report.summary()),
                    Err(e) => (false, format!("Flash failed: {}", e)),
                };
                Self::complete(observer.as_ref(), Operation::Flash, success, summary);
                result
            })?;
        Ok(handle)
    }

    /// Back up `partition` into `out` on a worker thread.
    pub fn spawn_backup(
        &self,
        partition: &str,
        out: &Path,
    ) -> Result<JoinHandle<Result<BackupReport>>> {
        let guard = OperationGuard::acquire(&self.busy)?;

        let toolchain = self.toolchain();
        let engine = PartitionBackupEngine::new(
            self.bootloader_transport(&toolchain),
            self.observer.clone(),
        );
        let observer = self.observer.clone();
        let partition = partition.to_string();
        let out = out.to_path_buf();

        let handle = thread::Builder::new()
            .name("backup-worker".into())
            .spawn(move || {
                let _guard = guard;
                let result = engine.backup(&partition, &out);
                let (success, summary) = match &result {
                    Ok(report) => (
                        true,
                        format!("Backed up {} ({} bytes)", report.partition, report.bytes),
                    ),
                    Err(e) => (false, format!("Backup of {} failed: {}", partition, e)),
                };
                Self::complete(observer.as_ref(), Operation::Backup, success, summary);
                result
            })?;
        Ok(handle)
    }

    /// Download `kind` on a worker thread, then re-resolve the toolchain.
    pub fn spawn_acquire(self: &Arc<Self>, kind: ToolKind) -> Result<JoinHandle<Result<PathBuf>>> {
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("download-worker".into())
            .spawn(move || {
                let config = engine.toolchain().config.clone();
                let result = DependencyAcquirer::new(&config, engine.observer.clone()).and_then(
                    |acquirer| {
                        let mut tool = Tool::for_kind(kind, &config);
                        acquirer.acquire(&mut tool)
                    },
                );
                let result = result.and_then(|path| {
                    engine.reconfigure(config)?;
                    Ok(path)
                });
                let (success, summary) = match &result {
                    Ok(path) => (true, format!("{} installed at {}", kind, path.display())),
                    Err(e) => (false, format!("Download of {} failed: {}", kind, e)),
                };
                Self::complete(engine.observer.as_ref(), Operation::Download, success, summary);
                result
            })?;
        Ok(handle)
    }

    /// Run a vendor mask-ROM command on the calling thread.
    ///
    /// Holds the operation guard; [`stop_mask_rom_command`](Self::stop_mask_rom_command)
    /// from another thread cancels it.
    pub fn run_mask_rom_command(
        &self,
        args: &[String],
        require_confirmation: bool,
    ) -> Result<CommandOutput> {
        let toolchain = self.toolchain();
        if !toolchain.config.mask_rom.enabled {
            return Err(FlashError::Config(
                "mask-ROM support is disabled, set mask_rom.enabled = true".to_string(),
            ));
        }
        let _guard = OperationGuard::acquire(&self.busy)?;

        if require_confirmation {
            let prompt = format!(
                "Run `{} {}`? This may erase data on the device.",
                toolchain.mask_rom.executable,
                args.join(" ")
            );
            if !self.confirm.confirm(&prompt) {
                self.observer.log(LogLevel::Warn, "Mask-ROM command declined");
                return Err(FlashError::Declined);
            }
        }

        let result = self.mask_rom_runner.run(
            &toolchain.path(ToolKind::MaskRom),
            args,
            toolchain.config.timeouts.flash(),
        );
        let (success, summary) = match &result {
            Ok(_) => (true, "Mask-ROM command finished".to_string()),
            Err(e) => (false, format!("Mask-ROM command failed: {}", e)),
        };
        Self::complete(self.observer.as_ref(), Operation::MaskRomCommand, success, summary);
        result
    }

    pub fn stop_mask_rom_command(&self) -> bool {
        self.mask_rom_runner.stop()
    }

    /// Stop the monitor (bounded) and any vendor command (best effort).
    pub fn shutdown(&self) {
        self.stop_monitor();
        self.mask_rom_runner.stop();
        info!("Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AutoConfirm, QueueObserver};
    use crate::flash::PartitionSelection;
    use crate::transport::MockFlashTransport;
    use std::sync::mpsc;

    /// Flash transport that blocks each flash until released.
    struct GatedTransport {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl FlashTransport for GatedTransport {
        fn is_attached(&self) -> bool {
            true
        }

        fn flash_partition(&self, _partition: &str, _image: &Path) -> Result<()> {
            let _ = self.gate.lock().unwrap().recv();
            Ok(())
        }

        fn getvar_all(&self) -> Result<String> {
            Ok(String::new())
        }

        fn getvar(&self, _name: &str) -> Result<String> {
            Ok("0".into())
        }

        fn fetch_partition(&self, _partition: &str, _out: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn engine(confirm: bool, observer: Arc<QueueObserver>) -> Engine {
        Engine::new(
            Toolchain::unresolved(AppConfig::default()),
            observer,
            Arc::new(AutoConfirm(confirm)),
        )
    }

    fn raw_job(dir: &Path) -> FlashJob {
        let image = dir.join("boot.img");
        std::fs::write(&image, b"ANDROID!").unwrap();
        FlashJob::new(image, PartitionSelection::Named("boot".into()))
    }

    #[test]
    fn test_guard_is_exclusive_and_released() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = OperationGuard::acquire(&flag).unwrap();
        assert!(matches!(
            OperationGuard::acquire(&flag),
            Err(FlashError::OperationInProgress)
        ));
        drop(guard);
        assert!(OperationGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = OperationGuard::acquire(&flag).unwrap();
        let worker = thread::spawn(move || {
            let _guard = guard;
            panic!("worker blew up");
        });
        assert!(worker.join().is_err());
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_second_operation_rejected_while_flashing() {
        let dir = tempfile::tempdir().unwrap();
        let (release, gate) = mpsc::channel();
        let observer = Arc::new(QueueObserver::new());
        let engine = engine(true, observer.clone()).with_flash_transport(Arc::new(GatedTransport {
            gate: Mutex::new(gate),
        }));

        let worker = engine.spawn_flash(raw_job(dir.path())).unwrap();
        assert!(engine.is_busy());
        assert!(matches!(
            engine.spawn_backup("boot", &dir.path().join("boot.bak")),
            Err(FlashError::OperationInProgress)
        ));
        assert!(matches!(
            engine.spawn_flash(raw_job(dir.path())),
            Err(FlashError::OperationInProgress)
        ));

        release.send(()).unwrap();
        let report = worker.join().unwrap().unwrap();
        assert!(report.is_success());
        assert!(!engine.is_busy());

        let completions: Vec<bool> = observer
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::JobComplete { success, .. } => Some(success),
                _ => None,
            })
            .collect();
        assert_eq!(completions, vec![true]);
    }

    #[test]
    fn test_declined_flash_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockFlashTransport::new();
        let engine = engine(false, Arc::new(QueueObserver::new()))
            .with_flash_transport(Arc::new(mock.clone()));

        assert!(matches!(
            engine.spawn_flash(raw_job(dir.path())),
            Err(FlashError::Declined)
        ));
        assert!(!engine.is_busy());
        assert!(mock.flash_calls().is_empty());
    }

    #[test]
    fn test_backup_worker_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockFlashTransport::new();
        mock.set_getvar_all(Ok("partition-size:boot: 0x1000\n"));
        mock.set_fetch_bytes(0x1000);
        let observer = Arc::new(QueueObserver::new());
        let engine = engine(true, observer.clone()).with_flash_transport(Arc::new(mock));

        let report = engine
            .spawn_backup("boot", &dir.path().join("boot.img"))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(report.bytes, 0x1000);
        assert!(!engine.is_busy());
        assert!(observer.drain_events().iter().any(|e| matches!(
            e,
            FlashEvent::JobComplete {
                operation: Operation::Backup,
                success: true,
                ..
            }
        )));
    }

    #[test]
    fn test_mask_rom_arm_requires_capability() {
        let observer = Arc::new(QueueObserver::new());
        let engine = engine(true, observer.clone());
        assert!(matches!(
            engine.arm_mask_rom_detection(),
            Err(FlashError::Config(_))
        ));
        assert!(!engine.mask_rom_armed());

        let mut config = AppConfig::default();
        config.mask_rom.enabled = true;
        let engine = Engine::new(
            Toolchain::unresolved(config),
            observer,
            Arc::new(AutoConfirm(true)),
        );
        engine.arm_mask_rom_detection().unwrap();
        assert!(engine.mask_rom_armed());
    }

    #[test]
    fn test_unresolved_tool_falls_back_to_bare_name() {
        let toolchain = Toolchain::unresolved(AppConfig::default());
        let path = toolchain.path(ToolKind::Adb);
        assert_eq!(path, PathBuf::from(format!("adb{}", Os::current().exe_suffix())));
    }

    #[test]
    fn test_monitor_start_stop() {
        let engine = engine(true, Arc::new(QueueObserver::new()));
        engine.start_monitor().unwrap();
        engine.start_monitor().unwrap();
        assert!(engine.stop_monitor());
        assert!(!engine.stop_monitor());
        engine.shutdown();
    }
}
