//! Device session monitor.
//!
//! A background loop polls the transports in priority order (normal mode,
//! bootloader, then mask-ROM when armed) and publishes the first hit as the
//! current [`DeviceSession`]. Repeated identical observations are debounced,
//! so observers only hear about actual transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{FlashEvent, FlashObserver};
use crate::session::{DeviceMode, DeviceSession, SessionHandle};
use crate::transport::DeviceProbe;

/// Upper bound on how long [`MonitorHandle::stop`] waits for the loop.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Between iterations.
    Idle,
    /// Probing the transports.
    Observing,
}

pub struct DeviceSessionMonitor {
    normal: Box<dyn DeviceProbe>,
    bootloader: Box<dyn DeviceProbe>,
    mask_rom: Box<dyn DeviceProbe>,
    session: SessionHandle,
    observer: Arc<dyn FlashObserver>,
    mask_rom_armed: Arc<AtomicBool>,
    interval: Duration,
    state: MonitorState,
}

impl DeviceSessionMonitor {
    pub fn new(
        normal: Box<dyn DeviceProbe>,
        bootloader: Box<dyn DeviceProbe>,
        mask_rom: Box<dyn DeviceProbe>,
        session: SessionHandle,
        observer: Arc<dyn FlashObserver>,
    ) -> Self {
        Self {
            normal,
            bootloader,
            mask_rom,
            session,
            observer,
            mask_rom_armed: Arc::new(AtomicBool::new(false)),
            interval: Duration::from_secs(3),
            state: MonitorState::Idle,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Share an existing arm flag, e.g. the engine's.
    pub fn with_arm_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.mask_rom_armed = flag;
        self
    }

    /// One-shot mask-ROM detection flag. Cleared by the monitor on a hit.
    pub fn arm_flag(&self) -> Arc<AtomicBool> {
        self.mask_rom_armed.clone()
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    fn observe(&self) -> DeviceSession {
        for probe in [&self.normal, &self.bootloader] {
            if let Some(device) = probe.list_devices().into_iter().next() {
                return DeviceSession::new(probe.mode(), device.id);
            }
            if let Some(err) = probe.last_error() {
                debug!(mode = %probe.mode(), error = %err, "Probe reported an error");
            }
        }

        if self.mask_rom_armed.load(Ordering::SeqCst) {
            if let Some(device) = self.mask_rom.list_devices().into_iter().next() {
                self.mask_rom_armed.store(false, Ordering::SeqCst);
                info!(port = %device.id, chip = %device.description, "Mask-ROM device detected");
                return DeviceSession::new(DeviceMode::MaskRomMode, device.id);
            }
        }

        DeviceSession::none()
    }

    /// Run one iteration. Returns the new session when it changed.
    pub fn step(&mut self) -> Option<DeviceSession> {
        self.state = MonitorState::Observing;
        let observed = self.observe();
        self.state = MonitorState::Idle;

        if observed.same_device(&self.session.current()) {
            self.session.touch();
            return None;
        }

        let previous = self.session.replace(observed.clone());
        info!(from = %previous, to = %observed, "Device session changed");
        self.observer.on_event(&FlashEvent::Transition {
            from: previous,
            to: observed.clone(),
        });

        if observed.mode == DeviceMode::NormalMode {
            if let Some(id) = &observed.id {
                let properties = self.normal.properties(id);
                if !properties.is_empty() {
                    self.observer.on_event(&FlashEvent::DeviceProperties {
                        id: id.clone(),
                        properties,
                    });
                }
            }
        }
        Some(observed)
    }

    /// Move the monitor onto its own thread.
    pub fn spawn(mut self) -> Result<MonitorHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let interval = self.interval;

        let thread = thread::Builder::new()
            .name("session-monitor".into())
            .spawn(move || {
                debug!("Session monitor started");
                loop {
                    self.step();
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Session monitor exited");
                let _ = done_tx.send(());
            })?;

        Ok(MonitorHandle {
            stop_tx: Some(stop_tx),
            done_rx,
            thread: Some(thread),
        })
    }
}

/// Owner of a running monitor thread.
pub struct MonitorHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    done_rx: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait up to [`SHUTDOWN_TIMEOUT`] for it to exit.
    ///
    /// Returns `false` when the loop was still inside a probe; the thread is
    /// then detached and exits after that probe returns.
    pub fn stop(&mut self) -> bool {
        let Some(stop_tx) = self.stop_tx.take() else {
            return true;
        };
        let _ = stop_tx.send(());

        match self.done_rx.recv_timeout(SHUTDOWN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Session monitor busy, detaching");
                self.thread.take();
                false
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::QueueObserver;
    use crate::transport::{DeviceEntry, MockProbe};
    use std::time::Instant;

    struct Rig {
        normal: MockProbe,
        bootloader: MockProbe,
        mask_rom: MockProbe,
        session: SessionHandle,
        observer: Arc<QueueObserver>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                normal: MockProbe::new(DeviceMode::NormalMode),
                bootloader: MockProbe::new(DeviceMode::BootloaderMode),
                mask_rom: MockProbe::new(DeviceMode::MaskRomMode),
                session: SessionHandle::new(),
                observer: Arc::new(QueueObserver::new()),
            }
        }

        fn monitor(&self) -> DeviceSessionMonitor {
            DeviceSessionMonitor::new(
                Box::new(self.normal.clone()),
                Box::new(self.bootloader.clone()),
                Box::new(self.mask_rom.clone()),
                self.session.clone(),
                self.observer.clone(),
            )
            .with_interval(Duration::from_millis(10))
        }

        fn transitions(&self) -> Vec<(DeviceSession, DeviceSession)> {
            self.observer
                .drain_events()
                .into_iter()
                .filter_map(|e| match e {
                    FlashEvent::Transition { from, to } => Some((from, to)),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_debounced_transitions() {
        let rig = Rig::new();
        rig.normal.push_device("ADB1");
        rig.normal.push_device("ADB1");
        rig.normal.push_empty();
        rig.normal.push_empty();
        rig.bootloader.push_empty();
        rig.bootloader.push_device("FB1");
        rig.normal.set_properties(vec![("ro.product.model".into(), "Phone".into())]);

        let mut monitor = rig.monitor();
        for _ in 0..4 {
            monitor.step();
        }

        let transitions = rig.transitions();
        assert_eq!(transitions.len(), 3);
        assert_eq!(transitions[0].1.mode, DeviceMode::NormalMode);
        assert_eq!(transitions[0].1.id.as_deref(), Some("ADB1"));
        assert_eq!(transitions[1].1.mode, DeviceMode::None);
        assert_eq!(transitions[2].0.mode, DeviceMode::None);
        assert_eq!(transitions[2].1.mode, DeviceMode::BootloaderMode);
        assert_eq!(transitions[2].1.id.as_deref(), Some("FB1"));

        assert_eq!(rig.normal.property_calls(), 1);
        assert_eq!(rig.session.current().mode, DeviceMode::BootloaderMode);
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn test_normal_mode_wins_over_bootloader() {
        let rig = Rig::new();
        rig.normal.push_device("ADB1");
        rig.bootloader.push_device("FB1");

        let mut monitor = rig.monitor();
        let session = monitor.step().unwrap();
        assert_eq!(session.mode, DeviceMode::NormalMode);
        assert_eq!(rig.bootloader.list_calls(), 0);
    }

    #[test]
    fn test_no_device_from_start_is_silent() {
        let rig = Rig::new();
        let mut monitor = rig.monitor();
        assert!(monitor.step().is_none());
        assert!(monitor.step().is_none());
        assert!(rig.transitions().is_empty());
    }

    #[test]
    fn test_mask_rom_arm_is_one_shot() {
        let rig = Rig::new();
        rig.mask_rom
            .push(vec![DeviceEntry::new("/dev/ttyACM0", "MT6765")]);
        rig.mask_rom
            .push(vec![DeviceEntry::new("/dev/ttyACM0", "MT6765")]);

        let mut monitor = rig.monitor();
        let armed = monitor.arm_flag();

        assert!(monitor.step().is_none());
        assert_eq!(rig.mask_rom.list_calls(), 0);

        armed.store(true, Ordering::SeqCst);
        let session = monitor.step().unwrap();
        assert_eq!(session.mode, DeviceMode::MaskRomMode);
        assert_eq!(session.id.as_deref(), Some("/dev/ttyACM0"));
        assert!(!armed.load(Ordering::SeqCst));

        // Disarmed: the next iteration does not query mask-ROM again.
        let session = monitor.step().unwrap();
        assert_eq!(session.mode, DeviceMode::None);
        assert_eq!(rig.mask_rom.list_calls(), 1);
    }

    #[test]
    fn test_spawned_monitor_stops_promptly() {
        let rig = Rig::new();
        rig.normal.push_device("ADB1");
        let mut handle = rig
            .monitor()
            .with_interval(Duration::from_secs(30))
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while rig.session.current().mode != DeviceMode::NormalMode && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rig.session.current().mode, DeviceMode::NormalMode);

        let start = Instant::now();
        assert!(handle.stop());
        assert!(start.elapsed() < SHUTDOWN_TIMEOUT);
        assert!(!handle.is_running());
    }

    struct SlowProbe;

    impl DeviceProbe for SlowProbe {
        fn mode(&self) -> DeviceMode {
            DeviceMode::NormalMode
        }

        fn list_devices(&self) -> Vec<DeviceEntry> {
            thread::sleep(Duration::from_secs(3));
            Vec::new()
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_stop_is_bounded_when_probe_hangs() {
        let rig = Rig::new();
        let monitor = DeviceSessionMonitor::new(
            Box::new(SlowProbe),
            Box::new(rig.bootloader.clone()),
            Box::new(rig.mask_rom.clone()),
            rig.session.clone(),
            rig.observer.clone(),
        );
        let mut handle = monitor.spawn().unwrap();
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        assert!(!handle.stop());
        let elapsed = start.elapsed();
        assert!(elapsed >= SHUTDOWN_TIMEOUT);
        assert!(elapsed < Duration::from_secs(2));
    }
}
