//! Event system for UI decoupling.
//!
//! Worker threads never touch UI state. They post typed [`FlashEvent`]s to a
//! [`FlashObserver`], and the UI side decides how to marshal them onto its
//! own thread ([`ChannelObserver`] forwards to a single consumer).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::mpsc;

use crate::session::DeviceSession;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Long-running operation classes that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Flash,
    Backup,
    Download,
    MaskRomCommand,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Flash => write!(f, "Flash"),
            Operation::Backup => write!(f, "Backup"),
            Operation::Download => write!(f, "Download"),
            Operation::MaskRomCommand => write!(f, "Mask-ROM command"),
        }
    }
}

/// Events emitted by the monitor and the worker threads.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// User-visible status line.
    Log { level: LogLevel, message: String },
    /// Progress of the running operation, 0..=100.
    Progress { operation: Operation, percent: u8 },
    /// The observed device session changed.
    Transition {
        from: DeviceSession,
        to: DeviceSession,
    },
    /// Extended properties of a device that just appeared in normal mode.
    DeviceProperties {
        id: String,
        properties: Vec<(String, String)>,
    },
    /// A worker finished.
    JobComplete {
        operation: Operation,
        success: bool,
        summary: String,
    },
}

impl FlashEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        FlashEvent::Log {
            level,
            message: message.into(),
        }
    }
}

/// Observer trait for receiving events.
///
/// Implementations must be safe to call from any thread.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);

    fn log(&self, level: LogLevel, message: &str) {
        self.on_event(&FlashEvent::log(level, message));
    }

    fn progress(&self, operation: Operation, percent: u8) {
        self.on_event(&FlashEvent::Progress {
            operation,
            percent: percent.min(100),
        });
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Progress { operation, percent } => {
                tracing::debug!(
                    operation = %operation,
                    progress = %format!("{}%", percent),
                    "Progress"
                );
            }
            FlashEvent::Transition { from, to } => {
                tracing::info!(from = %from, to = %to, "Session changed");
            }
            FlashEvent::DeviceProperties { id, properties } => {
                tracing::debug!(id = %id, count = properties.len(), "Device properties");
            }
            FlashEvent::JobComplete {
                operation,
                success,
                summary,
            } => {
                if *success {
                    tracing::info!(operation = %operation, "{}", summary);
                } else {
                    tracing::error!(operation = %operation, "{}", summary);
                }
            }
        }
    }
}

/// Forwards events over a channel to a single consumer loop.
pub struct ChannelObserver {
    sender: mpsc::Sender<FlashEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::Receiver<FlashEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent) {
        // Consumer gone means shutdown is in progress.
        let _ = self.sender.send(event.clone());
    }
}

/// Buffers events until drained. Used by tests and polling front ends.
#[derive(Default)]
pub struct QueueObserver {
    events: Mutex<VecDeque<FlashEvent>>,
}

impl QueueObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain_events(&self) -> Vec<FlashEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.drain(..).collect()
    }
}

impl FlashObserver for QueueObserver {
    fn on_event(&self, event: &FlashEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event.clone());
    }
}

/// Yes/no confirmation asked before destructive operations.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Fixed answer, for non-interactive runs (`--yes`) and tests.
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        tracing::debug!(prompt = %prompt, answer = self.0, "Auto-confirm");
        self.0
    }
}
