//! Flashkit-Core: device lifecycle management over adb, fastboot and
//! mask-ROM vendor tools.
//!
//! The core finds (or downloads) the external tools, watches which transport
//! the attached device is reachable on, and runs flash and backup jobs
//! against it.
//!
//! # Architecture
//!
//! - **Tool**: tool catalog, path resolution and mirror-fallback download
//! - **Transport**: probes and clients wrapping the external tools (plus mocks)
//! - **Monitor**: polling state machine that publishes the device session
//! - **Flash / Backup**: partition write and read-back jobs
//! - **Events**: observer pattern for UI decoupling
//! - **Engine**: facade owning the toolchain, session and operation guard
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flashkit_core::{
//!     AppConfig, AutoConfirm, Engine, FlashJob, PartitionSelection, TracingObserver,
//! };
//!
//! let engine = Engine::from_config(
//!     AppConfig::default(),
//!     Arc::new(TracingObserver),
//!     Arc::new(AutoConfirm(true)),
//! );
//! engine.observe_once();
//!
//! let job = FlashJob::new("firmware.zip", PartitionSelection::Named("boot".into()));
//! let report = engine.spawn_flash(job)?.join().expect("worker panicked")?;
//! println!("{}", report.summary());
//! # Ok::<(), flashkit_core::FlashError>(())
//! ```

pub mod actions;
pub mod archive;
pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod flash;
pub mod monitor;
pub mod process;
pub mod session;
pub mod tool;
pub mod transport;

// Re-exports for convenience
pub use actions::{DeviceActions, LockAction, RebootTarget};
pub use backup::{BackupReport, PartitionBackupEngine};
pub use config::{AppConfig, MaskRomConfig, RetryPolicy, Theme, Timeouts, ToolPaths};
pub use engine::{Engine, OperationGuard, Toolchain};
pub use error::{FlashError, MirrorFailure, Result};
pub use events::{
    AutoConfirm, ChannelObserver, Confirm, FlashEvent, FlashObserver, LogLevel, NullObserver,
    Operation, QueueObserver, TracingObserver,
};
pub use flash::{
    FlashJob, FlashOrchestrator, FlashReport, FlashTarget, PartitionOutcome, PartitionResult,
    PartitionSelection,
};
pub use monitor::{DeviceSessionMonitor, MonitorHandle, MonitorState};
pub use session::{DeviceMode, DeviceSession, SessionHandle};
pub use tool::{DependencyAcquirer, DownloadJob, Os, Tool, ToolKind, ToolLocator};
pub use transport::{DeviceEntry, DeviceProbe, FlashTransport, MockFlashTransport, MockProbe};
