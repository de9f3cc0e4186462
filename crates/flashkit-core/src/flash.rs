//! Firmware flashing.
//!
//! A job resolves its firmware source into `(partition, image)` targets,
//! then flashes them in order. Each target gets its own retry budget and a
//! failed target does not stop the job; the report records every outcome.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use tracing::{info, instrument, warn};

use crate::archive;
use crate::config::RetryPolicy;
use crate::error::{FlashError, Result};
use crate::events::{FlashObserver, LogLevel, Operation};
use crate::transport::FlashTransport;

/// Images above this size get a cable/port advisory.
pub const LARGE_IMAGE_BYTES: u64 = 100 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &["img", "bin"];

/// Which partitions of the firmware to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSelection {
    /// Every image in the archive.
    All,
    Named(String),
    List(Vec<String>),
}

impl fmt::Display for PartitionSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionSelection::All => write!(f, "all partitions"),
            PartitionSelection::Named(name) => write!(f, "{}", name),
            PartitionSelection::List(names) => write!(f, "{}", names.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTarget {
    pub partition: String,
    pub image: PathBuf,
    /// Attempts made so far.
    pub attempts: u32,
}

impl FlashTarget {
    pub fn new(partition: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            partition: partition.into(),
            image: image.into(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlashJob {
    pub source: PathBuf,
    pub selection: PartitionSelection,
    /// Filled in once the source is resolved.
    pub targets: Vec<FlashTarget>,
    pub progress: u8,
}

impl FlashJob {
    pub fn new(source: impl Into<PathBuf>, selection: PartitionSelection) -> Self {
        Self {
            source: source.into(),
            selection,
            targets: Vec::new(),
            progress: 0,
        }
    }
}

/// Targets of a job plus the extraction directory backing them.
///
/// The directory is removed when this is dropped.
pub struct ResolvedTargets {
    pub targets: Vec<FlashTarget>,
    /// Requested partitions with no image in the firmware.
    pub missing: Vec<String>,
    workdir: Option<TempDir>,
}

impl ResolvedTargets {
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(|d| d.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    Flashed { attempts: u32 },
    Failed { attempts: u32, error: String },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionResult {
    pub partition: String,
    pub image: Option<PathBuf>,
    pub outcome: PartitionOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct FlashReport {
    pub results: Vec<PartitionResult>,
}

impl FlashReport {
    pub fn flashed(&self) -> impl Iterator<Item = &PartitionResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, PartitionOutcome::Flashed { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &PartitionResult> {
        self.results
            .iter()
            .filter(|r| !matches!(r.outcome, PartitionOutcome::Flashed { .. }))
    }

    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.failed().next().is_none()
    }

    pub fn summary(&self) -> String {
        let failed: Vec<&str> = self.failed().map(|r| r.partition.as_str()).collect();
        let mut summary = format!(
            "Flashed {}/{} partitions",
            self.flashed().count(),
            self.results.len()
        );
        if !failed.is_empty() {
            summary.push_str(&format!(" (failed: {})", failed.join(", ")));
        }
        summary
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Image files under `dir`, sorted by path.
fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if has_image_extension(&path) {
                images.push(path);
            }
        }
    }
    images.sort();
    Ok(images)
}

fn partition_name(image: &Path) -> String {
    image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn find_image<'a>(images: &'a [PathBuf], partition: &str) -> Option<&'a PathBuf> {
    images.iter().find(|path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|ext| name.eq_ignore_ascii_case(&format!("{}.{}", partition, ext)))
            })
    })
}

fn human_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    let mb = bytes as f64 / MB;
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else {
        format!("{:.0} MB", mb)
    }
}

pub struct FlashOrchestrator {
    transport: Arc<dyn FlashTransport>,
    retry: RetryPolicy,
    observer: Arc<dyn FlashObserver>,
}

impl FlashOrchestrator {
    pub fn new(
        transport: Arc<dyn FlashTransport>,
        retry: RetryPolicy,
        observer: Arc<dyn FlashObserver>,
    ) -> Self {
        Self {
            transport,
            retry,
            observer,
        }
    }

    /// Turn the job's source into flash targets.
    ///
    /// A raw image with an explicit partition is used in place; anything
    /// else is extracted into a temporary directory.
    pub fn resolve_targets(&self, job: &FlashJob) -> Result<ResolvedTargets> {
        if let PartitionSelection::Named(partition) = &job.selection {
            if has_image_extension(&job.source) && archive::sniff(&job.source)?.is_none() {
                return Ok(ResolvedTargets {
                    targets: vec![FlashTarget::new(partition, &job.source)],
                    missing: Vec::new(),
                    workdir: None,
                });
            }
        }

        let workdir = tempfile::Builder::new().prefix("flashkit-").tempdir()?;
        archive::extract(&job.source, workdir.path())?;
        let images = collect_images(workdir.path())?;

        let mut targets = Vec::new();
        let mut missing = Vec::new();
        match &job.selection {
            PartitionSelection::All => {
                if images.is_empty() {
                    return Err(FlashError::ExtractionFailed(format!(
                        "{} contains no .img or .bin files",
                        job.source.display()
                    )));
                }
                let mut seen = HashSet::new();
                for image in &images {
                    let partition = partition_name(image);
                    if !seen.insert(partition.to_ascii_lowercase()) {
                        warn!(
                            partition = %partition,
                            image = %image.display(),
                            "Duplicate image skipped"
                        );
                        self.observer.log(
                            LogLevel::Warn,
                            &format!(
                                "Skipping {}: another image for {} comes first",
                                image.display(),
                                partition
                            ),
                        );
                        continue;
                    }
                    targets.push(FlashTarget::new(partition, image));
                }
            }
            PartitionSelection::Named(partition) => match find_image(&images, partition) {
                Some(image) => targets.push(FlashTarget::new(partition, image)),
                None => {
                    return Err(FlashError::PartitionNotFound {
                        partition: partition.clone(),
                    });
                }
            },
            PartitionSelection::List(partitions) => {
                for partition in partitions {
                    match find_image(&images, partition) {
                        Some(image) => targets.push(FlashTarget::new(partition, image)),
                        None => missing.push(partition.clone()),
                    }
                }
            }
        }

        Ok(ResolvedTargets {
            targets,
            missing,
            workdir: Some(workdir),
        })
    }

    /// Flash every target of `job`, continuing past failed partitions.
    #[instrument(
        skip(self, job),
        fields(source = %job.source.display(), selection = %job.selection)
    )]
    pub fn flash(&self, job: &mut FlashJob) -> Result<FlashReport> {
        let resolved = match self.resolve_targets(job) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.observer.log(LogLevel::Error, &e.to_string());
                return Err(e);
            }
        };
        job.targets = resolved.targets.clone();
        job.progress = 0;

        let mut report = FlashReport::default();
        for partition in &resolved.missing {
            let err = FlashError::PartitionNotFound {
                partition: partition.clone(),
            };
            self.observer.log(LogLevel::Error, &err.to_string());
            report.results.push(PartitionResult {
                partition: partition.clone(),
                image: None,
                outcome: PartitionOutcome::NotFound,
            });
        }

        let total = job.targets.len();
        for (index, target) in job.targets.iter_mut().enumerate() {
            self.advise_if_large(target);
            let outcome = self.flash_target(target);
            report.results.push(PartitionResult {
                partition: target.partition.clone(),
                image: Some(target.image.clone()),
                outcome,
            });

            job.progress = (((index + 1) * 100) / total) as u8;
            self.observer.progress(Operation::Flash, job.progress);
        }

        let summary = report.summary();
        if report.is_success() {
            info!("{}", summary);
            self.observer.log(LogLevel::Info, &summary);
        } else {
            warn!("{}", summary);
            self.observer.log(LogLevel::Warn, &summary);
        }
        // Dropping `resolved` removes the extraction directory.
        drop(resolved);
        Ok(report)
    }

    fn advise_if_large(&self, target: &FlashTarget) {
        let Ok(meta) = fs::metadata(&target.image) else {
            return;
        };
        if meta.len() > LARGE_IMAGE_BYTES {
            self.observer.log(
                LogLevel::Warn,
                &format!(
                    "{} is {}. Use a rear USB port and a short, good-quality cable.",
                    target.partition,
                    human_size(meta.len())
                ),
            );
        }
    }

    fn flash_target(&self, target: &mut FlashTarget) -> PartitionOutcome {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            target.attempts = attempt;
            self.observer.log(
                LogLevel::Info,
                &format!(
                    "Flashing {} ({}/{})",
                    target.partition, attempt, max_attempts
                ),
            );

            let result = if self.transport.is_attached() {
                self.transport.flash_partition(&target.partition, &target.image)
            } else {
                Err(FlashError::DeviceAbsent {
                    mode: "bootloader".to_string(),
                })
            };

            match result {
                Ok(()) => {
                    info!(partition = %target.partition, attempt, "Partition flashed");
                    self.observer
                        .log(LogLevel::Info, &format!("{} flashed", target.partition));
                    return PartitionOutcome::Flashed { attempts: attempt };
                }
                Err(e) => {
                    warn!(
                        partition = %target.partition,
                        attempt,
                        error = %e,
                        "Flash attempt failed"
                    );
                    self.observer.log(
                        LogLevel::Warn,
                        &format!("{} attempt {} failed: {}", target.partition, attempt, e),
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }

            if attempt < max_attempts {
                thread::sleep(self.retry.delay());
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        self.observer.log(
            LogLevel::Error,
            &format!(
                "{} failed after {} attempts: {}",
                target.partition, target.attempts, error
            ),
        );
        PartitionOutcome::Failed {
            attempts: target.attempts,
            error,
        }
    }
}
