//! Mirror-fallback download of missing tools.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{Os, Tool};
use crate::archive;
use crate::config::AppConfig;
use crate::error::{FlashError, MirrorFailure, Result};
use crate::events::{FlashObserver, LogLevel, Operation};

const CHUNK_SIZE: usize = 64 * 1024;

/// Fetches one URL into a local file.
pub trait Downloader: Send + Sync {
    /// Stream `url` into `dest`, calling `progress(bytes_so_far, total)`.
    fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64>;
}

/// Blocking HTTP(S) downloader.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("flashkit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FlashError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| FlashError::Network(e.to_string()))?;
        let total = response.content_length();

        let mut file = File::create(dest)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let n = response.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])?;
            written += n as u64;
            progress(written, total);
        }
        file.flush()?;
        Ok(written)
    }
}

/// State of one tool download across mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub tool: String,
    pub mirror_index: usize,
    pub bytes: u64,
    pub percent: u8,
    /// `Some(true)` once installed, `Some(false)` once given up.
    pub outcome: Option<bool>,
}

impl DownloadJob {
    pub fn new(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            mirror_index: 0,
            bytes: 0,
            percent: 0,
            outcome: None,
        }
    }

    fn start_mirror(&mut self, index: usize) {
        self.mirror_index = index;
        self.bytes = 0;
        self.percent = 0;
    }

    /// Record progress. Returns the new percentage when it changed.
    fn update(&mut self, bytes: u64, total: Option<u64>) -> Option<u8> {
        self.bytes = bytes;
        let percent = match total {
            Some(total) if total > 0 => ((bytes.min(total) * 100) / total) as u8,
            _ => return None,
        };
        if percent != self.percent {
            self.percent = percent;
            Some(percent)
        } else {
            None
        }
    }
}

pub struct DependencyAcquirer {
    downloader: Box<dyn Downloader>,
    tools_dir: PathBuf,
    os: Os,
    observer: Arc<dyn FlashObserver>,
}

impl DependencyAcquirer {
    pub fn new(config: &AppConfig, observer: Arc<dyn FlashObserver>) -> Result<Self> {
        let downloader = HttpDownloader::new(config.timeouts.download())?;
        Ok(Self::with_downloader(downloader, config.tools_dir(), observer))
    }

    pub fn with_downloader(
        downloader: impl Downloader + 'static,
        tools_dir: PathBuf,
        observer: Arc<dyn FlashObserver>,
    ) -> Self {
        Self {
            downloader: Box::new(downloader),
            tools_dir,
            os: Os::current(),
            observer,
        }
    }

    pub fn with_os(mut self, os: Os) -> Self {
        self.os = os;
        self
    }

    /// Download, extract and install `tool`, returning its primary executable.
    ///
    /// Mirrors are tried strictly in order; the next one is only attempted
    /// after the previous one failed.
    #[instrument(skip(self, tool), fields(tool = %tool.name))]
    pub fn acquire(&self, tool: &mut Tool) -> Result<PathBuf> {
        let dir = self.tools_dir.join(&tool.package);
        fs::create_dir_all(&self.tools_dir)?;
        let archive_path = self.tools_dir.join(format!("{}.download", tool.package));

        let urls = tool.mirror_urls(self.os);
        let mut job = DownloadJob::new(&tool.name);
        let mut attempts = Vec::new();
        let mut downloaded = false;

        for (index, url) in urls.iter().enumerate() {
            job.start_mirror(index);
            self.observer.log(
                LogLevel::Info,
                &format!(
                    "Downloading {} from mirror {}/{}: {}",
                    tool.name,
                    index + 1,
                    urls.len(),
                    url
                ),
            );

            let observer = &self.observer;
            let result = self
                .downloader
                .download(url, &archive_path, &mut |bytes, total| {
                    if let Some(percent) = job.update(bytes, total) {
                        observer.progress(Operation::Download, percent);
                    }
                });

            match result {
                Ok(bytes) => {
                    info!(url = %url, bytes, "Download complete");
                    downloaded = true;
                    break;
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Mirror failed");
                    self.observer
                        .log(LogLevel::Warn, &format!("Mirror {} failed: {}", url, e));
                    attempts.push(MirrorFailure {
                        url: url.clone(),
                        message: e.to_string(),
                    });
                    let _ = fs::remove_file(&archive_path);
                }
            }
        }

        if !downloaded {
            job.outcome = Some(false);
            let err = FlashError::DownloadFailed {
                tool: tool.name.clone(),
                attempts,
            };
            self.observer.log(LogLevel::Error, &err.to_string());
            return Err(err);
        }

        let installed = self.install(tool, &archive_path, &dir);
        let _ = fs::remove_file(&archive_path);
        job.outcome = Some(installed.is_ok());

        match installed {
            Ok(primary) => {
                self.observer.progress(Operation::Download, 100);
                self.observer.log(
                    LogLevel::Info,
                    &format!("{} installed at {}", tool.name, primary.display()),
                );
                tool.resolved = Some(primary.clone());
                Ok(primary)
            }
            Err(e) => {
                self.observer
                    .log(LogLevel::Error, &format!("Installing {} failed: {}", tool.name, e));
                Err(e)
            }
        }
    }

    /// Extract into a staging directory next to `dir`, check the layout
    /// there, then replace `dir` with it. A failed install leaves `dir`
    /// untouched.
    fn install(&self, tool: &Tool, archive_path: &Path, dir: &Path) -> Result<PathBuf> {
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}-", tool.package))
            .tempdir_in(&self.tools_dir)?;
        archive::extract(archive_path, staging.path())?;

        let runnables = tool.runnables_for(self.os);
        let mut missing = Vec::new();
        for relative in runnables {
            let path = staging.path().join(relative);
            if !path.is_file() {
                missing.push(relative.clone());
                continue;
            }
            make_executable(&path)?;
        }
        if !missing.is_empty() {
            return Err(FlashError::ExtractionFailed(format!(
                "archive layout did not match, missing: {}",
                missing.join(", ")
            )));
        }

        let primary = tool.primary_runnable(self.os).ok_or_else(|| {
            FlashError::ExtractionFailed(format!(
                "{} declares no runnable files for {}",
                tool.name, self.os
            ))
        })?;

        if dir.exists() {
            debug!(dir = %dir.display(), "Replacing previous install");
            fs::remove_dir_all(dir)?;
        }
        fs::rename(staging.path(), dir)?;
        Ok(dir.join(primary))
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
