//! Tool path resolution.
//!
//! Candidates, first healthy one wins:
//! 1. the user-configured custom path
//! 2. the executable found on `PATH`
//! 3. the OS-specific common install locations
//! 4. the managed tools directory populated by the acquirer

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use tracing::{debug, info, instrument};

use super::{Os, Tool};
use crate::config::AppConfig;
use crate::error::{FlashError, Result};
use crate::process;

/// Decides whether a candidate path is a working copy of a tool.
pub trait HealthCheck: Send + Sync {
    fn check(&self, tool: &Tool, path: &Path) -> bool;
}

/// Runs the tool's version command and requires a zero exit.
pub struct CommandHealthCheck {
    pub timeout: Duration,
}

impl HealthCheck for CommandHealthCheck {
    fn check(&self, tool: &Tool, path: &Path) -> bool {
        match process::run(path, &tool.version_args, self.timeout) {
            Ok(output) => output.success(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Health check failed");
                false
            }
        }
    }
}

pub struct ToolLocator {
    os: Os,
    search_path: Option<OsString>,
    home: Option<PathBuf>,
    tools_dir: PathBuf,
    checker: Box<dyn HealthCheck>,
}

impl ToolLocator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            os: Os::current(),
            search_path: std::env::var_os("PATH"),
            home: BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()),
            tools_dir: config.tools_dir(),
            checker: Box::new(CommandHealthCheck {
                timeout: config.timeouts.probe(),
            }),
        }
    }

    pub fn with_health_check(mut self, checker: impl HealthCheck + 'static) -> Self {
        self.checker = Box::new(checker);
        self
    }

    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    pub fn with_os(mut self, os: Os) -> Self {
        self.os = os;
        self
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    fn expand_home(&self, location: &str) -> Option<PathBuf> {
        match location.strip_prefix('~') {
            Some(rest) => {
                let rest = rest.trim_start_matches(['/', '\\']);
                self.home.as_ref().map(|home| home.join(rest))
            }
            None => Some(PathBuf::from(location)),
        }
    }

    fn find_on_search_path(&self, file_name: &str) -> Option<PathBuf> {
        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(file_name))
            .find(|candidate| candidate.is_file())
    }

    /// Ordered, de-duplicated candidate paths for `tool`.
    pub fn candidates(&self, tool: &Tool, custom: Option<&Path>) -> Vec<PathBuf> {
        let file_name = tool.file_name(self.os);
        let mut candidates = Vec::new();

        if let Some(custom) = custom {
            if custom.is_dir() {
                candidates.push(custom.join(&file_name));
            } else {
                candidates.push(custom.to_path_buf());
            }
        }
        if let Some(found) = self.find_on_search_path(&file_name) {
            candidates.push(found);
        }
        for location in tool.install_locations_for(self.os) {
            if let Some(dir) = self.expand_home(location) {
                candidates.push(dir.join(&file_name));
            }
        }
        if let Some(primary) = tool.primary_runnable(self.os) {
            candidates.push(self.tools_dir.join(&tool.package).join(primary));
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        candidates
    }

    /// Resolve `tool`, caching the winner in [`Tool::resolved`].
    ///
    /// Never fails hard: exhaustion is reported as [`FlashError::ToolNotFound`]
    /// so the caller can fall back to downloading.
    #[instrument(skip(self, tool), fields(tool = %tool.name))]
    pub fn resolve(&self, tool: &mut Tool, custom: Option<&Path>) -> Result<PathBuf> {
        let candidates = self.candidates(tool, custom);
        for candidate in &candidates {
            if !candidate.exists() {
                debug!(path = %candidate.display(), "Candidate missing");
                continue;
            }
            if self.checker.check(tool, candidate) {
                info!(path = %candidate.display(), "Tool resolved");
                tool.resolved = Some(candidate.clone());
                return Ok(candidate.clone());
            }
            debug!(path = %candidate.display(), "Candidate unhealthy");
        }
        Err(FlashError::ToolNotFound {
            tool: tool.name.clone(),
            tried: candidates,
        })
    }
}
