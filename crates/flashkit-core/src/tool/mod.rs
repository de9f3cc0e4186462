//! External tool metadata, location and acquisition.

pub mod acquire;
pub mod locator;

use std::fmt;
use std::path::PathBuf;

pub use acquire::{DependencyAcquirer, DownloadJob, Downloader, HttpDownloader};
pub use locator::{CommandHealthCheck, HealthCheck, ToolLocator};

use crate::config::AppConfig;

const PLATFORM_TOOLS_MIRRORS: &[&str] = &[
    "https://dl.google.com/android/repository/platform-tools-latest-{system}.zip",
    "https://mirrors.cloud.tencent.com/AndroidSDK/platform-tools-latest-{system}.zip",
];

/// Host operating system, as far as tool layout is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
}

impl Os {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Os::Windows,
            "macos" => Os::MacOs,
            _ => Os::Linux,
        }
    }

    /// Token substituted for `{system}` in mirror URLs.
    pub fn system_token(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::MacOs => "darwin",
            Os::Windows => "windows",
        }
    }

    pub fn exe_suffix(&self) -> &'static str {
        match self {
            Os::Windows => ".exe",
            _ => "",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.system_token())
    }
}

/// Which transport a tool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Adb,
    Fastboot,
    MaskRom,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Adb => write!(f, "adb"),
            ToolKind::Fastboot => write!(f, "fastboot"),
            ToolKind::MaskRom => write!(f, "mask-rom"),
        }
    }
}

/// An external executable the core shells out to.
#[derive(Debug, Clone)]
pub struct Tool {
    pub kind: ToolKind,
    pub name: String,
    /// Bare executable name, without OS suffix.
    pub executable: String,
    /// Directory under the tools dir that the package is extracted into.
    pub package: String,
    /// Arguments of the health check, e.g. `version`.
    pub version_args: Vec<String>,
    /// Mirror URL templates, may contain `{system}`.
    pub mirrors: Vec<String>,
    /// Files inside the package that must be runnable, per OS.
    /// The first entry is the primary executable.
    pub runnables: Vec<(Os, Vec<String>)>,
    /// Common install directories, per OS. `~` expands to home.
    pub install_locations: Vec<(Os, Vec<String>)>,
    /// Cached winning path once located or downloaded.
    pub resolved: Option<PathBuf>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn platform_tools_runnables(exe: &str) -> Vec<(Os, Vec<String>)> {
    let (primary, sibling) = match exe {
        "adb" => ("adb", "fastboot"),
        _ => ("fastboot", "adb"),
    };
    vec![
        (
            Os::Linux,
            vec![
                format!("platform-tools/{}", primary),
                format!("platform-tools/{}", sibling),
            ],
        ),
        (
            Os::MacOs,
            vec![
                format!("platform-tools/{}", primary),
                format!("platform-tools/{}", sibling),
            ],
        ),
        (
            Os::Windows,
            vec![
                format!("platform-tools/{}.exe", primary),
                format!("platform-tools/{}.exe", sibling),
                "platform-tools/AdbWinApi.dll".to_string(),
                "platform-tools/AdbWinUsbApi.dll".to_string(),
            ],
        ),
    ]
}

fn platform_tools_locations() -> Vec<(Os, Vec<String>)> {
    vec![
        (
            Os::Linux,
            strings(&[
                "/usr/bin",
                "/usr/local/bin",
                "~/Android/Sdk/platform-tools",
                "/opt/android-sdk/platform-tools",
            ]),
        ),
        (
            Os::MacOs,
            strings(&[
                "/opt/homebrew/bin",
                "/usr/local/bin",
                "~/Library/Android/sdk/platform-tools",
            ]),
        ),
        (
            Os::Windows,
            strings(&[
                "C:\\platform-tools",
                "~\\AppData\\Local\\Android\\Sdk\\platform-tools",
                "C:\\Program Files\\platform-tools",
            ]),
        ),
    ]
}

impl Tool {
    pub fn adb() -> Self {
        Self {
            kind: ToolKind::Adb,
            name: "adb".to_string(),
            executable: "adb".to_string(),
            package: "platform-tools".to_string(),
            version_args: strings(&["version"]),
            mirrors: strings(PLATFORM_TOOLS_MIRRORS),
            runnables: platform_tools_runnables("adb"),
            install_locations: platform_tools_locations(),
            resolved: None,
        }
    }

    pub fn fastboot() -> Self {
        Self {
            kind: ToolKind::Fastboot,
            name: "fastboot".to_string(),
            executable: "fastboot".to_string(),
            package: "platform-tools".to_string(),
            version_args: strings(&["--version"]),
            mirrors: strings(PLATFORM_TOOLS_MIRRORS),
            runnables: platform_tools_runnables("fastboot"),
            install_locations: platform_tools_locations(),
            resolved: None,
        }
    }

    /// Vendor mask-ROM tool. Not redistributable, so there are no default
    /// mirrors; configure some under `[mirrors]` to enable downloads.
    pub fn mask_rom(executable: &str) -> Self {
        Self {
            kind: ToolKind::MaskRom,
            name: "mask-rom".to_string(),
            executable: executable.to_string(),
            package: executable.to_string(),
            version_args: strings(&["--help"]),
            mirrors: Vec::new(),
            runnables: vec![
                (Os::Linux, vec![executable.to_string()]),
                (Os::MacOs, vec![executable.to_string()]),
                (Os::Windows, vec![format!("{}.exe", executable)]),
            ],
            install_locations: vec![
                (Os::Linux, strings(&["/usr/local/bin", "/opt/bromtool"])),
                (Os::MacOs, strings(&["/usr/local/bin", "/opt/homebrew/bin"])),
                (Os::Windows, strings(&["C:\\bromtool"])),
            ],
            resolved: None,
        }
    }

    /// Build the catalog entry for `kind`, applying config mirror overrides.
    pub fn for_kind(kind: ToolKind, config: &AppConfig) -> Self {
        let mut tool = match kind {
            ToolKind::Adb => Tool::adb(),
            ToolKind::Fastboot => Tool::fastboot(),
            ToolKind::MaskRom => Tool::mask_rom(&config.mask_rom.executable),
        };
        if let Some(mirrors) = config.mirrors.get(&tool.name) {
            tool.mirrors = mirrors.clone();
        }
        tool
    }

    /// Configured custom path for this tool, if any.
    pub fn custom_path<'a>(&self, config: &'a AppConfig) -> Option<&'a PathBuf> {
        match self.kind {
            ToolKind::Adb => config.tools.adb.as_ref(),
            ToolKind::Fastboot => config.tools.fastboot.as_ref(),
            ToolKind::MaskRom => config.tools.mask_rom.as_ref(),
        }
    }

    pub fn runnables_for(&self, os: Os) -> &[String] {
        self.runnables
            .iter()
            .find(|(o, _)| *o == os)
            .map(|(_, files)| files.as_slice())
            .unwrap_or(&[])
    }

    pub fn install_locations_for(&self, os: Os) -> &[String] {
        self.install_locations
            .iter()
            .find(|(o, _)| *o == os)
            .map(|(_, dirs)| dirs.as_slice())
            .unwrap_or(&[])
    }

    /// Relative path of the primary executable inside the package.
    pub fn primary_runnable(&self, os: Os) -> Option<&str> {
        self.runnables_for(os).first().map(|s| s.as_str())
    }

    pub fn file_name(&self, os: Os) -> String {
        format!("{}{}", self.executable, os.exe_suffix())
    }

    /// Mirror URLs with `{system}` substituted.
    pub fn mirror_urls(&self, os: Os) -> Vec<String> {
        self.mirrors
            .iter()
            .map(|m| m.replace("{system}", os.system_token()))
            .collect()
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resolved {
            Some(path) => write!(f, "{} ({})", self.name, path.display()),
            None => write!(f, "{} (not resolved)", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_substitution() {
        let tool = Tool::adb();
        let urls = tool.mirror_urls(Os::MacOs);
        assert_eq!(
            urls[0],
            "https://dl.google.com/android/repository/platform-tools-latest-darwin.zip"
        );
        assert!(urls.iter().all(|u| !u.contains("{system}")));
    }

    #[test]
    fn test_runnables_per_os() {
        let tool = Tool::fastboot();
        assert_eq!(
            tool.primary_runnable(Os::Linux),
            Some("platform-tools/fastboot")
        );
        assert_eq!(
            tool.primary_runnable(Os::Windows),
            Some("platform-tools/fastboot.exe")
        );
        assert_eq!(tool.runnables_for(Os::Windows).len(), 4);
        assert_eq!(tool.file_name(Os::Windows), "fastboot.exe");
    }

    #[test]
    fn test_config_overrides_mirrors_and_paths() {
        let mut config = AppConfig::default();
        config
            .mirrors
            .insert("adb".into(), vec!["https://internal/{system}/pt.zip".into()]);
        config.tools.adb = Some(PathBuf::from("/custom/adb"));

        let tool = Tool::for_kind(ToolKind::Adb, &config);
        assert_eq!(tool.mirror_urls(Os::Linux), vec!["https://internal/linux/pt.zip"]);
        assert_eq!(tool.custom_path(&config), Some(&PathBuf::from("/custom/adb")));

        let fastboot = Tool::for_kind(ToolKind::Fastboot, &config);
        assert_eq!(fastboot.mirrors.len(), 2);
        assert_eq!(fastboot.custom_path(&config), None);
    }

    #[test]
    fn test_mask_rom_uses_configured_executable() {
        let mut config = AppConfig::default();
        config.mask_rom.executable = "brom-cli".into();
        let tool = Tool::for_kind(ToolKind::MaskRom, &config);
        assert_eq!(tool.executable, "brom-cli");
        assert!(tool.mirrors.is_empty());
    }
}
